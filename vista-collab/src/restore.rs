//! Late-join reconciliation.
//!
//! Features whose shared state must converge across clients implement
//! [`ReplicatedState`] and register with a [`RestoreRegistry`]. When the
//! relay hands a late joiner the room snapshot, every registered feature
//! replaces its local state from its own section before any live event is
//! delivered.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Serialized shared state of all replicated features, keyed by feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionSnapshot(BTreeMap<String, Value>);

impl SessionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, state: Value) -> Option<Value> {
        self.0.insert(key.into(), state)
    }

    pub fn section(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestoreError {
    #[error("Invalid snapshot for '{key}': {reason}")]
    InvalidSnapshot { key: String, reason: String },
    #[error("Failed to capture '{key}': {reason}")]
    Capture { key: String, reason: String },
    #[error("A replica is already registered under '{0}'")]
    DuplicateKey(String),
}

/// Replicated, order-sensitive feature state.
///
/// `restore` must fully replace local state and be idempotent: applying the
/// same snapshot twice leaves the same state as applying it once. A `null`
/// value means the feature is absent from the snapshot and restores to empty.
pub trait ReplicatedState: Send + Sync {
    fn key(&self) -> &str;

    fn snapshot(&self) -> Result<Value, RestoreError>;

    fn restore(&self, state: &Value) -> Result<(), RestoreError>;
}

/// Per-feature outcome of [`RestoreRegistry::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<(String, RestoreError)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
pub struct RestoreRegistry {
    replicas: Vec<Arc<dyn ReplicatedState>>,
}

impl RestoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, replica: Arc<dyn ReplicatedState>) -> Result<(), RestoreError> {
        let key = replica.key();
        if self.replicas.iter().any(|r| r.key() == key) {
            return Err(RestoreError::DuplicateKey(key.to_string()));
        }
        self.replicas.push(replica);
        Ok(())
    }

    pub fn unregister(&mut self, key: &str) -> bool {
        let before = self.replicas.len();
        self.replicas.retain(|r| r.key() != key);
        self.replicas.len() != before
    }

    pub fn keys(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Capture the current state of every registered feature.
    pub fn capture(&self) -> Result<SessionSnapshot, RestoreError> {
        let mut snapshot = SessionSnapshot::new();
        for replica in &self.replicas {
            snapshot.insert(replica.key(), replica.snapshot()?);
        }
        Ok(snapshot)
    }

    /// Restore every registered feature from `snapshot`.
    ///
    /// One feature failing does not prevent the others from restoring.
    pub fn apply(&self, snapshot: &SessionSnapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        for replica in &self.replicas {
            let key = replica.key().to_string();
            let state = snapshot.section(&key).unwrap_or(&Value::Null);
            match replica.restore(state) {
                Ok(()) => report.restored.push(key),
                Err(e) => {
                    log::warn!("Restore of '{key}' failed: {e}");
                    report.failed.push((key, e));
                }
            }
        }
        report
    }
}

/// Ready-made replica holding a keyed map (e.g. open annotations by id).
pub struct KeyedReplica<T> {
    key: String,
    entries: Mutex<BTreeMap<String, T>>,
}

impl<T> KeyedReplica<T>
where
    T: Clone + Serialize + DeserializeOwned + Send,
{
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, id: impl Into<String>, value: T) -> Option<T> {
        self.lock().insert(id.into(), value)
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().get(id).cloned()
    }

    pub fn entries(&self) -> BTreeMap<String, T> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> ReplicatedState for KeyedReplica<T>
where
    T: Clone + Serialize + DeserializeOwned + Send,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn snapshot(&self) -> Result<Value, RestoreError> {
        serde_json::to_value(&*self.lock()).map_err(|e| RestoreError::Capture {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }

    fn restore(&self, state: &Value) -> Result<(), RestoreError> {
        let replacement: BTreeMap<String, T> = if state.is_null() {
            BTreeMap::new()
        } else {
            serde_json::from_value(state.clone()).map_err(|e| RestoreError::InvalidSnapshot {
                key: self.key.clone(),
                reason: e.to_string(),
            })?
        };
        // Parse fully before touching local state so a bad snapshot changes nothing.
        *self.lock() = replacement;
        Ok(())
    }
}
