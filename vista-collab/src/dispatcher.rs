//! Typed pub/sub registry keyed by event name.
//!
//! Features register handlers for named events without knowing about each
//! other or the channel. A registration is identified by the
//! `(event, owner, handler)` triple so it can be removed precisely.
//!
//! `trigger` snapshots the handler list before invoking anything, so handlers
//! may register or unregister (themselves or others) while an event is
//! firing without skipping or double-invoking anyone in that trigger.
//!
//! Panicking handlers are isolated with `catch_unwind`, which needs the
//! unwinding panic strategy. Under `panic = "abort"` the first panicking
//! handler ends the process.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Identity of a subscriber (a feature, a view, a test).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

/// Identity of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Error returned by a handler that could not process an event.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

type Handler<A> = Arc<dyn Fn(&A) -> HandlerResult + Send + Sync>;

struct Subscription<A> {
    owner: OwnerId,
    id: HandlerId,
    handler: Handler<A>,
}

struct Registry<A> {
    next_id: u64,
    events: HashMap<String, Vec<Subscription<A>>>,
}

/// One handler that failed during a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub owner: OwnerId,
    pub handler: HandlerId,
    pub message: String,
}

/// Outcome of a [`EventDispatcher::trigger`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerReport {
    /// Handlers invoked, including those that failed.
    pub invoked: usize,
    pub failures: Vec<HandlerFailure>,
}

impl TriggerReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Event registry. Cloning yields another handle to the same registry.
pub struct EventDispatcher<A = Value> {
    registry: Arc<Mutex<Registry<A>>>,
}

impl<A> Clone for EventDispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<A> Default for EventDispatcher<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> EventDispatcher<A> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                events: HashMap::new(),
            })),
        }
    }

    /// Mint a fresh owner identity.
    pub fn owner(&self) -> OwnerId {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `handler` for `event`.
    pub fn on<F>(&self, event: &str, owner: OwnerId, handler: F) -> HandlerId
    where
        F: Fn(&A) -> HandlerResult + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry
            .events
            .entry(event.to_string())
            .or_default()
            .push(Subscription {
                owner,
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove exactly one registration. Unknown triples are a no-op.
    ///
    /// Returns whether something was removed.
    pub fn off(&self, event: &str, owner: OwnerId, handler: HandlerId) -> bool {
        let mut registry = self.lock();
        let Some(subs) = registry.events.get_mut(event) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| !(s.owner == owner && s.id == handler));
        let removed = subs.len() != before;
        if subs.is_empty() {
            registry.events.remove(event);
        }
        removed
    }

    /// Remove every registration held by `owner`, across all events.
    pub fn off_owner(&self, owner: OwnerId) -> usize {
        let mut registry = self.lock();
        let mut removed = 0;
        registry.events.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.owner != owner);
            removed += before - subs.len();
            !subs.is_empty()
        });
        removed
    }

    /// Invoke every handler registered for `event`, in registration order.
    ///
    /// Failures (errors or panics) are logged and collected; they never stop
    /// the remaining handlers.
    pub fn trigger(&self, event: &str, args: &A) -> TriggerReport {
        let snapshot: Vec<(OwnerId, HandlerId, Handler<A>)> = {
            let registry = self.lock();
            match registry.events.get(event) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.owner, s.id, s.handler.clone()))
                    .collect(),
                None => return TriggerReport::default(),
            }
        };

        let mut report = TriggerReport {
            invoked: snapshot.len(),
            failures: Vec::new(),
        };

        for (owner, id, handler) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(args)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            log::warn!("Handler {id:?} of {owner:?} failed on '{event}': {message}");
            report.failures.push(HandlerFailure {
                owner,
                handler: id,
                message,
            });
        }

        report
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().events.get(event).map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listener_count(event) > 0
    }

    fn lock(&self) -> MutexGuard<'_, Registry<A>> {
        // Handlers never run under the lock, so poisoning carries no torn state.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
