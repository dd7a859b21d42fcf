//! Presence directory: who else is in the room right now.
//!
//! ```text
//! self_connected { users }  ──┐
//! user_connected            ──┼──► PresenceDirectory ──► PresenceChange (broadcast)
//! user_disconnected         ──┤          │                     │
//! spectating_update         ──┘          │                     ▼
//!                                        │            renderers add/remove avatars
//!                                        ▼
//!                               lookup_by_id() for features
//! ```
//!
//! The directory is owned by the session and mutated only through the
//! operations below. Every mutation leaves at most one entry per id and is
//! announced on the change channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{Pose, UserConnected, UserId};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGB byte triple, `[r, g, b]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b])
    }

    /// Stable, saturated color derived from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self([to_byte(r), to_byte(g), to_byte(b)])
    }

    pub fn r(&self) -> u8 {
        self.0[0]
    }

    pub fn g(&self) -> u8 {
        self.0[1]
    }

    pub fn b(&self) -> u8 {
        self.0[2]
    }
}

impl Default for Rgb {
    fn default() -> Self {
        Self([66, 133, 245])
    }
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote users
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Online,
    Spectating,
}

/// A remote participant as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUser {
    pub id: UserId,
    pub display_name: String,
    pub color: Rgb,
    pub state: UserState,
    /// Last pose received for this user, if any.
    pub pose: Option<Pose>,
}

impl RemoteUser {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>, color: Rgb) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            color,
            state: UserState::Online,
            pose: None,
        }
    }

    pub fn is_spectating(&self) -> bool {
        self.state == UserState::Spectating
    }
}

impl From<UserConnected> for RemoteUser {
    fn from(user: UserConnected) -> Self {
        Self {
            id: user.id,
            display_name: user.name,
            color: user.color,
            state: UserState::Online,
            pose: Some(user.pose),
        }
    }
}

/// Membership change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(RemoteUser),
    Left(RemoteUser),
    SpectatingChanged { id: UserId, spectating: bool },
}

// ───────────────────────────────────────────────────────────────────
// Directory
// ───────────────────────────────────────────────────────────────────

/// Authoritative set of remote participants, keyed by user id.
pub struct PresenceDirectory {
    users: HashMap<UserId, RemoteUser>,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceDirectory {
    /// Create a directory whose change channel buffers `capacity` notifications
    /// per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            users: HashMap::new(),
            changes,
        }
    }

    /// Subscribe to membership changes made after this call.
    ///
    /// A subscriber that falls more than `capacity` changes behind receives
    /// `RecvError::Lagged`; it should then re-read [`Self::sorted_users`]
    /// instead of replaying the missed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Sender half of the change channel, for subscribing from other tasks.
    pub fn change_sender(&self) -> broadcast::Sender<PresenceChange> {
        self.changes.clone()
    }

    /// Insert a user, first evicting any stale entry with the same id.
    ///
    /// Returns the evicted entry.
    pub fn add(&mut self, user: RemoteUser) -> Option<RemoteUser> {
        let stale = self.users.remove(&user.id);
        if let Some(previous) = &stale {
            log::debug!("Replacing stale presence entry for {}", previous.id);
            self.notify(PresenceChange::Left(previous.clone()));
        }
        self.notify(PresenceChange::Joined(user.clone()));
        self.users.insert(user.id.clone(), user);
        stale
    }

    pub fn remove_by_id(&mut self, id: &str) -> Option<RemoteUser> {
        let removed = self.users.remove(id)?;
        self.notify(PresenceChange::Left(removed.clone()));
        Some(removed)
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<&RemoteUser> {
        self.users.get(id)
    }

    /// Toggle a user's spectating state.
    ///
    /// Returns `false` if the id is unknown.
    pub fn set_spectating(&mut self, id: &str, spectating: bool) -> bool {
        let Some(user) = self.users.get_mut(id) else {
            return false;
        };
        let next = if spectating {
            UserState::Spectating
        } else {
            UserState::Online
        };
        if user.state != next {
            user.state = next;
            self.notify(PresenceChange::SpectatingChanged {
                id: id.to_string(),
                spectating,
            });
        }
        true
    }

    /// Record the last known pose. Unknown ids are ignored.
    pub fn update_pose(&mut self, id: &str, pose: Pose) -> bool {
        match self.users.get_mut(id) {
            Some(user) => {
                user.pose = Some(pose);
                true
            }
            None => false,
        }
    }

    /// Remove everyone, announcing each departure.
    pub fn remove_all(&mut self) -> Vec<RemoteUser> {
        let mut removed: Vec<RemoteUser> = self.users.drain().map(|(_, user)| user).collect();
        removed.sort_by(|a, b| a.id.cmp(&b.id));
        for user in &removed {
            self.notify(PresenceChange::Left(user.clone()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn users(&self) -> impl Iterator<Item = &RemoteUser> {
        self.users.values()
    }

    /// All users sorted by id.
    pub fn sorted_users(&self) -> Vec<RemoteUser> {
        let mut users: Vec<RemoteUser> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn spectator_count(&self) -> usize {
        self.users.values().filter(|u| u.is_spectating()).count()
    }

    fn notify(&self, change: PresenceChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for PresenceDirectory {
    fn default() -> Self {
        Self::new(1024)
    }
}
