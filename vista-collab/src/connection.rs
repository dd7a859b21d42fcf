//! Connection lifecycle state machine.
//!
//! ```text
//!            host_room / join_room
//!   Offline ─────────────────────────► Connecting
//!      ▲                                  │
//!      │  fail / close            confirm │ (self_connected)
//!      │◄─────────────────────────────────┤
//!      │                                  ▼
//!      └────────────── close ────────── Online
//! ```
//!
//! The machine only tracks state. Side effects of each transition (dropping
//! the channel, clearing presence, resolving pending requests) belong to
//! the session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Offline,
    Connecting,
    Online,
}

impl ConnectionState {
    pub fn is_offline(self) -> bool {
        self == Self::Offline
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
        };
        f.write_str(name)
    }
}

/// Whether we are creating the room or entering an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectIntent {
    Host,
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Cannot start a connection while {0}")]
    Busy(ConnectionState),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// The room a connection attempt or live session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomBinding {
    pub room_id: String,
    pub intent: ConnectIntent,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    binding: Option<RoomBinding>,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Offline,
            binding: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.room_id.as_str())
    }

    pub fn intent(&self) -> Option<ConnectIntent> {
        self.binding.as_ref().map(|b| b.intent)
    }

    /// Offline → Connecting.
    pub fn begin(
        &mut self,
        intent: ConnectIntent,
        room_id: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Offline {
            return Err(ConnectionError::Busy(self.state));
        }
        self.state = ConnectionState::Connecting;
        self.binding = Some(RoomBinding {
            room_id: room_id.into(),
            intent,
        });
        Ok(())
    }

    /// Connecting → Online.
    pub fn confirm(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Online,
            });
        }
        self.state = ConnectionState::Online;
        Ok(())
    }

    /// Connecting → Offline after a failed attempt.
    pub fn fail(&mut self) -> Result<RoomBinding, ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Offline,
            });
        }
        self.state = ConnectionState::Offline;
        self.binding.take().ok_or(ConnectionError::InvalidTransition {
            from: ConnectionState::Connecting,
            to: ConnectionState::Offline,
        })
    }

    /// Any state → Offline. Returns the binding that was dropped, if any.
    pub fn close(&mut self) -> Option<RoomBinding> {
        self.state = ConnectionState::Offline;
        self.binding.take()
    }
}
