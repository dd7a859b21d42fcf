//! # vista-collab — Collaborative session layer
//!
//! Keeps several clients looking at the same visualization consistent:
//! who is present, who is spectating, and a request/response protocol
//! ("respondable messages") on top of a one-way event channel that every
//! collaborative feature uses for optimistic edits with server confirmation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐      WebSocket      ┌──────────────┐
//! │ SessionClient    │ ◄─────────────────► │ RelayServer  │
//! │ (actor task)     │     JSON envelopes  │ (rooms)      │
//! └────────┬─────────┘                     └──────────────┘
//!          │ owns
//!          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ Session                                              │
//! │  ConnectionMachine · PresenceDirectory · Correlator  │
//! │  RestoreRegistry · EventDispatcher · MessageChannel  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire contract (`Envelope`, `ForwardedMessage`, payloads)
//! - [`channel`] — Outbound `MessageChannel` abstraction
//! - [`dispatcher`] — Named-event pub/sub registry
//! - [`correlator`] — Nonce-correlated respondable requests
//! - [`connection`] — `Offline → Connecting → Online` state machine
//! - [`presence`] — Remote participant directory
//! - [`restore`] — Late-join reconciliation of replicated state
//! - [`session`] — Single-writer core routing inbound events
//! - [`client`] — Async WebSocket client driving a session
//! - [`relay`] — Reference relay server

pub mod protocol;
pub mod channel;
pub mod dispatcher;
pub mod correlator;
pub mod connection;
pub mod presence;
pub mod restore;
pub mod session;
pub mod client;
pub mod relay;

// Re-exports for convenience
pub use protocol::{
    event, ConnectionChanged, Envelope, ForwardedMessage, JoinRejected, JoinRequest, Nonce,
    ObjectGrab, ObjectGrabResponse, Pose, ProtocolError, SelfConnected, SelfIdentity,
    SpectatingUpdate, UserConnected, UserDisconnected, UserId,
};
pub use channel::{ChannelError, MemoryChannel, MessageChannel, WsChannel};
pub use dispatcher::{
    EventDispatcher, HandlerError, HandlerFailure, HandlerId, HandlerResult, OwnerId,
    TriggerReport,
};
pub use correlator::{
    Correlator, Resolution, RespondableHandlers, RespondableRequest, ResponseFuture,
    ResponseGuard,
};
pub use connection::{ConnectIntent, ConnectionError, ConnectionMachine, ConnectionState};
pub use presence::{PresenceChange, PresenceDirectory, RemoteUser, Rgb, UserState};
pub use restore::{
    KeyedReplica, ReplicatedState, RestoreError, RestoreRegistry, RestoreReport, SessionSnapshot,
};
pub use session::{InboundBacklog, Session, SessionConfig, SessionError, SessionStats};
pub use client::{ClientConfig, SessionClient, SessionStatus};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
