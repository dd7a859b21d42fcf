//! Single-writer session core.
//!
//! [`Session`] owns the connection state machine, the presence directory,
//! the pending-request table, the replica registry and the outbound
//! channel. Every method takes `&mut self`, so one owner (the client actor,
//! or a test) serializes all mutations.
//!
//! Inbound routing by state:
//!
//! | state      | `self_connected` | `join_rejected` | other events         |
//! |------------|------------------|-----------------|----------------------|
//! | Offline    | dropped          | dropped         | dropped              |
//! | Connecting | restore, Online  | Offline         | buffered (bounded)   |
//! | Online     | ignored          | ignored         | presence + dispatch  |

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::channel::{ChannelError, MessageChannel};
use crate::connection::{
    ConnectIntent, ConnectionError, ConnectionMachine, ConnectionState, RoomBinding,
};
use crate::correlator::{
    Correlator, Resolution, RespondableHandlers, RespondableRequest, ResponseFuture,
    ResponseGuard,
};
use crate::dispatcher::EventDispatcher;
use crate::presence::{PresenceChange, PresenceDirectory, RemoteUser, Rgb};
use crate::protocol::{
    event, ConnectionChanged, Envelope, ForwardedMessage, JoinRejected, JoinRequest, Pose,
    ProtocolError, SelfConnected, SelfIdentity, SpectatingUpdate, UserConnected,
    UserDisconnected,
};
use crate::restore::{
    ReplicatedState, RestoreError, RestoreRegistry, RestoreReport, SessionSnapshot,
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name announced to the other participants.
    pub display_name: String,
    /// Preferred color; the relay assigns one when absent.
    pub color: Option<Rgb>,
    /// Event on which responses to respondable requests arrive.
    pub response_event: String,
    /// Live events buffered while waiting for `self_connected`.
    pub connecting_backlog: usize,
    /// Capacity of the presence change broadcast. Going offline emits one
    /// `Left` per user in a single step, so keep this at or above the room
    /// size limit or subscribers will lag.
    pub presence_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            color: None,
            response_event: event::RESPONSE.to_string(),
            connecting_backlog: 1024,
            presence_capacity: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error("No connection attempt in progress (state: {0})")]
    NotConnecting(ConnectionState),
    #[error("Session stopped")]
    Stopped,
    #[error("Timed out waiting for {0}")]
    Timeout(ConnectionState),
}

/// Bounded queue of live events received before the handshake completed.
pub struct InboundBacklog {
    queue: VecDeque<Envelope<Value>>,
    max_size: usize,
}

impl InboundBacklog {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    /// Returns `false` when the backlog is full and the event was dropped.
    pub fn push(&mut self, envelope: Envelope<Value>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(envelope);
        true
    }

    pub fn drain(&mut self) -> Vec<Envelope<Value>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub envelopes_sent: u64,
    pub dropped_offline: u64,
    pub dropped_backlog: u64,
    pub malformed: u64,
    pub handler_failures: u64,
}

pub struct Session {
    config: SessionConfig,
    machine: ConnectionMachine,
    channel: Option<Box<dyn MessageChannel>>,
    correlator: Correlator,
    presence: PresenceDirectory,
    dispatcher: EventDispatcher,
    replicas: RestoreRegistry,
    backlog: InboundBacklog,
    local_user: Option<SelfIdentity>,
    stats: SessionStats,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_dispatcher(config, EventDispatcher::new())
    }

    /// Build a session sharing an existing handler registry.
    pub fn with_dispatcher(config: SessionConfig, dispatcher: EventDispatcher) -> Self {
        let presence = PresenceDirectory::new(config.presence_capacity);
        let backlog = InboundBacklog::new(config.connecting_backlog);
        Self {
            config,
            machine: ConnectionMachine::new(),
            channel: None,
            correlator: Correlator::new(),
            presence,
            dispatcher,
            replicas: RestoreRegistry::new(),
            backlog,
            local_user: None,
            stats: SessionStats::default(),
        }
    }

    // ─── lifecycle ──────────────────────────────────────────────────

    /// Offline → Connecting, creating `room_id` on the relay.
    pub fn host_room(&mut self, room_id: impl Into<String>) -> Result<(), SessionError> {
        self.begin(ConnectIntent::Host, room_id.into())
    }

    /// Offline → Connecting, entering an existing room.
    pub fn join_room(&mut self, room_id: impl Into<String>) -> Result<(), SessionError> {
        self.begin(ConnectIntent::Join, room_id.into())
    }

    fn begin(&mut self, intent: ConnectIntent, room_id: String) -> Result<(), SessionError> {
        self.machine.begin(intent, room_id)?;
        log::info!(
            "Connecting to room {} ({intent:?})",
            self.machine.room_id().unwrap_or_default()
        );
        self.notify_state();
        Ok(())
    }

    /// Hand the session its transport and send the join handshake.
    pub fn attach_channel(&mut self, channel: Box<dyn MessageChannel>) -> Result<(), SessionError> {
        let state = self.machine.state();
        if state != ConnectionState::Connecting {
            return Err(SessionError::NotConnecting(state));
        }
        let host = self.machine.intent() == Some(ConnectIntent::Host);
        let snapshot = if host {
            match self.replicas.capture() {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    log::warn!("Hosting without initial snapshot: {e}");
                    None
                }
            }
        } else {
            None
        };
        let join = JoinRequest {
            room_id: self.machine.room_id().unwrap_or_default().to_string(),
            name: self.config.display_name.clone(),
            color: self.config.color,
            host,
            snapshot,
        };
        let envelope = Envelope::from_payload(event::JOIN, &join)?;
        if let Err(e) = channel.send(&envelope) {
            self.fail_attempt("join handshake could not be sent");
            return Err(e.into());
        }
        self.stats.envelopes_sent += 1;
        self.channel = Some(channel);
        Ok(())
    }

    /// The transport could not be opened.
    pub fn connect_failed(&mut self, reason: &str) {
        if self.machine.state() == ConnectionState::Connecting {
            log::warn!("Connection attempt failed: {reason}");
            self.fail_attempt(reason);
        }
    }

    /// The transport closed underneath us.
    pub fn channel_closed(&mut self) {
        if !self.machine.state().is_offline() {
            self.enter_offline("channel closed");
        }
    }

    /// Leave the room. Returns whether there was anything to leave.
    pub fn disconnect(&mut self) -> bool {
        if self.machine.state().is_offline() {
            return false;
        }
        self.enter_offline("disconnect requested");
        true
    }

    /// Connecting → Offline for an attempt that did not make it online.
    fn fail_attempt(&mut self, reason: &str) {
        let binding = match self.machine.fail() {
            Ok(binding) => Some(binding),
            Err(e) => {
                log::warn!("Abandoning attempt outside Connecting: {e}");
                self.machine.close()
            }
        };
        self.teardown(reason, binding);
    }

    fn enter_offline(&mut self, reason: &str) {
        let binding = self.machine.close();
        self.teardown(reason, binding);
    }

    fn teardown(&mut self, reason: &str, binding: Option<RoomBinding>) {
        self.channel = None;
        self.backlog.clear();
        let left = self.presence.remove_all();
        let resolved = self.correlator.go_offline();
        self.local_user = None;
        log::info!(
            "Offline ({reason}); room {:?}, {} users cleared, {resolved} requests resolved offline",
            binding.map(|b| b.room_id),
            left.len()
        );
        self.notify_state();
    }

    fn notify_state(&mut self) {
        let change = ConnectionChanged {
            state: self.machine.state(),
            room_id: self.machine.room_id().map(str::to_string),
        };
        match serde_json::to_value(&change) {
            Ok(payload) => self.dispatch(event::CONNECTION_CHANGED, &payload),
            Err(e) => log::warn!("Could not encode connection change: {e}"),
        }
    }

    // ─── inbound ────────────────────────────────────────────────────

    /// Decode and route one text frame.
    pub fn handle_frame(&mut self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.handle_inbound(envelope),
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("Dropping malformed frame: {e}");
            }
        }
    }

    pub fn handle_inbound(&mut self, envelope: Envelope<Value>) {
        self.stats.frames_received += 1;
        match self.machine.state() {
            ConnectionState::Offline => {
                self.stats.dropped_offline += 1;
                log::debug!("Dropping '{}' received while offline", envelope.event);
            }
            ConnectionState::Connecting => match envelope.event.as_str() {
                event::SELF_CONNECTED => self.complete_handshake(envelope),
                event::JOIN_REJECTED => {
                    let reason = envelope
                        .payload_as::<JoinRejected>()
                        .map(|r| r.reason)
                        .unwrap_or_else(|_| "unspecified".to_string());
                    log::warn!("Join rejected: {reason}");
                    self.fail_attempt("join rejected");
                }
                _ => {
                    if !self.backlog.push(envelope) {
                        self.stats.dropped_backlog += 1;
                        log::warn!("Connecting backlog full; dropping event");
                    }
                }
            },
            ConnectionState::Online => match envelope.event.as_str() {
                event::SELF_CONNECTED | event::JOIN_REJECTED => {
                    log::warn!("Ignoring '{}' while online", envelope.event);
                }
                _ => self.route_live(envelope),
            },
        }
    }

    fn complete_handshake(&mut self, envelope: Envelope<Value>) {
        let welcome: SelfConnected = match envelope.payload_as() {
            Ok(welcome) => welcome,
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("Malformed handshake: {e}");
                self.fail_attempt("malformed handshake");
                return;
            }
        };

        // Replicated features converge before anything else is observed.
        if let Some(snapshot) = &welcome.snapshot {
            let report = self.replicas.apply(snapshot);
            if !report.is_complete() {
                log::warn!(
                    "Late-join restore incomplete: {} of {} features failed",
                    report.failed.len(),
                    report.failed.len() + report.restored.len()
                );
            }
        }

        if let Err(e) = self.machine.confirm() {
            log::warn!("Handshake in unexpected state: {e}");
            return;
        }
        let own_id = welcome.self_user.id.clone();
        log::info!(
            "Online in room {} as {} ({})",
            self.machine.room_id().unwrap_or_default(),
            welcome.self_user.name,
            own_id
        );
        self.local_user = Some(welcome.self_user.clone());

        for user in welcome.users.iter().filter(|u| u.id != own_id) {
            self.presence.add(RemoteUser::from(user.clone()));
            match serde_json::to_value(user) {
                Ok(payload) => self.dispatch(event::USER_CONNECTED, &payload),
                Err(e) => log::warn!("Could not encode seeded user {}: {e}", user.id),
            }
        }

        self.notify_state();
        self.dispatch(event::SELF_CONNECTED, &envelope.payload);

        let buffered = self.backlog.drain();
        if !buffered.is_empty() {
            log::debug!("Replaying {} buffered events", buffered.len());
        }
        for envelope in buffered {
            self.route_live(envelope);
        }
    }

    fn route_live(&mut self, envelope: Envelope<Value>) {
        if envelope.event == self.config.response_event {
            match envelope.nonce {
                Some(nonce) => {
                    if self.correlator.resolve(nonce, &envelope.payload) == Resolution::Rejected {
                        self.stats.malformed += 1;
                    }
                }
                None => {
                    self.stats.malformed += 1;
                    log::warn!("Dropping response without nonce");
                }
            }
            return;
        }

        let applied = match envelope.event.as_str() {
            event::USER_CONNECTED => self.apply_user_connected(&envelope),
            event::USER_DISCONNECTED => self.apply_user_disconnected(&envelope),
            event::SPECTATING_UPDATE => self.apply_spectating(&envelope),
            event::USER_POSITIONS => self.apply_pose(&envelope),
            _ => Ok(()),
        };
        match applied {
            Ok(()) => self.dispatch(&envelope.event, &envelope.payload),
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("Dropping malformed '{}': {e}", envelope.event);
            }
        }
    }

    fn apply_user_connected(&mut self, envelope: &Envelope<Value>) -> Result<(), ProtocolError> {
        let user: UserConnected = envelope.payload_as()?;
        log::info!("User {} ({}) connected", user.name, user.id);
        if let Some(stale) = self.presence.add(RemoteUser::from(user)) {
            log::debug!("Replaced stale presence entry for {}", stale.id);
        }
        Ok(())
    }

    fn apply_user_disconnected(&mut self, envelope: &Envelope<Value>) -> Result<(), ProtocolError> {
        let UserDisconnected { id } = envelope.payload_as()?;
        match self.presence.remove_by_id(&id) {
            Some(user) => log::info!("User {} ({id}) disconnected", user.display_name),
            None => log::debug!("Disconnect for unknown user {id}"),
        }
        Ok(())
    }

    fn apply_spectating(&mut self, envelope: &Envelope<Value>) -> Result<(), ProtocolError> {
        let forwarded: ForwardedMessage<Envelope<SpectatingUpdate>> = envelope.payload_as()?;
        let spectating = forwarded.original_message.payload.is_spectating;
        let known = self.presence.lookup_by_id(&forwarded.user_id).is_some();
        if known {
            self.presence.set_spectating(&forwarded.user_id, spectating);
        } else {
            log::debug!("Spectating update for unknown user {}", forwarded.user_id);
        }
        Ok(())
    }

    fn apply_pose(&mut self, envelope: &Envelope<Value>) -> Result<(), ProtocolError> {
        let forwarded: ForwardedMessage<Envelope<Pose>> = envelope.payload_as()?;
        if !self
            .presence
            .update_pose(&forwarded.user_id, forwarded.original_message.payload)
        {
            log::debug!("Pose update for unknown user {}", forwarded.user_id);
        }
        Ok(())
    }

    fn dispatch(&mut self, event: &str, payload: &Value) {
        let report = self.dispatcher.trigger(event, payload);
        self.stats.handler_failures += report.failures.len() as u64;
    }

    // ─── outbound ───────────────────────────────────────────────────

    /// Send a respondable request; see [`crate::correlator`].
    pub fn send_respondable(&mut self, mut request: RespondableRequest) -> ResponseFuture {
        let future = request.subscribe();
        self.submit_respondable(request);
        future
    }

    /// Like [`Session::send_respondable`] for a request whose future the
    /// caller already holds.
    pub fn submit_respondable(&mut self, request: RespondableRequest) {
        if !self.machine.state().is_online() {
            log::debug!("'{}' resolved offline without sending", request.event());
            request.resolve_offline();
            return;
        }
        let (nonce, envelope) = self.correlator.register(request);
        match self.transmit(&envelope) {
            Ok(()) => {}
            Err(e) => {
                log::warn!("Could not send '{}' (nonce {nonce}): {e}", envelope.event);
                self.correlator.abandon(nonce);
            }
        }
    }

    pub fn send_respondable_message<Req, R>(
        &mut self,
        event: &str,
        request: &Req,
        guard: ResponseGuard<R>,
        handlers: RespondableHandlers<R>,
    ) -> Result<ResponseFuture, SessionError>
    where
        Req: Serialize + ?Sized,
        R: 'static,
    {
        let request = RespondableRequest::new(event, request, guard, handlers)?;
        Ok(self.send_respondable(request))
    }

    /// Fire-and-forget send. Returns `Ok(false)` when not online.
    pub fn send<P: Serialize + ?Sized>(
        &mut self,
        event: &str,
        payload: &P,
    ) -> Result<bool, SessionError> {
        if !self.machine.state().is_online() {
            return Ok(false);
        }
        let envelope = Envelope::from_payload(event, payload)?;
        self.transmit(&envelope)?;
        Ok(true)
    }

    /// Send the captured state of every replica so the relay can hand it to
    /// late joiners.
    pub fn publish_snapshot(&mut self) -> Result<bool, SessionError> {
        let snapshot = self.replicas.capture()?;
        self.send(event::SNAPSHOT_UPDATE, &snapshot)
    }

    fn transmit(&mut self, envelope: &Envelope<Value>) -> Result<(), ChannelError> {
        let channel = self.channel.as_ref().ok_or(ChannelError::Closed)?;
        channel.send(envelope)?;
        self.stats.envelopes_sent += 1;
        Ok(())
    }

    // ─── replicas ───────────────────────────────────────────────────

    pub fn register_replica(&mut self, replica: Arc<dyn ReplicatedState>) -> Result<(), SessionError> {
        self.replicas.register(replica)?;
        Ok(())
    }

    pub fn unregister_replica(&mut self, key: &str) -> bool {
        self.replicas.unregister(key)
    }

    /// Restore every replica from `snapshot` outside the handshake.
    pub fn restore(&mut self, snapshot: &SessionSnapshot) -> RestoreReport {
        self.replicas.apply(snapshot)
    }

    // ─── accessors ──────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_online(&self) -> bool {
        self.machine.state().is_online()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.machine.room_id()
    }

    pub fn local_user(&self) -> Option<&SelfIdentity> {
        self.local_user.as_ref()
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    pub fn dispatcher(&self) -> EventDispatcher {
        self.dispatcher.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn pending_nonces(&self) -> Vec<crate::protocol::Nonce> {
        self.correlator.pending_nonces()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::protocol::{ObjectGrab, ObjectGrabResponse};
    use crate::restore::KeyedReplica;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn session() -> Session {
        Session::new(SessionConfig {
            display_name: "Alice".into(),
            ..SessionConfig::default()
        })
    }

    fn welcome(users: Value) -> Envelope<Value> {
        Envelope::new(
            "self_connected",
            json!({
                "self": {"id": "me", "name": "Alice", "color": [1, 2, 3]},
                "users": users,
            }),
        )
    }

    fn user(id: &str, name: &str) -> Value {
        json!({"id": id, "name": name, "color": [9, 9, 9]})
    }

    fn online_session() -> (Session, mpsc::UnboundedReceiver<Envelope<Value>>) {
        let mut session = session();
        let (channel, mut rx) = MemoryChannel::pair();
        session.join_room("room-1").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();
        let join = rx.try_recv().unwrap();
        assert_eq!(join.event, "join");
        session.handle_inbound(welcome(json!([user("b", "Bob")])));
        assert!(session.is_online());
        (session, rx)
    }

    fn grab(counter: &Arc<AtomicUsize>) -> RespondableRequest {
        let on_response = counter.clone();
        let on_offline = counter.clone();
        RespondableRequest::new(
            "object_grab",
            &ObjectGrab {
                object_id: "n1".into(),
            },
            ResponseGuard::<ObjectGrabResponse>::shape(),
            RespondableHandlers::new(
                move |r: ObjectGrabResponse| {
                    on_response.fetch_add(1, Ordering::SeqCst);
                    r.is_success
                },
                move || {
                    on_offline.fetch_add(100, Ordering::SeqCst);
                    false
                },
            ),
        )
        .unwrap()
    }

    #[test]
    fn test_host_sends_snapshot_in_handshake() {
        let mut session = session();
        let notes: Arc<KeyedReplica<String>> = Arc::new(KeyedReplica::new("notes"));
        notes.insert("n1", "hello".into());
        session.register_replica(notes).unwrap();

        let (channel, mut rx) = MemoryChannel::pair();
        session.host_room("r1").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();

        let join: JoinRequest = rx.try_recv().unwrap().payload_as().unwrap();
        assert!(join.host);
        assert_eq!(join.room_id, "r1");
        assert_eq!(join.name, "Alice");
        let snapshot = join.snapshot.unwrap();
        assert_eq!(snapshot.section("notes"), Some(&json!({"n1": "hello"})));
    }

    #[test]
    fn test_busy_host_has_no_side_effects() {
        let (mut session, _rx) = online_session();
        assert!(matches!(
            session.host_room("other"),
            Err(SessionError::Connection(ConnectionError::Busy(
                ConnectionState::Online
            )))
        ));
        assert_eq!(session.room_id(), Some("room-1"));
        assert_eq!(session.presence().len(), 1);
    }

    #[test]
    fn test_presence_capacity_covers_room_limit() {
        let config = SessionConfig::default();
        let relay = crate::relay::RelayConfig::default();
        assert!(config.presence_capacity >= relay.max_users_per_room);
    }

    #[test]
    fn test_attach_requires_connecting() {
        let mut session = session();
        let (channel, _rx) = MemoryChannel::pair();
        assert!(matches!(
            session.attach_channel(Box::new(channel)),
            Err(SessionError::NotConnecting(ConnectionState::Offline))
        ));
    }

    #[test]
    fn test_self_connected_seeds_presence_and_simulates_connects() {
        let mut session = session();
        let dispatcher = session.dispatcher();
        let owner = dispatcher.owner();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["user_connected", "connection_changed", "self_connected"] {
            let seen = seen.clone();
            dispatcher.on(name, owner, move |_| {
                seen.lock().unwrap().push(name);
                Ok(())
            });
        }

        let (channel, _rx) = MemoryChannel::pair();
        session.join_room("room-1").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();
        session.handle_inbound(welcome(json!([
            user("b", "Bob"),
            user("me", "Alice"),
            user("c", "Carol")
        ])));

        assert_eq!(session.local_user().unwrap().id, "me");
        assert_eq!(session.presence().len(), 2);
        assert!(session.presence().lookup_by_id("me").is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "connection_changed",
                "user_connected",
                "user_connected",
                "connection_changed",
                "self_connected"
            ]
        );
    }

    #[test]
    fn test_restore_runs_before_online() {
        let mut session = session();
        let notes: Arc<KeyedReplica<String>> = Arc::new(KeyedReplica::new("notes"));
        notes.insert("stale", "x".into());
        session.register_replica(notes.clone()).unwrap();

        let dispatcher = session.dispatcher();
        let owner = dispatcher.owner();
        let seen_at_online = Arc::new(Mutex::new(None));
        let probe = notes.clone();
        let record = seen_at_online.clone();
        dispatcher.on("connection_changed", owner, move |payload| {
            if payload["state"] == "online" {
                *record.lock().unwrap() = Some(probe.entries());
            }
            Ok(())
        });

        let (channel, _rx) = MemoryChannel::pair();
        session.join_room("room-1").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();

        let mut envelope = welcome(json!([]));
        envelope.payload["snapshot"] = json!({"notes": {"a": "restored"}});
        session.handle_inbound(envelope);

        let entries = seen_at_online.lock().unwrap().clone().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("a").map(String::as_str), Some("restored"));
    }

    #[test]
    fn test_backlog_replayed_after_handshake() {
        let mut session = session();
        let (channel, _rx) = MemoryChannel::pair();
        session.join_room("room-1").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();

        session.handle_inbound(Envelope::new("user_connected", user("d", "Dan")));
        session.handle_inbound(Envelope::new("chat", json!({"text": "early"})));
        assert_eq!(session.backlog_len(), 2);
        assert!(session.presence().is_empty());

        let chats = Arc::new(AtomicUsize::new(0));
        let dispatcher = session.dispatcher();
        let counter = chats.clone();
        dispatcher.on("chat", dispatcher.owner(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        session.handle_inbound(welcome(json!([])));
        assert_eq!(session.backlog_len(), 0);
        assert!(session.presence().lookup_by_id("d").is_some());
        assert_eq!(chats.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut session = Session::new(SessionConfig {
            connecting_backlog: 1,
            ..SessionConfig::default()
        });
        session.join_room("r").unwrap();
        session.handle_inbound(Envelope::new("chat", json!(1)));
        session.handle_inbound(Envelope::new("chat", json!(2)));
        assert_eq!(session.backlog_len(), 1);
        assert_eq!(session.stats().dropped_backlog, 1);
    }

    #[test]
    fn test_join_rejected_goes_offline() {
        let mut session = session();
        let (channel, _rx) = MemoryChannel::pair();
        session.join_room("missing").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();
        session.handle_inbound(Envelope::new("join_rejected", json!({"reason": "no such room"})));

        assert_eq!(session.state(), ConnectionState::Offline);
        assert!(session.room_id().is_none());
    }

    #[test]
    fn test_connect_failed_only_aborts_attempts() {
        let (mut session, _rx) = online_session();
        session.connect_failed("late dial error");
        assert!(session.is_online());
        assert_eq!(session.room_id(), Some("room-1"));

        let mut session = self::session();
        let states = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = session.dispatcher();
        let record = states.clone();
        dispatcher.on("connection_changed", dispatcher.owner(), move |payload| {
            record.lock().unwrap().push(payload["state"].clone());
            Ok(())
        });
        session.host_room("r").unwrap();
        session.connect_failed("refused");

        assert_eq!(session.state(), ConnectionState::Offline);
        assert!(session.room_id().is_none());
        assert_eq!(*states.lock().unwrap(), vec![json!("connecting"), json!("offline")]);

        // The machine accepts a new attempt after a failed one.
        session.join_room("r").unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_malformed_handshake_goes_offline() {
        let mut session = session();
        session.join_room("r").unwrap();
        session.handle_inbound(Envelope::new("self_connected", json!({"users": 3})));
        assert_eq!(session.state(), ConnectionState::Offline);
        assert_eq!(session.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_offline_short_circuit() {
        let mut session = session();
        let counter = Arc::new(AtomicUsize::new(0));
        let future = session.send_respondable(grab(&counter));

        // on_offline ran synchronously.
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(session.pending_requests(), 0);
        assert!(!future.await);
    }

    #[tokio::test]
    async fn test_response_routed_by_nonce() {
        let (mut session, mut rx) = online_session();
        let counter = Arc::new(AtomicUsize::new(0));
        let future = session.send_respondable(grab(&counter));

        let request = rx.try_recv().unwrap();
        assert_eq!(request.event, "object_grab");
        let nonce = request.nonce.unwrap();

        // Unknown nonce and malformed payload leave the request pending.
        session.handle_inbound(Envelope::new("response", json!({"isSuccess": true})).with_nonce(nonce + 1));
        session.handle_inbound(Envelope::new("response", json!("garbage")).with_nonce(nonce));
        assert_eq!(session.pending_requests(), 1);

        session.handle_inbound(Envelope::new("response", json!({"isSuccess": true})).with_nonce(nonce));
        assert!(future.await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // A duplicate response does nothing.
        session.handle_inbound(Envelope::new("response", json!({"isSuccess": true})).with_nonce(nonce));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_response_event() {
        let mut session = Session::new(SessionConfig {
            response_event: "reply".into(),
            ..SessionConfig::default()
        });
        let (channel, mut rx) = MemoryChannel::pair();
        session.join_room("r").unwrap();
        session.attach_channel(Box::new(channel)).unwrap();
        session.handle_inbound(welcome(json!([])));
        rx.try_recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let future = session.send_respondable(grab(&counter));
        let nonce = rx.try_recv().unwrap().nonce.unwrap();

        session.handle_inbound(Envelope::new("response", json!({"isSuccess": true})).with_nonce(nonce));
        assert_eq!(session.pending_requests(), 1);
        session.handle_inbound(Envelope::new("reply", json!({"isSuccess": true})).with_nonce(nonce));
        assert!(future.await);
    }

    #[tokio::test]
    async fn test_disconnect_is_leak_free() {
        let (mut session, _rx) = online_session();
        let counter = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..3).map(|_| session.send_respondable(grab(&counter))).collect();
        assert_eq!(session.pending_requests(), 3);

        let mut changes = session.subscribe_presence();
        assert!(session.disconnect());
        assert!(!session.disconnect());

        assert_eq!(session.pending_requests(), 0);
        assert!(session.presence().is_empty());
        assert!(session.room_id().is_none());
        assert!(session.local_user().is_none());
        assert!(matches!(changes.try_recv(), Ok(PresenceChange::Left(_))));
        for future in futures {
            assert!(!future.await);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 300);
    }

    #[tokio::test]
    async fn test_channel_refusal_resolves_offline() {
        let (mut session, rx) = online_session();
        drop(rx);
        let counter = Arc::new(AtomicUsize::new(0));
        let future = session.send_respondable(grab(&counter));
        assert_eq!(session.pending_requests(), 0);
        assert!(!future.await);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_duplicate_connect_is_repaired() {
        let (mut session, _rx) = online_session();
        session.handle_inbound(Envelope::new("user_connected", user("c", "Carol")));
        session.handle_inbound(Envelope::new("user_connected", user("b", "Bobby")));

        assert_eq!(session.presence().len(), 2);
        assert_eq!(
            session.presence().lookup_by_id("b").unwrap().display_name,
            "Bobby"
        );
    }

    #[test]
    fn test_spectating_and_pose_updates() {
        let (mut session, _rx) = online_session();
        session.handle_inbound(Envelope::new(
            "spectating_update",
            json!({"userId": "b", "originalMessage": {"event": "spectating_update", "payload": {"isSpectating": true}}}),
        ));
        assert!(session.presence().lookup_by_id("b").unwrap().is_spectating());

        session.handle_inbound(Envelope::new(
            "user_positions",
            json!({"userId": "b", "originalMessage": {"event": "user_positions",
                "payload": {"position": [1.0, 2.0, 3.0], "quaternion": [0.0, 0.0, 0.0, 1.0]}}}),
        ));
        assert_eq!(
            session.presence().lookup_by_id("b").unwrap().pose.unwrap().position,
            [1.0, 2.0, 3.0]
        );

        // Unknown users are ignored.
        session.handle_inbound(Envelope::new(
            "spectating_update",
            json!({"userId": "ghost", "originalMessage": {"event": "spectating_update", "payload": {"isSpectating": true}}}),
        ));
        assert!(session.presence().lookup_by_id("ghost").is_none());
    }

    #[test]
    fn test_user_disconnected() {
        let (mut session, _rx) = online_session();
        session.handle_inbound(Envelope::new("user_disconnected", json!({"id": "b"})));
        assert!(session.presence().is_empty());
        // Unknown ids are a no-op.
        session.handle_inbound(Envelope::new("user_disconnected", json!({"id": "b"})));
    }

    #[test]
    fn test_events_dropped_while_offline() {
        let mut session = session();
        session.handle_inbound(Envelope::new("user_connected", user("b", "Bob")));
        assert!(session.presence().is_empty());
        assert_eq!(session.stats().dropped_offline, 1);
    }

    #[test]
    fn test_send_and_publish_snapshot() {
        let (mut session, mut rx) = online_session();
        assert!(session.send("chat", &json!({"text": "hi"})).unwrap());
        assert_eq!(rx.try_recv().unwrap().event, "chat");

        let notes: Arc<KeyedReplica<String>> = Arc::new(KeyedReplica::new("notes"));
        notes.insert("k", "v".into());
        session.register_replica(notes).unwrap();
        assert!(session.publish_snapshot().unwrap());
        let update = rx.try_recv().unwrap();
        assert_eq!(update.event, "snapshot_update");
        let snapshot: SessionSnapshot = update.payload_as().unwrap();
        assert_eq!(snapshot.section("notes"), Some(&json!({"k": "v"})));

        session.disconnect();
        assert!(!session.send("chat", &json!({})).unwrap());
    }

    #[test]
    fn test_malformed_frame_counted() {
        let (mut session, _rx) = online_session();
        session.handle_frame("not json");
        assert_eq!(session.stats().malformed, 1);
    }
}
