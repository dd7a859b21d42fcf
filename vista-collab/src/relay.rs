//! Reference WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── outbox A ──► Client A
//!            ├── Room (room_id) ────┼── outbox B ──► Client B
//! Client B ──┘     │                └── outbox C ──► Client C
//!                  ├── members + last known poses
//!                  ├── snapshot for late joiners
//!                  └── object grab locks
//! ```
//!
//! The first frame of every connection must be a `join`. The relay assigns
//! the user id and color, answers with `self_connected`, announces the
//! newcomer to the room, and from then on forwards every event as a
//! [`ForwardedMessage`] to the other members. `object_grab`,
//! `object_release` and `snapshot_update` are handled by the relay itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::Rgb;
use crate::protocol::{
    event, Envelope, ForwardedMessage, JoinRejected, JoinRequest, ObjectGrab,
    ObjectGrabResponse, Pose, ProtocolError, SelfConnected, SelfIdentity, UserConnected,
    UserDisconnected, UserId,
};
use crate::restore::SessionSnapshot;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum users per room
    pub max_users_per_room: usize,
    /// Frames buffered per connection before the relay drops them
    pub outgoing_capacity: usize,
    /// Event on which respondable requests are answered
    pub response_event: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_users_per_room: 100,
            outgoing_capacity: 256,
            response_event: event::RESPONSE.to_string(),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_joins: u64,
    pub dropped_frames: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Member {
    seq: u64,
    profile: UserConnected,
    outbox: mpsc::Sender<String>,
}

/// One room: members, the snapshot handed to late joiners and grab locks.
struct Room {
    members: HashMap<UserId, Member>,
    snapshot: SessionSnapshot,
    grabbed: HashMap<String, UserId>,
    next_seq: u64,
}

impl Room {
    fn new(snapshot: SessionSnapshot) -> Self {
        Self {
            members: HashMap::new(),
            snapshot,
            grabbed: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Member profiles in join order.
    fn profiles(&self) -> Vec<UserConnected> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.seq);
        members.into_iter().map(|m| m.profile.clone()).collect()
    }

    /// Push a frame to every member except `except`. Returns frames dropped.
    fn fan_out(&self, frame: &str, except: Option<&str>) -> u64 {
        let mut dropped = 0;
        for (id, member) in &self.members {
            if Some(id.as_str()) == except {
                continue;
            }
            if member.outbox.try_send(frame.to_string()).is_err() {
                log::warn!("Outbox of {id} full or closed; dropping frame");
                dropped += 1;
            }
        }
        dropped
    }

    /// Exclusive grab. Re-grabbing an object one already holds succeeds.
    fn grab(&mut self, object_id: &str, user_id: &str) -> bool {
        match self.grabbed.get(object_id) {
            Some(owner) => owner == user_id,
            None => {
                self.grabbed.insert(object_id.to_string(), user_id.to_string());
                true
            }
        }
    }

    fn release(&mut self, object_id: &str, user_id: &str) -> bool {
        if self.grabbed.get(object_id).map(String::as_str) == Some(user_id) {
            self.grabbed.remove(object_id);
            true
        } else {
            false
        }
    }

    fn release_all(&mut self, user_id: &str) -> usize {
        let before = self.grabbed.len();
        self.grabbed.retain(|_, owner| owner != user_id);
        before - self.grabbed.len()
    }
}

/// Successful admission of one connection.
#[derive(Debug)]
struct Admission {
    room_id: String,
    user_id: UserId,
}

/// Admit `join` into `rooms`, queueing `self_connected` on `outbox` and
/// announcing the newcomer to the room.
fn admit(
    rooms: &mut HashMap<String, Room>,
    config: &RelayConfig,
    join: JoinRequest,
    outbox: &mpsc::Sender<String>,
) -> Result<Admission, String> {
    let JoinRequest {
        room_id,
        name,
        color,
        host,
        snapshot,
    } = join;

    if host {
        if rooms.contains_key(&room_id) {
            return Err(format!("room {room_id} already exists"));
        }
        if config.max_users_per_room == 0 {
            return Err(format!("room {room_id} is full"));
        }
        rooms.insert(room_id.clone(), Room::new(snapshot.unwrap_or_default()));
        log::info!("Room {room_id} created by {name}");
    }
    let room = rooms
        .get_mut(&room_id)
        .ok_or_else(|| format!("room {room_id} not found"))?;
    if room.members.len() >= config.max_users_per_room {
        return Err(format!("room {room_id} is full"));
    }

    let uuid = Uuid::new_v4();
    let user_id = uuid.to_string();
    let profile = UserConnected {
        id: user_id.clone(),
        name: name.clone(),
        color: color.unwrap_or_else(|| Rgb::from_uuid(uuid)),
        pose: Pose::default(),
    };

    let welcome = SelfConnected {
        self_user: SelfIdentity {
            id: user_id.clone(),
            name,
            color: profile.color,
        },
        users: room.profiles(),
        snapshot: (!host).then(|| room.snapshot.clone()),
    };
    let welcome = Envelope::new(event::SELF_CONNECTED, welcome)
        .encode()
        .map_err(|e| e.to_string())?;
    outbox
        .try_send(welcome)
        .map_err(|_| "connection closed during admission".to_string())?;

    let announce = Envelope::new(event::USER_CONNECTED, &profile)
        .encode()
        .map_err(|e| e.to_string())?;
    room.fan_out(&announce, None);

    let seq = room.next_seq;
    room.next_seq += 1;
    room.members.insert(
        user_id.clone(),
        Member {
            seq,
            profile,
            outbox: outbox.clone(),
        },
    );

    Ok(Admission { room_id, user_id })
}

struct RelayShared {
    config: RelayConfig,
    rooms: RwLock<HashMap<String, Room>>,
    stats: RwLock<RelayStats>,
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<RelayShared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(RelayStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Members of `room_id` in join order, with their last known pose.
    pub async fn room_users(&self, room_id: &str) -> Option<Vec<UserConnected>> {
        self.shared.rooms.read().await.get(room_id).map(Room::profiles)
    }

    pub async fn room_snapshot(&self, room_id: &str) -> Option<SessionSnapshot> {
        self.shared
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|r| r.snapshot.clone())
    }
}

async fn handle_connection(
    shared: Arc<RelayShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (outbox, mut outbox_rx) = mpsc::channel::<String>(shared.config.outgoing_capacity.max(1));

    // Handshake: the first text frame must be a join.
    let first = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => break Some(text.as_str().to_owned()),
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::warn!("WebSocket error from {addr} before join: {e}");
                break None;
            }
        }
    };
    let Some(first) = first else {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        return Ok(());
    };

    let admission = match parse_join(&first) {
        Ok(join) => {
            let mut rooms = shared.rooms.write().await;
            let result = admit(&mut rooms, &shared.config, join, &outbox);
            let room_count = rooms.len();
            drop(rooms);
            shared.stats.write().await.active_rooms = room_count;
            result
        }
        Err(e) => Err(e.to_string()),
    };

    let Admission { room_id, user_id } = match admission {
        Ok(admission) => admission,
        Err(reason) => {
            log::info!("Rejected join from {addr}: {reason}");
            let rejection = Envelope::new(event::JOIN_REJECTED, JoinRejected { reason }).encode()?;
            {
                let mut s = shared.stats.write().await;
                s.rejected_joins += 1;
                s.active_connections = s.active_connections.saturating_sub(1);
            }
            ws_sender.send(Message::Text(rejection.into())).await?;
            ws_sender.close().await?;
            return Ok(());
        }
    };
    log::info!("User {user_id} joined room {room_id} from {addr}");

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            route(&shared, &room_id, &user_id, text.as_str(), &outbox).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }

                Some(frame) = outbox_rx.recv() => {
                    ws_sender.send(Message::Text(frame.into())).await?;
                }
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;

    depart(&shared, &room_id, &user_id).await;
    result
}

fn parse_join(text: &str) -> Result<JoinRequest, ProtocolError> {
    let envelope = Envelope::decode(text)?;
    envelope.expect_event(event::JOIN)?;
    envelope.payload_as()
}

/// Handle one frame from an admitted member.
async fn route(
    shared: &RelayShared,
    room_id: &str,
    user_id: &str,
    text: &str,
    outbox: &mpsc::Sender<String>,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Dropping malformed frame from {user_id}: {e}");
            return;
        }
    };
    shared.stats.write().await.total_messages += 1;

    let dropped = {
        let mut rooms = shared.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        apply(room, &shared.config, room_id, user_id, envelope, outbox)
    };
    if dropped > 0 {
        shared.stats.write().await.dropped_frames += dropped;
    }
}

/// Apply one member frame to its room. Returns frames dropped on fan-out.
fn apply(
    room: &mut Room,
    config: &RelayConfig,
    room_id: &str,
    user_id: &str,
    envelope: Envelope<Value>,
    outbox: &mpsc::Sender<String>,
) -> u64 {
    match envelope.event.as_str() {
        event::OBJECT_GRAB => {
            let Some(nonce) = envelope.nonce else {
                log::warn!("object_grab from {user_id} without nonce");
                return 0;
            };
            let is_success = match envelope.payload_as::<ObjectGrab>() {
                Ok(grab) => room.grab(&grab.object_id, user_id),
                Err(e) => {
                    log::warn!("{e}");
                    false
                }
            };
            let response = Envelope::new(
                config.response_event.as_str(),
                ObjectGrabResponse { is_success },
            )
            .with_nonce(nonce);
            reply(outbox, &response);
            0
        }
        event::OBJECT_RELEASE => {
            if let Ok(grab) = envelope.payload_as::<ObjectGrab>() {
                if room.release(&grab.object_id, user_id) {
                    log::debug!("{user_id} released {}", grab.object_id);
                }
            }
            forward(room, user_id, envelope)
        }
        event::SNAPSHOT_UPDATE => {
            match envelope.payload_as::<SessionSnapshot>() {
                Ok(snapshot) => {
                    log::debug!("Room {room_id} snapshot updated by {user_id}");
                    room.snapshot = snapshot;
                }
                Err(e) => log::warn!("{e}"),
            }
            0
        }
        event::USER_POSITIONS => {
            if let (Ok(pose), Some(member)) =
                (envelope.payload_as::<Pose>(), room.members.get_mut(user_id))
            {
                member.profile.pose = pose;
            }
            forward(room, user_id, envelope)
        }
        event::JOIN => {
            log::warn!("Duplicate join from {user_id} ignored");
            0
        }
        _ => forward(room, user_id, envelope),
    }
}

fn forward(room: &Room, user_id: &str, envelope: Envelope<Value>) -> u64 {
    let event = envelope.event.clone();
    let forwarded = ForwardedMessage {
        user_id: user_id.to_string(),
        original_message: envelope,
    };
    match Envelope::new(event, forwarded).encode() {
        Ok(frame) => room.fan_out(&frame, Some(user_id)),
        Err(e) => {
            log::warn!("Could not forward frame from {user_id}: {e}");
            0
        }
    }
}

fn reply<T: Serialize>(outbox: &mpsc::Sender<String>, envelope: &Envelope<T>) {
    match envelope.encode() {
        Ok(frame) => {
            if outbox.try_send(frame).is_err() {
                log::warn!("Own outbox full; dropping '{}' reply", envelope.event);
            }
        }
        Err(e) => log::warn!("{e}"),
    }
}

/// Remove a member, free its grabs and tell the room.
async fn depart(shared: &RelayShared, room_id: &str, user_id: &str) {
    let mut rooms = shared.rooms.write().await;
    if let Some(room) = rooms.get_mut(room_id) {
        room.members.remove(user_id);
        let released = room.release_all(user_id);
        if released > 0 {
            log::debug!("Released {released} objects held by {user_id}");
        }

        match Envelope::new(
            event::USER_DISCONNECTED,
            UserDisconnected {
                id: user_id.to_string(),
            },
        )
        .encode()
        {
            Ok(frame) => {
                room.fan_out(&frame, None);
            }
            Err(e) => log::warn!("{e}"),
        }

        if room.members.is_empty() {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
    }
    log::info!("User {user_id} left room {room_id}");

    let room_count = rooms.len();
    drop(rooms);
    let mut s = shared.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = room_count;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn join(room: &str, name: &str, host: bool) -> JoinRequest {
        JoinRequest {
            room_id: room.into(),
            name: name.into(),
            color: None,
            host,
            snapshot: None,
        }
    }

    fn frames(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope<Value>> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(Envelope::decode(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_users_per_room, 100);
        assert_eq!(config.response_event, "response");
    }

    #[test]
    fn test_host_then_join() {
        let config = RelayConfig::default();
        let mut rooms = HashMap::new();

        let (host_tx, mut host_rx) = mpsc::channel(8);
        let mut hosting = join("r1", "Alice", true);
        let mut snapshot = SessionSnapshot::new();
        snapshot.insert("notes", json!({"a": 1}));
        hosting.snapshot = Some(snapshot.clone());
        let host = admit(&mut rooms, &config, hosting, &host_tx).unwrap();

        let welcome: SelfConnected = frames(&mut host_rx)[0].payload_as().unwrap();
        assert_eq!(welcome.self_user.id, host.user_id);
        assert!(welcome.users.is_empty());
        assert!(welcome.snapshot.is_none());

        let (guest_tx, mut guest_rx) = mpsc::channel(8);
        let guest = admit(&mut rooms, &config, join("r1", "Bob", false), &guest_tx).unwrap();
        let welcome: SelfConnected = frames(&mut guest_rx)[0].payload_as().unwrap();
        assert_eq!(welcome.users.len(), 1);
        assert_eq!(welcome.users[0].name, "Alice");
        assert_eq!(welcome.snapshot, Some(snapshot));

        let announced = frames(&mut host_rx);
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].event, "user_connected");
        assert_eq!(announced[0].payload["id"], guest.user_id.as_str());
    }

    #[test]
    fn test_admission_rejections() {
        let config = RelayConfig {
            max_users_per_room: 1,
            ..RelayConfig::default()
        };
        let mut rooms = HashMap::new();
        let (tx, _rx) = mpsc::channel(8);

        let missing = admit(&mut rooms, &config, join("nope", "Bob", false), &tx);
        assert!(missing.unwrap_err().contains("not found"));

        admit(&mut rooms, &config, join("r", "Alice", true), &tx).unwrap();
        let duplicate = admit(&mut rooms, &config, join("r", "Eve", true), &tx);
        assert!(duplicate.unwrap_err().contains("already exists"));

        let full = admit(&mut rooms, &config, join("r", "Bob", false), &tx);
        assert!(full.unwrap_err().contains("full"));
    }

    #[test]
    fn test_assigned_color_is_stable_per_id() {
        let config = RelayConfig::default();
        let mut rooms = HashMap::new();
        let (tx, mut rx) = mpsc::channel(8);
        let admission = admit(&mut rooms, &config, join("r", "Alice", true), &tx).unwrap();

        let welcome: SelfConnected = frames(&mut rx)[0].payload_as().unwrap();
        let uuid = Uuid::parse_str(&admission.user_id).unwrap();
        assert_eq!(welcome.self_user.color, Rgb::from_uuid(uuid));
    }

    #[test]
    fn test_grab_is_exclusive() {
        let mut room = Room::new(SessionSnapshot::new());
        assert!(room.grab("obj", "a"));
        assert!(room.grab("obj", "a"));
        assert!(!room.grab("obj", "b"));

        assert!(!room.release("obj", "b"));
        assert!(room.release("obj", "a"));
        assert!(room.grab("obj", "b"));

        room.grab("other", "b");
        assert_eq!(room.release_all("b"), 2);
        assert!(room.grab("obj", "a"));
    }

    #[test]
    fn test_parse_join_requires_join_event() {
        let frame = Envelope::new("chat", json!({})).encode().unwrap();
        assert!(matches!(
            parse_join(&frame),
            Err(ProtocolError::UnexpectedEvent { .. })
        ));
        let frame = Envelope::new("join", join("r", "A", true)).encode().unwrap();
        assert_eq!(parse_join(&frame).unwrap().room_id, "r");
    }

    #[tokio::test]
    async fn test_route_forwards_and_answers_grabs() {
        let config = RelayConfig::default();
        let shared = RelayShared {
            config: config.clone(),
            rooms: RwLock::new(HashMap::new()),
            stats: RwLock::new(RelayStats::default()),
        };
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let (a, b) = {
            let mut rooms = shared.rooms.write().await;
            let a = admit(&mut rooms, &config, join("r", "A", true), &a_tx).unwrap();
            let b = admit(&mut rooms, &config, join("r", "B", false), &b_tx).unwrap();
            (a, b)
        };
        frames(&mut a_rx);
        frames(&mut b_rx);

        let pose = Envelope::new(
            "user_positions",
            json!({"position": [1.0, 0.0, 0.0], "quaternion": [0.0, 0.0, 0.0, 1.0]}),
        );
        route(&shared, "r", &a.user_id, &pose.encode().unwrap(), &a_tx).await;
        let forwarded = frames(&mut b_rx);
        assert_eq!(forwarded[0].event, "user_positions");
        assert_eq!(forwarded[0].payload["userId"], a.user_id.as_str());
        assert!(frames(&mut a_rx).is_empty());

        let users = shared.rooms.read().await.get("r").unwrap().profiles();
        assert_eq!(users[0].pose.position, [1.0, 0.0, 0.0]);

        let grab = Envelope::new("object_grab", json!({"objectId": "n"})).with_nonce(4);
        route(&shared, "r", &a.user_id, &grab.encode().unwrap(), &a_tx).await;
        route(&shared, "r", &b.user_id, &grab.encode().unwrap(), &b_tx).await;
        let to_a = frames(&mut a_rx);
        let to_b = frames(&mut b_rx);
        assert_eq!(to_a[0].nonce, Some(4));
        assert_eq!(to_a[0].payload, json!({"isSuccess": true}));
        assert_eq!(to_b[0].payload, json!({"isSuccess": false}));

        depart(&shared, "r", &a.user_id).await;
        let left = frames(&mut b_rx);
        assert_eq!(left[0].event, "user_disconnected");
        assert!(shared.rooms.read().await.get("r").unwrap().grabbed.is_empty());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, RelayStats::default());
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }
}
