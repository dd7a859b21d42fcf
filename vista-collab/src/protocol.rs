//! JSON wire contract shared by the session core, the client and the relay.
//!
//! Every unit on the channel is an [`Envelope`]:
//! ```text
//! {"event": "user_connected", "payload": {...}, "nonce": 7}
//!   │                          │                 │
//!   │                          │                 └─ only on respondable requests/responses
//!   │                          └─ event-specific payload (camelCase fields)
//!   └─ event name, the routing key for dispatcher handlers
//! ```
//!
//! Messages one client sends to the others are relayed wrapped in a
//! [`ForwardedMessage`] carrying the sender's id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::presence::Rgb;
use crate::restore::SessionSnapshot;

/// Relay-assigned participant id.
pub type UserId = String;

/// Correlation token of a respondable request.
pub type Nonce = u64;

/// Event names. These strings are the contract feature handlers depend on.
pub mod event {
    /// Relay confirms our registration and lists everyone already present.
    pub const SELF_CONNECTED: &str = "self_connected";
    pub const USER_CONNECTED: &str = "user_connected";
    pub const USER_DISCONNECTED: &str = "user_disconnected";
    /// Forwarded per-user pose update.
    pub const USER_POSITIONS: &str = "user_positions";
    /// Forwarded `{isSpectating}` toggle.
    pub const SPECTATING_UPDATE: &str = "spectating_update";
    /// Default event carrying responses to respondable requests.
    pub const RESPONSE: &str = "response";

    /// First message a client sends after the socket opens.
    pub const JOIN: &str = "join";
    pub const JOIN_REJECTED: &str = "join_rejected";
    /// Replaces the room snapshot handed to late joiners.
    pub const SNAPSHOT_UPDATE: &str = "snapshot_update";

    pub const OBJECT_GRAB: &str = "object_grab";
    pub const OBJECT_RELEASE: &str = "object_release";

    /// Local only: fired by the session on every connection state change.
    pub const CONNECTION_CHANGED: &str = "connection_changed";
}

// ───────────────────────────────────────────────────────────────────
// Envelopes
// ───────────────────────────────────────────────────────────────────

/// A named, payload-carrying unit of communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub event: String,
    pub payload: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Nonce>,
}

impl<T> Envelope<T> {
    pub fn new(event: impl Into<String>, payload: T) -> Self {
        Self {
            event: event.into(),
            payload,
            nonce: None,
        }
    }

    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = Some(nonce);
        self
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize to the JSON text frame sent over the channel.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

impl Envelope<Value> {
    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Build an untyped envelope from any serializable payload.
    pub fn from_payload<P: Serialize + ?Sized>(
        event: impl Into<String>,
        payload: &P,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(event, payload))
    }

    /// Interpret the payload as `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtocolError::DeserializationError(format!("'{}' payload: {e}", self.event))
        })
    }

    /// Require the envelope to carry `expected`.
    pub fn expect_event(&self, expected: &str) -> Result<(), ProtocolError> {
        if self.event == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedEvent {
                expected: expected.to_string(),
                found: self.event.clone(),
            })
        }
    }
}

/// A client-originated message relayed to the other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedMessage<T> {
    pub user_id: UserId,
    pub original_message: T,
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Position and orientation of a participant's camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    #[serde(default)]
    pub position: [f64; 3],
    #[serde(default = "identity_quaternion")]
    pub quaternion: [f64; 4],
}

fn identity_quaternion() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            quaternion: identity_quaternion(),
        }
    }
}

/// Our own identity as confirmed by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfIdentity {
    pub id: UserId,
    pub name: String,
    pub color: Rgb,
}

/// `user_connected` payload; also one entry of the `self_connected` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConnected {
    pub id: UserId,
    pub name: String,
    pub color: Rgb,
    #[serde(flatten)]
    pub pose: Pose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfConnected {
    #[serde(rename = "self")]
    pub self_user: SelfIdentity,
    pub users: Vec<UserConnected>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDisconnected {
    pub id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatingUpdate {
    pub is_spectating: bool,
}

/// Handshake sent as the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
    #[serde(default)]
    pub host: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRejected {
    pub reason: String,
}

/// Request for exclusive manipulation of a shared object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectGrab {
    pub object_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectGrabResponse {
    pub is_success: bool,
}

/// Local `connection_changed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionChanged {
    pub state: crate::connection::ConnectionState,
    pub room_id: Option<String>,
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Expected '{expected}' event, got '{found}'")]
    UnexpectedEvent { expected: String, found: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_omits_missing_nonce() {
        let env = Envelope::new("chat", json!({"text": "hi"}));
        let text = env.encode().unwrap();
        assert!(!text.contains("nonce"));

        let with = Envelope::new("chat", json!({})).with_nonce(9);
        let decoded = Envelope::decode(&with.encode().unwrap()).unwrap();
        assert_eq!(decoded.nonce, Some(9));
    }

    #[test]
    fn test_self_connected_wire_shape() {
        let raw = json!({
            "event": "self_connected",
            "payload": {
                "self": {"id": "me", "name": "Alice", "color": [255, 0, 0]},
                "users": [
                    {"id": "b", "name": "Bob", "color": [0, 255, 0],
                     "position": [1.0, 2.0, 3.0], "quaternion": [0.0, 0.0, 0.0, 1.0]}
                ]
            }
        });
        let env = Envelope::decode(&raw.to_string()).unwrap();
        let payload: SelfConnected = env.payload_as().unwrap();

        assert_eq!(payload.self_user.id, "me");
        assert_eq!(payload.self_user.color, Rgb([255, 0, 0]));
        assert_eq!(payload.users.len(), 1);
        assert_eq!(payload.users[0].pose.position, [1.0, 2.0, 3.0]);
        assert!(payload.snapshot.is_none());
    }

    #[test]
    fn test_user_connected_without_pose_defaults() {
        let user: UserConnected =
            serde_json::from_value(json!({"id": "c", "name": "Carol", "color": [1, 2, 3]}))
                .unwrap();
        assert_eq!(user.pose, Pose::default());
    }

    #[test]
    fn test_forwarded_message_shape() {
        let original = Envelope::new("spectating_update", SpectatingUpdate { is_spectating: true });
        let forwarded = ForwardedMessage {
            user_id: "u1".to_string(),
            original_message: original,
        };
        let value = serde_json::to_value(&forwarded).unwrap();

        assert_eq!(value["userId"], "u1");
        assert_eq!(value["originalMessage"]["event"], "spectating_update");
        assert_eq!(value["originalMessage"]["payload"]["isSpectating"], true);

        let back: ForwardedMessage<Envelope<SpectatingUpdate>> =
            serde_json::from_value(value).unwrap();
        assert!(back.original_message.payload.is_spectating);
    }

    #[test]
    fn test_join_request_camel_case() {
        let join = JoinRequest {
            room_id: "r1".into(),
            name: "Alice".into(),
            color: None,
            host: true,
            snapshot: None,
        };
        let value = serde_json::to_value(&join).unwrap();
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["host"], true);
        assert!(value.get("snapshot").is_none());
    }

    #[test]
    fn test_payload_as_reports_event_name() {
        let env = Envelope::new("user_disconnected", json!({"nope": 1}));
        let err = env.payload_as::<UserDisconnected>().unwrap_err();
        assert!(err.to_string().contains("user_disconnected"));
    }

    #[test]
    fn test_expect_event() {
        let env = Envelope::new("join", json!(null));
        assert!(env.expect_event("join").is_ok());
        assert!(matches!(
            env.expect_event("response"),
            Err(ProtocolError::UnexpectedEvent { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_text() {
        assert!(Envelope::decode("{not json").is_err());
        assert!(Envelope::decode(r#"{"payload": 1}"#).is_err());
    }
}
