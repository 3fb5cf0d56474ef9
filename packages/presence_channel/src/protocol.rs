//! Push Channel Protocol Types
//!
//! Frame payloads delivered over the event stream and the presence snapshot
//! endpoint. Wire names are camelCase.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::FrameError;

pub const FRAME_CONNECTED: &str = "connected";
pub const FRAME_ENTITY_CHANGE: &str = "entity-change";
pub const FRAME_USER_CONNECTED: &str = "user-connected";
pub const FRAME_USER_DISCONNECTED: &str = "user-disconnected";
pub const FRAME_NEW_MESSAGE: &str = "new-message";
pub const FRAME_ERROR: &str = "error";

/// Identifier that the backend may send either as a string or as a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(n) => write!(f, "{}", n),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

/// Accept `"42"`, `42`, or null for user ids and normalize to a string.
fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RecordId>::deserialize(deserializer)?.map(|id| id.to_string()))
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(RecordId::deserialize(deserializer)?.to_string())
}

/// Accept RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC), or epoch milliseconds.
/// Anything else decodes as `None` instead of failing the whole payload.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|t| t.and_utc())
            }),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn de_lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<serde_json::Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(parse_timestamp))
}

/// Decode a presence list entry by entry, skipping entries that do not decode.
fn de_user_list<'de, D>(deserializer: D) -> Result<Vec<ConnectedUser>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries =
        Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "skipping undecodable presence entry");
                None
            }
        })
        .collect())
}

fn default_session_count() -> u32 {
    1
}

/// One entry of the presence set. `id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUser {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_time")]
    pub connected_at: Option<DateTime<Utc>>,
    /// Decorative: always 1 unless the server supplies its own count.
    #[serde(default = "default_session_count")]
    pub session_count: u32,
}

impl ConnectedUser {
    /// Username, falling back to first name. Blank strings do not count.
    pub fn display_name(&self) -> Option<&str> {
        [self.username.as_deref(), self.first_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
    }

    /// An entry is invalid only when it has neither an id nor a display name.
    pub fn is_valid(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty()) || self.display_name().is_some()
    }
}

/// Payload of the `connected` frame: the full presence snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    #[serde(default, deserialize_with = "de_user_list")]
    pub connected_users: Vec<ConnectedUser>,
}

/// Payload of `user-connected` / `user-disconnected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    #[serde(deserialize_with = "de_id")]
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "de_lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl UserPresence {
    /// Presence entry for a fresh connection. Session count is reset to 1.
    pub fn into_connected_user(self) -> ConnectedUser {
        ConnectedUser {
            id: Some(self.user_id),
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
            role: self.role,
            connected_at: Some(self.connected_at.unwrap_or_else(Utc::now)),
            session_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityAction {
    Create,
    Update,
    Delete,
}

/// Domain change notification. Everything beyond the routing fields is kept
/// verbatim in `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChangeEvent {
    pub entity_type: String,
    pub action: EntityAction,
    #[serde(default)]
    pub entity_id: Option<RecordId>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Chat notification forwarded to the "on new message" callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub chat_id: RecordId,
    pub message_id: RecordId,
    pub sender_id: RecordId,
    #[serde(default)]
    pub sender_name: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Response of `GET /users/online`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub success: bool,
    #[serde(default, deserialize_with = "de_user_list")]
    pub users: Vec<ConnectedUser>,
}

/// A named frame as it comes off the transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Connected(SnapshotPayload),
    EntityChange(EntityChangeEvent),
    UserConnected(UserPresence),
    UserDisconnected(UserPresence),
    NewMessage(NewMessage),
    /// Transport-level error frame; carries no payload.
    TransportError,
    /// A frame name this client does not consume.
    Unknown(String),
}

impl InboundFrame {
    pub fn parse(frame: &RawFrame) -> Result<Self, FrameError> {
        let data = frame.data.as_str();
        Ok(match frame.event.as_str() {
            FRAME_CONNECTED => InboundFrame::Connected(serde_json::from_str(data)?),
            FRAME_ENTITY_CHANGE => {
                InboundFrame::EntityChange(serde_json::from_value(unwrapped(data)?)?)
            }
            FRAME_USER_CONNECTED => InboundFrame::UserConnected(serde_json::from_str(data)?),
            FRAME_USER_DISCONNECTED => InboundFrame::UserDisconnected(serde_json::from_str(data)?),
            FRAME_NEW_MESSAGE => InboundFrame::NewMessage(serde_json::from_value(unwrapped(data)?)?),
            FRAME_ERROR => InboundFrame::TransportError,
            other => InboundFrame::Unknown(other.to_string()),
        })
    }
}

/// Parse `data` and strip a `{ "data": {...} }` wrapper if present.
fn unwrapped(data: &str) -> Result<serde_json::Value, FrameError> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    let serde_json::Value::Object(mut map) = value else {
        return Err(FrameError::UnexpectedShape("payload is not an object"));
    };
    match map.remove("data") {
        Some(inner @ serde_json::Value::Object(_)) => Ok(inner),
        Some(other) => {
            map.insert("data".to_string(), other);
            Ok(serde_json::Value::Object(map))
        }
        None => Ok(serde_json::Value::Object(map)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_frame_parses() {
        let frame = RawFrame::new(
            FRAME_CONNECTED,
            r#"{"connectedUsers":[{"id":"u1","username":"ana","firstName":"Ana","lastName":"Ruiz","connectedAt":"2024-06-15T10:00:00Z","sessionCount":1}]}"#,
        );
        let InboundFrame::Connected(snapshot) = InboundFrame::parse(&frame).unwrap() else {
            panic!("Expected Connected");
        };
        assert_eq!(snapshot.connected_users.len(), 1);
        let user = &snapshot.connected_users[0];
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert_eq!(user.display_name(), Some("ana"));
        assert!(user.connected_at.is_some());
    }

    #[test]
    fn numeric_user_ids_are_normalized() {
        let user: ConnectedUser = serde_json::from_str(r#"{"id":7,"username":"bo"}"#).unwrap();
        assert_eq!(user.id.as_deref(), Some("7"));
        assert_eq!(user.session_count, 1);

        let presence: UserPresence = serde_json::from_str(r#"{"userId":42}"#).unwrap();
        assert_eq!(presence.user_id, "42");
    }

    #[test]
    fn entity_change_plain_and_wrapped_are_equivalent() {
        let plain = RawFrame::new(
            FRAME_ENTITY_CHANGE,
            r#"{"entityType":"cliente","action":"update","entityId":12,"nombre":"ACME"}"#,
        );
        let wrapped = RawFrame::new(
            FRAME_ENTITY_CHANGE,
            r#"{"data":{"entityType":"cliente","action":"update","entityId":12,"nombre":"ACME"}}"#,
        );
        let a = InboundFrame::parse(&plain).unwrap();
        let b = InboundFrame::parse(&wrapped).unwrap();
        assert_eq!(a, b);

        let InboundFrame::EntityChange(event) = a else {
            panic!("Expected EntityChange");
        };
        assert_eq!(event.entity_type, "cliente");
        assert_eq!(event.action, EntityAction::Update);
        assert_eq!(event.entity_id, Some(RecordId::Number(12)));
        assert_eq!(event.payload.get("nombre").unwrap(), "ACME");
    }

    #[test]
    fn non_object_data_field_is_kept_as_payload() {
        let frame = RawFrame::new(
            FRAME_ENTITY_CHANGE,
            r#"{"entityType":"factura","action":"create","data":"note"}"#,
        );
        let InboundFrame::EntityChange(event) = InboundFrame::parse(&frame).unwrap() else {
            panic!("Expected EntityChange");
        };
        assert_eq!(event.payload.get("data").unwrap(), "note");
    }

    #[test]
    fn wrapped_new_message_parses() {
        let frame = RawFrame::new(
            FRAME_NEW_MESSAGE,
            r#"{"data":{"chatId":"c1","messageId":99,"senderId":"u2","senderName":"Bea","message":"hola","timestamp":"2024-06-15T10:00:00Z"}}"#,
        );
        let InboundFrame::NewMessage(msg) = InboundFrame::parse(&frame).unwrap() else {
            panic!("Expected NewMessage");
        };
        assert_eq!(msg.chat_id, RecordId::Text("c1".into()));
        assert_eq!(msg.message_id, RecordId::Number(99));
        assert_eq!(msg.message, "hola");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let frame = RawFrame::new(FRAME_USER_CONNECTED, "not json");
        assert!(InboundFrame::parse(&frame).is_err());

        let frame = RawFrame::new(FRAME_ENTITY_CHANGE, "[1,2,3]");
        assert!(matches!(
            InboundFrame::parse(&frame),
            Err(FrameError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn error_and_unknown_frames() {
        assert_eq!(
            InboundFrame::parse(&RawFrame::new(FRAME_ERROR, "")).unwrap(),
            InboundFrame::TransportError
        );
        assert_eq!(
            InboundFrame::parse(&RawFrame::new("heartbeat", "")).unwrap(),
            InboundFrame::Unknown("heartbeat".into())
        );
    }

    #[test]
    fn validity_rules() {
        let blank = ConnectedUser {
            id: None,
            username: Some("  ".into()),
            first_name: None,
            last_name: Some("Ruiz".into()),
            role: None,
            connected_at: None,
            session_count: 1,
        };
        assert!(!blank.is_valid());

        let named = ConnectedUser {
            first_name: Some("Ana".into()),
            ..blank.clone()
        };
        assert!(named.is_valid());
        assert_eq!(named.display_name(), Some("Ana"));

        let with_id = ConnectedUser {
            id: Some("u9".into()),
            ..blank
        };
        assert!(with_id.is_valid());
    }

    #[test]
    fn user_presence_defaults_connected_at() {
        let presence: UserPresence =
            serde_json::from_str(r#"{"userId":"u2","username":"bea"}"#).unwrap();
        let user = presence.into_connected_user();
        assert_eq!(user.id.as_deref(), Some("u2"));
        assert_eq!(user.session_count, 1);
        assert!(user.connected_at.is_some());
    }

    #[test]
    fn connected_at_accepts_common_encodings() {
        let cases = [
            r#""2024-06-15T10:00:00Z""#,
            r#""2024-06-15 10:00:00""#,
            r#""2024-06-15 10:00:00.250""#,
            "1718445600000",
        ];
        for raw in cases {
            let json = format!(r#"{{"id":"u1","username":"ana","connectedAt":{raw}}}"#);
            let user: ConnectedUser = serde_json::from_str(&json).unwrap();
            let at = user.connected_at.unwrap();
            assert_eq!(at.date_naive().to_string(), "2024-06-15", "input {raw}");
        }
    }

    #[test]
    fn unreadable_connected_at_becomes_none() {
        let user: ConnectedUser =
            serde_json::from_str(r#"{"id":"u1","connectedAt":"yesterday-ish"}"#).unwrap();
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert!(user.connected_at.is_none());
    }

    #[test]
    fn snapshot_keeps_valid_entries_next_to_bad_ones() {
        let frame = RawFrame::new(
            FRAME_CONNECTED,
            r#"{"connectedUsers":[
                {"id":"u1","username":"ana"},
                {"id":"u2","username":"bea","connectedAt":1718445600000},
                {"id":7.5,"username":"frac"},
                "not-an-object",
                {"id":"u3","username":"cai","connectedAt":"2024-06-15 10:00:00"}
            ]}"#,
        );
        let InboundFrame::Connected(snapshot) = InboundFrame::parse(&frame).unwrap() else {
            panic!("Expected Connected");
        };
        let ids: Vec<_> = snapshot
            .connected_users
            .iter()
            .filter_map(|u| u.id.as_deref())
            .collect();
        assert_eq!(ids, vec!["u1", "u2", "u3"]);
    }

    #[test]
    fn online_users_response_skips_bad_entries() {
        let body: OnlineUsersResponse = serde_json::from_str(
            r#"{"success":true,"users":[
                {"id":"u1","username":"ana"},
                {"id":18446744073709551616,"username":"huge"},
                {"id":"u2","connectedAt":1718445600000}
            ]}"#,
        )
        .unwrap();
        assert!(body.success);
        assert_eq!(body.users.len(), 2);
        assert!(body.users[1].connected_at.is_some());
    }

    #[test]
    fn user_presence_tolerates_epoch_timestamps() {
        let presence: UserPresence = serde_json::from_str(
            r#"{"userId":"u2","connectedAt":1718445600000,"disconnectedAt":"garbage"}"#,
        )
        .unwrap();
        assert!(presence.connected_at.is_some());
        assert!(presence.disconnected_at.is_none());
    }
}
