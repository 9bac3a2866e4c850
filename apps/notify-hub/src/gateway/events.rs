//! Wire-format messages: server → client shapes, client → server events,
//! and the timestamp normalization applied to every outbound payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Current time as an RFC 3339 / ISO-8601 string.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Something about to be written to one or more sockets.
///
/// JSON objects lacking a `timestamp` get one in [`Payload::into_wire`];
/// text that isn't a JSON object goes out untouched.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn into_wire(self) -> String {
        match self {
            Payload::Json(mut value) => {
                stamp(&mut value);
                value.to_string()
            }
            Payload::Text(text) => stamp_text(text),
        }
    }

    /// Serialized form without timestamp normalization, for the bus.
    pub fn into_text(self) -> String {
        match self {
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<ServerMessage> for Payload {
    fn from(message: ServerMessage) -> Self {
        Payload::Json(message.into_value())
    }
}

/// Inject a `timestamp` into a JSON object that lacks one.
pub fn stamp(value: &mut Value) {
    if let Value::Object(map) = value {
        if !map.contains_key(TIMESTAMP_FIELD) {
            map.insert(TIMESTAMP_FIELD.to_string(), Value::String(now_iso()));
        }
    }
}

fn stamp_text(text: String) -> String {
    if !text.trim_start().starts_with('{') {
        return text;
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) if map.contains_key(TIMESTAMP_FIELD) => text,
        Ok(mut value @ Value::Object(_)) => {
            stamp(&mut value);
            value.to_string()
        }
        _ => text,
    }
}

// ---------------------------------------------------------------------------
// Server → Client messages
// ---------------------------------------------------------------------------

/// Room flavour, derivable from the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Session,
    Entity,
}

/// One entry of the `rooms` list in `connection_success`.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub size: usize,
    #[serde(rename = "type")]
    pub kind: RoomKind,
}

/// Hub facts reported to a freshly connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub version: &'static str,
    pub clients: usize,
    pub rooms: usize,
    pub bus_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// Outcome of an `update_session` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionUpdateAction {
    /// Same session id as before; nothing changed.
    None,
    /// First session id bound to this connection.
    Set,
    /// Replaced a previous session id.
    Updated,
}

impl SessionUpdateAction {
    fn message(self) -> &'static str {
        match self {
            Self::None => "Session ID is unchanged",
            Self::Set => "Session ID set",
            Self::Updated => "Session ID updated",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

/// Every message the hub itself originates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionSuccess {
        message: String,
        #[serde(rename = "roomId")]
        room_id: Option<String>,
        rooms: Vec<RoomSummary>,
        environment: Environment,
    },
    SessionIdRequired {
        message: String,
        code: ErrorCode,
    },
    RoomJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "roomType")]
        room_type: RoomKind,
        message: String,
        #[serde(rename = "roomSize")]
        room_size: usize,
        #[serde(rename = "entityType", skip_serializing_if = "Option::is_none")]
        entity_type: Option<String>,
        #[serde(rename = "entityId", skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
    SubscriptionConfirmation {
        status: SubscriptionStatus,
        #[serde(rename = "entityType")]
        entity_type: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        #[serde(rename = "roomId")]
        room_id: String,
    },
    SessionUpdateConfirmation {
        success: bool,
        action: SessionUpdateAction,
        message: String,
        #[serde(rename = "roomId")]
        room_id: String,
    },
    UserInfoUpdateConfirmation {
        success: bool,
        #[serde(rename = "userId")]
        user_id: Value,
    },
    PartialApplicationsResponse {
        success: bool,
        applications: Vec<Value>,
        count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Pong {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        heartbeat_id: Option<Value>,
    },
    ServerPing {
        id: String,
    },
    RoomPing {
        #[serde(rename = "roomId")]
        room_id: String,
        id: String,
    },
}

impl ServerMessage {
    pub fn into_value(self) -> Value {
        // Serializing plain strings/numbers/vecs into a Value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code,
        }
    }

    pub fn session_id_required() -> Self {
        Self::SessionIdRequired {
            message: "No session found. Please send an update_session message with your session ID."
                .to_string(),
            code: ErrorCode::NoSession,
        }
    }

    pub fn room_joined(room_id: &str, kind: RoomKind, size: usize) -> Self {
        let message = match kind {
            RoomKind::Session => "Joined session room",
            RoomKind::Entity => "Joined entity room",
        };
        Self::RoomJoined {
            room_id: room_id.to_string(),
            room_type: kind,
            message: message.to_string(),
            room_size: size,
            entity_type: None,
            entity_id: None,
        }
    }

    pub fn entity_room_joined(room_id: &str, size: usize, entity_type: &str, entity_id: &str) -> Self {
        Self::RoomJoined {
            room_id: room_id.to_string(),
            room_type: RoomKind::Entity,
            message: format!("Subscribed to {entity_type} {entity_id}"),
            room_size: size,
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.to_string()),
        }
    }

    pub fn subscription(
        status: SubscriptionStatus,
        entity_type: &str,
        entity_id: &str,
        room_id: &str,
    ) -> Self {
        Self::SubscriptionConfirmation {
            status,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            room_id: room_id.to_string(),
        }
    }

    pub fn session_updated(action: SessionUpdateAction, room_id: &str) -> Self {
        Self::SessionUpdateConfirmation {
            success: true,
            action,
            message: action.message().to_string(),
            room_id: room_id.to_string(),
        }
    }

    pub fn partial_applications(applications: Vec<Value>) -> Self {
        Self::PartialApplicationsResponse {
            success: true,
            count: applications.len(),
            applications,
            error: None,
        }
    }

    pub fn partial_applications_failed(message: impl Into<String>) -> Self {
        Self::PartialApplicationsResponse {
            success: false,
            applications: Vec::new(),
            count: 0,
            error: Some(ErrorDetail {
                code: ErrorCode::DataServiceError,
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server messages
// ---------------------------------------------------------------------------

/// `entityType` / `entityId` pair. Ids arrive as numbers or strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityTarget {
    #[serde(rename = "entityType", default)]
    pub entity_type: Option<Value>,
    #[serde(rename = "entityId", default)]
    pub entity_id: Option<Value>,
}

impl EntityTarget {
    /// Both halves as non-empty strings, or `None`.
    pub fn resolve(&self) -> Option<(String, String)> {
        let entity_type = scalar_string(self.entity_type.as_ref()?)?;
        let entity_id = scalar_string(self.entity_id.as_ref()?)?;
        Some((entity_type, entity_id))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomTarget {
    #[serde(rename = "roomId", default)]
    pub room_id: Option<Value>,
}

impl RoomTarget {
    pub fn resolve(&self) -> Option<String> {
        match self.room_id.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSession {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<Value>,
}

impl UpdateSession {
    pub fn resolve(&self) -> Option<String> {
        match self.session_id.as_ref()? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "userId", default)]
    pub user_id: Option<Value>,
}

impl UserInfo {
    pub fn resolve(&self) -> Option<Value> {
        let value = self.user_id.as_ref()?;
        match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) if !s.is_empty() => Some(value.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub heartbeat_id: Option<Value>,
}

/// Client reply to a `server_ping` (or a spontaneous pong).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PongReply {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub reply_to: Option<Value>,
    #[serde(default)]
    pub heartbeat_id: Option<Value>,
    /// Echo of the `timestamp` the server put on its `server_ping`.
    /// Clients send either the RFC 3339 string or epoch milliseconds.
    #[serde(default)]
    pub ping_timestamp: Option<Value>,
}

impl PongReply {
    /// When the answered ping was sent, if the echo is readable.
    pub fn ping_sent_at(&self) -> Option<DateTime<Utc>> {
        match self.ping_timestamp.as_ref()? {
            Value::String(ts) => DateTime::parse_from_rfc3339(ts)
                .ok()
                .map(|sent| sent.with_timezone(&Utc)),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|ms| ms as i64))
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            _ => None,
        }
    }
}

/// A decoded client message, keyed by its `type` discriminator.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Subscribe(EntityTarget),
    Unsubscribe(EntityTarget),
    RoomMessage(RoomTarget),
    SessionMessage,
    EntityEvent(EntityTarget),
    UpdateSession(UpdateSession),
    RoomPingResponse(RoomTarget),
    Pong(PongReply),
    UpdateUserInfo(UserInfo),
    GetPartialApplications,
    Chat,
    Notification,
    Ping(PingRequest),
    #[serde(other)]
    Unknown,
}

impl ClientEvent {
    /// Keepalive traffic never gets user context attached.
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ClientEvent::Ping(_) | ClientEvent::Pong(_))
    }
}

/// Result of decoding one text frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A JSON object whose `type` decoded into a known (or `Unknown`) event.
    Typed {
        event: ClientEvent,
        body: Map<String, Value>,
    },
    /// A JSON object without a usable `type`.
    Untyped { body: Map<String, Value> },
    /// A known `type` whose fields didn't fit it. Never relayed.
    Malformed { body: Map<String, Value> },
    /// Anything that isn't a JSON object.
    Opaque(String),
}

impl Inbound {
    pub fn parse(raw: &str) -> Self {
        let body = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => return Inbound::Opaque(raw.to_string()),
        };
        match serde_json::from_value::<ClientEvent>(Value::Object(body.clone())) {
            Ok(event) => Inbound::Typed { event, body },
            Err(_) if has_known_type(&body) => Inbound::Malformed { body },
            Err(_) => Inbound::Untyped { body },
        }
    }

    /// The `type` field as sent, for logging.
    pub fn message_type(&self) -> &str {
        match self {
            Inbound::Typed { body, .. } | Inbound::Untyped { body } | Inbound::Malformed { body } => {
                body.get("type").and_then(Value::as_str).unwrap_or("unknown")
            }
            Inbound::Opaque(_) => "opaque",
        }
    }
}

/// Every event's fields are optional, so the bare `type` decodes to a
/// named variant exactly when the type is one the hub handles.
fn has_known_type(body: &Map<String, Value>) -> bool {
    let Some(message_type) = body.get("type").filter(|t| t.is_string()) else {
        return false;
    };
    let mut bare = Map::new();
    bare.insert("type".to_string(), message_type.clone());
    matches!(
        serde_json::from_value::<ClientEvent>(Value::Object(bare)),
        Ok(event) if !matches!(event, ClientEvent::Unknown)
    )
}

/// Stringify a JSON string or number; anything else is rejected.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamp_adds_missing_timestamp() {
        let wire = Payload::from(json!({"type": "chat"})).into_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn stamp_keeps_existing_timestamp() {
        let wire = Payload::from(json!({"type": "chat", "timestamp": "then"})).into_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["timestamp"], "then");

        let raw = r#"{"type":"chat","timestamp":"then"}"#;
        assert_eq!(Payload::from(raw).into_wire(), raw);
    }

    #[test]
    fn stamp_leaves_non_objects_alone() {
        assert_eq!(Payload::from("hello").into_wire(), "hello");
        assert_eq!(Payload::from("[1,2]").into_wire(), "[1,2]");
        assert_eq!(Payload::from("{broken").into_wire(), "{broken");
    }

    #[test]
    fn stamp_text_object_gains_timestamp() {
        let wire = Payload::from(r#"{"type":"notification"}"#).into_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "notification");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn parse_subscribe_with_numeric_id() {
        let inbound = Inbound::parse(r#"{"type":"subscribe","entityType":"resource","entityId":42}"#);
        match inbound {
            Inbound::Typed {
                event: ClientEvent::Subscribe(target),
                ..
            } => {
                assert_eq!(
                    target.resolve(),
                    Some(("resource".to_string(), "42".to_string()))
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_is_unknown_variant() {
        let inbound = Inbound::parse(r#"{"type":"wave","hand":"left"}"#);
        assert!(matches!(
            inbound,
            Inbound::Typed {
                event: ClientEvent::Unknown,
                ..
            }
        ));
        assert_eq!(inbound.message_type(), "wave");
    }

    #[test]
    fn parse_missing_type_is_untyped() {
        let inbound = Inbound::parse(r#"{"hello":"world"}"#);
        assert!(matches!(inbound, Inbound::Untyped { .. }));
    }

    #[test]
    fn known_types_are_recognized_without_their_fields() {
        let known = |raw: &str| match serde_json::from_str::<Value>(raw).unwrap() {
            Value::Object(body) => has_known_type(&body),
            _ => unreachable!(),
        };
        assert!(known(r#"{"type":"pong"}"#));
        assert!(known(r#"{"type":"subscribe","entityId":[1]}"#));
        assert!(!known(r#"{"type":"wave"}"#));
        assert!(!known(r#"{"type":7}"#));
        assert!(!known(r#"{"text":"hi"}"#));
    }

    #[test]
    fn pong_with_numeric_timestamp_is_typed() {
        let inbound = Inbound::parse(r#"{"type":"pong","reply_to":"p1","ping_timestamp":1714564800000}"#);
        match inbound {
            Inbound::Typed {
                event: ClientEvent::Pong(pong),
                ..
            } => assert!(pong.ping_sent_at().is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pong_timestamp_accepts_string_or_millis() {
        let iso = PongReply {
            ping_timestamp: Some(json!("2024-05-01T12:00:00.000Z")),
            ..Default::default()
        };
        assert_eq!(iso.ping_sent_at().unwrap().timestamp_millis(), 1_714_564_800_000);

        let millis = PongReply {
            ping_timestamp: Some(json!(1_714_564_800_000_i64)),
            ..Default::default()
        };
        assert_eq!(millis.ping_sent_at(), iso.ping_sent_at());

        let junk = PongReply {
            ping_timestamp: Some(json!(["x"])),
            ..Default::default()
        };
        assert!(junk.ping_sent_at().is_none());
    }

    #[test]
    fn parse_garbage_is_opaque() {
        assert!(matches!(Inbound::parse("not json"), Inbound::Opaque(_)));
        assert!(matches!(Inbound::parse("42"), Inbound::Opaque(_)));
    }

    #[test]
    fn update_session_rejects_blank_and_non_string() {
        let blank = UpdateSession {
            session_id: Some(json!("  ")),
        };
        assert!(blank.resolve().is_none());
        let number = UpdateSession {
            session_id: Some(json!(12)),
        };
        assert!(number.resolve().is_none());
    }

    #[test]
    fn server_messages_use_wire_field_names() {
        let value = ServerMessage::entity_room_joined("entity_resource_42", 1, "resource", "42").into_value();
        assert_eq!(value["type"], "room_joined");
        assert_eq!(value["roomId"], "entity_resource_42");
        assert_eq!(value["roomType"], "entity");
        assert_eq!(value["roomSize"], 1);
        assert_eq!(value["entityId"], "42");

        let session = ServerMessage::room_joined("session_abc", RoomKind::Session, 2).into_value();
        assert!(session.get("entityType").is_none());

        let err = ServerMessage::error(ErrorCode::RoomAccessDenied, "nope").into_value();
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "ROOM_ACCESS_DENIED");
    }
}
