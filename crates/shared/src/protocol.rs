use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::RequestId;

pub const CALCULATE_PATH: &str = "/api/calculate";
pub const DOWNLOAD_PATH: &str = "/api/download";
pub const SAMPLE_PATH: &str = "/sample";
pub const HEALTH_PATH: &str = "/health";
pub const SOCKET_IO_PATH: &str = "/socket.io/";

pub const FORM_FIELD_FILE: &str = "file";
pub const FORM_FIELD_TARGET_ADDRESS: &str = "target_address";

pub const PROGRESS_EVENT: &str = "progress_update";

/// Engine.IO protocol revision spoken over the websocket transport.
pub const ENGINE_IO_VERSION: &str = "4";
pub const DEFAULT_NAMESPACE: &str = "/";

/// Successful descriptor-mode response of `POST /api/calculate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateResponse {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_processed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub api_keys_available: u32,
    /// Server wall clock. Offsets are folded into UTC; naive stamps are kept as sent.
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: NaiveDateTime,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(with_offset.naive_utc());
    }
    raw.parse::<NaiveDateTime>()
        .map_err(|err| serde::de::Error::custom(format!("invalid timestamp '{raw}': {err}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub progress: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl ProgressUpdate {
    pub fn new(progress: i64) -> Self {
        Self {
            progress,
            request_id: None,
        }
    }

    /// The pushed value clamped into a displayable percentage.
    pub fn percent(&self) -> u8 {
        self.progress.clamp(0, 100) as u8
    }
}

/// Events delivered over the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    ProgressUpdate(ProgressUpdate),
}

impl PushEvent {
    /// Maps a named server event to a push event; unknown names yield `Ok(None)`.
    pub fn from_event(name: &str, data: Value) -> serde_json::Result<Option<Self>> {
        match name {
            PROGRESS_EVENT => {
                serde_json::from_value(data).map(|update| Some(PushEvent::ProgressUpdate(update)))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("event frame without a name")]
    UnnamedEvent,
}

/// Handshake the server opens every Engine.IO session with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

/// One websocket text frame: an Engine.IO packet, possibly wrapping a
/// Socket.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketIoFrame {
    Open(EngineHandshake),
    Close,
    Ping,
    Pong,
    Connect,
    Disconnect,
    ConnectError(String),
    Event {
        namespace: String,
        name: String,
        data: Value,
    },
    /// Noops, upgrades, acks and binary packets; none carry progress.
    Ignored,
}

impl SocketIoFrame {
    pub fn event(name: &str, data: Value) -> Self {
        SocketIoFrame::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.to_string(),
            data,
        }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let mut chars = text.chars();
        let engine_type = chars.next().ok_or(FrameError::Empty)?;
        let rest = chars.as_str();
        match engine_type {
            '0' => Ok(SocketIoFrame::Open(serde_json::from_str(rest)?)),
            '1' => Ok(SocketIoFrame::Close),
            '2' => Ok(SocketIoFrame::Ping),
            '3' => Ok(SocketIoFrame::Pong),
            '4' => Self::parse_packet(rest),
            _ => Ok(SocketIoFrame::Ignored),
        }
    }

    fn parse_packet(packet: &str) -> Result<Self, FrameError> {
        let mut chars = packet.chars();
        let packet_type = chars.next().ok_or(FrameError::Empty)?;
        let mut body = chars.as_str();
        let mut namespace = DEFAULT_NAMESPACE;
        if body.starts_with('/') {
            let (ns, tail) = body.split_once(',').unwrap_or((body, ""));
            namespace = ns;
            body = tail;
        }

        match packet_type {
            '0' => Ok(SocketIoFrame::Connect),
            '1' => Ok(SocketIoFrame::Disconnect),
            '2' => {
                let payload = body.trim_start_matches(|c: char| c.is_ascii_digit());
                let mut items: Vec<Value> = serde_json::from_str(payload)?;
                if items.is_empty() {
                    return Err(FrameError::UnnamedEvent);
                }
                let data = if items.len() > 1 {
                    items.swap_remove(1)
                } else {
                    Value::Null
                };
                let name = items[0].as_str().ok_or(FrameError::UnnamedEvent)?.to_string();
                Ok(SocketIoFrame::Event {
                    namespace: namespace.to_string(),
                    name,
                    data,
                })
            }
            '4' => {
                let message = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| body.to_string());
                Ok(SocketIoFrame::ConnectError(message))
            }
            _ => Ok(SocketIoFrame::Ignored),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SocketIoFrame::Open(handshake) => format!("0{}", json!(handshake)),
            SocketIoFrame::Close => "1".to_string(),
            SocketIoFrame::Ping => "2".to_string(),
            SocketIoFrame::Pong => "3".to_string(),
            SocketIoFrame::Connect => "40".to_string(),
            SocketIoFrame::Disconnect => "41".to_string(),
            SocketIoFrame::ConnectError(message) => format!("44{}", json!({ "message": message })),
            SocketIoFrame::Event {
                namespace,
                name,
                data,
            } => {
                let prefix = if namespace == DEFAULT_NAMESPACE {
                    String::new()
                } else {
                    format!("{namespace},")
                };
                format!("42{prefix}{}", json!([name, data]))
            }
            SocketIoFrame::Ignored => "6".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_event_maps_with_optional_request_id() {
        let event = PushEvent::from_event(PROGRESS_EVENT, json!({"progress": 42}))
            .expect("decode")
            .expect("known event");
        assert_eq!(event, PushEvent::ProgressUpdate(ProgressUpdate::new(42)));

        let scoped = PushEvent::from_event(PROGRESS_EVENT, json!({"progress": 7, "request_id": 3}))
            .expect("decode")
            .expect("known event");
        let PushEvent::ProgressUpdate(update) = scoped;
        assert_eq!(update.request_id, Some(RequestId(3)));

        assert!(PushEvent::from_event("connected", json!({}))
            .expect("decode")
            .is_none());
        assert!(PushEvent::from_event(PROGRESS_EVENT, json!("half")).is_err());
    }

    #[test]
    fn socket_io_frames_parse() {
        let open = SocketIoFrame::parse(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .expect("open");
        let SocketIoFrame::Open(handshake) = &open else {
            panic!("expected open, got {open:?}");
        };
        assert_eq!(handshake.sid, "abc");
        assert_eq!(handshake.ping_interval, 25000);

        assert_eq!(SocketIoFrame::parse("2").expect("ping"), SocketIoFrame::Ping);
        assert_eq!(
            SocketIoFrame::parse(r#"40{"sid":"n1"}"#).expect("connect"),
            SocketIoFrame::Connect
        );
        assert_eq!(
            SocketIoFrame::parse(r#"42["progress_update",{"progress":42}]"#).expect("event"),
            SocketIoFrame::event(PROGRESS_EVENT, json!({"progress": 42}))
        );
        assert_eq!(
            SocketIoFrame::parse(r#"42/admin,7["progress_update",{"progress":1}]"#).expect("event"),
            SocketIoFrame::Event {
                namespace: "/admin".into(),
                name: PROGRESS_EVENT.into(),
                data: json!({"progress": 1}),
            }
        );
        assert_eq!(
            SocketIoFrame::parse(r#"44{"message":"unauthorized"}"#).expect("error"),
            SocketIoFrame::ConnectError("unauthorized".into())
        );
        assert_eq!(SocketIoFrame::parse("6").expect("noop"), SocketIoFrame::Ignored);
        assert!(matches!(SocketIoFrame::parse(""), Err(FrameError::Empty)));
        assert!(SocketIoFrame::parse("42not json").is_err());
        assert!(matches!(
            SocketIoFrame::parse("42[]"),
            Err(FrameError::UnnamedEvent)
        ));
    }

    #[test]
    fn client_frames_encode_as_the_server_expects() {
        assert_eq!(SocketIoFrame::Connect.encode(), "40");
        assert_eq!(SocketIoFrame::Pong.encode(), "3");
        assert_eq!(
            SocketIoFrame::event(PROGRESS_EVENT, json!({"progress": 5})).encode(),
            r#"42["progress_update",{"progress":5}]"#
        );
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(ProgressUpdate::new(-5).percent(), 0);
        assert_eq!(ProgressUpdate::new(250).percent(), 100);
    }

    #[test]
    fn descriptor_response_tolerates_extra_fields() {
        let body: CalculateResponse = serde_json::from_str(
            r#"{"status":"success","filename":"result.xlsx","total_processed":12}"#,
        )
        .expect("parse");
        assert_eq!(body.filename, "result.xlsx");
        assert_eq!(body.total_processed, Some(12));
    }

    #[test]
    fn health_accepts_naive_and_offset_timestamps() {
        let naive: HealthResponse = serde_json::from_str(
            r#"{"status":"healthy","api_keys_available":2,"timestamp":"2024-05-01T12:30:45.123456"}"#,
        )
        .expect("naive timestamp");
        assert!(naive.is_healthy());
        assert_eq!(naive.api_keys_available, 2);
        assert_eq!(naive.timestamp.to_string(), "2024-05-01 12:30:45.123456");

        let whole_seconds: HealthResponse = serde_json::from_str(
            r#"{"status":"healthy","api_keys_available":1,"timestamp":"2024-05-01T12:30:45"}"#,
        )
        .expect("timestamp without fraction");
        assert_eq!(whole_seconds.timestamp.to_string(), "2024-05-01 12:30:45");

        let offset: HealthResponse = serde_json::from_str(
            r#"{"status":"degraded","timestamp":"2024-05-01T14:30:45+02:00"}"#,
        )
        .expect("offset timestamp");
        assert!(!offset.is_healthy());
        assert_eq!(offset.timestamp.to_string(), "2024-05-01 12:30:45");

        assert!(serde_json::from_str::<HealthResponse>(
            r#"{"status":"healthy","timestamp":"yesterday"}"#
        )
        .is_err());
    }
}
