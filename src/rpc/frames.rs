//! Wire frames
//!
//! UTF-8 JSON, one frame per WebSocket text message, discriminated by
//! `type`. The handshake is `hello` → `hello_ok`; afterwards the client
//! sends `req` frames and receives `res` and `event` frames. A top-level
//! `error` frame is only used for failures outside any request, such as a
//! rejected handshake.

use serde::{Deserialize, Serialize};

use crate::error::ErrorBody;
use crate::security::Scope;

/// Protocol version implemented by this server
pub const PROTOCOL_VERSION: u32 = 3;

/// All frames that cross the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello(HelloFrame),
    HelloOk(HelloOkFrame),
    Req(ReqFrame),
    Res(ResFrame),
    Event(EventFrame),
    Error { error: ErrorBody },
}

/// Client handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloFrame {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub auth: Option<HelloAuth>,
}

/// Client identification inside `hello`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Credentials inside `hello`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<crate::security::device::DeviceAuth>,
}

/// Server handshake response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOkFrame {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: serde_json::Value,
    pub auth: AuthGrant,
    pub policy: ConnectionPolicy,
}

/// Server identification inside `hello_ok`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub conn_id: String,
}

/// What this server supports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// The authorization the connection ended up with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    pub role: String,
    pub scopes: Vec<Scope>,
}

/// Per-connection limits advertised in the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    pub max_payload: usize,
    pub max_buffered: usize,
    pub tick_interval_ms: u64,
}

/// Request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// Response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResFrame {
    /// Success response
    #[must_use]
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Error response
    #[must_use]
    pub fn err(id: impl Into<String>, error: ErrorBody) -> Self {
        let id = id.into();
        Self {
            error: Some(error.with_request_id(id.clone())),
            id,
            ok: false,
            payload: None,
        }
    }
}

/// Event frame: the event name is hoisted out of the payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Build an event frame from a sequenced bus event
#[must_use]
pub fn event_frame(sequenced: &crate::events::SequencedEvent) -> Frame {
    let mut value = serde_json::to_value(&sequenced.event).unwrap_or_default();
    let name = value
        .as_object_mut()
        .and_then(|obj| obj.remove("event"))
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string());
    Frame::Event(EventFrame {
        event: name,
        payload: Some(value),
        seq: Some(sequenced.seq),
    })
}

/// Does the client's advertised range include our protocol?
#[must_use]
pub const fn protocol_compatible(min: u32, max: u32) -> bool {
    min <= PROTOCOL_VERSION && PROTOCOL_VERSION <= max
}
