//! Engine.IO v4 and Socket.IO v5 packet codec.
//!
//! Engine.IO packets are a single type digit followed by the payload. Over
//! HTTP long-polling several packets travel in one body, separated by the
//! ASCII record separator. A Socket.IO packet rides inside an Engine.IO
//! `message` packet: type digit, optional `/namespace,` prefix, optional ack
//! id, then a JSON payload.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Separator between packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

#[derive(Error, Debug, PartialEq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown engine.io packet type {0:?}")]
    UnknownEngineType(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketType(char),
    #[error("binary socket.io packets are not supported")]
    Binary,
    #[error("malformed packet payload: {0}")]
    Payload(String),
}

/// Parameters the server announces in the `open` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// Longest a poll request can legitimately stay open.
    pub fn poll_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(hs) => {
                format!("0{}", serde_json::to_string(hs).unwrap_or_default())
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, PacketError> {
        let mut chars = raw.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        Ok(match kind {
            '0' => EnginePacket::Open(
                serde_json::from_str(rest).map_err(|e| PacketError::Payload(e.to_string()))?,
            ),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping(rest.to_string()),
            '3' => EnginePacket::Pong(rest.to_string()),
            '4' => EnginePacket::Message(rest.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => return Err(PacketError::UnknownEngineType(other)),
        })
    }
}

/// Split a polling response body into packets.
pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, PacketError> {
    body.split(RECORD_SEPARATOR)
        .filter(|p| !p.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

/// Join packets into one polling request body.
pub fn encode_payload(packets: &[EnginePacket]) -> String {
    let parts: Vec<String> = packets.iter().map(EnginePacket::encode).collect();
    parts.join(&RECORD_SEPARATOR.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect { nsp: String, data: Option<Value> },
    Disconnect { nsp: String },
    Event { nsp: String, data: Value },
    ConnectError { nsp: String, data: Value },
}

impl SocketPacket {
    /// An event packet: `[name, payload]`.
    pub fn event(nsp: &str, name: &str, payload: Value) -> Self {
        SocketPacket::Event {
            nsp: nsp.to_string(),
            data: Value::Array(vec![Value::String(name.to_string()), payload]),
        }
    }

    pub fn nsp(&self) -> &str {
        match self {
            SocketPacket::Connect { nsp, .. }
            | SocketPacket::Disconnect { nsp }
            | SocketPacket::Event { nsp, .. }
            | SocketPacket::ConnectError { nsp, .. } => nsp,
        }
    }

    pub fn encode(&self) -> String {
        let (kind, data) = match self {
            SocketPacket::Connect { data, .. } => ('0', data.as_ref()),
            SocketPacket::Disconnect { .. } => ('1', None),
            SocketPacket::Event { data, .. } => ('2', Some(data)),
            SocketPacket::ConnectError { data, .. } => ('4', Some(data)),
        };

        let mut out = String::new();
        out.push(kind);
        let nsp = self.nsp();
        if nsp != "/" {
            out.push_str(nsp);
            out.push(',');
        }
        if let Some(data) = data {
            out.push_str(&data.to_string());
        }
        out
    }

    pub fn decode(raw: &str) -> Result<Self, PacketError> {
        let mut chars = raw.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        if matches!(kind, '5' | '6') {
            return Err(PacketError::Binary);
        }
        let mut rest = chars.as_str();

        let mut nsp = "/";
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    nsp = &rest[..idx];
                    rest = &rest[idx + 1..];
                }
                None => {
                    nsp = rest;
                    rest = "";
                }
            }
        }

        // Ack ids are not used by this client; skip them.
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(rest)
                    .map_err(|e| PacketError::Payload(e.to_string()))?,
            )
        };

        let nsp = nsp.to_string();
        Ok(match kind {
            '0' => SocketPacket::Connect { nsp, data },
            '1' => SocketPacket::Disconnect { nsp },
            '2' | '3' => SocketPacket::Event {
                nsp,
                data: data.unwrap_or(Value::Null),
            },
            '4' => SocketPacket::ConnectError {
                nsp,
                data: data.unwrap_or(Value::Null),
            },
            other => return Err(PacketError::UnknownSocketType(other)),
        })
    }
}
