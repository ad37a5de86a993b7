//! Engine.IO v4 / Socket.IO v5 text packets, as spoken over the websocket transport.
//!
//! Only the client side of the default namespace is covered: binary attachments
//! and acknowledgements are not used by the admin feeds (ack ids are skipped on decode).

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// Engine.IO handshake data sent by the server right after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl OpenInfo {
    /// Silence after which the server is considered gone.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    /// Socket.IO CONNECT; carries the auth payload (client) or `{sid}` (server ack).
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(String),
}

impl Packet {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Packet::Event {
            name: name.into(),
            data,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(info) => format!(
                "0{}",
                serde_json::json!({
                    "sid": info.sid,
                    "pingInterval": info.ping_interval,
                    "pingTimeout": info.ping_timeout,
                })
            ),
            Packet::Close => "1".into(),
            Packet::Ping => "2".into(),
            Packet::Pong => "3".into(),
            Packet::Noop => "6".into(),
            Packet::Connect(None) => "40".into(),
            Packet::Connect(Some(auth)) => format!("40{auth}"),
            Packet::Disconnect => "41".into(),
            Packet::Event { name, data } => {
                let args = if data.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), data.clone()])
                };
                format!("42{args}")
            }
            Packet::ConnectError(message) => {
                format!("44{}", serde_json::json!({ "message": message }))
            }
        }
    }

    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Packet::Open)
                .map_err(|e| PacketError::Payload(e.to_string())),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '6' => Ok(Packet::Noop),
            '4' => decode_message(rest),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

fn decode_message(text: &str) -> Result<Packet, PacketError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let body = skip_namespace(chars.as_str());
    match kind {
        '0' => {
            if body.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                let v: Value =
                    serde_json::from_str(body).map_err(|e| PacketError::Payload(e.to_string()))?;
                Ok(Packet::Connect(Some(v)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let args = body.trim_start_matches(|c: char| c.is_ascii_digit());
            let v: Value =
                serde_json::from_str(args).map_err(|e| PacketError::Payload(e.to_string()))?;
            let mut items = match v {
                Value::Array(items) if !items.is_empty() => items,
                _ => return Err(PacketError::Payload("event args must be a non-empty array".into())),
            };
            let name = match items.remove(0) {
                Value::String(s) => s,
                _ => return Err(PacketError::Payload("event name must be a string".into())),
            };
            let data = match items.len() {
                0 => Value::Null,
                1 => items.remove(0),
                _ => Value::Array(items),
            };
            Ok(Packet::Event { name, data })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| match v {
                    Value::String(s) => Some(s),
                    v => v.get("message").and_then(|m| m.as_str()).map(str::to_string),
                })
                .unwrap_or_else(|| body.to_string());
            Ok(Packet::ConnectError(message))
        }
        other => Err(PacketError::UnknownType(other)),
    }
}

/// Drop a leading `/nsp,` if present.
fn skip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_open() {
        let p = Packet::decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":100,"pingTimeout":50,"maxPayload":1000000}"#).unwrap();
        match p {
            Packet::Open(info) => {
                assert_eq!(info.sid, "abc");
                assert_eq!(info.liveness_window(), Duration::from_millis(150));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_event_variants() {
        assert_eq!(
            Packet::decode(r#"42["new-notification",{"id":1}]"#).unwrap(),
            Packet::event("new-notification", json!({"id": 1}))
        );
        assert_eq!(
            Packet::decode(r#"42/admin,12["notification-deleted",4]"#).unwrap(),
            Packet::event("notification-deleted", json!(4))
        );
        assert_eq!(
            Packet::decode(r#"42["ping-me"]"#).unwrap(),
            Packet::event("ping-me", Value::Null)
        );
        assert_eq!(
            Packet::decode(r#"42["multi",1,2]"#).unwrap(),
            Packet::event("multi", json!([1, 2]))
        );
    }

    #[test]
    fn decode_control() {
        assert_eq!(Packet::decode("2").unwrap(), Packet::Ping);
        assert_eq!(Packet::decode("41").unwrap(), Packet::Disconnect);
        assert_eq!(
            Packet::decode(r#"40{"sid":"x"}"#).unwrap(),
            Packet::Connect(Some(json!({"sid": "x"})))
        );
        assert_eq!(
            Packet::decode(r#"44{"message":"Authentication error"}"#).unwrap(),
            Packet::ConnectError("Authentication error".into())
        );
    }

    #[test]
    fn decode_errors() {
        assert_eq!(Packet::decode(""), Err(PacketError::Empty));
        assert_eq!(Packet::decode("9"), Err(PacketError::UnknownType('9')));
        assert!(matches!(Packet::decode("42{}"), Err(PacketError::Payload(_))));
        assert!(matches!(Packet::decode("42[1]"), Err(PacketError::Payload(_))));
    }

    #[test]
    fn encode_client_packets() {
        assert_eq!(Packet::Pong.encode(), "3");
        assert_eq!(
            Packet::Connect(Some(json!({"token": "t"}))).encode(),
            r#"40{"token":"t"}"#
        );
        assert_eq!(
            Packet::event("join", json!("7")).encode(),
            r#"42["join","7"]"#
        );
    }
}
