//! socket.io v4 / engine.io v4 text packet codec.
//!
//! Only the subset needed by the trip room is supported: the engine.io
//! control packets (open, close, ping, pong, noop) and the socket.io packets
//! carried inside engine.io messages on the default namespace (connect,
//! disconnect, event, connect error). Binary packets are not used.
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   engine.io open
//! 2 / 3                                                  ping / pong
//! 40{"token":".."}                                       socket.io connect
//! 42["updatePosition",{..}]                              socket.io event
//! 44{"message":"unauthorized"}                           connect error
//! ```

use serde::Deserialize;
use serde_json::Value;

use super::ChannelError;

/// Parameters the server sends in the engine.io open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine.io session id.
    pub sid: String,
    /// Interval between server pings, in milliseconds.
    #[serde(default)]
    pub ping_interval: u64,
    /// How long the server waits for a pong, in milliseconds.
    #[serde(default)]
    pub ping_timeout: u64,
}

/// A decoded text packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// engine.io `0`: session opened.
    Open(OpenHandshake),
    /// engine.io `1`: session closed by the peer.
    Close,
    /// engine.io `2`.
    Ping,
    /// engine.io `3`.
    Pong,
    /// engine.io `6`.
    Noop,
    /// socket.io `40`: namespace connect, with optional auth/ack payload.
    Connect(Option<Value>),
    /// socket.io `41`: namespace disconnect.
    Disconnect,
    /// socket.io `42`: a named event and its first argument.
    Event {
        /// Event name.
        name: String,
        /// First event argument, `Null` if none was sent.
        data: Value,
    },
    /// socket.io `44`: the server refused the namespace connect.
    ConnectError(Value),
}

impl Packet {
    /// Build an event packet.
    #[must_use]
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            name: name.into(),
            data,
        }
    }

    /// Encode into the text frame payload.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Open(open) => format!(
                "0{}",
                serde_json::json!({
                    "sid": open.sid,
                    "pingInterval": open.ping_interval,
                    "pingTimeout": open.ping_timeout,
                })
            ),
            Self::Close => "1".to_string(),
            Self::Ping => "2".to_string(),
            Self::Pong => "3".to_string(),
            Self::Noop => "6".to_string(),
            Self::Connect(None) => "40".to_string(),
            Self::Connect(Some(payload)) => format!("40{payload}"),
            Self::Disconnect => "41".to_string(),
            Self::Event { name, data } => {
                let args = if data.is_null() {
                    serde_json::json!([name])
                } else {
                    serde_json::json!([name, data])
                };
                format!("42{args}")
            }
            Self::ConnectError(payload) => format!("44{payload}"),
        }
    }

    /// Decode a text frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] for unknown or malformed packets.
    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| protocol_error("empty packet", text))?;
        let rest = chars.as_str();

        match kind {
            '0' => {
                let open = serde_json::from_str(rest)
                    .map_err(|e| protocol_error(&format!("bad open packet: {e}"), text))?;
                Ok(Self::Open(open))
            }
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '6' => Ok(Self::Noop),
            '4' => decode_socket_packet(rest, text),
            _ => Err(protocol_error("unknown engine.io packet type", text)),
        }
    }
}

fn decode_socket_packet(body: &str, raw: &str) -> Result<Packet, ChannelError> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .ok_or_else(|| protocol_error("empty socket.io packet", raw))?;
    let payload = strip_ack_id(strip_namespace(chars.as_str()));

    match kind {
        '0' => {
            if payload.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(parse_json(payload, raw)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let args = parse_json(payload, raw)?;
            let Value::Array(mut args) = args else {
                return Err(protocol_error("event payload is not an array", raw));
            };
            if args.is_empty() {
                return Err(protocol_error("event without a name", raw));
            }
            let Value::String(name) = args.remove(0) else {
                return Err(protocol_error("event name is not a string", raw));
            };
            let data = if args.is_empty() {
                Value::Null
            } else {
                args.swap_remove(0)
            };
            Ok(Packet::Event { name, data })
        }
        '4' => Ok(Packet::ConnectError(if payload.is_empty() {
            Value::Null
        } else {
            parse_json(payload, raw)?
        })),
        _ => Err(protocol_error("unsupported socket.io packet type", raw)),
    }
}

/// Drop a `/namespace,` prefix. Only the default namespace is used, so the
/// name itself is ignored.
fn strip_namespace(payload: &str) -> &str {
    if payload.starts_with('/') {
        payload.split_once(',').map_or("", |(_, rest)| rest)
    } else {
        payload
    }
}

/// Drop a numeric ack id preceding the JSON body.
fn strip_ack_id(payload: &str) -> &str {
    payload.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(payload: &str, raw: &str) -> Result<Value, ChannelError> {
    serde_json::from_str(payload).map_err(|e| protocol_error(&format!("bad JSON: {e}"), raw))
}

fn protocol_error(reason: &str, raw: &str) -> ChannelError {
    const PREVIEW: usize = 64;
    let preview: String = raw.chars().take(PREVIEW).collect();
    ChannelError::Protocol(format!("{reason} in {preview:?}"))
}
