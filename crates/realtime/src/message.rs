//! Hub wire protocol (SignalR JSON encoding)
//!
//! Every message is a JSON object terminated by the ASCII record separator;
//! one WebSocket frame may carry several of them.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RealtimeError;

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// Server-to-client method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
}

impl Invocation {
    pub fn new(target: &str, arguments: Vec<serde_json::Value>) -> Self {
        Self {
            target: target.to_string(),
            arguments,
            invocation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Completions, stream items and anything else this client does not act on
    Other(u8),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<serde_json::Value>,
    invocation_id: Option<String>,
    error: Option<String>,
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Parse one record (without its separator)
    pub fn parse(record: &str) -> Result<Self, RealtimeError> {
        let raw: RawMessage = serde_json::from_str(record)?;
        match raw.kind {
            INVOCATION => {
                let target = raw.target.ok_or_else(|| {
                    RealtimeError::Protocol("invocation without target".to_string())
                })?;
                Ok(Self::Invocation(Invocation {
                    target,
                    arguments: raw.arguments,
                    invocation_id: raw.invocation_id,
                }))
            }
            PING => Ok(Self::Ping),
            CLOSE => Ok(Self::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Ok(Self::Other(other)),
        }
    }

    /// Serialize including the trailing separator
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Invocation(invocation) => {
                let mut value = json!({
                    "type": INVOCATION,
                    "target": invocation.target,
                    "arguments": invocation.arguments,
                });
                if let Some(id) = &invocation.invocation_id {
                    value["invocationId"] = json!(id);
                }
                value
            }
            Self::Ping => json!({ "type": PING }),
            Self::Close {
                error,
                allow_reconnect,
            } => {
                let mut value = json!({ "type": CLOSE });
                if let Some(error) = error {
                    value["error"] = json!(error);
                }
                if *allow_reconnect {
                    value["allowReconnect"] = json!(true);
                }
                value
            }
            Self::Other(kind) => json!({ "type": kind }),
        };
        format!("{}{}", value, RECORD_SEPARATOR)
    }
}

/// Non-empty records of a text frame
pub fn split_frame(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

pub fn handshake_request() -> String {
    format!(
        "{}{}",
        json!({ "protocol": "json", "version": 1 }),
        RECORD_SEPARATOR
    )
}

/// Check the handshake response, returning whatever followed it in the frame
pub fn parse_handshake_response(frame: &str) -> Result<&str, RealtimeError> {
    let (head, rest) = frame.split_once(RECORD_SEPARATOR).ok_or_else(|| {
        RealtimeError::Handshake("handshake response not terminated".to_string())
    })?;
    let response: serde_json::Value = serde_json::from_str(head)?;
    if let Some(error) = response.get("error").and_then(|e| e.as_str()) {
        return Err(RealtimeError::Handshake(error.to_string()));
    }
    Ok(rest)
}
