use serde::Deserialize;
use serde_json::Value;

use super::Event;
use crate::error::ServerError;

/// Every frame the server can send.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result(ResultFrame),
    Event {
        id: u64,
        event: Event,
    },
    Pong {
        id: u64,
    },
    /// A frame type this client does not understand
    #[serde(other)]
    Unknown,
}

/// Outcome of a single command.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResultFrame {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ServerError>,
}

impl ResultFrame {
    /// Split into the payload or the server-reported failure.
    pub fn into_result(self) -> Result<Value, ServerError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_default())
        }
    }
}

/// Parse one inbound text frame.
pub fn parse_message(bytes: &[u8]) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}
