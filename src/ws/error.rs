#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::Kind;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// The server answered `auth_invalid`
    AuthenticationFailed {
        /// Reason given by the server, if any
        message: Option<String>,
    },
    /// The server asked for credentials but no token is configured
    MissingAuthToken,
    /// The socket closed before the server accepted the credentials
    ClosedBeforeAuth,
    /// Every handshake attempt failed
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },
    /// WebSocket connection was closed
    ConnectionClosed,
}

impl WsError {
    /// Whether retrying the handshake could ever succeed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::MissingAuthToken
        )
    }

    pub(crate) const fn kind(&self) -> Kind {
        match self {
            Self::AuthenticationFailed { .. } => Kind::InvalidAuth,
            Self::MessageParse(_) => Kind::Internal,
            Self::ConnectionClosed => Kind::ConnectionLost,
            _ => Kind::CannotConnect,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::AuthenticationFailed { message: Some(m) } => {
                write!(f, "WebSocket authentication failed: {m}")
            }
            Self::AuthenticationFailed { message: None } => {
                write!(f, "WebSocket authentication failed")
            }
            Self::MissingAuthToken => write!(f, "Server requires authentication but no token is set"),
            Self::ClosedBeforeAuth => write!(f, "WebSocket closed before authentication completed"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "Unable to connect after {attempts} attempts")
            }
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(e.kind(), e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e)
    }
}
