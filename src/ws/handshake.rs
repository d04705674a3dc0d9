use futures::{SinkExt as _, StreamExt as _};
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::config::Config;
use super::error::WsError;
use crate::types::request::AuthRequest;
use crate::types::response::{ServerMessage, parse_message};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open one socket and run the auth exchange on it.
///
/// Returns the socket once the server answers `auth_ok`.
pub(crate) async fn attempt(
    endpoint: &str,
    token: Option<&SecretString>,
) -> Result<WsStream, WsError> {
    let (mut socket, _) = connect_async(endpoint).await?;

    while let Some(message) = socket.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => return Err(WsError::ClosedBeforeAuth),
            _ => continue,
        };

        match parse_message(text.as_bytes()) {
            Ok(ServerMessage::AuthRequired { .. }) => {
                let Some(token) = token else {
                    _ = socket.close(None).await;
                    return Err(WsError::MissingAuthToken);
                };
                let auth =
                    serde_json::to_string(&AuthRequest::new(token)).map_err(WsError::MessageParse)?;
                socket.send(Message::Text(auth.into())).await?;
            }
            Ok(ServerMessage::AuthOk { ha_version }) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(?ha_version, "authenticated");
                #[cfg(not(feature = "tracing"))]
                let _ = &ha_version;
                return Ok(socket);
            }
            Ok(ServerMessage::AuthInvalid { message }) => {
                _ = socket.close(None).await;
                return Err(WsError::AuthenticationFailed { message });
            }
            Ok(other) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(message = ?other, "unexpected frame during handshake");
                #[cfg(not(feature = "tracing"))]
                let _ = &other;
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse handshake frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    Err(WsError::ClosedBeforeAuth)
}

/// Produce an authenticated socket, retrying transient failures.
///
/// Rejected or missing credentials fail right away. Anything else is retried
/// `config.max_retries` times (forever when unset), `config.retry_delay` apart.
pub(crate) async fn connect(endpoint: &str, config: &Config) -> Result<WsStream, WsError> {
    let mut remaining = config.max_retries;
    let mut attempts = 0_u32;

    loop {
        attempts = attempts.saturating_add(1);

        match attempt(endpoint, config.auth_token.as_ref()).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.is_terminal() => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "handshake rejected");
                return Err(e);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempts, error = %e, "Unable to connect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;

                remaining = match remaining {
                    Some(0) => return Err(WsError::RetriesExhausted { attempts }),
                    Some(left) => Some(left - 1),
                    None => None,
                };
                sleep(config.retry_delay).await;
            }
        }
    }
}
