use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use serde::Deserialize;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The handshake could not produce an authenticated socket
    CannotConnect,
    /// The server rejected the configured credentials
    InvalidAuth,
    /// The socket dropped (or was closed) before the command completed
    ConnectionLost,
    /// The server answered the command with `success: false`
    Server,
    /// Error related to invalid input supplied by the caller
    Validation,
    /// Internal error from dependencies
    Internal,
}

impl Kind {
    /// Numeric code used by the frontend protocol for connection-level failures.
    ///
    /// Only [`Kind::CannotConnect`] (1), [`Kind::InvalidAuth`] (2) and
    /// [`Kind::ConnectionLost`] (3) have one.
    #[must_use]
    pub const fn code(self) -> Option<u8> {
        match self {
            Self::CannotConnect => Some(1),
            Self::InvalidAuth => Some(2),
            Self::ConnectionLost => Some(3),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            source: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    /// The error every pending command receives when its socket goes away.
    #[must_use]
    pub fn connection_lost() -> Self {
        Self::new(Kind::ConnectionLost)
    }

    /// The server-reported failure carried by a `result` frame, if this is one.
    #[must_use]
    pub fn server_error(&self) -> Option<&ServerError> {
        self.downcast_ref::<ServerError>()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Error code attached to a failed command. Older servers send integers,
/// newer ones send identifiers such as `"unknown_command"`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl Default for ErrorCode {
    fn default() -> Self {
        Self::Text("unknown_error".to_owned())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Failure reported by the server for a single command.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error({}): {}", self.code, self.message)
    }
}

impl StdError for ServerError {}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::with_source(Kind::Server, err)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

/// A shared cache could not load its initial snapshot.
///
/// Every caller waiting on the same cache gets its own copy of the failure,
/// so the original error is kept as text alongside its kind.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CacheInit {
    pub kind: Kind,
    pub reason: String,
}

impl fmt::Display for CacheInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache initialization failed: {}", self.reason)
    }
}

impl StdError for CacheInit {}

impl From<CacheInit> for Error {
    fn from(err: CacheInit) -> Self {
        Error::with_source(err.kind, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_codes_match_protocol() {
        assert_eq!(Kind::CannotConnect.code(), Some(1));
        assert_eq!(Kind::InvalidAuth.code(), Some(2));
        assert_eq!(Kind::ConnectionLost.code(), Some(3));
        assert_eq!(Kind::Server.code(), None);
    }

    #[test]
    fn server_error_keeps_code_and_message() {
        let server: ServerError =
            serde_json::from_str(r#"{"code":"not_found","message":"Service not found."}"#)
                .unwrap();
        let error: Error = server.into();

        assert_eq!(error.kind(), Kind::Server);
        let inner = error.server_error().unwrap();
        assert_eq!(inner.code, ErrorCode::Text("not_found".to_owned()));
        assert_eq!(
            error.to_string(),
            "Server: server error(not_found): Service not found."
        );
    }

    #[test]
    fn numeric_error_code_should_succeed() {
        let server: ServerError =
            serde_json::from_str(r#"{"code":3,"message":"Unknown command."}"#).unwrap();
        assert_eq!(server.code, ErrorCode::Number(3));
    }

    #[test]
    fn cache_init_keeps_original_kind() {
        let error: Error = CacheInit {
            kind: Kind::ConnectionLost,
            reason: "ConnectionLost".to_owned(),
        }
        .into();
        assert_eq!(error.kind(), Kind::ConnectionLost);
    }
}
