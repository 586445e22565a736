//! Unified error type and the structured [`HttpError`].
//!
//! Every fallible operation in hornet returns [`Error`]. Handlers return it
//! too: an [`Error::Http`] drives the response through the server's error
//! handler, anything else is reported as `500 Internal Server Error`.

use std::fmt;

use serde::Serialize;

/// Shorthand used across the crate and by handlers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by hornet's fallible operations and by handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("multipart: {0}")]
    Multipart(#[from] multer::Error),

    #[error("invalid listener network `{0}`")]
    InvalidNetwork(String),

    #[error("invalid redirect status code {0}")]
    InvalidRedirectCode(u16),

    #[error("duplicate connection id `{0}`")]
    DuplicateConnection(String),

    #[error("transport closed")]
    Closed,

    #[error("broadcast failed for {} peer(s)", .0.len())]
    Broadcast(Vec<(String, Error)>),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a plain message as an opaque (500) error.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Other(message.into().into())
    }

    /// Returns the structured error if this is one.
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Self::Http(he) => Some(he),
            _ => None,
        }
    }
}

// ── HttpError ────────────────────────────────────────────────────────────────

/// The framework's externally observable failure.
///
/// `code` is the HTTP status, `errno` an application error number (omitted
/// from the wire shape when zero) and `internal` an optional cause that is
/// only exposed in debug mode.
#[derive(Debug, Serialize)]
pub struct HttpError {
    pub code: u16,
    #[serde(skip_serializing_if = "is_zero")]
    pub errno: i64,
    pub message: String,
    #[serde(skip)]
    pub internal: Option<Box<Error>>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl HttpError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, errno: 0, message: message.into(), internal: None }
    }

    /// Uses the canonical reason phrase as the message.
    pub fn status(code: u16) -> Self {
        let reason = http::StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown Status");
        Self::new(code, reason)
    }

    pub fn with_errno(mut self, errno: i64) -> Self {
        self.errno = errno;
        self
    }

    pub fn with_internal(mut self, err: impl Into<Error>) -> Self {
        self.internal = Some(Box::new(err.into()));
        self
    }

    pub fn bad_request() -> Self { Self::status(400) }
    pub fn unauthorized() -> Self { Self::status(401) }
    pub fn forbidden() -> Self { Self::status(403) }
    pub fn not_found() -> Self { Self::status(404) }
    pub fn method_not_allowed() -> Self { Self::status(405) }
    pub fn payload_too_large() -> Self { Self::status(413) }
    pub fn unsupported_media_type() -> Self { Self::status(415) }
    pub fn internal_server_error() -> Self { Self::status(500) }
    pub fn service_unavailable() -> Self { Self::status(503) }

    /// Replaces `self` by its internal cause when that cause is itself an
    /// `HttpError`. Unwraps a single level only.
    pub(crate) fn unwrap_internal(mut self) -> Self {
        match self.internal.take().map(|b| *b) {
            Some(Error::Http(inner)) => inner,
            other => {
                self.internal = other.map(Box::new);
                self
            }
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={}, errno={}, message={}", self.code, self.errno, self.message)?;
        if let Some(internal) = &self.internal {
            write!(f, ", internal={internal}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.internal.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
