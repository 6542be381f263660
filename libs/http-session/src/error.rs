use thiserror::Error;

/// Errors surfaced by session clients, streams and transports.
///
/// The type is `Clone` so a terminal failure can be handed to whichever
/// stream has to surface it. Transport errors are captured as messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Request build error: {0}")]
    Build(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport factory could not produce a client handle.
    #[error("Client construction failed: {0}")]
    Construction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Request was cancelled")]
    Cancelled,

    /// The pooled client was shut down before the request could start.
    #[error("Client is closed")]
    ClientClosed,

    #[error("Transport client was already shut down")]
    AlreadyShutdown,
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SessionError::Timeout(err.to_string())
        } else if err.is_connect() {
            SessionError::Connection(err.to_string())
        } else if err.is_builder() {
            SessionError::Build(err.to_string())
        } else {
            SessionError::Transport(err.to_string())
        }
    }
}
