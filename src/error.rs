//! Error types for the viewer core.
//!
//! Every variant maps to a degraded capability rather than a viewer halt:
//! callers log and fall back.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewerError {
    /// The persistent byte store could not be opened or created.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The signed-url exchange for an attachment failed.
    #[error("signed url unavailable for attachment {id}: {reason}")]
    SignedUrlUnavailable { id: String, reason: String },

    /// Push channel connect, send or receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The playback surface rejected a source.
    #[error("playback error: {0}")]
    Playback(String),
}

pub type ViewerResult<T> = Result<T, ViewerError>;

impl From<tokio_tungstenite::tungstenite::Error> for ViewerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ViewerError::Transport(e.to_string())
    }
}

impl From<config::ConfigError> for ViewerError {
    fn from(e: config::ConfigError) -> Self {
        ViewerError::Config(e.to_string())
    }
}
