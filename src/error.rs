use thiserror::Error;

use crate::session::SessionState;

/// Errors surfaced while turning wire payloads back into samples.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("PCM payload must contain an even number of bytes (got {0})")]
    OddLength(usize),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Errors raised by input devices and the capture pipeline.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("audio input unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture is already active")]
    AlreadyActive,
    #[error("audio device error: {0}")]
    Device(String),
}

/// Errors raised by the duplex connection to the backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("timed out after {0:?} waiting for the backend")]
    Timeout(std::time::Duration),
    #[error("connection closed")]
    Closed,
    #[error("outbound media queue is full")]
    QueueFull,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Invalid or incomplete configuration, fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backend URL is not configured")]
    MissingBackendUrl,
    #[error("unsupported language code '{0}'")]
    UnsupportedLanguage(String),
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Errors returned by [`crate::SessionController`] commands.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation not valid while {0}")]
    NotReady(SessionState),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session controller has shut down")]
    ControllerGone,
}
