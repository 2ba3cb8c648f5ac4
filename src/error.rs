use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable [{device}]: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Session not connected")]
    NotConnected,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable code, used for event payloads and log throttling keys
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::AudioError(_) => "audio",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::DeviceUnavailable { .. } => "device_unavailable",
            AppError::SessionError(_) => "session",
            AppError::TransportError(_) => "transport",
            AppError::NotConnected => "not_connected",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::TransportError(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
