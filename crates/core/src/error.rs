/// Result alias that carries the custom [`DemoSyncError`] type.
pub type Result<T> = std::result::Result<T, DemoSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum DemoSyncError {
    /// Invalid configuration value. Fatal when raised while validating the
    /// startup configuration; runtime setters clamp instead of returning it.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// No usable audio output hardware. Callers degrade to wall-clock mode.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The audio data could not be decoded; playback does not start.
    #[error("could not decode `{source_name}`: {reason}")]
    Decode { source_name: String, reason: String },
    /// No logged spectrum row lies within tolerance of the requested offset.
    #[error("no spectrum row within {tolerance} samples of offset {target}")]
    SeekMiss { target: u64, tolerance: u64 },
    /// The live sync connection was lost or refused.
    #[error("live sync disconnected: {0}")]
    ProtocolDisconnect(String),
    /// The live sync peer sent data that does not follow the protocol.
    #[error("live sync protocol error: {0}")]
    Protocol(String),
    /// Free-form error message.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl DemoSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn decode(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<&str> for DemoSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for DemoSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
