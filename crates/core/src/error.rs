/// Result alias that carries the custom [`VoiceLayerError`] type.
pub type Result<T> = std::result::Result<T, VoiceLayerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum VoiceLayerError {
    /// Rejected configuration: bad thresholds, empty selection, missing
    /// device. Fatal to `start`, the loop never leaves `Idle`.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The control plane could not be reached or refused the session.
    #[error("connection error: {0}")]
    Connection(String),
    /// The capture device failed to open or stopped delivering frames.
    #[error("device error: {0}")]
    Device(String),
    /// A single remote request failed in transport.
    #[error("remote call failed: {0}")]
    RemoteCall(String),
    /// A discovery and a run tried to use the same catalog key at once.
    #[error("busy: {0}")]
    Busy(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl VoiceLayerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<&str> for VoiceLayerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VoiceLayerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
