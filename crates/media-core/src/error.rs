//! Error type for the media subsystem.

/// Errors surfaced by the media system and media flows.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    /// A mandatory argument was missing or empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The media system has not been initialized.
    #[error("media system is not initialized")]
    NotInitialized,

    /// Generating the DTLS identity failed.
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    /// No usable local network address was found and loopback is disabled.
    #[error("no usable local address")]
    NoLocalAddress,

    /// An ICE server URI in the call configuration could not be used.
    #[error("invalid ice server '{url}': {reason}")]
    IceServer { url: String, reason: String },

    /// The underlying media engine reported a failure.
    #[error("media engine failure: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;
