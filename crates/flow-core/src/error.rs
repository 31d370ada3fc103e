//! Error types for the flow manager.

use driftwave_media_core::MediaError;

/// Errors surfaced by flow-manager operations and delivered to the
/// application error handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// A public entry point was called with a missing mandatory parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Malformed JSON, a missing mandatory field, or an unexpected state
    /// on the wire. Recovered locally; the offending event is skipped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The referenced conversation or flow does not exist.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// The operation was already performed for the current state.
    #[error("already done")]
    Already,

    /// No usable local network interface and loopback is disabled.
    #[error("no usable local address")]
    NoLocalAddress,

    /// The media flow failed; escalated per call to the application.
    #[error("media failed: {0}")]
    MediaFailed(String),

    /// The RTP timeout elapsed twice in a row.
    #[error("media timed out")]
    Timeout,

    /// The request was cancelled before a response arrived.
    #[error("request aborted")]
    NetworkAborted,

    /// The underlying media subsystem reported an error.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The application request transport refused the request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The flow manager's event loop has terminated.
    #[error("flow manager is shut down")]
    Shutdown,
}

impl FlowError {
    /// True for errors that are recovered locally without application
    /// involvement.
    pub fn is_local(&self) -> bool {
        matches!(self, FlowError::Protocol(_) | FlowError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
