//! Application-facing interfaces: the outbound request transport and the
//! observer callbacks.
//!
//! Both are invoked from the event-loop task. The transport performs the
//! actual HTTP exchange asynchronously and feeds the response back
//! through [`FlowManager::resp`](crate::FlowManager::resp), correlated by
//! the [`RrId`] carried in the request.

use crate::error::Result;
use crate::rr::RrId;
use crate::types::MediaCategory;
use crate::FlowError;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One REST request handed to the application transport.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Correlation id to pass back to `resp`; `None` for fire-and-forget
    /// requests.
    pub rr: Option<RrId>,
    pub method: Method,
    /// Path relative to the configured backend base URL.
    pub path: String,
    /// Content type; set when `body` is present.
    pub content_type: Option<&'static str>,
    pub body: Option<serde_json::Value>,
}

/// Outbound request transport supplied by the application.
pub trait RequestTransport: Send + Sync {
    /// Issue the request. An error fails the operation that produced it;
    /// the transport must then not deliver a response for the request.
    fn send_request(&self, request: OutboundRequest) -> Result<()>;
}

/// Callbacks delivered to the application from the event-loop task.
///
/// All methods have empty defaults so implementors override only what
/// they observe.
pub trait FlowManagerObserver: Send + Sync {
    /// The call's media category should change; the audio manager commits
    /// it by calling `mcat_changed`.
    fn on_category_change(&self, convid: &str, category: MediaCategory) {
        let _ = (convid, category);
    }

    /// Periodic input/output volume sample for one participant.
    fn on_volume(&self, convid: &str, user_id: &str, input: f32, output: f32) {
        let _ = (convid, user_id, input, output);
    }

    /// Media became established (or was lost) on all active flows.
    fn on_media_established(&self, convid: &str, established: bool) {
        let _ = (convid, established);
    }

    /// The conference participant order changed.
    fn on_conference_order(&self, convid: &str, order: &[String]) {
        let _ = (convid, order);
    }

    /// A call-fatal error; the application decides whether to re-acquire.
    fn on_error(&self, error: &FlowError, convid: &str) {
        let _ = (error, convid);
    }

    /// Measured network quality in `[0.0, 1.0]`.
    fn on_network_quality(&self, convid: &str, quality: f32) {
        let _ = (convid, quality);
    }

    /// RTP stopped arriving (or resumed) on an established call.
    fn on_interruption(&self, convid: &str, interrupted: bool) {
        let _ = (convid, interrupted);
    }
}
