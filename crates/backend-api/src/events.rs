//! Signalling events delivered over the backend event channel.
//!
//! The six `call.*` events are decoded once, here, into a single typed
//! enum; everything downstream dispatches on the variant.

use serde::Deserialize;

use crate::rest::{FlowEntry, RemoteCandidate, SdpType};

/// Wire names of the event types consumed by the calling core, in
/// dispatch order.
pub const EVENT_TYPES: [&str; 6] = [
    "call.flow-add",
    "call.flow-delete",
    "call.flow-active",
    "call.remote-candidates-add",
    "call.remote-candidates-update",
    "call.remote-sdp",
];

/// A decoded signalling event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CallEvent {
    /// One or more flows were created on a conversation.
    #[serde(rename = "call.flow-add")]
    FlowAdd {
        conversation: String,
        #[serde(default)]
        flows: Vec<FlowEntry>,
    },

    /// A flow was deleted on the backend.
    #[serde(rename = "call.flow-delete")]
    FlowDelete { conversation: String, flow: String },

    /// The active state of a flow changed.
    #[serde(rename = "call.flow-active")]
    FlowActive {
        conversation: String,
        flow: String,
        active: bool,
    },

    /// Remote ICE candidates for a flow.
    #[serde(rename = "call.remote-candidates-add")]
    CandidatesAdd {
        conversation: String,
        flow: String,
        candidates: Vec<RemoteCandidate>,
    },

    /// Updated remote ICE candidates for a flow.
    #[serde(rename = "call.remote-candidates-update")]
    CandidatesUpdate {
        conversation: String,
        flow: String,
        candidates: Vec<RemoteCandidate>,
    },

    /// A remote session description for a flow.
    #[serde(rename = "call.remote-sdp")]
    RemoteSdp {
        conversation: String,
        flow: String,
        state: SdpType,
        sdp: String,
    },
}

impl CallEvent {
    /// Decode an event from its JSON encoding.
    ///
    /// Returns `Ok(None)` when the payload is well-formed JSON but its
    /// `type` is not one of the six calling events, so the embedding
    /// event channel can route it elsewhere.
    pub fn decode(content: &str) -> Result<Option<CallEvent>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| EVENT_TYPES.contains(&t))
            .unwrap_or(false);
        if !known {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    /// Conversation id the event targets.
    pub fn conversation(&self) -> &str {
        match self {
            CallEvent::FlowAdd { conversation, .. }
            | CallEvent::FlowDelete { conversation, .. }
            | CallEvent::FlowActive { conversation, .. }
            | CallEvent::CandidatesAdd { conversation, .. }
            | CallEvent::CandidatesUpdate { conversation, .. }
            | CallEvent::RemoteSdp { conversation, .. } => conversation,
        }
    }

    /// Flow id the event targets; `None` for `flow-add`, which carries a
    /// flow list instead.
    pub fn flow(&self) -> Option<&str> {
        match self {
            CallEvent::FlowAdd { .. } => None,
            CallEvent::FlowDelete { flow, .. }
            | CallEvent::FlowActive { flow, .. }
            | CallEvent::CandidatesAdd { flow, .. }
            | CallEvent::CandidatesUpdate { flow, .. }
            | CallEvent::RemoteSdp { flow, .. } => Some(flow),
        }
    }

    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            CallEvent::FlowAdd { .. } => EVENT_TYPES[0],
            CallEvent::FlowDelete { .. } => EVENT_TYPES[1],
            CallEvent::FlowActive { .. } => EVENT_TYPES[2],
            CallEvent::CandidatesAdd { .. } => EVENT_TYPES[3],
            CallEvent::CandidatesUpdate { .. } => EVENT_TYPES[4],
            CallEvent::RemoteSdp { .. } => EVENT_TYPES[5],
        }
    }
}
