//! Typed wire surface of the calling backend.
//!
//! This crate owns every JSON fragment exchanged with the backend: the six
//! `call.*` signalling events delivered over the event channel, the REST
//! request/response bodies, the REST path grammar, and the `stun:`/`turn:`
//! URI syntax used in the call configuration. Everything is decoded once at
//! the boundary into typed values; no other crate touches raw JSON keys.

pub mod events;
pub mod ice;
pub mod paths;
pub mod rest;

pub use events::CallEvent;
pub use ice::{IceScheme, IceTransport, IceUri, IceUriError};
pub use paths::DeleteReason;
pub use rest::{
    CallConfig, Creator, FlowEntry, FlowsResponse, IceServerEntry, LocalSdp, PostFlowsBody,
    RemoteCandidate, SdpType, CONTENT_TYPE_JSON, SDP_STEP_PENDING,
};
