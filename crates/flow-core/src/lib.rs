//! Flow manager for the driftwave calling core.
//!
//! The flow manager owns the life cycle of the media flows of every
//! active conversation: it consumes signalling events and REST responses
//! from the backend, drives SDP offer/answer negotiation and ICE
//! gathering through the media subsystem, and reports media category
//! transitions to the application.
//!
//! # Architecture
//!
//! All state lives on a single event-loop task. The public
//! [`FlowManager`] handle marshals every operation onto that task
//! through a typed command channel and awaits its completion, so the API
//! may be used from any thread or task with identical behaviour. Media
//! flows report their asynchronous progress (gathering, ICE, RTP, close)
//! as events into the same loop.
//!
//! The application plugs in two interfaces: a [`RequestTransport`] that
//! performs the outbound REST requests, and a [`FlowManagerObserver`]
//! that receives category changes, volume samples, conference order
//! updates and errors.

mod call;
mod command;
mod config;
mod engine;
mod flow;
mod metrics;
mod rr;
mod state;
mod userflow;

pub mod error;
pub mod handlers;
pub mod manager;
pub mod types;

pub use error::{FlowError, Result};
pub use handlers::{FlowManagerObserver, Method, OutboundRequest, RequestTransport};
pub use manager::FlowManager;
pub use rr::RrId;
pub use types::{EstabMask, MediaCategory};
pub use userflow::{SignalState, UserflowState};
