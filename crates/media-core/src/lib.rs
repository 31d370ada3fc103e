//! Process-wide media subsystem for the driftwave calling core.
//!
//! This crate owns everything that is shared by every flow manager in the
//! process: the lazily created [`MediaSystem`] singleton (DTLS identity,
//! codec registries, global media flags, current call configuration), the
//! [`MediaFlow`] trait through which the calling core drives an
//! ICE/DTLS/SRTP session, the [`MediaEngine`] factory that produces flows,
//! the KASE channel-binding primitive, and conference positioning.
//!
//! The concrete media engine (codecs, sockets, devices) lives outside this
//! workspace; it is plugged in through [`MediaEngine`] when the media
//! system is created.

pub mod codec;
pub mod conference;
pub mod dtls;
pub mod error;
pub mod flow;
pub mod kase;
pub mod system;

pub use codec::{CodecRegistry, CodecSpec};
pub use conference::{ConfPart, ConferenceRoster};
pub use dtls::{DtlsIdentity, DTLS_CIPHER_SUITES, SRTP_PROFILE};
pub use error::{MediaError, Result};
pub use flow::{
    DecoderHandle, EncoderHandle, MediaEngine, MediaFlow, MediaFlowEvent, MediaFlowParams,
    MediaFlowSink, NetInterface,
};
pub use system::{IceServer, MediaSystem, MediaSystemConfig};
