//! The media flow interface.
//!
//! A media flow is one ICE/DTLS/SRTP session towards one remote
//! participant. The calling core drives it through [`MediaFlow`] and
//! receives its asynchronous callbacks as [`MediaFlowEvent`] values pushed
//! into the sink supplied at creation, so all state transitions are
//! observed on the owning event loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::codec::CodecSpec;
use crate::dtls::DtlsIdentity;
use crate::error::Result;

/// Opaque handle of an audio encoder inside the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderHandle(pub u64);

/// Opaque handle of an audio decoder inside the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderHandle(pub u64);

/// Asynchronous notifications of a media flow.
#[derive(Debug, Clone)]
pub enum MediaFlowEvent {
    /// ICE candidate gathering finished.
    GatherComplete,

    /// ICE (and DTLS) completed; media can flow.
    IceEstablished {
        crypto: String,
        codec: String,
        local_cand: String,
        remote_cand: String,
        peer: Option<SocketAddr>,
    },

    /// Incoming RTP started or stopped.
    RtpStart { started: bool, video: bool },

    /// An RTP packet was received; used to re-arm the RTP timeout.
    RtpActivity,

    /// The flow closed. `error` is `Some` for an abnormal close.
    Closed { error: Option<String> },
}

/// Receiver of a flow's events; implemented by the owning flow manager.
pub trait MediaFlowSink: Send + Sync {
    fn deliver(&self, event: MediaFlowEvent);
}

/// One local network interface, as enumerated by the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub addr: IpAddr,
    pub loopback: bool,
    pub link_local: bool,
}

/// Parameters for creating a media flow.
pub struct MediaFlowParams {
    pub dtls: Arc<DtlsIdentity>,
    pub audio_codecs: Vec<CodecSpec>,
    pub local_addr: IpAddr,
    pub loopback: bool,
    pub sink: Arc<dyn MediaFlowSink>,
}

/// One ICE/DTLS/SRTP session. All methods are called on the event loop.
pub trait MediaFlow: Send {
    /// Produce the local offer. Requires gathering to be complete.
    fn generate_offer(&mut self) -> Result<String>;

    /// Produce the local answer to a previously handled offer.
    fn generate_answer(&mut self) -> Result<String>;

    /// Apply a remote offer.
    fn handle_offer(&mut self, sdp: &str) -> Result<()>;

    /// Apply a remote answer.
    fn handle_answer(&mut self, sdp: &str) -> Result<()>;

    /// Add one remote ICE candidate.
    fn add_remote_candidate(&mut self, sdp: &str, mid: &str, mline_index: u32) -> Result<()>;

    fn start_ice(&mut self) -> Result<()>;
    fn start_media(&mut self) -> Result<()>;
    fn stop_media(&mut self);
    fn hold_media(&mut self, hold: bool);

    fn is_gathered(&self) -> bool;
    fn sdp_is_complete(&self) -> bool;

    /// Forget local and remote descriptions, keeping transport state.
    fn reset_sdp_state(&mut self);

    /// Reset the media path (used by in-place stream changes).
    fn reset_media(&mut self);

    fn dtls_ready(&self) -> bool;
    fn ice_ready(&self) -> bool;

    fn encoder(&self) -> Option<EncoderHandle>;
    fn decoder(&self) -> Option<DecoderHandle>;

    /// Current input/output audio levels in `[0.0, 1.0]`, when media runs.
    fn audio_levels(&self) -> Option<(f32, f32)>;

    fn enable_privacy(&mut self, enable: bool);

    /// Add video media lines with the given codecs.
    fn add_video(&mut self, codecs: &[CodecSpec]) -> Result<()>;

    fn add_local_host_candidate(&mut self, ifname: &str, addr: IpAddr) -> Result<()>;

    fn gather_stun(&mut self, host: &str, port: u16) -> Result<()>;
    fn gather_turn(&mut self, host: &str, port: u16, username: &str, credential: &str)
        -> Result<()>;
    fn gather_turn_tcp(
        &mut self,
        host: &str,
        port: u16,
        username: &str,
        credential: &str,
        secure: bool,
    ) -> Result<()>;

    /// Short tag used in logs to identify the flow.
    fn set_tag(&mut self, tag: &str);
}

/// Factory and platform surface of the concrete media implementation.
pub trait MediaEngine: Send + Sync {
    /// Engine name, used for logging and registry seeding.
    fn name(&self) -> &str;

    /// Audio codecs the engine can run, in preference order.
    fn audio_codecs(&self) -> Vec<CodecSpec>;

    /// Video codecs the engine can run; empty when video is unavailable.
    fn video_codecs(&self) -> Vec<CodecSpec>;

    /// Local network interfaces usable for host candidates.
    fn interfaces(&self) -> Vec<NetInterface>;

    /// Create a new media flow.
    fn create_flow(&self, params: MediaFlowParams) -> Result<Box<dyn MediaFlow>>;

    /// Inform the engine of the active conference decoders, in
    /// positional order, for spatial mixing.
    fn update_conference(&self, decoders: &[DecoderHandle]);
}
