//! Per-remote-participant negotiation state.
//!
//! A userflow owns the media flow towards one remote user and the SDP
//! offer/answer state driving it. It exists independently of flows: it is
//! created when a participant is first seen and bound to at most one flow
//! at any time.

use driftwave_backend_api::{IceScheme, IceTransport, SdpType};
use driftwave_media_core::{MediaFlow, MediaFlowParams};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::engine::EngineSink;
use crate::error::{FlowError, Result};
use crate::state::Ctx;

/// Negotiation sub-state, driving what happens when an SDP is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserflowState {
    Idle,
    /// The local SDP goes into the flows POST.
    Post,
    /// The media flow is being re-created; the SDP is PUT when ready.
    Restart,
    /// A remote offer waits for gathering before it can be answered.
    Answer,
    /// An offer is wanted; the SDP is PUT when ready.
    Offer,
}

impl UserflowState {
    pub fn name(&self) -> &'static str {
        match self {
            UserflowState::Idle => "Idle",
            UserflowState::Post => "Post",
            UserflowState::Restart => "Restart",
            UserflowState::Answer => "Answer",
            UserflowState::Offer => "Offer",
        }
    }
}

/// SDP signalling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl SignalState {
    pub fn name(&self) -> &'static str {
        match self {
            SignalState::Stable => "Stable",
            SignalState::HaveLocalOffer => "Local offer",
            SignalState::HaveRemoteOffer => "Remote offer",
        }
    }
}

/// Negotiation state machine and media flow for one remote user.
pub(crate) struct Userflow {
    pub user_id: String,
    pub display_name: Option<String>,
    pub state: UserflowState,
    pub signal_state: SignalState,
    /// Last locally generated SDP, for the flows POST body.
    pub sdp_type: Option<SdpType>,
    pub sdp: Option<String>,
    pub sdp_ready: bool,
    /// Offer generation deferred until gathering completes.
    pub async_offer: bool,
    /// Answer generation deferred until gathering completes.
    pub async_answer: bool,
    pub mediaflow: Option<Box<dyn MediaFlow>>,
    /// The single flow currently bound to this userflow.
    pub flow_id: Option<String>,
    /// Number of usable interfaces found at media flow creation.
    pub num_if: u32,
}

impl Userflow {
    pub fn new(user_id: &str, display_name: Option<&str>) -> Userflow {
        Userflow {
            user_id: user_id.to_string(),
            display_name: display_name.map(str::to_string),
            state: UserflowState::Idle,
            signal_state: SignalState::Stable,
            sdp_type: None,
            sdp: None,
            sdp_ready: false,
            async_offer: false,
            async_answer: false,
            mediaflow: None,
            flow_id: None,
            num_if: 0,
        }
    }

    pub fn set_signal_state(&mut self, state: SignalState) {
        tracing::info!(
            user_id = %self.user_id,
            from = self.signal_state.name(),
            to = state.name(),
            "userflow signal state"
        );
        self.signal_state = state;
    }

    pub fn mediaflow(&self) -> Option<&dyn MediaFlow> {
        self.mediaflow.as_deref()
    }

    pub fn mediaflow_mut(&mut self) -> Result<&mut (dyn MediaFlow + '_)> {
        match self.mediaflow.as_deref_mut() {
            Some(m) => Ok(m),
            None => Err(FlowError::MediaFailed("mediaflow missing".to_string())),
        }
    }

    pub fn is_gathered(&self) -> bool {
        self.mediaflow().map(|m| m.is_gathered()).unwrap_or(false)
    }

    pub fn sdp_complete(&self) -> bool {
        self.mediaflow().map(|m| m.sdp_is_complete()).unwrap_or(false)
    }

    /// Record a locally generated description for PUT and POST bodies.
    pub fn store_local_sdp(&mut self, sdp_type: SdpType, sdp: &str) {
        self.sdp_type = Some(sdp_type);
        self.sdp = Some(sdp.to_string());
        self.sdp_ready = true;
    }

    pub fn release_mediaflow(&mut self) {
        self.mediaflow = None;
    }

    /// Create the media flow: local source address (IPv4 preferred, then
    /// IPv6, then loopback when enabled), privacy and loopback flags,
    /// host candidates for every usable interface, video codecs when the
    /// engine has them, and gathering against the current call
    /// configuration.
    pub fn alloc_mediaflow(&mut self, ctx: &Ctx, convid: &str) -> Result<()> {
        let engine = ctx.media.engine().clone();
        let bind_interface = ctx.media.bind_interface();

        let usable: Vec<_> = engine
            .interfaces()
            .into_iter()
            .filter(|iface| !iface.loopback && !iface.link_local)
            .filter(|iface| match &bind_interface {
                Some(name) => iface.name.eq_ignore_ascii_case(name),
                None => true,
            })
            .collect();

        let local_addr = usable
            .iter()
            .find(|iface| iface.addr.is_ipv4())
            .or_else(|| usable.iter().find(|iface| iface.addr.is_ipv6()))
            .map(|iface| iface.addr)
            .or_else(|| {
                ctx.media
                    .loopback()
                    .then_some(IpAddr::V4(Ipv4Addr::LOCALHOST))
            })
            .ok_or(FlowError::NoLocalAddress)?;

        let params = MediaFlowParams {
            dtls: ctx.media.dtls(),
            audio_codecs: ctx.media.audio_codecs().as_slice().to_vec(),
            local_addr,
            loopback: ctx.media.loopback(),
            sink: Arc::new(EngineSink::new(
                ctx.events_tx.clone(),
                convid,
                &self.user_id,
            )),
        };
        let mut mediaflow = engine.create_flow(params)?;

        if ctx.media.privacy() {
            tracing::info!("enabling mediaflow privacy");
            mediaflow.enable_privacy(true);
        }

        let video = ctx.media.video_codecs();
        if !video.is_empty() {
            mediaflow.add_video(video.as_slice())?;
        }

        self.num_if = 0;
        for iface in &usable {
            match mediaflow.add_local_host_candidate(&iface.name, iface.addr) {
                Ok(()) => self.num_if += 1,
                Err(e) => tracing::warn!(
                    iface = %iface.name,
                    addr = %iface.addr,
                    error = %e,
                    "failed to add local host candidate"
                ),
            }
        }
        tracing::info!(user_id = %self.user_id, interfaces = self.num_if, "local interfaces added");

        if self.num_if == 0 {
            if ctx.media.loopback() {
                let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
                if let Err(e) = mediaflow.add_local_host_candidate("lo0", lo) {
                    tracing::warn!(error = %e, "failed to add loopback candidate");
                }
            } else {
                tracing::warn!("no usable interfaces added");
            }
        }

        self.mediaflow = Some(mediaflow);
        self.update_config(ctx);
        Ok(())
    }

    /// Apply the current call configuration: schedule STUN and TURN
    /// gathering on the media flow. Individual server failures are
    /// logged and skipped.
    pub fn update_config(&mut self, ctx: &Ctx) {
        let servers = ctx.config.servers.clone();
        if servers.is_empty() {
            tracing::info!(user_id = %self.user_id, "no ice servers configured");
            return;
        }
        let Some(mediaflow) = self.mediaflow.as_deref_mut() else {
            return;
        };

        for server in &servers {
            let result = match server.scheme {
                IceScheme::Stun => mediaflow.gather_stun(&server.host, server.port),
                IceScheme::Turn => {
                    let (Some(username), Some(credential)) =
                        (server.username.as_deref(), server.credential.as_deref())
                    else {
                        tracing::warn!(
                            host = %server.host,
                            "turn server without credentials skipped"
                        );
                        continue;
                    };
                    match server.transport {
                        IceTransport::Udp => {
                            mediaflow.gather_turn(&server.host, server.port, username, credential)
                        }
                        IceTransport::Tcp => mediaflow.gather_turn_tcp(
                            &server.host,
                            server.port,
                            username,
                            credential,
                            false,
                        ),
                        IceTransport::Tls => mediaflow.gather_turn_tcp(
                            &server.host,
                            server.port,
                            username,
                            credential,
                            true,
                        ),
                    }
                }
            };
            if let Err(e) = result {
                tracing::warn!(host = %server.host, error = %e, "failed to add ice server");
            }
        }
    }

    pub fn debug_line(&self) -> String {
        format!(
            "<{}> signal=({}) state={} sdp='{}' ready={} name=\"{}\"",
            self.user_id,
            self.signal_state.name(),
            self.state.name(),
            self.sdp_type.map(|t| t.as_str()).unwrap_or("none"),
            self.sdp_ready,
            self.display_name.as_deref().unwrap_or(""),
        )
    }
}
