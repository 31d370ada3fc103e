//! Per-flow state.
//!
//! A flow is one backend-assigned RTP stream between the local endpoint
//! and one remote participant. The flow tracks its establishment bitmask,
//! candidates received before the SDP, and the statistics reported in the
//! call metrics. All cross-object behaviour (negotiation, activation,
//! teardown) lives on [`Call`](crate::call::Call), which owns the flow.

use std::time::{Duration, Instant};

use driftwave_backend_api::RemoteCandidate;

use crate::error::FlowError;
use crate::types::EstabMask;

/// RTP silence tolerated before an interruption is reported; a second
/// expiry deletes the flow.
pub(crate) const RTP_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection statistics captured when the media flow establishes.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlowStats {
    pub estab_time_ms: u64,
    pub local_cand: String,
    pub remote_cand: String,
    pub codec: String,
    pub crypto: String,
}

/// One RTP stream on a call.
pub(crate) struct Flow {
    pub flowid: String,
    /// User id of the far end; also the key of the owning userflow.
    pub remote_id: String,
    /// We initiated the offer for this flow.
    pub creator: bool,
    /// A delete was issued or received; suppresses further deletes.
    pub deleted: bool,
    /// Raw backend active flag.
    pub active: bool,
    /// Allocation index within the call, used as the media flow tag.
    pub ix: u32,
    pub err: Option<FlowError>,
    pub est_st: EstabMask,
    pub got_sdp: bool,
    /// Remote candidates queued until the SDP arrives.
    pub pending_cands: Vec<RemoteCandidate>,
    /// The media flow established at least once.
    pub estab: bool,
    /// Volume sampling reports this flow.
    pub volume_on: bool,
    /// An RTP interruption has been reported and not yet recovered.
    pub interrupted: bool,
    pub start_ts: Instant,
    pub estab_ts: Option<Instant>,
    /// Deadline of the RTP watchdog, armed while media is expected.
    pub rtp_deadline: Option<Instant>,
    pub stats: FlowStats,
}

impl Flow {
    pub fn new(flowid: &str, remote_id: &str, creator: bool, ix: u32) -> Flow {
        Flow {
            flowid: flowid.to_string(),
            remote_id: remote_id.to_string(),
            creator,
            deleted: false,
            active: false,
            ix,
            err: None,
            est_st: EstabMask::NONE,
            got_sdp: false,
            pending_cands: Vec::new(),
            estab: false,
            volume_on: false,
            interrupted: false,
            start_ts: Instant::now(),
            estab_ts: None,
            rtp_deadline: None,
            stats: FlowStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.est_st.contains(EstabMask::ACTIVE)
    }

    pub fn is_good(&self) -> bool {
        self.err.is_none()
    }

    /// Arm (or re-arm) the RTP watchdog.
    pub fn arm_rtp_watchdog(&mut self) {
        self.rtp_deadline = Some(Instant::now() + RTP_TIMEOUT);
    }

    pub fn disarm_rtp_watchdog(&mut self) {
        self.rtp_deadline = None;
    }

    /// Per-flow metrics fragment; only meaningful once established.
    pub fn stats_json(&self) -> serde_json::Value {
        let media_time_ms = self
            .estab_ts
            .map(|ts| ts.elapsed().as_millis() as u64)
            .unwrap_or(0);
        serde_json::json!({
            "estab_time": self.stats.estab_time_ms,
            "local_candidate": self.stats.local_cand,
            "remote_candidate": self.stats.remote_cand,
            "media_time": media_time_ms,
            "codec": self.stats.codec,
            "crypto": self.stats.crypto,
        })
    }

    pub fn debug_line(&self) -> String {
        let mut line = format!(
            "ix={:2}: flowid={} |{}{}{}{}| {} remote_user={}",
            self.ix,
            self.flowid,
            if self.creator { 'C' } else { ' ' },
            if self.deleted { 'D' } else { ' ' },
            if self.active { 'A' } else { ' ' },
            if self.estab { 'E' } else { ' ' },
            self.est_st.name(),
            self.remote_id,
        );
        if let Some(err) = &self.err {
            line.push_str(&format!(" (error={err})"));
        }
        line
    }
}
