//! Per-conversation call state.
//!
//! A call owns its flows and userflows through two id-keyed maps; a flow
//! references its userflow by remote user id and a userflow references
//! its flow by flow id, both resolved through these maps. Every method
//! runs on the event-loop task.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use driftwave_backend_api::{
    paths, Creator, DeleteReason, FlowEntry, LocalSdp, PostFlowsBody, RemoteCandidate, SdpType,
};
use serde_json::json;

use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::handlers::Method;
use crate::rr::{RrId, RrKind};
use crate::state::Ctx;
use crate::types::{EstabMask, MediaCategory};
use crate::userflow::{SignalState, Userflow, UserflowState};

pub(crate) struct Call {
    pub convid: String,
    pub sessid: Option<String>,
    pub mcat: MediaCategory,
    /// A category change was raised and not yet committed.
    pub catchg_pending: bool,
    /// Monotonic flow index counter.
    pub ix_ctr: u32,
    pub flows: HashMap<String, Flow>,
    pub users: HashMap<String, Userflow>,
    pub conf_parts: driftwave_media_core::ConferenceRoster,
    /// Outstanding requests owned by this call.
    pub rrs: HashSet<RrId>,
    /// Outstanding ghost-flow deletions; the flows POST is repeated when
    /// the last one completes.
    pub ghosts: usize,
    pub start_ts: Instant,
    pub rtp_start_ts: Option<Instant>,
    pub rtp_started: bool,
    pub is_mestab: bool,
    pub active: bool,
}

impl Call {
    pub fn new(convid: &str) -> Call {
        tracing::debug!(convid, "call allocated");
        Call {
            convid: convid.to_string(),
            sessid: None,
            mcat: MediaCategory::Normal,
            catchg_pending: false,
            ix_ctr: 0,
            flows: HashMap::new(),
            users: HashMap::new(),
            conf_parts: Default::default(),
            rrs: HashSet::new(),
            ghosts: 0,
            start_ts: Instant::now(),
            rtp_start_ts: None,
            rtp_started: false,
            is_mestab: false,
            active: false,
        }
    }

    // ---- simple accessors ----------------------------------------------

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn set_sessid(&mut self, sessid: &str) {
        if self.sessid.is_none() {
            tracing::info!(convid = %self.convid, sessid, "session id set");
        }
        self.sessid = Some(sessid.to_string());
    }

    pub fn sessid(&self) -> &str {
        self.sessid.as_deref().unwrap_or("0000")
    }

    pub fn has_good_flow(&self) -> bool {
        self.flows.values().any(|f| f.is_good())
    }

    pub fn count_active_flows(&self) -> usize {
        self.flows.values().filter(|f| f.is_active()).count()
    }

    pub fn is_multiparty(&self) -> bool {
        self.count_active_flows() > 1
    }

    /// Highest establishment mask across all flows.
    fn best_est(&self) -> Option<EstabMask> {
        self.flows.values().map(|f| f.est_st).max_by_key(|m| m.bits())
    }

    /// Any flow has fully established media.
    pub fn has_established_flow(&self) -> bool {
        self.flows
            .values()
            .any(|f| f.est_st.contains(EstabMask::MEDIA))
    }

    // ---- userflow management -------------------------------------------

    /// Idempotent create-or-get of the userflow for one remote user.
    /// Returns whether a new userflow was allocated.
    pub fn userflow_lookup_alloc(
        &mut self,
        ctx: &mut Ctx,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<bool> {
        if self.users.contains_key(user_id) {
            return Ok(false);
        }
        let mut uf = Userflow::new(user_id, name);
        uf.alloc_mediaflow(ctx, &self.convid)?;
        self.users.insert(user_id.to_string(), uf);
        Ok(true)
    }

    /// Drop every userflow with no bound flow; run after a flows POST
    /// response has settled the flow list.
    pub fn purge_users(&mut self) {
        self.users.retain(|user_id, uf| {
            if uf.flow_id.is_none() {
                tracing::info!(user_id, "purging unbound userflow");
                false
            } else {
                true
            }
        });
    }

    fn bind_userflow(&mut self, user_id: &str, flowid: &str) {
        if let Some(uf) = self.users.get_mut(user_id) {
            if let Some(prev) = &uf.flow_id {
                if prev != flowid {
                    tracing::warn!(user_id, prev = %prev, new = flowid, "userflow rebound");
                }
            }
            uf.flow_id = Some(flowid.to_string());
        }
    }

    pub fn set_userflow_state(&mut self, ctx: &mut Ctx, user_id: &str, state: UserflowState) {
        let changed = {
            let Some(uf) = self.users.get_mut(user_id) else {
                return;
            };
            if uf.state == state {
                false
            } else {
                tracing::info!(user_id, from = uf.state.name(), to = state.name(), "userflow state");
                uf.state = state;
                match state {
                    UserflowState::Idle => uf.sdp_ready = false,
                    UserflowState::Answer => uf.async_answer = true,
                    _ => {}
                }
                true
            }
        };
        if changed && state == UserflowState::Post {
            self.check_and_post(ctx);
        }
    }

    // ---- negotiation ---------------------------------------------------

    /// Produce an offer for one userflow, or defer it until gathering
    /// completes.
    pub fn generate_offer(&mut self, ctx: &mut Ctx, user_id: &str) -> Result<()> {
        let (state, flow_id, offer) = {
            let uf = self
                .users
                .get_mut(user_id)
                .ok_or(FlowError::NotFound("userflow"))?;
            tracing::info!(
                user_id,
                signal = uf.signal_state.name(),
                gathered = uf.is_gathered(),
                "generate offer"
            );
            if uf.signal_state != SignalState::Stable {
                return Ok(());
            }
            if !uf.is_gathered() {
                uf.async_offer = true;
                return Ok(());
            }
            let offer = uf
                .mediaflow_mut()?
                .generate_offer()
                .map_err(|e| FlowError::Protocol(format!("offer generation failed: {e}")))?;
            uf.store_local_sdp(SdpType::Offer, &offer);
            uf.set_signal_state(SignalState::HaveLocalOffer);
            (uf.state, uf.flow_id.clone(), offer)
        };

        match state {
            UserflowState::Post => self.check_and_post(ctx),
            UserflowState::Offer | UserflowState::Restart => {
                if let Some(flowid) = flow_id {
                    self.put_local_sdp(ctx, &flowid, SdpType::Offer, &offer);
                    self.set_userflow_state(ctx, user_id, UserflowState::Idle);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Consume a remote offer (`None` re-runs acceptance for an offer
    /// already applied to the media flow). Handles offer glare: on a
    /// simultaneous offer the lexicographically greater user id wins and
    /// ignores the incoming offer, the loser resets its SDP state and
    /// accepts.
    pub fn userflow_accept(
        &mut self,
        ctx: &mut Ctx,
        user_id: &str,
        remote_sdp: Option<&str>,
    ) -> Result<()> {
        let self_id = ctx.self_user_id.clone().unwrap_or_default();
        {
            let uf = self
                .users
                .get_mut(user_id)
                .ok_or(FlowError::NotFound("userflow"))?;
            if uf.flow_id.is_none() {
                return Err(FlowError::InvalidArgument("userflow has no flow"));
            }
            if let Some(sdp) = remote_sdp {
                match uf.signal_state {
                    SignalState::HaveLocalOffer => {
                        if self_id.as_str() > user_id {
                            tracing::info!(remote = user_id, "sdp conflict detected, winning");
                            return Ok(());
                        }
                        tracing::info!(remote = user_id, "sdp conflict detected, losing");
                        uf.mediaflow_mut()?.reset_sdp_state();
                    }
                    SignalState::HaveRemoteOffer => {
                        tracing::warn!(remote = user_id, "offer in remote-offer state ignored");
                        return Ok(());
                    }
                    SignalState::Stable => {}
                }
                uf.set_signal_state(SignalState::HaveRemoteOffer);
                uf.mediaflow_mut()?.handle_offer(sdp)?;
            }
        }

        tracing::info!(convid = %self.convid, user_id, active = self.active, "userflow accept");
        if !self.active {
            return Ok(());
        }

        let gathered = self
            .users
            .get(user_id)
            .map(|u| u.is_gathered())
            .unwrap_or(false);
        if gathered {
            let (answer, flow_id, was_post) = {
                let uf = self
                    .users
                    .get_mut(user_id)
                    .ok_or(FlowError::NotFound("userflow"))?;
                let answer = uf
                    .mediaflow_mut()?
                    .generate_answer()
                    .map_err(|e| FlowError::Protocol(format!("answer generation failed: {e}")))?;
                uf.store_local_sdp(SdpType::Answer, &answer);
                (answer, uf.flow_id.clone(), uf.state == UserflowState::Post)
            };
            if let Some(flowid) = flow_id {
                self.put_local_sdp(ctx, &flowid, SdpType::Answer, &answer);
            }
            if was_post {
                self.check_and_post(ctx);
                self.set_userflow_state(ctx, user_id, UserflowState::Idle);
            }
            if let Some(uf) = self.users.get_mut(user_id) {
                uf.set_signal_state(SignalState::Stable);
            }
        } else {
            tracing::info!(user_id, "mediaflow not gathered, deferring answer");
            if let Some(uf) = self.users.get_mut(user_id) {
                uf.async_answer = true;
            }
            self.set_userflow_state(ctx, user_id, UserflowState::Answer);
        }

        if let Some(uf) = self.users.get_mut(user_id) {
            if let Ok(mf) = uf.mediaflow_mut() {
                if let Err(e) = mf.start_ice() {
                    tracing::warn!(error = %e, "start ice failed");
                }
            }
        }
        Ok(())
    }

    /// Consume a remote answer.
    pub fn userflow_update(&mut self, user_id: &str, sdp: &str) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let uf = self
            .users
            .get_mut(user_id)
            .ok_or(FlowError::NotFound("userflow"))?;
        if uf.flow_id.is_none() {
            return Err(FlowError::InvalidArgument("userflow has no flow"));
        }
        if uf.signal_state != SignalState::HaveLocalOffer {
            tracing::warn!(
                user_id,
                signal = uf.signal_state.name(),
                "answer in wrong signal state"
            );
            return Err(FlowError::Already);
        }
        uf.mediaflow_mut()?.handle_answer(sdp)?;
        if let Err(e) = uf.mediaflow_mut()?.start_ice() {
            tracing::warn!(error = %e, "start ice failed");
        }
        uf.set_signal_state(SignalState::Stable);
        Ok(())
    }

    /// Gathering finished on one userflow: run the deferred offer or
    /// answer.
    pub fn gather_complete(&mut self, ctx: &mut Ctx, user_id: &str) {
        let (async_offer, async_answer) = match self.users.get(user_id) {
            Some(uf) => (uf.async_offer, uf.async_answer),
            None => return,
        };
        tracing::info!(user_id, async_offer, async_answer, "gather complete");

        if async_offer {
            if let Err(e) = self.generate_offer(ctx, user_id) {
                tracing::warn!(error = %e, "deferred offer failed");
            }
            if let Some(uf) = self.users.get_mut(user_id) {
                uf.async_offer = false;
            }
        }

        if async_answer {
            let produced: Result<(String, Option<String>, UserflowState)> = (|| {
                let uf = self
                    .users
                    .get_mut(user_id)
                    .ok_or(FlowError::NotFound("userflow"))?;
                let answer = uf
                    .mediaflow_mut()?
                    .generate_answer()
                    .map_err(|e| FlowError::Protocol(format!("answer generation failed: {e}")))?;
                uf.store_local_sdp(SdpType::Answer, &answer);
                uf.set_signal_state(SignalState::Stable);
                Ok((answer, uf.flow_id.clone(), uf.state))
            })();
            match produced {
                Ok((answer, flow_id, state)) => match state {
                    UserflowState::Post => self.check_and_post(ctx),
                    UserflowState::Answer | UserflowState::Restart => {
                        if let Some(flowid) = flow_id {
                            self.put_local_sdp(ctx, &flowid, SdpType::Answer, &answer);
                            self.set_userflow_state(ctx, user_id, UserflowState::Idle);
                        }
                    }
                    _ => {}
                },
                Err(e) => tracing::warn!(error = %e, "deferred answer failed"),
            }
            if let Some(uf) = self.users.get_mut(user_id) {
                uf.async_answer = false;
            }
        }
    }

    // ---- flows POST ----------------------------------------------------

    /// Issue the flows POST: `flows/v2` with the collected descriptions
    /// when any userflow has a ready SDP, the plain `flows` path with no
    /// body otherwise.
    pub fn post_flows(&mut self, ctx: &mut Ctx) -> Result<()> {
        let body = self.userflow_sdp_body();
        let path = if body.is_some() {
            paths::flows_v2(&self.convid)
        } else {
            paths::flows(&self.convid)
        };
        let rr = ctx.send_request(
            Some(&self.convid),
            Some(RrKind::PostFlows),
            Method::Post,
            path,
            body,
        )?;
        if let Some(rr) = rr {
            self.rrs.insert(rr);
        }
        Ok(())
    }

    fn userflow_sdp_body(&self) -> Option<serde_json::Value> {
        let mut body = PostFlowsBody::default();
        for uf in self.users.values() {
            if !uf.sdp_ready {
                continue;
            }
            let (Some(sdp_type), Some(sdp)) = (uf.sdp_type, uf.sdp.as_ref()) else {
                continue;
            };
            if sdp.is_empty() {
                continue;
            }
            body.sdp.insert(
                uf.user_id.clone(),
                LocalSdp {
                    sdp_type,
                    sdp: sdp.clone(),
                },
            );
        }
        if body.sdp.is_empty() {
            return None;
        }
        match serde_json::to_value(&body) {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(error = %e, "flows post body encoding failed");
                None
            }
        }
    }

    /// PUT the local description of one flow to the backend. A transport
    /// failure here is flow-fatal.
    fn put_local_sdp(&mut self, ctx: &mut Ctx, flowid: &str, sdp_type: SdpType, sdp: &str) {
        let body = LocalSdp {
            sdp_type,
            sdp: sdp.to_string(),
        };
        let body = match serde_json::to_value(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "local sdp body encoding failed");
                return;
            }
        };
        tracing::info!(
            convid = %self.convid,
            flowid,
            sdp_type = sdp_type.as_str(),
            "local sdp request"
        );
        let path = paths::local_sdp(&self.convid, flowid);
        match ctx.send_request(
            Some(&self.convid),
            Some(RrKind::LocalSdp {
                flowid: flowid.to_string(),
            }),
            Method::Put,
            path,
            Some(body),
        ) {
            Ok(Some(rr)) => {
                self.rrs.insert(rr);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "local sdp request failed");
                self.flow_error(ctx, flowid, e);
            }
        }
    }

    /// Kick off the flows POST. With no known users the POST goes out
    /// immediately; otherwise every stable userflow is driven to produce
    /// its description and the POST fires once all of them are ready.
    pub fn start_post(&mut self, ctx: &mut Ctx) -> Result<()> {
        tracing::info!(convid = %self.convid, users = self.users.len(), "posting for flows");
        if self.users.is_empty() {
            return self.post_flows(ctx);
        }

        let user_ids: Vec<String> = self.users.keys().cloned().collect();
        for user_id in &user_ids {
            let signal = match self.users.get(user_id) {
                Some(uf) => uf.signal_state,
                None => continue,
            };
            if signal == SignalState::Stable {
                self.set_userflow_state(ctx, user_id, UserflowState::Post);
            }
        }
        for user_id in &user_ids {
            let (complete, signal) = match self.users.get(user_id) {
                Some(uf) => (uf.sdp_complete(), uf.signal_state),
                None => continue,
            };
            if complete {
                tracing::info!(user_id, signal = signal.name(), "mediaflow already has SDP");
                continue;
            }
            match signal {
                SignalState::Stable => {
                    self.set_userflow_state(ctx, user_id, UserflowState::Post);
                    if let Err(e) = self.generate_offer(ctx, user_id) {
                        tracing::warn!(error = %e, "offer for POST failed");
                    }
                }
                SignalState::HaveRemoteOffer => {
                    tracing::info!(user_id, "have remote offer, accepting");
                    if let Err(e) = self.userflow_accept(ctx, user_id, None) {
                        tracing::warn!(error = %e, "accept for POST failed");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-apply the call configuration to every userflow, then POST.
    /// Used for calls that waited for the configuration fetch.
    pub fn resume_post(&mut self, ctx: &mut Ctx) -> Result<()> {
        for uf in self.users.values_mut() {
            uf.update_config(ctx);
        }
        self.start_post(ctx)
    }

    /// POST once every userflow in POST state has produced its SDP, then
    /// return all userflows to idle.
    pub fn check_and_post(&mut self, ctx: &mut Ctx) {
        tracing::info!(
            convid = %self.convid,
            users = self.users.len(),
            flows = self.flows.len(),
            "check and post"
        );
        let blocked = self
            .users
            .values()
            .any(|uf| uf.state == UserflowState::Post && !uf.sdp_ready);
        if blocked {
            return;
        }
        if let Err(e) = self.post_flows(ctx) {
            tracing::warn!(error = %e, "flows post failed");
        }
        for uf in self.users.values_mut() {
            if uf.state != UserflowState::Idle {
                uf.state = UserflowState::Idle;
                uf.sdp_ready = false;
            }
        }
    }

    // ---- flow lifecycle ------------------------------------------------

    /// Add the flows of a POST response or a flow-add event.
    /// `default_creator` applies when the backend does not report a
    /// creator: flows from our own POST are ours, event-delivered flows
    /// are not. Ghost flows (negotiated but inactive) are deleted before
    /// any new flow is added. Returns the number of flows added.
    pub fn add_flow_entries(
        &mut self,
        ctx: &mut Ctx,
        entries: &[FlowEntry],
        default_creator: bool,
    ) -> Result<usize> {
        let mut adds: Vec<(&FlowEntry, bool)> = Vec::new();
        let mut ghosts: Vec<&str> = Vec::new();
        for entry in entries {
            if self.flows.contains_key(&entry.id) {
                tracing::info!(flowid = %entry.id, "flow already exists");
                continue;
            }
            let mut creator = match &entry.creator {
                Creator::Absent => default_creator,
                Creator::Ours => true,
                Creator::Peer(id) => entry
                    .remote_user
                    .as_deref()
                    .map(|remote| id != remote)
                    .unwrap_or(default_creator),
            };
            if !entry.sdp_step_is_pending() {
                if entry.active {
                    creator = false;
                } else {
                    tracing::info!(
                        flowid = %entry.id,
                        sdp_step = ?entry.sdp_step,
                        "ghost flow, deleting"
                    );
                    ghosts.push(&entry.id);
                    continue;
                }
            }
            adds.push((entry, creator));
        }

        let ghost_ids: Vec<String> = ghosts.iter().map(|s| s.to_string()).collect();
        for flowid in &ghost_ids {
            self.delete_ghost(ctx, flowid);
        }

        let mut added = 0;
        for (entry, creator) in adds {
            let remote = entry.remote_user.as_deref().ok_or_else(|| {
                FlowError::Protocol(format!("flow {} without remote_user", entry.id))
            })?;
            self.flow_alloc(ctx, &entry.id, remote, creator, entry.active)?;
            self.activate_flow(ctx, &entry.id, entry.active)?;
            added += 1;
        }
        Ok(added)
    }

    /// Allocate a flow, acquiring or reusing the userflow for its remote
    /// user. A newly allocated userflow on an active flow we created is
    /// driven straight to an offer.
    pub fn flow_alloc(
        &mut self,
        ctx: &mut Ctx,
        flowid: &str,
        remote_id: &str,
        creator: bool,
        active: bool,
    ) -> Result<()> {
        tracing::info!(
            convid = %self.convid,
            flowid,
            remote_id,
            creator,
            active,
            "allocating flow"
        );
        let allocated = self.userflow_lookup_alloc(ctx, remote_id, None)?;

        self.ix_ctr += 1;
        let ix = self.ix_ctr;
        self.flows
            .insert(flowid.to_string(), Flow::new(flowid, remote_id, creator, ix));
        self.bind_userflow(remote_id, flowid);
        if let Some(uf) = self.users.get_mut(remote_id) {
            if let Ok(mf) = uf.mediaflow_mut() {
                mf.set_tag(&ix.to_string());
            }
        }

        if active && allocated && creator {
            // A flow arrived for a user we had no userflow for; offer.
            self.set_userflow_state(ctx, remote_id, UserflowState::Offer);
            if let Err(e) = self.generate_offer(ctx, remote_id) {
                tracing::warn!(error = %e, "initial offer failed");
            }
        }
        Ok(())
    }

    /// Toggle the ACTIVE establishment bit.
    pub fn activate_flow(&mut self, ctx: &mut Ctx, flowid: &str, active: bool) -> Result<()> {
        let (prev_active, remote_id, creator) = {
            let flow = self
                .flows
                .get_mut(flowid)
                .ok_or(FlowError::NotFound("flow"))?;
            (flow.active, flow.remote_id.clone(), flow.creator)
        };
        tracing::info!(flowid, from = prev_active, to = active, "flow activate");
        if prev_active == active {
            return Ok(());
        }
        if let Some(flow) = self.flows.get_mut(flowid) {
            flow.active = active;
        }

        if active {
            if !self.active {
                tracing::info!(convid = %self.convid, flowid, "flow activates call");
                self.set_active(true);
            }
            self.bind_userflow(&remote_id, flowid);
            if creator {
                self.set_userflow_state(ctx, &remote_id, UserflowState::Offer);
                if let Err(e) = self.generate_offer(ctx, &remote_id) {
                    tracing::warn!(error = %e, "activation offer failed");
                }
            }
            if let Some(flow) = self.flows.get_mut(flowid) {
                flow.est_st.set(EstabMask::ACTIVE);
            }
        } else {
            if let Some(flow) = self.flows.get_mut(flowid) {
                flow.est_st.clear(EstabMask::ACTIVE);
            }
            self.remove_conf_part(ctx, &remote_id);
            self.mestab_check(ctx);
        }
        self.reestablish(ctx, flowid);
        Ok(())
    }

    /// Recompute the call's media category from the best flow's
    /// establishment mask and apply the result.
    pub fn reestablish(&mut self, ctx: &mut Ctx, flowid: &str) {
        let Some(flow) = self.flows.get(flowid) else {
            return;
        };
        let est = self.best_est().unwrap_or(flow.est_st);

        let (mcat, stop) = if est.contains(EstabMask::MEDIA) {
            (MediaCategory::Call, false)
        } else if est == EstabMask::ACTIVE {
            (MediaCategory::Active, true)
        } else if est == EstabMask::ICE {
            (MediaCategory::Hold, true)
        } else if est.contains(EstabMask::RTP) && est.contains(EstabMask::ACTIVE) {
            (self.mcat, false)
        } else {
            (MediaCategory::Normal, true)
        };
        if stop {
            self.stop_media_on(flowid);
        }
        if est.contains(EstabMask::RTP) {
            self.rtp_started_set(true);
        }

        tracing::info!(
            convid = %self.convid,
            flowid,
            est = %est,
            from = %self.mcat,
            to = %mcat,
            "establishment update"
        );
        if self.mcat == mcat {
            self.update_media(flowid);
        } else {
            self.mcat_change(ctx, mcat);
        }
    }

    /// Start, stop or hold media on one flow according to the committed
    /// category and the flow's establishment mask.
    pub fn update_media(&mut self, flowid: &str) {
        if self.catchg_pending {
            return;
        }
        let start = {
            let Some(flow) = self.flows.get_mut(flowid) else {
                return;
            };
            let start =
                self.mcat == MediaCategory::Call && flow.est_st.contains(EstabMask::MEDIA);
            flow.volume_on = start;
            if start {
                flow.arm_rtp_watchdog();
            }
            start
        };
        if start {
            let remote_id = match self.flows.get(flowid) {
                Some(flow) => flow.remote_id.clone(),
                None => return,
            };
            if let Some(uf) = self.users.get_mut(&remote_id) {
                if let Ok(mf) = uf.mediaflow_mut() {
                    if let Err(e) = mf.start_media() {
                        tracing::warn!(error = %e, "start media failed");
                    }
                }
            }
        } else {
            self.stop_media_on(flowid);
        }
    }

    fn stop_media_on(&mut self, flowid: &str) {
        let remote_id = {
            let Some(flow) = self.flows.get_mut(flowid) else {
                return;
            };
            flow.disarm_rtp_watchdog();
            flow.remote_id.clone()
        };
        let hold = self.mcat == MediaCategory::Hold;
        if let Some(uf) = self.users.get_mut(&remote_id) {
            if let Ok(mf) = uf.mediaflow_mut() {
                if hold {
                    mf.hold_media(true);
                } else {
                    mf.stop_media();
                }
            }
        }
    }

    /// Raise a category change towards the application; committed later
    /// through `mcat_changed`.
    pub fn mcat_change(&mut self, ctx: &mut Ctx, mcat: MediaCategory) {
        self.mcat = mcat;
        self.catchg_pending = true;
        ctx.observer.on_category_change(&self.convid, mcat);
    }

    /// Commit a category change and re-run media on every flow.
    pub fn mcat_changed(&mut self, mcat: MediaCategory) {
        tracing::info!(convid = %self.convid, from = %self.mcat, to = %mcat, "category committed");
        self.mcat = mcat;
        self.catchg_pending = false;
        let ids: Vec<String> = self.flows.keys().cloned().collect();
        for flowid in ids {
            self.update_media(&flowid);
        }
    }

    // ---- inbound event handlers ----------------------------------------

    /// Remote session description for one flow.
    pub fn sdp_event(
        &mut self,
        ctx: &mut Ctx,
        flowid: &str,
        state: SdpType,
        sdp: &str,
        replayed: bool,
    ) -> Result<()> {
        let remote_id = {
            let flow = self.flows.get(flowid).ok_or(FlowError::NotFound("flow"))?;
            flow.remote_id.clone()
        };
        let complete = self
            .users
            .get(&remote_id)
            .map(|u| u.sdp_complete())
            .unwrap_or(false);
        let is_offer = state == SdpType::Offer;
        tracing::debug!(flowid, state = state.as_str(), complete, "sdp event");

        let mut stream_change = false;
        if complete {
            if replayed {
                return Ok(());
            }
            stream_change = sdp.contains("x-streamchange");
            if stream_change {
                tracing::info!(flowid, "stream change requested");
                if let Some(uf) = self.users.get_mut(&remote_id) {
                    let mf = uf.mediaflow_mut()?;
                    mf.stop_media();
                    mf.reset_sdp_state();
                    mf.reset_media();
                }
            } else if is_offer {
                tracing::info!(flowid, "re-offer detected, restarting flow");
                self.flow_restart(ctx, flowid)?;
            } else {
                tracing::warn!(flowid, "duplicate answer dropped");
                return Ok(());
            }
        }

        let result = if is_offer {
            let r = self.userflow_accept(ctx, &remote_id, Some(sdp));
            if stream_change {
                if let Some(uf) = self.users.get_mut(&remote_id) {
                    if let Ok(mf) = uf.mediaflow_mut() {
                        if let Err(e) = mf.start_media() {
                            tracing::warn!(error = %e, "stream change restart failed");
                        }
                    }
                }
            }
            r
        } else {
            self.userflow_update(&remote_id, sdp)
        };

        // The SDP has arrived; flush candidates queued while waiting.
        if let Some(flow) = self.flows.get_mut(flowid) {
            flow.got_sdp = true;
            let pending = std::mem::take(&mut flow.pending_cands);
            if !pending.is_empty() {
                tracing::info!(count = pending.len(), "flushing pending candidates");
                if let Some(uf) = self.users.get_mut(&remote_id) {
                    if let Ok(mf) = uf.mediaflow_mut() {
                        for cand in pending {
                            if let Err(e) = mf.add_remote_candidate(
                                &cand.sdp,
                                &cand.sdp_mid,
                                cand.sdp_mline_index,
                            ) {
                                tracing::warn!(error = %e, "pending candidate rejected");
                            }
                        }
                    }
                }
            }
        }
        result
    }

    /// Remote candidates for one flow: forward when the SDP has arrived,
    /// queue otherwise.
    pub fn candidates_event(&mut self, flowid: &str, candidates: &[RemoteCandidate]) -> Result<()> {
        let (got_sdp, remote_id) = {
            let flow = self.flows.get(flowid).ok_or(FlowError::NotFound("flow"))?;
            (flow.got_sdp, flow.remote_id.clone())
        };
        if got_sdp {
            let uf = self
                .users
                .get_mut(&remote_id)
                .ok_or(FlowError::NotFound("userflow"))?;
            let mf = uf.mediaflow_mut()?;
            let mut err = None;
            for cand in candidates {
                tracing::debug!(
                    mid = %cand.sdp_mid,
                    index = cand.sdp_mline_index,
                    "adding remote candidate"
                );
                if let Err(e) =
                    mf.add_remote_candidate(&cand.sdp, &cand.sdp_mid, cand.sdp_mline_index)
                {
                    tracing::warn!(error = %e, "remote candidate rejected");
                    err = Some(FlowError::from(e));
                }
            }
            match err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        } else {
            let flow = self
                .flows
                .get_mut(flowid)
                .ok_or(FlowError::NotFound("flow"))?;
            flow.pending_cands.extend_from_slice(candidates);
            Ok(())
        }
    }

    /// Backend deleted a flow: mark deleted, acknowledge with a DELETE,
    /// drop the flow.
    pub fn delete_event(&mut self, ctx: &mut Ctx, flowid: &str) -> Result<()> {
        {
            let flow = self
                .flows
                .get_mut(flowid)
                .ok_or(FlowError::NotFound("flow"))?;
            flow.deleted = true;
        }
        self.send_flow_delete(ctx, flowid, DeleteReason::Released);
        if let Some(flow) = self.flows.get_mut(flowid) {
            flow.est_st = EstabMask::NONE;
        }
        self.reestablish(ctx, flowid);
        self.remove_flow(ctx, flowid);
        Ok(())
    }

    // ---- errors, restart, teardown -------------------------------------

    /// Common exit for flow-fatal errors: unlink, release media, delete
    /// on the backend, and escalate to the application when no good flow
    /// remains or this was the active flow of a 1-1 call.
    pub fn flow_error(&mut self, ctx: &mut Ctx, flowid: &str, err: FlowError) {
        let (was_active, remote_id) = {
            let Some(flow) = self.flows.get_mut(flowid) else {
                return;
            };
            flow.err = Some(err.clone());
            (flow.is_active(), flow.remote_id.clone())
        };
        self.remove_conf_part(ctx, &remote_id);
        self.release_mediaflow_of(flowid);

        let has_good = self.has_good_flow();
        let multiparty = self.is_multiparty();
        tracing::info!(
            convid = %self.convid,
            flowid,
            has_good,
            multiparty,
            active = was_active,
            error = %err,
            "flow error"
        );
        self.delete_flow_internal(ctx, flowid);

        if !has_good || (!multiparty && was_active) {
            ctx.observer.on_error(&err, &self.convid);
        }
    }

    fn release_mediaflow_of(&mut self, flowid: &str) {
        let remote_id = {
            let Some(flow) = self.flows.get_mut(flowid) else {
                return;
            };
            if flow.is_active() {
                self.is_mestab = false;
            }
            flow.est_st.clear(EstabMask::RTP);
            flow.disarm_rtp_watchdog();
            flow.remote_id.clone()
        };
        if let Some(uf) = self.users.get_mut(&remote_id) {
            uf.release_mediaflow();
        }
    }

    fn delete_flow_internal(&mut self, ctx: &mut Ctx, flowid: &str) {
        let reason = {
            let Some(flow) = self.flows.get_mut(flowid) else {
                return;
            };
            if flow.deleted {
                None
            } else {
                flow.deleted = true;
                Some(if matches!(flow.err, Some(FlowError::Timeout)) {
                    DeleteReason::Timeout
                } else {
                    DeleteReason::Released
                })
            }
        };
        if let Some(reason) = reason {
            self.send_flow_delete(ctx, flowid, reason);
        }
        if let Some(flow) = self.flows.get_mut(flowid) {
            flow.est_st = EstabMask::NONE;
        }
        self.reestablish(ctx, flowid);
        self.remove_flow(ctx, flowid);
    }

    fn send_flow_delete(&mut self, ctx: &mut Ctx, flowid: &str, reason: DeleteReason) {
        tracing::info!(convid = %self.convid, flowid, %reason, "flow delete request");
        let path = paths::delete_flow(&self.convid, flowid, reason);
        match ctx.send_request(
            Some(&self.convid),
            Some(RrKind::FlowDelete),
            Method::Delete,
            path,
            None,
        ) {
            Ok(Some(rr)) => {
                self.rrs.insert(rr);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "flow delete request failed"),
        }
    }

    /// Remove a flow and its userflow (with the owned media flow) from
    /// the call.
    fn remove_flow(&mut self, ctx: &mut Ctx, flowid: &str) {
        if let Some(flow) = self.flows.remove(flowid) {
            tracing::info!(convid = %self.convid, flowid, "flow removed");
            self.remove_conf_part(ctx, &flow.remote_id);
            if flow.is_active() {
                self.is_mestab = false;
            }
            if let Some(uf) = self.users.get_mut(&flow.remote_id) {
                if uf.flow_id.as_deref() == Some(flowid) {
                    uf.flow_id = None;
                }
            }
            self.users.remove(&flow.remote_id);
        }
        self.mestab_check(ctx);
    }

    /// Release the media flow and negotiate from scratch on the same
    /// flow id.
    pub fn flow_restart(&mut self, ctx: &mut Ctx, flowid: &str) -> Result<()> {
        let remote_id = {
            let flow = self.flows.get(flowid).ok_or(FlowError::NotFound("flow"))?;
            flow.remote_id.clone()
        };
        self.remove_conf_part(ctx, &remote_id);
        self.release_mediaflow_of(flowid);
        self.set_userflow_state(ctx, &remote_id, UserflowState::Restart);
        let convid = self.convid.clone();
        if let Some(uf) = self.users.get_mut(&remote_id) {
            uf.alloc_mediaflow(ctx, &convid)?;
        }
        Ok(())
    }

    /// Restart every flow (network change).
    pub fn restart_all(&mut self, ctx: &mut Ctx) {
        let ids: Vec<String> = self.flows.keys().cloned().collect();
        for flowid in ids {
            let remote_id = match self.flows.get(&flowid) {
                Some(flow) => flow.remote_id.clone(),
                None => continue,
            };
            tracing::info!(convid = %self.convid, flowid = %flowid, "restarting flow");
            if let Err(e) = self.flow_restart(ctx, &flowid) {
                tracing::warn!(error = %e, "flow restart failed");
                continue;
            }
            if let Err(e) = self.generate_offer(ctx, &remote_id) {
                tracing::warn!(error = %e, "restart offer failed");
            }
        }
    }

    /// Stop media everywhere and drop the flow dictionary atomically.
    pub fn deestablish_media(&mut self, ctx: &mut Ctx) {
        let ids: Vec<String> = self.flows.keys().cloned().collect();
        for flowid in &ids {
            if let Some(flow) = self.flows.get_mut(flowid) {
                flow.est_st = EstabMask::NONE;
            }
            self.reestablish(ctx, flowid);
        }
        let flows = std::mem::take(&mut self.flows);
        drop(flows);
    }

    /// Full call teardown: stop media, acknowledge undeleted flows, drop
    /// all flow state.
    pub fn cancel(&mut self, ctx: &mut Ctx) {
        let ids: Vec<String> = self.flows.keys().cloned().collect();
        for flowid in &ids {
            if let Some(flow) = self.flows.get_mut(flowid) {
                flow.est_st = EstabMask::NONE;
            }
            self.reestablish(ctx, flowid);
        }
        for flowid in &ids {
            let needs_delete = self.flows.get(flowid).map(|f| !f.deleted).unwrap_or(false);
            if needs_delete {
                self.send_flow_delete(ctx, flowid, DeleteReason::Released);
                if let Some(flow) = self.flows.get_mut(flowid) {
                    flow.deleted = true;
                }
            }
        }
        self.flows.clear();
        self.conf_parts.clear();
    }

    // ---- mediaflow events ----------------------------------------------

    /// The media flow towards `user_id` established (ICE + DTLS done).
    #[allow(clippy::too_many_arguments)]
    pub fn media_established(
        &mut self,
        ctx: &mut Ctx,
        user_id: &str,
        crypto: &str,
        codec: &str,
        local_cand: &str,
        remote_cand: &str,
        peer: Option<SocketAddr>,
    ) {
        let Some(flowid) = self.users.get(user_id).and_then(|u| u.flow_id.clone()) else {
            tracing::warn!(user_id, "established event without bound flow");
            return;
        };
        {
            let Some(flow) = self.flows.get_mut(&flowid) else {
                return;
            };
            tracing::info!(
                convid = %self.convid,
                flowid = %flowid,
                est = %flow.est_st,
                crypto,
                codec,
                local_cand,
                remote_cand,
                peer = ?peer,
                "mediaflow established"
            );
            flow.estab = true;
            flow.stats.estab_time_ms = flow.start_ts.elapsed().as_millis() as u64;
            flow.stats.local_cand = local_cand.to_string();
            flow.stats.remote_cand = remote_cand.to_string();
            flow.stats.crypto = crypto.to_string();
            flow.stats.codec = codec.to_string();
            flow.estab_ts = Some(Instant::now());
            flow.est_st.set(EstabMask::ICE);
        }
        self.reestablish(ctx, &flowid);
    }

    /// RTP started or stopped on the media flow towards `user_id`.
    pub fn rtp_start(&mut self, ctx: &mut Ctx, user_id: &str, started: bool, video: bool) {
        let Some(flowid) = self.users.get(user_id).and_then(|u| u.flow_id.clone()) else {
            return;
        };
        {
            let Some(flow) = self.flows.get_mut(&flowid) else {
                return;
            };
            if started {
                flow.est_st.set(EstabMask::RTP);
                flow.arm_rtp_watchdog();
                if flow.interrupted {
                    flow.interrupted = false;
                    ctx.observer.on_interruption(&self.convid, false);
                }
            } else {
                flow.est_st.clear(EstabMask::RTP);
            }
        }
        if started {
            self.add_conf_part(ctx, &flowid);
        }
        if video && self.mcat == MediaCategory::Call {
            ctx.observer
                .on_category_change(&self.convid, MediaCategory::CallVideo);
        }
        self.reestablish(ctx, &flowid);
        self.mestab_check(ctx);
    }

    /// An RTP packet arrived; re-arm the watchdog and clear a reported
    /// interruption.
    pub fn rtp_activity(&mut self, ctx: &mut Ctx, user_id: &str) {
        let Some(flowid) = self.users.get(user_id).and_then(|u| u.flow_id.clone()) else {
            return;
        };
        let Some(flow) = self.flows.get_mut(&flowid) else {
            return;
        };
        if flow.rtp_deadline.is_some() {
            flow.arm_rtp_watchdog();
        }
        if flow.interrupted {
            flow.interrupted = false;
            ctx.observer.on_interruption(&self.convid, false);
        }
    }

    /// The media flow towards `user_id` closed.
    pub fn mediaflow_closed(&mut self, ctx: &mut Ctx, user_id: &str, error: Option<String>) {
        tracing::info!(user_id, ?error, "mediaflow closed");
        let flowid = match self.users.get_mut(user_id) {
            Some(uf) => {
                uf.release_mediaflow();
                uf.flow_id.clone()
            }
            None => None,
        };
        let err = FlowError::MediaFailed(error.unwrap_or_else(|| "closed".to_string()));
        match flowid {
            Some(flowid) => self.flow_error(ctx, &flowid, err),
            None => {
                tracing::warn!(user_id, "mediaflow closed without flow");
                ctx.observer.on_error(&err, &self.convid);
            }
        }
    }

    // ---- conference, volume, watchdog ----------------------------------

    fn add_conf_part(&mut self, ctx: &mut Ctx, flowid: &str) {
        let remote_id = match self.flows.get(flowid) {
            Some(flow) => flow.remote_id.clone(),
            None => return,
        };
        if self.conf_parts.contains(&remote_id) {
            tracing::warn!(user_id = %remote_id, "conference part already exists");
            return;
        }
        let decoder = self
            .users
            .get(&remote_id)
            .and_then(|u| u.mediaflow())
            .and_then(|m| m.decoder());
        self.conf_parts.add(&remote_id, decoder);
        self.push_conference(ctx);
    }

    fn remove_conf_part(&mut self, ctx: &mut Ctx, user_id: &str) {
        self.conf_parts.remove(user_id);
        self.push_conference(ctx);
    }

    fn push_conference(&self, ctx: &mut Ctx) {
        ctx.media.update_conference(&self.conf_parts.decoders());
        ctx.observer
            .on_conference_order(&self.convid, &self.conf_parts.order());
    }

    /// Report input/output levels for every flow with running media.
    pub fn volume_tick(&self, ctx: &Ctx) {
        for flow in self.flows.values() {
            if !flow.volume_on || !flow.is_active() {
                continue;
            }
            let Some(uf) = self.users.get(&flow.remote_id) else {
                continue;
            };
            let Some(mf) = uf.mediaflow() else {
                continue;
            };
            if mf.encoder().is_none() || mf.decoder().is_none() {
                continue;
            }
            if let Some((input, output)) = mf.audio_levels() {
                ctx.observer
                    .on_volume(&self.convid, &flow.remote_id, input, output);
            }
        }
    }

    /// Earliest RTP watchdog deadline across all flows.
    pub fn next_rtp_deadline(&self) -> Option<Instant> {
        self.flows.values().filter_map(|f| f.rtp_deadline).min()
    }

    /// Fire expired RTP watchdogs: the first expiry reports an
    /// interruption, the second deletes the flow with a timeout reason.
    pub fn fire_rtp_timeouts(&mut self, ctx: &mut Ctx, now: Instant) {
        let expired: Vec<String> = self
            .flows
            .iter()
            .filter(|(_, f)| f.rtp_deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for flowid in expired {
            let first = {
                let Some(flow) = self.flows.get_mut(&flowid) else {
                    continue;
                };
                if flow.interrupted {
                    flow.disarm_rtp_watchdog();
                    false
                } else {
                    flow.interrupted = true;
                    flow.arm_rtp_watchdog();
                    true
                }
            };
            if first {
                tracing::info!(convid = %self.convid, flowid = %flowid, "rtp timeout");
                ctx.observer.on_interruption(&self.convid, true);
            } else {
                tracing::warn!(convid = %self.convid, flowid = %flowid, "second rtp timeout");
                self.flow_error(ctx, &flowid, FlowError::Timeout);
            }
        }
    }

    // ---- bookkeeping ---------------------------------------------------

    /// Media became established on all active flows?
    pub fn mestab_check(&mut self, ctx: &mut Ctx) {
        let active = self.count_active_flows();
        if active == 0 {
            return;
        }
        let all_rtp = self
            .flows
            .values()
            .filter(|f| f.is_active())
            .all(|f| f.est_st.contains(EstabMask::RTP));
        if all_rtp {
            tracing::info!(
                convid = %self.convid,
                mestab = self.is_mestab,
                "media on all active flows"
            );
            if !self.is_mestab {
                ctx.observer.on_media_established(&self.convid, true);
                self.is_mestab = true;
            }
        }
    }

    pub fn rtp_started_set(&mut self, started: bool) {
        if self.rtp_started == started {
            return;
        }
        self.rtp_started = started;
        if started && self.rtp_start_ts.is_none() {
            self.rtp_start_ts = Some(Instant::now());
            tracing::info!(
                convid = %self.convid,
                setup_ms = self.start_ts.elapsed().as_millis() as u64,
                "rtp started"
            );
        }
    }

    /// Stop or start media on every flow around an audio interruption.
    pub fn interruption(&mut self, interrupted: bool) {
        let ids: Vec<String> = self.flows.keys().cloned().collect();
        for flowid in ids {
            if interrupted {
                self.stop_media_on(&flowid);
            } else {
                let remote_id = match self.flows.get(&flowid) {
                    Some(flow) => flow.remote_id.clone(),
                    None => continue,
                };
                if let Some(uf) = self.users.get_mut(&remote_id) {
                    if let Ok(mf) = uf.mediaflow_mut() {
                        if let Err(e) = mf.start_media() {
                            tracing::warn!(error = %e, "media resume failed");
                        }
                    }
                }
            }
        }
    }

    /// Outstanding ghost deletion completed; repeat the flows POST after
    /// the last one.
    pub fn ghost_response(&mut self, ctx: &mut Ctx) {
        self.ghosts = self.ghosts.saturating_sub(1);
        if self.ghosts == 0 {
            if let Err(e) = self.post_flows(ctx) {
                tracing::warn!(error = %e, "post after ghost collection failed");
            }
        }
    }

    fn delete_ghost(&mut self, ctx: &mut Ctx, flowid: &str) {
        let path = paths::delete_flow(&self.convid, flowid, DeleteReason::Released);
        match ctx.send_request(
            Some(&self.convid),
            Some(RrKind::GhostDelete),
            Method::Delete,
            path,
            None,
        ) {
            Ok(Some(rr)) => {
                self.rrs.insert(rr);
                self.ghosts += 1;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "ghost delete failed"),
        }
    }

    /// Per-flow statistics body for the metrics POST.
    pub fn stats_body(&self, software: &str) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("version".to_string(), json!(software));

        if let Some(flow) = self.flows.values().find(|f| f.estab) {
            if let serde_json::Value::Object(mut stats) = flow.stats_json() {
                body.append(&mut stats);
            }
            let setup_ms = self
                .rtp_start_ts
                .map(|ts| ts.duration_since(self.start_ts).as_millis() as u64)
                .unwrap_or(0);
            body.insert("setup_time".to_string(), json!(setup_ms));
            body.insert("num_flows".to_string(), json!(self.flows.len()));
            let (dtls, ice) = self
                .users
                .get(&flow.remote_id)
                .and_then(|u| u.mediaflow())
                .map(|m| (m.dtls_ready(), m.ice_ready()))
                .unwrap_or((false, false));
            body.insert("dtls".to_string(), json!(dtls));
            body.insert("ice".to_string(), json!(ice));
        }

        body.insert("success".to_string(), json!(self.is_mestab));
        serde_json::Value::Object(body)
    }

    pub fn debug_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("  convid:    {}\n", self.convid));
        out.push_str(&format!("  sessionid: {}\n", self.sessid()));
        out.push_str(&format!("  mediacat:  {}\n", self.mcat.name()));
        out.push_str(&format!(
            "  flows:     {} (active {})\n",
            self.flows.len(),
            self.count_active_flows()
        ));
        for flow in self.flows.values() {
            out.push_str(&format!("    {}\n", flow.debug_line()));
        }
        out.push_str(&format!("  users:     {}\n", self.users.len()));
        for uf in self.users.values() {
            out.push_str(&format!("    {}\n", uf.debug_line()));
        }
        out.push_str(&format!("  conference: {:?}\n", self.conf_parts.order()));
        out
    }
}
