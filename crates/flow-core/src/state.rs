//! Engine-owned state: the call dictionary, pending requests, the event
//! queue, and inbound dispatch.
//!
//! Everything here runs on the event-loop task; no locking is involved.
//! [`Ctx`] bundles the services (media system, transport, observer,
//! request table, configuration) that call/flow/userflow methods need
//! alongside mutable access to the call itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use driftwave_backend_api::{CallEvent, FlowsResponse, CONTENT_TYPE_JSON};
use driftwave_media_core::{MediaFlowEvent, MediaSystem};
use tokio::sync::mpsc;

use crate::call::Call;
use crate::config::ConfigState;
use crate::engine::EngineMessage;
use crate::error::{FlowError, Result};
use crate::handlers::{FlowManagerObserver, Method, OutboundRequest, RequestTransport};
use crate::rr::{RrId, RrKind, RrRecord, RrTable};

/// Version string reported in metrics bodies.
pub(crate) const SOFTWARE: &str = concat!("driftwave ", env!("CARGO_PKG_VERSION"));

/// Volume sampling period while flows exist.
pub(crate) const VOLUME_INTERVAL: Duration = Duration::from_millis(100);

/// Services shared by every call operation.
pub(crate) struct Ctx {
    pub media: MediaSystem,
    pub transport: Arc<dyn RequestTransport>,
    pub observer: Arc<dyn FlowManagerObserver>,
    pub events_tx: mpsc::UnboundedSender<EngineMessage>,
    pub rrs: RrTable,
    pub config: ConfigState,
    pub self_user_id: Option<String>,
    pub use_metrics: bool,
    /// During teardown requests still go out but are no longer tracked.
    pub shutting_down: bool,
}

impl Ctx {
    /// Issue an outbound REST request, allocating a correlation record
    /// when `kind` is given. On transport failure the record is unlinked
    /// again and the error propagated to the caller.
    pub fn send_request(
        &mut self,
        convid: Option<&str>,
        kind: Option<RrKind>,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    ) -> Result<Option<RrId>> {
        let kind = if self.shutting_down { None } else { kind };
        let rr = kind.map(|kind| self.rrs.alloc(convid, kind, format!("{method} {path}")));

        tracing::info!(%method, %path, rr = ?rr, "http request");
        let request = OutboundRequest {
            rr,
            method,
            content_type: body.is_some().then_some(CONTENT_TYPE_JSON),
            path,
            body,
        };
        match self.transport.send_request(request) {
            Ok(()) => Ok(rr),
            Err(e) => {
                tracing::warn!(error = %e, "request handler failed");
                if let Some(rr) = rr {
                    self.rrs.cancel(rr);
                }
                Err(e)
            }
        }
    }
}

/// The complete state owned by one flow manager's event loop.
pub(crate) struct State {
    pub ctx: Ctx,
    pub calls: HashMap<String, Call>,
    /// Calls whose flows POST waits for the call configuration.
    pub post_pending: Vec<String>,
    /// Events targeting flows we do not know yet; replayed after the
    /// next flow addition.
    pub eventq: VecDeque<CallEvent>,
    /// Next volume sampling tick; armed while any flow exists.
    pub volume_next: Option<Instant>,
}

impl State {
    pub fn new(ctx: Ctx) -> State {
        State {
            ctx,
            calls: HashMap::new(),
            post_pending: Vec::new(),
            eventq: VecDeque::new(),
            volume_next: None,
        }
    }

    // ---- inbound signalling events -------------------------------------

    /// Decode and process one signalling event. Returns whether the event
    /// type was handled by the calling core.
    pub fn process_event(&mut self, content_type: &str, content: &str) -> Result<bool> {
        if content_type != CONTENT_TYPE_JSON {
            return Err(FlowError::Protocol(format!(
                "unexpected content type: {content_type}"
            )));
        }
        let event = CallEvent::decode(content)
            .map_err(|e| FlowError::Protocol(format!("event parse error: {e}")))?;
        let Some(event) = event else {
            return Ok(false);
        };
        tracing::info!(event = event.type_name(), conversation = event.conversation(), "event");
        self.process_typed(event, false)
    }

    pub fn process_typed(&mut self, event: CallEvent, replayed: bool) -> Result<bool> {
        match event {
            CallEvent::FlowAdd {
                conversation,
                flows,
            } => {
                let created = !self.calls.contains_key(&conversation);
                let added = {
                    let call = self
                        .calls
                        .entry(conversation.clone())
                        .or_insert_with(|| Call::new(&conversation));
                    match call.add_flow_entries(&mut self.ctx, &flows, false) {
                        Ok(added) => {
                            tracing::info!(
                                conversation = %conversation,
                                flows = call.flows.len(),
                                "flows added"
                            );
                            added
                        }
                        Err(e) => {
                            if created {
                                self.destroy_call(&conversation);
                            }
                            return Err(e);
                        }
                    }
                };
                if added > 0 {
                    self.replay_events();
                }
                Ok(true)
            }

            event => {
                let convid = event.conversation().to_string();
                let flowid = match event.flow() {
                    Some(flowid) => flowid.to_string(),
                    None => return Err(FlowError::Protocol("event without flow id".to_string())),
                };
                let Some(call) = self.calls.get_mut(&convid) else {
                    return Err(FlowError::Protocol(format!(
                        "no call for conversation {convid}"
                    )));
                };
                if !call.flows.contains_key(&flowid) {
                    if matches!(event, CallEvent::FlowDelete { .. }) {
                        tracing::info!(flowid = %flowid, "flow already deleted");
                        return Err(FlowError::Protocol("flow already deleted".to_string()));
                    }
                    tracing::info!(
                        event = event.type_name(),
                        flowid = %flowid,
                        queued = self.eventq.len() + 1,
                        "unknown flow, queueing event"
                    );
                    self.eventq.push_back(event);
                    return Ok(true);
                }

                match event {
                    CallEvent::FlowDelete { .. } => {
                        // The stats of the last flow must be collected
                        // before it disappears.
                        if call.flows.len() == 1 && self.ctx.use_metrics {
                            if let Err(e) = self.send_metrics(&convid, Some("complete")) {
                                tracing::debug!(error = %e, "final metrics failed");
                            }
                        }
                        if let Some(call) = self.calls.get_mut(&convid) {
                            call.delete_event(&mut self.ctx, &flowid)?;
                            if call.flows.is_empty() {
                                self.destroy_call(&convid);
                            }
                        }
                        Ok(true)
                    }
                    CallEvent::FlowActive { active, .. } => {
                        call.activate_flow(&mut self.ctx, &flowid, active)?;
                        Ok(true)
                    }
                    CallEvent::CandidatesAdd { candidates, .. }
                    | CallEvent::CandidatesUpdate { candidates, .. } => {
                        call.candidates_event(&flowid, &candidates)?;
                        Ok(true)
                    }
                    CallEvent::RemoteSdp { state, sdp, .. } => {
                        call.sdp_event(&mut self.ctx, &flowid, state, &sdp, replayed)?;
                        Ok(true)
                    }
                    CallEvent::FlowAdd { .. } => unreachable!("handled above"),
                }
            }
        }
    }

    /// Replay queued events after new flows appeared. The pass is
    /// bounded by the queue length at entry; events requeued during the
    /// pass wait for the next one.
    pub fn replay_events(&mut self) {
        let max = self.eventq.len();
        if max == 0 {
            return;
        }
        tracing::info!(count = max, "replaying queued events");
        for _ in 0..max {
            let Some(event) = self.eventq.pop_front() else {
                break;
            };
            tracing::info!(event = event.type_name(), "replaying event");
            if let Err(e) = self.process_typed(event, true) {
                tracing::debug!(error = %e, "replayed event failed");
            }
        }
    }

    // ---- REST responses ------------------------------------------------

    /// Match an HTTP response to its pending request and dispatch it.
    pub fn resp(
        &mut self,
        status: u16,
        reason: &str,
        content_type: Option<&str>,
        content: Option<&str>,
        rr: RrId,
    ) -> Result<()> {
        if status >= 400 {
            tracing::warn!(status, reason, %rr, "response failure");
        }
        let Some(record) = self.ctx.rrs.take_response(rr) else {
            tracing::warn!(%rr, status, "response for unknown request dropped");
            return Err(FlowError::NotFound("pending request"));
        };
        if let Some(convid) = &record.convid {
            if let Some(call) = self.calls.get_mut(convid) {
                call.rrs.remove(&rr);
            }
        }

        if let Some(ct) = content_type {
            if ct != CONTENT_TYPE_JSON {
                tracing::warn!(content_type = ct, "invalid response content type");
                return Err(FlowError::Protocol(format!(
                    "invalid content type: {ct}"
                )));
            }
        }
        let json = match content {
            Some(content) if !content.is_empty() && content_type.is_some() => Some(
                serde_json::from_str::<serde_json::Value>(content)
                    .map_err(|e| FlowError::Protocol(format!("response parse error: {e}")))?,
            ),
            _ => None,
        };

        tracing::info!(status, reason, %rr, debug = %record.debug, "http response");
        self.dispatch_rr(record, status, json);
        Ok(())
    }

    /// Route a (possibly synthetic) response to its continuation.
    pub fn dispatch_rr(&mut self, record: RrRecord, status: u16, json: Option<serde_json::Value>) {
        match record.kind {
            RrKind::CallConfig => self.config_response(status, json),
            RrKind::PostFlows => {
                let convid = record.convid.unwrap_or_default();
                self.post_flows_response(&convid, status, json);
            }
            RrKind::LocalSdp { flowid } => {
                if (200..300).contains(&status) {
                    return;
                }
                tracing::warn!(status, flowid = %flowid, "local sdp rejected");
                let Some(convid) = record.convid else { return };
                if let Some(call) = self.calls.get_mut(&convid) {
                    if call.flows.contains_key(&flowid) {
                        call.flow_error(
                            &mut self.ctx,
                            &flowid,
                            FlowError::Protocol(format!("local sdp rejected: {status}")),
                        );
                    }
                }
            }
            RrKind::GhostDelete => {
                let Some(convid) = record.convid else { return };
                if let Some(call) = self.calls.get_mut(&convid) {
                    call.ghost_response(&mut self.ctx);
                }
            }
            RrKind::FlowDelete => {}
        }
        self.update_volume_timer();
    }

    fn post_flows_response(&mut self, convid: &str, status: u16, json: Option<serde_json::Value>) {
        if !(200..300).contains(&status) {
            tracing::warn!(status, convid, "flows post failed");
            self.ctx.observer.on_error(
                &FlowError::Protocol(format!("flows post failed: {status}")),
                convid,
            );
            return;
        }
        let entries = match json.map(serde_json::from_value::<FlowsResponse>) {
            Some(Ok(response)) => response.flows,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "malformed flows response");
                self.ctx.observer.on_error(
                    &FlowError::Protocol(format!("malformed flows response: {e}")),
                    convid,
                );
                return;
            }
            None => Vec::new(),
        };

        let added = {
            let Some(call) = self.calls.get_mut(convid) else {
                tracing::warn!(convid, "flows response for unknown call");
                return;
            };
            match call.add_flow_entries(&mut self.ctx, &entries, true) {
                Ok(added) => {
                    tracing::info!(convid, flows = call.flows.len(), "flows posted");
                    added
                }
                Err(e) => {
                    tracing::warn!(error = %e, "adding posted flows failed");
                    self.ctx.observer.on_error(&e, convid);
                    return;
                }
            }
        };
        if added > 0 {
            self.replay_events();
        }
        if let Some(call) = self.calls.get_mut(convid) {
            call.purge_users();
        }
    }

    // ---- public operations ---------------------------------------------

    pub fn acquire_flows(&mut self, convid: &str, sessid: Option<&str>) -> Result<()> {
        if convid.is_empty() {
            return Err(FlowError::InvalidArgument("convid"));
        }
        tracing::info!(convid, ?sessid, "acquire flows");

        let created = !self.calls.contains_key(convid);
        let result = {
            let call = self
                .calls
                .entry(convid.to_string())
                .or_insert_with(|| Call::new(convid));
            call.start_ts = Instant::now();
            if let Some(sessid) = sessid {
                call.set_sessid(sessid);
            }
            call.set_active(true);

            if self.ctx.config.pending {
                tracing::info!(convid, "config pending, queueing flows post");
                None
            } else {
                Some(call.start_post(&mut self.ctx))
            }
        };
        match result {
            None => {
                if !self.post_pending.iter().any(|c| c == convid) {
                    self.post_pending.push(convid.to_string());
                }
                Ok(())
            }
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                tracing::warn!(convid, error = %e, "flows post failed");
                if created {
                    self.destroy_call(convid);
                }
                Err(e)
            }
        }
    }

    pub fn release_flows(&mut self, convid: &str) {
        if !self.calls.contains_key(convid) {
            tracing::info!(convid, "release: no call");
            return;
        }
        tracing::info!(convid, "release flows");
        if let Some(call) = self.calls.get_mut(convid) {
            call.set_active(false);
        }
        if self.ctx.use_metrics {
            if let Err(e) = self.send_metrics(convid, Some("complete")) {
                tracing::debug!(error = %e, "release metrics failed");
            }
        }
        let cancelled = self.ctx.rrs.cancel_for_call(convid);
        if !cancelled.is_empty() {
            tracing::debug!(count = cancelled.len(), "outstanding requests cancelled");
        }
        if let Some(call) = self.calls.get_mut(convid) {
            call.cancel(&mut self.ctx);
        }
        self.calls.remove(convid);
        self.post_pending.retain(|c| c != convid);
        self.update_volume_timer();
    }

    /// Drop a call without the release-side effects (metrics); used when
    /// the last flow disappears or a half-built call must be unwound.
    pub fn destroy_call(&mut self, convid: &str) {
        let cancelled = self.ctx.rrs.cancel_for_call(convid);
        if !cancelled.is_empty() {
            tracing::debug!(count = cancelled.len(), "outstanding requests cancelled");
        }
        if let Some(mut call) = self.calls.remove(convid) {
            call.deestablish_media(&mut self.ctx);
        }
        self.post_pending.retain(|c| c != convid);
        self.update_volume_timer();
    }

    pub fn user_add(&mut self, convid: &str, user_id: &str, name: Option<&str>) -> Result<()> {
        if convid.is_empty() {
            return Err(FlowError::InvalidArgument("convid"));
        }
        if user_id.is_empty() {
            return Err(FlowError::InvalidArgument("user_id"));
        }
        tracing::info!(convid, user_id, "user add");
        let created = !self.calls.contains_key(convid);
        let result = {
            let call = self
                .calls
                .entry(convid.to_string())
                .or_insert_with(|| Call::new(convid));
            call.userflow_lookup_alloc(&mut self.ctx, user_id, name)
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "user add failed");
                if created {
                    self.destroy_call(convid);
                }
                Err(e)
            }
        }
    }

    pub fn set_sessid(&mut self, convid: &str, sessid: &str) {
        tracing::info!(convid, sessid, "set session id");
        let call = self
            .calls
            .entry(convid.to_string())
            .or_insert_with(|| Call::new(convid));
        call.set_sessid(sessid);
    }

    pub fn mcat_changed(&mut self, convid: &str, category: crate::types::MediaCategory) {
        tracing::info!(convid, category = category.name(), "category changed");
        let Some(call) = self.calls.get_mut(convid) else {
            tracing::warn!(convid, "category change for unknown call");
            return;
        };
        call.mcat_changed(category);
    }

    pub fn network_changed(&mut self) {
        tracing::info!("network changed, restarting all flows");
        let ids: Vec<String> = self.calls.keys().cloned().collect();
        for convid in ids {
            if let Some(call) = self.calls.get_mut(&convid) {
                call.restart_all(&mut self.ctx);
            }
        }
    }

    pub fn interruption(&mut self, convid: &str, interrupted: bool) -> Result<()> {
        let call = self
            .calls
            .get_mut(convid)
            .ok_or(FlowError::NotFound("call"))?;
        call.interruption(interrupted);
        Ok(())
    }

    pub fn has_media(&self, convid: &str) -> bool {
        self.calls
            .get(convid)
            .map(|call| call.rtp_started)
            .unwrap_or(false)
    }

    pub fn has_active(&self) -> bool {
        self.calls.values().any(|call| call.has_established_flow())
    }

    pub fn users_count(&self, convid: &str) -> usize {
        self.calls
            .get(convid)
            .map(|call| call.users.len())
            .unwrap_or(0)
    }

    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        out.push_str("***** FLOWMGR *****\n");
        if let Some(user_id) = &self.ctx.self_user_id {
            out.push_str(&format!("self_userid: {user_id}\n"));
        }
        out.push_str(&format!("iceservers: {}\n", self.ctx.config.servers.len()));
        for (i, server) in self.ctx.config.servers.iter().enumerate() {
            out.push_str(&format!(
                "  {}: {}:{}:{}\n",
                i,
                server.scheme.as_str(),
                server.host,
                server.port
            ));
        }
        out.push_str(&format!("number of calls: {}\n", self.calls.len()));
        for call in self.calls.values() {
            out.push_str(&call.debug_summary());
        }
        out.push_str("***** ******* *****\n");
        out
    }

    // ---- mediaflow events ----------------------------------------------

    pub fn media_event(&mut self, convid: &str, user_id: &str, event: MediaFlowEvent) {
        let Some(call) = self.calls.get_mut(convid) else {
            tracing::debug!(convid, user_id, "mediaflow event for unknown call");
            return;
        };
        match event {
            MediaFlowEvent::GatherComplete => call.gather_complete(&mut self.ctx, user_id),
            MediaFlowEvent::IceEstablished {
                crypto,
                codec,
                local_cand,
                remote_cand,
                peer,
            } => call.media_established(
                &mut self.ctx,
                user_id,
                &crypto,
                &codec,
                &local_cand,
                &remote_cand,
                peer,
            ),
            MediaFlowEvent::RtpStart { started, video } => {
                call.rtp_start(&mut self.ctx, user_id, started, video)
            }
            MediaFlowEvent::RtpActivity => call.rtp_activity(&mut self.ctx, user_id),
            MediaFlowEvent::Closed { error } => {
                call.mediaflow_closed(&mut self.ctx, user_id, error)
            }
        }
    }

    // ---- timers --------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next = self.ctx.config.refresh_at;
        if let Some(v) = self.volume_next {
            next = Some(next.map_or(v, |n| n.min(v)));
        }
        for call in self.calls.values() {
            if let Some(d) = call.next_rtp_deadline() {
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        }
        next
    }

    pub fn fire_timers(&mut self) {
        let now = Instant::now();
        if self.ctx.config.refresh_at.map(|t| t <= now).unwrap_or(false) {
            self.ctx.config.refresh_at = None;
            self.start_config_fetch();
        }
        if self.volume_next.map(|t| t <= now).unwrap_or(false) {
            for call in self.calls.values() {
                call.volume_tick(&self.ctx);
            }
            self.volume_next = Some(now + VOLUME_INTERVAL);
        }
        let ids: Vec<String> = self.calls.keys().cloned().collect();
        for convid in ids {
            if let Some(call) = self.calls.get_mut(&convid) {
                call.fire_rtp_timeouts(&mut self.ctx, now);
            }
        }
        self.update_volume_timer();
    }

    /// Arm or disarm the volume tick depending on flow existence.
    pub fn update_volume_timer(&mut self) {
        let any_flows = self.calls.values().any(|call| !call.flows.is_empty());
        match (any_flows, self.volume_next) {
            (true, None) => self.volume_next = Some(Instant::now() + VOLUME_INTERVAL),
            (false, Some(_)) => self.volume_next = None,
            _ => {}
        }
    }

    // ---- teardown ------------------------------------------------------

    /// Terminate: cancel the config fetch, fire a synthetic 499 response
    /// into every pending request's continuation, release every call.
    pub fn teardown(&mut self) {
        tracing::info!(outstanding = self.ctx.rrs.outstanding(), "flow manager teardown");
        if let Some(rr) = self.ctx.config.rr.take() {
            self.ctx.rrs.cancel(rr);
        }
        self.ctx.config.refresh_at = None;

        let pending = self.ctx.rrs.drain_all();
        self.ctx.shutting_down = true;
        for record in pending {
            self.dispatch_rr(record, 499, None);
        }

        let ids: Vec<String> = self.calls.keys().cloned().collect();
        for convid in ids {
            self.release_flows(&convid);
        }
    }
}
