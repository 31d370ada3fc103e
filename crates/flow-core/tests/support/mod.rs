//! Shared test harness: a scripted media engine, a recording transport
//! and a recording observer.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use driftwave_backend_api::CONTENT_TYPE_JSON;
use driftwave_flow_core::{
    FlowError, FlowManager, FlowManagerObserver, MediaCategory, Method, OutboundRequest,
    RequestTransport, RrId,
};
use driftwave_media_core::{
    CodecSpec, DecoderHandle, EncoderHandle, MediaEngine, MediaFlow, MediaFlowEvent,
    MediaFlowParams, MediaFlowSink, MediaSystem, MediaSystemConfig, NetInterface,
};

// ---------------------------------------------------------------------
// mock media engine

#[derive(Debug, Default)]
pub struct MockFlowState {
    pub tag: String,
    pub gathered: bool,
    pub local_sdp: bool,
    pub remote_sdp: bool,
    pub offers: u32,
    pub answers: u32,
    pub started: bool,
    pub start_count: u32,
    pub stop_count: u32,
    pub held: bool,
    pub ice_started: bool,
    pub dtls_ready: bool,
    pub ice_ready: bool,
    pub privacy: bool,
    pub video_added: bool,
    pub sdp_resets: u32,
    pub media_resets: u32,
    pub host_candidates: Vec<String>,
    pub stun_gathers: u32,
    pub turn_gathers: u32,
    pub candidates: Vec<(String, String, u32)>,
}

/// Test-side handle to one created media flow.
#[derive(Clone)]
pub struct FlowHandle {
    pub state: Arc<Mutex<MockFlowState>>,
    pub sink: Arc<dyn MediaFlowSink>,
}

impl FlowHandle {
    pub fn complete_gather(&self) {
        self.state.lock().gathered = true;
        self.sink.deliver(MediaFlowEvent::GatherComplete);
    }

    pub fn establish(&self) {
        {
            let mut state = self.state.lock();
            state.dtls_ready = true;
            state.ice_ready = true;
        }
        self.sink.deliver(MediaFlowEvent::IceEstablished {
            crypto: "dtls_srtp".to_string(),
            codec: "opus".to_string(),
            local_cand: "host".to_string(),
            remote_cand: "host".to_string(),
            peer: None,
        });
    }

    pub fn start_rtp(&self) {
        self.sink.deliver(MediaFlowEvent::RtpStart {
            started: true,
            video: false,
        });
    }

    pub fn start_video_rtp(&self) {
        self.sink.deliver(MediaFlowEvent::RtpStart {
            started: true,
            video: true,
        });
    }

    pub fn rtp_activity(&self) {
        self.sink.deliver(MediaFlowEvent::RtpActivity);
    }

    pub fn close(&self, reason: &str) {
        self.sink.deliver(MediaFlowEvent::Closed {
            error: Some(reason.to_string()),
        });
    }
}

struct MockFlow {
    state: Arc<Mutex<MockFlowState>>,
    encoder: EncoderHandle,
    decoder: DecoderHandle,
}

impl MediaFlow for MockFlow {
    fn generate_offer(&mut self) -> driftwave_media_core::Result<String> {
        let mut state = self.state.lock();
        state.offers += 1;
        state.local_sdp = true;
        Ok(format!("v=0\r\no=- offer {} mock\r\n", state.offers))
    }

    fn generate_answer(&mut self) -> driftwave_media_core::Result<String> {
        let mut state = self.state.lock();
        state.answers += 1;
        state.local_sdp = true;
        Ok(format!("v=0\r\no=- answer {} mock\r\n", state.answers))
    }

    fn handle_offer(&mut self, _sdp: &str) -> driftwave_media_core::Result<()> {
        self.state.lock().remote_sdp = true;
        Ok(())
    }

    fn handle_answer(&mut self, _sdp: &str) -> driftwave_media_core::Result<()> {
        self.state.lock().remote_sdp = true;
        Ok(())
    }

    fn add_remote_candidate(
        &mut self,
        sdp: &str,
        mid: &str,
        mline_index: u32,
    ) -> driftwave_media_core::Result<()> {
        self.state
            .lock()
            .candidates
            .push((sdp.to_string(), mid.to_string(), mline_index));
        Ok(())
    }

    fn start_ice(&mut self) -> driftwave_media_core::Result<()> {
        self.state.lock().ice_started = true;
        Ok(())
    }

    fn start_media(&mut self) -> driftwave_media_core::Result<()> {
        let mut state = self.state.lock();
        state.started = true;
        state.held = false;
        state.start_count += 1;
        Ok(())
    }

    fn stop_media(&mut self) {
        let mut state = self.state.lock();
        state.started = false;
        state.stop_count += 1;
    }

    fn hold_media(&mut self, hold: bool) {
        let mut state = self.state.lock();
        state.held = hold;
        if hold {
            state.started = false;
        }
    }

    fn is_gathered(&self) -> bool {
        self.state.lock().gathered
    }

    fn sdp_is_complete(&self) -> bool {
        let state = self.state.lock();
        state.local_sdp && state.remote_sdp
    }

    fn reset_sdp_state(&mut self) {
        let mut state = self.state.lock();
        state.local_sdp = false;
        state.remote_sdp = false;
        state.sdp_resets += 1;
    }

    fn reset_media(&mut self) {
        self.state.lock().media_resets += 1;
    }

    fn dtls_ready(&self) -> bool {
        self.state.lock().dtls_ready
    }

    fn ice_ready(&self) -> bool {
        self.state.lock().ice_ready
    }

    fn encoder(&self) -> Option<EncoderHandle> {
        Some(self.encoder)
    }

    fn decoder(&self) -> Option<DecoderHandle> {
        Some(self.decoder)
    }

    fn audio_levels(&self) -> Option<(f32, f32)> {
        self.state.lock().started.then_some((0.4, 0.6))
    }

    fn enable_privacy(&mut self, enable: bool) {
        self.state.lock().privacy = enable;
    }

    fn add_video(&mut self, _codecs: &[CodecSpec]) -> driftwave_media_core::Result<()> {
        self.state.lock().video_added = true;
        Ok(())
    }

    fn add_local_host_candidate(
        &mut self,
        ifname: &str,
        _addr: IpAddr,
    ) -> driftwave_media_core::Result<()> {
        self.state.lock().host_candidates.push(ifname.to_string());
        Ok(())
    }

    fn gather_stun(&mut self, _host: &str, _port: u16) -> driftwave_media_core::Result<()> {
        self.state.lock().stun_gathers += 1;
        Ok(())
    }

    fn gather_turn(
        &mut self,
        _host: &str,
        _port: u16,
        _username: &str,
        _credential: &str,
    ) -> driftwave_media_core::Result<()> {
        self.state.lock().turn_gathers += 1;
        Ok(())
    }

    fn gather_turn_tcp(
        &mut self,
        _host: &str,
        _port: u16,
        _username: &str,
        _credential: &str,
        _secure: bool,
    ) -> driftwave_media_core::Result<()> {
        self.state.lock().turn_gathers += 1;
        Ok(())
    }

    fn set_tag(&mut self, tag: &str) {
        self.state.lock().tag = tag.to_string();
    }
}

pub struct MockEngine {
    flows: Mutex<Vec<FlowHandle>>,
    next_handle: AtomicU64,
    conference: Mutex<Vec<Vec<DecoderHandle>>>,
    pub gathered_by_default: AtomicBool,
    pub with_video: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<MockEngine> {
        Arc::new(MockEngine {
            flows: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            conference: Mutex::new(Vec::new()),
            gathered_by_default: AtomicBool::new(true),
            with_video: AtomicBool::new(false),
        })
    }

    pub fn new_ungathered() -> Arc<MockEngine> {
        let engine = MockEngine::new();
        engine.gathered_by_default.store(false, Ordering::SeqCst);
        engine
    }

    /// Flow handles in creation order.
    pub fn flow(&self, index: usize) -> FlowHandle {
        self.flows.lock()[index].clone()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn conference_updates(&self) -> Vec<Vec<DecoderHandle>> {
        self.conference.lock().clone()
    }
}

impl MediaEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn audio_codecs(&self) -> Vec<CodecSpec> {
        vec![CodecSpec::new("opus", 48_000, 2)]
    }

    fn video_codecs(&self) -> Vec<CodecSpec> {
        if self.with_video.load(Ordering::SeqCst) {
            vec![CodecSpec::new("VP8", 90_000, 1)]
        } else {
            Vec::new()
        }
    }

    fn interfaces(&self) -> Vec<NetInterface> {
        vec![NetInterface {
            name: "eth0".to_string(),
            addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            loopback: false,
            link_local: false,
        }]
    }

    fn create_flow(
        &self,
        params: MediaFlowParams,
    ) -> driftwave_media_core::Result<Box<dyn MediaFlow>> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(Mutex::new(MockFlowState {
            gathered: self.gathered_by_default.load(Ordering::SeqCst),
            ..Default::default()
        }));
        self.flows.lock().push(FlowHandle {
            state: state.clone(),
            sink: params.sink.clone(),
        });
        Ok(Box::new(MockFlow {
            state,
            encoder: EncoderHandle(id),
            decoder: DecoderHandle(id),
        }))
    }

    fn update_conference(&self, decoders: &[DecoderHandle]) {
        self.conference.lock().push(decoders.to_vec());
    }
}

// ---------------------------------------------------------------------
// recording transport

pub struct RecordingTransport {
    requests: Mutex<Vec<OutboundRequest>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            requests: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    /// Last request matching method and path fragment.
    pub fn find(&self, method: Method, path_part: &str) -> Option<OutboundRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.method == method && r.path.contains(path_part))
            .cloned()
    }

    pub fn expect(&self, method: Method, path_part: &str) -> OutboundRequest {
        self.find(method, path_part)
            .unwrap_or_else(|| panic!("no {method} request matching '{path_part}'"))
    }

    pub fn count(&self, method: Method, path_part: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.contains(path_part))
            .count()
    }

    /// Position of the first matching request, for ordering assertions.
    pub fn position(&self, method: Method, path_part: &str) -> Option<usize> {
        self.requests
            .lock()
            .iter()
            .position(|r| r.method == method && r.path.contains(path_part))
    }
}

impl RequestTransport for RecordingTransport {
    fn send_request(&self, request: OutboundRequest) -> driftwave_flow_core::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(FlowError::Transport("scripted failure".to_string()));
        }
        self.requests.lock().push(request);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// recording observer

#[derive(Debug, Default, Clone)]
pub struct ObservedEvents {
    pub categories: Vec<(String, MediaCategory)>,
    pub media_established: Vec<(String, bool)>,
    pub errors: Vec<String>,
    pub conference_orders: Vec<(String, Vec<String>)>,
    pub interruptions: Vec<(String, bool)>,
    pub volumes: usize,
}

pub struct RecordingObserver {
    events: Mutex<ObservedEvents>,
}

impl RecordingObserver {
    pub fn new() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            events: Mutex::new(ObservedEvents::default()),
        })
    }

    pub fn events(&self) -> ObservedEvents {
        self.events.lock().clone()
    }

    pub fn last_category(&self, convid: &str) -> Option<MediaCategory> {
        self.events
            .lock()
            .categories
            .iter()
            .rev()
            .find(|(c, _)| c == convid)
            .map(|(_, cat)| *cat)
    }
}

impl FlowManagerObserver for RecordingObserver {
    fn on_category_change(&self, convid: &str, category: MediaCategory) {
        self.events
            .lock()
            .categories
            .push((convid.to_string(), category));
    }

    fn on_media_established(&self, convid: &str, established: bool) {
        self.events
            .lock()
            .media_established
            .push((convid.to_string(), established));
    }

    fn on_error(&self, _error: &FlowError, convid: &str) {
        self.events.lock().errors.push(convid.to_string());
    }

    fn on_conference_order(&self, convid: &str, order: &[String]) {
        self.events
            .lock()
            .conference_orders
            .push((convid.to_string(), order.to_vec()));
    }

    fn on_interruption(&self, convid: &str, interrupted: bool) {
        self.events
            .lock()
            .interruptions
            .push((convid.to_string(), interrupted));
    }

    fn on_volume(&self, _convid: &str, _user_id: &str, _input: f32, _output: f32) {
        self.events.lock().volumes += 1;
    }
}

// ---------------------------------------------------------------------
// harness

pub struct Harness {
    pub fm: FlowManager,
    pub engine: Arc<MockEngine>,
    pub transport: Arc<RecordingTransport>,
    pub observer: Arc<RecordingObserver>,
    pub media: MediaSystem,
}

impl Harness {
    pub fn new() -> Harness {
        Harness::with_engine(MockEngine::new())
    }

    pub fn with_engine(engine: Arc<MockEngine>) -> Harness {
        let media = MediaSystem::new_standalone(
            "mock",
            MediaSystemConfig::new(engine.clone() as Arc<dyn MediaEngine>),
        )
        .expect("media system");
        let transport = RecordingTransport::new();
        let observer = RecordingObserver::new();
        let fm = FlowManager::spawn(
            media.clone(),
            transport.clone() as Arc<dyn RequestTransport>,
            observer.clone() as Arc<dyn FlowManagerObserver>,
        );
        Harness {
            fm,
            engine,
            transport,
            observer,
            media,
        }
    }

    /// Start the manager and answer the configuration fetch with one
    /// TURN and one STUN server.
    pub async fn start_with_config(&self) {
        self.fm.start().await.expect("start");
        let request = self.transport.expect(Method::Get, "/calls/config");
        let rr = request.rr.expect("config rr");
        self.respond_json(rr, 200, config_body()).await;
    }

    pub async fn respond_json(&self, rr: RrId, status: u16, body: String) {
        self.fm
            .resp(
                status,
                status_reason(status),
                Some(CONTENT_TYPE_JSON),
                Some(&body),
                rr,
            )
            .await
            .expect("resp");
    }

    pub async fn respond_empty(&self, rr: RrId, status: u16) {
        self.fm
            .resp(status, status_reason(status), None, None, rr)
            .await
            .expect("resp");
    }

    /// Answer the latest flows POST with the given flow list.
    pub async fn respond_flows(&self, flows_json: String) {
        let request = self.transport.expect(Method::Post, "/call/flows");
        let rr = request.rr.expect("flows rr");
        self.respond_json(rr, 200, flows_json).await;
    }

    /// Drive a conversation into an established 1-1 call: acquire,
    /// flows POST response with one creator flow, local SDP PUT, remote
    /// answer, ICE establishment, category commit, RTP.
    pub async fn establish_call(&self, convid: &str, flowid: &str, remote: &str) {
        self.fm
            .acquire_flows(convid, Some("sess-1"))
            .await
            .expect("acquire");
        self.respond_flows(flows_body(&[(flowid, remote, true)])).await;

        let put = self.transport.expect(Method::Put, "local_sdp");
        self.respond_empty(put.rr.expect("sdp rr"), 200).await;

        let answer = remote_sdp_event(convid, flowid, "answer", "v=0 remote answer");
        assert!(self
            .fm
            .process_event(CONTENT_TYPE_JSON, &answer)
            .await
            .expect("answer event"));

        let flow = self.engine.flow(self.engine.flow_count() - 1);
        flow.establish();
        self.fm.mcat_changed(convid, MediaCategory::Call).await.unwrap();
        flow.start_rtp();
        assert!(self.fm.has_media(convid).await.unwrap());
    }
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

pub fn config_body() -> String {
    serde_json::json!({
        "ice_servers": [
            { "url": "turn:turn.example.com:3478", "username": "turnuser", "credential": "secret" },
            { "url": "stun:stun.example.com:3478" },
        ]
    })
    .to_string()
}

/// Flows response with `creator: null` (our POST created them).
pub fn flows_body(flows: &[(&str, &str, bool)]) -> String {
    let entries: Vec<serde_json::Value> = flows
        .iter()
        .map(|(id, remote, active)| {
            serde_json::json!({
                "id": id,
                "remote_user": remote,
                "active": active,
                "creator": null,
                "sdp_step": "pending",
            })
        })
        .collect();
    serde_json::json!({ "flows": entries }).to_string()
}

pub fn flow_add_event(convid: &str, flows: &[(&str, &str, bool)]) -> String {
    let entries: Vec<serde_json::Value> = flows
        .iter()
        .map(|(id, remote, active)| {
            serde_json::json!({
                "id": id,
                "remote_user": remote,
                "active": active,
                "sdp_step": "pending",
            })
        })
        .collect();
    serde_json::json!({
        "type": "call.flow-add",
        "conversation": convid,
        "flows": entries,
    })
    .to_string()
}

pub fn remote_sdp_event(convid: &str, flowid: &str, state: &str, sdp: &str) -> String {
    serde_json::json!({
        "type": "call.remote-sdp",
        "conversation": convid,
        "flow": flowid,
        "state": state,
        "sdp": sdp,
    })
    .to_string()
}

pub fn candidates_event(convid: &str, flowid: &str, candidates: &[(&str, &str, u32)]) -> String {
    let entries: Vec<serde_json::Value> = candidates
        .iter()
        .map(|(sdp, mid, index)| {
            serde_json::json!({
                "sdp": sdp,
                "sdp_mid": mid,
                "sdp_mline_index": index,
            })
        })
        .collect();
    serde_json::json!({
        "type": "call.remote-candidates-add",
        "conversation": convid,
        "flow": flowid,
        "candidates": entries,
    })
    .to_string()
}

pub fn flow_active_event(convid: &str, flowid: &str, active: bool) -> String {
    serde_json::json!({
        "type": "call.flow-active",
        "conversation": convid,
        "flow": flowid,
        "active": active,
    })
    .to_string()
}

pub fn flow_delete_event(convid: &str, flowid: &str) -> String {
    serde_json::json!({
        "type": "call.flow-delete",
        "conversation": convid,
        "flow": flowid,
    })
    .to_string()
}
