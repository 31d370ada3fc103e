//! Scripted end-to-end run of the flow manager against an in-process
//! stub media engine and a printing transport.
//!
//! The "backend" half of the exchange is scripted inline: the example
//! answers the configuration fetch and the flows POST itself, then
//! feeds a remote answer event, establishes the stub media flow, and
//! prints every category transition and request on the way.
//!
//! ```sh
//! cargo run -p driftwave-flow-core --example scripted_call
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::Mutex;

use driftwave_backend_api::CONTENT_TYPE_JSON;
use driftwave_flow_core::{
    FlowManager, FlowManagerObserver, MediaCategory, OutboundRequest, RequestTransport,
};
use driftwave_media_core::{
    CodecSpec, DecoderHandle, EncoderHandle, MediaEngine, MediaFlow, MediaFlowEvent,
    MediaFlowParams, MediaFlowSink, MediaSystem, MediaSystemConfig, NetInterface,
};

/// A media flow that pretends to negotiate instantly.
struct StubFlow {
    sink: Arc<dyn MediaFlowSink>,
    local_sdp: bool,
    remote_sdp: bool,
    running: bool,
}

impl MediaFlow for StubFlow {
    fn generate_offer(&mut self) -> driftwave_media_core::Result<String> {
        self.local_sdp = true;
        Ok("v=0\r\no=- stub offer\r\n".to_string())
    }

    fn generate_answer(&mut self) -> driftwave_media_core::Result<String> {
        self.local_sdp = true;
        Ok("v=0\r\no=- stub answer\r\n".to_string())
    }

    fn handle_offer(&mut self, _sdp: &str) -> driftwave_media_core::Result<()> {
        self.remote_sdp = true;
        Ok(())
    }

    fn handle_answer(&mut self, _sdp: &str) -> driftwave_media_core::Result<()> {
        self.remote_sdp = true;
        Ok(())
    }

    fn add_remote_candidate(
        &mut self,
        _sdp: &str,
        _mid: &str,
        _mline_index: u32,
    ) -> driftwave_media_core::Result<()> {
        Ok(())
    }

    fn start_ice(&mut self) -> driftwave_media_core::Result<()> {
        // A real engine completes connectivity checks asynchronously;
        // the stub succeeds on the spot.
        self.sink.deliver(MediaFlowEvent::IceEstablished {
            crypto: "dtls_srtp".to_string(),
            codec: "opus".to_string(),
            local_cand: "host".to_string(),
            remote_cand: "host".to_string(),
            peer: None,
        });
        Ok(())
    }

    fn start_media(&mut self) -> driftwave_media_core::Result<()> {
        if !self.running {
            self.running = true;
            self.sink.deliver(MediaFlowEvent::RtpStart {
                started: true,
                video: false,
            });
        }
        Ok(())
    }

    fn stop_media(&mut self) {
        self.running = false;
    }

    fn hold_media(&mut self, hold: bool) {
        if hold {
            self.running = false;
        }
    }

    fn is_gathered(&self) -> bool {
        true
    }

    fn sdp_is_complete(&self) -> bool {
        self.local_sdp && self.remote_sdp
    }

    fn reset_sdp_state(&mut self) {
        self.local_sdp = false;
        self.remote_sdp = false;
    }

    fn reset_media(&mut self) {}

    fn dtls_ready(&self) -> bool {
        true
    }

    fn ice_ready(&self) -> bool {
        true
    }

    fn encoder(&self) -> Option<EncoderHandle> {
        Some(EncoderHandle(1))
    }

    fn decoder(&self) -> Option<DecoderHandle> {
        Some(DecoderHandle(1))
    }

    fn audio_levels(&self) -> Option<(f32, f32)> {
        self.running.then_some((0.5, 0.5))
    }

    fn enable_privacy(&mut self, _enable: bool) {}

    fn add_video(&mut self, _codecs: &[CodecSpec]) -> driftwave_media_core::Result<()> {
        Ok(())
    }

    fn add_local_host_candidate(
        &mut self,
        _ifname: &str,
        _addr: IpAddr,
    ) -> driftwave_media_core::Result<()> {
        Ok(())
    }

    fn gather_stun(&mut self, _host: &str, _port: u16) -> driftwave_media_core::Result<()> {
        Ok(())
    }

    fn gather_turn(
        &mut self,
        _host: &str,
        _port: u16,
        _username: &str,
        _credential: &str,
    ) -> driftwave_media_core::Result<()> {
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
        Ok(())
    }

    fn set_tag(&mut self, _tag: &str) {}
}

struct StubEngine;

impl MediaEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    fn audio_codecs(&self) -> Vec<CodecSpec> {
        vec![CodecSpec::new("opus", 48_000, 2)]
    }

    fn video_codecs(&self) -> Vec<CodecSpec> {
        Vec::new()
    }

    fn interfaces(&self) -> Vec<NetInterface> {
        vec![NetInterface {
            name: "eth0".to_string(),
            addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            loopback: false,
            link_local: false,
        }]
    }

    fn create_flow(
        &self,
        params: MediaFlowParams,
    ) -> driftwave_media_core::Result<Box<dyn MediaFlow>> {
        Ok(Box::new(StubFlow {
            sink: params.sink,
            local_sdp: false,
            remote_sdp: false,
            running: false,
        }))
    }

    fn update_conference(&self, decoders: &[DecoderHandle]) {
        println!("engine: conference decoders {decoders:?}");
    }
}

/// Records requests so the "backend" half of the script can answer them.
struct PrintingTransport {
    requests: Mutex<Vec<OutboundRequest>>,
}

impl RequestTransport for PrintingTransport {
    fn send_request(&self, request: OutboundRequest) -> driftwave_flow_core::Result<()> {
        println!("-> {} {}", request.method, request.path);
        self.requests.lock().push(request);
        Ok(())
    }
}

struct PrintingObserver;

impl FlowManagerObserver for PrintingObserver {
    fn on_category_change(&self, convid: &str, category: MediaCategory) {
        println!("observer: {convid} category -> {category}");
    }

    fn on_media_established(&self, convid: &str, established: bool) {
        println!("observer: {convid} media established={established}");
    }

    fn on_conference_order(&self, convid: &str, order: &[String]) {
        println!("observer: {convid} conference order {order:?}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> driftwave_flow_core::Result<()> {
    let media = MediaSystem::new_standalone(
        "stub",
        MediaSystemConfig::new(Arc::new(StubEngine)),
    )?;
    let transport = Arc::new(PrintingTransport {
        requests: Mutex::new(Vec::new()),
    });
    let fm = FlowManager::spawn(media, transport.clone(), Arc::new(PrintingObserver));

    fm.set_self_user_id("alice").await?;
    fm.start().await?;

    // Answer the configuration fetch.
    let config = transport.requests.lock().last().cloned().expect("config request");
    fm.resp(
        200,
        "OK",
        Some(CONTENT_TYPE_JSON),
        Some(r#"{"ice_servers":[{"url":"stun:stun.example.com:3478"}]}"#),
        config.rr.expect("config rr"),
    )
    .await?;

    // Acquire flows; answer the flows POST with one flow towards bob.
    fm.acquire_flows("cv1", Some("sess-1")).await?;
    let post = transport.requests.lock().last().cloned().expect("flows post");
    fm.resp(
        200,
        "OK",
        Some(CONTENT_TYPE_JSON),
        Some(
            r#"{"flows":[{"id":"f1","remote_user":"bob","active":true,
                          "creator":null,"sdp_step":"pending"}]}"#,
        ),
        post.rr.expect("flows rr"),
    )
    .await?;

    // Bob answers; commit the raised category so media starts.
    let answer = r#"{"type":"call.remote-sdp","conversation":"cv1","flow":"f1",
                    "state":"answer","sdp":"v=0 answer"}"#;
    fm.process_event(CONTENT_TYPE_JSON, answer).await?;
    fm.mcat_changed("cv1", MediaCategory::Call).await?;

    println!("has media: {}", fm.has_media("cv1").await?);
    println!("{}", fm.debug_dump().await?);

    fm.release_flows("cv1").await?;
    fm.shutdown().await?;
    Ok(())
}
