//! The process-wide media system.
//!
//! Created lazily on first request, shared by every flow manager in the
//! process, and torn down when the last handle is dropped. Owns the DTLS
//! identity, the codec registries, the event-loop thread identity, the
//! global media flags, and the current call configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use driftwave_backend_api::{CallConfig, IceScheme, IceTransport, IceUri};

use crate::codec::CodecRegistry;
use crate::dtls::DtlsIdentity;
use crate::error::{MediaError, Result};
use crate::flow::{DecoderHandle, MediaEngine};

/// One decoded ICE server from the call configuration.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub scheme: IceScheme,
    pub transport: IceTransport,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Configuration applied when the media system is first created.
#[derive(Clone)]
pub struct MediaSystemConfig {
    pub engine: Arc<dyn MediaEngine>,
    pub loopback: bool,
    pub privacy: bool,
    pub enable_kase: bool,
    pub bind_interface: Option<String>,
}

impl MediaSystemConfig {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        MediaSystemConfig {
            engine,
            loopback: false,
            privacy: false,
            enable_kase: false,
            bind_interface: None,
        }
    }
}

struct Shared {
    name: String,
    engine: Arc<dyn MediaEngine>,
    dtls: Arc<DtlsIdentity>,
    audio_codecs: CodecRegistry,
    video_codecs: CodecRegistry,
    started: AtomicBool,
    tid: Mutex<Option<ThreadId>>,
    loopback: AtomicBool,
    privacy: AtomicBool,
    kase: AtomicBool,
    bind_interface: Mutex<Option<String>>,
    ice_servers: Mutex<Option<Vec<IceServer>>>,
    event_lock: ReentrantMutex<()>,
}

static CURRENT: Lazy<Mutex<Weak<Shared>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Shared handle to the process-wide media system.
#[derive(Clone)]
pub struct MediaSystem {
    shared: Arc<Shared>,
}

impl MediaSystem {
    /// Return the shared instance, creating it on first call.
    ///
    /// When an instance already exists, `config` is ignored and the
    /// existing instance is returned. Creation fails if the DTLS identity
    /// cannot be generated or the engine provides no audio codecs; the
    /// singleton then remains unset.
    pub fn get(name: &str, config: MediaSystemConfig) -> Result<MediaSystem> {
        let mut current = CURRENT.lock();
        if let Some(shared) = current.upgrade() {
            return Ok(MediaSystem { shared });
        }

        let shared = Arc::new(Self::init(name, config)?);
        *current = Arc::downgrade(&shared);
        Ok(MediaSystem { shared })
    }

    /// Create an instance that is not registered as the process-wide
    /// singleton.
    ///
    /// Embedders normally share one system through [`MediaSystem::get`];
    /// standalone instances exist for harnesses that need several
    /// independent systems in one process.
    pub fn new_standalone(name: &str, config: MediaSystemConfig) -> Result<MediaSystem> {
        Ok(MediaSystem {
            shared: Arc::new(Self::init(name, config)?),
        })
    }

    fn init(name: &str, config: MediaSystemConfig) -> Result<Shared> {
        tracing::info!(name, engine = config.engine.name(), "initializing media system");

        let dtls = Arc::new(DtlsIdentity::self_signed("dtls@driftwave")?);

        let audio_codecs = CodecRegistry::new(config.engine.audio_codecs());
        if audio_codecs.is_empty() {
            return Err(MediaError::Engine(format!(
                "engine '{}' provides no audio codecs",
                config.engine.name()
            )));
        }
        let video_codecs = CodecRegistry::new(config.engine.video_codecs());

        tracing::info!(
            audio = audio_codecs.len(),
            video = video_codecs.len(),
            "media system initialized"
        );

        Ok(Shared {
            name: name.to_string(),
            engine: config.engine,
            dtls,
            audio_codecs,
            video_codecs,
            started: AtomicBool::new(false),
            tid: Mutex::new(None),
            loopback: AtomicBool::new(config.loopback),
            privacy: AtomicBool::new(config.privacy),
            kase: AtomicBool::new(config.enable_kase),
            bind_interface: Mutex::new(config.bind_interface),
            ice_servers: Mutex::new(None),
            event_lock: ReentrantMutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.shared.engine
    }

    pub fn dtls(&self) -> Arc<DtlsIdentity> {
        self.shared.dtls.clone()
    }

    pub fn audio_codecs(&self) -> &CodecRegistry {
        &self.shared.audio_codecs
    }

    pub fn video_codecs(&self) -> &CodecRegistry {
        &self.shared.video_codecs
    }

    pub fn start(&self) {
        self.shared.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.shared.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Record the event-loop thread. Media flows must be created and torn
    /// down on that thread.
    pub fn set_event_loop_thread(&self, tid: ThreadId) {
        tracing::info!(?tid, "media system event-loop thread set");
        *self.shared.tid.lock() = Some(tid);
    }

    pub fn on_event_loop_thread(&self) -> bool {
        match *self.shared.tid.lock() {
            Some(tid) => tid == std::thread::current().id(),
            None => false,
        }
    }

    /// Acquire the event lock when called off the event-loop thread.
    ///
    /// Returns `None` (no-op) on the event-loop thread itself; the lock
    /// is re-entrant, so nested acquisition from one thread is fine.
    pub fn enter(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        if self.shared.tid.lock().is_none() {
            tracing::warn!("media system enter: event-loop thread not set");
            return None;
        }
        if self.on_event_loop_thread() {
            return None;
        }
        Some(self.shared.event_lock.lock())
    }

    pub fn enable_loopback(&self, enable: bool) {
        self.shared.loopback.store(enable, Ordering::SeqCst);
    }

    pub fn loopback(&self) -> bool {
        self.shared.loopback.load(Ordering::SeqCst)
    }

    pub fn enable_privacy(&self, enable: bool) {
        tracing::info!(enable, "media flow privacy");
        self.shared.privacy.store(enable, Ordering::SeqCst);
    }

    pub fn privacy(&self) -> bool {
        self.shared.privacy.load(Ordering::SeqCst)
    }

    pub fn enable_kase(&self, enable: bool) {
        self.shared.kase.store(enable, Ordering::SeqCst);
    }

    pub fn have_kase(&self) -> bool {
        self.shared.kase.load(Ordering::SeqCst)
    }

    pub fn set_bind_interface(&self, ifname: Option<&str>) {
        if let Some(ifname) = ifname {
            tracing::info!(ifname, "binding media to network interface");
        }
        *self.shared.bind_interface.lock() = ifname.map(str::to_string);
    }

    pub fn bind_interface(&self) -> Option<String> {
        self.shared.bind_interface.lock().clone()
    }

    /// Ingest a call configuration, decoding every ICE server URI.
    ///
    /// On any undecodable URI the stored server list is cleared and an
    /// error is returned.
    pub fn set_call_config(&self, config: &CallConfig) -> Result<Vec<IceServer>> {
        let mut decoded = Vec::with_capacity(config.ice_servers.len());
        for entry in &config.ice_servers {
            let uri = match entry.url.parse::<IceUri>() {
                Ok(uri) => uri,
                Err(e) => {
                    *self.shared.ice_servers.lock() = None;
                    return Err(MediaError::IceServer {
                        url: entry.url.clone(),
                        reason: e.to_string(),
                    });
                }
            };
            decoded.push(IceServer {
                scheme: uri.scheme,
                transport: uri.transport,
                host: uri.host,
                port: uri.port,
                username: entry.username.clone(),
                credential: entry.credential.clone(),
            });
        }

        let mut servers = self.shared.ice_servers.lock();
        if decoded.is_empty() {
            tracing::warn!("call config carries no ice servers");
        }
        *servers = Some(decoded.clone());
        Ok(decoded)
    }

    pub fn call_config(&self) -> Option<Vec<IceServer>> {
        self.shared.ice_servers.lock().clone()
    }

    /// TURN servers of the current call configuration.
    pub fn turn_servers(&self) -> Vec<IceServer> {
        self.shared
            .ice_servers
            .lock()
            .as_deref()
            .map(|servers| {
                servers
                    .iter()
                    .filter(|s| s.scheme == IceScheme::Turn)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push the active conference decoders to the engine.
    pub fn update_conference(&self, decoders: &[DecoderHandle]) {
        self.shared.engine.update_conference(decoders);
    }
}

impl std::fmt::Debug for MediaSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSystem")
            .field("name", &self.shared.name)
            .field("started", &self.is_started())
            .finish()
    }
}
