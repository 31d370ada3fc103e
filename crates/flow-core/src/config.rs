//! Call-configuration fetch and refresh.
//!
//! The configuration (`GET /calls/config`) carries the ICE servers. It is
//! fetched on start and on every access-token refresh, re-fetched at 90%
//! of its expiry, and retried after a minute on failure. Calls acquired
//! while the fetch is outstanding are queued and drained on arrival.

use std::time::{Duration, Instant};

use driftwave_backend_api::{paths, CallConfig};
use driftwave_media_core::IceServer;

use crate::handlers::Method;
use crate::rr::{RrId, RrKind};
use crate::state::State;

/// Nominal lifetime of a fetched configuration.
pub(crate) const DEFAULT_EXPIRY: Duration = Duration::from_secs(7200);

/// Retry interval after a failed fetch.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration fetch state.
#[derive(Debug, Default)]
pub(crate) struct ConfigState {
    /// A fetch is outstanding; flows POSTs wait for it.
    pub pending: bool,
    /// A configuration has been received at least once.
    pub ready: bool,
    /// Decoded ICE servers of the current configuration.
    pub servers: Vec<IceServer>,
    /// Outstanding fetch request.
    pub rr: Option<RrId>,
    /// When to fetch again.
    pub refresh_at: Option<Instant>,
}

impl State {
    /// Start (or restart) the configuration fetch.
    pub fn start_config_fetch(&mut self) {
        tracing::info!(path = %paths::config(), "requesting call config");
        if let Some(rr) = self.ctx.config.rr.take() {
            self.ctx.rrs.cancel(rr);
        }
        self.ctx.config.refresh_at = None;

        match self.ctx.send_request(
            None,
            Some(RrKind::CallConfig),
            Method::Get,
            paths::config(),
            None,
        ) {
            Ok(rr) => self.ctx.config.rr = rr,
            Err(e) => {
                tracing::warn!(error = %e, "call config request failed");
                self.ctx.config.refresh_at = Some(Instant::now() + RETRY_INTERVAL);
            }
        }
    }

    /// Handle the configuration response.
    pub fn config_response(&mut self, status: u16, json: Option<serde_json::Value>) {
        self.ctx.config.rr = None;

        let servers = if !(200..300).contains(&status) {
            tracing::warn!(status, "call config fetch failed");
            None
        } else {
            match json.map(serde_json::from_value::<CallConfig>) {
                Some(Ok(config)) if !config.ice_servers.is_empty() => {
                    match self.ctx.media.set_call_config(&config) {
                        Ok(servers) => Some(servers),
                        Err(e) => {
                            tracing::warn!(error = %e, "could not decode ice servers");
                            None
                        }
                    }
                }
                Some(Ok(_)) => {
                    tracing::warn!("call config carries no ice servers");
                    None
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "malformed call config");
                    None
                }
                None => {
                    tracing::warn!("empty call config response");
                    None
                }
            }
        };

        match servers {
            Some(servers) => {
                tracing::info!(ice_servers = servers.len(), "call config ready");
                self.ctx.config.servers = servers;
                self.ctx.config.pending = false;
                self.ctx.config.ready = true;
                self.ctx.config.refresh_at = Some(Instant::now() + DEFAULT_EXPIRY * 9 / 10);

                let waiting = std::mem::take(&mut self.post_pending);
                for convid in waiting {
                    if let Some(call) = self.calls.get_mut(&convid) {
                        tracing::info!(convid = %convid, "posting postponed flows");
                        if let Err(e) = call.resume_post(&mut self.ctx) {
                            tracing::warn!(error = %e, "postponed flows post failed");
                        }
                    }
                }
            }
            None => {
                self.ctx.config.refresh_at = Some(Instant::now() + RETRY_INTERVAL);
            }
        }
    }

    /// Start the manager: mark the media system started and fetch the
    /// configuration.
    pub fn start(&mut self) {
        self.ctx.media.start();
        self.ctx.config.pending = true;
        self.start_config_fetch();
    }

    /// The access token was refreshed; the configuration must be fetched
    /// again.
    pub fn refresh_access_token(&mut self) {
        tracing::info!("access token refreshed, refetching call config");
        self.ctx.config.pending = true;
        self.start_config_fetch();
    }
}
