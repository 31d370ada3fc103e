//! The public flow-manager handle.
//!
//! [`FlowManager::spawn`] starts the event-loop task and returns a
//! cloneable handle. Every method marshals its operation onto that task
//! and awaits completion, so the API behaves identically from any
//! thread or task.

use std::sync::Arc;

use driftwave_media_core::MediaSystem;
use tokio::sync::{mpsc, oneshot};

use crate::command::Command;
use crate::engine::{Engine, EngineMessage};
use crate::error::{FlowError, Result};
use crate::handlers::{FlowManagerObserver, RequestTransport};
use crate::rr::{RrId, RrTable};
use crate::state::{Ctx, State};
use crate::types::MediaCategory;

/// Handle to one flow manager.
#[derive(Clone)]
pub struct FlowManager {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl FlowManager {
    /// Spawn the event-loop task. Must be called within a tokio runtime.
    ///
    /// When the media system is already started, the call-configuration
    /// fetch is issued immediately.
    pub fn spawn(
        media: MediaSystem,
        transport: Arc<dyn RequestTransport>,
        observer: Arc<dyn FlowManagerObserver>,
    ) -> FlowManager {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Ctx {
            media,
            transport,
            observer,
            events_tx: tx.clone(),
            rrs: RrTable::default(),
            config: Default::default(),
            self_user_id: None,
            use_metrics: false,
            shutting_down: false,
        };
        tokio::spawn(Engine::new(State::new(ctx), rx).run());
        FlowManager { tx }
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::Command(build(tx)))
            .map_err(|_| FlowError::Shutdown)?;
        rx.await.map_err(|_| FlowError::Shutdown)
    }

    /// Mark the media system started and fetch the call configuration.
    pub async fn start(&self) -> Result<()> {
        self.command(|resp| Command::Start { resp }).await
    }

    /// Feed one signalling event. Returns whether the event type was
    /// handled by the calling core.
    pub async fn process_event(&self, content_type: &str, content: &str) -> Result<bool> {
        self.command(|resp| Command::ProcessEvent {
            content_type: content_type.to_string(),
            content: content.to_string(),
            resp,
        })
        .await?
    }

    /// Deliver the response of an outbound request issued through the
    /// transport.
    pub async fn resp(
        &self,
        status: u16,
        reason: &str,
        content_type: Option<&str>,
        content: Option<&str>,
        rr: RrId,
    ) -> Result<()> {
        self.command(|resp| Command::Resp {
            status,
            reason: reason.to_string(),
            content_type: content_type.map(str::to_string),
            content: content.map(str::to_string),
            rr,
            resp,
        })
        .await?
    }

    /// Acquire media flows for a conversation.
    pub async fn acquire_flows(&self, convid: &str, sessid: Option<&str>) -> Result<()> {
        self.command(|resp| Command::AcquireFlows {
            convid: convid.to_string(),
            sessid: sessid.map(str::to_string),
            resp,
        })
        .await?
    }

    /// Release all flows of a conversation and drop its call state.
    pub async fn release_flows(&self, convid: &str) -> Result<()> {
        self.command(|resp| Command::ReleaseFlows {
            convid: convid.to_string(),
            resp,
        })
        .await
    }

    /// Pre-register a conversation participant. The display name is
    /// optional.
    pub async fn user_add(
        &self,
        convid: &str,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<()> {
        self.command(|resp| Command::UserAdd {
            convid: convid.to_string(),
            user_id: user_id.to_string(),
            name: name.map(str::to_string),
            resp,
        })
        .await?
    }

    /// Set the local user id, used to resolve offer glare.
    pub async fn set_self_user_id(&self, user_id: &str) -> Result<()> {
        self.command(|resp| Command::SetSelfUserId {
            user_id: user_id.to_string(),
            resp,
        })
        .await
    }

    /// Attach a session id to a conversation, creating the call when
    /// needed.
    pub async fn set_sessid(&self, convid: &str, sessid: &str) -> Result<()> {
        self.command(|resp| Command::SetSessid {
            convid: convid.to_string(),
            sessid: sessid.to_string(),
            resp,
        })
        .await
    }

    /// Commit a media category change previously raised through the
    /// observer.
    pub async fn mcat_changed(&self, convid: &str, category: MediaCategory) -> Result<()> {
        self.command(|resp| Command::McatChanged {
            convid: convid.to_string(),
            category,
            resp,
        })
        .await
    }

    /// The local network changed; restart every flow on every call.
    pub async fn network_changed(&self) -> Result<()> {
        self.command(|resp| Command::NetworkChanged { resp }).await
    }

    /// Audio interruption started or ended for a conversation.
    pub async fn interruption(&self, convid: &str, interrupted: bool) -> Result<()> {
        self.command(|resp| Command::Interruption {
            convid: convid.to_string(),
            interrupted,
            resp,
        })
        .await?
    }

    /// Whether RTP is flowing for the conversation.
    pub async fn has_media(&self, convid: &str) -> Result<bool> {
        self.command(|resp| Command::HasMedia {
            convid: convid.to_string(),
            resp,
        })
        .await
    }

    /// Whether any call has established media.
    pub async fn has_active(&self) -> Result<bool> {
        self.command(|resp| Command::HasActive { resp }).await
    }

    /// Whether the call configuration has been fetched.
    pub async fn is_ready(&self) -> Result<bool> {
        self.command(|resp| Command::IsReady { resp }).await
    }

    /// Number of known participants of a conversation.
    pub async fn users_count(&self, convid: &str) -> Result<usize> {
        self.command(|resp| Command::UsersCount {
            convid: convid.to_string(),
            resp,
        })
        .await
    }

    /// Enable or disable metrics reporting.
    pub async fn enable_metrics(&self, enable: bool) -> Result<()> {
        self.command(|resp| Command::EnableMetrics { enable, resp })
            .await
    }

    /// The access token was refreshed; re-fetch the call configuration.
    pub async fn refresh_access_token(&self) -> Result<()> {
        self.command(|resp| Command::RefreshAccessToken { resp })
            .await
    }

    /// POST call metrics for one conversation.
    pub async fn send_metrics(&self, convid: &str, sub: Option<&str>) -> Result<()> {
        self.command(|resp| Command::SendMetrics {
            convid: convid.to_string(),
            sub: sub.map(str::to_string),
            resp,
        })
        .await?
    }

    /// Render the manager state for diagnostics.
    pub async fn debug_dump(&self) -> Result<String> {
        self.command(|resp| Command::DebugDump { resp }).await
    }

    /// Terminate the event loop: every pending request observes a
    /// synthetic 499 response and every call is released.
    pub async fn shutdown(&self) -> Result<()> {
        self.command(|resp| Command::Shutdown { resp }).await
    }
}
