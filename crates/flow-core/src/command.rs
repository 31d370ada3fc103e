//! The marshal: typed commands carried from any application thread onto
//! the event-loop task.
//!
//! Every public operation is one [`Command`] variant with its arguments
//! and a oneshot completion sender; [`State::dispatch`] is the single
//! dispatcher. The sending side blocks (awaits) until the handler has
//! run to completion, so operations are observably identical from every
//! thread.

use tokio::sync::oneshot;

use crate::error::Result;
use crate::rr::RrId;
use crate::state::State;
use crate::types::MediaCategory;

pub(crate) enum Command {
    Start {
        resp: oneshot::Sender<()>,
    },
    ProcessEvent {
        content_type: String,
        content: String,
        resp: oneshot::Sender<Result<bool>>,
    },
    Resp {
        status: u16,
        reason: String,
        content_type: Option<String>,
        content: Option<String>,
        rr: RrId,
        resp: oneshot::Sender<Result<()>>,
    },
    AcquireFlows {
        convid: String,
        sessid: Option<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    ReleaseFlows {
        convid: String,
        resp: oneshot::Sender<()>,
    },
    UserAdd {
        convid: String,
        user_id: String,
        name: Option<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    SetSelfUserId {
        user_id: String,
        resp: oneshot::Sender<()>,
    },
    SetSessid {
        convid: String,
        sessid: String,
        resp: oneshot::Sender<()>,
    },
    McatChanged {
        convid: String,
        category: MediaCategory,
        resp: oneshot::Sender<()>,
    },
    NetworkChanged {
        resp: oneshot::Sender<()>,
    },
    Interruption {
        convid: String,
        interrupted: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    HasMedia {
        convid: String,
        resp: oneshot::Sender<bool>,
    },
    HasActive {
        resp: oneshot::Sender<bool>,
    },
    IsReady {
        resp: oneshot::Sender<bool>,
    },
    UsersCount {
        convid: String,
        resp: oneshot::Sender<usize>,
    },
    EnableMetrics {
        enable: bool,
        resp: oneshot::Sender<()>,
    },
    RefreshAccessToken {
        resp: oneshot::Sender<()>,
    },
    SendMetrics {
        convid: String,
        sub: Option<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    DebugDump {
        resp: oneshot::Sender<String>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

impl State {
    /// Run one command to completion. Returns `true` when the engine
    /// should terminate.
    pub fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::Start { resp } => {
                self.start();
                let _ = resp.send(());
            }
            Command::ProcessEvent {
                content_type,
                content,
                resp,
            } => {
                let _ = resp.send(self.process_event(&content_type, &content));
            }
            Command::Resp {
                status,
                reason,
                content_type,
                content,
                rr,
                resp,
            } => {
                let _ = resp.send(self.resp(
                    status,
                    &reason,
                    content_type.as_deref(),
                    content.as_deref(),
                    rr,
                ));
            }
            Command::AcquireFlows {
                convid,
                sessid,
                resp,
            } => {
                let _ = resp.send(self.acquire_flows(&convid, sessid.as_deref()));
            }
            Command::ReleaseFlows { convid, resp } => {
                self.release_flows(&convid);
                let _ = resp.send(());
            }
            Command::UserAdd {
                convid,
                user_id,
                name,
                resp,
            } => {
                let _ = resp.send(self.user_add(&convid, &user_id, name.as_deref()));
            }
            Command::SetSelfUserId { user_id, resp } => {
                tracing::info!(user_id = %user_id, "self user id set");
                self.ctx.self_user_id = Some(user_id);
                let _ = resp.send(());
            }
            Command::SetSessid {
                convid,
                sessid,
                resp,
            } => {
                self.set_sessid(&convid, &sessid);
                let _ = resp.send(());
            }
            Command::McatChanged {
                convid,
                category,
                resp,
            } => {
                self.mcat_changed(&convid, category);
                let _ = resp.send(());
            }
            Command::NetworkChanged { resp } => {
                self.network_changed();
                let _ = resp.send(());
            }
            Command::Interruption {
                convid,
                interrupted,
                resp,
            } => {
                let _ = resp.send(self.interruption(&convid, interrupted));
            }
            Command::HasMedia { convid, resp } => {
                let _ = resp.send(self.has_media(&convid));
            }
            Command::HasActive { resp } => {
                let _ = resp.send(self.has_active());
            }
            Command::IsReady { resp } => {
                let _ = resp.send(self.ctx.config.ready);
            }
            Command::UsersCount { convid, resp } => {
                let _ = resp.send(self.users_count(&convid));
            }
            Command::EnableMetrics { enable, resp } => {
                self.ctx.use_metrics = enable;
                let _ = resp.send(());
            }
            Command::RefreshAccessToken { resp } => {
                self.refresh_access_token();
                let _ = resp.send(());
            }
            Command::SendMetrics { convid, sub, resp } => {
                let _ = resp.send(self.send_metrics(&convid, sub.as_deref()));
            }
            Command::DebugDump { resp } => {
                let _ = resp.send(self.debug_dump());
            }
            Command::Shutdown { resp } => {
                self.teardown();
                let _ = resp.send(());
                return true;
            }
        }
        false
    }
}
