//! The event-loop task.
//!
//! One task owns the entire flow-manager state. It multiplexes marshalled
//! commands, media-flow events, and timer deadlines, processing each
//! message to completion in arrival order. Dropping the last manager
//! handle closes the channel and tears the state down.

use std::time::Instant;

use driftwave_media_core::{MediaFlowEvent, MediaFlowSink};
use tokio::sync::mpsc;

use crate::command::Command;
use crate::state::State;

/// Everything that can arrive at the event loop.
pub(crate) enum EngineMessage {
    Command(Command),
    Media {
        convid: String,
        user_id: String,
        event: MediaFlowEvent,
    },
}

/// Sink handed to each media flow; forwards its events into the owning
/// manager's event loop, tagged with conversation and user.
pub(crate) struct EngineSink {
    tx: mpsc::UnboundedSender<EngineMessage>,
    convid: String,
    user_id: String,
}

impl EngineSink {
    pub fn new(
        tx: mpsc::UnboundedSender<EngineMessage>,
        convid: &str,
        user_id: &str,
    ) -> EngineSink {
        EngineSink {
            tx,
            convid: convid.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

impl MediaFlowSink for EngineSink {
    fn deliver(&self, event: MediaFlowEvent) {
        let _ = self.tx.send(EngineMessage::Media {
            convid: self.convid.clone(),
            user_id: self.user_id.clone(),
            event,
        });
    }
}

pub(crate) struct Engine {
    state: State,
    rx: mpsc::UnboundedReceiver<EngineMessage>,
}

impl Engine {
    pub fn new(state: State, rx: mpsc::UnboundedReceiver<EngineMessage>) -> Engine {
        Engine { state, rx }
    }

    pub async fn run(mut self) {
        self.state
            .ctx
            .media
            .set_event_loop_thread(std::thread::current().id());

        if self.state.ctx.media.is_started() {
            self.state.ctx.config.pending = true;
            self.state.start_config_fetch();
        }

        loop {
            let deadline = self.state.next_deadline();
            // Due timers run before queued messages, like the timer check
            // at the top of a poll loop.
            tokio::select! {
                biased;
                _ = sleep_until_deadline(deadline) => {
                    self.state.fire_timers();
                }
                message = self.rx.recv() => match message {
                    Some(EngineMessage::Command(command)) => {
                        let shutdown = self.state.dispatch(command);
                        self.state.update_volume_timer();
                        if shutdown {
                            break;
                        }
                    }
                    Some(EngineMessage::Media { convid, user_id, event }) => {
                        self.state.media_event(&convid, &user_id, event);
                        self.state.update_volume_timer();
                    }
                    None => {
                        self.state.teardown();
                        break;
                    }
                },
            }
        }
        tracing::info!("flow manager event loop ended");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}
