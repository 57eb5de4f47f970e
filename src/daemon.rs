use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::client::ClaimClient;
use crate::collector::Collector;
use crate::command::{dispatch, CommandReply, Dispatch, StartdCommand};
use crate::config::StartdConfig;
use crate::context::Context;
use crate::error::{Result, StartdError};
use crate::event::{self, EventReceiver};
use crate::manager::SlotSetManager;
use crate::policy::PolicyEvaluator;
use crate::starter::Starter;

/// A command plus the channel its reply goes back on.
#[derive(Debug)]
pub struct DaemonMessage {
    pub command: StartdCommand,
    pub reply: oneshot::Sender<CommandReply>,
}

/// In-process sender for commands to a running daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonMessage>,
}

impl DaemonHandle {
    pub fn new(tx: mpsc::Sender<DaemonMessage>) -> Self {
        Self { tx }
    }

    /// Send a command and wait for its reply.
    pub async fn send(&self, command: StartdCommand) -> Result<CommandReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DaemonMessage { command, reply })
            .await
            .map_err(|_| StartdError::DaemonStopped)?;
        rx.await.map_err(|_| StartdError::DaemonStopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The external collaborators a daemon is built from.
pub struct Collaborators {
    pub policy: Arc<dyn PolicyEvaluator>,
    pub starter: Arc<dyn Starter>,
    pub client: Arc<dyn ClaimClient>,
    pub collector: Arc<dyn Collector>,
}

/// The single event loop that owns every slot.
///
/// Commands, timer firings and starter exits are handled strictly one at a
/// time. Replies that have to wait (a grant behind a preemption, a release
/// behind a vacating job) are awaited on spawned tasks so the loop never
/// blocks on them.
pub struct StartdDaemon {
    manager: SlotSetManager,
    events: EventReceiver,
    commands: mpsc::Receiver<DaemonMessage>,
    shutting_down: bool,
}

impl StartdDaemon {
    /// Build the slot set. Must be called from within a tokio runtime since
    /// the update timers start right away.
    pub fn new(config: StartdConfig, collaborators: Collaborators) -> (Self, DaemonHandle) {
        let (events_tx, events) = event::channel();
        let ctx = Context::new(
            config,
            collaborators.policy,
            collaborators.starter,
            collaborators.client,
            events_tx,
        );
        let manager = SlotSetManager::new(ctx, collaborators.collector);
        let (tx, commands) = mpsc::channel(100);
        let daemon = Self {
            manager,
            events,
            commands,
            shutting_down: false,
        };
        (daemon, DaemonHandle { tx })
    }

    pub fn manager(&self) -> &SlotSetManager {
        &self.manager
    }

    /// Run until shutdown completes. Cancelling `shutdown` starts a graceful
    /// shutdown; a `SHUTDOWN` command may ask for a fast one.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(slots = self.manager.len(), "Slot daemon running");
        loop {
            tokio::select! {
                Some(msg) = self.commands.recv() => self.handle_message(msg),
                Some(event) = self.events.recv() => self.manager.handle_event(event),
                _ = shutdown.cancelled(), if !self.shutting_down => self.begin_shutdown(true),
                else => break,
            }

            if self.manager.exit_requested() && !self.shutting_down {
                self.begin_shutdown(true);
            }
            if self.shutting_down && self.manager.shutdown_complete() {
                break;
            }
        }

        self.manager.send_updates_and_clear_dirty();
        self.manager.final_update();
        tracing::info!("Slot daemon stopped");
    }

    fn begin_shutdown(&mut self, graceful: bool) {
        self.shutting_down = true;
        self.manager.shutdown(graceful);
    }

    fn handle_message(&mut self, msg: DaemonMessage) {
        let DaemonMessage { command, reply } = msg;
        let name = command.name();
        match dispatch(&mut self.manager, command) {
            Dispatch::Reply(answer) => {
                if let Some(reason) = answer.refuse_reason() {
                    tracing::warn!(command = name, reason = %reason, "Command refused");
                }
                let _ = reply.send(answer);
            }
            Dispatch::Deferred(pending) => {
                tokio::spawn(async move {
                    let _ = reply.send(pending.await);
                });
            }
            Dispatch::Shutdown { graceful } => {
                tracing::info!(graceful, "Shutdown requested");
                self.begin_shutdown(graceful);
                let _ = reply.send(CommandReply::Ok);
            }
        }
    }
}
