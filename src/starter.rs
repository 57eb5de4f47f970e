//! The execution-subprocess collaborator.
//!
//! A claim asks the [`Starter`] to launch one process per activation and to
//! deliver signals to it. Exits are reported asynchronously as
//! [`Event::StarterExited`].

use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;

use crate::config::StarterConfig;
use crate::error::{Result, StartdError};
use crate::event::{Event, EventSender};
use crate::policy::Attributes;
use crate::slot::SlotId;

/// Exit code a starter uses when it lost its connection to the remote client.
pub const LOST_CONNECTION_EXIT_CODE: i32 = 2;

/// How hard to ask a running job to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationIntent {
    /// Vacate: let the job clean up within its vacate time
    Graceful,
    /// Fast shutdown of the job
    Hard,
    /// Kill the starter's whole process group
    ForceGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarterSignal {
    Terminate(TerminationIntent),
    Suspend,
    Continue,
    Checkpoint,
    NewProc,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StarterId(pub u32);

impl std::fmt::Display for StarterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarterExit {
    Exited(i32),
    Signaled(i32),
}

impl StarterExit {
    pub fn lost_connection(self) -> bool {
        self == StarterExit::Exited(LOST_CONNECTION_EXIT_CODE)
    }
}

/// What to launch for one activation.
#[derive(Debug, Clone)]
pub struct StarterSpec {
    pub slot: SlotId,
    pub command: String,
    pub env: Vec<(String, String)>,
}

impl StarterSpec {
    /// Build a spec from a job record. Needs a `Cmd` attribute; `Arguments`
    /// is appended when present.
    pub fn from_job(slot: SlotId, job: &Attributes) -> Option<Self> {
        let cmd = job.get("Cmd").and_then(|v| v.as_str())?;
        let command = match job.get("Arguments").and_then(|v| v.as_str()) {
            Some(args) if !args.is_empty() => format!("{} {}", cmd, args),
            _ => cmd.to_string(),
        };
        let mut env = Vec::new();
        for key in ["ClusterId", "ProcId", "GlobalJobId", "Owner"] {
            if let Some(v) = job.get(key) {
                let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                env.push((format!("_SLOTD_{}", key.to_ascii_uppercase()), value));
            }
        }
        Some(Self { slot, command, env })
    }
}

pub trait Starter: Send + Sync {
    /// Whether this starter can run the given job at all.
    fn can_run(&self, job: &Attributes) -> bool {
        job.get("Cmd").and_then(|v| v.as_str()).is_some()
    }

    /// Launch the process. Its exit is posted to `events`.
    fn spawn(&self, spec: &StarterSpec, events: &EventSender) -> Result<StarterId>;

    fn signal(&self, starter: StarterId, signal: StarterSignal) -> Result<()>;
}

/// Runs each activation as a shell command in its own process group.
/// Every signal goes to the whole group, and only while the leader is
/// still unreaped.
#[derive(Debug, Clone)]
pub struct ProcessStarter {
    config: StarterConfig,
    live: Arc<Mutex<HashSet<StarterId>>>,
}

impl ProcessStarter {
    pub fn new(config: StarterConfig) -> Self {
        Self {
            config,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn is_live(&self, starter: StarterId) -> bool {
        self.live
            .lock()
            .map(|live| live.contains(&starter))
            .unwrap_or(false)
    }

    fn os_signal(signal: StarterSignal) -> Signal {
        match signal {
            StarterSignal::Terminate(TerminationIntent::Graceful) => Signal::SIGTERM,
            StarterSignal::Terminate(TerminationIntent::Hard) => Signal::SIGQUIT,
            StarterSignal::Terminate(TerminationIntent::ForceGroup) => Signal::SIGKILL,
            StarterSignal::Suspend => Signal::SIGSTOP,
            StarterSignal::Continue => Signal::SIGCONT,
            StarterSignal::Checkpoint => Signal::SIGUSR2,
            StarterSignal::NewProc => Signal::SIGHUP,
            StarterSignal::Hold => Signal::SIGUSR1,
        }
    }
}

impl Starter for ProcessStarter {
    fn spawn(&self, spec: &StarterSpec, events: &EventSender) -> Result<StarterId> {
        tracing::info!(slot = %spec.slot, command = %spec.command, "Spawning starter");

        let mut child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(&spec.command)
            .envs(spec.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| StartdError::Starter(format!("spawn failed: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| StartdError::Starter("child exited before reporting a pid".into()))?;
        let starter = StarterId(pid);
        let slot = spec.slot;
        let events = events.clone();
        if let Ok(mut live) = self.live.lock() {
            live.insert(starter);
        }
        let live = self.live.clone();

        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => match (status.code(), status.signal()) {
                    (Some(code), _) => StarterExit::Exited(code),
                    (None, Some(sig)) => StarterExit::Signaled(sig),
                    (None, None) => StarterExit::Exited(-1),
                },
                Err(e) => {
                    tracing::error!(slot = %slot, pid, error = %e, "Failed to wait for starter");
                    StarterExit::Exited(-1)
                }
            };
            if let Ok(mut live) = live.lock() {
                live.remove(&starter);
            }
            tracing::info!(slot = %slot, pid, exit = ?exit, "Starter exited");
            let _ = events.send(Event::StarterExited {
                slot,
                starter,
                exit,
            });
        });

        Ok(starter)
    }

    fn signal(&self, starter: StarterId, signal: StarterSignal) -> Result<()> {
        let sig = Self::os_signal(signal);
        if !self.is_live(starter) {
            return Err(StartdError::Starter(format!(
                "signal {:?} to {} failed: starter already exited",
                sig, starter
            )));
        }
        signal::killpg(Pid::from_raw(starter.0 as i32), sig).map_err(|errno| {
            StartdError::Starter(format!("signal {:?} to {} failed: {}", sig, starter, errno))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use serde_json::json;
    use std::time::Duration;

    fn job(v: serde_json::Value) -> Attributes {
        v.as_object().cloned().unwrap()
    }

    /// Zombies awaiting reaping count as gone.
    fn running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| !stat.contains(") Z"))
            .unwrap_or(false)
    }

    #[test]
    fn spec_from_job_requires_cmd() {
        assert!(StarterSpec::from_job(SlotId(1), &job(json!({"Owner": "bob"}))).is_none());

        let spec = StarterSpec::from_job(
            SlotId(1),
            &job(json!({"Cmd": "sleep", "Arguments": "5", "ClusterId": 12, "Owner": "bob"})),
        )
        .unwrap();
        assert_eq!(spec.command, "sleep 5");
        assert!(spec
            .env
            .contains(&("_SLOTD_CLUSTERID".to_string(), "12".to_string())));
        assert!(spec
            .env
            .contains(&("_SLOTD_OWNER".to_string(), "bob".to_string())));
    }

    #[test]
    fn lost_connection_exit_code() {
        assert!(StarterExit::Exited(2).lost_connection());
        assert!(!StarterExit::Exited(0).lost_connection());
        assert!(!StarterExit::Signaled(2).lost_connection());
    }

    #[tokio::test]
    async fn process_starter_reports_exit() {
        let (tx, mut rx) = event::channel();
        let starter = ProcessStarter::new(StarterConfig::default());
        let spec = StarterSpec::from_job(SlotId(3), &job(json!({"Cmd": "exit 7"}))).unwrap();
        let id = starter.spawn(&spec, &tx).unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            Event::StarterExited {
                slot,
                starter: exited,
                exit,
            } => {
                assert_eq!(slot, SlotId(3));
                assert_eq!(exited, id);
                assert_eq!(exit, StarterExit::Exited(7));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn graceful_terminate_reaches_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("child.pid");
        let (tx, mut rx) = event::channel();
        let starter = ProcessStarter::new(StarterConfig::default());
        // Backgrounded child of the group leader
        let cmd = format!("sleep 30 & echo $! > {}; wait", marker.display());
        let spec = StarterSpec::from_job(SlotId(1), &job(json!({"Cmd": cmd}))).unwrap();
        let id = starter.spawn(&spec, &tx).unwrap();

        let child_pid = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(text) = std::fs::read_to_string(&marker) {
                    if let Ok(pid) = text.trim().parse::<i32>() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        starter
            .signal(id, StarterSignal::Terminate(TerminationIntent::Graceful))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while running(child_pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "the backgrounded child should be terminated too");
    }

    #[tokio::test]
    async fn exited_starter_is_not_signalled() {
        let (tx, mut rx) = event::channel();
        let starter = ProcessStarter::new(StarterConfig::default());
        let spec = StarterSpec::from_job(SlotId(1), &job(json!({"Cmd": "exit 0"}))).unwrap();
        let id = starter.spawn(&spec, &tx).unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(starter.signal(id, StarterSignal::Suspend).is_err());
    }

    #[tokio::test]
    async fn process_starter_force_group_kills() {
        let (tx, mut rx) = event::channel();
        let starter = ProcessStarter::new(StarterConfig::default());
        let spec = StarterSpec::from_job(SlotId(1), &job(json!({"Cmd": "sleep 30"}))).unwrap();
        let id = starter.spawn(&spec, &tx).unwrap();

        starter
            .signal(id, StarterSignal::Terminate(TerminationIntent::ForceGroup))
            .unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            ev,
            Event::StarterExited {
                exit: StarterExit::Signaled(9),
                ..
            }
        ));
    }
}
