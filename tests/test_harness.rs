//! Test harness for daemon-level integration tests.
//!
//! Runs a full `StartdDaemon` in-process with a scripted starter, an
//! in-memory collector and a peer registry, and offers polling helpers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use slotd::client::PeerRegistry;
use slotd::collector::{Collector, MemoryCollector};
use slotd::command::{CommandReply, StartdCommand};
use slotd::config::{StartdConfig, TimingConfig};
use slotd::daemon::{Collaborators, DaemonHandle, StartdDaemon};
use slotd::error::Result;
use slotd::event::{Event, EventSender};
use slotd::policy::{Attributes, ExprPolicy, PolicyEvaluator};
use slotd::slot::{SlotId, SlotRecord, State};
use slotd::starter::{Starter, StarterExit, StarterId, StarterSignal, StarterSpec};

/// Timings short enough that a test sees several poll and update cycles.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        update_interval_secs: 2,
        polling_interval_secs: 1,
        killing_timeout_secs: 2,
        dirty_update_delay_ms: 50,
        ..TimingConfig::default()
    }
}

pub fn test_config(slots: usize) -> StartdConfig {
    StartdConfig::default()
        .with_static_slots(slots)
        .with_timing(fast_timing())
}

pub fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Pretends to run jobs. A job "exits" when it is told to terminate, or
/// when a test calls [`ScriptedStarter::finish`].
#[derive(Default)]
pub struct ScriptedStarter {
    next: AtomicU32,
    running: Mutex<HashMap<StarterId, (SlotId, EventSender)>>,
    spawned: Mutex<Vec<StarterSpec>>,
    signals: Mutex<Vec<(StarterId, StarterSignal)>>,
}

impl ScriptedStarter {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(5000),
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> Vec<StarterSpec> {
        self.spawned.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn signals(&self) -> Vec<(StarterId, StarterSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn running(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Let every running job exit with `code`.
    #[allow(dead_code)]
    pub fn finish_all(&self, code: i32) {
        let running: Vec<_> = self.running.lock().unwrap().drain().collect();
        for (starter, (slot, events)) in running {
            let _ = events.send(Event::StarterExited {
                slot,
                starter,
                exit: StarterExit::Exited(code),
            });
        }
    }

    fn exit(&self, starter: StarterId, exit: StarterExit) {
        if let Some((slot, events)) = self.running.lock().unwrap().remove(&starter) {
            let _ = events.send(Event::StarterExited {
                slot,
                starter,
                exit,
            });
        }
    }
}

impl Starter for ScriptedStarter {
    fn spawn(&self, spec: &StarterSpec, events: &EventSender) -> Result<StarterId> {
        let starter = StarterId(self.next.fetch_add(1, Ordering::Relaxed));
        self.spawned.lock().unwrap().push(spec.clone());
        self.running
            .lock()
            .unwrap()
            .insert(starter, (spec.slot, events.clone()));
        Ok(starter)
    }

    fn signal(&self, starter: StarterId, signal: StarterSignal) -> Result<()> {
        self.signals.lock().unwrap().push((starter, signal));
        if let StarterSignal::Terminate(_) = signal {
            // 143 = killed by SIGTERM, as a shell reports it
            self.exit(starter, StarterExit::Exited(143));
        }
        Ok(())
    }
}

/// A daemon running on the current runtime.
pub struct TestStartd {
    pub handle: DaemonHandle,
    pub collector: MemoryCollector,
    pub peers: PeerRegistry,
    pub starter: Arc<ScriptedStarter>,
    pub policy: Arc<dyn PolicyEvaluator>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TestStartd {
    pub async fn start(config: StartdConfig) -> Self {
        let policy: Arc<dyn PolicyEvaluator> =
            Arc::new(ExprPolicy::from_config(&config.policy).unwrap());
        let collector = MemoryCollector::new();
        let peers = PeerRegistry::new();
        let starter = Arc::new(ScriptedStarter::new());
        let slots = config.slots.len();

        let (daemon, handle) = StartdDaemon::new(
            config,
            Collaborators {
                policy: policy.clone(),
                starter: starter.clone(),
                client: Arc::new(peers.clone()),
                collector: Arc::new(collector.clone()),
            },
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(daemon.run(shutdown.clone()));

        let startd = Self {
            handle,
            collector,
            peers,
            starter,
            policy,
            shutdown,
            task: Some(task),
        };
        assert_eventually(
            || async { startd.collector.records().len() >= slots },
            Duration::from_secs(5),
            "slots should publish their first records",
        )
        .await;
        startd
    }

    pub async fn send(&self, command: StartdCommand) -> CommandReply {
        self.handle.send(command).await.unwrap()
    }

    pub async fn slots(&self) -> Vec<SlotRecord> {
        match self.send(StartdCommand::QuerySlots).await {
            CommandReply::Slots { records, .. } => records,
            other => panic!("unexpected reply to QUERY_SLOTS: {:?}", other),
        }
    }

    pub async fn slot(&self, name: &str) -> SlotRecord {
        self.slots()
            .await
            .into_iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no slot named {}", name))
    }

    /// The token a client would fetch from the collector to claim `name`.
    pub async fn token(&self, name: &str) -> String {
        self.slot(name).await.claim_id().unwrap().to_string()
    }

    pub async fn state_of(&self, name: &str) -> (Option<State>, Option<String>) {
        let record = self.slot(name).await;
        let activity = record
            .public
            .get("Activity")
            .and_then(Value::as_str)
            .map(str::to_string);
        (record.state(), activity)
    }

    /// Request a claim on `name` and activate it with `job`.
    pub async fn claim_and_run(&self, name: &str, job: Attributes) -> String {
        let token = self.token(name).await;
        let reply = self
            .send(StartdCommand::RequestClaim {
                claim_id: token.clone(),
                request: job.clone(),
                client: Default::default(),
                alive_interval_secs: None,
            })
            .await;
        let CommandReply::Granted(grant) = reply else {
            panic!("claim on {} not granted: {:?}", name, reply);
        };
        let token = grant.claim_id.secret().to_string();
        let reply = self
            .send(StartdCommand::ActivateClaim {
                claim_id: token.clone(),
                job,
            })
            .await;
        assert!(reply.is_ok(), "activation on {} failed: {:?}", name, reply);
        token
    }

    pub async fn wait_for_state(&self, name: &str, state: State, timeout: Duration) -> bool {
        wait_for(
            || async { self.slot(name).await.state() == Some(state) },
            timeout,
            Duration::from_millis(50),
        )
        .await
    }

    /// Cancel the daemon and wait for its loop to finish.
    pub async fn stop(&mut self) -> bool {
        self.shutdown.cancel();
        self.join().await
    }

    pub async fn join(&mut self) -> bool {
        match self.task.take() {
            Some(task) => tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_ok(),
            None => true,
        }
    }
}

impl Drop for TestStartd {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
