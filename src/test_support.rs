//! Collaborator doubles shared by the unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::claim::ClaimId;
use crate::client::{AliveOutcome, ClaimClient};
use crate::config::StartdConfig;
use crate::context::Context;
use crate::error::{Result, StartdError};
use crate::event::{self, Event, EventReceiver, EventSender};
use crate::policy::ExprPolicy;
use crate::starter::{Starter, StarterId, StarterSignal, StarterSpec};
use crate::timer::{TimerFired, TimerTarget};

/// Records spawns and signals instead of running processes.
#[derive(Default)]
pub struct RecordingStarter {
    next: AtomicU32,
    fail_spawn: bool,
    spawned: Mutex<Vec<StarterSpec>>,
    signals: Mutex<Vec<(StarterId, StarterSignal)>>,
    failing_signals: Mutex<Vec<StarterSignal>>,
}

impl RecordingStarter {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::new()
        }
    }

    pub fn fail_signal(&self, signal: StarterSignal) {
        self.failing_signals.lock().unwrap().push(signal);
    }

    pub fn spawned(&self) -> Vec<StarterSpec> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<(StarterId, StarterSignal)> {
        self.signals.lock().unwrap().clone()
    }
}

impl Starter for RecordingStarter {
    fn spawn(&self, spec: &StarterSpec, _events: &EventSender) -> Result<StarterId> {
        if self.fail_spawn {
            return Err(StartdError::Starter("spawn disabled".into()));
        }
        self.spawned.lock().unwrap().push(spec.clone());
        Ok(StarterId(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn signal(&self, starter: StarterId, signal: StarterSignal) -> Result<()> {
        self.signals.lock().unwrap().push((starter, signal));
        if self.failing_signals.lock().unwrap().contains(&signal) {
            return Err(StartdError::Starter("no such process".into()));
        }
        Ok(())
    }
}

/// Records outbound client messages and answers ALIVEs with a fixed outcome.
pub struct RecordingClient {
    outcome: Mutex<AliveOutcome>,
    alives: Mutex<Vec<(String, ClaimId)>>,
    vacates: Mutex<Vec<(String, ClaimId)>>,
}

impl Default for RecordingClient {
    fn default() -> Self {
        Self {
            outcome: Mutex::new(AliveOutcome::Acknowledged),
            alives: Mutex::new(Vec::new()),
            vacates: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingClient {
    pub fn set_outcome(&self, outcome: AliveOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn alives(&self) -> Vec<(String, ClaimId)> {
        self.alives.lock().unwrap().clone()
    }

    pub fn vacates(&self) -> Vec<(String, ClaimId)> {
        self.vacates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClaimClient for RecordingClient {
    async fn send_alive(&self, addr: &str, claim: &ClaimId) -> AliveOutcome {
        self.alives
            .lock()
            .unwrap()
            .push((addr.to_string(), claim.clone()));
        self.outcome.lock().unwrap().clone()
    }

    async fn vacate(&self, addr: &str, claim: &ClaimId) {
        self.vacates
            .lock()
            .unwrap()
            .push((addr.to_string(), claim.clone()));
    }
}

/// A context plus handles on every double it was built from.
pub struct TestRig {
    pub ctx: Context,
    pub events: EventReceiver,
    pub starter: Arc<RecordingStarter>,
    pub client: Arc<RecordingClient>,
    pub policy: Arc<ExprPolicy>,
}

impl TestRig {
    pub fn new(config: StartdConfig) -> Self {
        Self::with_starter(config, RecordingStarter::new())
    }

    pub fn with_starter(config: StartdConfig, starter: RecordingStarter) -> Self {
        let (tx, events) = event::channel();
        let policy = Arc::new(ExprPolicy::from_config(&config.policy).unwrap());
        let starter = Arc::new(starter);
        let client = Arc::new(RecordingClient::default());
        let ctx = Context::new(config, policy.clone(), starter.clone(), client.clone(), tx);
        Self {
            ctx,
            events,
            starter,
            client,
            policy,
        }
    }

    /// Wait for the next timer firing that matches `pred`, skipping others.
    pub async fn next_timer(&mut self, pred: impl Fn(&TimerTarget) -> bool) -> TimerFired {
        loop {
            match self.events.recv().await {
                Some(Event::Timer(fired)) if pred(&fired.target) => return fired,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }
}

pub fn test_context() -> (Context, EventReceiver) {
    test_context_with(StartdConfig::default())
}

pub fn test_context_with(config: StartdConfig) -> (Context, EventReceiver) {
    let rig = TestRig::new(config);
    (rig.ctx, rig.events)
}
