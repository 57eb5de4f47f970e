//! One granted right to use a slot.
//!
//! A [`Claim`] is owned by exactly one field of its [`crate::slot::Slot`]
//! (`current`, `preempting`, or an on-demand entry). Replacing a claim means
//! assigning a fresh value into that field; dropping the old value cancels
//! every timer it held.

pub mod id;
pub mod lease;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{fatal, RefuseReason};
use crate::event::Event;
use crate::client::AliveOutcome;
use crate::policy::{Attributes, EvalContext, PolicyExpr};
use crate::slot::SlotId;
use crate::starter::{StarterExit, StarterId, StarterSignal, StarterSpec, TerminationIntent};
use crate::timer::{is_current, TimerHandle, TimerId, TimerTarget};

pub use id::{ClaimId, ClaimIdFactory};
pub use lease::ClaimLease;

/// A claim younger than this is still expected to be activated.
const MAX_ACTIVATION_DELAY: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimType {
    Opportunistic,
    /// On-demand claim layered over the opportunistic one
    Cod,
    /// Work fetched by the daemon itself rather than pushed by a client
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Unclaimed,
    Idle,
    Running,
    Suspended,
    Vacating,
    Killing,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimState::Unclaimed => "Unclaimed",
            ClaimState::Idle => "Idle",
            ClaimState::Running => "Running",
            ClaimState::Suspended => "Suspended",
            ClaimState::Vacating => "Vacating",
            ClaimState::Killing => "Killing",
        };
        f.write_str(s)
    }
}

/// Identity of the remote party holding (or requesting) the claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user: Option<String>,
    pub owner: Option<String>,
    pub accounting_group: Option<String>,
    /// Where keep-alives and vacate notices go
    pub addr: Option<String>,
    pub host: Option<String>,
}

/// Positive answer to REQUEST_CLAIM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimGrant {
    /// Name of the slot that holds the claim (a new dynamic slot for
    /// partitionable requests)
    pub slot: String,
    pub claim_id: ClaimId,
    pub lease_duration_secs: u64,
}

pub type GrantResult = std::result::Result<ClaimGrant, RefuseReason>;
pub type GrantResponder = oneshot::Sender<GrantResult>;

/// A command whose reply waits for the starter to exit.
#[derive(Debug)]
pub enum PendingCommand {
    Release(Option<oneshot::Sender<ClaimState>>),
    Deactivate(Option<oneshot::Sender<ClaimState>>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunTotals {
    pub run: Duration,
    pub suspend: Duration,
}

/// Fields that belong to one activation and are cleared by [`Claim::reset`].
#[derive(Debug, Clone, Default)]
struct Activation {
    cluster: Option<i64>,
    proc_id: Option<i64>,
    global_job_id: Option<String>,
    job_start: Option<Instant>,
    last_pckpt: Option<Instant>,
    cod_keyword: Option<String>,
}

/// Seconds since the epoch for an instant in the past.
pub(crate) fn wall_clock(at: Instant) -> i64 {
    chrono::Utc::now().timestamp() - at.elapsed().as_secs() as i64
}

#[derive(Debug)]
pub struct Claim {
    id: ClaimId,
    kind: ClaimType,
    slot: SlotId,
    cod_name: Option<String>,
    state: ClaimState,
    entered_state: Instant,

    client: Option<ClientInfo>,
    job: Option<Attributes>,
    has_job_ad: bool,
    responder: Option<GrantResponder>,
    rank: f64,

    starter: Option<StarterId>,
    activation: Activation,
    job_totals: RunTotals,
    claim_totals: RunTotals,
    activation_count: u32,
    claim_started: Option<Instant>,

    lease: ClaimLease,
    match_timer: Option<TimerHandle>,
    kill_timer: Option<TimerHandle>,
    pending: Option<PendingCommand>,

    wants_remove: bool,
    may_unretire: bool,
    retire_peacefully: bool,
    preempt_was_true: bool,
    badput_caused_by_draining: bool,
    badput_caused_by_preemption: bool,
    schedd_closed_claim: bool,
    pledged_max_vacate: Duration,
    vacate_reason: Option<String>,
}

impl Claim {
    pub fn new(ctx: &Context, slot: SlotId, kind: ClaimType) -> Self {
        Self {
            id: ctx.ids.next_id(),
            kind,
            slot,
            cod_name: None,
            state: ClaimState::Unclaimed,
            entered_state: Instant::now(),
            client: None,
            job: None,
            has_job_ad: false,
            responder: None,
            rank: 0.0,
            starter: None,
            activation: Activation::default(),
            job_totals: RunTotals::default(),
            claim_totals: RunTotals::default(),
            activation_count: 0,
            claim_started: None,
            lease: ClaimLease::new(),
            match_timer: None,
            kill_timer: None,
            pending: None,
            wants_remove: false,
            may_unretire: true,
            retire_peacefully: false,
            preempt_was_true: false,
            badput_caused_by_draining: false,
            badput_caused_by_preemption: false,
            schedd_closed_claim: false,
            pledged_max_vacate: Duration::ZERO,
            vacate_reason: None,
        }
    }

    /// An on-demand claim with its public name (`COD<n>`).
    pub fn new_cod(ctx: &Context, slot: SlotId, name: String) -> Self {
        let mut claim = Self::new(ctx, slot, ClaimType::Cod);
        claim.cod_name = Some(name);
        claim
    }

    pub fn id(&self) -> &ClaimId {
        &self.id
    }

    pub fn kind(&self) -> ClaimType {
        self.kind
    }

    pub fn is_cod(&self) -> bool {
        self.kind == ClaimType::Cod
    }

    pub fn cod_name(&self) -> Option<&str> {
        self.cod_name.as_deref()
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Move an unclaimed claim to another slot (dynamic slot split).
    pub fn set_slot(&mut self, slot: SlotId) {
        if self.lease.is_running() || self.match_timer.is_some() {
            fatal(format!("claim {} moved between slots with timers armed", self.id));
        }
        self.slot = slot;
    }

    pub fn state(&self) -> ClaimState {
        self.state
    }

    pub fn client(&self) -> Option<&ClientInfo> {
        self.client.as_ref()
    }

    pub fn client_mut(&mut self) -> &mut ClientInfo {
        self.client.get_or_insert_with(ClientInfo::default)
    }

    /// Forget the client without telling it (it is presumed gone).
    pub fn drop_client(&mut self) {
        self.client = None;
    }

    pub fn job(&self) -> Option<&Attributes> {
        self.job.as_ref()
    }

    pub fn has_job_ad(&self) -> bool {
        self.has_job_ad
    }

    pub fn set_job(&mut self, job: Attributes) {
        self.job = Some(job);
        self.has_job_ad = true;
    }

    pub fn rank(&self) -> f64 {
        self.rank
    }

    pub fn set_rank(&mut self, rank: f64) {
        self.rank = rank;
    }

    pub fn starter(&self) -> Option<StarterId> {
        self.starter
    }

    pub fn lease(&self) -> &ClaimLease {
        &self.lease
    }

    pub fn activation_count(&self) -> u32 {
        self.activation_count
    }

    pub fn cluster(&self) -> Option<i64> {
        self.activation.cluster
    }

    pub fn proc_id(&self) -> Option<i64> {
        self.activation.proc_id
    }

    pub fn global_job_id(&self) -> Option<&str> {
        self.activation.global_job_id.as_deref()
    }

    pub fn cod_keyword(&self) -> Option<&str> {
        self.activation.cod_keyword.as_deref()
    }

    pub fn set_cod_keyword(&mut self, keyword: impl Into<String>) {
        self.activation.cod_keyword = Some(keyword.into());
    }

    pub fn job_start(&self) -> Option<Instant> {
        self.activation.job_start
    }

    pub fn last_pckpt(&self) -> Option<Instant> {
        self.activation.last_pckpt
    }

    pub fn may_unretire(&self) -> bool {
        self.may_unretire
    }

    pub fn disallow_unretire(&mut self) {
        self.may_unretire = false;
    }

    pub fn retire_peacefully(&self) -> bool {
        self.retire_peacefully
    }

    pub fn set_retire_peacefully(&mut self, yes: bool) {
        self.retire_peacefully = yes;
    }

    pub fn preempt_was_true(&self) -> bool {
        self.preempt_was_true
    }

    pub fn set_preempt_was_true(&mut self) {
        self.preempt_was_true = true;
    }

    pub fn badput_caused_by_draining(&self) -> bool {
        self.badput_caused_by_draining
    }

    pub fn set_badput_caused_by_draining(&mut self) {
        self.badput_caused_by_draining = true;
    }

    pub fn badput_caused_by_preemption(&self) -> bool {
        self.badput_caused_by_preemption
    }

    pub fn set_badput_caused_by_preemption(&mut self) {
        self.badput_caused_by_preemption = true;
    }

    pub fn schedd_closed_claim(&self) -> bool {
        self.schedd_closed_claim
    }

    /// The client itself gave the claim up; no vacate notice is owed.
    pub fn set_schedd_closed_claim(&mut self) {
        self.schedd_closed_claim = true;
    }

    pub fn wants_remove(&self) -> bool {
        self.wants_remove
    }

    pub fn pledged_max_vacate(&self) -> Duration {
        self.pledged_max_vacate
    }

    pub fn vacate_reason(&self) -> Option<&str> {
        self.vacate_reason.as_deref()
    }

    pub fn set_vacate_reason(&mut self, reason: impl Into<String>) {
        self.vacate_reason = Some(reason.into());
    }

    pub fn clear_vacate_reason(&mut self) {
        self.vacate_reason = None;
    }

    // -- claim request -------------------------------------------------

    /// Store a REQUEST_CLAIM whose reply waits until the claim is accepted.
    pub fn set_request(&mut self, request: Attributes, responder: Option<GrantResponder>) {
        if let Some(previous) = self.responder.take() {
            let _ = previous.send(Err(RefuseReason::WrongState));
        }
        self.job = Some(request);
        self.responder = responder;
    }

    /// True while a REQUEST_CLAIM is waiting for its answer.
    pub fn has_request(&self) -> bool {
        self.responder
            .as_ref()
            .map(|r| !r.is_closed())
            .unwrap_or(false)
    }

    pub fn take_responder(&mut self) -> Option<GrantResponder> {
        self.responder.take()
    }

    /// Refuse the pending REQUEST_CLAIM, if any.
    pub fn refuse_request(&mut self, reason: RefuseReason) {
        if let Some(responder) = self.responder.take() {
            tracing::info!(slot = %self.slot, claim = %self.id, reason = %reason, "Refusing pending claim request");
            let _ = responder.send(Err(reason));
        }
    }

    /// Load user, owner and accounting group from the stored request.
    pub fn load_accounting_info(&mut self) {
        let Some(job) = self.job.as_ref() else {
            return;
        };
        let user = str_attr(job, "User");
        let group = str_attr(job, "AccountingGroup");
        let owner = str_attr(job, "Owner");
        let client = self.client.get_or_insert_with(ClientInfo::default);
        if user.is_some() {
            client.user = user;
        }
        if group.is_some() {
            client.accounting_group = group;
        }
        if client.owner.is_none() {
            client.owner = owner.or_else(|| client.user.clone());
        }
    }

    pub fn set_lease_duration(&mut self, duration: Duration) {
        self.lease.set_duration(duration);
    }

    pub fn set_alive_interval(&mut self, interval: Duration, max_missed: u32) {
        self.lease.set_alive_interval(interval, max_missed);
    }

    pub fn configure_lease(&mut self, default_sends_alives: bool) {
        if let Some(job) = self.job.as_ref() {
            self.lease.configure(job, default_sends_alives);
        }
    }

    // -- state ---------------------------------------------------------

    pub fn change_state(&mut self, next: ClaimState) {
        if self.state == next {
            return;
        }
        let now = Instant::now();
        let spent = now.saturating_duration_since(self.entered_state);
        match self.state {
            ClaimState::Running => {
                self.job_totals.run += spent;
                self.claim_totals.run += spent;
            }
            ClaimState::Suspended => {
                self.job_totals.suspend += spent;
                self.claim_totals.suspend += spent;
            }
            ClaimState::Unclaimed => {
                if self.claim_started.is_none() {
                    self.claim_started = Some(now);
                }
            }
            _ => {}
        }
        tracing::debug!(slot = %self.slot, claim = %self.id, from = %self.state, to = %next, "Claim state change");
        self.state = next;
        self.entered_state = now;
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ClaimState::Running | ClaimState::Suspended | ClaimState::Vacating | ClaimState::Killing
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ClaimState::Running | ClaimState::Suspended)
    }

    /// Time since the claim left Unclaimed.
    pub fn claim_age(&self) -> Duration {
        self.claim_started.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn waiting_for_activation(&self) -> bool {
        self.claim_age() < MAX_ACTIVATION_DELAY
    }

    /// Run time of the current job, including the open Running interval.
    pub fn job_total_run_time(&self) -> Duration {
        let mut run = self.job_totals.run;
        if self.state == ClaimState::Running {
            run += self.entered_state.elapsed();
        }
        run
    }

    fn current_totals(&self) -> (RunTotals, RunTotals) {
        let (mut job, mut claim) = (self.job_totals, self.claim_totals);
        let open = self.entered_state.elapsed();
        match self.state {
            ClaimState::Running => {
                job.run += open;
                claim.run += open;
            }
            ClaimState::Suspended => {
                job.suspend += open;
                claim.suspend += open;
            }
            _ => {}
        }
        (job, claim)
    }

    /// Unclaimed → Idle, arming the lease.
    pub fn begin_claim(&mut self, ctx: &Context) {
        if self.state != ClaimState::Unclaimed {
            fatal(format!(
                "begin_claim on claim {} in state {}",
                self.id, self.state
            ));
        }
        self.change_state(ClaimState::Idle);
        if self.kind != ClaimType::Fetch {
            let (slot, id, cod) = (self.slot, self.id.clone(), self.is_cod());
            self.lease.start(ctx, slot, &id, cod);
        }
    }

    // -- lease -----------------------------------------------------------

    /// Renew the lease. Fetched work holds none.
    pub fn alive(&mut self, ctx: &Context, from_client: bool) {
        if self.kind == ClaimType::Fetch {
            return;
        }
        let (slot, id, cod) = (self.slot, self.id.clone(), self.is_cod());
        self.lease.alive(ctx, slot, &id, cod, from_client);
    }

    pub fn cancel_lease(&mut self) {
        self.lease.cancel();
    }

    pub fn is_current_lease(&self, fired: TimerId) -> bool {
        self.lease.is_current_lease(fired)
    }

    pub fn is_current_send_alive(&self, fired: TimerId) -> bool {
        self.lease.is_current_send_alive(fired)
    }

    /// Push an ALIVE to the client. The answer arrives as [`Event::AliveReply`].
    pub fn send_alive(&mut self, ctx: &Context) {
        if self.lease.starter_handles_alives() && self.is_active() {
            self.alive(ctx, false);
            return;
        }
        let Some(addr) = self.client.as_ref().and_then(|c| c.addr.clone()) else {
            return;
        };
        if self.lease.alive_in_flight() {
            tracing::debug!(slot = %self.slot, claim = %self.id, "Previous ALIVE still in flight");
            return;
        }
        self.lease.set_alive_in_flight(true);

        let client = ctx.client.clone();
        let events = ctx.events.clone();
        let slot = self.slot;
        let claim = self.id.clone();
        tokio::spawn(async move {
            let outcome = client.send_alive(&addr, &claim).await;
            let _ = events.send(Event::AliveReply {
                slot,
                claim,
                outcome,
            });
        });
    }

    /// Handle the answer to a pushed ALIVE. Returns false when the client
    /// no longer recognises the claim.
    pub fn alive_reply(&mut self, ctx: &Context, outcome: &AliveOutcome) -> bool {
        self.lease.set_alive_in_flight(false);
        match outcome {
            AliveOutcome::Acknowledged => {
                self.alive(ctx, false);
                true
            }
            AliveOutcome::NotRecognized => {
                tracing::warn!(slot = %self.slot, claim = %self.id, "Client no longer recognizes claim");
                false
            }
            AliveOutcome::Failed(err) => {
                let retry = ctx.config.timing.alive_retry();
                tracing::warn!(
                    slot = %self.slot,
                    claim = %self.id,
                    error = %err,
                    retry_secs = retry.as_secs(),
                    "Failed to send ALIVE, will retry"
                );
                let (slot, id) = (self.slot, self.id.clone());
                self.lease.retry_send_alive(ctx, slot, &id, retry);
                true
            }
        }
    }

    // -- match timer -----------------------------------------------------

    pub fn start_match_timer(&mut self, ctx: &Context) {
        if self.match_timer.is_some() {
            tracing::warn!(slot = %self.slot, claim = %self.id, "Match timer already running, slot matched twice");
        }
        self.match_timer = Some(ctx.timers.start(
            ctx.config.timing.match_timeout(),
            TimerTarget::MatchTimeout {
                slot: self.slot,
                claim: self.id.clone(),
            },
        ));
    }

    pub fn cancel_match_timer(&mut self) {
        self.match_timer = None;
    }

    pub fn is_current_match_timer(&self, fired: TimerId) -> bool {
        is_current(&self.match_timer, fired)
    }

    /// Consume a match-timer firing. Returns false when it is stale.
    pub fn take_match_timer(&mut self, fired: TimerId) -> bool {
        if !self.is_current_match_timer(fired) {
            return false;
        }
        self.match_timer = None;
        true
    }

    // -- activation ------------------------------------------------------

    /// Cache job identity and lease from a job record.
    pub fn cache_job_info(&mut self, ctx: &Context, job: &Attributes) {
        self.activation.cluster = job.get("ClusterId").and_then(Value::as_i64);
        self.activation.proc_id = job.get("ProcId").and_then(Value::as_i64);
        if self.activation.cluster.is_some() && self.activation.proc_id.is_none() {
            self.activation.proc_id = Some(0);
        }
        self.activation.global_job_id = str_attr(job, "GlobalJobId");

        if let Some(secs) = job.get("JobLeaseDuration").and_then(Value::as_u64) {
            self.lease.set_duration(Duration::from_secs(secs));
        } else if self.kind == ClaimType::Opportunistic {
            if let Some(interval) = self.lease.alive_interval() {
                self.lease
                    .set_alive_interval(interval, ctx.config.timing.max_claim_alives_missed);
            }
        }
    }

    /// Launch the job. On a failed spawn the claim is reset and false returned.
    pub fn spawn_starter(
        &mut self,
        ctx: &Context,
        job: Option<Attributes>,
        slot_record: &Attributes,
    ) -> bool {
        if self.starter.is_some() {
            fatal(format!("claim {} already has a starter", self.id));
        }
        let job = match job.or_else(|| self.job.clone()) {
            Some(job) => job,
            None => fatal(format!("spawn_starter on claim {} without a job", self.id)),
        };
        self.cache_job_info(ctx, &job);

        let Some(spec) = StarterSpec::from_job(self.slot, &job) else {
            tracing::warn!(slot = %self.slot, claim = %self.id, "Job has no command to run");
            self.reset();
            return false;
        };
        match ctx.starter.spawn(&spec, &ctx.events) {
            Ok(starter) => {
                self.starter = Some(starter);
                self.set_job(job);
                self.alive(ctx, false);
            }
            Err(e) => {
                tracing::error!(slot = %self.slot, claim = %self.id, error = %e, "Failed to spawn starter");
                self.reset();
                return false;
            }
        }
        self.change_state(ClaimState::Running);
        self.begin_activation(ctx, slot_record);
        true
    }

    /// Bookkeeping for a started activation. Does not change state.
    pub fn begin_activation(&mut self, ctx: &Context, slot_record: &Attributes) {
        self.load_accounting_info();
        self.activation_count += 1;
        let now = Instant::now();
        self.activation.job_start = Some(now);

        let eval = EvalContext::new(slot_record, self.job.as_ref());
        let max_vacate = ctx
            .policy
            .eval_number(PolicyExpr::MachineMaxVacateTime, &eval)
            .unwrap_or(0.0);
        self.pledged_max_vacate = Duration::from_secs(max_vacate.max(0.0) as u64);

        if self.is_cod() {
            return;
        }
        if let Some(job) = self.job.as_ref() {
            if job
                .get("WantCheckpointSignal")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                self.activation.last_pckpt = Some(now);
            }
        }
    }

    /// Clear everything that belongs to one activation.
    pub fn reset(&mut self) {
        self.starter = None;
        self.kill_timer = None;
        self.activation = Activation::default();
        if self.is_cod() {
            self.job = None;
        }
        self.has_job_ad = false;
        self.job_totals = RunTotals::default();
        self.may_unretire = true;
        self.preempt_was_true = false;
        self.badput_caused_by_draining = false;
        self.badput_caused_by_preemption = false;
        self.vacate_reason = None;
    }

    /// The starter is gone. Returns the draining badput in seconds, if any.
    pub fn starter_exited(&mut self, ctx: &Context, exit: StarterExit) -> Option<Duration> {
        self.change_state(ClaimState::Idle);
        let badput = self
            .badput_caused_by_draining
            .then(|| self.job_total_run_time());
        self.reset();

        if exit.lost_connection() {
            tracing::warn!(slot = %self.slot, claim = %self.id, "Starter lost its client, expiring lease");
            let (slot, id) = (self.slot, self.id.clone());
            self.lease.expire_now(ctx, slot, &id);
        }
        badput
    }

    // -- signalling ------------------------------------------------------

    fn signal(&self, ctx: &Context, signal: StarterSignal) -> bool {
        let Some(starter) = self.starter else {
            return true;
        };
        match ctx.starter.signal(starter, signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(slot = %self.slot, claim = %self.id, signal = ?signal, error = %e, "Failed to signal starter");
                false
            }
        }
    }

    fn arm_kill_timer(&mut self, ctx: &Context, delay: Duration) {
        self.kill_timer = Some(ctx.timers.start(
            delay,
            TimerTarget::KillTimeout {
                slot: self.slot,
                claim: self.id.clone(),
            },
        ));
    }

    pub fn is_current_kill_timer(&self, fired: TimerId) -> bool {
        is_current(&self.kill_timer, fired)
    }

    pub fn suspend(&mut self, ctx: &Context) -> bool {
        self.change_state(ClaimState::Suspended);
        self.signal(ctx, StarterSignal::Suspend)
    }

    pub fn resume(&mut self, ctx: &Context) -> bool {
        if self.starter.is_some() {
            self.change_state(ClaimState::Running);
            self.signal(ctx, StarterSignal::Continue)
        } else {
            self.change_state(ClaimState::Idle);
            true
        }
    }

    /// Ask the job to vacate; escalates to a hard kill after `max_vacate`.
    pub fn kill_soft(&mut self, ctx: &Context, max_vacate: Duration) -> bool {
        if self.starter.is_none() {
            return true;
        }
        self.change_state(ClaimState::Vacating);
        if !self.signal(ctx, StarterSignal::Terminate(TerminationIntent::Graceful)) {
            self.kill_pg(ctx);
            return false;
        }
        self.arm_kill_timer(ctx, max_vacate);
        true
    }

    /// Fast shutdown; escalates to killing the process group after the
    /// killing timeout.
    pub fn kill_hard(&mut self, ctx: &Context) -> bool {
        if self.starter.is_none() {
            return true;
        }
        self.change_state(ClaimState::Killing);
        if !self.signal(ctx, StarterSignal::Terminate(TerminationIntent::Hard)) {
            self.kill_pg(ctx);
            return false;
        }
        self.arm_kill_timer(ctx, ctx.config.timing.killing_timeout());
        true
    }

    pub fn kill_pg(&mut self, ctx: &Context) -> bool {
        if self.starter.is_none() {
            return true;
        }
        self.change_state(ClaimState::Killing);
        self.kill_timer = None;
        self.signal(ctx, StarterSignal::Terminate(TerminationIntent::ForceGroup))
    }

    /// Escalate after a kill timeout. Stale firings are ignored.
    pub fn kill_timeout(&mut self, ctx: &Context, fired: TimerId) {
        if !self.is_current_kill_timer(fired) {
            tracing::debug!(slot = %self.slot, claim = %self.id, "Stale kill timer");
            return;
        }
        self.kill_timer = None;
        match self.state {
            ClaimState::Vacating => {
                tracing::warn!(slot = %self.slot, claim = %self.id, "Max vacate time expired, escalating to fast shutdown");
                self.kill_hard(ctx);
            }
            ClaimState::Killing => {
                tracing::warn!(slot = %self.slot, claim = %self.id, "Killing timeout expired, killing process group");
                self.kill_pg(ctx);
            }
            _ => {}
        }
    }

    /// Ask the starter to put the job on hold before it goes.
    pub fn hold_job(&mut self, ctx: &Context, soft: bool, max_vacate: Duration) -> bool {
        if self.starter.is_none() {
            return true;
        }
        if self.signal(ctx, StarterSignal::Hold) {
            let (next, delay) = if soft {
                (ClaimState::Vacating, max_vacate)
            } else {
                (ClaimState::Killing, ctx.config.timing.killing_timeout())
            };
            self.change_state(next);
            self.arm_kill_timer(ctx, delay);
            return true;
        }
        if soft {
            self.kill_soft(ctx, max_vacate)
        } else {
            self.kill_hard(ctx)
        }
    }

    pub fn periodic_checkpoint(&mut self, ctx: &Context) -> bool {
        if !self.signal(ctx, StarterSignal::Checkpoint) {
            return false;
        }
        self.activation.last_pckpt = Some(Instant::now());
        true
    }

    pub fn request_new_proc(&self, ctx: &Context) -> bool {
        self.signal(ctx, StarterSignal::NewProc)
    }

    /// Stop the current activation but keep the claim.
    pub fn deactivate(&mut self, ctx: &Context, graceful: bool, max_vacate: Duration) -> bool {
        if !self.is_active() {
            return true;
        }
        if graceful {
            self.kill_soft(ctx, max_vacate)
        } else {
            self.kill_hard(ctx)
        }
    }

    /// Returns true when the claim can be dropped right away; otherwise the
    /// starter is being killed and the claim goes once it exits.
    pub fn remove(&mut self, ctx: &Context, graceful: bool, max_vacate: Duration) -> bool {
        if !self.is_active() {
            return true;
        }
        self.wants_remove = true;
        if graceful {
            self.kill_soft(ctx, max_vacate);
        } else {
            self.kill_hard(ctx);
        }
        false
    }

    /// Tell the client its claim is gone, unless it gave the claim up itself.
    pub fn vacate(&self, ctx: &Context) {
        if self.schedd_closed_claim {
            return;
        }
        let Some(addr) = self.client.as_ref().and_then(|c| c.addr.clone()) else {
            return;
        };
        tracing::info!(slot = %self.slot, claim = %self.id, client = %addr, "Sending vacate notice");
        let client = ctx.client.clone();
        let claim = self.id.clone();
        tokio::spawn(async move {
            client.vacate(&addr, &claim).await;
        });
    }

    // -- pending commands ----------------------------------------------

    pub fn set_pending(&mut self, cmd: PendingCommand) {
        self.pending = Some(cmd);
    }

    pub fn take_pending(&mut self) -> Option<PendingCommand> {
        self.pending.take()
    }

    // -- publishing -----------------------------------------------------

    pub fn publish(&self, record: &mut Attributes) {
        record.insert("CurrentRank".into(), Value::from(self.rank));
        record.insert("ClaimState".into(), Value::from(self.state.to_string()));
        if let Some(client) = &self.client {
            insert_opt(record, "RemoteUser", &client.user);
            insert_opt(record, "RemoteOwner", &client.owner);
            insert_opt(record, "AccountingGroup", &client.accounting_group);
            insert_opt(record, "ClientMachine", &client.host);
        }
        if let (Some(cluster), Some(proc_id)) = (self.activation.cluster, self.activation.proc_id) {
            if cluster > 0 && proc_id >= 0 {
                record.insert("JobId".into(), Value::from(format!("{}.{}", cluster, proc_id)));
            }
        }
        insert_opt(record, "GlobalJobId", &self.activation.global_job_id);
        if let Some(start) = self.activation.job_start {
            record.insert("JobStart".into(), Value::from(wall_clock(start)));
        }
        if let Some(pckpt) = self.activation.last_pckpt {
            record.insert("LastPeriodicCheckpoint".into(), Value::from(wall_clock(pckpt)));
        }
        if let Some(started) = self.claim_started {
            record.insert("ClaimStartTime".into(), Value::from(wall_clock(started)));
        }
        record.insert("NumActivations".into(), Value::from(self.activation_count));

        let (job, claim) = self.current_totals();
        for (name, value) in [
            ("TotalJobRunTime", job.run),
            ("TotalJobSuspendTime", job.suspend),
            ("TotalClaimRunTime", claim.run),
            ("TotalClaimSuspendTime", claim.suspend),
        ] {
            if value.as_secs() > 0 {
                record.insert(name.into(), Value::from(value.as_secs()));
            }
        }
    }

    /// Attributes describing a pending preempting claim.
    pub fn publish_preempting(&self, record: &mut Attributes) {
        record.insert("PreemptingRank".into(), Value::from(self.rank));
        if let Some(client) = &self.client {
            insert_opt(record, "PreemptingUser", &client.user);
            insert_opt(record, "PreemptingOwner", &client.owner);
            insert_opt(record, "PreemptingAccountingGroup", &client.accounting_group);
        }
    }
}

pub(crate) fn str_attr(record: &Attributes, name: &str) -> Option<String> {
    record.get(name).and_then(Value::as_str).map(str::to_string)
}

fn insert_opt(record: &mut Attributes, name: &str, value: &Option<String>) {
    if let Some(v) = value {
        record.insert(name.to_string(), Value::from(v.clone()));
    }
}
