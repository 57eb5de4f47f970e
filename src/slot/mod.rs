//! One schedulable slot: its state machine, requirements verdict and claims.
//!
//! A [`Slot`] never reaches back into the manager. Anything the manager has
//! to act on (deletion, a dirty record, a drain that may have finished) is
//! left behind as a flag and collected after the command or event that
//! caused it.

pub mod cod;
pub mod command;
pub mod record;
pub mod state;

use std::mem;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::claim::{Claim, ClaimState, ClaimType, PendingCommand};
use crate::config::SlotConfig;
use crate::context::Context;
use crate::error::{fatal, RefuseReason};
use crate::policy::{Attributes, EvalContext, PolicyExpr, RequirementsPolicy};
use crate::starter::{StarterExit, StarterId, StarterSignal, StarterSpec, TerminationIntent};
use crate::timer::{is_current, TimerHandle, TimerId, TimerTarget};

pub use cod::CodClaims;
pub use record::SlotRecord;
pub use state::{Activity, Decision, Extra, NextStep, PolicyInputs, SlotStateMachine, State};

/// Retirement time that never runs out.
pub const UNLIMITED_RETIREMENT: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotType {
    Static,
    /// Carves dynamic slots out of its resources; never claimed itself
    Partitionable,
    /// Split off a partitionable slot for one claim
    Dynamic,
}

impl std::fmt::Display for SlotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotType::Static => write!(f, "Static"),
            SlotType::Partitionable => write!(f, "Partitionable"),
            SlotType::Dynamic => write!(f, "Dynamic"),
        }
    }
}

/// The node-wide drain as one slot sees it. Refreshed by the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainingInfo {
    pub request_id: u64,
    pub graceful: bool,
    pub reason: String,
    pub deadline: Option<Instant>,
    /// Advertised in place of `false` while Drained
    pub start_expr: Option<String>,
    /// Retirement the drain still grants, in seconds
    pub graceful_remaining: i64,
    /// Every slot on the node is Drained
    pub complete: bool,
}

#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    name: String,
    kind: SlotType,
    parent: Option<SlotId>,
    cpus: u32,
    memory_mb: u64,

    machine: SlotStateMachine,
    reqexp: RequirementsPolicy,
    current: Claim,
    preempting: Option<Claim>,
    cod: CodClaims,

    backfill: Option<StarterId>,
    benchmark_timer: Option<TimerHandle>,
    update_timer: Option<TimerHandle>,
    ad: Attributes,

    draining: Option<DrainingInfo>,
    accepted_while_draining: bool,
    suspended_for_cod: bool,
    shutting_down: bool,

    dirty: bool,
    marked_for_delete: bool,
    resume_after_draining: bool,
    drain_check: bool,
    draining_badput: Duration,
}

impl Slot {
    pub fn new(
        ctx: &Context,
        id: SlotId,
        config: &SlotConfig,
        kind: SlotType,
        parent: Option<SlotId>,
    ) -> Self {
        let mut slot = Self {
            id,
            name: config.name.clone(),
            kind,
            parent,
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            machine: SlotStateMachine::new(),
            reqexp: RequirementsPolicy::new(),
            current: Claim::new(ctx, id, ClaimType::Opportunistic),
            preempting: None,
            cod: CodClaims::default(),
            backfill: None,
            benchmark_timer: None,
            update_timer: None,
            ad: Attributes::new(),
            draining: None,
            accepted_while_draining: false,
            suspended_for_cod: false,
            shutting_down: false,
            dirty: true,
            marked_for_delete: false,
            resume_after_draining: false,
            drain_check: false,
            draining_badput: Duration::ZERO,
        };
        slot.refresh_ad(ctx);
        slot.restore_reqexp(ctx);
        slot.refresh_ad(ctx);
        slot
    }

    /// First policy pass after creation (Owner → Unclaimed when not owner-held).
    pub fn init(&mut self, ctx: &Context) {
        tracing::info!(slot = %self.name, kind = %self.kind, cpus = self.cpus, memory_mb = self.memory_mb, "Slot created");
        self.eval_state(ctx);
    }

    // -- accessors -----------------------------------------------------

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SlotType {
        self.kind
    }

    pub fn parent(&self) -> Option<SlotId> {
        self.parent
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    /// Give resources back (a dynamic child went away).
    pub fn add_resources(&mut self, cpus: u32, memory_mb: u64) {
        self.cpus += cpus;
        self.memory_mb += memory_mb;
        self.dirty = true;
    }

    /// Carve resources off this slot. Returns false when they are not there.
    pub fn take_resources(&mut self, cpus: u32, memory_mb: u64) -> bool {
        if cpus > self.cpus || memory_mb > self.memory_mb {
            return false;
        }
        self.cpus -= cpus;
        self.memory_mb -= memory_mb;
        self.dirty = true;
        true
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn activity(&self) -> Activity {
        self.machine.activity()
    }

    pub fn destination(&self) -> Option<State> {
        self.machine.destination()
    }

    pub fn machine(&self) -> &SlotStateMachine {
        &self.machine
    }

    pub fn reqexp(&self) -> &RequirementsPolicy {
        &self.reqexp
    }

    pub fn current(&self) -> &Claim {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut Claim {
        &mut self.current
    }

    pub fn preempting(&self) -> Option<&Claim> {
        self.preempting.as_ref()
    }

    pub fn cod(&self) -> &CodClaims {
        &self.cod
    }

    pub fn ad(&self) -> &Attributes {
        &self.ad
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_some()
    }

    pub fn draining(&self) -> Option<&DrainingInfo> {
        self.draining.as_ref()
    }

    pub fn accepted_while_draining(&self) -> bool {
        self.accepted_while_draining
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    pub fn take_resume_after_draining(&mut self) -> bool {
        mem::take(&mut self.resume_after_draining)
    }

    pub fn take_drain_check(&mut self) -> bool {
        mem::take(&mut self.drain_check)
    }

    /// Badput accumulated by jobs killed for draining since the last call.
    pub fn take_draining_badput(&mut self) -> Duration {
        mem::take(&mut self.draining_badput)
    }

    pub fn set_update_timer(&mut self, timer: TimerHandle) {
        self.update_timer = Some(timer);
    }

    pub fn is_current_update_timer(&self, fired: TimerId) -> bool {
        is_current(&self.update_timer, fired)
    }

    /// Replace the slot's view of the node-wide drain.
    pub fn set_draining(&mut self, info: Option<DrainingInfo>) {
        if self.draining != info {
            self.draining = info;
            self.dirty = true;
        }
    }

    pub fn set_shutting_down(&mut self) {
        self.shutting_down = true;
    }

    pub fn has_preempting_claim(&self) -> bool {
        self.preempting
            .as_ref()
            .map(Claim::has_request)
            .unwrap_or(false)
    }

    /// Any claim at all, current, preempting or on-demand.
    pub fn has_any_claim(&self) -> bool {
        self.current.state() != ClaimState::Unclaimed
            || self.has_preempting_claim()
            || !self.cod.is_empty()
    }

    /// Something on this slot is still running or claimed.
    pub fn in_use(&self) -> bool {
        self.has_any_claim() || self.current.starter().is_some() || self.backfill.is_some()
    }

    /// Whether this slot needs the periodic poll to keep evaluating policy.
    pub fn needs_polling(&self) -> bool {
        matches!(
            self.activity(),
            Activity::Busy
                | Activity::Suspended
                | Activity::Retiring
                | Activity::Vacating
                | Activity::Killing
        ) || self.state() == State::Backfill
            || self.cod.has_active()
    }

    // -- transitions ---------------------------------------------------

    /// Move to `state` with its default activity.
    pub fn change_state(&mut self, ctx: &Context, state: State) {
        let activity = match state {
            State::Preempting => {
                if !self.current.preempt_was_true() || self.wants_vacate(ctx) {
                    Activity::Vacating
                } else {
                    Activity::Killing
                }
            }
            State::Drained => Activity::Retiring,
            _ => Activity::Idle,
        };
        self.change(ctx, state, activity);
    }

    pub fn change_activity(&mut self, ctx: &Context, activity: Activity) {
        let state = self.state();
        self.change(ctx, state, activity);
    }

    /// The single place a slot's (State, Activity) moves.
    pub fn change(&mut self, ctx: &Context, state: State, activity: Activity) {
        let (old_state, old_activity) = (self.state(), self.activity());
        if state == old_state && activity == old_activity {
            return;
        }

        if self.leave_action(ctx, old_state, old_activity, state, activity) {
            return;
        }

        if state == State::Delete {
            tracing::info!(slot = %self.name, from_state = %old_state, "Changing state: slot marked for deletion");
            self.marked_for_delete = true;
            self.dirty = true;
            return;
        }

        let transition = self.machine.apply(state, activity);
        tracing::info!(
            slot = %self.name,
            from_state = %transition.old_state,
            from_activity = %transition.old_activity,
            state = %state,
            activity = %activity,
            "Changing state and activity"
        );

        if self.enter_action(ctx, transition.state_changed, state, activity) {
            return;
        }

        self.refresh_ad(ctx);
        self.dirty = true;

        if state == State::Backfill {
            return;
        }
        if matches!(activity, Activity::Retiring | Activity::Idle) {
            self.eval_state(ctx);
        }
    }

    /// Returns true when the transition must not go ahead.
    fn leave_action(
        &mut self,
        ctx: &Context,
        old_state: State,
        old_activity: Activity,
        new_state: State,
        new_activity: Activity,
    ) -> bool {
        let state_changed = old_state != new_state;
        if old_activity == Activity::Benchmarking {
            self.benchmark_timer = None;
        }

        if old_state == State::Claimed {
            if old_activity == Activity::Suspended && !self.current.resume(ctx) {
                tracing::warn!(slot = %self.name, "Failed to resume suspended job, killing process group");
                self.current.kill_pg(ctx);
                if new_state != State::Preempting {
                    self.change_state(ctx, State::Preempting);
                    return true;
                }
            }
            if state_changed && new_activity != Activity::Vacating {
                self.current.cancel_lease();
            }
        }
        false
    }

    /// Returns true when a nested transition already took over.
    fn enter_action(&mut self, ctx: &Context, state_changed: bool, state: State, activity: Activity) -> bool {
        match state {
            State::Owner => {
                self.replace_current(ctx);
                self.remove_pre(RefuseReason::WrongState);
                if !self.eval_is_owner(ctx) {
                    self.change_state(ctx, State::Unclaimed);
                    return true;
                }
                self.restore_reqexp(ctx);
            }
            State::Claimed => {
                self.restore_reqexp(ctx);
                if state_changed {
                    self.current.begin_claim(ctx);
                    if self.kind != SlotType::Partitionable {
                        self.preempting = Some(Claim::new(ctx, self.id, ClaimType::Opportunistic));
                    }
                }
                if activity != Activity::Retiring {
                    self.current.clear_vacate_reason();
                }
                match activity {
                    Activity::Suspended => {
                        if !self.current.suspend(ctx) {
                            tracing::warn!(slot = %self.name, "Failed to suspend job, killing process group");
                            self.current.kill_pg(ctx);
                            self.change_state(ctx, State::Preempting);
                            return true;
                        }
                    }
                    Activity::Busy => {
                        if self.in_retirement() && !self.accepted_while_draining {
                            let reason = if self.preempting_outranks() {
                                state::VACATE_FOR_RANK
                            } else {
                                state::VACATE_FOR_PRIORITY
                            };
                            self.current.set_vacate_reason(reason);
                            self.change(ctx, State::Claimed, Activity::Retiring);
                            return true;
                        }
                    }
                    Activity::Retiring => {
                        if !self.current.is_active() {
                            self.change_state(ctx, State::Preempting);
                            return true;
                        }
                    }
                    _ => {}
                }
            }
            State::Unclaimed => {
                self.restore_reqexp(ctx);
            }
            State::Backfill => {
                self.restore_reqexp(ctx);
                if activity == Activity::Killing {
                    self.kill_backfill(ctx);
                }
            }
            State::Matched => {
                self.reqexp.unavail(None);
            }
            State::Preempting => {
                self.reqexp.unavail(None);
                if !self.current.is_active() {
                    self.leave_preempting_state(ctx);
                    return true;
                }
                let max_vacate = secs(self.max_vacate(ctx));
                let hold = self.current.preempt_was_true() && self.eval_want_hold(ctx);
                let soft = activity == Activity::Vacating;
                if hold {
                    self.current.hold_job(ctx, soft, max_vacate);
                } else if soft {
                    self.current.kill_soft(ctx, max_vacate);
                } else {
                    self.current.kill_hard(ctx);
                }
            }
            State::Drained => {
                let start_expr = self.draining.as_ref().and_then(|d| d.start_expr.clone());
                self.reqexp.unavail(start_expr);
            }
            State::Delete => {}
        }
        false
    }

    /// Send the slot towards `dest`, through Preempting or Backfill/Killing
    /// when something has to stop first.
    pub fn set_destination(&mut self, ctx: &Context, dest: State) {
        match dest {
            State::Delete | State::Owner => {}
            State::Matched => {
                if let Some(existing) = self.machine.destination() {
                    tracing::info!(slot = %self.name, destination = %existing, "Already has a destination, ignoring Matched");
                    return;
                }
            }
            State::Claimed => {
                let fetched = self.current.kind() == ClaimType::Fetch && self.current.has_job_ad();
                if !self.current.has_request() && !fetched {
                    fatal(format!(
                        "slot {} sent towards Claimed without a claim request",
                        self.name
                    ));
                }
            }
            other => fatal(format!("slot {} given invalid destination {}", self.name, other)),
        }

        tracing::info!(slot = %self.name, destination = %dest, state = %self.state(), activity = %self.activity(), "Setting destination");
        self.machine.set_destination(Some(dest));

        match (self.state(), self.activity()) {
            (State::Preempting, _) => {}
            (State::Claimed, _) => self.change_state(ctx, State::Preempting),
            (State::Backfill, Activity::Idle) => self.go_to_destination(ctx, dest),
            (State::Backfill, _) => self.change(ctx, State::Backfill, Activity::Killing),
            _ => self.go_to_destination(ctx, dest),
        }
    }

    fn go_to_destination(&mut self, ctx: &Context, dest: State) {
        if dest == State::Claimed {
            self.accept_claim_request(ctx);
        } else {
            self.change_state(ctx, dest);
        }
    }

    /// Grant the stored claim request. On failure the slot falls back to Owner.
    pub fn accept_claim_request(&mut self, ctx: &Context) -> bool {
        let granted = match self.current.kind() {
            ClaimType::Fetch => self.current.has_job_ad(),
            _ => self.send_grant(),
        };

        if !granted {
            tracing::warn!(slot = %self.name, claim = %self.current.id(), "Claim request went away before it could be granted");
            self.machine.set_destination(None);
            if self.state() == State::Backfill && self.backfill.is_some() {
                self.machine.set_destination(Some(State::Owner));
                self.change(ctx, State::Backfill, Activity::Killing);
            } else {
                self.change_state(ctx, State::Owner);
            }
            return false;
        }

        if self.current.kind() != ClaimType::Cod {
            self.current.load_accounting_info();
            let client = self.current.client_mut();
            if client.host.is_none() {
                client.host = client.addr.as_deref().map(host_of);
            }
        }
        tracing::info!(slot = %self.name, claim = %self.current.id(), "Claim request accepted");
        self.change_state(ctx, State::Claimed);
        true
    }

    fn send_grant(&mut self) -> bool {
        if self.preempting.as_ref().map(Claim::has_request).unwrap_or(false) {
            fatal(format!(
                "slot {} accepting a claim while a preempting request is pending",
                self.name
            ));
        }
        let Some(responder) = self.current.take_responder() else {
            return false;
        };
        let grant = crate::claim::ClaimGrant {
            slot: self.name.clone(),
            claim_id: self.current.id().clone(),
            lease_duration_secs: self
                .current
                .lease()
                .duration()
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        responder.send(Ok(grant)).is_ok()
    }

    /// A starter this slot launched is gone.
    pub fn starter_exited(&mut self, ctx: &Context, starter: StarterId, exit: StarterExit) {
        if self.backfill == Some(starter) {
            tracing::info!(slot = %self.name, starter = %starter, exit = ?exit, "Backfill job exited");
            self.backfill = None;
            self.machine_starter_exited(ctx);
            return;
        }
        if self.current.starter() == Some(starter) {
            self.current_starter_exited(ctx, exit);
            return;
        }
        if self.cod.find_by_starter(starter).is_some() {
            self.cod_starter_exited(ctx, starter, exit);
            return;
        }
        tracing::debug!(slot = %self.name, starter = %starter, "Exit of unknown starter ignored");
    }

    fn current_starter_exited(&mut self, ctx: &Context, exit: StarterExit) {
        tracing::info!(slot = %self.name, claim = %self.current.id(), exit = ?exit, "Starter exited");
        let should_check_drain = self.is_draining() && !self.accepted_while_draining;
        if let Some(badput) = self.current.starter_exited(ctx, exit) {
            self.draining_badput += badput;
        }

        if !self.machine_starter_exited(ctx) {
            match self.state() {
                State::Claimed => {
                    if self.activity() == Activity::Retiring || self.current.kind() == ClaimType::Fetch {
                        self.change_state(ctx, State::Preempting);
                    } else {
                        self.change(ctx, State::Claimed, Activity::Idle);
                    }
                }
                State::Preempting => self.leave_preempting_state(ctx),
                _ => self.change_state(ctx, State::Owner),
            }
        }

        if !self.current.is_active() {
            reply_pending(&mut self.current);
        }
        if should_check_drain {
            self.drain_check = true;
        }
        self.dirty = true;
    }

    /// Destination handling shared by every kind of starter exit. Returns
    /// true when the exit was fully dealt with.
    fn machine_starter_exited(&mut self, ctx: &Context) -> bool {
        match self.machine.destination() {
            Some(State::Claimed) => {
                self.accept_claim_request(ctx);
                true
            }
            Some(dest) => {
                self.change_state(ctx, dest);
                true
            }
            None => {
                if self.state() == State::Backfill && self.activity() != Activity::Idle {
                    self.change(ctx, State::Backfill, Activity::Idle);
                    return true;
                }
                false
            }
        }
    }

    /// The preempted claim is gone: hand the slot to the preempting claim,
    /// or back to Owner.
    pub fn leave_preempting_state(&mut self, ctx: &Context) {
        self.current.vacate(ctx);
        self.replace_current(ctx);

        match self.preempting.take() {
            Some(mut pre) if pre.has_request() => {
                if self.is_draining() {
                    pre.refuse_request(RefuseReason::Draining);
                    self.change_state(ctx, State::Owner);
                    return;
                }
                tracing::info!(slot = %self.name, claim = %pre.id(), "Preempting claim takes over the slot");
                pre.cancel_match_timer();
                self.current = pre;
                self.accept_claim_request(ctx);
            }
            _ => self.change_state(ctx, State::Owner),
        }
    }

    /// Hand the current claim, request and all, to another slot. A fresh
    /// placeholder takes its place here.
    pub fn take_current(&mut self, ctx: &Context) -> Claim {
        self.dirty = true;
        mem::replace(
            &mut self.current,
            Claim::new(ctx, self.id, ClaimType::Opportunistic),
        )
    }

    /// Take over a claim split off another slot.
    pub fn adopt_claim(&mut self, mut claim: Claim) {
        claim.set_slot(self.id);
        self.current = claim;
        self.dirty = true;
    }

    /// Swap in a fresh unclaimed placeholder and dispose of the old claim.
    fn replace_current(&mut self, ctx: &Context) {
        let mut old = mem::replace(
            &mut self.current,
            Claim::new(ctx, self.id, ClaimType::Opportunistic),
        );
        old.refuse_request(RefuseReason::WrongState);
        reply_pending(&mut old);
    }

    /// Drop the preempting claim, refusing whatever request it carried.
    pub fn remove_pre(&mut self, reason: RefuseReason) {
        if let Some(mut pre) = self.preempting.take() {
            pre.refuse_request(reason);
        }
    }

    // -- claim-level operations ------------------------------------------

    /// Let the job finish within its retirement time, then preempt.
    pub fn retire_claim(&mut self, ctx: &Context, reversible: bool) {
        match self.state() {
            State::Claimed => {
                if !reversible {
                    self.current.disallow_unretire();
                }
                if self.shutting_down {
                    self.current.set_retire_peacefully(true);
                }
                self.change(ctx, State::Claimed, Activity::Retiring);
            }
            State::Matched => self.change_state(ctx, State::Owner),
            State::Backfill => self.set_destination(ctx, State::Owner),
            _ => self.kill_claim(ctx),
        }
    }

    /// Vacate the job now (graceful) and give the slot up.
    pub fn release_claim(&mut self, ctx: &Context) {
        match self.state() {
            State::Claimed => self.change(ctx, State::Preempting, Activity::Vacating),
            State::Preempting => {}
            State::Matched => self.change_state(ctx, State::Owner),
            State::Backfill => self.set_destination(ctx, State::Owner),
            _ => self.kill_claim(ctx),
        }
    }

    /// Hard-kill the job and give the slot up.
    pub fn kill_claim(&mut self, ctx: &Context) {
        match self.state() {
            State::Claimed | State::Preempting => {
                self.change(ctx, State::Preempting, Activity::Killing)
            }
            State::Matched => self.change_state(ctx, State::Owner),
            State::Backfill => self.set_destination(ctx, State::Owner),
            _ => {}
        }
    }

    /// The client is gone: give up without telling it.
    pub fn finish_kill_claim(&mut self, ctx: &Context) {
        self.current.drop_client();
        self.kill_claim(ctx);
    }

    pub fn shutdown_all_claims(&mut self, ctx: &Context, graceful: bool, reversible: bool) {
        self.shutting_down = true;
        self.cod_shutdown(ctx, graceful);
        if graceful {
            self.retire_claim(ctx, reversible);
        } else {
            self.kill_claim(ctx);
        }
        self.reqexp.unavail(None);
        self.dirty = true;
    }

    // -- policy ----------------------------------------------------------

    /// Evaluate policy and apply whatever it decides.
    pub fn eval_state(&mut self, ctx: &Context) {
        if self.marked_for_delete {
            return;
        }
        self.refresh_ad(ctx);
        let inputs = self.policy_inputs(ctx);
        let decision = state::eval_policy(
            self.state(),
            self.activity(),
            self.machine.act_was_benchmark(),
            &inputs,
        );
        self.apply_decision(ctx, decision);
    }

    fn apply_decision(&mut self, ctx: &Context, decision: Decision) {
        for extra in &decision.extras {
            match *extra {
                Extra::PreemptWasTrue => self.current.set_preempt_was_true(),
                Extra::BadputByPreemption => self.current.set_badput_caused_by_preemption(),
                Extra::BadputByDraining => self.current.set_badput_caused_by_draining(),
                Extra::VacateReason(reason) => self.current.set_vacate_reason(reason),
                _ => {}
            }
        }

        if let Some(next) = decision.next {
            tracing::info!(slot = %self.name, state = %self.state(), activity = %self.activity(), reason = decision.reason, "State change");
            match next {
                NextStep::State(state) => self.change_state(ctx, state),
                NextStep::Activity(activity) => self.change_activity(ctx, activity),
                NextStep::Both(state, activity) => self.change(ctx, state, activity),
                NextStep::RetireIrreversibly => self.retire_claim(ctx, false),
            }
        }

        for extra in decision.extras {
            match extra {
                Extra::PeriodicCheckpoint => {
                    if self.current.periodic_checkpoint(ctx) {
                        self.dirty = true;
                    }
                }
                Extra::RestoreRequirements => {
                    if self.restore_reqexp(ctx) {
                        self.dirty = true;
                    }
                }
                Extra::StartBenchmarks => self.start_benchmarks(ctx),
                Extra::StartBackfill => self.start_backfill(ctx),
                Extra::SetDestination(dest) => self.set_destination(ctx, dest),
                Extra::ConsiderResumeAfterDraining => self.resume_after_draining = true,
                _ => {}
            }
        }
    }

    fn policy_inputs(&self, ctx: &Context) -> PolicyInputs {
        let policy = &*ctx.policy;
        let eval = EvalContext::new(&self.ad, self.current.job());
        let worklife_expired = ctx
            .config
            .timing
            .claim_worklife()
            .map(|w| self.current.activation_count() > 0 && self.current.claim_age() > w)
            .unwrap_or(false);

        PolicyInputs {
            preempt: policy.eval_bool(PolicyExpr::Preempt, &eval),
            suspend: policy.eval_bool(PolicyExpr::Suspend, &eval),
            continue_: policy.eval_bool(PolicyExpr::Continue, &eval),
            kill: policy.eval_bool(PolicyExpr::Kill, &eval),
            is_owner: policy.eval_bool(PolicyExpr::IsOwner, &eval),
            start: self.reqexp.eval(policy, &eval),
            start_backfill: policy.eval_bool(PolicyExpr::StartBackfill, &eval),
            evict_backfill: policy.eval_bool(PolicyExpr::EvictBackfill, &eval),
            want_suspend: policy.eval_bool(PolicyExpr::WantSuspend, &eval).is_true(),
            wants_pckpt: self.current.starter().is_some()
                && policy.eval_bool(PolicyExpr::PeriodicCheckpoint, &eval).is_true(),
            suspended_for_cod: self.suspended_for_cod,
            in_retirement: self.in_retirement(),
            retirement_expired: self.retirement_expired(ctx),
            may_unretire: self.may_unretire(),
            preempt_was_true: self.current.preempt_was_true(),
            has_preempting_claim: self.has_preempting_claim(),
            preempting_outranks: self.preempting_outranks(),
            claim_worklife_expired: worklife_expired,
            waiting_for_activation: self.current.waiting_for_activation(),
            dynamic_or_broken: self.kind == SlotType::Dynamic,
            draining: self.is_draining(),
            draining_complete: self.draining.as_ref().map(|d| d.complete).unwrap_or(false),
            benchmarks_due: ctx.config.claims.run_benchmarks && self.benchmark_timer.is_none(),
            backfill_enabled: ctx.config.claims.enable_backfill,
        }
    }

    fn eval_is_owner(&self, ctx: &Context) -> bool {
        ctx.policy
            .eval_bool(PolicyExpr::IsOwner, &EvalContext::new(&self.ad, None))
            .is_true()
    }

    fn eval_want_hold(&self, ctx: &Context) -> bool {
        ctx.policy
            .eval_bool(PolicyExpr::WantHold, &EvalContext::new(&self.ad, self.current.job()))
            .is_true()
    }

    /// WANT_VACATE for the current job; undefined counts as true.
    fn wants_vacate(&self, ctx: &Context) -> bool {
        if !self.current.is_active() {
            return true;
        }
        !ctx.policy
            .eval_bool(PolicyExpr::WantVacate, &EvalContext::new(&self.ad, self.current.job()))
            .is_false()
    }

    /// Re-derive the verdict from START. Claimed slots stay held Unavailable.
    fn restore_reqexp(&mut self, ctx: &Context) -> bool {
        let eval = EvalContext::new(&self.ad, None);
        if self.state() == State::Claimed {
            self.reqexp.hold(&*ctx.policy, &eval)
        } else {
            self.reqexp.restore(&*ctx.policy, &eval)
        }
    }

    pub fn may_unretire(&self) -> bool {
        !self.is_draining() && self.current.may_unretire() && !self.has_preempting_claim()
    }

    pub fn in_retirement(&self) -> bool {
        self.has_preempting_claim() || !self.may_unretire()
    }

    fn preempting_outranks(&self) -> bool {
        self.preempting
            .as_ref()
            .map(|pre| pre.rank() > self.current.rank())
            .unwrap_or(false)
    }

    // -- retirement ------------------------------------------------------

    /// Seconds of retirement the running job has left.
    pub fn retirement_remaining(&self, ctx: &Context) -> i64 {
        if !self.current.is_active() {
            return 0;
        }
        let Some(job) = self.current.job() else {
            return 0;
        };
        let eval = EvalContext::new(&self.ad, Some(job));
        let mut mjrt = ctx
            .policy
            .eval_number(PolicyExpr::MaxJobRetirementTime, &eval)
            .map(|n| n as i64)
            .unwrap_or(0);
        // -1 preempts at once even when retiring peacefully
        if self.current.retire_peacefully() && mjrt != -1 {
            mjrt = UNLIMITED_RETIREMENT;
        }
        if let Some(job_mjrt) = job_number(ctx, job, &self.ad, "MaxJobRetirementTime") {
            mjrt = mjrt.min(job_mjrt);
        }
        if mjrt == UNLIMITED_RETIREMENT {
            return UNLIMITED_RETIREMENT;
        }
        let age = self.current.job_total_run_time().as_secs() as i64;
        mjrt.saturating_sub(age).max(0)
    }

    pub fn retirement_expired(&self, ctx: &Context) -> bool {
        let mut remaining = self.retirement_remaining(ctx);
        if let Some(drain) = &self.draining {
            if self.state() == State::Claimed && self.activity() == Activity::Idle {
                remaining = drain.graceful_remaining;
            } else if remaining > 0 && (self.start_allows_job(ctx) || self.accepted_while_draining) {
                remaining = drain.graceful_remaining;
            }
        }
        if remaining <= 0 {
            return true;
        }
        self.max_vacate(ctx) >= remaining
    }

    fn start_allows_job(&self, ctx: &Context) -> bool {
        self.current.job().is_some()
            && self
                .reqexp
                .eval(&*ctx.policy, &EvalContext::new(&self.ad, self.current.job()))
                .is_true()
    }

    /// Seconds the job is given to vacate once preemption starts.
    pub fn max_vacate(&self, ctx: &Context) -> i64 {
        if !self.current.is_active() {
            return 0;
        }
        let Some(job) = self.current.job() else {
            return 0;
        };
        let machine = self.current.pledged_max_vacate().as_secs() as i64;
        let job_value = job_number(ctx, job, &self.ad, "JobMaxVacateTime")
            .or_else(|| job_number(ctx, job, &self.ad, "KillSigTimeout"))
            .unwrap_or(machine);
        if job_value <= machine {
            return job_value;
        }
        // the job wants longer than promised: only retirement time can pay for it
        let retirement = self.retirement_remaining(ctx);
        if retirement >= job_value {
            job_value
        } else if retirement > machine {
            retirement
        } else {
            machine
        }
    }

    // -- benchmarks and backfill -----------------------------------------

    fn start_benchmarks(&mut self, ctx: &Context) {
        if self.state() != State::Unclaimed || self.activity() != Activity::Idle {
            return;
        }
        let duration = Duration::from_secs(ctx.config.claims.benchmark_duration_secs);
        self.change(ctx, State::Unclaimed, Activity::Benchmarking);
        if self.activity() == Activity::Benchmarking {
            self.benchmark_timer = Some(
                ctx.timers
                    .start(duration, TimerTarget::BenchmarksDone { slot: self.id }),
            );
        }
    }

    pub fn benchmarks_done(&mut self, ctx: &Context, fired: TimerId) {
        if !is_current(&self.benchmark_timer, fired) {
            tracing::debug!(slot = %self.name, "Stale benchmark timer");
            return;
        }
        tracing::info!(slot = %self.name, "Benchmarks finished");
        self.change(ctx, State::Unclaimed, Activity::Idle);
        self.benchmark_timer = None;
    }

    fn start_backfill(&mut self, ctx: &Context) {
        if self.backfill.is_some() {
            return;
        }
        let Some(command) = ctx.config.claims.backfill_command.clone() else {
            tracing::debug!(slot = %self.name, "Backfill enabled but no backfill command configured");
            return;
        };
        let spec = StarterSpec {
            slot: self.id,
            command,
            env: vec![("_SLOTD_BACKFILL".to_string(), "1".to_string())],
        };
        match ctx.starter.spawn(&spec, &ctx.events) {
            Ok(starter) => {
                tracing::info!(slot = %self.name, starter = %starter, "Backfill job started");
                self.backfill = Some(starter);
                self.change(ctx, State::Backfill, Activity::Busy);
            }
            Err(e) => {
                tracing::warn!(slot = %self.name, error = %e, "Failed to start backfill job");
            }
        }
    }

    fn kill_backfill(&mut self, ctx: &Context) {
        let Some(starter) = self.backfill else {
            return;
        };
        if let Err(e) = ctx
            .starter
            .signal(starter, StarterSignal::Terminate(TerminationIntent::Hard))
        {
            tracing::warn!(slot = %self.name, error = %e, "Failed to stop backfill job, killing process group");
            if let Err(e) = ctx
                .starter
                .signal(starter, StarterSignal::Terminate(TerminationIntent::ForceGroup))
            {
                tracing::warn!(slot = %self.name, starter = %starter, error = %e, "Failed to kill backfill process group");
            }
        }
    }
}

/// Reply to a command that waited on the claim's starter.
fn reply_pending(claim: &mut Claim) {
    match claim.take_pending() {
        Some(PendingCommand::Release(Some(reply))) => {
            let _ = reply.send(ClaimState::Unclaimed);
        }
        Some(PendingCommand::Deactivate(Some(reply))) => {
            let _ = reply.send(claim.state());
        }
        _ => {}
    }
}

/// A numeric job attribute, evaluated from the job's side. `None` when the
/// job does not carry it and 0 when it does not evaluate to a number.
fn job_number(ctx: &Context, job: &Attributes, slot: &Attributes, name: &str) -> Option<i64> {
    let value = job.get(name)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(source) => ctx
            .policy
            .eval_source(source, &EvalContext::new(job, Some(slot)))
            .as_number(),
        _ => None,
    };
    Some(number.map(|n| n as i64).unwrap_or(0))
}

fn secs(value: i64) -> Duration {
    Duration::from_secs(value.max(0) as u64)
}

/// `host:port` or `<host:port>` → `host`.
fn host_of(addr: &str) -> String {
    let trimmed = addr.trim_start_matches('<').trim_end_matches('>');
    trimmed
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(trimmed)
        .to_string()
}
