//! The set of slots on this node.
//!
//! The manager owns every [`Slot`], routes commands and timer firings to
//! them by claim token or slot id, runs the poll and update cycles, and
//! carries the node-wide concerns a single slot cannot see: draining,
//! partitionable splits and shutdown. After anything touches a slot the
//! manager collects the flags the slot left behind in [`SlotSetManager::settle`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::claim::{ClaimId, ClaimState, ClientInfo, GrantResult};
use crate::collector::Collector;
use crate::config::{SlotConfig, SlotKind};
use crate::context::Context;
use crate::error::{RefuseReason, Result, StartdError};
use crate::event::Event;
use crate::policy::{Attributes, EvalContext, PolicyExpr};
use crate::slot::{DrainingInfo, Slot, SlotId, SlotRecord, SlotType, State, UNLIMITED_RETIREMENT};
use crate::timer::{is_current, TimerFired, TimerHandle, TimerId, TimerTarget};

/// How hard a drain pushes running jobs off the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainHow {
    /// Retire: jobs get their retirement time
    Graceful,
    /// Release: jobs get their vacate time
    Quick,
    /// Kill at once
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainCompletion {
    #[default]
    Nothing,
    /// Cancel the drain once every slot is Drained
    Resume,
    /// Shut the daemon down once every slot is Drained
    Exit,
}

/// Parameters of a DRAIN_JOBS request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainRequest {
    pub how: DrainHow,
    /// Upper bound on the graceful retirement the drain grants
    pub deadline: Option<Duration>,
    pub reason: String,
    #[serde(default)]
    pub on_completion: DrainCompletion,
    /// Must hold for every slot or the drain is refused
    pub check_expr: Option<String>,
    /// Jobs matching this may still start while draining
    pub start_expr: Option<String>,
}

#[derive(Debug)]
struct ActiveDrain {
    id: u64,
    request: DrainRequest,
    deadline: Option<Instant>,
}

/// Aggregate state of the node.
pub fn node_state(states: impl IntoIterator<Item = State>) -> State {
    let mut seen = [false; 3];
    for state in states {
        match state {
            State::Claimed => return State::Claimed,
            State::Preempting => seen[0] = true,
            State::Owner => seen[1] = true,
            State::Unclaimed | State::Matched | State::Backfill => seen[2] = true,
            State::Drained | State::Delete => {}
        }
    }
    if seen[0] {
        State::Preempting
    } else if seen[1] {
        State::Owner
    } else if seen[2] {
        State::Unclaimed
    } else {
        State::Drained
    }
}

pub struct SlotSetManager {
    ctx: Context,
    collector: Arc<dyn Collector>,
    slots: BTreeMap<SlotId, Slot>,
    next_slot_id: u32,
    next_child: u32,

    poll_timer: Option<TimerHandle>,
    flush_timer: Option<TimerHandle>,

    drain: Option<ActiveDrain>,
    next_drain_id: u64,
    draining_badput: Duration,

    shutting_down: Option<bool>,
    exit_requested: bool,
}

impl SlotSetManager {
    /// Build every configured slot and arm the update timers.
    pub fn new(ctx: Context, collector: Arc<dyn Collector>) -> Self {
        let mut manager = Self {
            ctx,
            collector,
            slots: BTreeMap::new(),
            next_slot_id: 1,
            next_child: 1,
            poll_timer: None,
            flush_timer: None,
            drain: None,
            next_drain_id: 1,
            draining_badput: Duration::ZERO,
            shutting_down: None,
            exit_requested: false,
        };

        let configs = manager.ctx.config.slots.clone();
        for config in &configs {
            let kind = match config.kind {
                SlotKind::Static => SlotType::Static,
                SlotKind::Partitionable => SlotType::Partitionable,
            };
            let id = manager.allocate_id();
            let mut slot = Slot::new(&manager.ctx, id, config, kind, None);
            slot.init(&manager.ctx);
            manager.slots.insert(id, slot);
        }
        manager.stagger_update_timers();
        manager.settle();
        tracing::info!(slots = manager.slots.len(), "Slot set created");
        manager
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn allocate_id(&mut self) -> SlotId {
        let id = SlotId(self.next_slot_id);
        self.next_slot_id += 1;
        id
    }

    // -- lookups ----------------------------------------------------------

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot whose current claim carries `token`.
    pub fn get_by_cur_id(&self, token: &str) -> Option<&Slot> {
        self.slots.values().find(|s| s.current().id().matches(token))
    }

    /// Slot holding `token` as its current, preempting or on-demand claim.
    pub fn get_by_any_id(&self, token: &str) -> Option<&Slot> {
        self.find_any(token).and_then(|id| self.slots.get(&id))
    }

    fn find_any(&self, token: &str) -> Option<SlotId> {
        self.slots
            .values()
            .find(|s| {
                s.current().id().matches(token)
                    || s.preempting().map(|p| p.id().matches(token)).unwrap_or(false)
                    || s.cod().find(token).is_some()
            })
            .map(Slot::id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Slot> {
        self.slots.values().find(|s| s.name() == name)
    }

    pub fn get_by_slot_id(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    /// Current claims held by `user`.
    pub fn claims_for_user(&self, user: &str) -> Vec<ClaimId> {
        self.slots
            .values()
            .map(Slot::current)
            .filter(|c| c.state() != ClaimState::Unclaimed)
            .filter(|c| c.client().and_then(|i| i.user.as_deref()) == Some(user))
            .map(|c| c.id().clone())
            .collect()
    }

    pub fn state(&self) -> State {
        node_state(self.slots.values().map(Slot::state))
    }

    pub fn records(&self) -> Vec<SlotRecord> {
        self.slots.values().map(Slot::record).collect()
    }

    fn slot_for(&self, command: &'static str, token: &str) -> Result<SlotId> {
        self.find_any(token).ok_or_else(|| {
            tracing::warn!(command, "Command for unknown claim refused");
            StartdError::refused(command, RefuseReason::UnknownClaim)
        })
    }

    fn with_slot<R>(&mut self, id: SlotId, f: impl FnOnce(&mut Slot, &Context) -> R) -> Option<R> {
        let ctx = &self.ctx;
        let slot = self.slots.get_mut(&id)?;
        Some(f(slot, ctx))
    }

    /// Run `f` against the slot holding `token`, then settle.
    fn on_claim<R>(
        &mut self,
        command: &'static str,
        token: &str,
        f: impl FnOnce(&mut Slot, &Context) -> Result<R>,
    ) -> Result<R> {
        let id = self.slot_for(command, token)?;
        let result = self
            .with_slot(id, f)
            .unwrap_or_else(|| Err(StartdError::SlotNotFound(id.to_string())));
        if let Err(e) = &result {
            tracing::warn!(command, slot = %id, error = %e, "Command refused");
        }
        self.settle();
        result
    }

    // -- claim protocol ---------------------------------------------------

    pub fn request_claim(
        &mut self,
        token: &str,
        request: Attributes,
        client: ClientInfo,
        alive_interval: Option<Duration>,
    ) -> Result<oneshot::Receiver<GrantResult>> {
        let id = self.slot_for("REQUEST_CLAIM", token)?;
        let partitionable = self
            .slots
            .get(&id)
            .map(|s| s.kind() == SlotType::Partitionable)
            .unwrap_or(false);
        if partitionable {
            let result = self.split_partitionable(id, token, request, client, alive_interval);
            self.settle();
            return result;
        }
        self.on_claim("REQUEST_CLAIM", token, |slot, ctx| {
            slot.request_claim(ctx, token, request, client, alive_interval)
        })
    }

    /// Carve a dynamic slot for the request out of a partitionable slot and
    /// hand it the partitionable slot's claim.
    fn split_partitionable(
        &mut self,
        parent_id: SlotId,
        token: &str,
        request: Attributes,
        client: ClientInfo,
        alive_interval: Option<Duration>,
    ) -> Result<oneshot::Receiver<GrantResult>> {
        const CMD: &str = "REQUEST_CLAIM";
        let ctx = self.ctx.clone();
        let child_id = SlotId(self.next_slot_id);
        let child_name;
        let claim;
        let (cpus, memory_mb);
        {
            let Some(parent) = self.slots.get_mut(&parent_id) else {
                return Err(StartdError::SlotNotFound(parent_id.to_string()));
            };
            if parent.is_shutting_down() {
                return Err(StartdError::refused(CMD, RefuseReason::ShuttingDown));
            }
            if parent.is_draining() {
                return Err(StartdError::refused(CMD, RefuseReason::Draining));
            }
            if !parent.current().id().matches(token) {
                return Err(StartdError::refused(CMD, RefuseReason::UnknownClaim));
            }
            if !ctx.starter.can_run(&request) {
                return Err(StartdError::refused(CMD, RefuseReason::NoStarter));
            }
            if !parent.mutual_requirements(&ctx, &request) {
                return Err(StartdError::refused(CMD, RefuseReason::RequirementsFailed));
            }
            cpus = request_number(&request, "RequestCpus").unwrap_or(1).max(1) as u32;
            memory_mb = request_number(&request, "RequestMemory").unwrap_or_else(|| {
                parent.memory_mb() * u64::from(cpus) / u64::from(parent.cpus().max(1))
            });
            if !parent.take_resources(cpus, memory_mb) {
                tracing::info!(slot = %parent.name(), cpus, memory_mb, "Partitionable slot cannot fit request");
                return Err(StartdError::refused(CMD, RefuseReason::InsufficientResources));
            }
            parent.current_mut().cancel_match_timer();
            claim = parent.take_current(&ctx);
            child_name = format!("{}_{}", parent.name(), self.next_child);
        }
        self.next_slot_id += 1;
        self.next_child += 1;

        let config = SlotConfig {
            name: child_name,
            kind: SlotKind::Static,
            cpus,
            memory_mb,
        };
        let mut child = Slot::new(&ctx, child_id, &config, SlotType::Dynamic, Some(parent_id));
        child.adopt_claim(claim);
        tracing::info!(slot = %child.name(), parent = %parent_id, cpus, memory_mb, "Dynamic slot split off");
        let result = child.request_claim(&ctx, token, request, client, alive_interval);
        if result.is_err() {
            child.change_state(&ctx, State::Delete);
        }
        self.slots.insert(child_id, child);
        self.stagger_update_timers();
        result
    }

    pub fn activate_claim(&mut self, token: &str, job: Attributes) -> Result<()> {
        self.on_claim("ACTIVATE_CLAIM", token, |slot, ctx| {
            slot.activate_claim(ctx, token, job)
        })
    }

    pub fn match_info(&mut self, token: &str) -> Result<()> {
        self.on_claim("MATCH_INFO", token, |slot, ctx| {
            if slot.kind() == SlotType::Partitionable {
                return Ok(());
            }
            slot.match_info(ctx, token)
        })
    }

    pub fn release(&mut self, token: &str) -> Result<Option<oneshot::Receiver<ClaimState>>> {
        self.on_claim("RELEASE_CLAIM", token, |slot, ctx| slot.release(ctx, token))
    }

    pub fn deactivate(
        &mut self,
        token: &str,
        graceful: bool,
    ) -> Result<Option<oneshot::Receiver<ClaimState>>> {
        self.on_claim("DEACTIVATE_CLAIM", token, |slot, ctx| {
            slot.deactivate(ctx, token, graceful)
        })
    }

    pub fn alive(&mut self, token: &str) -> Result<()> {
        self.on_claim("ALIVE", token, |slot, ctx| slot.alive(ctx, token))
    }

    pub fn pckpt(&mut self, token: &str) -> Result<()> {
        self.on_claim("PCKPT_FRGN_JOB", token, |slot, ctx| slot.pckpt(ctx, token))
    }

    pub fn req_new_proc(&mut self, token: &str) -> Result<()> {
        self.on_claim("REQ_NEW_PROC", token, |slot, ctx| slot.req_new_proc(ctx, token))
    }

    /// CA_REQUEST_CLAIM: an on-demand claim on the named slot, or on the
    /// first static slot when no name is given.
    pub fn cod_request(
        &mut self,
        slot_name: Option<&str>,
        request: Attributes,
        client: ClientInfo,
    ) -> Result<(String, ClaimId)> {
        let id = self
            .slots
            .values()
            .find(|s| match slot_name {
                Some(name) => s.name() == name,
                None => s.kind() != SlotType::Partitionable,
            })
            .map(Slot::id)
            .ok_or_else(|| StartdError::SlotNotFound(slot_name.unwrap_or("any").to_string()))?;
        let result = self
            .with_slot(id, |slot, ctx| {
                slot.cod_request(ctx, request, client)
                    .map(|claim| (slot.name().to_string(), claim))
            })
            .unwrap_or_else(|| Err(StartdError::SlotNotFound(id.to_string())));
        self.settle();
        result
    }

    /// Run a fetched job on the named slot, or on the first Unclaimed
    /// static or dynamic slot.
    pub fn fetch_work(&mut self, slot_name: Option<&str>, job: Attributes) -> Result<(String, ClaimId)> {
        let id = self
            .slots
            .values()
            .find(|s| match slot_name {
                Some(name) => s.name() == name,
                None => s.kind() != SlotType::Partitionable && s.state() == State::Unclaimed,
            })
            .map(Slot::id)
            .ok_or_else(|| StartdError::SlotNotFound(slot_name.unwrap_or("any").to_string()))?;
        let result = self
            .with_slot(id, |slot, ctx| {
                slot.fetch_work(ctx, job)
                    .map(|claim| (slot.name().to_string(), claim))
            })
            .unwrap_or_else(|| Err(StartdError::SlotNotFound(id.to_string())));
        if let Err(e) = &result {
            tracing::warn!(command = "FETCH_WORK", slot = %id, error = %e, "Command refused");
        }
        self.settle();
        result
    }

    /// VACATE_ALL_CLAIMS (retire) or VACATE_ALL_FAST (kill).
    pub fn vacate_all(&mut self, fast: bool) {
        tracing::info!(fast, "Vacating all claims");
        let ctx = &self.ctx;
        for slot in self.slots.values_mut() {
            if fast {
                slot.kill_claim(ctx);
            } else {
                slot.retire_claim(ctx, false);
            }
        }
        self.settle();
    }

    // -- events -----------------------------------------------------------

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Timer(fired) => self.handle_timer(fired),
            Event::StarterExited {
                slot,
                starter,
                exit,
            } => {
                let found = self.with_slot(slot, |s, ctx| s.starter_exited(ctx, starter, exit));
                if found.is_none() {
                    tracing::debug!(slot = %slot, starter = %starter, "Starter exit for a slot that is gone");
                }
            }
            Event::AliveReply {
                slot,
                claim,
                outcome,
            } => {
                self.with_slot(slot, |s, ctx| s.alive_reply(ctx, &claim, &outcome));
            }
        }
        self.settle();
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        let id = fired.id;
        match fired.target {
            TimerTarget::LeaseExpired { slot, claim } => {
                self.with_slot(slot, |s, ctx| s.lease_expired(ctx, &claim, id));
            }
            TimerTarget::SendAlive { slot, claim } => {
                self.with_slot(slot, |s, ctx| s.send_alive_timer(ctx, &claim, id));
            }
            TimerTarget::MatchTimeout { slot, claim } => {
                self.with_slot(slot, |s, ctx| s.match_timed_out(ctx, &claim, id));
            }
            TimerTarget::KillTimeout { slot, claim } => {
                self.with_slot(slot, |s, ctx| s.kill_timeout(ctx, &claim, id));
            }
            TimerTarget::BenchmarksDone { slot } => {
                self.with_slot(slot, |s, ctx| s.benchmarks_done(ctx, id));
            }
            TimerTarget::SlotUpdate { slot } => self.slot_update(slot, id),
            TimerTarget::Poll => {
                if is_current(&self.poll_timer, id) {
                    self.poll();
                }
            }
            TimerTarget::FlushUpdates => {
                if is_current(&self.flush_timer, id) {
                    self.flush_timer = None;
                    self.send_updates_and_clear_dirty();
                }
            }
        }
    }

    // -- poll and update cycles --------------------------------------------

    /// Re-evaluate policy on every slot.
    pub fn poll(&mut self) {
        self.refresh_draining();
        let ctx = &self.ctx;
        for slot in self.slots.values_mut() {
            slot.eval_state(ctx);
        }
        self.settle();
    }

    /// Periodic update of one slot: evaluate, then publish.
    fn slot_update(&mut self, id: SlotId, fired: TimerId) {
        self.refresh_draining();
        let collector = self.collector.clone();
        self.with_slot(id, |slot, ctx| {
            if !slot.is_current_update_timer(fired) {
                return;
            }
            slot.eval_state(ctx);
            collector.publish(slot.record());
            slot.clear_dirty();
        });
        self.settle();
    }

    /// Publish every dirty slot now.
    pub fn send_updates_and_clear_dirty(&mut self) {
        let mut sent = 0;
        for slot in self.slots.values_mut().filter(|s| s.is_dirty()) {
            slot.refresh_ad(&self.ctx);
            self.collector.publish(slot.record());
            slot.clear_dirty();
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(slots = sent, "Published dirty slot records");
        }
    }

    /// Withdraw every record; the daemon is going away.
    pub fn final_update(&mut self) {
        for slot in self.slots.values() {
            self.collector.invalidate(slot.name());
        }
        tracing::info!("Withdrew all slot records");
    }

    /// One periodic update timer per slot, offset so the slots do not all
    /// publish at once.
    fn stagger_update_timers(&mut self) {
        let timing = &self.ctx.config.timing;
        let interval = timing.update_interval();
        let offset = Duration::from_secs(timing.update_offset_secs);
        let count = self.slots.len().max(1) as u32;
        for (index, slot) in self.slots.values_mut().enumerate() {
            let first = offset + interval * index as u32 / count;
            let timer = self.ctx.timers.start_periodic(
                first,
                interval,
                TimerTarget::SlotUpdate { slot: slot.id() },
            );
            slot.set_update_timer(timer);
        }
    }

    /// Keep the poll timer running only while some slot needs it.
    fn check_polling(&mut self) {
        let needed = self.slots.values().any(Slot::needs_polling) || self.drain.is_some();
        match (needed, self.poll_timer.is_some()) {
            (true, false) => {
                let period = self.ctx.config.timing.polling_interval();
                self.poll_timer = Some(self.ctx.timers.start_periodic(period, period, TimerTarget::Poll));
            }
            (false, true) => self.poll_timer = None,
            _ => {}
        }
    }

    /// Collect what slots left behind after a command or event.
    pub fn settle(&mut self) {
        let mut drain_check = false;
        let mut resume = false;
        let mut deleted = Vec::new();
        for slot in self.slots.values_mut() {
            self.draining_badput += slot.take_draining_badput();
            drain_check |= slot.take_drain_check();
            resume |= slot.take_resume_after_draining();
            if slot.is_marked_for_delete() {
                deleted.push(slot.id());
            }
        }

        for id in deleted {
            self.delete_slot(id);
        }
        if drain_check {
            self.check_for_drain_completion();
        }
        if resume {
            self.consider_resuming_after_draining();
        }

        if self.flush_timer.is_none() && self.slots.values().any(Slot::is_dirty) {
            self.flush_timer = Some(self.ctx.timers.start(
                self.ctx.config.timing.dirty_update_delay(),
                TimerTarget::FlushUpdates,
            ));
        }
        self.check_polling();
    }

    fn delete_slot(&mut self, id: SlotId) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        self.collector.invalidate(slot.name());
        tracing::info!(slot = %slot.name(), "Slot deleted");
        if let Some(parent) = slot.parent().and_then(|p| self.slots.get_mut(&p)) {
            parent.add_resources(slot.cpus(), slot.memory_mb());
            parent.eval_state(&self.ctx);
        }
    }

    // -- draining -----------------------------------------------------------

    /// Start draining the node. Returns the drain request id.
    pub fn start_draining(&mut self, request: DrainRequest) -> Result<u64> {
        const CMD: &str = "DRAIN_JOBS";
        if self.drain.is_some() {
            return Err(StartdError::refused(CMD, RefuseReason::AlreadyDraining));
        }
        if let Some(check) = &request.check_expr {
            let policy = &*self.ctx.policy;
            let failed = self.slots.values().find(|slot| {
                !policy
                    .eval_source(check, &EvalContext::new(slot.ad(), None))
                    .as_tristate()
                    .is_true()
            });
            if let Some(slot) = failed {
                tracing::info!(slot = %slot.name(), check = %check, "Drain check expression failed");
                return Err(StartdError::refused(CMD, RefuseReason::CheckFailed));
            }
        }

        let id = self.next_drain_id;
        self.next_drain_id += 1;
        let deadline = match request.how {
            DrainHow::Graceful => {
                let longest = self
                    .slots
                    .values()
                    .map(|s| s.retirement_remaining(&self.ctx))
                    .max()
                    .unwrap_or(0);
                let retirement = (longest != UNLIMITED_RETIREMENT)
                    .then(|| Duration::from_secs(longest.max(0) as u64));
                match (retirement, request.deadline) {
                    (Some(r), Some(d)) => Some(Instant::now() + r.min(d)),
                    (Some(r), None) => Some(Instant::now() + r),
                    (None, Some(d)) => Some(Instant::now() + d),
                    (None, None) => None,
                }
            }
            DrainHow::Quick | DrainHow::Fast => Some(Instant::now()),
        };
        tracing::info!(request_id = id, how = ?request.how, reason = %request.reason, "Draining started");
        self.drain = Some(ActiveDrain {
            id,
            request,
            deadline,
        });
        self.refresh_draining();

        let how = self.drain.as_ref().map(|d| d.request.how);
        let ctx = &self.ctx;
        for slot in self.slots.values_mut() {
            match how {
                Some(DrainHow::Graceful) => slot.retire_claim(ctx, true),
                Some(DrainHow::Quick) => slot.release_claim(ctx),
                Some(DrainHow::Fast) => slot.kill_claim(ctx),
                None => {}
            }
            slot.eval_state(ctx);
        }
        self.settle();
        Ok(id)
    }

    /// Cancel the drain. `None` cancels whatever drain is active.
    pub fn cancel_draining(&mut self, request_id: Option<u64>) -> Result<()> {
        let matches = match (&self.drain, request_id) {
            (Some(drain), Some(id)) => drain.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return Err(StartdError::refused(
                "CANCEL_DRAIN_JOBS",
                RefuseReason::NoSuchDrainRequest,
            ));
        }
        if let Some(drain) = self.drain.take() {
            tracing::info!(request_id = drain.id, "Draining cancelled");
        }
        let ctx = &self.ctx;
        for slot in self.slots.values_mut() {
            slot.set_draining(None);
            slot.eval_state(ctx);
        }
        self.settle();
        Ok(())
    }

    pub fn is_slot_draining(&self) -> bool {
        self.drain.is_some()
    }

    pub fn drain_request_id(&self) -> Option<u64> {
        self.drain.as_ref().map(|d| d.id)
    }

    /// Every slot is Drained.
    pub fn draining_is_complete(&self) -> bool {
        self.drain.is_some() && self.slots.values().all(|s| s.state() == State::Drained)
    }

    /// Seconds of retirement the drain still grants.
    pub fn graceful_remaining(&self) -> i64 {
        match self.drain.as_ref().and_then(|d| d.deadline) {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).as_secs() as i64,
            None if self.drain.is_some() => UNLIMITED_RETIREMENT,
            None => 0,
        }
    }

    /// Total run time of jobs killed by draining.
    pub fn draining_badput(&self) -> Duration {
        self.draining_badput
    }

    /// Push the current view of the drain into every slot.
    fn refresh_draining(&mut self) {
        let info = self.drain.as_ref().map(|drain| DrainingInfo {
            request_id: drain.id,
            graceful: drain.request.how == DrainHow::Graceful,
            reason: drain.request.reason.clone(),
            deadline: drain.deadline,
            start_expr: drain
                .request
                .start_expr
                .clone()
                .or_else(|| Some(self.ctx.policy.source(PolicyExpr::DrainingStart))),
            graceful_remaining: self.graceful_remaining(),
            complete: self.draining_is_complete(),
        });
        for slot in self.slots.values_mut() {
            slot.set_draining(info.clone());
        }
    }

    /// A draining slot's job finished. When every job still running was
    /// accepted while draining, nothing else is holding the drain up: stop
    /// accepting and retire them too.
    fn check_for_drain_completion(&mut self) {
        if self.drain.is_none() {
            return;
        }
        let mut any_accepted = false;
        for slot in self.slots.values() {
            if slot.kind() == SlotType::Partitionable || !slot.current().is_active() {
                continue;
            }
            if !slot.accepted_while_draining() {
                return;
            }
            any_accepted = true;
        }
        if !any_accepted {
            self.refresh_draining();
            return;
        }
        tracing::info!("Only jobs accepted while draining remain, retiring them");
        if let Some(drain) = self.drain.as_mut() {
            drain.request.start_expr = Some("false".to_string());
        }
        self.refresh_draining();
        let ctx = &self.ctx;
        for slot in self.slots.values_mut() {
            if slot.current().is_active() {
                slot.retire_claim(ctx, true);
            }
        }
    }

    /// A Drained/Idle slot asked whether the drain should end.
    fn consider_resuming_after_draining(&mut self) {
        if !self.draining_is_complete() {
            return;
        }
        let Some(on_completion) = self.drain.as_ref().map(|d| d.request.on_completion) else {
            return;
        };
        match on_completion {
            DrainCompletion::Nothing => {}
            DrainCompletion::Resume => {
                tracing::info!("Draining complete, resuming");
                let _ = self.cancel_draining(None);
            }
            DrainCompletion::Exit => {
                if !self.exit_requested {
                    tracing::info!("Draining complete, exiting");
                    self.exit_requested = true;
                }
            }
        }
    }

    /// A completed drain asked the daemon to exit.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    // -- shutdown -----------------------------------------------------------

    /// Release (graceful) or kill (fast) every claim.
    pub fn shutdown(&mut self, graceful: bool) {
        if self.shutting_down == Some(false) && graceful {
            return;
        }
        tracing::info!(graceful, "Shutting down all claims");
        self.shutting_down = Some(graceful);
        let ctx = &self.ctx;
        for slot in self.slots.values_mut() {
            slot.shutdown_all_claims(ctx, graceful, false);
        }
        self.settle();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.is_some()
    }

    /// Nothing is claimed or running any more.
    pub fn shutdown_complete(&self) -> bool {
        self.slots.values().all(|s| !s.in_use())
    }
}

fn request_number(request: &Attributes, name: &str) -> Option<u64> {
    match request.get(name)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MemoryCollector;
    use crate::config::StartdConfig;
    use crate::slot::Activity;
    use crate::starter::StarterExit;
    use crate::test_support::TestRig;
    use serde_json::json;

    fn job(extra: Value) -> Attributes {
        let mut base = json!({
            "Cmd": "/bin/sleep 600",
            "User": "bob@example.org",
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut base, extra) {
            base.extend(extra);
        }
        match base {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn manager(config: StartdConfig) -> (SlotSetManager, TestRig, MemoryCollector) {
        let rig = TestRig::new(config);
        let collector = MemoryCollector::new();
        let manager = SlotSetManager::new(rig.ctx.clone(), Arc::new(collector.clone()));
        (manager, rig, collector)
    }

    fn token_of(manager: &SlotSetManager, name: &str) -> String {
        manager.get_by_name(name).unwrap().current().id().secret().to_string()
    }

    fn claim_and_run(manager: &mut SlotSetManager, name: &str) -> String {
        let token = token_of(manager, name);
        let mut grant = manager
            .request_claim(&token, job(json!({})), ClientInfo::default(), None)
            .unwrap();
        grant.try_recv().unwrap().unwrap();
        manager.activate_claim(&token, job(json!({}))).unwrap();
        token
    }

    #[test]
    fn node_state_prefers_claimed_then_preempting_then_owner() {
        assert_eq!(node_state([State::Unclaimed, State::Claimed, State::Owner]), State::Claimed);
        assert_eq!(node_state([State::Preempting, State::Owner]), State::Preempting);
        assert_eq!(node_state([State::Unclaimed, State::Owner]), State::Owner);
        assert_eq!(node_state([State::Matched]), State::Unclaimed);
    }

    #[tokio::test]
    async fn lookups_find_slots_by_each_claim() {
        let (mut manager, _rig, _collector) = manager(StartdConfig::default().with_static_slots(2));
        let token = claim_and_run(&mut manager, "slot2");

        assert_eq!(manager.get_by_cur_id(&token).unwrap().name(), "slot2");
        let pre = manager
            .get_by_name("slot2")
            .unwrap()
            .preempting()
            .unwrap()
            .id()
            .secret()
            .to_string();
        assert!(manager.get_by_cur_id(&pre).is_none());
        assert_eq!(manager.get_by_any_id(&pre).unwrap().name(), "slot2");
        assert_eq!(manager.claims_for_user("bob@example.org").len(), 1);
        assert_eq!(manager.state(), State::Claimed);
    }

    #[tokio::test]
    async fn unknown_token_is_refused() {
        let (mut manager, _rig, _collector) = manager(StartdConfig::default());
        let err = manager.alive("nobody").unwrap_err();
        assert_eq!(err.refuse_reason(), Some(RefuseReason::UnknownClaim));
    }

    #[tokio::test]
    async fn partitionable_request_splits_a_dynamic_slot() {
        let config = StartdConfig {
            slots: vec![SlotConfig::partitionable("slot1", 8, 16384)],
            ..StartdConfig::default()
        };
        let (mut manager, _rig, _collector) = manager(config);
        let token = token_of(&manager, "slot1");

        let mut grant = manager
            .request_claim(
                &token,
                job(json!({"RequestCpus": 2, "RequestMemory": 4096})),
                ClientInfo::default(),
                None,
            )
            .unwrap();
        let granted = grant.try_recv().unwrap().unwrap();
        assert_eq!(granted.slot, "slot1_1");

        let parent = manager.get_by_name("slot1").unwrap();
        assert_eq!((parent.cpus(), parent.memory_mb()), (6, 12288));
        assert_eq!(parent.state(), State::Unclaimed);
        assert_ne!(parent.current().id().secret(), token);

        let child = manager.get_by_name("slot1_1").unwrap();
        assert_eq!(child.kind(), SlotType::Dynamic);
        assert_eq!((child.state(), child.activity()), (State::Claimed, Activity::Idle));
        let child_id = child.id();

        // releasing the dynamic slot deletes it and returns its resources
        manager.release(&token).unwrap();
        assert!(manager.get_by_slot_id(child_id).is_none());
        let parent = manager.get_by_name("slot1").unwrap();
        assert_eq!((parent.cpus(), parent.memory_mb()), (8, 16384));
    }

    #[tokio::test]
    async fn oversized_partitionable_request_is_refused() {
        let config = StartdConfig {
            slots: vec![SlotConfig::partitionable("slot1", 2, 2048)],
            ..StartdConfig::default()
        };
        let (mut manager, _rig, _collector) = manager(config);
        let token = token_of(&manager, "slot1");

        let err = manager
            .request_claim(&token, job(json!({"RequestCpus": 4})), ClientInfo::default(), None)
            .unwrap_err();
        assert_eq!(err.refuse_reason(), Some(RefuseReason::InsufficientResources));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get_by_name("slot1").unwrap().current().id().secret(), token);
    }

    #[tokio::test]
    async fn graceful_drain_retires_then_drains() {
        let (mut manager, _rig, _collector) = manager(StartdConfig::default().with_static_slots(2));
        claim_and_run(&mut manager, "slot1");
        let starter = manager.get_by_name("slot1").unwrap().current().starter().unwrap();

        let id = manager
            .start_draining(DrainRequest {
                how: DrainHow::Graceful,
                deadline: None,
                reason: "kernel upgrade".into(),
                on_completion: DrainCompletion::Nothing,
                check_expr: None,
                start_expr: None,
            })
            .unwrap();
        assert!(manager.is_slot_draining());
        assert_eq!(manager.get_by_name("slot2").unwrap().state(), State::Drained);

        let err = manager
            .request_claim(&token_of(&manager, "slot2"), job(json!({})), ClientInfo::default(), None)
            .unwrap_err();
        assert_eq!(err.refuse_reason(), Some(RefuseReason::Draining));

        // MAXJOBRETIREMENTTIME defaults to 0, so the job is vacated
        let slot1 = manager.get_by_name("slot1").unwrap();
        assert_eq!(slot1.state(), State::Preempting);
        let slot1 = slot1.id();

        manager.handle_event(Event::StarterExited {
            slot: slot1,
            starter,
            exit: StarterExit::Exited(0),
        });
        manager.poll();
        assert!(manager.draining_is_complete());
        assert!(manager
            .slots()
            .all(|s| (s.state(), s.activity()) == (State::Drained, Activity::Idle)));

        let err = manager.cancel_draining(Some(id + 1)).unwrap_err();
        assert_eq!(err.refuse_reason(), Some(RefuseReason::NoSuchDrainRequest));
        manager.cancel_draining(Some(id)).unwrap();
        assert!(manager.slots().all(|s| s.state() == State::Unclaimed));
    }

    #[tokio::test]
    async fn second_drain_is_refused() {
        let (mut manager, _rig, _collector) = manager(StartdConfig::default());
        let request = DrainRequest {
            how: DrainHow::Fast,
            deadline: None,
            reason: "test".into(),
            on_completion: DrainCompletion::Nothing,
            check_expr: None,
            start_expr: None,
        };
        manager.start_draining(request.clone()).unwrap();
        let err = manager.start_draining(request).unwrap_err();
        assert_eq!(err.refuse_reason(), Some(RefuseReason::AlreadyDraining));
    }

    #[tokio::test]
    async fn drain_check_expression_must_hold() {
        let (mut manager, _rig, _collector) = manager(StartdConfig::default());
        let err = manager
            .start_draining(DrainRequest {
                how: DrainHow::Graceful,
                deadline: None,
                reason: "test".into(),
                on_completion: DrainCompletion::Nothing,
                check_expr: Some("Cpus > 64".into()),
                start_expr: None,
            })
            .unwrap_err();
        assert_eq!(err.refuse_reason(), Some(RefuseReason::CheckFailed));
        assert!(!manager.is_slot_draining());
    }

    #[tokio::test]
    async fn drain_with_resume_cancels_itself_when_complete() {
        let (mut manager, _rig, _collector) = manager(StartdConfig::default());
        manager
            .start_draining(DrainRequest {
                how: DrainHow::Quick,
                deadline: None,
                reason: "test".into(),
                on_completion: DrainCompletion::Resume,
                check_expr: None,
                start_expr: None,
            })
            .unwrap();
        manager.poll();
        manager.poll();
        assert!(!manager.is_slot_draining());
        assert_eq!(manager.state(), State::Unclaimed);
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_slots_flush_after_delay() {
        let (mut manager, mut rig, collector) = manager(StartdConfig::default());
        let fired = rig
            .next_timer(|t| matches!(t, TimerTarget::FlushUpdates))
            .await;
        manager.handle_event(Event::Timer(fired));

        let record = collector.get("slot1").unwrap();
        assert_eq!(record.state(), Some(State::Unclaimed));
        assert!(manager.slots().all(|s| !s.is_dirty()));
    }

    #[tokio::test]
    async fn fast_shutdown_completes_after_starters_exit() {
        let (mut manager, _rig, collector) = manager(StartdConfig::default());
        claim_and_run(&mut manager, "slot1");
        let slot = manager.get_by_name("slot1").unwrap();
        let (id, starter) = (slot.id(), slot.current().starter().unwrap());

        manager.shutdown(false);
        assert!(!manager.shutdown_complete());
        assert_eq!(manager.get_by_name("slot1").unwrap().activity(), Activity::Killing);

        manager.handle_event(Event::StarterExited {
            slot: id,
            starter,
            exit: StarterExit::Signaled(9),
        });
        assert!(manager.shutdown_complete());

        manager.send_updates_and_clear_dirty();
        manager.final_update();
        assert!(collector.records().is_empty());
    }
}
