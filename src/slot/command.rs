//! Claim protocol commands and claim-scoped timer firings for one slot.
//!
//! Claim tokens arrive as presented by the remote party and are compared
//! against the full secret. Commands that finish later (a claim grant that
//! waits for a job to vacate, a release that waits for the starter) return
//! a receiver that resolves when the slot gets there.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::claim::{Claim, ClaimId, ClaimState, ClaimType, ClientInfo, GrantResult, PendingCommand};
use crate::client::AliveOutcome;
use crate::context::Context;
use crate::error::{RefuseReason, Result, StartdError};
use crate::policy::{Attributes, EvalContext, PolicyExpr};
use crate::slot::{secs, Activity, Slot, SlotType, State};
use crate::timer::TimerId;

/// Which of the slot's opportunistic claims a token names.
enum Which {
    Current,
    Preempting,
}

impl Slot {
    fn which(&self, token: &str) -> Option<Which> {
        if self.current.id().matches(token) {
            return Some(Which::Current);
        }
        if self
            .preempting
            .as_ref()
            .map(|pre| pre.id().matches(token))
            .unwrap_or(false)
        {
            return Some(Which::Preempting);
        }
        None
    }

    /// START holds for the job and the job's own Requirements hold for the slot.
    pub fn mutual_requirements(&self, ctx: &Context, job: &Attributes) -> bool {
        let policy = &*ctx.policy;
        if !self
            .reqexp
            .eval(policy, &EvalContext::new(&self.ad, Some(job)))
            .is_true()
        {
            return false;
        }
        match job.get("Requirements").and_then(Value::as_str) {
            Some(source) => policy
                .eval_source(source, &EvalContext::new(job, Some(&self.ad)))
                .as_tristate()
                .is_true(),
            None => true,
        }
    }

    /// The slot's RANK for a job; undefined ranks as 0.
    pub fn rank_of(&self, ctx: &Context, job: &Attributes) -> f64 {
        ctx.policy
            .eval_number(PolicyExpr::Rank, &EvalContext::new(&self.ad, Some(job)))
            .unwrap_or(0.0)
    }

    /// REQUEST_CLAIM. Against the current claim the slot heads for Claimed;
    /// against the preempting claim of a Claimed slot the running claim is
    /// retired first. The receiver yields the grant once the slot is Claimed.
    pub fn request_claim(
        &mut self,
        ctx: &Context,
        token: &str,
        request: Attributes,
        client: ClientInfo,
        alive_interval: Option<Duration>,
    ) -> Result<oneshot::Receiver<GrantResult>> {
        const CMD: &str = "REQUEST_CLAIM";
        if self.shutting_down {
            return Err(StartdError::refused(CMD, RefuseReason::ShuttingDown));
        }
        if self.is_draining() {
            return Err(StartdError::refused(CMD, RefuseReason::Draining));
        }
        let which = self
            .which(token)
            .ok_or_else(|| StartdError::refused(CMD, RefuseReason::UnknownClaim))?;
        if !ctx.starter.can_run(&request) {
            return Err(StartdError::refused(CMD, RefuseReason::NoStarter));
        }
        if !self.mutual_requirements(ctx, &request) {
            tracing::info!(slot = %self.name, "Claim request does not match requirements");
            return Err(StartdError::refused(CMD, RefuseReason::RequirementsFailed));
        }
        let rank = self.rank_of(ctx, &request);
        let (tx, rx) = oneshot::channel();

        match which {
            Which::Preempting => {
                if self.state() != State::Claimed {
                    return Err(StartdError::refused(CMD, RefuseReason::WrongState));
                }
                let current_rank = self.current.rank();
                if rank < current_rank {
                    tracing::info!(slot = %self.name, rank, current_rank, "Preempting request ranks below the running claim");
                    return Err(StartdError::refused(CMD, RefuseReason::RankTooLow));
                }
                let Some(pre) = self.preempting.as_mut() else {
                    return Err(StartdError::refused(CMD, RefuseReason::UnknownClaim));
                };
                prepare_request(ctx, pre, request, tx, rank, client, alive_interval);
                tracing::info!(slot = %self.name, claim = %pre.id(), rank, current_rank, "Preempting claim request received");
                self.dirty = true;
                self.eval_state(ctx);
            }
            Which::Current => {
                if !matches!(
                    self.state(),
                    State::Owner | State::Unclaimed | State::Matched | State::Backfill
                ) {
                    return Err(StartdError::refused(CMD, RefuseReason::WrongState));
                }
                prepare_request(ctx, &mut self.current, request, tx, rank, client, alive_interval);
                tracing::info!(slot = %self.name, claim = %self.current.id(), rank, "Claim request received");
                self.set_destination(ctx, State::Claimed);
            }
        }
        Ok(rx)
    }

    /// ACTIVATE_CLAIM: run a job under the claim.
    pub fn activate_claim(&mut self, ctx: &Context, token: &str, job: Attributes) -> Result<()> {
        const CMD: &str = "ACTIVATE_CLAIM";
        if self.cod.find(token).is_some() {
            return self.cod_activate(ctx, token, job).map(|_| ());
        }
        if !self.current.id().matches(token) {
            return Err(StartdError::refused(CMD, RefuseReason::UnknownClaim));
        }
        if self.shutting_down {
            return Err(StartdError::refused(CMD, RefuseReason::ShuttingDown));
        }
        if self.state() != State::Claimed || self.activity() != Activity::Idle {
            tracing::warn!(slot = %self.name, state = %self.state(), activity = %self.activity(), "Activation refused in wrong state");
            return Err(StartdError::refused(CMD, RefuseReason::WrongState));
        }
        if let Some(drain) = &self.draining {
            let allowed = drain
                .start_expr
                .as_deref()
                .map(|source| {
                    ctx.policy
                        .eval_source(source, &EvalContext::new(&self.ad, Some(&job)))
                        .as_tristate()
                        .is_true()
                })
                .unwrap_or(false);
            if !allowed {
                return Err(StartdError::refused(CMD, RefuseReason::Draining));
            }
        }
        if !self.mutual_requirements(ctx, &job) {
            return Err(StartdError::refused(CMD, RefuseReason::RequirementsFailed));
        }
        if !ctx.starter.can_run(&job) {
            return Err(StartdError::refused(CMD, RefuseReason::NoStarter));
        }

        if !self.current.spawn_starter(ctx, Some(job), &self.ad) {
            self.dirty = true;
            return Err(StartdError::refused(CMD, RefuseReason::NoStarter));
        }
        self.accepted_while_draining = self.is_draining();
        self.change(ctx, State::Claimed, Activity::Busy);
        Ok(())
    }

    /// Run work the daemon fetched itself. The slot is claimed under a
    /// fetched-work claim, which has no client and holds no lease, and the
    /// job is activated at once. The claim is released when the job exits.
    pub fn fetch_work(&mut self, ctx: &Context, job: Attributes) -> Result<ClaimId> {
        const CMD: &str = "FETCH_WORK";
        if self.shutting_down {
            return Err(StartdError::refused(CMD, RefuseReason::ShuttingDown));
        }
        if self.is_draining() {
            return Err(StartdError::refused(CMD, RefuseReason::Draining));
        }
        if self.kind == SlotType::Partitionable || self.state() != State::Unclaimed {
            return Err(StartdError::refused(CMD, RefuseReason::WrongState));
        }
        if !ctx.starter.can_run(&job) {
            return Err(StartdError::refused(CMD, RefuseReason::NoStarter));
        }
        if !self.mutual_requirements(ctx, &job) {
            return Err(StartdError::refused(CMD, RefuseReason::RequirementsFailed));
        }

        let mut claim = Claim::new(ctx, self.id, ClaimType::Fetch);
        claim.set_rank(self.rank_of(ctx, &job));
        claim.set_job(job.clone());
        let mut placeholder = std::mem::replace(&mut self.current, claim);
        placeholder.refuse_request(RefuseReason::WrongState);

        tracing::info!(slot = %self.name, claim = %self.current.id(), "Running fetched work");
        self.set_destination(ctx, State::Claimed);
        let id = self.current.id().clone();
        if let Err(e) = self.activate_claim(ctx, id.secret(), job) {
            tracing::warn!(slot = %self.name, claim = %id, error = %e, "Fetched work failed to start");
            self.change_state(ctx, State::Preempting);
            return Err(e);
        }
        Ok(id)
    }

    /// MATCH_INFO: the negotiator matched a request to this slot.
    pub fn match_info(&mut self, ctx: &Context, token: &str) -> Result<()> {
        const CMD: &str = "MATCH_INFO";
        match self.which(token) {
            Some(Which::Current) => match self.state() {
                State::Unclaimed | State::Owner => {
                    self.current.start_match_timer(ctx);
                    self.change_state(ctx, State::Matched);
                    Ok(())
                }
                State::Backfill => {
                    self.current.start_match_timer(ctx);
                    self.set_destination(ctx, State::Matched);
                    Ok(())
                }
                State::Matched => {
                    tracing::warn!(slot = %self.name, "Slot matched twice");
                    Ok(())
                }
                _ => Err(StartdError::refused(CMD, RefuseReason::WrongState)),
            },
            Some(Which::Preempting) => {
                if let Some(pre) = self.preempting.as_mut() {
                    tracing::info!(slot = %self.name, claim = %pre.id(), "Preempting claim matched");
                    pre.start_match_timer(ctx);
                }
                Ok(())
            }
            None => Err(StartdError::refused(CMD, RefuseReason::UnknownClaim)),
        }
    }

    /// RELEASE_CLAIM. `Some(receiver)` when the reply waits for the job to
    /// vacate.
    pub fn release(
        &mut self,
        ctx: &Context,
        token: &str,
    ) -> Result<Option<oneshot::Receiver<ClaimState>>> {
        const CMD: &str = "RELEASE_CLAIM";
        if self.cod.find(token).is_some() {
            return self.cod_release(ctx, token, true).map(Some);
        }
        match self.which(token) {
            Some(Which::Preempting) => {
                tracing::info!(slot = %self.name, "Preempting claim released by its client");
                self.remove_pre(RefuseReason::WrongState);
                self.eval_state(ctx);
                Ok(None)
            }
            Some(Which::Current) => {
                if matches!(self.state(), State::Owner | State::Unclaimed | State::Drained) {
                    return Err(StartdError::refused(CMD, RefuseReason::WrongState));
                }
                tracing::info!(slot = %self.name, claim = %self.current.id(), "Claim released by its client");
                self.current.set_schedd_closed_claim();
                let reply = if self.current.is_active() {
                    let (tx, rx) = oneshot::channel();
                    self.current.set_pending(PendingCommand::Release(Some(tx)));
                    Some(rx)
                } else {
                    None
                };
                self.release_claim(ctx);
                Ok(reply)
            }
            None => Err(StartdError::refused(CMD, RefuseReason::UnknownClaim)),
        }
    }

    /// DEACTIVATE_CLAIM[_FORCIBLY]: stop the job but keep the claim.
    pub fn deactivate(
        &mut self,
        ctx: &Context,
        token: &str,
        graceful: bool,
    ) -> Result<Option<oneshot::Receiver<ClaimState>>> {
        const CMD: &str = "DEACTIVATE_CLAIM";
        if self.cod.find(token).is_some() {
            return self.cod_deactivate(ctx, token, graceful).map(Some);
        }
        if !self.current.id().matches(token) {
            return Err(StartdError::refused(CMD, RefuseReason::UnknownClaim));
        }
        if self.state() != State::Claimed {
            return Err(StartdError::refused(CMD, RefuseReason::WrongState));
        }
        if !self.current.is_active() {
            return Ok(None);
        }
        tracing::info!(slot = %self.name, claim = %self.current.id(), graceful, "Deactivating claim");
        let max_vacate = secs(self.max_vacate(ctx));
        let (tx, rx) = oneshot::channel();
        self.current.set_pending(PendingCommand::Deactivate(Some(tx)));
        self.current.deactivate(ctx, graceful, max_vacate);
        self.dirty = true;
        Ok(Some(rx))
    }

    /// ALIVE from the client: renew the lease.
    pub fn alive(&mut self, ctx: &Context, token: &str) -> Result<()> {
        if self.current.id().matches(token)
            && matches!(self.state(), State::Claimed | State::Preempting)
        {
            self.current.alive(ctx, true);
            return Ok(());
        }
        if let Some(claim) = self.cod.find_mut(token) {
            claim.alive(ctx, true);
            return Ok(());
        }
        Err(StartdError::refused("ALIVE", RefuseReason::UnknownClaim))
    }

    fn running_claim(&self, command: &'static str, token: &str) -> Result<()> {
        if !self.current.id().matches(token) {
            return Err(StartdError::refused(command, RefuseReason::UnknownClaim));
        }
        if self.state() != State::Claimed || !self.current.is_active() {
            return Err(StartdError::refused(command, RefuseReason::WrongState));
        }
        Ok(())
    }

    /// PCKPT_FRGN_JOB: checkpoint the running job.
    pub fn pckpt(&mut self, ctx: &Context, token: &str) -> Result<()> {
        self.running_claim("PCKPT_FRGN_JOB", token)?;
        if !self.current.periodic_checkpoint(ctx) {
            return Err(StartdError::Starter("checkpoint request not delivered".into()));
        }
        self.dirty = true;
        Ok(())
    }

    /// REQ_NEW_PROC: ask the starter to accept another process.
    pub fn req_new_proc(&mut self, ctx: &Context, token: &str) -> Result<()> {
        self.running_claim("REQ_NEW_PROC", token)?;
        if !self.current.request_new_proc(ctx) {
            return Err(StartdError::Starter("new process request not delivered".into()));
        }
        Ok(())
    }

    // -- claim-scoped timers ---------------------------------------------

    /// No activation arrived within the match timeout.
    pub fn match_timed_out(&mut self, ctx: &Context, claim: &ClaimId, fired: TimerId) {
        if self.current.id() == claim {
            if !self.current.take_match_timer(fired) {
                tracing::debug!(slot = %self.name, timer = %fired, "Stale match timer");
                return;
            }
            if self.state() == State::Matched {
                tracing::warn!(slot = %self.name, claim = %claim, "Match timed out, discarding claim");
                self.change_state(ctx, State::Owner);
            }
            return;
        }
        let Some(pre) = self.preempting.as_mut().filter(|pre| pre.id() == claim) else {
            tracing::debug!(slot = %self.name, claim = %claim, "Match timer for unknown claim");
            return;
        };
        if !pre.take_match_timer(fired) || pre.has_request() {
            return;
        }
        tracing::warn!(slot = %self.name, claim = %claim, "Preempting match timed out, regenerating preempting claim");
        self.preempting = Some(Claim::new(ctx, self.id, ClaimType::Opportunistic));
        self.dirty = true;
    }

    /// The client stopped renewing: give the claim up without telling it.
    pub fn lease_expired(&mut self, ctx: &Context, claim: &ClaimId, fired: TimerId) {
        if self.current.id() == claim {
            if !self.current.is_current_lease(fired) {
                tracing::debug!(slot = %self.name, timer = %fired, "Stale lease timer");
                return;
            }
            tracing::warn!(slot = %self.name, claim = %claim, state = %self.state(), "Claim lease expired");
            self.current.cancel_lease();
            self.finish_kill_claim(ctx);
            self.dirty = true;
            return;
        }
        let current_cod_lease = self
            .cod
            .iter()
            .any(|c| c.id() == claim && c.is_current_lease(fired));
        if current_cod_lease {
            self.cod_lease_expired(ctx, claim);
            return;
        }
        tracing::debug!(slot = %self.name, claim = %claim, "Stale lease timer");
    }

    pub fn send_alive_timer(&mut self, ctx: &Context, claim: &ClaimId, fired: TimerId) {
        if self.current.id() == claim && self.current.is_current_send_alive(fired) {
            self.current.send_alive(ctx);
            return;
        }
        if let Some(cod) = self.cod.find_by_id_mut(claim) {
            if cod.is_current_send_alive(fired) {
                cod.send_alive(ctx);
            }
        }
    }

    /// Answer to an ALIVE this daemon pushed.
    pub fn alive_reply(&mut self, ctx: &Context, claim: &ClaimId, outcome: &AliveOutcome) {
        if self.current.id() == claim {
            if !self.current.alive_reply(ctx, outcome) {
                self.finish_kill_claim(ctx);
                self.dirty = true;
            }
            return;
        }
        let recognised = match self.cod.find_by_id_mut(claim) {
            Some(cod) => cod.alive_reply(ctx, outcome),
            None => return,
        };
        if !recognised {
            self.cod_lease_expired(ctx, claim);
        }
    }

    pub fn kill_timeout(&mut self, ctx: &Context, claim: &ClaimId, fired: TimerId) {
        if self.current.id() == claim {
            self.current.kill_timeout(ctx, fired);
            self.dirty = true;
            return;
        }
        self.cod_kill_timeout(ctx, claim, fired);
    }
}

fn prepare_request(
    ctx: &Context,
    claim: &mut Claim,
    request: Attributes,
    responder: oneshot::Sender<GrantResult>,
    rank: f64,
    client: ClientInfo,
    alive_interval: Option<Duration>,
) {
    claim.set_request(request, Some(responder));
    claim.set_rank(rank);
    *claim.client_mut() = client;
    match alive_interval {
        Some(interval) => {
            claim.set_alive_interval(interval, ctx.config.timing.max_claim_alives_missed)
        }
        None => claim.set_lease_duration(ctx.config.timing.default_lease_duration()),
    }
    claim.configure_lease(ctx.config.claims.startd_sends_alives);
    claim.cancel_match_timer();
}
