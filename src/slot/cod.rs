//! On-demand claims layered over a slot's opportunistic claim.
//!
//! Activating one suspends whatever the opportunistic claim is running;
//! the job is resumed once no on-demand claim is active any more.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::claim::{Claim, ClaimId, ClaimState, ClientInfo, PendingCommand};
use crate::context::Context;
use crate::error::{RefuseReason, Result, StartdError};
use crate::policy::Attributes;
use crate::slot::{Activity, Slot, SlotId, SlotType, State};
use crate::starter::{StarterExit, StarterId};
use crate::timer::TimerId;

#[derive(Debug, Default)]
pub struct CodClaims {
    claims: Vec<Claim>,
    next: u32,
}

impl CodClaims {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter()
    }

    /// Create a claim named `COD<n>` and start its lease.
    pub fn request(
        &mut self,
        ctx: &Context,
        slot: SlotId,
        request: Attributes,
        client: ClientInfo,
        lease: Option<Duration>,
    ) -> &Claim {
        self.next += 1;
        let mut claim = Claim::new_cod(ctx, slot, format!("COD{}", self.next));
        *claim.client_mut() = client;
        claim.set_request(request, None);
        claim.load_accounting_info();
        if let Some(lease) = lease {
            claim.set_lease_duration(lease);
        }
        claim.begin_claim(ctx);
        self.claims.push(claim);
        &self.claims[self.claims.len() - 1]
    }

    pub fn find(&self, token: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.id().matches(token))
    }

    pub fn find_mut(&mut self, token: &str) -> Option<&mut Claim> {
        self.claims.iter_mut().find(|c| c.id().matches(token))
    }

    pub fn find_by_id_mut(&mut self, id: &ClaimId) -> Option<&mut Claim> {
        self.claims.iter_mut().find(|c| c.id() == id)
    }

    pub fn find_by_starter(&self, starter: StarterId) -> Option<&Claim> {
        self.claims.iter().find(|c| c.starter() == Some(starter))
    }

    fn find_by_starter_mut(&mut self, starter: StarterId) -> Option<&mut Claim> {
        self.claims.iter_mut().find(|c| c.starter() == Some(starter))
    }

    pub fn remove(&mut self, id: &ClaimId) -> Option<Claim> {
        let pos = self.claims.iter().position(|c| c.id() == id)?;
        Some(self.claims.remove(pos))
    }

    pub fn has_active(&self) -> bool {
        self.claims.iter().any(Claim::is_active)
    }

    pub fn publish(&self, record: &mut Attributes) {
        record.insert("NumCODClaims".into(), Value::from(self.claims.len()));
        for claim in &self.claims {
            let Some(name) = claim.cod_name() else {
                continue;
            };
            record.insert(
                format!("{}_ClaimState", name),
                Value::from(claim.state().to_string()),
            );
            if let Some(keyword) = claim.cod_keyword() {
                record.insert(format!("{}_JobKeyword", name), Value::from(keyword));
            }
            if let Some(user) = claim.client().and_then(|c| c.user.clone()) {
                record.insert(format!("{}_RemoteUser", name), Value::from(user));
            }
        }
    }
}

fn unknown(command: &'static str) -> StartdError {
    StartdError::refused(command, RefuseReason::UnknownClaim)
}

impl Slot {
    /// Hand out a new on-demand claim on this slot.
    pub fn cod_request(
        &mut self,
        ctx: &Context,
        request: Attributes,
        client: ClientInfo,
    ) -> Result<ClaimId> {
        if self.shutting_down {
            return Err(StartdError::refused("CA_REQUEST_CLAIM", RefuseReason::ShuttingDown));
        }
        if self.kind == SlotType::Partitionable {
            return Err(StartdError::refused("CA_REQUEST_CLAIM", RefuseReason::WrongState));
        }
        let lease = request
            .get("ClaimLeaseDuration")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        let id = self.id;
        let claim = self.cod.request(ctx, id, request, client, lease);
        tracing::info!(slot = %self.name, claim = %claim.id(), name = ?claim.cod_name(), "On-demand claim created");
        let token = claim.id().clone();
        self.dirty = true;
        Ok(token)
    }

    /// Run a job under an on-demand claim, suspending the opportunistic job.
    pub fn cod_activate(&mut self, ctx: &Context, token: &str, job: Attributes) -> Result<ClaimState> {
        let claim = self.cod.find(token).ok_or_else(|| unknown("ACTIVATE_CLAIM"))?;
        if claim.is_active() {
            return Err(StartdError::refused("ACTIVATE_CLAIM", RefuseReason::WrongState));
        }
        if !ctx.starter.can_run(&job) {
            return Err(StartdError::refused("ACTIVATE_CLAIM", RefuseReason::NoStarter));
        }

        self.suspend_for_cod(ctx);

        let keyword = job
            .get("JobKeyword")
            .and_then(Value::as_str)
            .map(str::to_string);
        let ad = &self.ad;
        let Some(claim) = self.cod.find_mut(token) else {
            return Err(unknown("ACTIVATE_CLAIM"));
        };
        let spawned = claim.spawn_starter(ctx, Some(job), ad);
        if spawned {
            if let Some(keyword) = keyword {
                claim.set_cod_keyword(keyword);
            }
        }
        let state = claim.state();
        if !spawned {
            self.resume_for_cod(ctx);
            return Err(StartdError::refused("ACTIVATE_CLAIM", RefuseReason::NoStarter));
        }
        self.dirty = true;
        Ok(state)
    }

    /// Stop the on-demand job but keep the claim. The receiver resolves
    /// once the starter is gone.
    pub fn cod_deactivate(
        &mut self,
        ctx: &Context,
        token: &str,
        graceful: bool,
    ) -> Result<oneshot::Receiver<ClaimState>> {
        let claim = self.cod.find_mut(token).ok_or_else(|| unknown("DEACTIVATE_CLAIM"))?;
        let (tx, rx) = oneshot::channel();
        if !claim.is_active() {
            let _ = tx.send(claim.state());
            return Ok(rx);
        }
        let max_vacate = claim.pledged_max_vacate();
        claim.set_pending(PendingCommand::Deactivate(Some(tx)));
        claim.deactivate(ctx, graceful, max_vacate);
        self.dirty = true;
        Ok(rx)
    }

    /// Give an on-demand claim back. The receiver resolves once the claim
    /// is gone.
    pub fn cod_release(
        &mut self,
        ctx: &Context,
        token: &str,
        graceful: bool,
    ) -> Result<oneshot::Receiver<ClaimState>> {
        let claim = self.cod.find_mut(token).ok_or_else(|| unknown("RELEASE_CLAIM"))?;
        let (tx, rx) = oneshot::channel();
        let max_vacate = claim.pledged_max_vacate();
        if claim.remove(ctx, graceful, max_vacate) {
            let id = claim.id().clone();
            self.cod.remove(&id);
            let _ = tx.send(ClaimState::Unclaimed);
            tracing::info!(slot = %self.name, claim = %id, "On-demand claim released");
            self.resume_for_cod(ctx);
        } else {
            claim.set_pending(PendingCommand::Release(Some(tx)));
        }
        self.dirty = true;
        Ok(rx)
    }

    pub(crate) fn cod_starter_exited(&mut self, ctx: &Context, starter: StarterId, exit: StarterExit) {
        let Some(claim) = self.cod.find_by_starter_mut(starter) else {
            return;
        };
        tracing::info!(slot = %self.name, claim = %claim.id(), exit = ?exit, "On-demand starter exited");
        claim.starter_exited(ctx, exit);

        let id = claim.id().clone();
        let pending = claim.take_pending();
        let removing = claim.wants_remove() || matches!(pending, Some(PendingCommand::Release(_)));
        match pending {
            Some(PendingCommand::Release(Some(reply))) => {
                let _ = reply.send(ClaimState::Unclaimed);
            }
            Some(PendingCommand::Deactivate(Some(reply))) => {
                let _ = reply.send(ClaimState::Idle);
            }
            _ => {}
        }
        if removing {
            self.cod.remove(&id);
        }
        self.resume_for_cod(ctx);
        self.dirty = true;
    }

    /// The on-demand client stopped renewing its lease.
    pub(crate) fn cod_lease_expired(&mut self, ctx: &Context, id: &ClaimId) {
        let Some(claim) = self.cod.find_by_id_mut(id) else {
            return;
        };
        tracing::warn!(slot = %self.name, claim = %id, "On-demand claim lease expired");
        claim.drop_client();
        if claim.remove(ctx, false, Duration::ZERO) {
            self.cod.remove(id);
            self.resume_for_cod(ctx);
        }
        self.dirty = true;
    }

    pub(crate) fn cod_kill_timeout(&mut self, ctx: &Context, id: &ClaimId, fired: TimerId) {
        if let Some(claim) = self.cod.find_by_id_mut(id) {
            claim.kill_timeout(ctx, fired);
        }
    }

    pub(crate) fn cod_shutdown(&mut self, ctx: &Context, graceful: bool) {
        let mut gone = Vec::new();
        for claim in self.cod.claims.iter_mut() {
            let max_vacate = claim.pledged_max_vacate();
            if claim.remove(ctx, graceful, max_vacate) {
                gone.push(claim.id().clone());
            }
        }
        for id in gone {
            self.cod.remove(&id);
        }
        if !self.cod.has_active() {
            self.resume_for_cod(ctx);
        }
    }

    /// Suspend the opportunistic job while an on-demand job runs.
    fn suspend_for_cod(&mut self, ctx: &Context) {
        if self.suspended_for_cod {
            return;
        }
        self.suspended_for_cod = true;
        if self.state() == State::Claimed
            && self.current.is_running()
            && self.activity() != Activity::Suspended
        {
            tracing::info!(slot = %self.name, "Suspending opportunistic job for on-demand claim");
            self.change(ctx, State::Claimed, Activity::Suspended);
        }
    }

    /// Resume the opportunistic job once no on-demand job is active.
    fn resume_for_cod(&mut self, ctx: &Context) {
        if !self.suspended_for_cod || self.cod.has_active() {
            return;
        }
        self.suspended_for_cod = false;
        if self.state() == State::Claimed && self.activity() == Activity::Suspended {
            tracing::info!(slot = %self.name, "Resuming opportunistic job after on-demand claims finished");
            self.change(ctx, State::Claimed, Activity::Busy);
        }
    }
}
