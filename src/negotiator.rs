//! Scheduling-side peer: picks slots out of the collector, claims them and
//! keeps the leases alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::claim::{ClaimId, ClientInfo};
use crate::client::PeerMessage;
use crate::collector::Collector;
use crate::command::{CommandReply, StartdCommand};
use crate::daemon::DaemonHandle;
use crate::error::{RefuseReason, Result, StartdError};
use crate::policy::{Attributes, EvalContext, PolicyEvaluator, PolicyExpr};
use crate::slot::{SlotRecord, State};

/// A lease longer than this is cut down to it.
pub const DEFAULT_MAX_LEASE: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Address the daemon pushes ALIVEs and vacate notices to
    pub addr: String,
    pub user: String,
    pub alive_interval: Duration,
    pub max_lease: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            addr: "negotiator:9618".to_string(),
            user: "nobody@localhost".to_string(),
            alive_interval: Duration::from_secs(300),
            max_lease: DEFAULT_MAX_LEASE,
        }
    }
}

/// A claim this client holds.
#[derive(Debug, Clone)]
pub struct LeasedClaim {
    pub claim_id: ClaimId,
    pub slot: String,
    pub lease_duration: Duration,
    pub granted_at: Instant,
    pub renewed_at: Instant,
}

impl LeasedClaim {
    pub fn expires_at(&self) -> Instant {
        self.renewed_at + self.lease_duration
    }
}

/// Requested > 0 and below the maximum wins; anything else gets the maximum.
pub fn clamp_lease(requested: Duration, max: Duration) -> Duration {
    if requested > Duration::ZERO && requested < max {
        requested
    } else {
        max
    }
}

fn refusal(command: &'static str, reply: CommandReply) -> StartdError {
    match reply {
        CommandReply::Refused { reason } => StartdError::refused(command, reason),
        CommandReply::Error { message } => StartdError::InvalidState(message),
        other => StartdError::InvalidState(format!("unexpected reply to {}: {:?}", command, other)),
    }
}

pub struct NegotiationClient {
    config: NegotiatorConfig,
    daemon: DaemonHandle,
    collector: Arc<dyn Collector>,
    policy: Arc<dyn PolicyEvaluator>,
    leases: Arc<RwLock<HashMap<ClaimId, LeasedClaim>>>,
}

impl NegotiationClient {
    pub fn new(
        config: NegotiatorConfig,
        daemon: DaemonHandle,
        collector: Arc<dyn Collector>,
        policy: Arc<dyn PolicyEvaluator>,
    ) -> Self {
        Self {
            config,
            daemon,
            collector,
            policy,
            leases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Slot records currently in the collector.
    pub fn offers(&self) -> Vec<SlotRecord> {
        self.collector.records()
    }

    /// Best slot for `job`: the offer with the highest job Rank among those
    /// whose advertised Requirements accept the job and whose own
    /// Requirements the job accepts. A Claimed slot is only an offer when
    /// it would rank the job above its current claim.
    pub fn select_offer(&self, job: &Attributes) -> Option<SlotRecord> {
        let mut best: Option<(f64, SlotRecord)> = None;
        for offer in self.offers() {
            if !self.matches(&offer, job) {
                continue;
            }
            let rank = self.job_rank(&offer, job);
            if best.as_ref().map(|(r, _)| rank > *r).unwrap_or(true) {
                best = Some((rank, offer));
            }
        }
        best.map(|(_, offer)| offer)
    }

    fn matches(&self, offer: &SlotRecord, job: &Attributes) -> bool {
        if offer.claim_id().is_none() {
            return false;
        }
        let eval = EvalContext::new(&offer.public, Some(job));
        match offer.state() {
            Some(State::Unclaimed | State::Owner | State::Backfill) => {}
            Some(State::Claimed) => {
                let current = offer.number("CurrentRank").unwrap_or(0.0);
                let offered = self
                    .policy
                    .eval_number(PolicyExpr::Rank, &eval)
                    .unwrap_or(0.0);
                if offered <= current {
                    return false;
                }
            }
            _ => return false,
        }

        let advertised = offer
            .public
            .get("Requirements")
            .and_then(Value::as_str)
            .unwrap_or("false");
        if !self.policy.eval_source(advertised, &eval).as_tristate().is_true() {
            return false;
        }
        match job.get("Requirements").and_then(Value::as_str) {
            Some(source) => self
                .policy
                .eval_source(source, &EvalContext::new(job, Some(&offer.public)))
                .as_tristate()
                .is_true(),
            None => true,
        }
    }

    fn job_rank(&self, offer: &SlotRecord, job: &Attributes) -> f64 {
        match job.get("Rank") {
            Some(Value::String(source)) => self
                .policy
                .eval_source(source, &EvalContext::new(job, Some(&offer.public)))
                .as_number()
                .unwrap_or(0.0),
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// MATCH_INFO then REQUEST_CLAIM against `offer`.
    pub async fn claim(&self, offer: &SlotRecord, job: &Attributes) -> Result<LeasedClaim> {
        let token = offer
            .claim_id()
            .ok_or_else(|| StartdError::ClaimNotFound(offer.name.clone()))?
            .to_string();

        let matched = self
            .daemon
            .send(StartdCommand::MatchInfo {
                claim_id: token.clone(),
            })
            .await?;
        if !matched.is_ok() {
            return Err(refusal("MATCH_INFO", matched));
        }

        let client = ClientInfo {
            user: Some(self.config.user.clone()),
            addr: Some(self.config.addr.clone()),
            ..ClientInfo::default()
        };
        let reply = self
            .daemon
            .send(StartdCommand::RequestClaim {
                claim_id: token,
                request: job.clone(),
                client,
                alive_interval_secs: Some(self.config.alive_interval.as_secs()),
            })
            .await?;
        let CommandReply::Granted(grant) = reply else {
            return Err(refusal("REQUEST_CLAIM", reply));
        };

        let now = Instant::now();
        let leased = LeasedClaim {
            claim_id: grant.claim_id,
            slot: grant.slot,
            lease_duration: clamp_lease(
                Duration::from_secs(grant.lease_duration_secs),
                self.config.max_lease,
            ),
            granted_at: now,
            renewed_at: now,
        };
        tracing::info!(slot = %leased.slot, claim = %leased.claim_id, lease_secs = leased.lease_duration.as_secs(), "Claim granted");
        self.leases
            .write()
            .await
            .insert(leased.claim_id.clone(), leased.clone());
        Ok(leased)
    }

    pub async fn activate(&self, claim: &LeasedClaim, job: Attributes) -> Result<()> {
        let reply = self
            .daemon
            .send(StartdCommand::ActivateClaim {
                claim_id: claim.claim_id.secret().to_string(),
                job,
            })
            .await?;
        if !reply.is_ok() {
            return Err(refusal("ACTIVATE_CLAIM", reply));
        }
        tracing::info!(slot = %claim.slot, claim = %claim.claim_id, "Claim activated");
        Ok(())
    }

    /// Select, claim and activate in one go.
    pub async fn run_job(&self, job: Attributes) -> Result<LeasedClaim> {
        let offer = self
            .select_offer(&job)
            .ok_or_else(|| StartdError::refused("REQUEST_CLAIM", RefuseReason::RequirementsFailed))?;
        let claim = self.claim(&offer, &job).await?;
        self.activate(&claim, job).await?;
        Ok(claim)
    }

    /// Send ALIVE for every held claim. Claims the daemon no longer knows
    /// are dropped. Returns how many were renewed.
    pub async fn renew_all(&self) -> usize {
        let held: Vec<ClaimId> = self.leases.read().await.keys().cloned().collect();
        let mut renewed = 0;
        for claim in held {
            let reply = self
                .daemon
                .send(StartdCommand::Alive {
                    claim_id: claim.secret().to_string(),
                })
                .await;
            match reply {
                Ok(reply) if reply.is_ok() => {
                    if let Some(lease) = self.leases.write().await.get_mut(&claim) {
                        lease.renewed_at = Instant::now();
                    }
                    renewed += 1;
                }
                Ok(reply) => {
                    tracing::warn!(claim = %claim, reply = ?reply, "Claim no longer accepted, dropping lease");
                    self.leases.write().await.remove(&claim);
                }
                Err(e) => {
                    tracing::warn!(claim = %claim, error = %e, "Failed to renew claim");
                }
            }
        }
        renewed
    }

    pub async fn release(&self, claim: &LeasedClaim) -> Result<CommandReply> {
        self.leases.write().await.remove(&claim.claim_id);
        let reply = self
            .daemon
            .send(StartdCommand::ReleaseClaim {
                claim_id: claim.claim_id.secret().to_string(),
            })
            .await?;
        if !reply.is_ok() {
            return Err(refusal("RELEASE_CLAIM", reply));
        }
        Ok(reply)
    }

    /// Forget leases that were not renewed in time.
    pub async fn expire_leases(&self, now: Instant) -> Vec<LeasedClaim> {
        let mut leases = self.leases.write().await;
        let expired: Vec<ClaimId> = leases
            .values()
            .filter(|lease| lease.expires_at() <= now)
            .map(|lease| lease.claim_id.clone())
            .collect();
        let mut gone = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(lease) = leases.remove(&id) {
                tracing::info!(slot = %lease.slot, claim = %lease.claim_id, "Lease expired");
                gone.push(lease);
            }
        }
        gone
    }

    pub async fn leases(&self) -> Vec<LeasedClaim> {
        self.leases.read().await.values().cloned().collect()
    }

    /// Answer daemon-pushed ALIVEs and vacate notices until the inbox closes.
    pub fn serve_inbox(&self, mut inbox: mpsc::Receiver<PeerMessage>) -> JoinHandle<()> {
        let leases = self.leases.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                match msg {
                    PeerMessage::Alive { claim, reply } => {
                        let known = leases.read().await.contains_key(&claim);
                        let _ = reply.send(known);
                    }
                    PeerMessage::Vacate { claim } => {
                        if leases.write().await.remove(&claim).is_some() {
                            tracing::info!(claim = %claim, "Claim vacated by the daemon");
                        }
                    }
                }
            }
        })
    }

    /// Renew every `alive_interval` and expire stale leases until cancelled.
    pub fn spawn_renewals(
        self: &Arc<Self>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.config.alive_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        client.renew_all().await;
                        client.expire_leases(Instant::now()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
