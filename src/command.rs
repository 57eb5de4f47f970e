//! The daemon's command surface, independent of any wire framing.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::claim::{ClaimGrant, ClaimId, ClaimState, ClientInfo, GrantResult};
use crate::error::{RefuseReason, StartdError};
use crate::manager::{DrainRequest, SlotSetManager};
use crate::policy::Attributes;
use crate::slot::{SlotRecord, State};

/// One inbound command. Claim-scoped commands carry the token as presented.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartdCommand {
    RequestClaim {
        claim_id: String,
        request: Attributes,
        #[serde(default)]
        client: ClientInfo,
        /// The client sends ALIVEs at this interval
        alive_interval_secs: Option<u64>,
    },
    ActivateClaim {
        claim_id: String,
        job: Attributes,
    },
    ReleaseClaim {
        claim_id: String,
    },
    DeactivateClaim {
        claim_id: String,
    },
    DeactivateClaimForcibly {
        claim_id: String,
    },
    Alive {
        claim_id: String,
    },
    MatchInfo {
        claim_id: String,
    },
    PckptFrgnJob {
        claim_id: String,
    },
    ReqNewProc {
        claim_id: String,
    },
    VacateAllClaims,
    VacateAllFast,
    DrainJobs(DrainRequest),
    CancelDrainJobs {
        request_id: Option<u64>,
    },
    CaRequestClaim {
        slot: Option<String>,
        request: Attributes,
        #[serde(default)]
        client: ClientInfo,
    },
    ActivateCod {
        claim_id: String,
        job: Attributes,
    },
    ReleaseCod {
        claim_id: String,
    },
    /// Work the daemon fetched on its own behalf
    FetchWork {
        slot: Option<String>,
        job: Attributes,
    },
    QuerySlots,
    Shutdown {
        graceful: bool,
    },
}

impl StartdCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StartdCommand::RequestClaim { .. } => "REQUEST_CLAIM",
            StartdCommand::ActivateClaim { .. } => "ACTIVATE_CLAIM",
            StartdCommand::ReleaseClaim { .. } => "RELEASE_CLAIM",
            StartdCommand::DeactivateClaim { .. } => "DEACTIVATE_CLAIM",
            StartdCommand::DeactivateClaimForcibly { .. } => "DEACTIVATE_CLAIM_FORCIBLY",
            StartdCommand::Alive { .. } => "ALIVE",
            StartdCommand::MatchInfo { .. } => "MATCH_INFO",
            StartdCommand::PckptFrgnJob { .. } => "PCKPT_FRGN_JOB",
            StartdCommand::ReqNewProc { .. } => "REQ_NEW_PROC",
            StartdCommand::VacateAllClaims => "VACATE_ALL_CLAIMS",
            StartdCommand::VacateAllFast => "VACATE_ALL_FAST",
            StartdCommand::DrainJobs(_) => "DRAIN_JOBS",
            StartdCommand::CancelDrainJobs { .. } => "CANCEL_DRAIN_JOBS",
            StartdCommand::CaRequestClaim { .. } => "CA_REQUEST_CLAIM",
            StartdCommand::ActivateCod { .. } => "ACTIVATE_COD",
            StartdCommand::ReleaseCod { .. } => "RELEASE_COD",
            StartdCommand::FetchWork { .. } => "FETCH_WORK",
            StartdCommand::QuerySlots => "QUERY_SLOTS",
            StartdCommand::Shutdown { .. } => "SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandReply {
    Ok,
    Granted(ClaimGrant),
    Refused { reason: RefuseReason },
    Error { message: String },
    /// Claim state once a release or deactivation finished
    Finished { state: ClaimState },
    CodClaim { slot: String, claim_id: ClaimId },
    Fetched { slot: String, claim_id: ClaimId },
    DrainStarted { request_id: u64 },
    Slots { state: State, records: Vec<SlotRecord> },
}

impl CommandReply {
    pub fn is_ok(&self) -> bool {
        !matches!(self, CommandReply::Refused { .. } | CommandReply::Error { .. })
    }

    pub fn refuse_reason(&self) -> Option<RefuseReason> {
        match self {
            CommandReply::Refused { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl From<StartdError> for CommandReply {
    fn from(e: StartdError) -> Self {
        match e.refuse_reason() {
            Some(reason) => CommandReply::Refused { reason },
            None => CommandReply::Error {
                message: e.to_string(),
            },
        }
    }
}

pub type DeferredReply = Pin<Box<dyn Future<Output = CommandReply> + Send>>;

/// What dispatching a command produced.
pub enum Dispatch {
    Reply(CommandReply),
    /// The reply waits for the slot to get somewhere (a grant after a
    /// preemption, a release after the starter exits)
    Deferred(DeferredReply),
    /// The daemon should start shutting down
    Shutdown { graceful: bool },
}

impl From<CommandReply> for Dispatch {
    fn from(reply: CommandReply) -> Self {
        Dispatch::Reply(reply)
    }
}

fn done<T>(result: crate::error::Result<T>) -> Dispatch {
    match result {
        Ok(_) => CommandReply::Ok.into(),
        Err(e) => CommandReply::from(e).into(),
    }
}

fn await_grant(rx: oneshot::Receiver<GrantResult>) -> Dispatch {
    Dispatch::Deferred(Box::pin(async move {
        match rx.await {
            Ok(Ok(grant)) => CommandReply::Granted(grant),
            Ok(Err(reason)) => CommandReply::Refused { reason },
            // The claim was replaced before the request could be answered
            Err(_) => CommandReply::Refused {
                reason: RefuseReason::WrongState,
            },
        }
    }))
}

fn await_finish(result: crate::error::Result<Option<oneshot::Receiver<ClaimState>>>) -> Dispatch {
    match result {
        Ok(None) => CommandReply::Ok.into(),
        Ok(Some(rx)) => Dispatch::Deferred(Box::pin(async move {
            match rx.await {
                Ok(state) => CommandReply::Finished { state },
                Err(_) => CommandReply::Finished {
                    state: ClaimState::Unclaimed,
                },
            }
        })),
        Err(e) => CommandReply::from(e).into(),
    }
}

/// Apply one command to the slot set.
pub fn dispatch(manager: &mut SlotSetManager, command: StartdCommand) -> Dispatch {
    tracing::debug!(command = command.name(), "Dispatching command");
    match command {
        StartdCommand::RequestClaim {
            claim_id,
            request,
            client,
            alive_interval_secs,
        } => {
            let alive = alive_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs);
            match manager.request_claim(&claim_id, request, client, alive) {
                Ok(rx) => await_grant(rx),
                Err(e) => CommandReply::from(e).into(),
            }
        }
        StartdCommand::ActivateClaim { claim_id, job }
        | StartdCommand::ActivateCod { claim_id, job } => {
            done(manager.activate_claim(&claim_id, job))
        }
        StartdCommand::ReleaseClaim { claim_id } | StartdCommand::ReleaseCod { claim_id } => {
            await_finish(manager.release(&claim_id))
        }
        StartdCommand::DeactivateClaim { claim_id } => {
            await_finish(manager.deactivate(&claim_id, true))
        }
        StartdCommand::DeactivateClaimForcibly { claim_id } => {
            await_finish(manager.deactivate(&claim_id, false))
        }
        StartdCommand::Alive { claim_id } => done(manager.alive(&claim_id)),
        StartdCommand::MatchInfo { claim_id } => done(manager.match_info(&claim_id)),
        StartdCommand::PckptFrgnJob { claim_id } => done(manager.pckpt(&claim_id)),
        StartdCommand::ReqNewProc { claim_id } => done(manager.req_new_proc(&claim_id)),
        StartdCommand::VacateAllClaims => {
            manager.vacate_all(false);
            CommandReply::Ok.into()
        }
        StartdCommand::VacateAllFast => {
            manager.vacate_all(true);
            CommandReply::Ok.into()
        }
        StartdCommand::DrainJobs(request) => match manager.start_draining(request) {
            Ok(request_id) => CommandReply::DrainStarted { request_id }.into(),
            Err(e) => CommandReply::from(e).into(),
        },
        StartdCommand::CancelDrainJobs { request_id } => {
            done(manager.cancel_draining(request_id))
        }
        StartdCommand::CaRequestClaim {
            slot,
            request,
            client,
        } => match manager.cod_request(slot.as_deref(), request, client) {
            Ok((slot, claim_id)) => CommandReply::CodClaim { slot, claim_id }.into(),
            Err(e) => CommandReply::from(e).into(),
        },
        StartdCommand::FetchWork { slot, job } => match manager.fetch_work(slot.as_deref(), job) {
            Ok((slot, claim_id)) => CommandReply::Fetched { slot, claim_id }.into(),
            Err(e) => CommandReply::from(e).into(),
        },
        StartdCommand::QuerySlots => CommandReply::Slots {
            state: manager.state(),
            records: manager.records(),
        }
        .into(),
        StartdCommand::Shutdown { graceful } => Dispatch::Shutdown { graceful },
    }
}
