use thiserror::Error;

/// Why a command was refused. Carried back to the requester in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RefuseReason {
    UnknownClaim,
    WrongState,
    ShuttingDown,
    RankTooLow,
    RequirementsFailed,
    NoStarter,
    TryAgain,
    Draining,
    AlreadyDraining,
    CheckFailed,
    NoSuchDrainRequest,
    InsufficientResources,
}

impl std::fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefuseReason::UnknownClaim => write!(f, "unknown claim"),
            RefuseReason::WrongState => write!(f, "wrong state"),
            RefuseReason::ShuttingDown => write!(f, "shutting down"),
            RefuseReason::RankTooLow => write!(f, "rank too low"),
            RefuseReason::RequirementsFailed => write!(f, "requirements failed"),
            RefuseReason::NoStarter => write!(f, "no starter"),
            RefuseReason::TryAgain => write!(f, "try again"),
            RefuseReason::Draining => write!(f, "draining"),
            RefuseReason::AlreadyDraining => write!(f, "draining already in progress"),
            RefuseReason::CheckFailed => write!(f, "draining check failed"),
            RefuseReason::NoSuchDrainRequest => write!(f, "no matching draining request"),
            RefuseReason::InsufficientResources => write!(f, "insufficient resources"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StartdError {
    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    #[error("Claim not found: {0}")]
    ClaimNotFound(String),

    #[error("{command} refused: {reason}")]
    Refused {
        command: &'static str,
        reason: RefuseReason,
    },

    #[error("Internal consistency violation: {0}")]
    InvalidState(String),

    #[error("Starter error: {0}")]
    Starter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy expression error: {0}")]
    Policy(String),

    #[error("Daemon is not running")]
    DaemonStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StartdError {
    pub fn refused(command: &'static str, reason: RefuseReason) -> Self {
        StartdError::Refused { command, reason }
    }

    /// The refusal reason, if this error is a protocol refusal.
    pub fn refuse_reason(&self) -> Option<RefuseReason> {
        match self {
            StartdError::Refused { reason, .. } => Some(*reason),
            StartdError::ClaimNotFound(_) => Some(RefuseReason::UnknownClaim),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StartdError>;

/// Aborts the daemon on an internal-consistency violation.
///
/// Guessing a recovery here risks granting the same slot twice, so the
/// process is taken down loudly instead.
#[track_caller]
pub fn fatal(msg: impl Into<String>) -> ! {
    let msg = msg.into();
    tracing::error!(error = %msg, "Internal consistency violation, aborting");
    panic!("{}", StartdError::InvalidState(msg));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_error_message_names_command_and_reason() {
        let err = StartdError::refused("ACTIVATE_CLAIM", RefuseReason::TryAgain);
        assert_eq!(err.to_string(), "ACTIVATE_CLAIM refused: try again");
        assert_eq!(err.refuse_reason(), Some(RefuseReason::TryAgain));
    }

    #[test]
    fn unknown_claim_maps_to_refusal() {
        let err = StartdError::ClaimNotFound("<1.2.3.4:9618>#1#2#...".to_string());
        assert_eq!(err.refuse_reason(), Some(RefuseReason::UnknownClaim));
        assert!(StartdError::Config("x".into()).refuse_reason().is_none());
    }

    #[test]
    #[should_panic(expected = "Internal consistency violation")]
    fn fatal_panics() {
        fatal("claimed slot without a claim");
    }
}
