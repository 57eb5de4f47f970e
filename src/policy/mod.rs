//! Policy evaluation seam.
//!
//! The slot state machine never evaluates expressions itself. It asks a
//! [`PolicyEvaluator`] for the truth value of a named policy expression
//! against the slot record and, when one is present, the job record.

pub mod expr;
pub mod reqexp;

use serde_json::{Map, Value};

pub use expr::{EvalValue, Expr, ExprPolicy};
pub use reqexp::{RequirementsPolicy, Verdict};

/// An attribute/value record (slot record or job record).
pub type Attributes = Map<String, Value>;

/// Three-valued truth, as produced by expression evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Undefined,
}

impl TriState {
    pub fn is_true(self) -> bool {
        self == TriState::True
    }

    pub fn is_false(self) -> bool {
        self == TriState::False
    }

    pub fn is_undefined(self) -> bool {
        self == TriState::Undefined
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

impl std::fmt::Display for TriState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriState::True => write!(f, "true"),
            TriState::False => write!(f, "false"),
            TriState::Undefined => write!(f, "undefined"),
        }
    }
}

/// The named policy expressions a slot consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyExpr {
    Start,
    IsOwner,
    Preempt,
    Suspend,
    Continue,
    Kill,
    WantSuspend,
    WantVacate,
    WantHold,
    Rank,
    StartBackfill,
    EvictBackfill,
    PeriodicCheckpoint,
    MaxJobRetirementTime,
    MachineMaxVacateTime,
    DrainingStart,
}

impl PolicyExpr {
    pub const ALL: [PolicyExpr; 16] = [
        PolicyExpr::Start,
        PolicyExpr::IsOwner,
        PolicyExpr::Preempt,
        PolicyExpr::Suspend,
        PolicyExpr::Continue,
        PolicyExpr::Kill,
        PolicyExpr::WantSuspend,
        PolicyExpr::WantVacate,
        PolicyExpr::WantHold,
        PolicyExpr::Rank,
        PolicyExpr::StartBackfill,
        PolicyExpr::EvictBackfill,
        PolicyExpr::PeriodicCheckpoint,
        PolicyExpr::MaxJobRetirementTime,
        PolicyExpr::MachineMaxVacateTime,
        PolicyExpr::DrainingStart,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PolicyExpr::Start => "START",
            PolicyExpr::IsOwner => "IS_OWNER",
            PolicyExpr::Preempt => "PREEMPT",
            PolicyExpr::Suspend => "SUSPEND",
            PolicyExpr::Continue => "CONTINUE",
            PolicyExpr::Kill => "KILL",
            PolicyExpr::WantSuspend => "WANT_SUSPEND",
            PolicyExpr::WantVacate => "WANT_VACATE",
            PolicyExpr::WantHold => "WANT_HOLD",
            PolicyExpr::Rank => "RANK",
            PolicyExpr::StartBackfill => "START_BACKFILL",
            PolicyExpr::EvictBackfill => "EVICT_BACKFILL",
            PolicyExpr::PeriodicCheckpoint => "PERIODIC_CHECKPOINT",
            PolicyExpr::MaxJobRetirementTime => "MAXJOBRETIREMENTTIME",
            PolicyExpr::MachineMaxVacateTime => "MACHINE_MAX_VACATE_TIME",
            PolicyExpr::DrainingStart => "DRAINING_START",
        }
    }
}

impl std::fmt::Display for PolicyExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The records an expression is evaluated against. `MY.` resolves in the
/// slot record and `TARGET.` in the job record.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub slot: &'a Attributes,
    pub job: Option<&'a Attributes>,
}

impl<'a> EvalContext<'a> {
    pub fn new(slot: &'a Attributes, job: Option<&'a Attributes>) -> Self {
        Self { slot, job }
    }
}

/// Pluggable expression engine.
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate a configured policy expression.
    fn eval(&self, expr: PolicyExpr, ctx: &EvalContext<'_>) -> EvalValue;

    /// Evaluate an expression carried in a record (a job's Requirements or Rank).
    fn eval_source(&self, source: &str, ctx: &EvalContext<'_>) -> EvalValue;

    /// The literal configured text, republished when a verdict is undefined.
    fn source(&self, expr: PolicyExpr) -> String;

    fn eval_bool(&self, expr: PolicyExpr, ctx: &EvalContext<'_>) -> TriState {
        self.eval(expr, ctx).as_tristate()
    }

    fn eval_number(&self, expr: PolicyExpr, ctx: &EvalContext<'_>) -> Option<f64> {
        self.eval(expr, ctx).as_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tristate_from_bool() {
        assert_eq!(TriState::from(true), TriState::True);
        assert_eq!(TriState::from(false), TriState::False);
        assert!(TriState::Undefined.is_undefined());
        assert!(!TriState::Undefined.is_true());
        assert!(!TriState::Undefined.is_false());
    }

    #[test]
    fn policy_expr_names_are_unique() {
        let mut names: Vec<_> = PolicyExpr::ALL.iter().map(|e| e.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PolicyExpr::ALL.len());
    }
}
