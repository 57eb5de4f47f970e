use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::{Attributes, EvalContext, PolicyEvaluator, PolicyExpr, TriState};
use crate::slot::state::State;

/// Publishable availability of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// START evaluated true
    Available,
    /// START evaluated false, or the slot is forced unavailable
    Unavailable,
    /// START is undefined; the configured text is republished as-is
    Original,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Available => write!(f, "available"),
            Verdict::Unavailable => write!(f, "unavailable"),
            Verdict::Original => write!(f, "original"),
        }
    }
}

impl From<TriState> for Verdict {
    fn from(value: TriState) -> Self {
        match value {
            TriState::True => Verdict::Available,
            TriState::False => Verdict::Unavailable,
            TriState::Undefined => Verdict::Original,
        }
    }
}

/// States whose enter action forces the admission verdict to Unavailable.
///
/// A Claimed slot is held Unavailable but keeps advertising START so a
/// higher-ranked request can still find it and preempt the running claim.
pub fn forces_unavailable(state: State) -> bool {
    matches!(
        state,
        State::Matched | State::Claimed | State::Preempting | State::Drained
    )
}

fn source_for(verdict: Verdict, policy: &dyn PolicyEvaluator) -> String {
    match verdict {
        Verdict::Available => "true".to_string(),
        Verdict::Unavailable => "false".to_string(),
        Verdict::Original => policy.source(PolicyExpr::Start),
    }
}

/// Tracks the slot's admission expression and its published verdict.
#[derive(Debug, Clone)]
pub struct RequirementsPolicy {
    verdict: Verdict,
    forced: bool,
    /// Expression advertised instead of `false` while forced (draining START)
    override_source: Option<String>,
}

impl Default for RequirementsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RequirementsPolicy {
    pub fn new() -> Self {
        Self {
            verdict: Verdict::Original,
            forced: false,
            override_source: None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Current truth value of START against the slot record.
    pub fn eval(&self, policy: &dyn PolicyEvaluator, ctx: &EvalContext<'_>) -> TriState {
        policy.eval_bool(PolicyExpr::Start, ctx)
    }

    /// Lift any forced override and re-derive the verdict from START.
    /// Returns true when the published verdict changed.
    pub fn restore(&mut self, policy: &dyn PolicyEvaluator, ctx: &EvalContext<'_>) -> bool {
        let before = (self.verdict, self.forced);
        self.forced = false;
        self.override_source = None;
        self.verdict = Verdict::from(self.eval(policy, ctx));
        before != (self.verdict, self.forced)
    }

    /// Force the verdict to Unavailable while still advertising what START
    /// currently evaluates to. Returns true when anything published changed.
    pub fn hold(&mut self, policy: &dyn PolicyEvaluator, ctx: &EvalContext<'_>) -> bool {
        let advertised = source_for(Verdict::from(self.eval(policy, ctx)), policy);
        let before = (self.verdict, self.forced, self.override_source.clone());
        self.forced = true;
        self.verdict = Verdict::Unavailable;
        self.override_source = Some(advertised);
        before != (self.verdict, self.forced, self.override_source.clone())
    }

    /// Force the verdict to Unavailable. A draining START expression, when
    /// given, is advertised in place of the literal `false`.
    pub fn unavail(&mut self, override_source: Option<String>) -> bool {
        let changed = !self.forced || self.override_source != override_source;
        self.forced = true;
        self.verdict = Verdict::Unavailable;
        self.override_source = override_source;
        changed
    }

    /// The Requirements text that goes into the published record.
    pub fn advertised_source(&self, policy: &dyn PolicyEvaluator) -> String {
        match &self.override_source {
            Some(source) => source.clone(),
            None => source_for(self.verdict, policy),
        }
    }

    pub fn publish(&self, policy: &dyn PolicyEvaluator, record: &mut Attributes) {
        record.insert(
            "Requirements".to_string(),
            Value::String(self.advertised_source(policy)),
        );
        record.insert(
            "RequirementsVerdict".to_string(),
            Value::String(self.verdict.to_string()),
        );
        record.insert("RequirementsForced".to_string(), Value::Bool(self.forced));
    }

    /// Re-derive a verdict from a published record alone.
    pub fn reevaluate(policy: &dyn PolicyEvaluator, record: &Attributes) -> Verdict {
        let forced = record
            .get("RequirementsForced")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let forcing_state = record
            .get("State")
            .and_then(Value::as_str)
            .and_then(State::parse)
            .map(forces_unavailable)
            .unwrap_or(false);
        if forced || forcing_state {
            return Verdict::Unavailable;
        }
        Verdict::from(policy.eval_bool(PolicyExpr::Start, &EvalContext::new(record, None)))
    }
}
