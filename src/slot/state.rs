//! Slot states, activities, and the pure policy decision function.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::fatal;
use crate::policy::TriState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum State {
    Owner,
    Unclaimed,
    Matched,
    Claimed,
    Preempting,
    Backfill,
    Drained,
    /// Pseudo-state: entering it removes the slot
    Delete,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Owner,
        State::Unclaimed,
        State::Matched,
        State::Claimed,
        State::Preempting,
        State::Backfill,
        State::Drained,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            State::Owner => "Owner",
            State::Unclaimed => "Unclaimed",
            State::Matched => "Matched",
            State::Claimed => "Claimed",
            State::Preempting => "Preempting",
            State::Backfill => "Backfill",
            State::Drained => "Drained",
            State::Delete => "Delete",
        }
    }

    pub fn parse(s: &str) -> Option<State> {
        State::ALL
            .into_iter()
            .chain([State::Delete])
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Activity {
    Idle,
    Benchmarking,
    Busy,
    Suspended,
    Retiring,
    Vacating,
    Killing,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Idle => "Idle",
            Activity::Benchmarking => "Benchmarking",
            Activity::Busy => "Busy",
            Activity::Suspended => "Suspended",
            Activity::Retiring => "Retiring",
            Activity::Vacating => "Vacating",
            Activity::Killing => "Killing",
        }
    }

    pub fn parse(s: &str) -> Option<Activity> {
        [
            Activity::Idle,
            Activity::Benchmarking,
            Activity::Busy,
            Activity::Suspended,
            Activity::Retiring,
            Activity::Vacating,
            Activity::Killing,
        ]
        .into_iter()
        .find(|a| a.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activities allowed within each state.
pub fn legal_activities(state: State) -> &'static [Activity] {
    use Activity::*;
    match state {
        State::Owner => &[Idle],
        State::Unclaimed => &[Idle, Benchmarking],
        State::Matched => &[Idle],
        State::Claimed => &[Idle, Busy, Suspended, Retiring],
        State::Preempting => &[Vacating, Killing],
        State::Backfill => &[Idle, Busy, Killing],
        State::Drained => &[Idle, Retiring],
        State::Delete => &[],
    }
}

pub fn is_legal(state: State, activity: Activity) -> bool {
    legal_activities(state).contains(&activity)
}

/// What a completed transition changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old_state: State,
    pub old_activity: Activity,
    pub state_changed: bool,
    pub activity_changed: bool,
}

/// The canonical (State, Activity) pair of one slot plus its bookkeeping.
#[derive(Debug)]
pub struct SlotStateMachine {
    state: State,
    activity: Activity,
    destination: Option<State>,
    entered_state: Instant,
    entered_activity: Instant,
    entered_state_wall: i64,
    entered_activity_wall: i64,
    act_was_benchmark: bool,
    history: BTreeMap<(State, Activity), Duration>,
}

impl Default for SlotStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStateMachine {
    pub fn new() -> Self {
        let now = Instant::now();
        let wall = chrono::Utc::now().timestamp();
        Self {
            state: State::Owner,
            activity: Activity::Idle,
            destination: None,
            entered_state: now,
            entered_activity: now,
            entered_state_wall: wall,
            entered_activity_wall: wall,
            act_was_benchmark: false,
            history: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn destination(&self) -> Option<State> {
        self.destination
    }

    pub fn set_destination(&mut self, dest: Option<State>) {
        self.destination = dest;
    }

    pub fn act_was_benchmark(&self) -> bool {
        self.act_was_benchmark
    }

    pub fn time_in_state(&self) -> Duration {
        self.entered_state.elapsed()
    }

    pub fn time_in_activity(&self) -> Duration {
        self.entered_activity.elapsed()
    }

    pub fn entered_state_wall(&self) -> i64 {
        self.entered_state_wall
    }

    pub fn entered_activity_wall(&self) -> i64 {
        self.entered_activity_wall
    }

    /// Apply a transition. The caller has already run leave actions and
    /// decided the transition goes ahead.
    pub fn apply(&mut self, state: State, activity: Activity) -> Transition {
        if !is_legal(state, activity) {
            fatal(format!("illegal state/activity pair {}/{}", state, activity));
        }
        let transition = Transition {
            old_state: self.state,
            old_activity: self.activity,
            state_changed: state != self.state,
            activity_changed: activity != self.activity,
        };
        if !transition.state_changed && !transition.activity_changed {
            return transition;
        }

        let now = Instant::now();
        let wall = chrono::Utc::now().timestamp();
        *self
            .history
            .entry((self.state, self.activity))
            .or_default() += now.saturating_duration_since(self.entered_activity);

        if transition.state_changed {
            self.entered_state = now;
            self.entered_state_wall = wall;
            if self.destination == Some(state) {
                self.destination = None;
            }
        }
        if transition.activity_changed {
            self.act_was_benchmark = self.activity == Activity::Benchmarking;
        }
        self.entered_activity = now;
        self.entered_activity_wall = wall;
        self.state = state;
        self.activity = activity;
        transition
    }

    /// Cumulative time spent in a pair, including the open interval.
    pub fn time_in(&self, state: State, activity: Activity) -> Duration {
        let mut total = self
            .history
            .get(&(state, activity))
            .copied()
            .unwrap_or_default();
        if (state, activity) == (self.state, self.activity) {
            total += self.entered_activity.elapsed();
        }
        total
    }

    /// Non-zero history counters as `(TotalTime<State><Activity>, seconds)`.
    pub fn history_counters(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        for state in State::ALL {
            for &activity in legal_activities(state) {
                let secs = self.time_in(state, activity).as_secs();
                if secs > 0 {
                    out.push((format!("TotalTime{}{}", state, activity), secs));
                }
            }
        }
        out
    }
}

// -- policy decision ---------------------------------------------------------

pub const VACATE_FOR_RANK: &str = "Preempted for a higher Ranked job";
pub const VACATE_FOR_PRIORITY: &str = "Preempted for a Priority user";

/// Everything the decision function needs, evaluated up front.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs {
    pub preempt: TriState,
    pub suspend: TriState,
    pub continue_: TriState,
    pub kill: TriState,
    pub is_owner: TriState,
    pub start: TriState,
    pub start_backfill: TriState,
    pub evict_backfill: TriState,
    pub want_suspend: bool,
    pub wants_pckpt: bool,

    pub suspended_for_cod: bool,
    pub in_retirement: bool,
    pub retirement_expired: bool,
    pub may_unretire: bool,
    pub preempt_was_true: bool,
    pub has_preempting_claim: bool,
    pub preempting_outranks: bool,
    pub claim_worklife_expired: bool,
    pub waiting_for_activation: bool,

    pub dynamic_or_broken: bool,
    pub draining: bool,
    pub draining_complete: bool,
    pub benchmarks_due: bool,
    pub backfill_enabled: bool,
}

impl Default for PolicyInputs {
    fn default() -> Self {
        Self {
            preempt: TriState::False,
            suspend: TriState::False,
            continue_: TriState::True,
            kill: TriState::False,
            is_owner: TriState::False,
            start: TriState::True,
            start_backfill: TriState::False,
            evict_backfill: TriState::False,
            want_suspend: false,
            wants_pckpt: false,
            suspended_for_cod: false,
            in_retirement: false,
            retirement_expired: false,
            may_unretire: true,
            preempt_was_true: false,
            has_preempting_claim: false,
            preempting_outranks: false,
            claim_worklife_expired: false,
            waiting_for_activation: false,
            dynamic_or_broken: false,
            draining: false,
            draining_complete: false,
            benchmarks_due: false,
            backfill_enabled: false,
        }
    }
}

/// The transition a decision asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Change state; the activity is chosen by the slot
    State(State),
    /// Change activity within the current state
    Activity(Activity),
    Both(State, Activity),
    /// Retire the claim without the possibility of un-retiring
    RetireIrreversibly,
}

/// Side effects that accompany a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extra {
    PreemptWasTrue,
    BadputByPreemption,
    BadputByDraining,
    VacateReason(&'static str),
    PeriodicCheckpoint,
    RestoreRequirements,
    StartBenchmarks,
    StartBackfill,
    SetDestination(State),
    ConsiderResumeAfterDraining,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Decision {
    pub next: Option<NextStep>,
    pub reason: &'static str,
    pub extras: Vec<Extra>,
}

impl Decision {
    fn none() -> Self {
        Self::default()
    }

    fn go(next: NextStep, reason: &'static str) -> Self {
        Self {
            next: Some(next),
            reason,
            extras: Vec::new(),
        }
    }

    fn with(mut self, extra: Extra) -> Self {
        self.extras.push(extra);
        self
    }

    fn extras_only(extras: Vec<Extra>) -> Self {
        Self {
            next: None,
            reason: "",
            extras,
        }
    }
}

fn badput(inputs: &PolicyInputs) -> Extra {
    if inputs.draining {
        Extra::BadputByDraining
    } else {
        Extra::BadputByPreemption
    }
}

/// Decide the next transition for a slot. Pure: nothing is mutated.
pub fn eval_policy(state: State, activity: Activity, act_was_benchmark: bool, inputs: &PolicyInputs) -> Decision {
    match state {
        State::Claimed => eval_claimed(activity, inputs),
        State::Preempting => {
            if activity == Activity::Vacating && inputs.kill.is_true() {
                Decision::go(NextStep::Activity(Activity::Killing), "KILL is true")
                    .with(badput(inputs))
            } else {
                Decision::none()
            }
        }
        State::Unclaimed => eval_unclaimed(act_was_benchmark, inputs),
        State::Owner => {
            if inputs.dynamic_or_broken {
                Decision::go(NextStep::State(State::Delete), "dynamic slot back in Owner")
            } else if inputs.draining {
                Decision::go(NextStep::Both(State::Drained, Activity::Retiring), "draining")
            } else if !inputs.is_owner.is_true() {
                Decision::go(NextStep::State(State::Unclaimed), "IS_OWNER is false")
            } else {
                Decision::none()
            }
        }
        State::Matched => Decision::none(),
        State::Backfill => eval_backfill(activity, inputs),
        State::Drained => {
            if !inputs.draining {
                Decision::go(NextStep::State(State::Owner), "draining cancelled")
            } else if activity == Activity::Retiring && inputs.draining_complete {
                Decision::go(NextStep::Both(State::Drained, Activity::Idle), "draining complete")
            } else if activity == Activity::Idle {
                Decision::extras_only(vec![Extra::ConsiderResumeAfterDraining])
            } else {
                Decision::none()
            }
        }
        State::Delete => Decision::none(),
    }
}

fn eval_claimed(activity: Activity, inputs: &PolicyInputs) -> Decision {
    use Activity::*;

    if activity == Suspended && inputs.suspended_for_cod {
        return Decision::none();
    }

    if inputs.in_retirement && inputs.retirement_expired {
        let mut d = Decision::go(NextStep::State(State::Preempting), "retirement ended")
            .with(badput(inputs));
        if inputs.preempt.is_true() {
            d = d.with(Extra::PreemptWasTrue);
        }
        return d;
    }

    let check_preempt = (activity == Busy && !inputs.want_suspend)
        || (activity == Retiring && !inputs.preempt_was_true && !inputs.want_suspend)
        || (activity == Suspended && !inputs.preempt_was_true);
    if check_preempt && inputs.preempt.is_true() {
        return Decision::go(NextStep::RetireIrreversibly, "PREEMPT is true")
            .with(Extra::PreemptWasTrue)
            .with(badput(inputs));
    }

    if activity == Retiring {
        if inputs.may_unretire {
            return Decision::go(NextStep::Activity(Busy), "un-retiring, no preempting claim");
        }
        if inputs.retirement_expired {
            return Decision::go(NextStep::State(State::Preempting), "retirement ended")
                .with(badput(inputs));
        }
    }

    if (activity == Busy || activity == Retiring) && inputs.want_suspend && inputs.suspend.is_true() {
        return Decision::go(NextStep::Activity(Suspended), "SUSPEND is true");
    }

    if activity == Suspended && inputs.continue_.is_true() {
        if !inputs.in_retirement {
            return Decision::go(NextStep::Activity(Busy), "CONTINUE is true");
        }
        let mut d = Decision::go(NextStep::Activity(Retiring), "CONTINUE is true while retiring");
        if inputs.has_preempting_claim {
            d = d.with(Extra::VacateReason(vacate_reason(inputs)));
        }
        return d;
    }

    if activity == Busy && inputs.has_preempting_claim {
        return Decision::go(NextStep::Activity(Retiring), "preempting claim exists")
            .with(Extra::VacateReason(vacate_reason(inputs)));
    }

    if activity == Idle {
        if inputs.has_preempting_claim {
            return Decision::go(NextStep::State(State::Preempting), "idle claim has a preempting claim");
        }
        if inputs.start.is_false() {
            return Decision::go(NextStep::State(State::Preempting), "START is false on idle claim");
        }
        if inputs.claim_worklife_expired {
            return Decision::go(NextStep::State(State::Preempting), "claim worklife expired");
        }
        if inputs.draining && !inputs.waiting_for_activation {
            return Decision::go(NextStep::State(State::Preempting), "draining idle claim");
        }
    }

    let mut extras = Vec::new();
    if (activity == Busy || activity == Retiring) && inputs.wants_pckpt {
        extras.push(Extra::PeriodicCheckpoint);
    }
    extras.push(Extra::RestoreRequirements);
    Decision::extras_only(extras)
}

fn vacate_reason(inputs: &PolicyInputs) -> &'static str {
    if inputs.preempting_outranks {
        VACATE_FOR_RANK
    } else {
        VACATE_FOR_PRIORITY
    }
}

fn eval_unclaimed(act_was_benchmark: bool, inputs: &PolicyInputs) -> Decision {
    if inputs.dynamic_or_broken {
        return Decision::go(NextStep::State(State::Delete), "dynamic slot released");
    }
    if inputs.draining {
        return Decision::go(NextStep::Both(State::Drained, Activity::Retiring), "draining");
    }
    if inputs.is_owner.is_true() {
        return Decision::go(NextStep::State(State::Owner), "IS_OWNER is true");
    }
    let mut extras = Vec::new();
    if !act_was_benchmark && inputs.benchmarks_due {
        extras.push(Extra::StartBenchmarks);
    }
    if inputs.backfill_enabled && inputs.start_backfill.is_true() {
        let mut d = Decision::go(NextStep::Both(State::Backfill, Activity::Idle), "START_BACKFILL is true");
        d.extras = extras;
        return d;
    }
    extras.push(Extra::RestoreRequirements);
    Decision::extras_only(extras)
}

fn eval_backfill(activity: Activity, inputs: &PolicyInputs) -> Decision {
    if activity == Activity::Killing {
        return Decision::none();
    }
    if inputs.evict_backfill.is_true() {
        return match activity {
            Activity::Idle => Decision::go(NextStep::State(State::Owner), "EVICT_BACKFILL is true"),
            _ => Decision::go(NextStep::Both(State::Backfill, Activity::Killing), "EVICT_BACKFILL is true")
                .with(Extra::SetDestination(State::Owner)),
        };
    }
    if activity == Activity::Idle {
        return Decision::extras_only(vec![Extra::StartBackfill]);
    }
    Decision::none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_table_matches_states() {
        assert!(is_legal(State::Claimed, Activity::Retiring));
        assert!(is_legal(State::Drained, Activity::Retiring));
        assert!(!is_legal(State::Owner, Activity::Busy));
        assert!(!is_legal(State::Preempting, Activity::Idle));
        assert!(!is_legal(State::Delete, Activity::Idle));
        let pairs: usize = State::ALL.iter().map(|s| legal_activities(*s).len()).sum();
        assert_eq!(pairs, 16);
    }

    #[test]
    fn parse_round_trips_names() {
        for state in State::ALL {
            assert_eq!(State::parse(state.as_str()), Some(state));
        }
        assert_eq!(State::parse("claimed"), Some(State::Claimed));
        assert_eq!(Activity::parse("Retiring"), Some(Activity::Retiring));
        assert_eq!(State::parse("bogus"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_records_history_and_clears_destination() {
        let mut m = SlotStateMachine::new();
        m.set_destination(Some(State::Unclaimed));
        tokio::time::sleep(Duration::from_secs(7)).await;
        let t = m.apply(State::Unclaimed, Activity::Idle);
        assert!(t.state_changed);
        assert_eq!(m.destination(), None);
        assert_eq!(m.time_in(State::Owner, Activity::Idle), Duration::from_secs(7));

        tokio::time::sleep(Duration::from_secs(3)).await;
        m.apply(State::Unclaimed, Activity::Benchmarking);
        m.apply(State::Unclaimed, Activity::Idle);
        assert!(m.act_was_benchmark());

        let counters = m.history_counters();
        assert!(counters.contains(&("TotalTimeOwnerIdle".to_string(), 7)));
        assert!(counters.contains(&("TotalTimeUnclaimedIdle".to_string(), 3)));
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "illegal state/activity")]
    async fn illegal_pair_is_fatal() {
        let mut m = SlotStateMachine::new();
        m.apply(State::Owner, Activity::Busy);
    }

    #[test]
    fn owner_goes_unclaimed_when_not_owner() {
        let d = eval_policy(State::Owner, Activity::Idle, false, &PolicyInputs::default());
        assert_eq!(d.next, Some(NextStep::State(State::Unclaimed)));
    }

    #[test]
    fn busy_with_preempting_claim_retires_reversibly() {
        let inputs = PolicyInputs {
            has_preempting_claim: true,
            in_retirement: true,
            preempting_outranks: true,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Claimed, Activity::Busy, false, &inputs);
        assert_eq!(d.next, Some(NextStep::Activity(Activity::Retiring)));
        assert!(d.extras.contains(&Extra::VacateReason(VACATE_FOR_RANK)));
        assert!(!d.extras.contains(&Extra::PreemptWasTrue));
    }

    #[test]
    fn expired_retirement_with_preempt_goes_preempting() {
        let inputs = PolicyInputs {
            preempt: TriState::True,
            in_retirement: true,
            retirement_expired: true,
            may_unretire: false,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Claimed, Activity::Retiring, false, &inputs);
        assert_eq!(d.next, Some(NextStep::State(State::Preempting)));
        assert!(d.extras.contains(&Extra::PreemptWasTrue));
        assert!(d.extras.contains(&Extra::BadputByPreemption));
    }

    #[test]
    fn preempt_true_retires_irreversibly_once() {
        let mut inputs = PolicyInputs {
            preempt: TriState::True,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Claimed, Activity::Busy, false, &inputs);
        assert_eq!(d.next, Some(NextStep::RetireIrreversibly));

        // sticky: while retiring with preempt_was_true PREEMPT is not consulted
        inputs.preempt_was_true = true;
        inputs.may_unretire = false;
        inputs.in_retirement = true;
        let d = eval_policy(State::Claimed, Activity::Retiring, false, &inputs);
        assert_ne!(d.next, Some(NextStep::RetireIrreversibly));
    }

    #[test]
    fn retiring_unretires_when_allowed() {
        let d = eval_policy(State::Claimed, Activity::Retiring, false, &PolicyInputs::default());
        assert_eq!(d.next, Some(NextStep::Activity(Activity::Busy)));
    }

    #[test]
    fn suspend_for_cod_is_left_alone() {
        let inputs = PolicyInputs {
            suspended_for_cod: true,
            preempt: TriState::True,
            ..PolicyInputs::default()
        };
        assert_eq!(
            eval_policy(State::Claimed, Activity::Suspended, false, &inputs),
            Decision::default()
        );
    }

    #[test]
    fn suspended_continue_in_retirement_returns_to_retiring() {
        let inputs = PolicyInputs {
            in_retirement: true,
            may_unretire: false,
            preempt_was_true: true,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Claimed, Activity::Suspended, false, &inputs);
        assert_eq!(d.next, Some(NextStep::Activity(Activity::Retiring)));
    }

    #[test]
    fn idle_claim_preempted_when_draining_after_activation_delay() {
        let mut inputs = PolicyInputs {
            draining: true,
            waiting_for_activation: true,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Claimed, Activity::Idle, false, &inputs);
        assert_eq!(d.next, None);
        inputs.waiting_for_activation = false;
        let d = eval_policy(State::Claimed, Activity::Idle, false, &inputs);
        assert_eq!(d.next, Some(NextStep::State(State::Preempting)));
    }

    #[test]
    fn vacating_goes_killing_on_kill() {
        let inputs = PolicyInputs {
            kill: TriState::True,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Preempting, Activity::Vacating, false, &inputs);
        assert_eq!(d.next, Some(NextStep::Activity(Activity::Killing)));
    }

    #[test]
    fn unclaimed_benchmarks_only_after_non_benchmark_activity() {
        let inputs = PolicyInputs {
            benchmarks_due: true,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Unclaimed, Activity::Idle, false, &inputs);
        assert!(d.extras.contains(&Extra::StartBenchmarks));
        let d = eval_policy(State::Unclaimed, Activity::Idle, true, &inputs);
        assert!(!d.extras.contains(&Extra::StartBenchmarks));
    }

    #[test]
    fn backfill_eviction() {
        let inputs = PolicyInputs {
            evict_backfill: TriState::True,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Backfill, Activity::Busy, false, &inputs);
        assert_eq!(d.next, Some(NextStep::Both(State::Backfill, Activity::Killing)));
        assert!(d.extras.contains(&Extra::SetDestination(State::Owner)));
        let d = eval_policy(State::Backfill, Activity::Idle, false, &inputs);
        assert_eq!(d.next, Some(NextStep::State(State::Owner)));
    }

    #[test]
    fn drained_transitions() {
        let mut inputs = PolicyInputs {
            draining: true,
            draining_complete: true,
            ..PolicyInputs::default()
        };
        let d = eval_policy(State::Drained, Activity::Retiring, false, &inputs);
        assert_eq!(d.next, Some(NextStep::Both(State::Drained, Activity::Idle)));
        inputs.draining = false;
        let d = eval_policy(State::Drained, Activity::Idle, false, &inputs);
        assert_eq!(d.next, Some(NextStep::State(State::Owner)));
    }
}
