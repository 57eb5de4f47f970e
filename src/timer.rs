//! Owned, cancel-on-drop timers.
//!
//! Every armed timer is a [`TimerHandle`] stored in exactly one field of
//! its owner (one field per concern). Dropping or replacing the handle
//! cancels the timer. A firing that was already queued when the handle
//! went away is recognised as stale because its [`TimerId`] no longer
//! matches the owner's field.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::claim::ClaimId;
use crate::event::{Event, EventSender};
use crate::slot::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What a timer is for. Claim-scoped targets carry the claim they were armed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTarget {
    LeaseExpired { slot: SlotId, claim: ClaimId },
    SendAlive { slot: SlotId, claim: ClaimId },
    MatchTimeout { slot: SlotId, claim: ClaimId },
    KillTimeout { slot: SlotId, claim: ClaimId },
    BenchmarksDone { slot: SlotId },
    SlotUpdate { slot: SlotId },
    Poll,
    FlushUpdates,
}

#[derive(Debug, Clone)]
pub struct TimerFired {
    pub id: TimerId,
    pub target: TimerTarget,
}

/// Handle to an armed timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    deadline: Instant,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// When the timer (next) fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True when `fired` was produced by this handle.
    pub fn owns(&self, fired: TimerId) -> bool {
        self.id == fired
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Returns true when `slot` holds the handle that produced `fired`.
pub fn is_current(slot: &Option<TimerHandle>, fired: TimerId) -> bool {
    slot.as_ref().map(|h| h.owns(fired)).unwrap_or(false)
}

/// Arms timers whose firings are posted as [`Event::Timer`].
#[derive(Clone)]
pub struct TimerService {
    events: EventSender,
    next_id: Arc<AtomicU64>,
}

impl TimerService {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn allocate(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire once after `delay`.
    pub fn start(&self, delay: Duration, target: TimerTarget) -> TimerHandle {
        let id = self.allocate();
        let deadline = Instant::now() + delay;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(Event::Timer(TimerFired { id, target }));
        });
        TimerHandle {
            id,
            deadline,
            abort: task.abort_handle(),
        }
    }

    /// Fire after `delay` and then every `period` until cancelled.
    pub fn start_periodic(
        &self,
        delay: Duration,
        period: Duration,
        target: TimerTarget,
    ) -> TimerHandle {
        let id = self.allocate();
        let deadline = Instant::now() + delay;
        let events = self.events.clone();
        let period = period.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(deadline, period);
            loop {
                interval.tick().await;
                let fired = TimerFired {
                    id,
                    target: target.clone(),
                };
                if events.send(Event::Timer(fired)).is_err() {
                    // Daemon loop gone
                    break;
                }
            }
        });
        TimerHandle {
            id,
            deadline,
            abort: task.abort_handle(),
        }
    }
}
