use std::time::Duration;

use crate::claim::ClaimId;
use crate::context::Context;
use crate::error::fatal;
use crate::policy::Attributes;
use crate::slot::SlotId;
use crate::timer::{is_current, TimerHandle, TimerId, TimerTarget};

/// Delay before the first pushed ALIVE after the client itself checked in.
const ALIVE_AFTER_SCHEDD_CONTACT: Duration = Duration::from_secs(10);

/// The lease on one claim and, optionally, the timer that pushes ALIVEs to
/// the client.
///
/// Both timers are reset by [`ClaimLease::alive`] and cancelled together by
/// [`ClaimLease::cancel`].
#[derive(Debug, Default)]
pub struct ClaimLease {
    duration: Option<Duration>,
    alive_interval: Option<Duration>,
    startd_sends_alives: bool,
    starter_handles_alives: bool,
    lease_timer: Option<TimerHandle>,
    send_alive_timer: Option<TimerHandle>,
    alive_in_flight: bool,
}

impl ClaimLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
    }

    pub fn alive_interval(&self) -> Option<Duration> {
        self.alive_interval
    }

    /// Derive the lease from the client's keep-alive interval.
    pub fn set_alive_interval(&mut self, interval: Duration, max_missed: u32) {
        self.alive_interval = Some(interval);
        self.duration = Some(interval * max_missed);
    }

    pub fn startd_sends_alives(&self) -> bool {
        self.startd_sends_alives
    }

    pub fn starter_handles_alives(&self) -> bool {
        self.starter_handles_alives
    }

    pub fn is_running(&self) -> bool {
        self.lease_timer.is_some()
    }

    pub fn is_current_lease(&self, fired: TimerId) -> bool {
        is_current(&self.lease_timer, fired)
    }

    pub fn is_current_send_alive(&self, fired: TimerId) -> bool {
        is_current(&self.send_alive_timer, fired)
    }

    pub fn alive_in_flight(&self) -> bool {
        self.alive_in_flight
    }

    pub fn set_alive_in_flight(&mut self, in_flight: bool) {
        self.alive_in_flight = in_flight;
    }

    /// Time left before the lease expires, if one is running.
    pub fn remaining(&self) -> Option<Duration> {
        self.lease_timer.as_ref().map(TimerHandle::remaining)
    }

    /// Pick up keep-alive preferences carried in the request record.
    pub fn configure(&mut self, request: &Attributes, default_sends_alives: bool) {
        self.startd_sends_alives = request
            .get("StartdSendsAlives")
            .and_then(|v| v.as_bool())
            .unwrap_or(default_sends_alives);
        self.starter_handles_alives = request
            .get("StarterHandlesAlives")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    }

    fn period(&self) -> Duration {
        self.duration.unwrap_or_default() / 3
    }

    /// Arm the lease and, when this daemon pushes keep-alives, the send-alive timer.
    pub fn start(&mut self, ctx: &Context, slot: SlotId, claim: &ClaimId, is_cod: bool) {
        let duration = match self.duration {
            Some(d) => d,
            None if is_cod => return,
            None => {
                let d = ctx.config.timing.default_lease_duration();
                tracing::warn!(
                    slot = %slot,
                    claim = %claim,
                    secs = d.as_secs(),
                    "No lease duration set, using default"
                );
                self.duration = Some(d);
                d
            }
        };

        if self.lease_timer.is_some() {
            fatal(format!("lease timer for {} is already running", claim));
        }
        self.lease_timer = Some(ctx.timers.start(
            duration,
            TimerTarget::LeaseExpired {
                slot,
                claim: claim.clone(),
            },
        ));

        if self.startd_sends_alives && !is_cod && duration > Duration::ZERO {
            let period = self.period();
            self.send_alive_timer = Some(ctx.timers.start_periodic(
                period,
                period,
                TimerTarget::SendAlive {
                    slot,
                    claim: claim.clone(),
                },
            ));
        }
    }

    /// Renew the lease. `from_client` is true when the client itself checked in.
    pub fn alive(
        &mut self,
        ctx: &Context,
        slot: SlotId,
        claim: &ClaimId,
        is_cod: bool,
        from_client: bool,
    ) {
        if self.lease_timer.is_none() {
            self.start(ctx, slot, claim, is_cod);
            return;
        }
        let duration = self.duration.unwrap_or_default();
        tracing::debug!(slot = %slot, claim = %claim, secs = duration.as_secs(), "Lease renewed");
        self.lease_timer = Some(ctx.timers.start(
            duration,
            TimerTarget::LeaseExpired {
                slot,
                claim: claim.clone(),
            },
        ));

        if self.send_alive_timer.is_some() {
            let period = self.period();
            let first = if from_client {
                ALIVE_AFTER_SCHEDD_CONTACT
            } else {
                period
            };
            self.send_alive_timer = Some(ctx.timers.start_periodic(
                first,
                period,
                TimerTarget::SendAlive {
                    slot,
                    claim: claim.clone(),
                },
            ));
        }
    }

    /// Retry a failed ALIVE push after `retry`.
    pub fn retry_send_alive(&mut self, ctx: &Context, slot: SlotId, claim: &ClaimId, retry: Duration) {
        if self.send_alive_timer.is_none() {
            return;
        }
        self.send_alive_timer = Some(ctx.timers.start_periodic(
            retry,
            retry,
            TimerTarget::SendAlive {
                slot,
                claim: claim.clone(),
            },
        ));
    }

    /// Make the lease expire on the next loop turn.
    pub fn expire_now(&mut self, ctx: &Context, slot: SlotId, claim: &ClaimId) {
        self.lease_timer = Some(ctx.timers.start(
            Duration::ZERO,
            TimerTarget::LeaseExpired {
                slot,
                claim: claim.clone(),
            },
        ));
    }

    pub fn cancel(&mut self) {
        self.lease_timer = None;
        self.send_alive_timer = None;
        self.alive_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::test_support::test_context;
    use serde_json::json;

    fn lease_firings(rx: &mut crate::event::EventReceiver) -> Vec<TimerTarget> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let Event::Timer(fired) = ev {
                out.push(fired.target);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn alive_pushes_expiration_out() {
        let (ctx, mut rx) = test_context();
        let claim = ctx.ids.next_id();
        let slot = SlotId(1);
        let mut lease = ClaimLease::new();
        lease.set_duration(Duration::from_secs(30));
        lease.start(&ctx, slot, &claim, false);

        let mut last = lease.remaining().unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            lease.alive(&ctx, slot, &claim, false, true);
            let now = lease.remaining().unwrap();
            assert!(now >= last);
            last = now;
        }
        assert!(lease_firings(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        let fired = lease_firings(&mut rx);
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], TimerTarget::LeaseExpired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cod_without_duration_has_no_lease() {
        let (ctx, _rx) = test_context();
        let claim = ctx.ids.next_id();
        let mut lease = ClaimLease::new();
        lease.start(&ctx, SlotId(1), &claim, true);
        assert!(!lease.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_duration_falls_back_to_default() {
        let (ctx, _rx) = test_context();
        let claim = ctx.ids.next_id();
        let mut lease = ClaimLease::new();
        lease.start(&ctx, SlotId(1), &claim, false);
        assert_eq!(
            lease.duration(),
            Some(ctx.config.timing.default_lease_duration())
        );
        assert!(lease.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn send_alive_runs_at_a_third_of_the_lease() {
        let (ctx, mut rx) = test_context();
        let claim = ctx.ids.next_id();
        let request = json!({"StartdSendsAlives": true}).as_object().cloned().unwrap();
        let mut lease = ClaimLease::new();
        lease.configure(&request, false);
        lease.set_alive_interval(Duration::from_secs(10), 3);
        lease.start(&ctx, SlotId(1), &claim, false);

        tokio::time::sleep(Duration::from_millis(25_500)).await;
        let pushes = lease_firings(&mut rx)
            .into_iter()
            .filter(|t| matches!(t, TimerTarget::SendAlive { .. }))
            .count();
        assert_eq!(pushes, 2);

        lease.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(lease_firings(&mut rx).is_empty());
    }
}
