use tokio::sync::mpsc;

use crate::claim::ClaimId;
use crate::client::AliveOutcome;
use crate::slot::SlotId;
use crate::starter::{StarterExit, StarterId};
use crate::timer::TimerFired;

/// Asynchronous completions delivered to the daemon loop.
///
/// Anything that would otherwise block (a timer, a child process exiting,
/// a keep-alive round trip) finishes by posting one of these.
#[derive(Debug)]
pub enum Event {
    Timer(TimerFired),
    StarterExited {
        slot: SlotId,
        starter: StarterId,
        exit: StarterExit,
    },
    AliveReply {
        slot: SlotId,
        claim: ClaimId,
        outcome: AliveOutcome,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
