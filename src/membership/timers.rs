use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

use super::{
    processor::Event,
    state::{Timer, TimerKind},
};

/// Pending timers of one processor.
///
/// Each timer is a task that sleeps and then feeds `Event::Timer` back into
/// the processor's event queue. Only the heartbeat is exclusive per kind;
/// checks and attendance timeouts of consecutive rounds may overlap when the
/// check-in period is shorter than their delay. Timers hold the queue weakly
/// so pending timers never keep a dropped processor's task alive.
pub(crate) struct TimerManager {
    timers: Vec<(TimerKind, JoinHandle<()>)>,
    event_tx: mpsc::WeakUnboundedSender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::WeakUnboundedSender<Event>) -> Self {
        TimerManager {
            timers: Vec::new(),
            event_tx,
        }
    }

    pub fn set_timer(&mut self, timer: Timer, after: Duration) {
        self.timers.retain(|(_, handle)| !handle.is_finished());
        if timer.kind.is_exclusive() {
            self.cancel_timer(timer.kind);
        }

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let delivered = event_tx
                .upgrade()
                .is_some_and(|event_tx| event_tx.send(Event::Timer(timer)).is_ok());
            if !delivered {
                trace!(?timer, "processor stopped before timer fired");
            }
        });
        self.timers.push((timer.kind, handle));
    }

    pub fn cancel_timer(&mut self, kind: TimerKind) {
        self.timers.retain(|(pending, handle)| {
            if *pending == kind {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain(..) {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
