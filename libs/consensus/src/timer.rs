//! Election and heartbeat timers
//!
//! Timers run on tokio's time driver, which is the node's clock. Tests pause
//! that clock (`start_paused`) to drive elections deterministically.
//!
//! Every arm of a timer bumps its generation. A fire carries the generation it
//! was armed with and is discarded unless it still matches, so a timer that is
//! reset just as it expires never delivers the stale fire.

use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Draw an election timeout uniformly from `[min, max]`
pub fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(timeout_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
}

/// Delivered to the node's event loop when a timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// A cancellable, resettable one-shot timer
pub struct Timer {
    kind: TimerKind,
    generation: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl Timer {
    pub fn new(kind: TimerKind, tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            kind,
            generation: 0,
            armed: false,
            task: None,
            tx,
        }
    }

    /// (Re)arm the timer to fire once after `after`
    pub fn reset(&mut self, after: Duration) {
        self.cancel();
        self.armed = true;

        let fired = TimerFired {
            kind: self.kind,
            generation: self.generation,
        };
        let tx = self.tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(fired);
        }));
    }

    /// Disarm the timer. Idempotent.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.armed = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Whether `fired` came from the current arming of this timer.
    /// Consumes the arming: a one-shot timer fires at most once.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        if fired.kind == self.kind && self.armed && fired.generation == self.generation {
            self.armed = false;
            self.task = None;
            return true;
        }
        false
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
