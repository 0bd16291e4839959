use std::time::Duration;

use tracing::{info, warn};

/// Where the single transfer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Educe)]
#[educe(Default)]
pub enum State {
    /// Pacing timer armed, transfer idle.
    #[educe(Default)]
    Waiting,
    /// Transfer handed to the engine, pacing timer left alone until it completes.
    Requesting,
}

/// Paces requests: the next one is issued a fixed interval after the previous
/// completion was observed, so the cycle drifts by however long the transfer took.
#[derive(Debug)]
pub struct Scheduler {
    state: State,
    interval: Duration,
    cycles: u64,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: State::default(),
            interval,
            cycles: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed request cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// The pacing timer fired. Returns whether the transfer should be added now.
    pub fn pacing_fired(&mut self) -> bool {
        match self.state {
            State::Waiting => {
                info!(cycle = self.cycles + 1, "app sleep end, perform request");
                self.state = State::Requesting;
                true
            }
            State::Requesting => {
                warn!("pacing timer fired while a request is in flight, ignoring");
                false
            }
        }
    }

    /// The reaper saw the transfer finish. Returns the delay to arm the pacing timer with.
    pub fn completion_observed(&mut self) -> Duration {
        if self.state == State::Waiting {
            warn!("completion observed with no request in flight");
        }
        self.state = State::Waiting;
        self.cycles += 1;
        info!(interval = ?self.interval, "app sleep start");
        self.interval
    }
}
