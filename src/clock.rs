use std::time::{Duration, Instant};

/// Elapsed-time accounting for one side of a match.
///
/// The clock accumulates whole spans between `start` and `halt`. No drift
/// correction is attempted; timeout checks resample on every poll, which
/// keeps wall-clock jitter bounded to a single tick.
#[derive(Debug, Clone)]
pub struct Clock {
    running_since: Option<Instant>,
    accumulated: Duration,
}

impl Clock {
    pub fn new() -> Self {
        Self::with_accumulated(Duration::ZERO)
    }

    /// A stopped clock pre-charged with `accumulated` time, for resuming
    /// a match from a snapshot.
    pub fn with_accumulated(accumulated: Duration) -> Self {
        Self {
            running_since: None,
            accumulated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Start the clock. A no-op when it is already running.
    pub fn start(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Stop the clock and fold the live span into the accumulated total.
    /// Returns the span that was added.
    pub fn halt(&mut self, now: Instant) -> Duration {
        match self.running_since.take() {
            Some(since) => {
                let spent = now.saturating_duration_since(since);
                self.accumulated += spent;
                spent
            }
            None => Duration::ZERO,
        }
    }

    /// Accumulated time plus the live delta when running.
    pub fn elapsed_now(&self, now: Instant) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + now.saturating_duration_since(since),
            None => self.accumulated,
        }
    }

    pub fn is_over_budget(&self, budget: Duration, now: Instant) -> bool {
        self.elapsed_now(now) > budget
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
