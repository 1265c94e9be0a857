//! Execution budget accounting.
//!
//! Guest code is charged for the time it runs, not for the time the host
//! spends waiting on outbound I/O for it. Host natives that block on the
//! network call [`ExecutionClock::pause`]; every [`Deadline`] taken from the
//! same clock moves back by the paused time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ClockState {
    excluded: Duration,
    paused_since: Option<Instant>,
}

/// Shared between a sandbox thread, its host natives and the host side of
/// its instance.
#[derive(Debug, Clone, Default)]
pub struct ExecutionClock {
    state: Arc<Mutex<ClockState>>,
}

impl ExecutionClock {
    /// Total time excluded from budgets so far, including a pause in progress.
    pub fn excluded(&self) -> Duration {
        let state = self.state.lock();
        state.excluded + state.paused_since.map_or(Duration::ZERO, |since| since.elapsed())
    }

    /// Stop charging time until the returned guard is dropped.
    pub fn pause(&self) -> PausedClock {
        let mut state = self.state.lock();
        let owner = state.paused_since.is_none();
        if owner {
            state.paused_since = Some(Instant::now());
        }
        PausedClock {
            clock: self.clone(),
            owner,
        }
    }

    /// A deadline `budget` from now.
    pub fn deadline(&self, budget: Duration) -> Deadline {
        Deadline {
            clock: self.clone(),
            start: Instant::now(),
            budget,
            base: self.excluded(),
        }
    }
}

/// Guard returned by [`ExecutionClock::pause`].
#[derive(Debug)]
pub struct PausedClock {
    clock: ExecutionClock,
    owner: bool,
}

impl Drop for PausedClock {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        let mut state = self.clock.state.lock();
        if let Some(since) = state.paused_since.take() {
            state.excluded += since.elapsed();
        }
    }
}

/// A budget measured on an [`ExecutionClock`].
#[derive(Debug, Clone)]
pub struct Deadline {
    clock: ExecutionClock,
    start: Instant,
    budget: Duration,
    base: Duration,
}

impl Deadline {
    /// Budget left; zero once expired. Grows back while the clock is paused.
    pub fn remaining(&self) -> Duration {
        let paused = self.clock.excluded().saturating_sub(self.base);
        (self.budget + paused).saturating_sub(self.start.elapsed())
    }

    /// Whether the budget is used up.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_deadline_expires() {
        let clock = ExecutionClock::default();
        let deadline = clock.deadline(Duration::from_millis(20));
        assert!(!deadline.is_expired());
        thread::sleep(Duration::from_millis(30));
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_paused_time_is_not_charged() {
        let clock = ExecutionClock::default();
        let deadline = clock.deadline(Duration::from_millis(50));
        {
            let _paused = clock.pause();
            thread::sleep(Duration::from_millis(80));
            assert!(!deadline.is_expired());
        }
        assert!(clock.excluded() >= Duration::from_millis(80));
        assert!(!deadline.is_expired());
    }

    #[test]
    fn test_nested_pause_counts_once() {
        let clock = ExecutionClock::default();
        let outer = clock.pause();
        let inner = clock.pause();
        thread::sleep(Duration::from_millis(10));
        drop(inner);
        drop(outer);
        let excluded = clock.excluded();
        assert!(excluded >= Duration::from_millis(10));
        assert!(excluded < Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_ignores_earlier_pauses() {
        let clock = ExecutionClock::default();
        drop(clock.pause());
        thread::sleep(Duration::from_millis(5));
        let deadline = clock.deadline(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(20));
        assert!(deadline.is_expired());
    }
}
