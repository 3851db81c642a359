//! Progressive back-off for spinning agent loops.
//!
//! An agent calls [`BackoffIdleStrategy::idle`] with the amount of work
//! its last duty cycle performed. Doing work resets the strategy; doing
//! none walks it through busy-spins, then yields, then exponentially
//! growing parks. The park ceiling keeps worst-case wake-up latency
//! bounded while letting a quiet driver consume almost no CPU.

use std::time::Duration;

/// Default spins before yielding.
pub const DEFAULT_MAX_SPINS: u64 = 100;
/// Default yields before parking.
pub const DEFAULT_MAX_YIELDS: u64 = 100;
/// Default first park duration.
pub const DEFAULT_MIN_PARK: Duration = Duration::from_nanos(10);
/// Default park ceiling.
pub const DEFAULT_MAX_PARK: Duration = Duration::from_micros(100);

enum State {
    Spinning(u64),
    Yielding(u64),
    Parking(u64),
}

/// Spin → yield → exponential park idle strategy.
pub struct BackoffIdleStrategy {
    max_spins: u64,
    max_yields: u64,
    min_park_ns: u64,
    max_park_ns: u64,
    state: State,
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_SPINS,
            DEFAULT_MAX_YIELDS,
            DEFAULT_MIN_PARK,
            DEFAULT_MAX_PARK,
        )
    }
}

impl BackoffIdleStrategy {
    /// Creates a strategy with explicit thresholds.
    #[must_use]
    pub fn new(max_spins: u64, max_yields: u64, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park_ns: min_park.as_nanos() as u64,
            max_park_ns: max_park.as_nanos() as u64,
            state: State::Spinning(0),
        }
    }

    /// Idles according to the work performed in the last duty cycle.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        match self.state {
            State::Spinning(spins) => {
                if spins < self.max_spins {
                    std::hint::spin_loop();
                    self.state = State::Spinning(spins + 1);
                } else {
                    std::thread::yield_now();
                    self.state = State::Yielding(1);
                }
            }
            State::Yielding(yields) => {
                if yields < self.max_yields {
                    std::thread::yield_now();
                    self.state = State::Yielding(yields + 1);
                } else {
                    std::thread::park_timeout(Duration::from_nanos(self.min_park_ns));
                    self.state = State::Parking(self.min_park_ns);
                }
            }
            State::Parking(park_ns) => {
                let next = (park_ns * 2).min(self.max_park_ns);
                std::thread::park_timeout(Duration::from_nanos(next));
                self.state = State::Parking(next);
            }
        }
    }

    /// Resets to the spinning state.
    pub fn reset(&mut self) {
        self.state = State::Spinning(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn park_ns(strategy: &BackoffIdleStrategy) -> Option<u64> {
        match strategy.state {
            State::Parking(ns) => Some(ns),
            _ => None,
        }
    }

    #[test]
    fn progresses_spin_yield_park() {
        let mut strategy = BackoffIdleStrategy::new(
            2,
            2,
            Duration::from_nanos(10),
            Duration::from_nanos(80),
        );

        strategy.idle(0); // spin 1
        strategy.idle(0); // spin 2
        assert!(matches!(strategy.state, State::Spinning(2)));
        strategy.idle(0); // first yield
        assert!(matches!(strategy.state, State::Yielding(1)));
        strategy.idle(0); // second yield
        strategy.idle(0); // first park at min
        assert_eq!(park_ns(&strategy), Some(10));
    }

    #[test]
    fn park_doubles_to_ceiling() {
        let mut strategy = BackoffIdleStrategy::new(
            0,
            0,
            Duration::from_nanos(10),
            Duration::from_nanos(35),
        );

        strategy.idle(0); // spin path exhausted immediately -> yield
        strategy.idle(0); // park 10
        strategy.idle(0); // park 20
        assert_eq!(park_ns(&strategy), Some(20));
        strategy.idle(0); // park capped at 35
        assert_eq!(park_ns(&strategy), Some(35));
        strategy.idle(0);
        assert_eq!(park_ns(&strategy), Some(35));
    }

    #[test]
    fn work_resets_backoff() {
        let mut strategy = BackoffIdleStrategy::new(
            0,
            0,
            Duration::from_nanos(10),
            Duration::from_nanos(100),
        );

        strategy.idle(0);
        strategy.idle(0);
        assert!(park_ns(&strategy).is_some());

        strategy.idle(3);
        assert!(matches!(strategy.state, State::Spinning(0)));
    }
}
