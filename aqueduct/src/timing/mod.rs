//! Time sources and the hashed timer wheel.

pub mod wheel;

pub use wheel::{TimerId, TimerWheel, WheelConfig};

/// Cheap monotonic nanosecond clock for agent duty cycles.
#[derive(Clone, Copy)]
pub struct MonotonicClock {
    anchor: minstant::Instant,
}

impl MonotonicClock {
    /// A clock anchored at construction time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: minstant::Instant::now(),
        }
    }

    /// Nanoseconds since the anchor.
    #[inline]
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
