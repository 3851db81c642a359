//! Hashed timer wheel with O(1) schedule/cancel and bounded per-tick work.
//!
//! Single-level, power-of-two slots, owned by one agent. A timer whose
//! deadline lies beyond one wheel revolution carries a rounds-remaining
//! count that is decremented each time its slot comes around; it fires
//! when the count hits zero. Nodes live in a generational slab so a
//! [`TimerId`] held after cancellation or firing is detected as stale
//! rather than cancelling an unrelated timer.

use std::time::Duration;

/// Wheel geometry.
pub struct WheelConfig {
    /// Tick duration; deadlines are quantized to this.
    pub tick: Duration,
    /// Slot count; must be a power of two.
    pub slots: usize,
    /// Maximum concurrently scheduled timers.
    pub capacity: usize,
}

/// Handle for cancelling a scheduled timer. Stale handles (fired or
/// cancelled timers) are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

struct Node<T> {
    payload: Option<T>,
    generation: u32,
    deadline: u64,
    rounds: u32,
    next: Option<u32>,
    prev: Option<u32>,
    slot: usize,
}

enum Entry<T> {
    Occupied(Node<T>),
    Free { next: Option<u32>, generation: u32 },
}

/// Hashed timer wheel.
pub struct TimerWheel<T> {
    slots: Vec<Option<u32>>,
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    mask: usize,
    tick_ns: u64,
    cursor: u64,
    scheduled: usize,
}

impl<T> TimerWheel<T> {
    /// Creates a wheel.
    ///
    /// # Panics
    ///
    /// Panics if the slot count is not a power of two or the tick is zero.
    #[must_use]
    pub fn new(config: WheelConfig) -> Self {
        assert!(config.slots.is_power_of_two(), "slots must be a power of two");
        let tick_ns = config.tick.as_nanos() as u64;
        assert!(tick_ns > 0, "tick must be non-zero");

        let mut entries = Vec::with_capacity(config.capacity);
        for index in 0..config.capacity {
            let next = if index + 1 < config.capacity {
                Some((index + 1) as u32)
            } else {
                None
            };
            entries.push(Entry::Free { next, generation: 0 });
        }

        Self {
            slots: vec![None; config.slots],
            entries,
            free_head: if config.capacity > 0 { Some(0) } else { None },
            mask: config.slots - 1,
            tick_ns,
            cursor: 0,
            scheduled: 0,
        }
    }

    /// Number of timers currently scheduled.
    #[must_use]
    pub const fn scheduled(&self) -> usize {
        self.scheduled
    }

    /// Schedules `payload` to fire `delay` from now. Returns `None` when
    /// the wheel is at capacity.
    pub fn schedule_after(&mut self, delay: Duration, payload: T) -> Option<TimerId> {
        let delay_ticks = delay.as_nanos() as u64 / self.tick_ns;
        // Relative to the next tick so a zero delay fires on it.
        let deadline = self.cursor + 1 + delay_ticks;
        let slot = (deadline as usize) & self.mask;
        let rounds = (delay_ticks as usize / self.slots.len()) as u32;

        let index = self.free_head?;
        let generation = match self.entries[index as usize] {
            Entry::Free { next, generation } => {
                self.free_head = next;
                generation
            }
            Entry::Occupied(_) => unreachable!("free head points at occupied entry"),
        };

        let head = self.slots[slot];
        self.entries[index as usize] = Entry::Occupied(Node {
            payload: Some(payload),
            generation,
            deadline,
            rounds,
            next: head,
            prev: None,
            slot,
        });
        if let Some(head_index) = head {
            if let Entry::Occupied(head_node) = &mut self.entries[head_index as usize] {
                head_node.prev = Some(index);
            }
        }
        self.slots[slot] = Some(index);
        self.scheduled += 1;

        Some(TimerId { index, generation })
    }

    /// Cancels a timer. Returns `false` for stale handles.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match &self.entries[id.index as usize] {
            Entry::Occupied(node) if node.generation == id.generation => {}
            _ => return false,
        }

        self.unlink(id.index);
        self.release(id.index);
        true
    }

    /// Advances the wheel to `now_ns` and fires due timers.
    pub fn poll(&mut self, now_ns: u64, mut on_fire: impl FnMut(T)) -> usize {
        let now_tick = now_ns / self.tick_ns;
        if now_tick <= self.cursor {
            return 0;
        }

        let mut fired = 0usize;
        // Bound the walk to one revolution: beyond that every slot has
        // already been visited once.
        let ticks = (now_tick - self.cursor).min(self.slots.len() as u64);

        let mut tick = self.cursor + 1;
        let last = self.cursor + ticks;
        while tick <= last {
            let slot = (tick as usize) & self.mask;
            let mut head = self.slots[slot];
            while let Some(index) = head {
                let next = match &self.entries[index as usize] {
                    Entry::Occupied(node) => node.next,
                    Entry::Free { .. } => None,
                };

                let due = match &mut self.entries[index as usize] {
                    Entry::Occupied(node) => {
                        if node.deadline <= now_tick {
                            true
                        } else {
                            // Not this revolution; burn one round.
                            node.rounds = node.rounds.saturating_sub(1);
                            false
                        }
                    }
                    Entry::Free { .. } => false,
                };

                if due {
                    self.unlink(index);
                    if let Entry::Occupied(node) = &mut self.entries[index as usize] {
                        if let Some(payload) = node.payload.take() {
                            on_fire(payload);
                            fired += 1;
                        }
                    }
                    self.release(index);
                }

                head = next;
            }
            tick += 1;
        }

        self.cursor = now_tick;
        fired
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next, slot) = match &self.entries[index as usize] {
            Entry::Occupied(node) => (node.prev, node.next, node.slot),
            Entry::Free { .. } => return,
        };

        match prev {
            Some(prev_index) => {
                if let Entry::Occupied(prev_node) = &mut self.entries[prev_index as usize] {
                    prev_node.next = next;
                }
            }
            None => self.slots[slot] = next,
        }
        if let Some(next_index) = next {
            if let Entry::Occupied(next_node) = &mut self.entries[next_index as usize] {
                next_node.prev = prev;
            }
        }
    }

    fn release(&mut self, index: u32) {
        let generation = match &self.entries[index as usize] {
            Entry::Occupied(node) => node.generation,
            Entry::Free { .. } => return,
        };
        self.entries[index as usize] = Entry::Free {
            next: self.free_head,
            generation: generation.wrapping_add(1),
        };
        self.free_head = Some(index);
        self.scheduled -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    fn wheel(capacity: usize) -> TimerWheel<u32> {
        TimerWheel::new(WheelConfig {
            tick: TICK,
            slots: 8,
            capacity,
        })
    }

    fn ns(ticks: u64) -> u64 {
        ticks * TICK.as_nanos() as u64
    }

    #[test]
    fn fires_due_timers() {
        let mut w = wheel(4);
        w.schedule_after(Duration::ZERO, 10).unwrap();
        w.schedule_after(TICK, 20).unwrap();

        let mut fired = Vec::new();
        w.poll(ns(1), |v| fired.push(v));
        assert_eq!(fired, vec![10]);

        fired.clear();
        w.poll(ns(3), |v| fired.push(v));
        assert_eq!(fired, vec![20]);
        assert_eq!(w.scheduled(), 0);
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut w = wheel(2);
        let id = w.schedule_after(Duration::ZERO, 42).unwrap();
        assert!(w.cancel(id));

        let mut fired = Vec::new();
        w.poll(ns(1), |v| fired.push(v));
        assert!(fired.is_empty());
    }

    #[test]
    fn stale_handle_rejected() {
        let mut w = wheel(1);
        let first = w.schedule_after(Duration::ZERO, 1).unwrap();
        w.poll(ns(1), |_| {});

        let second = w.schedule_after(Duration::ZERO, 2).unwrap();
        assert_ne!(first.generation, second.generation);
        assert!(!w.cancel(first));
        assert!(w.cancel(second));
    }

    #[test]
    fn capacity_exhaustion() {
        let mut w = wheel(1);
        let _ = w.schedule_after(Duration::ZERO, 1).unwrap();
        assert!(w.schedule_after(Duration::ZERO, 2).is_none());
    }

    #[test]
    fn deadline_beyond_revolution_waits_rounds() {
        let mut w = wheel(4);
        // 20 ticks with 8 slots: two full rounds before firing.
        w.schedule_after(TICK * 20, 99).unwrap();

        let mut fired = Vec::new();
        for tick in 1..=20 {
            w.poll(ns(tick), |v| fired.push(v));
            if tick < 20 {
                assert!(fired.is_empty(), "fired early at tick {tick}");
            }
        }
        w.poll(ns(21), |v| fired.push(v));
        assert_eq!(fired, vec![99]);
    }

    #[test]
    fn jump_ahead_fires_intermediate() {
        let mut w = wheel(3);
        w.schedule_after(Duration::ZERO, 1).unwrap();
        w.schedule_after(TICK * 2, 3).unwrap();

        let mut fired = Vec::new();
        w.poll(ns(5), |v| fired.push(v));
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 3]);
    }

    #[test]
    fn long_jump_fires_multi_round_timer() {
        let mut w = wheel(2);
        w.schedule_after(TICK * 30, 7).unwrap();
        let mut fired = Vec::new();
        w.poll(ns(64), |v| fired.push(v));
        assert_eq!(fired, vec![7]);
    }
}
