//! NAK-driven retransmission.
//!
//! Each NAK opens (or refreshes nothing on, if already open) a
//! retransmit action: wait the configured delay, resend the range from
//! the live log, then linger. NAKs arriving for a range already delayed
//! or lingering are suppressed, so a crowd of receivers missing the same
//! datagram costs one retransmission. The action table is bounded;
//! overflow NAKs are dropped and the receivers simply ask again.

use std::time::Duration;

/// Bound on simultaneously active retransmit actions per publication.
pub const MAX_RETRANSMITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Delayed,
    Lingering,
}

#[derive(Debug, Clone, Copy)]
struct Action {
    term_id: u32,
    term_offset: u32,
    length: u32,
    state: State,
    deadline_ns: u64,
}

/// Per-publication retransmit state machine.
pub struct RetransmitHandler {
    delay_ns: u64,
    linger_ns: u64,
    actions: Vec<Action>,
}

impl RetransmitHandler {
    #[must_use]
    pub fn new(delay: Duration, linger: Duration) -> Self {
        Self {
            delay_ns: delay.as_nanos() as u64,
            linger_ns: linger.as_nanos() as u64,
            actions: Vec::with_capacity(MAX_RETRANSMITS),
        }
    }

    /// Number of active actions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.actions.len()
    }

    /// Handles one NAK. Overlapping or overflowing requests are dropped.
    pub fn on_nak(&mut self, term_id: u32, term_offset: u32, length: u32, now_ns: u64) {
        let overlaps = self.actions.iter().any(|a| {
            a.term_id == term_id
                && term_offset < a.term_offset + a.length
                && a.term_offset < term_offset + length
        });
        if overlaps || self.actions.len() >= MAX_RETRANSMITS {
            return;
        }

        self.actions.push(Action {
            term_id,
            term_offset,
            length,
            state: State::Delayed,
            deadline_ns: now_ns + self.delay_ns,
        });
    }

    /// Fires due actions through `resend(term_id, term_offset, length)`
    /// and expires finished lingers. Returns resends performed.
    pub fn poll(&mut self, now_ns: u64, mut resend: impl FnMut(u32, u32, u32)) -> usize {
        let mut sent = 0usize;
        let linger_ns = self.linger_ns;

        for action in &mut self.actions {
            if action.state == State::Delayed && now_ns >= action.deadline_ns {
                resend(action.term_id, action.term_offset, action.length);
                action.state = State::Lingering;
                action.deadline_ns = now_ns + linger_ns;
                sent += 1;
            }
        }

        self.actions
            .retain(|a| !(a.state == State::Lingering && now_ns >= a.deadline_ns));
        sent
    }
}
