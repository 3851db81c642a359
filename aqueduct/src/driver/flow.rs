//! Sender flow control strategies.
//!
//! A strategy folds inbound status messages into a position limit the
//! sender must not transmit beyond. Unicast tracks the single receiver;
//! multicast tracks every receiver seen (keyed by status-message source)
//! and takes the minimum, evicting receivers silent past the timeout so
//! one dead subscriber cannot stall the group forever. Strategies are
//! chosen per channel from the mode at publication creation.

use std::time::Duration;

use crate::buffer::log;
use crate::net::{ChannelMode, Endpoint};
use crate::protocol::frame::StatusMessageFrame;

/// Per-publication flow control.
pub trait SenderFlowControl: Send {
    /// Folds a status message in and returns the new limit position.
    fn on_status_message(&mut self, sm: &StatusMessageFrame, source: Endpoint, now_ns: u64)
    -> u64;

    /// Periodic upkeep (eviction); returns the current limit position.
    fn on_idle(&mut self, now_ns: u64) -> u64;

    /// Whether any receiver is currently known.
    fn has_receivers(&self) -> bool;
}

/// Builds the strategy for a channel mode.
#[must_use]
pub fn flow_control_for(
    mode: ChannelMode,
    initial_term_id: u32,
    term_length: usize,
    receiver_timeout: Duration,
) -> Box<dyn SenderFlowControl> {
    match mode {
        ChannelMode::Unicast => Box::new(UnicastFlowControl::new(initial_term_id, term_length)),
        ChannelMode::Multicast => Box::new(MinMulticastFlowControl::new(
            initial_term_id,
            term_length,
            receiver_timeout,
        )),
    }
}

fn sm_limit(sm: &StatusMessageFrame, initial_term_id: u32, term_length: usize) -> u64 {
    log::compute_position(
        sm.consumption_term_id,
        sm.consumption_term_offset,
        term_length,
        initial_term_id,
    ) + u64::from(sm.receiver_window)
}

/// Single-receiver flow control.
pub struct UnicastFlowControl {
    initial_term_id: u32,
    term_length: usize,
    limit: u64,
    connected: bool,
}

impl UnicastFlowControl {
    #[must_use]
    pub const fn new(initial_term_id: u32, term_length: usize) -> Self {
        Self {
            initial_term_id,
            term_length,
            limit: 0,
            connected: false,
        }
    }
}

impl SenderFlowControl for UnicastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessageFrame,
        _source: Endpoint,
        _now_ns: u64,
    ) -> u64 {
        self.connected = true;
        // The limit never retreats: a reordered SM must not shrink the
        // window below data already released for transmission.
        self.limit = self
            .limit
            .max(sm_limit(sm, self.initial_term_id, self.term_length));
        self.limit
    }

    fn on_idle(&mut self, _now_ns: u64) -> u64 {
        self.limit
    }

    fn has_receivers(&self) -> bool {
        self.connected
    }
}

struct ReceiverState {
    source: Endpoint,
    limit: u64,
    last_sm_ns: u64,
}

/// Slowest-receiver multicast flow control with timeout eviction.
pub struct MinMulticastFlowControl {
    initial_term_id: u32,
    term_length: usize,
    receiver_timeout_ns: u64,
    receivers: Vec<ReceiverState>,
}

impl MinMulticastFlowControl {
    #[must_use]
    pub fn new(initial_term_id: u32, term_length: usize, receiver_timeout: Duration) -> Self {
        Self {
            initial_term_id,
            term_length,
            receiver_timeout_ns: receiver_timeout.as_nanos() as u64,
            receivers: Vec::new(),
        }
    }

    fn min_limit(&self) -> u64 {
        self.receivers.iter().map(|r| r.limit).min().unwrap_or(0)
    }
}

impl SenderFlowControl for MinMulticastFlowControl {
    fn on_status_message(&mut self, sm: &StatusMessageFrame, source: Endpoint, now_ns: u64) -> u64 {
        let limit = sm_limit(sm, self.initial_term_id, self.term_length);

        match self.receivers.iter_mut().find(|r| r.source == source) {
            Some(receiver) => {
                receiver.limit = receiver.limit.max(limit);
                receiver.last_sm_ns = now_ns;
            }
            None => self.receivers.push(ReceiverState {
                source,
                limit,
                last_sm_ns: now_ns,
            }),
        }

        self.min_limit()
    }

    fn on_idle(&mut self, now_ns: u64) -> u64 {
        let timeout = self.receiver_timeout_ns;
        self.receivers
            .retain(|r| now_ns.saturating_sub(r.last_sm_ns) < timeout);
        self.min_limit()
    }

    fn has_receivers(&self) -> bool {
        !self.receivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERM_LENGTH: usize = 64 * 1024;
    const INITIAL_TERM_ID: u32 = 40;

    fn sm(term_id: u32, term_offset: u32, window: u32) -> StatusMessageFrame {
        StatusMessageFrame {
            session_id: 1,
            stream_id: 2,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window,
        }
    }

    #[test]
    fn unicast_tracks_single_receiver() {
        let mut flow = UnicastFlowControl::new(INITIAL_TERM_ID, TERM_LENGTH);
        assert!(!flow.has_receivers());
        assert_eq!(flow.on_idle(0), 0);

        let limit = flow.on_status_message(&sm(INITIAL_TERM_ID, 0, 1024), Endpoint::localhost(1), 0);
        assert_eq!(limit, 1024);
        assert!(flow.has_receivers());

        let limit =
            flow.on_status_message(&sm(INITIAL_TERM_ID, 4096, 1024), Endpoint::localhost(1), 1);
        assert_eq!(limit, 5120);
    }

    #[test]
    fn unicast_limit_never_retreats() {
        let mut flow = UnicastFlowControl::new(INITIAL_TERM_ID, TERM_LENGTH);
        flow.on_status_message(&sm(INITIAL_TERM_ID, 4096, 1024), Endpoint::localhost(1), 0);
        // A stale, reordered SM arrives late.
        let limit = flow.on_status_message(&sm(INITIAL_TERM_ID, 0, 1024), Endpoint::localhost(1), 1);
        assert_eq!(limit, 5120);
    }

    #[test]
    fn multicast_takes_minimum() {
        let mut flow =
            MinMulticastFlowControl::new(INITIAL_TERM_ID, TERM_LENGTH, Duration::from_secs(2));

        flow.on_status_message(&sm(INITIAL_TERM_ID, 8192, 1024), Endpoint::localhost(1), 0);
        let limit = flow.on_status_message(&sm(INITIAL_TERM_ID, 1024, 1024), Endpoint::localhost(2), 0);
        assert_eq!(limit, 2048);
        assert!(flow.has_receivers());
    }

    #[test]
    fn multicast_evicts_silent_receivers() {
        let timeout = Duration::from_millis(100);
        let mut flow = MinMulticastFlowControl::new(INITIAL_TERM_ID, TERM_LENGTH, timeout);

        flow.on_status_message(&sm(INITIAL_TERM_ID, 1024, 1024), Endpoint::localhost(1), 0);
        flow.on_status_message(
            &sm(INITIAL_TERM_ID, 8192, 1024),
            Endpoint::localhost(2),
            50_000_000,
        );

        // Receiver 1 falls silent past the timeout; the faster receiver
        // now defines the limit.
        let limit = flow.on_idle(120_000_000);
        assert_eq!(limit, 9216);

        // Everyone silent: no receivers, limit collapses.
        let limit = flow.on_idle(500_000_000);
        assert_eq!(limit, 0);
        assert!(!flow.has_receivers());
    }

    #[test]
    fn positions_span_terms() {
        let mut flow = UnicastFlowControl::new(INITIAL_TERM_ID, TERM_LENGTH);
        let limit = flow.on_status_message(
            &sm(INITIAL_TERM_ID + 2, 128, 4096),
            Endpoint::localhost(1),
            0,
        );
        assert_eq!(limit, 2 * TERM_LENGTH as u64 + 128 + 4096);
    }

    #[test]
    fn factory_selects_by_mode() {
        let unicast = flow_control_for(
            ChannelMode::Unicast,
            INITIAL_TERM_ID,
            TERM_LENGTH,
            Duration::from_secs(2),
        );
        assert!(!unicast.has_receivers());

        let multicast = flow_control_for(
            ChannelMode::Multicast,
            INITIAL_TERM_ID,
            TERM_LENGTH,
            Duration::from_secs(2),
        );
        assert!(!multicast.has_receivers());
    }
}
