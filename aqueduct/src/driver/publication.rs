//! Driver-side publication state.
//!
//! A publication record is created by the conductor and shared with the
//! sender as an `Arc`. The log and identity are immutable; the moving
//! positions are atomics written by the sender and mirrored into the
//! counters file so clients can observe them without a syscall.
//!
//! Position discipline: `sender_position ≤ limit ≤ producer position`.
//! The flow-control limit is what the publisher's append path checks
//! (via the limit counter) before claiming log space.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::LogBuffers;
use crate::buffer::counters::CountersReader;
use crate::buffer::log;
use crate::net::UdpChannel;

/// One publication as the driver sees it.
pub struct DriverPublication {
    /// Registration id: the correlation id of the `AddPublication`.
    pub registration_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub channel: UdpChannel,
    pub log: LogBuffers,
    /// Counter id mirroring the sender position.
    pub sender_position_counter: u32,
    /// Counter id mirroring the flow-control limit.
    pub limit_counter: u32,
    sender_position: AtomicU64,
    limit: AtomicU64,
}

impl DriverPublication {
    /// Creates a record around a freshly allocated log.
    #[must_use]
    pub fn new(
        registration_id: u64,
        channel: UdpChannel,
        log: LogBuffers,
        sender_position_counter: u32,
        limit_counter: u32,
    ) -> Self {
        Self {
            registration_id,
            session_id: log.session_id(),
            stream_id: log.stream_id(),
            channel,
            log,
            sender_position_counter,
            limit_counter,
            sender_position: AtomicU64::new(0),
            limit: AtomicU64::new(0),
        }
    }

    /// Next byte position to transmit.
    #[inline]
    #[must_use]
    pub fn sender_position(&self) -> u64 {
        self.sender_position.load(Ordering::Acquire)
    }

    /// Advances the sender position, mirroring it into the counters.
    pub fn update_sender_position(&self, position: u64, counters: &CountersReader) {
        self.sender_position.store(position, Ordering::Release);
        counters.set(self.sender_position_counter, position);
    }

    /// Max position flow control currently permits.
    #[inline]
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Updates the flow-control limit, mirroring it into the counters.
    pub fn update_limit(&self, limit: u64, counters: &CountersReader) {
        self.limit.store(limit, Ordering::Release);
        counters.set(self.limit_counter, limit);
    }

    /// The highest committed position in the log.
    #[must_use]
    pub fn producer_position(&self) -> u64 {
        self.log.producer_position()
    }

    /// End position of the term held by `partition`, used to decide when
    /// a DIRTY partition is safe to zero.
    #[must_use]
    pub fn partition_end_position(&self, partition: usize) -> u64 {
        let term_id = (self.log.raw_tail(partition) >> 32) as u32;
        log::compute_position(
            term_id.wrapping_add(1),
            0,
            self.log.term_length(),
            self.log.initial_term_id(),
        )
    }
}
