//! Driver-side image state: one remote publisher as seen by a
//! subscription.
//!
//! The receiver writes arriving frames into the image log at their
//! addressed offsets and advances `rebuild_position` over the contiguous
//! prefix; `hwm_position` tracks the furthest byte seen. The gap between
//! them is what the loss detector NAKs. Positions are image-local: the
//! log's initial term id is the term that was active when the image
//! joined, so the join position is zero, while term ids on the wire stay
//! the publisher's.
//!
//! Lifecycle: INIT → ACTIVE → INACTIVE (no traffic) → LINGER → DELETED.
//! The receiver drives the traffic-based transitions; the conductor owns
//! linger and deletion.

use std::sync::atomic::{AtomicU64, AtomicU32, Ordering};

use crate::buffer::LogBuffers;
use crate::buffer::log::{self, Insert, frame_length_volatile};
use crate::concurrent::align;
use crate::net::{Endpoint, UdpChannel};
use crate::protocol::frame::{DATA_HEADER_LENGTH, FRAME_ALIGNMENT, frame_type, offsets};

/// Lifecycle states.
pub const STATE_INIT: u32 = 0;
pub const STATE_ACTIVE: u32 = 1;
pub const STATE_INACTIVE: u32 = 2;
pub const STATE_LINGER: u32 = 3;

/// Outcome of offering a received frame to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Frame written into the log.
    Inserted(usize),
    /// Zero-payload DATA frame: liveness and hwm only.
    Heartbeat,
    /// Already present (idempotent NAK repair).
    Duplicate,
    /// Outside the rebuild window; dropped.
    OutOfWindow,
    /// Addressed partition is awaiting cleaning; dropped.
    NotClean,
}

/// One image as the driver sees it.
pub struct DriverImage {
    /// Conductor-assigned id, echoed in client-facing image events.
    pub correlation_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub channel: UdpChannel,
    /// Where SMs and NAKs for this image are sent.
    pub control_address: Endpoint,
    pub log: LogBuffers,
    /// Counter the subscriber advances as it consumes.
    pub subscriber_position_counter: u32,
    hwm_position: AtomicU64,
    rebuild_position: AtomicU64,
    last_packet_ns: AtomicU64,
    state: AtomicU32,
}

impl DriverImage {
    /// Creates an image record around a freshly allocated log.
    #[must_use]
    pub fn new(
        correlation_id: u64,
        channel: UdpChannel,
        control_address: Endpoint,
        log: LogBuffers,
        subscriber_position_counter: u32,
        now_ns: u64,
    ) -> Self {
        Self {
            correlation_id,
            session_id: log.session_id(),
            stream_id: log.stream_id(),
            channel,
            control_address,
            log,
            subscriber_position_counter,
            hwm_position: AtomicU64::new(0),
            rebuild_position: AtomicU64::new(0),
            last_packet_ns: AtomicU64::new(now_ns),
            state: AtomicU32::new(STATE_INIT),
        }
    }

    /// Furthest position any frame has reached.
    #[inline]
    #[must_use]
    pub fn hwm_position(&self) -> u64 {
        self.hwm_position.load(Ordering::Acquire)
    }

    /// End of the contiguous committed prefix.
    #[inline]
    #[must_use]
    pub fn rebuild_position(&self) -> u64 {
        self.rebuild_position.load(Ordering::Acquire)
    }

    /// Timestamp of the last packet from the source.
    #[inline]
    #[must_use]
    pub fn last_packet_ns(&self) -> u64 {
        self.last_packet_ns.load(Ordering::Acquire)
    }

    /// Current lifecycle state word.
    #[inline]
    #[must_use]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Moves to a new lifecycle state.
    pub fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }

    /// Offers a received DATA or PAD frame.
    pub fn insert_packet(
        &self,
        term_id: u32,
        term_offset: u32,
        frame_bytes: &[u8],
        now_ns: u64,
    ) -> PacketOutcome {
        self.last_packet_ns.store(now_ns, Ordering::Release);
        if self.state() == STATE_INIT || self.state() == STATE_INACTIVE {
            self.set_state(STATE_ACTIVE);
        }

        if frame_bytes.len() < DATA_HEADER_LENGTH {
            return PacketOutcome::OutOfWindow;
        }

        let term_length = self.log.term_length();
        let initial = self.log.initial_term_id();
        let position = log::compute_position(term_id, term_offset, term_length, initial);
        let rebuild = self.rebuild_position();

        let frame_type_word = u16::from_be_bytes(
            frame_bytes[offsets::FRAME_TYPE..offsets::FRAME_TYPE + 2]
                .try_into()
                .expect("header length checked by caller"),
        );
        let frame_length = u32::from_be_bytes(
            frame_bytes[..4].try_into().expect("header length checked"),
        ) as usize;

        // Heartbeats (zero-payload DATA) advertise the producer's
        // position without carrying data; they raise the hwm so loss
        // shows up even in silence.
        if frame_type_word == frame_type::DATA && frame_length == DATA_HEADER_LENGTH {
            self.bump_hwm(position);
            return PacketOutcome::Heartbeat;
        }

        // Window: the term being rebuilt and the one after it.
        if position + frame_length as u64 <= rebuild {
            return PacketOutcome::Duplicate;
        }
        if position >= rebuild + 2 * term_length as u64 {
            return PacketOutcome::OutOfWindow;
        }

        match self.log.insert_frame(term_id, term_offset, frame_bytes) {
            Insert::Inserted(aligned) => {
                self.bump_hwm(position + aligned as u64);
                PacketOutcome::Inserted(aligned)
            }
            Insert::Duplicate => PacketOutcome::Duplicate,
            Insert::OutOfRange => PacketOutcome::OutOfWindow,
            Insert::NotClean => PacketOutcome::NotClean,
        }
    }

    fn bump_hwm(&self, candidate: u64) {
        let mut current = self.hwm_position.load(Ordering::Relaxed);
        while candidate > current {
            match self.hwm_position.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Advances the rebuild position over newly contiguous frames,
    /// rotating the log when a term completes. Returns bytes advanced.
    pub fn rebuild(&self) -> usize {
        let term_length = self.log.term_length();
        let initial = self.log.initial_term_id();
        let mut position = self.rebuild_position();
        let mut advanced = 0usize;

        loop {
            let term_id = log::compute_term_id(position, term_length, initial);
            let offset = log::compute_term_offset(position, term_length) as usize;
            let partition = self.log.partition_for_term(term_id);

            match self.log.partition_status(partition) {
                // The entered partition still holds a retired term;
                // rebuilding resumes once the conductor has zeroed it.
                log::STATUS_DIRTY => break,
                // First entry into a fresh term: retire the previous
                // partition and activate this one. The status flip makes
                // this happen exactly once per term.
                log::STATUS_CLEAN if offset == 0 && position > 0 => {
                    self.log.rotate_after(term_id.wrapping_sub(1));
                }
                _ => {}
            }

            let term = self.log.term_buffer(partition);
            let frame_length = frame_length_volatile(&term, offset) as usize;
            if frame_length == 0 {
                break;
            }
            let aligned = align(frame_length, FRAME_ALIGNMENT);
            position += aligned as u64;
            advanced += aligned;
        }

        if advanced > 0 {
            self.rebuild_position.store(position, Ordering::Release);
        }
        advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{self, FrameHeader, frame_type};

    const TERM_LENGTH: usize = 64 * 1024;
    const ACTIVE_TERM: u32 = 200;

    fn image(dir: &std::path::Path) -> DriverImage {
        let channel = UdpChannel::parse("udp://127.0.0.1:40124").unwrap();
        let log = LogBuffers::create(dir, TERM_LENGTH, ACTIVE_TERM, 9, 3, 1408).unwrap();
        DriverImage::new(1, channel, Endpoint::localhost(50000), log, 0, 0)
    }

    fn data_frame(term_id: u32, term_offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; DATA_HEADER_LENGTH + payload.len()];
        FrameHeader {
            frame_length: (DATA_HEADER_LENGTH + payload.len()) as u32,
            flags: frame::flags::UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset,
            session_id: 9,
            stream_id: 3,
            term_id,
        }
        .encode(&mut bytes);
        bytes[DATA_HEADER_LENGTH..].copy_from_slice(payload);
        bytes
    }

    #[test]
    fn in_order_frames_advance_rebuild_to_hwm() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());

        let first = data_frame(ACTIVE_TERM, 0, b"aaaa");
        let second = data_frame(ACTIVE_TERM, 64, b"bbbb");

        assert_eq!(image.insert_packet(ACTIVE_TERM, 0, &first, 1), PacketOutcome::Inserted(64));
        assert_eq!(image.insert_packet(ACTIVE_TERM, 64, &second, 2), PacketOutcome::Inserted(64));
        assert_eq!(image.hwm_position(), 128);

        assert_eq!(image.rebuild(), 128);
        assert_eq!(image.rebuild_position(), 128);
        assert_eq!(image.state(), STATE_ACTIVE);
    }

    #[test]
    fn gap_leaves_rebuild_behind_hwm() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());

        let first = data_frame(ACTIVE_TERM, 0, b"aaaa");
        let third = data_frame(ACTIVE_TERM, 128, b"cccc");

        image.insert_packet(ACTIVE_TERM, 0, &first, 1);
        image.insert_packet(ACTIVE_TERM, 128, &third, 2);

        image.rebuild();
        assert_eq!(image.rebuild_position(), 64);
        assert_eq!(image.hwm_position(), 192);

        // Filling the gap lets rebuild catch up.
        let second = data_frame(ACTIVE_TERM, 64, b"bbbb");
        assert_eq!(
            image.insert_packet(ACTIVE_TERM, 64, &second, 3),
            PacketOutcome::Inserted(64)
        );
        image.rebuild();
        assert_eq!(image.rebuild_position(), 192);
    }

    #[test]
    fn repair_after_gap_fill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());

        let frame_bytes = data_frame(ACTIVE_TERM, 0, b"payload");
        assert!(matches!(
            image.insert_packet(ACTIVE_TERM, 0, &frame_bytes, 1),
            PacketOutcome::Inserted(_)
        ));
        assert_eq!(
            image.insert_packet(ACTIVE_TERM, 0, &frame_bytes, 2),
            PacketOutcome::Duplicate
        );
    }

    #[test]
    fn heartbeat_raises_hwm_without_data() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());

        let mut heartbeat = Vec::new();
        frame::encode_heartbeat(&mut heartbeat, 9, 3, ACTIVE_TERM, 256);
        assert_eq!(
            image.insert_packet(ACTIVE_TERM, 256, &heartbeat, 5),
            PacketOutcome::Heartbeat
        );
        assert_eq!(image.hwm_position(), 256);
        assert_eq!(image.rebuild_position(), 0);
        assert_eq!(image.last_packet_ns(), 5);
    }

    #[test]
    fn far_future_frame_is_out_of_window() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());

        let frame_bytes = data_frame(ACTIVE_TERM + 2, 0, b"future");
        assert_eq!(
            image.insert_packet(ACTIVE_TERM + 2, 0, &frame_bytes, 1),
            PacketOutcome::OutOfWindow
        );
    }

    #[test]
    fn rebuild_rotates_across_term_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());

        // Fill the whole first term with 1024-byte frames.
        let payload = vec![0xabu8; 1024 - DATA_HEADER_LENGTH];
        let mut offset = 0u32;
        while (offset as usize) < TERM_LENGTH {
            let frame_bytes = data_frame(ACTIVE_TERM, offset, &payload);
            assert!(matches!(
                image.insert_packet(ACTIVE_TERM, offset, &frame_bytes, 1),
                PacketOutcome::Inserted(_)
            ));
            offset += 1024;
        }
        image.rebuild();
        assert_eq!(image.rebuild_position(), TERM_LENGTH as u64);

        // First frame of the next term.
        let frame_bytes = data_frame(ACTIVE_TERM + 1, 0, &payload);
        assert!(matches!(
            image.insert_packet(ACTIVE_TERM + 1, 0, &frame_bytes, 2),
            PacketOutcome::Inserted(_)
        ));
        image.rebuild();
        assert_eq!(image.rebuild_position(), TERM_LENGTH as u64 + 1024);
        assert_eq!(image.log.partition_status(0), log::STATUS_DIRTY);
        assert_eq!(image.log.active_index(), 1);
    }
}
