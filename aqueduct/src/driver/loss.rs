//! Loss detection and NAK feedback delay.
//!
//! Each duty cycle the receiver scans an image for the first gap in
//! `[rebuild, hwm)`. A new gap arms a delay timer from the channel's
//! feedback generator; a gap that survives its delay is NAKed and the
//! timer re-armed. Unicast uses a fixed delay (zero in practice, so the
//! first scan NAKs immediately); multicast randomizes the delay as
//! `rand · grtt · ln(group size)` capped by the max backoff, which keeps
//! a crowd of receivers from NAKing in unison.

use std::time::Duration;

use crate::buffer::LogBuffers;
use crate::buffer::log::{self, frame_length_volatile};
use crate::protocol::frame::FRAME_ALIGNMENT;

/// Produces feedback delays for NAK emission.
pub trait FeedbackDelayGenerator: Send {
    /// Nanoseconds to wait before NAKing a freshly detected gap.
    fn generate(&mut self) -> u64;
}

/// Fixed delay, used for unicast.
pub struct StaticDelayGenerator {
    delay_ns: u64,
}

impl StaticDelayGenerator {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay_ns: delay.as_nanos() as u64,
        }
    }
}

impl FeedbackDelayGenerator for StaticDelayGenerator {
    fn generate(&mut self) -> u64 {
        self.delay_ns
    }
}

/// Randomized multicast NAK suppression delay.
pub struct OptimalMulticastDelayGenerator {
    grtt_ns: f64,
    ln_group_size: f64,
    max_backoff_ns: f64,
}

impl OptimalMulticastDelayGenerator {
    #[must_use]
    pub fn new(grtt: Duration, group_size: u32, max_backoff: Duration) -> Self {
        Self {
            grtt_ns: grtt.as_nanos() as f64,
            ln_group_size: f64::from(group_size.max(2)).ln(),
            max_backoff_ns: max_backoff.as_nanos() as f64,
        }
    }
}

impl FeedbackDelayGenerator for OptimalMulticastDelayGenerator {
    fn generate(&mut self) -> u64 {
        let delay = rand::random::<f64>() * self.grtt_ns * self.ln_group_size;
        delay.min(self.max_backoff_ns) as u64
    }
}

/// One detected gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub term_id: u32,
    pub term_offset: u32,
    pub length: u32,
}

/// Per-image loss detector.
pub struct LossDetector {
    generator: Box<dyn FeedbackDelayGenerator>,
    active: Option<(Gap, u64)>,
}

impl LossDetector {
    #[must_use]
    pub fn new(generator: Box<dyn FeedbackDelayGenerator>) -> Self {
        Self {
            generator,
            active: None,
        }
    }

    /// Scans for loss and emits at most one NAK via `on_nak`.
    /// Returns the work performed.
    pub fn scan(
        &mut self,
        log_buffers: &LogBuffers,
        rebuild: u64,
        hwm: u64,
        now_ns: u64,
        mut on_nak: impl FnMut(Gap),
    ) -> usize {
        if rebuild >= hwm {
            self.active = None;
            return 0;
        }

        let Some(gap) = find_gap(log_buffers, rebuild, hwm) else {
            self.active = None;
            return 0;
        };

        match self.active {
            Some((current, deadline)) if current == gap => {
                if now_ns >= deadline {
                    on_nak(gap);
                    self.active = Some((gap, now_ns + self.generator.generate()));
                    1
                } else {
                    0
                }
            }
            _ => {
                // New gap (or the previous one moved): arm the delay. A
                // zero delay fires on this same scan.
                let delay = self.generator.generate();
                if delay == 0 {
                    on_nak(gap);
                    self.active = Some((gap, now_ns + self.generator.generate().max(1)));
                    1
                } else {
                    self.active = Some((gap, now_ns + delay));
                    0
                }
            }
        }
    }
}

/// Finds the first uncommitted run in `[rebuild, hwm)`.
fn find_gap(log_buffers: &LogBuffers, rebuild: u64, hwm: u64) -> Option<Gap> {
    let term_length = log_buffers.term_length();
    let initial = log_buffers.initial_term_id();
    let term_id = log::compute_term_id(rebuild, term_length, initial);
    let partition = log_buffers.partition_for_term(term_id);
    let term = log_buffers.term_buffer(partition);

    let gap_start = log::compute_term_offset(rebuild, term_length) as usize;
    // The gap begins at the rebuild position by definition; measure its
    // extent up to the next committed frame, the end of term, or the hwm.
    let term_hwm = if hwm >= (rebuild - gap_start as u64) + term_length as u64 {
        term_length
    } else {
        gap_start + (hwm - rebuild) as usize
    };

    if frame_length_volatile(&term, gap_start) != 0 {
        return None;
    }

    let mut end = gap_start + FRAME_ALIGNMENT;
    while end < term_hwm && frame_length_volatile(&term, end) == 0 {
        end += FRAME_ALIGNMENT;
    }

    Some(Gap {
        term_id,
        term_offset: gap_start as u32,
        length: (end - gap_start) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{self, DATA_HEADER_LENGTH, FrameHeader, frame_type};

    const TERM_LENGTH: usize = 64 * 1024;
    const TERM_ID: u32 = 300;

    fn new_log(dir: &std::path::Path) -> LogBuffers {
        LogBuffers::create(dir, TERM_LENGTH, TERM_ID, 1, 2, 1408).unwrap()
    }

    fn insert(log: &LogBuffers, term_offset: u32, payload: &[u8]) {
        let mut bytes = vec![0u8; DATA_HEADER_LENGTH + payload.len()];
        FrameHeader {
            frame_length: (DATA_HEADER_LENGTH + payload.len()) as u32,
            flags: frame::flags::UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset,
            session_id: 1,
            stream_id: 2,
            term_id: TERM_ID,
        }
        .encode(&mut bytes);
        bytes[DATA_HEADER_LENGTH..].copy_from_slice(payload);
        log.insert_frame(TERM_ID, term_offset, &bytes);
    }

    fn immediate_detector() -> LossDetector {
        LossDetector::new(Box::new(StaticDelayGenerator::new(Duration::ZERO)))
    }

    #[test]
    fn no_gap_no_nak() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        let mut detector = immediate_detector();

        let naks = detector.scan(&log, 0, 0, 1, |_| panic!("no nak expected"));
        assert_eq!(naks, 0);
    }

    #[test]
    fn zero_delay_naks_first_scan() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        // Frame at 128 with nothing before it: gap covers [0, 128).
        insert(&log, 128, b"late");

        let mut detector = immediate_detector();
        let mut naks = Vec::new();
        detector.scan(&log, 0, 192, 1, |gap| naks.push(gap));

        assert_eq!(
            naks,
            vec![Gap { term_id: TERM_ID, term_offset: 0, length: 128 }]
        );
    }

    #[test]
    fn delayed_nak_waits_for_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        insert(&log, 64, b"late");

        let mut detector =
            LossDetector::new(Box::new(StaticDelayGenerator::new(Duration::from_nanos(100))));

        let mut naks = Vec::new();
        detector.scan(&log, 0, 128, 10, |gap| naks.push(gap));
        assert!(naks.is_empty(), "gap must wait out its delay");

        detector.scan(&log, 0, 128, 50, |gap| naks.push(gap));
        assert!(naks.is_empty());

        detector.scan(&log, 0, 128, 110, |gap| naks.push(gap));
        assert_eq!(naks.len(), 1);
        assert_eq!(naks[0].term_offset, 0);
        assert_eq!(naks[0].length, 64);
    }

    #[test]
    fn repeated_nak_for_persistent_gap() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        insert(&log, 64, b"late");

        let mut detector = immediate_detector();
        let mut count = 0;
        detector.scan(&log, 0, 128, 10, |_| count += 1);
        detector.scan(&log, 0, 128, 20, |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn gap_cleared_after_fill() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        insert(&log, 64, b"late");

        let mut detector = immediate_detector();
        let mut count = 0;
        detector.scan(&log, 0, 128, 10, |_| count += 1);
        assert_eq!(count, 1);

        // Fill the gap; rebuild would advance past it.
        insert(&log, 0, b"fill");
        let naks = detector.scan(&log, 128, 128, 20, |_| count += 1);
        assert_eq!(naks, 0);
        assert_eq!(count, 1);
    }

    #[test]
    fn multicast_delay_is_bounded() {
        let mut generator = OptimalMulticastDelayGenerator::new(
            Duration::from_millis(10),
            10,
            Duration::from_millis(60),
        );
        for _ in 0..1_000 {
            let delay = generator.generate();
            assert!(delay <= 60_000_000);
        }
    }
}
