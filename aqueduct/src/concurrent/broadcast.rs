//! One-to-many broadcast buffer carrying driver-to-clients events.
//!
//! A single producer (the conductor) writes records tagged with a
//! monotonically increasing byte sequence. Each receiver keeps its own
//! cursor and copies records out, then validates that the producer has
//! not lapped it while it was copying. A lapped receiver resets its
//! cursor to the producer tail and reports the loss; slow or absent
//! consumers lose events silently, which is the intended control-plane
//! semantics.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────────────────────┬────────────────┬──────────┐
//! │ data (power-of-two bytes)     │ tail intent u64│ tail u64 │
//! └───────────────────────────────┴────────────────┴──────────┘
//! ```
//!
//! Record: `length u32 | msg type u32 | payload…`, 8-byte aligned.
//! The producer release-stores the tail intent before touching a record
//! region and the tail after finishing it; receivers validate copies
//! against the intent.

use thiserror::Error;

use super::{AtomicBuffer, CACHE_LINE_LENGTH, align};

/// Bytes reserved after the data region for the two tail counters.
pub const TRAILER_LENGTH: usize = 2 * CACHE_LINE_LENGTH;

/// Bytes of record header (length + message type).
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Record alignment within the buffer.
pub const RECORD_ALIGNMENT: usize = 8;

/// Message type id of padding records (never delivered).
pub const PADDING_MSG_TYPE: u32 = u32::MAX;

/// Errors from broadcast construction and reception.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("broadcast data capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),
    #[error("message of {length} bytes exceeds max of {max}")]
    MessageTooLong { length: usize, max: usize },
    #[error("receiver lapped by transmitter; cursor reset")]
    Lapped,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    capacity: usize,
    mask: u64,
    tail_intent_offset: usize,
    tail_offset: usize,
}

impl Layout {
    fn new(buffer: &AtomicBuffer) -> Result<Self, BroadcastError> {
        let capacity = buffer.capacity().saturating_sub(TRAILER_LENGTH);
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(BroadcastError::CapacityNotPowerOfTwo(capacity));
        }
        Ok(Self {
            capacity,
            mask: (capacity - 1) as u64,
            tail_intent_offset: capacity,
            tail_offset: capacity + CACHE_LINE_LENGTH,
        })
    }
}

/// The single-producer write end.
#[derive(Debug)]
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    layout: Layout,
}

impl BroadcastTransmitter {
    /// Wraps a mapping whose data region must be a power of two.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, BroadcastError> {
        let layout = Layout::new(&buffer)?;
        Ok(Self { buffer, layout })
    }

    /// Largest payload accepted by [`transmit`](Self::transmit).
    #[must_use]
    pub const fn max_msg_length(&self) -> usize {
        self.layout.capacity / 8
    }

    /// Appends one record, overwriting the oldest data if necessary.
    pub fn transmit(&mut self, msg_type: u32, payload: &[u8]) -> Result<(), BroadcastError> {
        if payload.len() > self.max_msg_length() {
            return Err(BroadcastError::MessageTooLong {
                length: payload.len(),
                max: self.max_msg_length(),
            });
        }

        let record_length = RECORD_HEADER_LENGTH + payload.len();
        let aligned = align(record_length, RECORD_ALIGNMENT);

        let mut tail = self.buffer.get_u64(self.layout.tail_offset);
        let mut record_offset = (tail & self.layout.mask) as usize;
        let to_end = self.layout.capacity - record_offset;

        if aligned > to_end {
            // Pad out the remainder so the record starts at offset zero.
            self.buffer.put_u64_release(
                self.layout.tail_intent_offset,
                tail + (to_end + aligned) as u64,
            );
            self.buffer.put_u32(record_offset + 4, PADDING_MSG_TYPE);
            self.buffer.put_u32(record_offset, to_end as u32);
            tail += to_end as u64;
            record_offset = 0;
        } else {
            self.buffer
                .put_u64_release(self.layout.tail_intent_offset, tail + aligned as u64);
        }

        self.buffer.put_u32(record_offset, record_length as u32);
        self.buffer.put_u32(record_offset + 4, msg_type);
        self.buffer
            .put_bytes(record_offset + RECORD_HEADER_LENGTH, payload);
        self.buffer
            .put_u64_release(self.layout.tail_offset, tail + aligned as u64);
        Ok(())
    }
}

/// A copy-out receive end. Each receiver owns its cursor and scratch
/// buffer; any number may read the same mapping.
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    layout: Layout,
    cursor: u64,
    scratch: Vec<u8>,
}

impl BroadcastReceiver {
    /// Wraps a mapping, starting at the current producer tail.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, BroadcastError> {
        let layout = Layout::new(&buffer)?;
        let cursor = buffer.get_u64_acquire(layout.tail_offset);
        Ok(Self {
            buffer,
            layout,
            cursor,
            scratch: Vec::new(),
        })
    }

    /// Receives at most one record, copying it out before delivery.
    ///
    /// Returns `Ok(false)` when no new record is available.
    ///
    /// # Errors
    ///
    /// [`BroadcastError::Lapped`] when the transmitter overwrote
    /// unconsumed records; the cursor has been reset to the producer tail
    /// and subsequent calls resume from there.
    pub fn receive(
        &mut self,
        mut handler: impl FnMut(u32, &[u8]),
    ) -> Result<bool, BroadcastError> {
        loop {
            let tail = self.buffer.get_u64_acquire(self.layout.tail_offset);
            if self.cursor == tail {
                return Ok(false);
            }
            if tail - self.cursor > self.layout.capacity as u64 {
                self.cursor = tail;
                return Err(BroadcastError::Lapped);
            }

            let record_offset = (self.cursor & self.layout.mask) as usize;
            let record_length = self.buffer.get_u32(record_offset) as usize;
            let msg_type = self.buffer.get_u32(record_offset + 4);
            let aligned = align(record_length, RECORD_ALIGNMENT);

            if msg_type == PADDING_MSG_TYPE {
                if !self.validate(self.cursor) {
                    self.cursor = tail;
                    return Err(BroadcastError::Lapped);
                }
                self.cursor += aligned as u64;
                continue;
            }

            let payload_length = record_length.saturating_sub(RECORD_HEADER_LENGTH);
            self.scratch.resize(payload_length, 0);
            self.buffer.get_bytes(
                record_offset + RECORD_HEADER_LENGTH,
                &mut self.scratch[..payload_length],
            );

            // The producer may have wrapped over the record while it was
            // being copied; only deliver if the copy is intact.
            if !self.validate(self.cursor) {
                self.cursor = self.buffer.get_u64_acquire(self.layout.tail_offset);
                return Err(BroadcastError::Lapped);
            }

            self.cursor += aligned as u64;
            handler(msg_type, &self.scratch[..payload_length]);
            return Ok(true);
        }
    }

    /// Whether a record at `cursor` is still within the window the
    /// producer has not begun rewriting.
    fn validate(&self, cursor: u64) -> bool {
        let tail_intent = self.buffer.get_u64_acquire(self.layout.tail_intent_offset);
        tail_intent.saturating_sub(cursor) <= self.layout.capacity as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 256;

    fn pair(backing: &mut Vec<u8>) -> (BroadcastTransmitter, BroadcastReceiver) {
        let buffer = AtomicBuffer::wrap(backing);
        (
            BroadcastTransmitter::new(buffer).unwrap(),
            BroadcastReceiver::new(buffer).unwrap(),
        )
    }

    #[test]
    fn rejects_non_power_of_two() {
        let mut backing = vec![0u8; 100 + TRAILER_LENGTH];
        assert_eq!(
            BroadcastTransmitter::new(AtomicBuffer::wrap(&mut backing)).unwrap_err(),
            BroadcastError::CapacityNotPowerOfTwo(100)
        );
    }

    #[test]
    fn transmit_then_receive() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let (mut tx, mut rx) = pair(&mut backing);

        tx.transmit(5, b"event-a").unwrap();
        tx.transmit(6, b"event-b").unwrap();

        let mut seen = Vec::new();
        while rx.receive(|t, p| seen.push((t, p.to_vec()))).unwrap() {}

        assert_eq!(seen, vec![(5, b"event-a".to_vec()), (6, b"event-b".to_vec())]);
    }

    #[test]
    fn empty_returns_false() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let (_tx, mut rx) = pair(&mut backing);
        assert!(!rx.receive(|_, _| panic!("no record expected")).unwrap());
    }

    #[test]
    fn wraps_through_padding() {
        let mut backing = vec![0u8; 64 + TRAILER_LENGTH];
        let (mut tx, mut rx) = pair(&mut backing);

        // Each record occupies 24 aligned bytes; the third wraps.
        for round in 0u8..3 {
            tx.transmit(u32::from(round) + 1, &[round; 16]).unwrap();
            let mut seen = Vec::new();
            assert!(rx.receive(|t, p| seen.push((t, p.to_vec()))).unwrap());
            assert_eq!(seen[0], (u32::from(round) + 1, vec![round; 16]));
        }
    }

    #[test]
    fn lapped_receiver_resets_to_tail() {
        let mut backing = vec![0u8; 64 + TRAILER_LENGTH];
        let (mut tx, mut rx) = pair(&mut backing);

        // Far more data than the buffer holds while the receiver sleeps.
        for i in 0u32..32 {
            tx.transmit(1, &i.to_le_bytes()).unwrap();
        }

        assert_eq!(
            rx.receive(|_, _| panic!("lapped read must not deliver")).unwrap_err(),
            BroadcastError::Lapped
        );

        // After the reset the receiver picks up new traffic.
        tx.transmit(2, b"fresh").unwrap();
        let mut seen = Vec::new();
        assert!(rx.receive(|t, p| seen.push((t, p.to_vec()))).unwrap());
        assert_eq!(seen[0], (2, b"fresh".to_vec()));
    }

    #[test]
    fn multiple_receivers_see_everything() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let buffer = AtomicBuffer::wrap(&mut backing);
        let mut tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut rx_a = BroadcastReceiver::new(buffer).unwrap();
        let mut rx_b = BroadcastReceiver::new(buffer).unwrap();

        tx.transmit(9, b"shared").unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let mut seen = Vec::new();
            assert!(rx.receive(|t, p| seen.push((t, p.to_vec()))).unwrap());
            assert_eq!(seen[0], (9, b"shared".to_vec()));
        }
    }

    #[test]
    fn rejects_oversized_message() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let (mut tx, _rx) = pair(&mut backing);
        let too_long = vec![0u8; CAPACITY / 8 + 1];
        assert!(matches!(
            tx.transmit(1, &too_long).unwrap_err(),
            BroadcastError::MessageTooLong { .. }
        ));
    }
}
