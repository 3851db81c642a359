//! Many-to-one ring buffer carrying the to-driver command stream.
//!
//! Multiple client processes claim variable-length records at the tail
//! with a CAS loop; the single consumer (the conductor) dispatches from
//! the head. A record is published by release-storing its length word
//! after the type and payload are written, so the consumer discovers it
//! by acquire-loading a non-zero length. Records never straddle the end
//! of the buffer: a claim that would wrap first writes an explicit
//! padding record covering the remainder.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────────────────────┬──────────┬──────────┬─────────────┐
//! │ data (power-of-two bytes)     │ tail u64 │ head u64 │ correlation │
//! └───────────────────────────────┴──────────┴──────────┴─────────────┘
//!                                 └── each on its own cache line ──────┘
//! ```
//!
//! Record: `length u32 | msg type u32 | payload…`, 8-byte aligned. The
//! length field stores the unaligned record length; consumers advance by
//! the aligned length. The consumer zeroes consumed regions before
//! advancing the head so wrapped producers always claim zeroed memory.

use thiserror::Error;

use super::{AtomicBuffer, CACHE_LINE_LENGTH, align};

/// Bytes reserved after the data region for tail, head and the
/// correlation-id counter.
pub const TRAILER_LENGTH: usize = 3 * CACHE_LINE_LENGTH;

/// Bytes of record header (length + message type).
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Record alignment within the ring.
pub const RECORD_ALIGNMENT: usize = 8;

/// Message type id of padding records (never dispatched).
pub const PADDING_MSG_TYPE: u32 = u32::MAX;

/// Errors from ring construction and writes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring data capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),
    #[error("message of {length} bytes exceeds max of {max}")]
    MessageTooLong { length: usize, max: usize },
    #[error("insufficient capacity in ring")]
    InsufficientCapacity,
    #[error("reserved message type")]
    ReservedMsgType,
}

/// A many-producer single-consumer ring over shared memory.
///
/// The struct is a cheap view; producers and the consumer in different
/// processes each construct one over the same mapping.
#[derive(Debug, Clone, Copy)]
pub struct ManyToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: u64,
    tail_offset: usize,
    head_offset: usize,
    correlation_offset: usize,
}

impl ManyToOneRingBuffer {
    /// Wraps a mapping whose data region (total minus trailer) must be a
    /// power of two.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, RingError> {
        let capacity = buffer.capacity().saturating_sub(TRAILER_LENGTH);
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::CapacityNotPowerOfTwo(capacity));
        }
        Ok(Self {
            buffer,
            capacity,
            mask: (capacity - 1) as u64,
            tail_offset: capacity,
            head_offset: capacity + CACHE_LINE_LENGTH,
            correlation_offset: capacity + 2 * CACHE_LINE_LENGTH,
        })
    }

    /// Capacity of the data region in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload accepted by [`write`](Self::write).
    #[must_use]
    pub const fn max_msg_length(&self) -> usize {
        self.capacity / 8
    }

    /// Allocates the next correlation id. Unique across every producer
    /// sharing the mapping.
    #[must_use]
    pub fn next_correlation_id(&self) -> u64 {
        self.buffer.get_and_add_u64(self.correlation_offset, 1)
    }

    /// Writes one record. Wait-free apart from the claim CAS loop.
    ///
    /// # Errors
    ///
    /// [`RingError::InsufficientCapacity`] when the consumer has fallen
    /// behind; callers retry after backing off.
    pub fn write(&self, msg_type: u32, payload: &[u8]) -> Result<(), RingError> {
        if msg_type == PADDING_MSG_TYPE {
            return Err(RingError::ReservedMsgType);
        }
        if payload.len() > self.max_msg_length() {
            return Err(RingError::MessageTooLong {
                length: payload.len(),
                max: self.max_msg_length(),
            });
        }

        let record_length = RECORD_HEADER_LENGTH + payload.len();
        let aligned = align(record_length, RECORD_ALIGNMENT);

        let (record_offset, padding) = self.claim(aligned)?;

        if let Some((padding_offset, padding_length)) = padding {
            self.buffer.put_u32(padding_offset + 4, PADDING_MSG_TYPE);
            self.buffer
                .put_u32_release(padding_offset, padding_length as u32);
        }

        self.buffer.put_u32(record_offset + 4, msg_type);
        self.buffer.put_bytes(record_offset + RECORD_HEADER_LENGTH, payload);
        self.buffer.put_u32_release(record_offset, record_length as u32);
        Ok(())
    }

    /// CAS-claims `aligned` bytes, returning the record offset and an
    /// optional padding record to emit first.
    fn claim(&self, aligned: usize) -> Result<(usize, Option<(usize, usize)>), RingError> {
        loop {
            let head = self.buffer.get_u64_acquire(self.head_offset);
            let tail = self.buffer.get_u64_acquire(self.tail_offset);

            let tail_index = (tail & self.mask) as usize;
            let to_end = self.capacity - tail_index;
            let required = if aligned <= to_end {
                aligned
            } else {
                // Padding record covers [tail_index, capacity); the real
                // record starts at offset zero.
                to_end + aligned
            };

            if tail.wrapping_sub(head) as usize + required > self.capacity {
                return Err(RingError::InsufficientCapacity);
            }

            if self
                .buffer
                .cas_u64(self.tail_offset, tail, tail + required as u64)
            {
                return if aligned <= to_end {
                    Ok((tail_index, None))
                } else {
                    Ok((0, Some((tail_index, to_end))))
                };
            }
        }
    }

    /// Dispatches up to `limit` records to `handler`, zeroing consumed
    /// regions and advancing the head. Returns the number dispatched.
    pub fn read(&self, limit: usize, mut handler: impl FnMut(u32, &[u8])) -> usize {
        let head = self.buffer.get_u64(self.head_offset);
        let mut bytes_consumed = 0usize;
        let mut count = 0usize;

        while count < limit && bytes_consumed < self.capacity {
            let offset = ((head + bytes_consumed as u64) & self.mask) as usize;
            let record_length = self.buffer.get_u32_acquire(offset) as usize;
            if record_length == 0 {
                break;
            }

            let aligned = align(record_length, RECORD_ALIGNMENT);
            let msg_type = self.buffer.get_u32(offset + 4);
            if msg_type != PADDING_MSG_TYPE {
                handler(
                    msg_type,
                    self.buffer
                        .bytes_at(offset + RECORD_HEADER_LENGTH, record_length - RECORD_HEADER_LENGTH),
                );
                count += 1;
            }

            // Zero before the head advance so wrapping producers always
            // claim zeroed memory.
            self.buffer.set_memory(offset, aligned, 0);
            bytes_consumed += aligned;
        }

        if bytes_consumed > 0 {
            self.buffer
                .put_u64_release(self.head_offset, head + bytes_consumed as u64);
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 1024;

    fn ring(backing: &mut Vec<u8>) -> ManyToOneRingBuffer {
        ManyToOneRingBuffer::new(AtomicBuffer::wrap(backing)).unwrap()
    }

    #[test]
    fn rejects_non_power_of_two() {
        let mut backing = vec![0u8; 1000 + TRAILER_LENGTH];
        assert_eq!(
            ManyToOneRingBuffer::new(AtomicBuffer::wrap(&mut backing)).unwrap_err(),
            RingError::CapacityNotPowerOfTwo(1000)
        );
    }

    #[test]
    fn write_then_read() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let ring = ring(&mut backing);

        ring.write(7, b"hello").unwrap();
        ring.write(8, b"world!").unwrap();

        let mut seen = Vec::new();
        let count = ring.read(10, |msg_type, payload| {
            seen.push((msg_type, payload.to_vec()));
        });

        assert_eq!(count, 2);
        assert_eq!(seen[0], (7, b"hello".to_vec()));
        assert_eq!(seen[1], (8, b"world!".to_vec()));
    }

    #[test]
    fn read_limit_respected() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let ring = ring(&mut backing);

        for i in 0..5u32 {
            ring.write(i + 1, &i.to_le_bytes()).unwrap();
        }

        assert_eq!(ring.read(2, |_, _| {}), 2);
        assert_eq!(ring.read(10, |_, _| {}), 3);
        assert_eq!(ring.read(10, |_, _| {}), 0);
    }

    #[test]
    fn wraps_with_padding_record() {
        let mut backing = vec![0u8; 64 + TRAILER_LENGTH];
        let ring = ring(&mut backing);

        // Three 24-byte records bring the tail to 72 > 64, so the third
        // claim wraps; drain as we go so capacity is available.
        let payload = [0xabu8; 16];
        ring.write(1, &payload).unwrap();
        assert_eq!(ring.read(1, |_, _| {}), 1);
        ring.write(2, &payload).unwrap();
        assert_eq!(ring.read(1, |_, _| {}), 1);

        // Tail is at 48; a 24-byte record does not fit in the 16 bytes to
        // the end, forcing a padding record.
        ring.write(3, &payload).unwrap();
        let mut seen = Vec::new();
        assert_eq!(
            ring.read(10, |msg_type, p| seen.push((msg_type, p.to_vec()))),
            1
        );
        assert_eq!(seen[0], (3, payload.to_vec()));
    }

    #[test]
    fn fills_up_and_rejects() {
        let mut backing = vec![0u8; 64 + TRAILER_LENGTH];
        let ring = ring(&mut backing);

        ring.write(1, &[0u8; 16]).unwrap();
        ring.write(2, &[0u8; 16]).unwrap();
        // 48 of 64 used; a 24-byte claim needs 16 (to end) + 24 more.
        assert_eq!(
            ring.write(3, &[0u8; 16]).unwrap_err(),
            RingError::InsufficientCapacity
        );

        assert_eq!(ring.read(10, |_, _| {}), 2);
        ring.write(3, &[0u8; 16]).unwrap();
    }

    #[test]
    fn rejects_oversized_and_reserved() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let ring = ring(&mut backing);

        let too_long = vec![0u8; CAPACITY / 8 + 1];
        assert!(matches!(
            ring.write(1, &too_long).unwrap_err(),
            RingError::MessageTooLong { .. }
        ));
        assert_eq!(
            ring.write(PADDING_MSG_TYPE, b"x").unwrap_err(),
            RingError::ReservedMsgType
        );
    }

    #[test]
    fn correlation_ids_are_unique() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let ring = ring(&mut backing);

        assert_eq!(ring.next_correlation_id(), 0);
        assert_eq!(ring.next_correlation_id(), 1);
        assert_eq!(ring.next_correlation_id(), 2);
    }

    #[test]
    fn concurrent_producers_preserve_records() {
        let mut backing = vec![0u8; CAPACITY + TRAILER_LENGTH];
        let backing_ptr = AtomicBuffer::wrap(&mut backing);
        let ring = ManyToOneRingBuffer::new(backing_ptr).unwrap();

        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 1000;

        std::thread::scope(|scope| {
            for producer in 0..PRODUCERS {
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = producer * PER_PRODUCER + i;
                        loop {
                            match ring.write(1, &value.to_le_bytes()) {
                                Ok(()) => break,
                                Err(RingError::InsufficientCapacity) => {
                                    std::thread::yield_now();
                                }
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                    }
                });
            }

            scope.spawn(move || {
                let mut seen = vec![false; (PRODUCERS * PER_PRODUCER) as usize];
                let mut total = 0;
                while total < (PRODUCERS * PER_PRODUCER) as usize {
                    total += ring.read(64, |_, payload| {
                        let value =
                            u32::from_le_bytes(payload.try_into().expect("4-byte payload"));
                        assert!(!seen[value as usize], "duplicate record {value}");
                        seen[value as usize] = true;
                    });
                }
            });
        });
    }
}
