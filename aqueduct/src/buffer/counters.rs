//! Position indicators and diagnostic counters.
//!
//! Counters live in two mmap'd files: a labels file describing each
//! allocated counter and a values file holding one cache-line-padded
//! 64-bit value per counter. The driver allocates and frees ids; any
//! process mapping the values file can read or update a value by id,
//! which is how a subscriber advertises its consumption position back to
//! the driver without a syscall.

use thiserror::Error;

use crate::concurrent::{AtomicBuffer, CACHE_LINE_LENGTH};

/// Bytes reserved per label: a u32 length followed by UTF-8 bytes.
pub const LABEL_LENGTH: usize = 128;

/// Bytes reserved per value.
pub const VALUE_LENGTH: usize = CACHE_LINE_LENGTH;

/// Errors from counter allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CountersError {
    #[error("counters capacity of {0} exhausted")]
    Exhausted(usize),
    #[error("label of {length} bytes exceeds max of {max}")]
    LabelTooLong { length: usize, max: usize },
}

/// Allocates counter ids and maintains the labels file. Owned by the
/// conductor; everything else touches counters through
/// [`CountersReader`].
pub struct CountersManager {
    labels: AtomicBuffer,
    values: AtomicBuffer,
    free_list: Vec<u32>,
    next_id: u32,
    capacity: usize,
}

impl CountersManager {
    /// Wraps the labels and values buffers.
    #[must_use]
    pub fn new(labels: AtomicBuffer, values: AtomicBuffer) -> Self {
        let capacity = (labels.capacity() / LABEL_LENGTH).min(values.capacity() / VALUE_LENGTH);
        Self {
            labels,
            values,
            free_list: Vec::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Allocates a counter, writing its label and zeroing its value.
    pub fn allocate(&mut self, label: &str) -> Result<u32, CountersError> {
        let bytes = label.as_bytes();
        if bytes.len() > LABEL_LENGTH - 4 {
            return Err(CountersError::LabelTooLong {
                length: bytes.len(),
                max: LABEL_LENGTH - 4,
            });
        }

        let id = match self.free_list.pop() {
            Some(id) => id,
            None => {
                if self.next_id as usize >= self.capacity {
                    return Err(CountersError::Exhausted(self.capacity));
                }
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };

        let label_offset = id as usize * LABEL_LENGTH;
        self.labels.set_memory(label_offset, LABEL_LENGTH, 0);
        self.labels.put_bytes(label_offset + 4, bytes);
        self.labels.put_u32_release(label_offset, bytes.len() as u32);

        self.values.put_u64_release(value_offset(id), 0);
        Ok(id)
    }

    /// Frees a counter for reuse, blanking its label.
    pub fn free(&mut self, id: u32) {
        self.labels
            .set_memory(id as usize * LABEL_LENGTH, LABEL_LENGTH, 0);
        self.values.put_u64_release(value_offset(id), 0);
        self.free_list.push(id);
    }

    /// Reads a label back, if the id is allocated.
    #[must_use]
    pub fn label(&self, id: u32) -> Option<String> {
        let label_offset = id as usize * LABEL_LENGTH;
        let length = self.labels.get_u32_acquire(label_offset) as usize;
        if length == 0 || length > LABEL_LENGTH - 4 {
            return None;
        }
        let mut bytes = vec![0u8; length];
        self.labels.get_bytes(label_offset + 4, &mut bytes);
        String::from_utf8(bytes).ok()
    }

    /// A reader over this manager's values buffer.
    #[must_use]
    pub fn reader(&self) -> CountersReader {
        CountersReader::new(self.values)
    }
}

/// Byte offset of a counter's value.
#[inline]
#[must_use]
pub const fn value_offset(id: u32) -> usize {
    id as usize * VALUE_LENGTH
}

/// Reads and updates counter values by id. Cheap to copy into any agent
/// or client that holds the values mapping.
#[derive(Clone, Copy)]
pub struct CountersReader {
    values: AtomicBuffer,
}

impl CountersReader {
    /// Wraps a values buffer.
    #[must_use]
    pub const fn new(values: AtomicBuffer) -> Self {
        Self { values }
    }

    /// Acquire-loads a counter value.
    #[inline]
    #[must_use]
    pub fn get(&self, id: u32) -> u64 {
        self.values.get_u64_acquire(value_offset(id))
    }

    /// Release-stores a counter value.
    #[inline]
    pub fn set(&self, id: u32, value: u64) {
        self.values.put_u64_release(value_offset(id), value);
    }

    /// Atomic add, for diagnostic counters with multiple writers.
    #[inline]
    pub fn increment(&self, id: u32) {
        self.values.get_and_add_u64(value_offset(id), 1);
    }
}
