//! The shared log-buffer set: three term files plus a metadata file.
//!
//! A log rotates through its three partitions: the active partition takes
//! appends, the previous one drains and is zeroed (DIRTY → CLEAN) by the
//! conductor, and the third stands ready. Exactly one partition is ACTIVE
//! at any instant.
//!
//! Producers claim space with a fetch-add on the active partition's raw
//! tail, which packs `term id << 32 | term offset` so a rotation is a
//! single 64-bit store. A claim that would cross the end of the term pads
//! the remainder with a PAD frame, rotates the active index with a CAS
//! (exactly one producer wins; the rest observe the new index and retry),
//! and claims again in the fresh term. A producer that finds the next
//! partition still DIRTY reports `AdminAction` back-pressure instead.
//!
//! Frames are committed by release-storing the big-endian frame-length
//! word after the rest of the frame; scans acquire-load that word and
//! stop at zero. Committed frames are stored in wire format, so the
//! sender transmits term regions without re-encoding.

use std::path::Path;

use crate::concurrent::{AtomicBuffer, align};
use crate::protocol::frame::{
    self, DATA_HEADER_LENGTH, FRAME_ALIGNMENT, FrameHeader, frame_type, offsets,
};

use super::mapped::{MappedFile, MappedFileError};

/// Partitions in a log rotation.
pub const PARTITION_COUNT: usize = 3;

/// Smallest supported term.
pub const TERM_MIN_LENGTH: usize = 64 * 1024;

/// Metadata region length.
pub const LOG_META_LENGTH: usize = 512;

/// Partition status words.
pub const STATUS_CLEAN: u32 = 0;
pub const STATUS_ACTIVE: u32 = 1;
pub const STATUS_DIRTY: u32 = 2;

/// File names within a log directory.
pub const META_FILE: &str = "meta";

const TAIL_OFFSET_BASE: usize = 0;
const ACTIVE_INDEX_OFFSET: usize = 192;
const STATUS_OFFSET_BASE: usize = 256;
const INITIAL_TERM_ID_OFFSET: usize = 448;
const TERM_LENGTH_OFFSET: usize = 452;
const SESSION_ID_OFFSET: usize = 456;
const STREAM_ID_OFFSET: usize = 460;
const MTU_LENGTH_OFFSET: usize = 464;

const fn tail_offset(partition: usize) -> usize {
    TAIL_OFFSET_BASE + partition * 64
}

const fn status_offset(partition: usize) -> usize {
    STATUS_OFFSET_BASE + partition * 64
}

/// Result of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Space granted at `(term_id, term_offset)`.
    Granted { term_id: u32, term_offset: u32 },
    /// The ring of terms is saturated; retry after the consumer advances.
    BackPressured,
    /// The next term has not been cleaned yet; retry shortly.
    AdminAction,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// The position after the appended message.
    Position(u64),
    /// Flow-control limit reached.
    BackPressured,
    /// The next term has not been cleaned yet.
    AdminAction,
    /// The message exceeds the maximum for this term length.
    MessageTooLong { length: usize, max: usize },
}

/// Result of inserting a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Frame written; carries the aligned frame length.
    Inserted(usize),
    /// A frame is already committed at this offset.
    Duplicate,
    /// The frame does not fit the addressed term.
    OutOfRange,
    /// The addressed partition has not been cleaned yet.
    NotClean,
}

/// Computes the 64-bit stream position of `(term_id, term_offset)`.
#[inline]
#[must_use]
pub fn compute_position(term_id: u32, term_offset: u32, term_length: usize, initial_term_id: u32) -> u64 {
    let term_count = u64::from(term_id.wrapping_sub(initial_term_id));
    term_count * term_length as u64 + u64::from(term_offset)
}

/// The term id holding `position`.
#[inline]
#[must_use]
pub fn compute_term_id(position: u64, term_length: usize, initial_term_id: u32) -> u32 {
    initial_term_id.wrapping_add((position / term_length as u64) as u32)
}

/// The offset of `position` within its term.
#[inline]
#[must_use]
pub fn compute_term_offset(position: u64, term_length: usize) -> u32 {
    (position % term_length as u64) as u32
}

/// A mapped log-buffer set.
pub struct LogBuffers {
    terms: [MappedFile; PARTITION_COUNT],
    meta: MappedFile,
    term_length: usize,
}

impl LogBuffers {
    /// Creates the log directory, its three term files and metadata, and
    /// marks partition zero active at `initial_term_id`.
    pub fn create(
        dir: &Path,
        term_length: usize,
        initial_term_id: u32,
        session_id: u32,
        stream_id: u32,
        mtu_length: usize,
    ) -> Result<Self, MappedFileError> {
        assert!(term_length.is_power_of_two() && term_length >= TERM_MIN_LENGTH);
        std::fs::create_dir_all(dir).map_err(|source| MappedFileError::Io {
            op: "create_dir",
            path: dir.to_path_buf(),
            source,
        })?;

        let terms = [
            MappedFile::create(&dir.join("term-0"), term_length)?,
            MappedFile::create(&dir.join("term-1"), term_length)?,
            MappedFile::create(&dir.join("term-2"), term_length)?,
        ];
        let meta = MappedFile::create(&dir.join(META_FILE), LOG_META_LENGTH)?;

        let meta_buffer = meta.buffer();
        meta_buffer.put_u32(INITIAL_TERM_ID_OFFSET, initial_term_id);
        meta_buffer.put_u32(TERM_LENGTH_OFFSET, term_length as u32);
        meta_buffer.put_u32(SESSION_ID_OFFSET, session_id);
        meta_buffer.put_u32(STREAM_ID_OFFSET, stream_id);
        meta_buffer.put_u32(MTU_LENGTH_OFFSET, mtu_length as u32);
        meta_buffer.put_u64(tail_offset(0), u64::from(initial_term_id) << 32);
        meta_buffer.put_u32(status_offset(0), STATUS_ACTIVE);
        meta_buffer.put_u32_release(ACTIVE_INDEX_OFFSET, 0);

        Ok(Self {
            terms,
            meta,
            term_length,
        })
    }

    /// Opens an existing log directory created by the driver.
    pub fn open(dir: &Path) -> Result<Self, MappedFileError> {
        let meta = MappedFile::open(&dir.join(META_FILE), LOG_META_LENGTH)?;
        let term_length = meta.buffer().get_u32(TERM_LENGTH_OFFSET) as usize;
        let terms = [
            MappedFile::open(&dir.join("term-0"), term_length)?,
            MappedFile::open(&dir.join("term-1"), term_length)?,
            MappedFile::open(&dir.join("term-2"), term_length)?,
        ];
        Ok(Self {
            terms,
            meta,
            term_length,
        })
    }

    /// Term length in bytes.
    #[must_use]
    pub const fn term_length(&self) -> usize {
        self.term_length
    }

    /// Largest message accepted by [`append`](Self::append).
    #[must_use]
    pub const fn max_message_length(&self) -> usize {
        self.term_length / 8
    }

    #[must_use]
    pub fn initial_term_id(&self) -> u32 {
        self.meta.buffer().get_u32(INITIAL_TERM_ID_OFFSET)
    }

    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.meta.buffer().get_u32(SESSION_ID_OFFSET)
    }

    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.meta.buffer().get_u32(STREAM_ID_OFFSET)
    }

    #[must_use]
    pub fn mtu_length(&self) -> usize {
        self.meta.buffer().get_u32(MTU_LENGTH_OFFSET) as usize
    }

    /// Index of the active partition.
    #[must_use]
    pub fn active_index(&self) -> usize {
        self.meta.buffer().get_u32_acquire(ACTIVE_INDEX_OFFSET) as usize
    }

    /// Status word of `partition`.
    #[must_use]
    pub fn partition_status(&self, partition: usize) -> u32 {
        self.meta.buffer().get_u32_acquire(status_offset(partition))
    }

    /// Raw tail (`term id << 32 | offset`) of `partition`.
    #[must_use]
    pub fn raw_tail(&self, partition: usize) -> u64 {
        self.meta.buffer().get_u64(tail_offset(partition))
    }

    /// The partition cycling slot of `term_id`.
    #[must_use]
    pub fn partition_for_term(&self, term_id: u32) -> usize {
        (term_id.wrapping_sub(self.initial_term_id()) as usize) % PARTITION_COUNT
    }

    /// View over one term.
    #[must_use]
    pub fn term_buffer(&self, partition: usize) -> AtomicBuffer {
        self.terms[partition].buffer()
    }

    /// The highest committed producer position.
    #[must_use]
    pub fn producer_position(&self) -> u64 {
        let raw = self.raw_tail(self.active_index());
        let term_id = (raw >> 32) as u32;
        let term_offset = (raw & 0xffff_ffff).min(self.term_length as u64) as u32;
        compute_position(term_id, term_offset, self.term_length, self.initial_term_id())
    }

    /// Claims `frame_length` bytes (rounded to frame alignment) in the
    /// active term, rotating at term boundaries.
    pub fn claim(&self, frame_length: usize) -> Claim {
        let aligned = align(frame_length, FRAME_ALIGNMENT);
        let meta = self.meta.buffer();
        let mut spins = 0usize;

        loop {
            let active = self.active_index();
            let raw = meta.get_and_add_u64(tail_offset(active), aligned as u64);
            let term_id = (raw >> 32) as u32;
            let term_offset = (raw & 0xffff_ffff) as usize;

            if term_offset + aligned <= self.term_length {
                return Claim::Granted {
                    term_id,
                    term_offset: term_offset as u32,
                };
            }

            // Overflow. Exactly one producer observes the crossing offset
            // and pads the slack; every overflowing producer may attempt
            // the rotation, with the status CAS picking a single winner.
            if term_offset < self.term_length {
                self.write_pad(active, term_id, term_offset);
            }

            let next = (active + 1) % PARTITION_COUNT;
            match self.partition_status(next) {
                STATUS_DIRTY => return Claim::AdminAction,
                STATUS_CLEAN
                    if meta.cas_u32(status_offset(next), STATUS_CLEAN, STATUS_ACTIVE) =>
                {
                    // Rotation winner: prepare the next tail before the
                    // index store makes it reachable.
                    meta.put_u64(tail_offset(next), u64::from(term_id.wrapping_add(1)) << 32);
                    meta.put_u32_release(status_offset(active), STATUS_DIRTY);
                    meta.cas_u32(ACTIVE_INDEX_OFFSET, active as u32, next as u32);
                    continue;
                }
                _ => {}
            }

            // A concurrent winner is mid-rotation; wait for the index.
            while self.active_index() == active {
                spins += 1;
                if spins > 1_000 {
                    return Claim::BackPressured;
                }
                std::hint::spin_loop();
            }
        }
    }

    fn write_pad(&self, partition: usize, term_id: u32, term_offset: usize) {
        let pad_length = self.term_length - term_offset;
        let term = self.term_buffer(partition);
        let mut header = [0u8; DATA_HEADER_LENGTH];
        FrameHeader {
            frame_length: pad_length as u32,
            flags: 0,
            frame_type: frame_type::PAD,
            term_offset: term_offset as u32,
            session_id: self.session_id(),
            stream_id: self.stream_id(),
            term_id,
        }
        .encode_without_length(&mut header);
        term.put_bytes(term_offset + 4, &header[4..]);
        commit_frame(&term, term_offset, pad_length as u32);
    }

    /// Appends a message, fragmenting at the log's MTU. The claim is a
    /// single fetch-add covering every fragment, so fragments are
    /// contiguous and never interleave with other producers.
    pub fn append(&self, payload: &[u8], limit: u64) -> Append {
        let max_payload = self.mtu_length() - DATA_HEADER_LENGTH;
        let fragments = payload.len().div_ceil(max_payload).max(1);
        let full_fragments = payload.len() / max_payload;
        let remainder = payload.len() - full_fragments * max_payload;
        let required = full_fragments * align(DATA_HEADER_LENGTH + max_payload, FRAME_ALIGNMENT)
            + if remainder > 0 || payload.is_empty() {
                align(DATA_HEADER_LENGTH + remainder, FRAME_ALIGNMENT)
            } else {
                0
            };

        if payload.len() > self.max_message_length() {
            return Append::MessageTooLong {
                length: payload.len(),
                max: self.max_message_length(),
            };
        }
        if self.producer_position() + required as u64 > limit {
            return Append::BackPressured;
        }

        let (term_id, term_offset) = match self.claim(required) {
            Claim::Granted { term_id, term_offset } => (term_id, term_offset),
            Claim::BackPressured => return Append::BackPressured,
            Claim::AdminAction => return Append::AdminAction,
        };

        let partition = self.partition_for_term(term_id);
        let term = self.term_buffer(partition);
        let session_id = self.session_id();
        let stream_id = self.stream_id();

        let mut offset = term_offset as usize;
        for index in 0..fragments {
            let chunk_start = index * max_payload;
            let chunk = &payload[chunk_start..(chunk_start + max_payload).min(payload.len())];
            let frame_length = DATA_HEADER_LENGTH + chunk.len();

            let mut flags = 0u8;
            if index == 0 {
                flags |= frame::flags::BEGIN;
            }
            if index == fragments - 1 {
                flags |= frame::flags::END;
            }

            let mut header = [0u8; DATA_HEADER_LENGTH];
            FrameHeader {
                frame_length: frame_length as u32,
                flags,
                frame_type: frame_type::DATA,
                term_offset: offset as u32,
                session_id,
                stream_id,
                term_id,
            }
            .encode_without_length(&mut header);
            term.put_bytes(offset + 4, &header[4..]);
            term.put_bytes(offset + DATA_HEADER_LENGTH, chunk);
            commit_frame(&term, offset, frame_length as u32);

            offset += align(frame_length, FRAME_ALIGNMENT);
        }

        Append::Position(compute_position(
            term_id,
            offset as u32,
            self.term_length,
            self.initial_term_id(),
        ))
    }

    /// Scans committed frames from `position` up to `limit`, handing each
    /// complete wire frame (PAD included) to `handler`. The handler
    /// returns `false` to stop early (e.g. a full socket). Returns the
    /// new position.
    pub fn scan(
        &self,
        position: u64,
        limit: u64,
        max_bytes: usize,
        mut handler: impl FnMut(&[u8]) -> bool,
    ) -> u64 {
        let term_count = position / self.term_length as u64;
        let partition = (term_count % PARTITION_COUNT as u64) as usize;
        let term = self.term_buffer(partition);

        let mut offset = (position % self.term_length as u64) as usize;
        let mut consumed = 0usize;

        while offset < self.term_length
            && consumed < max_bytes
            && position + (consumed as u64) < limit
        {
            let frame_length = frame_length_volatile(&term, offset) as usize;
            if frame_length == 0 {
                break;
            }
            let aligned = align(frame_length, FRAME_ALIGNMENT);
            if !handler(term.bytes_at(offset, frame_length)) {
                break;
            }
            consumed += aligned;
            offset += aligned;
        }

        position + consumed as u64
    }

    /// Polls committed frames from `position`, skipping PAD frames and
    /// handing `(payload, flags)` for each DATA frame. Returns the new
    /// position.
    pub fn poll(
        &self,
        position: u64,
        max_frames: usize,
        mut handler: impl FnMut(&[u8], u8),
    ) -> u64 {
        let term_count = position / self.term_length as u64;
        let partition = (term_count % PARTITION_COUNT as u64) as usize;
        let term = self.term_buffer(partition);

        let mut offset = (position % self.term_length as u64) as usize;
        let mut frames = 0usize;

        while offset < self.term_length && frames < max_frames {
            let frame_length = frame_length_volatile(&term, offset) as usize;
            if frame_length == 0 {
                break;
            }
            let aligned = align(frame_length, FRAME_ALIGNMENT);
            let header = term.bytes_at(offset, DATA_HEADER_LENGTH);
            let is_pad = u16::from_be_bytes(
                header[offsets::FRAME_TYPE..offsets::FRAME_TYPE + 2]
                    .try_into()
                    .expect("header in bounds"),
            ) == frame_type::PAD;

            if !is_pad && frame_length > DATA_HEADER_LENGTH {
                let flags = header[offsets::FLAGS];
                handler(
                    term.bytes_at(offset + DATA_HEADER_LENGTH, frame_length - DATA_HEADER_LENGTH),
                    flags,
                );
                frames += 1;
            }
            offset += aligned;
        }

        term_count * self.term_length as u64 + offset as u64
    }

    /// Writes a received wire frame at its addressed offset. Frames
    /// already present are dropped, which makes NAK-driven repair
    /// idempotent.
    ///
    /// The frame-length header field governs how far the stream
    /// advances; PAD frames arrive truncated to their header but still
    /// cover their full padded extent.
    pub fn insert_frame(&self, term_id: u32, term_offset: u32, frame_bytes: &[u8]) -> Insert {
        let partition = self.partition_for_term(term_id);
        let offset = term_offset as usize;

        if frame_bytes.len() < DATA_HEADER_LENGTH {
            return Insert::OutOfRange;
        }
        let frame_length =
            u32::from_be_bytes(frame_bytes[..4].try_into().expect("length checked"));
        let aligned = align((frame_length as usize).max(frame_bytes.len()), FRAME_ALIGNMENT);
        if (frame_length as usize) < frame_bytes.len() || offset + aligned > self.term_length {
            return Insert::OutOfRange;
        }
        if self.partition_status(partition) == STATUS_DIRTY {
            return Insert::NotClean;
        }

        let term = self.term_buffer(partition);
        if frame_length_volatile(&term, offset) != 0 {
            return Insert::Duplicate;
        }

        term.put_bytes(offset + 4, &frame_bytes[4..]);
        commit_frame(&term, offset, frame_length);
        Insert::Inserted(aligned)
    }

    /// Marks the partition of a completed term DIRTY and activates the
    /// next. Used on the receive side, where progress is driven by the
    /// rebuild position rather than producer claims.
    pub fn rotate_after(&self, completed_term_id: u32) {
        let meta = self.meta.buffer();
        let completed = self.partition_for_term(completed_term_id);
        let next_term_id = completed_term_id.wrapping_add(1);
        let next = self.partition_for_term(next_term_id);

        meta.put_u64(tail_offset(next), u64::from(next_term_id) << 32);
        meta.put_u32_release(status_offset(next), STATUS_ACTIVE);
        meta.put_u32_release(status_offset(completed), STATUS_DIRTY);
        meta.put_u32_release(ACTIVE_INDEX_OFFSET, next as u32);
    }

    /// The first DIRTY partition, if any.
    #[must_use]
    pub fn dirty_partition(&self) -> Option<usize> {
        (0..PARTITION_COUNT).find(|&p| self.partition_status(p) == STATUS_DIRTY)
    }

    /// Zeroes a DIRTY partition and marks it CLEAN.
    pub fn clean_partition(&self, partition: usize) {
        let term = self.term_buffer(partition);
        term.set_memory(0, self.term_length, 0);
        self.meta
            .buffer()
            .put_u32_release(status_offset(partition), STATUS_CLEAN);
    }

    /// Count of partitions currently marked ACTIVE.
    #[must_use]
    pub fn active_count(&self) -> usize {
        (0..PARTITION_COUNT)
            .filter(|&p| self.partition_status(p) == STATUS_ACTIVE)
            .count()
    }
}

/// Acquire-loads the big-endian frame-length word at `offset`.
#[inline]
#[must_use]
pub fn frame_length_volatile(term: &AtomicBuffer, offset: usize) -> u32 {
    u32::from_be(term.get_u32_acquire(offset))
}

/// Release-stores the big-endian frame-length word, committing a frame.
#[inline]
pub fn commit_frame(term: &AtomicBuffer, offset: usize, frame_length: u32) {
    term.put_u32_release(offset, frame_length.to_be());
}
