//! UDP wire protocol frames.
//!
//! All frames are big-endian and share a 24-byte base header; DATA and
//! PAD frames round the header up to 32 bytes with a reserved word and
//! are 32-byte aligned inside term buffers, so a committed term region
//! can be handed to the socket without re-encoding.
//!
//! ```text
//! ┌──────────────┬────────┬────────┬──────────┬─────────────────────┐
//! │ frame len u32│ ver u8 │flags u8│ type u16 │ term offset u32     │
//! ├──────────────┴────────┴────────┴──────────┴─────────────────────┤
//! │ session id u32 │ stream id u32 │ term id u32 │ type-specific …  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Type-specific tails:
//! - DATA/PAD: reserved u64, then payload. A DATA frame with no payload
//!   is a heartbeat.
//! - NAK: gap term-offset u32, gap length u32.
//! - SM: consumption term-id u32, consumption term-offset u32,
//!   receiver window u32.
//! - SETUP: initial term-id u32, active term-id u32, term length u32,
//!   MTU length u32.

use thiserror::Error;

/// Alignment of frames inside term buffers.
pub const FRAME_ALIGNMENT: usize = 32;

/// Base header common to every frame type.
pub const BASE_HEADER_LENGTH: usize = 24;

/// Full header of DATA and PAD frames (base + reserved word).
pub const DATA_HEADER_LENGTH: usize = 32;

/// Protocol version carried in every frame.
pub const CURRENT_VERSION: u8 = 0;

/// Frame type discriminants.
pub mod frame_type {
    pub const PAD: u16 = 0x00;
    pub const DATA: u16 = 0x01;
    pub const NAK: u16 = 0x02;
    pub const SM: u16 = 0x03;
    pub const SETUP: u16 = 0x05;
}

/// Frame flag bits.
pub mod flags {
    /// First fragment of a message.
    pub const BEGIN: u8 = 0x80;
    /// Last fragment of a message.
    pub const END: u8 = 0x40;
    /// A message carried whole in one frame.
    pub const UNFRAGMENTED: u8 = BEGIN | END;
}

/// Field offsets within the header.
pub mod offsets {
    pub const FRAME_LENGTH: usize = 0;
    pub const VERSION: usize = 4;
    pub const FLAGS: usize = 5;
    pub const FRAME_TYPE: usize = 6;
    pub const TERM_OFFSET: usize = 8;
    pub const SESSION_ID: usize = 12;
    pub const STREAM_ID: usize = 16;
    pub const TERM_ID: usize = 20;
    pub const RESERVED: usize = 24;
    pub const NAK_GAP_OFFSET: usize = 24;
    pub const NAK_GAP_LENGTH: usize = 28;
    pub const SM_CONSUMPTION_TERM_ID: usize = 24;
    pub const SM_CONSUMPTION_TERM_OFFSET: usize = 28;
    pub const SM_RECEIVER_WINDOW: usize = 32;
    pub const SETUP_INITIAL_TERM_ID: usize = 24;
    pub const SETUP_ACTIVE_TERM_ID: usize = 28;
    pub const SETUP_TERM_LENGTH: usize = 32;
    pub const SETUP_MTU_LENGTH: usize = 36;
}

/// Total length of an encoded NAK frame.
pub const NAK_FRAME_LENGTH: usize = 32;
/// Total length of an encoded status message frame.
pub const SM_FRAME_LENGTH: usize = 36;
/// Total length of an encoded SETUP frame.
pub const SETUP_FRAME_LENGTH: usize = 40;

/// Errors decoding an inbound frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u16),
    #[error("frame length {length} disagrees with datagram of {have} bytes")]
    LengthMismatch { length: usize, have: usize },
}

#[inline]
fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("bounds checked"))
}

#[inline]
fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Identity and placement shared by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: u32,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: u32,
    pub session_id: u32,
    pub stream_id: u32,
    pub term_id: u32,
}

impl FrameHeader {
    /// Encodes the header into `buf`, which must hold at least the base
    /// header. The frame-length word goes in with everything else; term
    /// writers that need header-last ordering use
    /// [`encode_without_length`](Self::encode_without_length) plus an
    /// ordered length store.
    pub fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, offsets::FRAME_LENGTH, self.frame_length);
        self.encode_without_length(buf);
    }

    /// Encodes every field except the frame-length word.
    pub fn encode_without_length(&self, buf: &mut [u8]) {
        buf[offsets::VERSION] = CURRENT_VERSION;
        buf[offsets::FLAGS] = self.flags;
        buf[offsets::FRAME_TYPE..offsets::FRAME_TYPE + 2]
            .copy_from_slice(&self.frame_type.to_be_bytes());
        put_u32(buf, offsets::TERM_OFFSET, self.term_offset);
        put_u32(buf, offsets::SESSION_ID, self.session_id);
        put_u32(buf, offsets::STREAM_ID, self.stream_id);
        put_u32(buf, offsets::TERM_ID, self.term_id);
    }

    fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < BASE_HEADER_LENGTH {
            return Err(FrameError::TooShort {
                need: BASE_HEADER_LENGTH,
                have: buf.len(),
            });
        }
        let version = buf[offsets::VERSION];
        if version != CURRENT_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        Ok(Self {
            frame_length: get_u32(buf, offsets::FRAME_LENGTH),
            flags: buf[offsets::FLAGS],
            frame_type: u16::from_be_bytes(
                buf[offsets::FRAME_TYPE..offsets::FRAME_TYPE + 2]
                    .try_into()
                    .expect("bounds checked"),
            ),
            term_offset: get_u32(buf, offsets::TERM_OFFSET),
            session_id: get_u32(buf, offsets::SESSION_ID),
            stream_id: get_u32(buf, offsets::STREAM_ID),
            term_id: get_u32(buf, offsets::TERM_ID),
        })
    }
}

/// A NAK identifying one gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakFrame {
    pub session_id: u32,
    pub stream_id: u32,
    pub term_id: u32,
    pub gap_offset: u32,
    pub gap_length: u32,
}

/// A status message advertising consumption and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessageFrame {
    pub session_id: u32,
    pub stream_id: u32,
    pub consumption_term_id: u32,
    pub consumption_term_offset: u32,
    pub receiver_window: u32,
}

/// A SETUP announcing stream geometry to receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupFrame {
    pub session_id: u32,
    pub stream_id: u32,
    pub initial_term_id: u32,
    pub active_term_id: u32,
    pub term_length: u32,
    pub mtu_length: u32,
}

/// A decoded inbound frame. DATA and PAD borrow the datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Data {
        header: FrameHeader,
        payload: &'a [u8],
        /// The full frame bytes, header included.
        frame: &'a [u8],
    },
    Pad {
        header: FrameHeader,
    },
    Nak(NakFrame),
    StatusMessage(StatusMessageFrame),
    Setup(SetupFrame),
}

/// Whether a frame's type word marks it as padding.
#[inline]
#[must_use]
pub fn is_pad(frame_bytes: &[u8]) -> bool {
    frame_bytes.len() >= BASE_HEADER_LENGTH
        && u16::from_be_bytes(
            frame_bytes[offsets::FRAME_TYPE..offsets::FRAME_TYPE + 2]
                .try_into()
                .expect("length checked"),
        ) == frame_type::PAD
}

/// Decodes one frame from a datagram.
pub fn decode(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    let header = FrameHeader::decode(buf)?;
    let need = |need: usize| {
        if buf.len() < need {
            Err(FrameError::TooShort {
                need,
                have: buf.len(),
            })
        } else {
            Ok(())
        }
    };

    match header.frame_type {
        frame_type::DATA => {
            need(DATA_HEADER_LENGTH)?;
            let length = header.frame_length as usize;
            if length < DATA_HEADER_LENGTH || length > buf.len() {
                return Err(FrameError::LengthMismatch {
                    length,
                    have: buf.len(),
                });
            }
            Ok(Frame::Data {
                header,
                payload: &buf[DATA_HEADER_LENGTH..length],
                frame: &buf[..length],
            })
        }
        frame_type::PAD => {
            need(DATA_HEADER_LENGTH)?;
            Ok(Frame::Pad { header })
        }
        frame_type::NAK => {
            need(NAK_FRAME_LENGTH)?;
            Ok(Frame::Nak(NakFrame {
                session_id: header.session_id,
                stream_id: header.stream_id,
                term_id: header.term_id,
                gap_offset: get_u32(buf, offsets::NAK_GAP_OFFSET),
                gap_length: get_u32(buf, offsets::NAK_GAP_LENGTH),
            }))
        }
        frame_type::SM => {
            need(SM_FRAME_LENGTH)?;
            Ok(Frame::StatusMessage(StatusMessageFrame {
                session_id: header.session_id,
                stream_id: header.stream_id,
                consumption_term_id: get_u32(buf, offsets::SM_CONSUMPTION_TERM_ID),
                consumption_term_offset: get_u32(buf, offsets::SM_CONSUMPTION_TERM_OFFSET),
                receiver_window: get_u32(buf, offsets::SM_RECEIVER_WINDOW),
            }))
        }
        frame_type::SETUP => {
            need(SETUP_FRAME_LENGTH)?;
            Ok(Frame::Setup(SetupFrame {
                session_id: header.session_id,
                stream_id: header.stream_id,
                initial_term_id: get_u32(buf, offsets::SETUP_INITIAL_TERM_ID),
                active_term_id: get_u32(buf, offsets::SETUP_ACTIVE_TERM_ID),
                term_length: get_u32(buf, offsets::SETUP_TERM_LENGTH),
                mtu_length: get_u32(buf, offsets::SETUP_MTU_LENGTH),
            }))
        }
        other => Err(FrameError::UnknownType(other)),
    }
}

fn base_header(frame_type: u16, frame_length: usize, session_id: u32, stream_id: u32, term_id: u32) -> FrameHeader {
    FrameHeader {
        frame_length: frame_length as u32,
        flags: 0,
        frame_type,
        term_offset: 0,
        session_id,
        stream_id,
        term_id,
    }
}

/// Encodes a NAK into `buf`, clearing it first.
pub fn encode_nak(buf: &mut Vec<u8>, nak: &NakFrame) {
    buf.clear();
    buf.resize(NAK_FRAME_LENGTH, 0);
    base_header(
        frame_type::NAK,
        NAK_FRAME_LENGTH,
        nak.session_id,
        nak.stream_id,
        nak.term_id,
    )
    .encode(buf);
    put_u32(buf, offsets::NAK_GAP_OFFSET, nak.gap_offset);
    put_u32(buf, offsets::NAK_GAP_LENGTH, nak.gap_length);
}

/// Encodes a status message into `buf`, clearing it first.
pub fn encode_status_message(buf: &mut Vec<u8>, sm: &StatusMessageFrame) {
    buf.clear();
    buf.resize(SM_FRAME_LENGTH, 0);
    base_header(
        frame_type::SM,
        SM_FRAME_LENGTH,
        sm.session_id,
        sm.stream_id,
        sm.consumption_term_id,
    )
    .encode(buf);
    put_u32(buf, offsets::SM_CONSUMPTION_TERM_ID, sm.consumption_term_id);
    put_u32(buf, offsets::SM_CONSUMPTION_TERM_OFFSET, sm.consumption_term_offset);
    put_u32(buf, offsets::SM_RECEIVER_WINDOW, sm.receiver_window);
}

/// Encodes a SETUP into `buf`, clearing it first.
pub fn encode_setup(buf: &mut Vec<u8>, setup: &SetupFrame) {
    buf.clear();
    buf.resize(SETUP_FRAME_LENGTH, 0);
    base_header(
        frame_type::SETUP,
        SETUP_FRAME_LENGTH,
        setup.session_id,
        setup.stream_id,
        setup.active_term_id,
    )
    .encode(buf);
    put_u32(buf, offsets::SETUP_INITIAL_TERM_ID, setup.initial_term_id);
    put_u32(buf, offsets::SETUP_ACTIVE_TERM_ID, setup.active_term_id);
    put_u32(buf, offsets::SETUP_TERM_LENGTH, setup.term_length);
    put_u32(buf, offsets::SETUP_MTU_LENGTH, setup.mtu_length);
}

/// Encodes a zero-payload DATA frame: the stream heartbeat.
pub fn encode_heartbeat(
    buf: &mut Vec<u8>,
    session_id: u32,
    stream_id: u32,
    term_id: u32,
    term_offset: u32,
) {
    buf.clear();
    buf.resize(DATA_HEADER_LENGTH, 0);
    FrameHeader {
        frame_length: DATA_HEADER_LENGTH as u32,
        flags: 0,
        frame_type: frame_type::DATA,
        term_offset,
        session_id,
        stream_id,
        term_id,
    }
    .encode(buf);
}
