//! Wire and control-plane codecs.
//!
//! [`frame`] is the UDP wire protocol: fixed-layout big-endian frames
//! decoded in place. [`control`] is the shared-memory control protocol
//! between clients and the driver, carried as serialized records over
//! the command ring and the broadcast buffer.

pub mod control;
pub mod frame;
