//! A publish/subscribe messaging transport built around a stand-alone
//! media driver and in-process clients.
//!
//! The driver owns the UDP sockets and the shared-memory log buffers.
//! Publishers append frames to a publication log that the driver's sender
//! transmits; the driver's receiver reassembles inbound streams into image
//! logs that subscribers poll. Clients talk to the driver only over a
//! shared-memory control plane: a many-to-one command ring into the driver
//! and a broadcast buffer back out.
//!
//! ```text
//! client ──(command ring)──► Conductor ──(SPSC queues)──► Sender / Receiver
//! client ◄──(broadcast)───── Conductor
//! network ──(UDP)──► Receiver ──(image log)──► client (poll)
//! client (append) ──(publication log)──► Sender ──(UDP)──► network
//! ```

pub mod agent;
pub mod buffer;
pub mod client;
pub mod concurrent;
pub mod config;
pub mod driver;
pub mod event;
pub mod net;
pub mod protocol;
pub mod timing;

mod trace;

pub use trace::init_tracing;
