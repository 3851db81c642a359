//! Inter-agent commands and events.
//!
//! The conductor is the single writer of driver state; it hands the
//! sender and receiver their working sets as `Arc` records over SPSC
//! queues. The receiver reports inbound control-plane happenings (new
//! sources, dead images) back to the conductor the same way. No agent
//! ever reaches into another agent's tables.

use std::sync::Arc;

use crate::net::{Endpoint, UdpChannel};
use crate::protocol::frame::SetupFrame;

use super::image::DriverImage;
use super::publication::DriverPublication;

/// Conductor → sender.
pub enum SenderCommand {
    /// Start transmitting a publication.
    AddPublication(Arc<DriverPublication>),
    /// Stop transmitting and drop the publication record.
    RemovePublication { registration_id: u64 },
}

/// Conductor → receiver.
pub enum ReceiverCommand {
    /// Open (or reference) the channel endpoint and accept a stream.
    AddSubscription { channel: UdpChannel, stream_id: u32 },
    /// Drop a stream; closes the channel endpoint when the last stream
    /// goes.
    RemoveSubscription { channel: UdpChannel, stream_id: u32 },
    /// Wire up a freshly allocated image.
    NewImage(Arc<DriverImage>),
    /// Drop an image record.
    RemoveImage { correlation_id: u64 },
}

/// Receiver → conductor.
pub enum ConductorEvent {
    /// A SETUP arrived for a subscribed stream with no image yet; the
    /// conductor allocates the log and counters.
    CreateImage {
        channel: UdpChannel,
        stream_id: u32,
        setup: SetupFrame,
        /// Datagram source (the sender's socket).
        source: Endpoint,
        /// Where this image's SMs and NAKs should be sent.
        control_address: Endpoint,
    },
    /// An image saw no traffic for the liveness timeout.
    ImageInactive { correlation_id: u64 },
}
