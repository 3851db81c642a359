//! Client → driver command path.
//!
//! The proxy maps the driver's command ring and serializes commands into
//! it. Every command gets a fresh correlation id from the ring's shared
//! counter, so ids are unique across every client process; the driver
//! echoes the id in exactly one response on the broadcast.

use std::path::Path;

use crate::buffer::MappedFile;
use crate::concurrent::ring::ManyToOneRingBuffer;
use crate::driver::DriverPaths;
use crate::protocol::control::{
    self, KeepaliveCommand, PublicationCommand, SubscriptionCommand, msg_type,
};

use super::ClientError;

/// The command-sending half of a client.
pub struct DriverProxy {
    ring: ManyToOneRingBuffer,
    client_id: u64,
    // Keeps the ring's mapping alive.
    _map: MappedFile,
}

impl DriverProxy {
    /// Maps the command ring of the driver at `dir`.
    pub fn connect(dir: &Path) -> Result<Self, ClientError> {
        let paths = DriverPaths::new(dir);
        let map = MappedFile::open_existing(&paths.to_driver())?;
        let ring = ManyToOneRingBuffer::new(map.buffer())?;
        Ok(Self {
            ring,
            client_id: rand::random(),
            _map: map,
        })
    }

    /// This client's identity for liveness tracking.
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Requests a new publication; returns the correlation id to await.
    pub fn add_publication(&self, channel: &str, stream_id: u32) -> Result<u64, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        let command = PublicationCommand {
            client_id: self.client_id,
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        };
        self.ring
            .write(msg_type::ADD_PUBLICATION, &control::encode(&command)?)?;
        Ok(correlation_id)
    }

    /// Requests removal of a publication.
    pub fn remove_publication(&self, channel: &str, stream_id: u32) -> Result<u64, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        let command = PublicationCommand {
            client_id: self.client_id,
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        };
        self.ring
            .write(msg_type::REMOVE_PUBLICATION, &control::encode(&command)?)?;
        Ok(correlation_id)
    }

    /// Requests a new subscription; images arrive later as events.
    pub fn add_subscription(&self, channel: &str, stream_id: u32) -> Result<u64, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        let command = SubscriptionCommand {
            client_id: self.client_id,
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        };
        self.ring
            .write(msg_type::ADD_SUBSCRIPTION, &control::encode(&command)?)?;
        Ok(correlation_id)
    }

    /// Requests removal of a subscription.
    pub fn remove_subscription(&self, channel: &str, stream_id: u32) -> Result<u64, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        let command = SubscriptionCommand {
            client_id: self.client_id,
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        };
        self.ring
            .write(msg_type::REMOVE_SUBSCRIPTION, &control::encode(&command)?)?;
        Ok(correlation_id)
    }

    /// Tells the driver this client is still alive.
    pub fn send_keepalive(&self) -> Result<(), ClientError> {
        let command = KeepaliveCommand {
            client_id: self.client_id,
        };
        self.ring
            .write(msg_type::CLIENT_KEEPALIVE, &control::encode(&command)?)?;
        Ok(())
    }
}
