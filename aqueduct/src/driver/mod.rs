//! The media driver: three cooperating agents over shared-memory state.
//!
//! [`MediaDriver::launch`] creates the driver directory, maps the
//! control files (command ring, broadcast, counters), and spins up the
//! conductor, sender and receiver agents on their own threads. Shutdown
//! stops the agents in dataflow order and, when configured, removes the
//! driver directory.

pub mod commands;
pub mod conductor;
pub mod flow;
pub mod image;
pub mod loss;
pub mod publication;
pub mod receiver;
pub mod retransmit;
pub mod sender;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::agent::AgentRunner;
use crate::buffer::MappedFile;
use crate::buffer::counters::{CountersError, CountersManager, CountersReader};
use crate::buffer::mapped::MappedFileError;
use crate::concurrent::BackoffIdleStrategy;
use crate::concurrent::broadcast::{BroadcastError, BroadcastTransmitter};
use crate::concurrent::ring::{ManyToOneRingBuffer, RingError};
use crate::concurrent::spsc;
use crate::config::{ConfigError, DriverConfig};
use crate::net::UdpChannel;
use crate::timing::MonotonicClock;
use crate::trace::info;

use conductor::Conductor;
use receiver::{Receiver, ReceiverConfig};
use sender::{Sender, SenderConfig};

/// File names within the driver directory.
pub const TO_DRIVER_FILE: &str = "to-driver";
pub const TO_CLIENTS_FILE: &str = "to-clients";
pub const COUNTERS_DIR: &str = "counters";
pub const COUNTERS_LABELS_FILE: &str = "labels";
pub const COUNTERS_VALUES_FILE: &str = "values";
pub const PUBLICATIONS_DIR: &str = "publications";
pub const IMAGES_DIR: &str = "images";

/// Fatal driver initialization errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot create directory `{path}`: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Map(#[from] MappedFileError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Counters(#[from] CountersError),
    #[error("receiver setup failed: {0}")]
    Receiver(#[source] std::io::Error),
}

/// Locations of every file the driver owns.
#[derive(Debug, Clone)]
pub struct DriverPaths {
    base: PathBuf,
}

impl DriverPaths {
    /// Paths rooted at `base`.
    #[must_use]
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    /// The driver directory itself.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Creates the directory skeleton.
    pub fn ensure(&self) -> Result<(), DriverError> {
        for dir in [
            self.base.clone(),
            self.base.join(COUNTERS_DIR),
            self.base.join(PUBLICATIONS_DIR),
            self.base.join(IMAGES_DIR),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|source| DriverError::Directory { path: dir, source })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn to_driver(&self) -> PathBuf {
        self.base.join(TO_DRIVER_FILE)
    }

    #[must_use]
    pub fn to_clients(&self) -> PathBuf {
        self.base.join(TO_CLIENTS_FILE)
    }

    #[must_use]
    pub fn counters_labels(&self) -> PathBuf {
        self.base.join(COUNTERS_DIR).join(COUNTERS_LABELS_FILE)
    }

    #[must_use]
    pub fn counters_values(&self) -> PathBuf {
        self.base.join(COUNTERS_DIR).join(COUNTERS_VALUES_FILE)
    }

    /// Log directory for one publication.
    #[must_use]
    pub fn publication_dir(&self, channel: &UdpChannel, session_id: u32, stream_id: u32) -> PathBuf {
        self.base
            .join(PUBLICATIONS_DIR)
            .join(channel.dir_name())
            .join(format!("{session_id}-{stream_id}"))
    }

    /// Log directory for one image.
    #[must_use]
    pub fn image_dir(&self, channel: &UdpChannel, session_id: u32, stream_id: u32) -> PathBuf {
        self.base
            .join(IMAGES_DIR)
            .join(channel.dir_name())
            .join(format!("{session_id}-{stream_id}"))
    }
}

/// Driver-wide diagnostic counter ids.
#[derive(Clone, Copy)]
pub struct SystemCounters {
    wire_errors: u32,
    channel_errors: u32,
    naks_sent: u32,
    status_messages_sent: u32,
    heartbeats_sent: u32,
    retransmits_sent: u32,
    setups_sent: u32,
}

impl SystemCounters {
    /// Allocates the fixed diagnostic counters.
    pub fn allocate(counters: &mut CountersManager) -> Result<Self, CountersError> {
        Ok(Self {
            wire_errors: counters.allocate("errors: wire")?,
            channel_errors: counters.allocate("errors: channel")?,
            naks_sent: counters.allocate("naks sent")?,
            status_messages_sent: counters.allocate("status messages sent")?,
            heartbeats_sent: counters.allocate("heartbeats sent")?,
            retransmits_sent: counters.allocate("retransmits sent")?,
            setups_sent: counters.allocate("setup frames sent")?,
        })
    }

    pub fn increment_wire_errors(&self, counters: &CountersReader) {
        counters.increment(self.wire_errors);
    }

    pub fn increment_channel_errors(&self, counters: &CountersReader) {
        counters.increment(self.channel_errors);
    }

    pub fn increment_naks_sent(&self, counters: &CountersReader) {
        counters.increment(self.naks_sent);
    }

    pub fn increment_status_messages_sent(&self, counters: &CountersReader) {
        counters.increment(self.status_messages_sent);
    }

    pub fn increment_heartbeats_sent(&self, counters: &CountersReader) {
        counters.increment(self.heartbeats_sent);
    }

    pub fn increment_retransmits_sent(&self, counters: &CountersReader) {
        counters.increment(self.retransmits_sent);
    }

    pub fn increment_setups_sent(&self, counters: &CountersReader) {
        counters.increment(self.setups_sent);
    }
}

/// A running media driver.
///
/// Dropping the handle stops the agents; [`MediaDriver::shutdown`] does
/// the same and also removes the driver directory when configured.
pub struct MediaDriver {
    // Runners precede the mappings so agents stop before views unmap.
    conductor: Option<AgentRunner>,
    sender: Option<AgentRunner>,
    receiver: Option<AgentRunner>,
    paths: DriverPaths,
    dir_delete_on_exit: bool,
    _to_driver: Arc<MappedFile>,
    _to_clients: Arc<MappedFile>,
    _counter_labels: Arc<MappedFile>,
    _counter_values: Arc<MappedFile>,
}

impl MediaDriver {
    /// Validates configuration, creates the driver directory and control
    /// files, and starts the three agents.
    pub fn launch(config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;

        let paths = DriverPaths::new(&config.dir);
        paths.ensure()?;

        let to_driver = Arc::new(MappedFile::create(
            &paths.to_driver(),
            config.to_driver_file_length(),
        )?);
        let to_clients = Arc::new(MappedFile::create(
            &paths.to_clients(),
            config.to_clients_file_length(),
        )?);
        let counter_labels = Arc::new(MappedFile::create(
            &paths.counters_labels(),
            config.counters_buffer_size,
        )?);
        let counter_values = Arc::new(MappedFile::create(
            &paths.counters_values(),
            config.counters_buffer_size,
        )?);

        let ring = ManyToOneRingBuffer::new(to_driver.buffer())?;
        let broadcast = BroadcastTransmitter::new(to_clients.buffer())?;
        let mut counters = CountersManager::new(counter_labels.buffer(), counter_values.buffer());
        let system = SystemCounters::allocate(&mut counters)?;
        let counters_reader = counters.reader();

        let (sender_tx, sender_rx) = spsc::channel(config.command_queue_capacity);
        let (receiver_tx, receiver_rx) = spsc::channel(config.command_queue_capacity);
        let (event_tx, event_rx) = spsc::channel(config.command_queue_capacity);

        let clock = MonotonicClock::new();

        let sender = Sender::new(
            sender_rx,
            counters_reader,
            system,
            clock,
            SenderConfig {
                mtu_length: config.mtu_length,
                initial_window: config.initial_window,
                multicast_interface: config.multicast_interface,
                setup_interval_ns: config.setup_interval.as_nanos() as u64,
                heartbeat_interval_ns: config.heartbeat_interval.as_nanos() as u64,
                receiver_timeout: config.receiver_timeout,
                connection_grace_ns: config.connection_grace.as_nanos() as u64,
                retransmit_delay: config.retransmit_delay,
                retransmit_linger: config.retransmit_linger,
                events: config.enabled_events,
            },
        );

        let receiver = Receiver::new(
            receiver_rx,
            event_tx,
            counters_reader,
            system,
            clock,
            ReceiverConfig {
                rcv_buffer_size: config.rcv_buffer_size,
                initial_window: config.initial_window as u32,
                multicast_interface: config.multicast_interface,
                sm_interval_ns: config.sm_interval.as_nanos() as u64,
                image_liveness_timeout_ns: config.image_liveness_timeout.as_nanos() as u64,
                nak_unicast_delay: config.nak_unicast_delay,
                nak_grtt: config.nak_grtt,
                nak_group_size: config.nak_group_size,
                nak_max_backoff: config.nak_max_backoff,
                events: config.enabled_events,
            },
        )
        .map_err(DriverError::Receiver)?;

        let conductor = Conductor::new(
            ring,
            broadcast,
            counters,
            sender_tx,
            receiver_tx,
            event_rx,
            clock,
            paths.clone(),
            config.clone(),
        );

        info!(dir = %paths.base().display(), "media driver starting");
        let driver = Self {
            conductor: Some(AgentRunner::start(
                "driver-conductor",
                BackoffIdleStrategy::default(),
                conductor,
            )),
            sender: Some(AgentRunner::start(
                "driver-sender",
                BackoffIdleStrategy::default(),
                sender,
            )),
            receiver: Some(AgentRunner::start(
                "driver-receiver",
                BackoffIdleStrategy::default(),
                receiver,
            )),
            paths,
            dir_delete_on_exit: config.dir_delete_on_exit,
            _to_driver: to_driver,
            _to_clients: to_clients,
            _counter_labels: counter_labels,
            _counter_values: counter_values,
        };
        info!("media driver started");
        Ok(driver)
    }

    /// The driver directory layout.
    #[must_use]
    pub fn paths(&self) -> &DriverPaths {
        &self.paths
    }

    /// Stops the agents and removes the driver directory when
    /// configured.
    pub fn shutdown(mut self) {
        info!("media driver shutting down");
        if let Some(runner) = self.sender.take() {
            runner.stop();
        }
        if let Some(runner) = self.receiver.take() {
            runner.stop();
        }
        if let Some(runner) = self.conductor.take() {
            runner.stop();
        }

        if self.dir_delete_on_exit {
            let _ = std::fs::remove_dir_all(self.paths.base());
        }
        info!("media driver stopped");
    }
}
