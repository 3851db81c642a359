//! The conductor agent: the driver's control plane.
//!
//! Each duty cycle it drains client commands from the command ring,
//! drains receiver events, expires the timer wheel (client liveness,
//! publication linger, image linger), and runs at most one clean-term
//! job so zeroing a multi-megabyte term cannot starve the command loop.
//!
//! The conductor is the single owner of driver resources: it allocates
//! log buffers and counters, hands `Arc` records to the sender and
//! receiver, and reclaims everything when references lapse. Every client
//! command is answered on the broadcast with exactly one response
//! carrying the command's correlation id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::Agent;
use crate::buffer::LogBuffers;
use crate::buffer::counters::CountersManager;
use crate::buffer::log;
use crate::concurrent::broadcast::BroadcastTransmitter;
use crate::concurrent::ring::ManyToOneRingBuffer;
use crate::concurrent::spsc;
use crate::config::DriverConfig;
use crate::net::UdpChannel;
use crate::protocol::control::{
    self, ClientCommand, ErrorCode, ErrorResponseEvent, InactiveImageEvent, KeepaliveCommand,
    NewImageEvent, NewPublicationEvent, OperationSucceededEvent, PublicationCommand,
    SubscriptionCommand, msg_type,
};
use crate::protocol::frame::SetupFrame;
use crate::timing::{MonotonicClock, TimerId, TimerWheel, WheelConfig};
use crate::trace::{debug, info, warn};

use super::DriverPaths;
use super::commands::{ConductorEvent, ReceiverCommand, SenderCommand};
use super::image::DriverImage;
use super::publication::DriverPublication;

/// Commands dispatched per duty cycle before yielding to timers.
const COMMANDS_PER_CYCLE: usize = 16;

/// Timer wheel capacity: clients + publications + images.
const WHEEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
enum TimerEvent {
    ClientTimeout(u64),
    PublicationLinger(u64),
    ImageLinger(u64),
}

struct PublicationRecord {
    publication: Arc<DriverPublication>,
    client_id: u64,
    lingering: bool,
}

struct SubscriptionRecord {
    channel: UdpChannel,
    stream_id: u32,
    /// One entry per registration; a client may appear more than once.
    clients: Vec<u64>,
}

struct ImageRecord {
    image: Arc<DriverImage>,
    lingering: bool,
}

/// The conductor agent state.
pub struct Conductor {
    ring: ManyToOneRingBuffer,
    broadcast: BroadcastTransmitter,
    counters: CountersManager,
    sender_commands: spsc::Producer<SenderCommand>,
    receiver_commands: spsc::Producer<ReceiverCommand>,
    receiver_events: spsc::Consumer<ConductorEvent>,
    publications: Vec<PublicationRecord>,
    subscriptions: Vec<SubscriptionRecord>,
    images: Vec<ImageRecord>,
    clients: HashMap<u64, TimerId>,
    wheel: TimerWheel<TimerEvent>,
    clock: MonotonicClock,
    paths: DriverPaths,
    config: DriverConfig,
    next_image_id: u64,
}

impl Conductor {
    /// Creates the conductor.
    #[must_use]
    pub fn new(
        ring: ManyToOneRingBuffer,
        broadcast: BroadcastTransmitter,
        counters: CountersManager,
        sender_commands: spsc::Producer<SenderCommand>,
        receiver_commands: spsc::Producer<ReceiverCommand>,
        receiver_events: spsc::Consumer<ConductorEvent>,
        clock: MonotonicClock,
        paths: DriverPaths,
        config: DriverConfig,
    ) -> Self {
        let wheel = TimerWheel::new(WheelConfig {
            tick: config.wheel_tick,
            slots: config.wheel_slots,
            capacity: WHEEL_CAPACITY,
        });

        Self {
            ring,
            broadcast,
            counters,
            sender_commands,
            receiver_commands,
            receiver_events,
            publications: Vec::new(),
            subscriptions: Vec::new(),
            images: Vec::new(),
            clients: HashMap::new(),
            wheel,
            clock,
            paths,
            config,
            next_image_id: 1,
        }
    }

    fn process_client_commands(&mut self, now_ns: u64) -> usize {
        let ring = self.ring;
        let mut pending = Vec::new();
        let count = ring.read(COMMANDS_PER_CYCLE, |msg_type_id, body| {
            match ClientCommand::decode(msg_type_id, body) {
                Ok(command) => pending.push(command),
                Err(e) => warn!(error = %e, "undecodable client command dropped"),
            }
        });

        for command in pending {
            self.dispatch_command(command, now_ns);
        }
        count
    }

    fn dispatch_command(&mut self, command: ClientCommand, now_ns: u64) {
        if self.config.enabled_events.enabled(crate::event::EventCode::CmdIn) {
            debug!(command = ?command, "command in");
        }
        match command {
            ClientCommand::AddPublication(cmd) => {
                self.observe_client(cmd.client_id, now_ns);
                self.on_add_publication(cmd);
            }
            ClientCommand::RemovePublication(cmd) => {
                self.observe_client(cmd.client_id, now_ns);
                self.on_remove_publication(cmd);
            }
            ClientCommand::AddSubscription(cmd) => {
                self.observe_client(cmd.client_id, now_ns);
                self.on_add_subscription(cmd);
            }
            ClientCommand::RemoveSubscription(cmd) => {
                self.observe_client(cmd.client_id, now_ns);
                self.on_remove_subscription(cmd);
            }
            ClientCommand::ClientKeepalive(KeepaliveCommand { client_id }) => {
                self.observe_client(client_id, now_ns);
            }
        }
    }

    /// Refreshes a client's liveness timer.
    fn observe_client(&mut self, client_id: u64, _now_ns: u64) {
        if let Some(timer) = self.clients.remove(&client_id) {
            self.wheel.cancel(timer);
        }
        match self
            .wheel
            .schedule_after(self.config.client_liveness_timeout, TimerEvent::ClientTimeout(client_id))
        {
            Some(timer) => {
                self.clients.insert(client_id, timer);
            }
            None => warn!(client_id, "timer wheel full, client liveness untracked"),
        }
    }

    fn on_add_publication(&mut self, cmd: PublicationCommand) {
        let channel = match UdpChannel::parse(&cmd.channel) {
            Ok(channel) => channel,
            Err(e) => {
                self.error_response(
                    cmd.correlation_id,
                    ErrorCode::InvalidDestinationInPublication,
                    e.to_string(),
                );
                return;
            }
        };

        let exists = self.publications.iter().any(|p| {
            !p.lingering
                && p.publication.channel.canonical() == channel.canonical()
                && p.publication.stream_id == cmd.stream_id
        });
        if exists {
            self.error_response(
                cmd.correlation_id,
                ErrorCode::PublicationChannelAlreadyExists,
                format!("{} stream {}", channel.canonical(), cmd.stream_id),
            );
            return;
        }

        let session_id: u32 = rand::random();
        let initial_term_id: u32 = rand::random();
        let dir = self
            .paths
            .publication_dir(&channel, session_id, cmd.stream_id);

        let log_buffers = match LogBuffers::create(
            &dir,
            self.config.term_length,
            initial_term_id,
            session_id,
            cmd.stream_id,
            self.config.mtu_length,
        ) {
            Ok(log_buffers) => log_buffers,
            Err(e) => {
                warn!(error = %e, "publication log allocation failed");
                self.error_response(cmd.correlation_id, ErrorCode::GenericError, e.to_string());
                return;
            }
        };

        let label = |kind: &str| {
            format!("{kind}: {} {session_id}:{}", channel.canonical(), cmd.stream_id)
        };
        let Ok(sender_position_counter) = self.counters.allocate(&label("snd-pos")) else {
            self.error_response(
                cmd.correlation_id,
                ErrorCode::GenericError,
                "counters exhausted".to_string(),
            );
            return;
        };
        let Ok(limit_counter) = self.counters.allocate(&label("pub-lmt")) else {
            self.counters.free(sender_position_counter);
            self.error_response(
                cmd.correlation_id,
                ErrorCode::GenericError,
                "counters exhausted".to_string(),
            );
            return;
        };

        let publication = Arc::new(DriverPublication::new(
            cmd.correlation_id,
            channel.clone(),
            log_buffers,
            sender_position_counter,
            limit_counter,
        ));

        if self
            .sender_commands
            .push(SenderCommand::AddPublication(Arc::clone(&publication)))
            .is_err()
        {
            self.counters.free(sender_position_counter);
            self.counters.free(limit_counter);
            let _ = std::fs::remove_dir_all(&dir);
            self.error_response(
                cmd.correlation_id,
                ErrorCode::GenericError,
                "sender queue full".to_string(),
            );
            return;
        }

        info!(
            channel = %channel,
            session_id,
            stream_id = cmd.stream_id,
            correlation_id = cmd.correlation_id,
            "publication created"
        );
        self.publications.push(PublicationRecord {
            publication,
            client_id: cmd.client_id,
            lingering: false,
        });

        let event = NewPublicationEvent {
            correlation_id: cmd.correlation_id,
            session_id,
            stream_id: cmd.stream_id,
            channel: channel.canonical().to_string(),
            initial_term_id,
            log_dir: dir.to_string_lossy().into_owned(),
            sender_position_counter,
            limit_counter,
        };
        self.publish(msg_type::ON_NEW_PUBLICATION, &event);
    }

    fn on_remove_publication(&mut self, cmd: PublicationCommand) {
        let Ok(channel) = UdpChannel::parse(&cmd.channel) else {
            self.error_response(
                cmd.correlation_id,
                ErrorCode::InvalidDestinationInPublication,
                cmd.channel.clone(),
            );
            return;
        };

        let found = self.publications.iter_mut().find(|p| {
            !p.lingering
                && p.client_id == cmd.client_id
                && p.publication.channel.canonical() == channel.canonical()
                && p.publication.stream_id == cmd.stream_id
        });
        let Some(record) = found else {
            self.error_response(
                cmd.correlation_id,
                ErrorCode::PublicationChannelUnknown,
                format!("{} stream {}", channel.canonical(), cmd.stream_id),
            );
            return;
        };

        record.lingering = true;
        let registration_id = record.publication.registration_id;
        if self
            .wheel
            .schedule_after(
                self.config.publication_linger,
                TimerEvent::PublicationLinger(registration_id),
            )
            .is_none()
        {
            warn!(registration_id, "timer wheel full, reclaiming publication now");
            self.reclaim_publication(registration_id);
        }
        self.operation_succeeded(cmd.correlation_id);
    }

    fn reclaim_publication(&mut self, registration_id: u64) {
        let Some(index) = self
            .publications
            .iter()
            .position(|p| p.publication.registration_id == registration_id)
        else {
            return;
        };
        let record = self.publications.swap_remove(index);

        if self
            .sender_commands
            .push(SenderCommand::RemovePublication { registration_id })
            .is_err()
        {
            warn!(registration_id, "sender queue full, dropping removal");
        }
        self.counters.free(record.publication.sender_position_counter);
        self.counters.free(record.publication.limit_counter);

        let dir = self.paths.publication_dir(
            &record.publication.channel,
            record.publication.session_id,
            record.publication.stream_id,
        );
        let _ = std::fs::remove_dir_all(dir);
        debug!(registration_id, "publication reclaimed");
    }

    fn on_add_subscription(&mut self, cmd: SubscriptionCommand) {
        let channel = match UdpChannel::parse(&cmd.channel) {
            Ok(channel) => channel,
            Err(e) => {
                self.error_response(cmd.correlation_id, ErrorCode::GenericError, e.to_string());
                return;
            }
        };

        let existing = self.subscriptions.iter_mut().find(|s| {
            s.channel.canonical() == channel.canonical() && s.stream_id == cmd.stream_id
        });
        match existing {
            Some(record) => record.clients.push(cmd.client_id),
            None => {
                if self
                    .receiver_commands
                    .push(ReceiverCommand::AddSubscription {
                        channel: channel.clone(),
                        stream_id: cmd.stream_id,
                    })
                    .is_err()
                {
                    self.error_response(
                        cmd.correlation_id,
                        ErrorCode::GenericError,
                        "receiver queue full".to_string(),
                    );
                    return;
                }
                info!(channel = %channel, stream_id = cmd.stream_id, "subscription created");
                self.subscriptions.push(SubscriptionRecord {
                    channel,
                    stream_id: cmd.stream_id,
                    clients: vec![cmd.client_id],
                });
            }
        }
        self.operation_succeeded(cmd.correlation_id);
    }

    fn on_remove_subscription(&mut self, cmd: SubscriptionCommand) {
        let Ok(channel) = UdpChannel::parse(&cmd.channel) else {
            self.error_response(cmd.correlation_id, ErrorCode::GenericError, cmd.channel.clone());
            return;
        };

        let Some(index) = self.subscriptions.iter().position(|s| {
            s.channel.canonical() == channel.canonical()
                && s.stream_id == cmd.stream_id
                && s.clients.contains(&cmd.client_id)
        }) else {
            self.error_response(
                cmd.correlation_id,
                ErrorCode::GenericError,
                format!("unknown subscription {} stream {}", cmd.channel, cmd.stream_id),
            );
            return;
        };

        let record = &mut self.subscriptions[index];
        let client_slot = record
            .clients
            .iter()
            .position(|&c| c == cmd.client_id)
            .expect("client checked above");
        record.clients.swap_remove(client_slot);

        if record.clients.is_empty() {
            let record = self.subscriptions.swap_remove(index);
            if self
                .receiver_commands
                .push(ReceiverCommand::RemoveSubscription {
                    channel: record.channel.clone(),
                    stream_id: record.stream_id,
                })
                .is_err()
            {
                warn!("receiver queue full, dropping subscription removal");
            }

            // Images fed by this subscription begin their linger.
            let image_ids: Vec<u64> = self
                .images
                .iter()
                .filter(|i| {
                    !i.lingering
                        && i.image.channel.canonical() == record.channel.canonical()
                        && i.image.stream_id == record.stream_id
                })
                .map(|i| i.image.correlation_id)
                .collect();
            for correlation_id in image_ids {
                self.start_image_linger(correlation_id);
            }
        }
        self.operation_succeeded(cmd.correlation_id);
    }

    fn process_receiver_events(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        while let Some(event) = self.receiver_events.pop() {
            work += 1;
            match event {
                ConductorEvent::CreateImage {
                    channel,
                    stream_id,
                    setup,
                    source,
                    control_address,
                } => {
                    self.on_create_image(channel, stream_id, setup, source, control_address, now_ns);
                }
                ConductorEvent::ImageInactive { correlation_id } => {
                    self.start_image_linger(correlation_id);
                }
            }
        }
        work
    }

    fn on_create_image(
        &mut self,
        channel: UdpChannel,
        stream_id: u32,
        setup: SetupFrame,
        source: crate::net::Endpoint,
        control_address: crate::net::Endpoint,
        now_ns: u64,
    ) {
        let subscribed = self.subscriptions.iter().any(|s| {
            s.channel.canonical() == channel.canonical() && s.stream_id == stream_id
        });
        if !subscribed {
            return;
        }

        let term_length = setup.term_length as usize;
        if !term_length.is_power_of_two() || term_length < log::TERM_MIN_LENGTH {
            warn!(term_length, "setup with unusable term length dropped");
            return;
        }

        let dir = self.paths.image_dir(&channel, setup.session_id, stream_id);
        // Image positions are image-local: the log starts at the term
        // that was active when this receiver joined.
        let log_buffers = match LogBuffers::create(
            &dir,
            term_length,
            setup.active_term_id,
            setup.session_id,
            stream_id,
            setup.mtu_length as usize,
        ) {
            Ok(log_buffers) => log_buffers,
            Err(e) => {
                warn!(error = %e, "image log allocation failed");
                return;
            }
        };

        let label = format!(
            "sub-pos: {} {}:{stream_id}",
            channel.canonical(),
            setup.session_id
        );
        let Ok(subscriber_position_counter) = self.counters.allocate(&label) else {
            warn!("counters exhausted, image dropped");
            let _ = std::fs::remove_dir_all(&dir);
            return;
        };

        let correlation_id = self.next_image_id;
        self.next_image_id += 1;

        let image = Arc::new(DriverImage::new(
            correlation_id,
            channel.clone(),
            control_address,
            log_buffers,
            subscriber_position_counter,
            now_ns,
        ));

        if self
            .receiver_commands
            .push(ReceiverCommand::NewImage(Arc::clone(&image)))
            .is_err()
        {
            warn!("receiver queue full, image dropped");
            self.counters.free(subscriber_position_counter);
            let _ = std::fs::remove_dir_all(&dir);
            return;
        }

        info!(
            channel = %channel,
            session_id = setup.session_id,
            stream_id,
            source = %source,
            "image created"
        );
        self.images.push(ImageRecord {
            image,
            lingering: false,
        });

        let event = NewImageEvent {
            correlation_id,
            session_id: setup.session_id,
            stream_id,
            channel: channel.canonical().to_string(),
            initial_term_id: setup.active_term_id,
            join_position: 0,
            log_dir: dir.to_string_lossy().into_owned(),
            subscriber_position_counter,
            source: source.to_string(),
        };
        self.publish(msg_type::ON_NEW_IMAGE, &event);
    }

    fn start_image_linger(&mut self, correlation_id: u64) {
        let Some(record) = self
            .images
            .iter_mut()
            .find(|i| !i.lingering && i.image.correlation_id == correlation_id)
        else {
            return;
        };
        record.lingering = true;

        if self
            .wheel
            .schedule_after(
                self.config.publication_linger,
                TimerEvent::ImageLinger(correlation_id),
            )
            .is_none()
        {
            warn!(correlation_id, "timer wheel full, reclaiming image now");
            self.reclaim_image(correlation_id);
        }
    }

    fn reclaim_image(&mut self, correlation_id: u64) {
        let Some(index) = self
            .images
            .iter()
            .position(|i| i.image.correlation_id == correlation_id)
        else {
            return;
        };
        let record = self.images.swap_remove(index);

        if self
            .receiver_commands
            .push(ReceiverCommand::RemoveImage { correlation_id })
            .is_err()
        {
            warn!(correlation_id, "receiver queue full, dropping image removal");
        }
        self.counters.free(record.image.subscriber_position_counter);

        let event = InactiveImageEvent {
            correlation_id,
            session_id: record.image.session_id,
            stream_id: record.image.stream_id,
            channel: record.image.channel.canonical().to_string(),
        };
        self.publish(msg_type::ON_INACTIVE_IMAGE, &event);

        let dir = self.paths.image_dir(
            &record.image.channel,
            record.image.session_id,
            record.image.stream_id,
        );
        let _ = std::fs::remove_dir_all(dir);
        debug!(correlation_id, "image reclaimed");
    }

    fn process_timers(&mut self, now_ns: u64) -> usize {
        let mut fired = Vec::new();
        let count = self.wheel.poll(now_ns, |event| fired.push(event));

        for event in fired {
            match event {
                TimerEvent::ClientTimeout(client_id) => self.on_client_timeout(client_id),
                TimerEvent::PublicationLinger(registration_id) => {
                    self.reclaim_publication(registration_id);
                }
                TimerEvent::ImageLinger(correlation_id) => self.reclaim_image(correlation_id),
            }
        }
        count
    }

    /// Removes every resource owned by a client that stopped sending
    /// keepalives.
    fn on_client_timeout(&mut self, client_id: u64) {
        info!(client_id, "client liveness expired, reclaiming resources");
        self.clients.remove(&client_id);

        let registrations: Vec<u64> = self
            .publications
            .iter()
            .filter(|p| p.client_id == client_id)
            .map(|p| p.publication.registration_id)
            .collect();
        for registration_id in registrations {
            self.reclaim_publication(registration_id);
        }

        let mut removals = Vec::new();
        for record in &mut self.subscriptions {
            record.clients.retain(|&c| c != client_id);
            if record.clients.is_empty() {
                removals.push((record.channel.clone(), record.stream_id));
            }
        }
        self.subscriptions.retain(|s| !s.clients.is_empty());
        for (channel, stream_id) in removals {
            if self
                .receiver_commands
                .push(ReceiverCommand::RemoveSubscription {
                    channel: channel.clone(),
                    stream_id,
                })
                .is_err()
            {
                warn!("receiver queue full, dropping subscription removal");
            }
            let image_ids: Vec<u64> = self
                .images
                .iter()
                .filter(|i| {
                    !i.lingering
                        && i.image.channel.canonical() == channel.canonical()
                        && i.image.stream_id == stream_id
                })
                .map(|i| i.image.correlation_id)
                .collect();
            for correlation_id in image_ids {
                self.start_image_linger(correlation_id);
            }
        }
    }

    /// Zeroes at most one DIRTY partition whose consumers are past it.
    fn clean_terms(&mut self) -> usize {
        for record in &self.publications {
            let log_buffers = &record.publication.log;
            if let Some(partition) = log_buffers.dirty_partition() {
                let end = record.publication.partition_end_position(partition);
                if record.publication.sender_position() >= end {
                    log_buffers.clean_partition(partition);
                    return 1;
                }
            }
        }

        for record in &self.images {
            let log_buffers = &record.image.log;
            if let Some(partition) = log_buffers.dirty_partition() {
                let term_id = (log_buffers.raw_tail(partition) >> 32) as u32;
                let end = log::compute_position(
                    term_id.wrapping_add(1),
                    0,
                    log_buffers.term_length(),
                    log_buffers.initial_term_id(),
                );
                let subscriber = self
                    .counters
                    .reader()
                    .get(record.image.subscriber_position_counter);
                if record.image.rebuild_position() >= end && subscriber >= end {
                    log_buffers.clean_partition(partition);
                    return 1;
                }
            }
        }

        0
    }

    fn publish<T: serde::Serialize>(&mut self, msg_type_id: u32, body: &T) {
        match control::encode(body) {
            Ok(bytes) => {
                if let Err(e) = self.broadcast.transmit(msg_type_id, &bytes) {
                    warn!(error = %e, "broadcast transmit failed");
                }
            }
            Err(e) => warn!(error = %e, "control encode failed"),
        }
    }

    fn operation_succeeded(&mut self, correlation_id: u64) {
        let event = OperationSucceededEvent { correlation_id };
        self.publish(msg_type::OPERATION_SUCCEEDED, &event);
    }

    fn error_response(&mut self, correlation_id: u64, code: ErrorCode, message: String) {
        debug!(correlation_id, code = %code, message = %message, "error response");
        let event = ErrorResponseEvent {
            correlation_id,
            code,
            message,
        };
        self.publish(msg_type::ERROR_RESPONSE, &event);
    }
}

impl Agent for Conductor {
    fn do_work(&mut self) -> usize {
        let now_ns = self.clock.now_ns();
        let mut work = 0;
        work += self.process_client_commands(now_ns);
        work += self.process_receiver_events(now_ns);
        work += self.process_timers(now_ns);
        work += self.clean_terms();
        work
    }

    fn on_close(&mut self) {
        // Orderly shutdown reclaims every live resource so the driver
        // directory can be removed.
        let registrations: Vec<u64> = self
            .publications
            .iter()
            .map(|p| p.publication.registration_id)
            .collect();
        for registration_id in registrations {
            self.reclaim_publication(registration_id);
        }
        let image_ids: Vec<u64> = self.images.iter().map(|i| i.image.correlation_id).collect();
        for correlation_id in image_ids {
            self.reclaim_image(correlation_id);
        }
    }
}
