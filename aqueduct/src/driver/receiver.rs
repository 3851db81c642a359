//! The receiver agent.
//!
//! Owns the inbound sockets, multiplexed through one `mio::Poll`. Each
//! duty cycle it applies conductor commands, drains readable datagrams
//! and dispatches them by frame type, then walks its images: rebuild,
//! loss detection (NAK emission), status-message cadence, and liveness.
//! New sources surface as `CreateImage` events to the conductor, which
//! allocates the log and hands the image back over the command queue.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::agent::Agent;
use crate::buffer::counters::CountersReader;
use crate::buffer::log;
use crate::concurrent::spsc;
use crate::event::{EventCode, EventTags};
use crate::net::{ChannelMode, Endpoint, UdpChannel, UdpSocket};
use crate::protocol::frame::{self, Frame, FrameHeader};
use crate::timing::MonotonicClock;
use crate::trace::{debug, info, trace, warn};

use super::SystemCounters;
use super::commands::{ConductorEvent, ReceiverCommand};
use super::image::{self, DriverImage, PacketOutcome};
use super::loss::{LossDetector, OptimalMulticastDelayGenerator, StaticDelayGenerator};

/// Receiver tuning, derived from the driver configuration.
pub struct ReceiverConfig {
    pub rcv_buffer_size: usize,
    pub initial_window: u32,
    pub multicast_interface: Ipv4Addr,
    pub sm_interval_ns: u64,
    pub image_liveness_timeout_ns: u64,
    pub nak_unicast_delay: Duration,
    pub nak_grtt: Duration,
    pub nak_group_size: u32,
    pub nak_max_backoff: Duration,
    pub events: EventTags,
}

struct ReceiveChannel {
    socket: UdpSocket,
    channel: UdpChannel,
    /// Subscribed stream ids with reference counts.
    streams: HashMap<u32, usize>,
}

struct ImageEntry {
    image: Arc<DriverImage>,
    loss: LossDetector,
    next_sm_deadline_ns: u64,
    last_sm_position: u64,
    inactive_reported: bool,
}

type ImageKey = (String, u32, u32);

/// How long a forwarded setup request suppresses re-requests.
const PENDING_IMAGE_TIMEOUT_NS: u64 = 1_000_000_000;

/// The receiver agent state.
pub struct Receiver {
    poll: Poll,
    events: Events,
    commands: spsc::Consumer<ReceiverCommand>,
    conductor: spsc::Producer<ConductorEvent>,
    channels: HashMap<usize, ReceiveChannel>,
    channel_tokens: HashMap<String, usize>,
    images: Vec<ImageEntry>,
    image_index: HashMap<ImageKey, usize>,
    /// Setup requests forwarded to the conductor, by request time; a
    /// request the conductor could not satisfy is retried after
    /// [`PENDING_IMAGE_TIMEOUT_NS`].
    pending_images: HashMap<ImageKey, u64>,
    next_token: usize,
    counters: CountersReader,
    system: SystemCounters,
    clock: MonotonicClock,
    config: ReceiverConfig,
    recv_buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl Receiver {
    /// Creates the receiver.
    ///
    /// # Errors
    ///
    /// Fails if the poll instance cannot be created, which is fatal at
    /// driver initialization.
    pub fn new(
        commands: spsc::Consumer<ReceiverCommand>,
        conductor: spsc::Producer<ConductorEvent>,
        counters: CountersReader,
        system: SystemCounters,
        clock: MonotonicClock,
        config: ReceiverConfig,
    ) -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            commands,
            conductor,
            channels: HashMap::new(),
            channel_tokens: HashMap::new(),
            images: Vec::new(),
            image_index: HashMap::new(),
            pending_images: HashMap::new(),
            next_token: 0,
            counters,
            system,
            clock,
            config,
            recv_buf: vec![0u8; 65535],
            scratch: Vec::with_capacity(64),
        })
    }

    fn process_commands(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        while let Some(command) = self.commands.pop() {
            work += 1;
            match command {
                ReceiverCommand::AddSubscription { channel, stream_id } => {
                    self.add_subscription(channel, stream_id);
                }
                ReceiverCommand::RemoveSubscription { channel, stream_id } => {
                    self.remove_subscription(&channel, stream_id);
                }
                ReceiverCommand::NewImage(image) => {
                    self.add_image(image, now_ns);
                }
                ReceiverCommand::RemoveImage { correlation_id } => {
                    self.remove_image(correlation_id);
                }
            }
        }
        work
    }

    fn add_subscription(&mut self, channel: UdpChannel, stream_id: u32) {
        let key = channel.canonical().to_string();

        if let Some(&token) = self.channel_tokens.get(&key) {
            let entry = self.channels.get_mut(&token).expect("token maps to channel");
            *entry.streams.entry(stream_id).or_insert(0) += 1;
            return;
        }

        let mut socket = match open_receive_socket(&channel, self.config.multicast_interface) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(channel = %channel, error = %e, "cannot open receive channel");
                self.system.increment_channel_errors(&self.counters);
                return;
            }
        };
        if let Err(e) = socket.set_recv_buffer_size(self.config.rcv_buffer_size) {
            debug!(channel = %channel, error = %e, "recv buffer size not applied");
        }

        let token = self.next_token;
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut socket, Token(token), Interest::READABLE)
        {
            warn!(channel = %channel, error = %e, "cannot register receive channel");
            self.system.increment_channel_errors(&self.counters);
            return;
        }

        info!(channel = %channel, stream_id, "receive channel created");
        let mut streams = HashMap::new();
        streams.insert(stream_id, 1);
        self.channels.insert(
            token,
            ReceiveChannel {
                socket,
                channel,
                streams,
            },
        );
        self.channel_tokens.insert(key, token);
    }

    fn remove_subscription(&mut self, channel: &UdpChannel, stream_id: u32) {
        let key = channel.canonical().to_string();
        let Some(&token) = self.channel_tokens.get(&key) else {
            return;
        };

        let close = {
            let entry = self.channels.get_mut(&token).expect("token maps to channel");
            if let Some(refs) = entry.streams.get_mut(&stream_id) {
                *refs -= 1;
                if *refs == 0 {
                    entry.streams.remove(&stream_id);
                }
            }
            entry.streams.is_empty()
        };

        if close {
            if let Some(mut entry) = self.channels.remove(&token) {
                let _ = self.poll.registry().deregister(&mut entry.socket);
                info!(channel = %entry.channel, "receive channel closed");
            }
            self.channel_tokens.remove(&key);
        }
    }

    fn add_image(&mut self, image: Arc<DriverImage>, now_ns: u64) {
        let key = (
            image.channel.canonical().to_string(),
            image.session_id,
            image.stream_id,
        );
        self.pending_images.remove(&key);

        let generator: Box<dyn super::loss::FeedbackDelayGenerator> = match image.channel.mode() {
            ChannelMode::Unicast => {
                Box::new(StaticDelayGenerator::new(self.config.nak_unicast_delay))
            }
            ChannelMode::Multicast => Box::new(OptimalMulticastDelayGenerator::new(
                self.config.nak_grtt,
                self.config.nak_group_size,
                self.config.nak_max_backoff,
            )),
        };

        info!(
            channel = %image.channel,
            session_id = image.session_id,
            stream_id = image.stream_id,
            "image added to receiver"
        );
        self.image_index.insert(key, self.images.len());
        self.images.push(ImageEntry {
            image,
            loss: LossDetector::new(generator),
            // Immediate first SM announces the join to the sender.
            next_sm_deadline_ns: now_ns,
            last_sm_position: 0,
            inactive_reported: false,
        });
    }

    fn remove_image(&mut self, correlation_id: u64) {
        if let Some(index) = self
            .images
            .iter()
            .position(|e| e.image.correlation_id == correlation_id)
        {
            let entry = self.images.swap_remove(index);
            let key = (
                entry.image.channel.canonical().to_string(),
                entry.image.session_id,
                entry.image.stream_id,
            );
            self.image_index.remove(&key);
            // The swap moved the tail entry; refresh its index.
            if index < self.images.len() {
                let moved = &self.images[index];
                let moved_key = (
                    moved.image.channel.canonical().to_string(),
                    moved.image.session_id,
                    moved.image.stream_id,
                );
                self.image_index.insert(moved_key, index);
            }
            debug!(correlation_id, "image removed from receiver");
        }
    }

    fn drain_sockets(&mut self, now_ns: u64) -> usize {
        if self
            .poll
            .poll(&mut self.events, Some(Duration::ZERO))
            .is_err()
        {
            return 0;
        }

        let mut ready = Vec::new();
        for event in &self.events {
            ready.push(event.token().0);
        }

        let mut work = 0;
        for token in ready {
            work += self.drain_channel(token, now_ns);
        }
        work
    }

    fn drain_channel(&mut self, token: usize, now_ns: u64) -> usize {
        let mut work = 0;

        loop {
            let Some(channel) = self.channels.get(&token) else {
                break;
            };
            let (length, from) = match channel.socket.try_recv_from(&mut self.recv_buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "receive channel error");
                    break;
                }
            };
            work += 1;
            if self.config.events.enabled(EventCode::FrameIn) {
                debug!(from = %from, length, "frame in");
            }

            let canonical = channel.channel.canonical().to_string();
            match frame::decode(&self.recv_buf[..length]) {
                Ok(Frame::Setup(setup)) => {
                    Self::dispatch_setup(
                        &self.channels,
                        &self.image_index,
                        &mut self.pending_images,
                        &self.conductor,
                        token,
                        &canonical,
                        setup,
                        from,
                        now_ns,
                    );
                }
                // PAD advances the stream exactly like data, minus the
                // payload.
                Ok(Frame::Data { header, frame, .. }) => {
                    Self::dispatch_data(
                        &mut self.images,
                        &self.image_index,
                        &self.system,
                        &self.counters,
                        &canonical,
                        header,
                        frame,
                        now_ns,
                    );
                }
                Ok(Frame::Pad { header }) => {
                    Self::dispatch_data(
                        &mut self.images,
                        &self.image_index,
                        &self.system,
                        &self.counters,
                        &canonical,
                        header,
                        &self.recv_buf[..length],
                        now_ns,
                    );
                }
                Ok(Frame::Nak(_) | Frame::StatusMessage(_)) => {
                    // Outbound concepts; a mis-delivered copy is dropped.
                    trace!("control frame on receive channel ignored");
                }
                Err(e) => {
                    debug!(error = %e, from = %from, "malformed frame dropped");
                    self.system.increment_wire_errors(&self.counters);
                }
            }
        }

        work
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_setup(
        channels: &HashMap<usize, ReceiveChannel>,
        image_index: &HashMap<ImageKey, usize>,
        pending_images: &mut HashMap<ImageKey, u64>,
        conductor: &spsc::Producer<ConductorEvent>,
        token: usize,
        canonical: &str,
        setup: frame::SetupFrame,
        from: Endpoint,
        now_ns: u64,
    ) {
        let Some(channel) = channels.get(&token) else {
            return;
        };
        if !channel.streams.contains_key(&setup.stream_id) {
            return;
        }

        let key = (canonical.to_string(), setup.session_id, setup.stream_id);
        if image_index.contains_key(&key) {
            return;
        }
        if let Some(&requested_ns) = pending_images.get(&key) {
            if now_ns.saturating_sub(requested_ns) < PENDING_IMAGE_TIMEOUT_NS {
                return;
            }
        }

        let control_address = match channel.channel.mode() {
            ChannelMode::Unicast => from,
            ChannelMode::Multicast => channel.channel.control_endpoint(),
        };

        debug!(
            channel = %channel.channel,
            session_id = setup.session_id,
            stream_id = setup.stream_id,
            source = %from,
            "setup received, requesting image"
        );
        let event = ConductorEvent::CreateImage {
            channel: channel.channel.clone(),
            stream_id: setup.stream_id,
            setup,
            source: from,
            control_address,
        };
        if conductor.push(event).is_ok() {
            pending_images.insert(key, now_ns);
        } else {
            warn!("conductor queue full, dropping image request");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_data(
        images: &mut [ImageEntry],
        image_index: &HashMap<ImageKey, usize>,
        system: &SystemCounters,
        counters: &CountersReader,
        canonical: &str,
        header: FrameHeader,
        frame_bytes: &[u8],
        now_ns: u64,
    ) {
        let key = (canonical.to_string(), header.session_id, header.stream_id);
        let Some(&index) = image_index.get(&key) else {
            trace!(session_id = header.session_id, "data for unknown image dropped");
            return;
        };

        let entry = &mut images[index];
        match entry.image.insert_packet(header.term_id, header.term_offset, frame_bytes, now_ns) {
            PacketOutcome::Inserted(_) | PacketOutcome::Heartbeat | PacketOutcome::Duplicate => {
                entry.inactive_reported = false;
            }
            PacketOutcome::OutOfWindow | PacketOutcome::NotClean => {
                system.increment_wire_errors(counters);
            }
        }
    }

    fn service_images(&mut self, now_ns: u64) -> usize {
        let mut work = 0;

        for index in 0..self.images.len() {
            let entry = &mut self.images[index];
            let image = Arc::clone(&entry.image);

            work += image.rebuild();

            // Loss detection against the rebuilt prefix.
            let rebuild = image.rebuild_position();
            let hwm = image.hwm_position();
            let channel_token = self.channel_tokens.get(image.channel.canonical()).copied();
            if let Some(token) = channel_token {
                if let Some(channel) = self.channels.get(&token) {
                    let scratch = &mut self.scratch;
                    let system = &self.system;
                    let counters = &self.counters;
                    work += entry.loss.scan(&image.log, rebuild, hwm, now_ns, |gap| {
                        frame::encode_nak(
                            scratch,
                            &frame::NakFrame {
                                session_id: image.session_id,
                                stream_id: image.stream_id,
                                term_id: gap.term_id,
                                gap_offset: gap.term_offset,
                                gap_length: gap.length,
                            },
                        );
                        if matches!(
                            channel.socket.try_send_to(scratch, image.control_address),
                            Ok(Some(_))
                        ) {
                            system.increment_naks_sent(counters);
                        }
                    });

                    // Status-message cadence: periodic, or after enough
                    // consumption to matter for the sender's window. The
                    // consumption position is the subscriber's counter.
                    let consumption = self.counters.get(image.subscriber_position_counter);
                    let window_consumed = consumption.saturating_sub(entry.last_sm_position)
                        >= u64::from(self.config.initial_window / 2);
                    if now_ns >= entry.next_sm_deadline_ns || window_consumed {
                        let term_length = image.log.term_length();
                        let initial = image.log.initial_term_id();
                        frame::encode_status_message(
                            scratch,
                            &frame::StatusMessageFrame {
                                session_id: image.session_id,
                                stream_id: image.stream_id,
                                consumption_term_id: log::compute_term_id(
                                    consumption,
                                    term_length,
                                    initial,
                                ),
                                consumption_term_offset: log::compute_term_offset(
                                    consumption,
                                    term_length,
                                ),
                                receiver_window: self.config.initial_window,
                            },
                        );
                        if matches!(
                            channel.socket.try_send_to(scratch, image.control_address),
                            Ok(Some(_))
                        ) {
                            self.system.increment_status_messages_sent(&self.counters);
                            entry.next_sm_deadline_ns = now_ns + self.config.sm_interval_ns;
                            entry.last_sm_position = consumption;
                            work += 1;
                        }
                    }
                }
            }

            // Liveness.
            let silent_ns = now_ns.saturating_sub(image.last_packet_ns());
            if silent_ns >= self.config.image_liveness_timeout_ns
                && image.state() == image::STATE_ACTIVE
                && !entry.inactive_reported
            {
                image.set_state(image::STATE_INACTIVE);
                entry.inactive_reported = true;
                info!(
                    session_id = image.session_id,
                    stream_id = image.stream_id,
                    "image inactive"
                );
                if self
                    .conductor
                    .push(ConductorEvent::ImageInactive {
                        correlation_id: image.correlation_id,
                    })
                    .is_err()
                {
                    // Queue full: report again next cycle.
                    entry.inactive_reported = false;
                }
                work += 1;
            }
        }

        work
    }
}

fn open_receive_socket(channel: &UdpChannel, interface: Ipv4Addr) -> std::io::Result<UdpSocket> {
    match channel.mode() {
        ChannelMode::Unicast => UdpSocket::bind(channel.data_endpoint()),
        ChannelMode::Multicast => {
            UdpSocket::bind_multicast(channel.data_endpoint(), interface)
        }
    }
}

impl Agent for Receiver {
    fn do_work(&mut self) -> usize {
        let now_ns = self.clock.now_ns();
        let mut work = 0;
        work += self.process_commands(now_ns);
        work += self.drain_sockets(now_ns);
        work += self.service_images(now_ns);
        work
    }

    fn on_close(&mut self) {
        self.images.clear();
        self.channels.clear();
    }
}
