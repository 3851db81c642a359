//! The sender agent.
//!
//! Owns the outbound sockets. Each duty cycle it applies conductor
//! commands, drains status messages and NAKs from its sockets, then for
//! each publication: transmits new data within the flow-control window,
//! services retransmits (after new data, never ahead of it), and keeps
//! the stream alive with SETUP frames while unconnected and heartbeats
//! while idle.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::agent::Agent;
use crate::buffer::counters::CountersReader;
use crate::buffer::log;
use crate::concurrent::spsc;
use crate::event::{EventCode, EventTags};
use crate::net::{ChannelMode, Endpoint, UdpChannel, UdpSocket};
use crate::protocol::frame::{self, Frame};
use crate::timing::MonotonicClock;
use crate::trace::{debug, info, trace, warn};

use super::SystemCounters;
use super::commands::SenderCommand;
use super::flow::{SenderFlowControl, flow_control_for};
use super::publication::DriverPublication;
use super::retransmit::RetransmitHandler;

/// Sender tuning, derived from the driver configuration.
pub struct SenderConfig {
    pub mtu_length: usize,
    pub initial_window: usize,
    pub multicast_interface: Ipv4Addr,
    pub setup_interval_ns: u64,
    pub heartbeat_interval_ns: u64,
    pub receiver_timeout: std::time::Duration,
    pub connection_grace_ns: u64,
    pub retransmit_delay: std::time::Duration,
    pub retransmit_linger: std::time::Duration,
    pub events: EventTags,
}

struct SendChannel {
    socket: UdpSocket,
    refs: usize,
}

struct PublicationEntry {
    publication: std::sync::Arc<DriverPublication>,
    flow: Box<dyn SenderFlowControl>,
    retransmit: RetransmitHandler,
    channel_key: String,
    created_ns: u64,
    next_setup_ns: u64,
    last_send_ns: u64,
}

/// The sender agent state.
pub struct Sender {
    commands: spsc::Consumer<SenderCommand>,
    entries: Vec<PublicationEntry>,
    channels: HashMap<String, SendChannel>,
    counters: CountersReader,
    system: SystemCounters,
    clock: MonotonicClock,
    config: SenderConfig,
    recv_buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl Sender {
    /// Creates the sender.
    #[must_use]
    pub fn new(
        commands: spsc::Consumer<SenderCommand>,
        counters: CountersReader,
        system: SystemCounters,
        clock: MonotonicClock,
        config: SenderConfig,
    ) -> Self {
        Self {
            commands,
            entries: Vec::new(),
            channels: HashMap::new(),
            counters,
            system,
            clock,
            config,
            recv_buf: vec![0u8; 65535],
            scratch: Vec::with_capacity(64),
        }
    }

    fn process_commands(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        while let Some(command) = self.commands.pop() {
            work += 1;
            match command {
                SenderCommand::AddPublication(publication) => {
                    self.add_publication(publication, now_ns);
                }
                SenderCommand::RemovePublication { registration_id } => {
                    self.remove_publication(registration_id);
                }
            }
        }
        work
    }

    fn add_publication(&mut self, publication: std::sync::Arc<DriverPublication>, now_ns: u64) {
        let channel = publication.channel.clone();
        let key = channel.canonical().to_string();

        if !self.channels.contains_key(&key) {
            let socket = match open_send_socket(&channel, self.config.multicast_interface) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "cannot open send channel");
                    self.system.increment_channel_errors(&self.counters);
                    return;
                }
            };
            info!(channel = %channel, "send channel created");
            self.channels.insert(key.clone(), SendChannel { socket, refs: 0 });
        }
        self.channels
            .get_mut(&key)
            .expect("channel just ensured")
            .refs += 1;

        let flow = flow_control_for(
            channel.mode(),
            publication.log.initial_term_id(),
            publication.log.term_length(),
            self.config.receiver_timeout,
        );

        info!(
            channel = %channel,
            session_id = publication.session_id,
            stream_id = publication.stream_id,
            "publication added to sender"
        );
        self.entries.push(PublicationEntry {
            publication,
            flow,
            retransmit: RetransmitHandler::new(
                self.config.retransmit_delay,
                self.config.retransmit_linger,
            ),
            channel_key: key,
            created_ns: now_ns,
            next_setup_ns: now_ns,
            last_send_ns: now_ns,
        });
    }

    fn remove_publication(&mut self, registration_id: u64) {
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.publication.registration_id == registration_id)
        {
            let entry = self.entries.swap_remove(index);
            debug!(registration_id, "publication removed from sender");
            if let Some(channel) = self.channels.get_mut(&entry.channel_key) {
                channel.refs -= 1;
                if channel.refs == 0 {
                    self.channels.remove(&entry.channel_key);
                }
            }
        }
    }

    /// Drains SM and NAK frames from every send channel.
    fn drain_feedback(&mut self, now_ns: u64) -> usize {
        let mut work = 0;

        for (key, channel) in &self.channels {
            loop {
                let (length, from) = match channel.socket.try_recv_from(&mut self.recv_buf) {
                    Ok(Some(received)) => received,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "send channel receive error");
                        break;
                    }
                };
                work += 1;

                match frame::decode(&self.recv_buf[..length]) {
                    Ok(Frame::StatusMessage(sm)) => {
                        trace!(session_id = sm.session_id, "status message");
                        for entry in &mut self.entries {
                            if entry.channel_key == *key
                                && entry.publication.session_id == sm.session_id
                                && entry.publication.stream_id == sm.stream_id
                            {
                                let limit = entry.flow.on_status_message(&sm, from, now_ns);
                                entry.publication.update_limit(limit, &self.counters);
                            }
                        }
                    }
                    Ok(Frame::Nak(nak)) => {
                        debug!(
                            session_id = nak.session_id,
                            term_id = nak.term_id,
                            gap_offset = nak.gap_offset,
                            gap_length = nak.gap_length,
                            "nak"
                        );
                        for entry in &mut self.entries {
                            if entry.channel_key == *key
                                && entry.publication.session_id == nak.session_id
                                && entry.publication.stream_id == nak.stream_id
                            {
                                entry.retransmit.on_nak(
                                    nak.term_id,
                                    nak.gap_offset,
                                    nak.gap_length,
                                    now_ns,
                                );
                            }
                        }
                    }
                    Ok(_) => {
                        // DATA and SETUP are inbound concepts here.
                        self.system.increment_wire_errors(&self.counters);
                    }
                    Err(_) => {
                        self.system.increment_wire_errors(&self.counters);
                    }
                }
            }
        }

        work
    }

    fn service_publications(&mut self, now_ns: u64) -> usize {
        let mut work = 0;

        for entry in &mut self.entries {
            let Some(channel) = self.channels.get(&entry.channel_key) else {
                continue;
            };
            work += service(
                entry,
                &channel.socket,
                &self.counters,
                &self.system,
                &self.config,
                &mut self.scratch,
                now_ns,
            );
        }

        work
    }
}

fn open_send_socket(channel: &UdpChannel, interface: Ipv4Addr) -> std::io::Result<UdpSocket> {
    match channel.mode() {
        // Unicast feedback returns to the sending socket's address.
        ChannelMode::Unicast => UdpSocket::bind(Endpoint::any(0)),
        // Multicast feedback travels on the control group.
        ChannelMode::Multicast => {
            UdpSocket::bind_multicast(channel.control_endpoint(), interface)
        }
    }
}

fn service(
    entry: &mut PublicationEntry,
    socket: &UdpSocket,
    counters: &CountersReader,
    system: &SystemCounters,
    config: &SenderConfig,
    scratch: &mut Vec<u8>,
    now_ns: u64,
) -> usize {
    let mut work = 0;
    let publication = &entry.publication;
    let data_endpoint = publication.channel.data_endpoint();

    // Flow-control upkeep. During the establishment grace period an
    // unconnected publication may run one blind window ahead (a late
    // joiner repairs the head of its term via NAKs); past the grace
    // period the limit pins to the sender position, which stops both
    // transmission and the publisher's append path.
    let sender_position = publication.sender_position();
    let flow_limit = entry.flow.on_idle(now_ns);
    let limit = if entry.flow.has_receivers() {
        flow_limit.max(sender_position)
    } else if now_ns < entry.created_ns + config.connection_grace_ns {
        sender_position + config.initial_window as u64
    } else {
        sender_position
    };
    publication.update_limit(limit, counters);

    // New data within the window.
    if limit > sender_position {
        let burst = config.mtu_length * 4;
        let new_position = publication.log.scan(sender_position, limit, burst, |frame_bytes| {
            // PAD frames can span most of a term; their header alone
            // carries the full padded extent, so only it goes out.
            let wire = if frame::is_pad(frame_bytes) {
                &frame_bytes[..frame::DATA_HEADER_LENGTH.min(frame_bytes.len())]
            } else {
                frame_bytes
            };
            matches!(socket.try_send_to(wire, data_endpoint), Ok(Some(_)))
        });
        if new_position > sender_position {
            if config.events.enabled(EventCode::FrameOut) {
                debug!(
                    session_id = publication.session_id,
                    stream_id = publication.stream_id,
                    from = sender_position,
                    to = new_position,
                    "frames out"
                );
            }
            publication.update_sender_position(new_position, counters);
            entry.last_send_ns = now_ns;
            work += 1;
        }
    }

    // Retransmits ride behind new data.
    work += entry.retransmit.poll(now_ns, |term_id, term_offset, length| {
        resend_range(publication, socket, system, counters, term_id, term_offset, length);
    });

    // SETUP cadence while no receiver is known.
    if !entry.flow.has_receivers() && now_ns >= entry.next_setup_ns {
        let position = publication.producer_position();
        let log_buffers = &publication.log;
        frame::encode_setup(
            scratch,
            &frame::SetupFrame {
                session_id: publication.session_id,
                stream_id: publication.stream_id,
                initial_term_id: log_buffers.initial_term_id(),
                active_term_id: log::compute_term_id(
                    position,
                    log_buffers.term_length(),
                    log_buffers.initial_term_id(),
                ),
                term_length: log_buffers.term_length() as u32,
                mtu_length: config.mtu_length as u32,
            },
        );
        if matches!(socket.try_send_to(scratch, data_endpoint), Ok(Some(_))) {
            system.increment_setups_sent(counters);
            entry.next_setup_ns = now_ns + config.setup_interval_ns;
            work += 1;
        }
    }

    // Heartbeat during idle stretches keeps receiver liveness and lets
    // loss surface at the stream tail.
    if entry.flow.has_receivers()
        && now_ns.saturating_sub(entry.last_send_ns) >= config.heartbeat_interval_ns
    {
        let position = publication.producer_position();
        let log_buffers = &publication.log;
        let term_length = log_buffers.term_length();
        let initial = log_buffers.initial_term_id();
        frame::encode_heartbeat(
            scratch,
            publication.session_id,
            publication.stream_id,
            log::compute_term_id(position, term_length, initial),
            log::compute_term_offset(position, term_length),
        );
        if matches!(socket.try_send_to(scratch, data_endpoint), Ok(Some(_))) {
            system.increment_heartbeats_sent(counters);
            entry.last_send_ns = now_ns;
            work += 1;
        }
    }

    work
}

/// Resends committed frames overlapping `[term_offset, term_offset + length)`.
fn resend_range(
    publication: &DriverPublication,
    socket: &UdpSocket,
    system: &SystemCounters,
    counters: &CountersReader,
    term_id: u32,
    term_offset: u32,
    length: u32,
) {
    let log_buffers = &publication.log;
    let partition = log_buffers.partition_for_term(term_id);
    if log_buffers.partition_status(partition) == log::STATUS_CLEAN {
        // The term has been recycled; nothing to resend.
        return;
    }
    let term = log_buffers.term_buffer(partition);
    let data_endpoint = publication.channel.data_endpoint();
    let end = (term_offset as usize + length as usize).min(log_buffers.term_length());

    let mut offset = term_offset as usize;
    while offset < end {
        let frame_length = log::frame_length_volatile(&term, offset) as usize;
        if frame_length == 0 {
            break;
        }
        let frame_bytes = term.bytes_at(offset, frame_length);
        let wire = if frame::is_pad(frame_bytes) {
            &frame_bytes[..frame::DATA_HEADER_LENGTH.min(frame_bytes.len())]
        } else {
            frame_bytes
        };
        match socket.try_send_to(wire, data_endpoint) {
            Ok(Some(_)) => system.increment_retransmits_sent(counters),
            _ => break,
        }
        offset += crate::concurrent::align(frame_length, frame::FRAME_ALIGNMENT);
    }
}

impl Agent for Sender {
    fn do_work(&mut self) -> usize {
        let now_ns = self.clock.now_ns();
        let mut work = 0;
        work += self.process_commands(now_ns);
        work += self.drain_feedback(now_ns);
        work += self.service_publications(now_ns);
        work
    }

    fn on_close(&mut self) {
        self.entries.clear();
        self.channels.clear();
    }
}
