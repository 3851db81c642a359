//! Driver configuration.
//!
//! Configuration is a plain struct with defaults plus a [`DriverConfig::validate`]
//! step that checks derived constraints (power-of-two buffer lengths, sane
//! timeouts) before the driver maps any files. Properties are resolved from
//! the process environment using the historical property names, so existing
//! deployment scripts keep working unchanged.
//!
//! Sizes accept `k`/`K`, `m`/`M`, `g`/`G` suffixes (1024-based). Durations
//! accept `ns`, `us`, `ms`, `s` (case-insensitive); `g` is not a duration
//! suffix. Overflow of the signed 64-bit range is an error.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::concurrent::{broadcast, ring};
use crate::event::{self, EventTags};

/// Property names resolved from the environment. Names are kept verbatim
/// for compatibility with existing deployments.
pub mod properties {
    /// Per-socket read buffer size in bytes.
    pub const RCV_BUFFER_SIZE: &str = "aeron.rcv.buffer.size";
    /// Inter-agent command queue capacity hint in bytes.
    pub const COMMAND_BUFFER_SIZE: &str = "aeron.command.buffer.size";
    /// To-driver command ring size in bytes (excluding trailer).
    pub const CONDUCTOR_BUFFER_SIZE: &str = "aeron.conductor.buffer.size";
    /// To-clients broadcast buffer size in bytes (excluding trailer).
    pub const TO_CLIENTS_BUFFER_SIZE: &str = "aeron.clients.buffer.size";
    /// Size of the counters values/labels files in bytes.
    pub const COUNTERS_BUFFER_SIZE: &str = "aeron.dir.counters.size";
    /// Interface selector for multicast sockets.
    pub const MULTICAST_DEFAULT_INTERFACE: &str = "aeron.multicast.default.interface";
    /// Comma-separated list of enabled event codes, or `all`.
    pub const EVENT_LOG: &str = "aeron.event.log";
    /// Base directory for all driver files.
    pub const DIR: &str = "aeron.dir";
    /// Delete the driver directory on orderly shutdown.
    pub const DIR_DELETE_ON_EXIT: &str = "aeron.dir.delete.on.exit";
    /// Term length in bytes for newly allocated logs.
    pub const TERM_LENGTH: &str = "aeron.term.buffer.length";
    /// Maximum transmission unit for outbound frames.
    pub const MTU_LENGTH: &str = "aeron.mtu.length";
}

/// Default per-socket read buffer size.
pub const RCV_BUFFER_SIZE_DEFAULT: usize = 4 * 1024;
/// Default inter-agent command queue capacity in entries, derived from
/// the historical 64 KiB command buffer at a nominal 64-byte record.
pub const COMMAND_QUEUE_CAPACITY_DEFAULT: usize = 1024;
/// Default to-driver ring size, excluding the ring trailer.
pub const CONDUCTOR_BUFFER_SIZE_DEFAULT: usize = 64 * 1024;
/// Default to-clients broadcast size, excluding the broadcast trailer.
pub const TO_CLIENTS_BUFFER_SIZE_DEFAULT: usize = 64 * 1024;
/// Default size of each counters file.
pub const COUNTERS_BUFFER_SIZE_DEFAULT: usize = 64 * 1024;
/// Default term length for publication and image logs.
pub const TERM_LENGTH_DEFAULT: usize = 1024 * 1024;
/// Default MTU for outbound frames.
pub const MTU_LENGTH_DEFAULT: usize = 1408;

/// Timer wheel tick for the conductor.
pub const CONDUCTOR_TICK_DURATION: Duration = Duration::from_millis(10);
/// Timer wheel slot count for the conductor (power of two).
pub const CONDUCTOR_TICKS_PER_WHEEL: usize = 1024;

/// NAK delay parameters (multicast suppression).
pub const NAK_GROUP_SIZE_DEFAULT: u32 = 10;
pub const NAK_GRTT_DEFAULT: Duration = Duration::from_millis(10);
pub const NAK_MAX_BACKOFF_DEFAULT: Duration = Duration::from_millis(60);
/// Unicast NAK delay: NAK as soon as the gap is seen.
pub const NAK_UNICAST_DELAY_DEFAULT: Duration = Duration::ZERO;

/// Retransmit delay for unicast (immediate).
pub const RETRANSMIT_UNICAST_DELAY_DEFAULT: Duration = Duration::ZERO;
/// Linger after a retransmission during which duplicate NAKs are ignored.
pub const RETRANSMIT_UNICAST_LINGER_DEFAULT: Duration = Duration::from_millis(60);

/// Errors raised while resolving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("property {name}: malformed size `{value}`")]
    InvalidSize { name: String, value: String },
    #[error("property {name}: size `{value}` overflows the 64-bit range")]
    SizeOverflow { name: String, value: String },
    #[error("property {name}: malformed duration `{value}`")]
    InvalidDuration { name: String, value: String },
    #[error("property {name}: duration `{value}` overflows the 64-bit range")]
    DurationOverflow { name: String, value: String },
    #[error("{name} must be a power of two, got {value}")]
    NotAPowerOfTwo { name: &'static str, value: usize },
    #[error("{name} out of range: {value}")]
    OutOfRange { name: &'static str, value: usize },
    #[error("property {name}: malformed value `{value}`")]
    InvalidProperty { name: &'static str, value: String },
}

/// Parses a size value with an optional `k`/`m`/`g` suffix (1024-based).
///
/// `name` is the originating property, used only for error context.
pub fn parse_size(name: &str, value: &str) -> Result<i64, ConfigError> {
    let invalid = || ConfigError::InvalidSize {
        name: name.to_string(),
        value: value.to_string(),
    };
    let overflow = || ConfigError::SizeOverflow {
        name: name.to_string(),
        value: value.to_string(),
    };

    if value.is_empty() {
        return Err(invalid());
    }

    let (digits, shift) = match value.as_bytes()[value.len() - 1] {
        b'k' | b'K' => (&value[..value.len() - 1], 10),
        b'm' | b'M' => (&value[..value.len() - 1], 20),
        b'g' | b'G' => (&value[..value.len() - 1], 30),
        b'0'..=b'9' => (value, 0),
        _ => return Err(invalid()),
    };

    let base: i64 = digits.parse().map_err(|_| invalid())?;
    if base < 0 {
        return Err(invalid());
    }
    base.checked_shl(shift)
        .filter(|v| *v >= 0 && v >> shift == base)
        .ok_or_else(overflow)
}

/// Parses a duration value into nanoseconds.
///
/// Accepts a bare number (nanoseconds) or a number with an `ns`, `us`,
/// `ms` or `s` suffix, case-insensitive. Any other suffix is an error.
pub fn parse_duration(name: &str, value: &str) -> Result<i64, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        name: name.to_string(),
        value: value.to_string(),
    };
    let overflow = || ConfigError::DurationOverflow {
        name: name.to_string(),
        value: value.to_string(),
    };

    let bytes = value.as_bytes();
    if bytes.is_empty() {
        return Err(invalid());
    }

    let last = bytes[bytes.len() - 1];
    let (digits, multiplier) = if last.is_ascii_digit() {
        (value, 1i64)
    } else {
        // The only valid suffixes end in `s`.
        if !matches!(last, b's' | b'S') || bytes.len() < 2 {
            return Err(invalid());
        }
        match bytes[bytes.len() - 2] {
            b'n' | b'N' => (&value[..value.len() - 2], 1),
            b'u' | b'U' => (&value[..value.len() - 2], 1_000),
            b'm' | b'M' => (&value[..value.len() - 2], 1_000_000),
            b'0'..=b'9' => (&value[..value.len() - 1], 1_000_000_000),
            _ => return Err(invalid()),
        }
    };

    let base: i64 = digits.parse().map_err(|_| invalid())?;
    base.checked_mul(multiplier).ok_or_else(overflow)
}

fn env_size(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(v) => Ok(parse_size(name, &v)? as usize),
        Err(_) => Ok(default),
    }
}

/// Media driver configuration with defaults.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Base directory for control files and log buffers.
    pub dir: PathBuf,
    /// Delete `dir` on orderly shutdown.
    pub dir_delete_on_exit: bool,
    /// Per-socket read buffer size.
    pub rcv_buffer_size: usize,
    /// Inter-agent command queue capacity in entries.
    pub command_queue_capacity: usize,
    /// To-driver command ring size, excluding trailer.
    pub conductor_buffer_size: usize,
    /// To-clients broadcast size, excluding trailer.
    pub to_clients_buffer_size: usize,
    /// Counters labels/values file size.
    pub counters_buffer_size: usize,
    /// Term length for newly allocated logs.
    pub term_length: usize,
    /// Maximum transmission unit for outbound frames.
    pub mtu_length: usize,
    /// Interface multicast sockets join on.
    pub multicast_interface: Ipv4Addr,
    /// Initial receiver window advertised in status messages.
    pub initial_window: usize,
    /// Client considered dead when silent for this long.
    pub client_liveness_timeout: Duration,
    /// Publication lingers this long after removal before reclaim.
    pub publication_linger: Duration,
    /// Image considered inactive when no traffic for this long.
    pub image_liveness_timeout: Duration,
    /// Status message cadence.
    pub sm_interval: Duration,
    /// Setup frame cadence while a publication has no receivers.
    pub setup_interval: Duration,
    /// Heartbeat cadence during idle periods.
    pub heartbeat_interval: Duration,
    /// Flow-control receiver evicted after silence of this long.
    pub receiver_timeout: Duration,
    /// Grace period after creation before an unconnected publication pins
    /// its limit to the sender position.
    pub connection_grace: Duration,
    /// Unicast NAK delay.
    pub nak_unicast_delay: Duration,
    /// Multicast NAK suppression parameters.
    pub nak_grtt: Duration,
    pub nak_group_size: u32,
    pub nak_max_backoff: Duration,
    /// Retransmit delay and linger.
    pub retransmit_delay: Duration,
    pub retransmit_linger: Duration,
    /// Conductor timer wheel geometry.
    pub wheel_tick: Duration,
    pub wheel_slots: usize,
    /// Enabled observability events.
    pub enabled_events: EventTags,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("aqueduct"),
            dir_delete_on_exit: true,
            rcv_buffer_size: RCV_BUFFER_SIZE_DEFAULT,
            command_queue_capacity: COMMAND_QUEUE_CAPACITY_DEFAULT,
            conductor_buffer_size: CONDUCTOR_BUFFER_SIZE_DEFAULT,
            to_clients_buffer_size: TO_CLIENTS_BUFFER_SIZE_DEFAULT,
            counters_buffer_size: COUNTERS_BUFFER_SIZE_DEFAULT,
            term_length: TERM_LENGTH_DEFAULT,
            mtu_length: MTU_LENGTH_DEFAULT,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            initial_window: 128 * 1024,
            client_liveness_timeout: Duration::from_secs(5),
            publication_linger: Duration::from_secs(5),
            image_liveness_timeout: Duration::from_secs(4),
            sm_interval: Duration::from_millis(100),
            setup_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            receiver_timeout: Duration::from_secs(2),
            connection_grace: Duration::from_secs(1),
            nak_unicast_delay: NAK_UNICAST_DELAY_DEFAULT,
            nak_grtt: NAK_GRTT_DEFAULT,
            nak_group_size: NAK_GROUP_SIZE_DEFAULT,
            nak_max_backoff: NAK_MAX_BACKOFF_DEFAULT,
            retransmit_delay: RETRANSMIT_UNICAST_DELAY_DEFAULT,
            retransmit_linger: RETRANSMIT_UNICAST_LINGER_DEFAULT,
            wheel_tick: CONDUCTOR_TICK_DURATION,
            wheel_slots: CONDUCTOR_TICKS_PER_WHEEL,
            enabled_events: EventTags::none(),
        }
    }
}

impl DriverConfig {
    /// Resolves a configuration from the process environment.
    ///
    /// Unset properties fall back to their defaults; malformed values are
    /// errors rather than silent fallbacks.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(properties::DIR) {
            config.dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var(properties::DIR_DELETE_ON_EXIT) {
            config.dir_delete_on_exit = v != "false" && v != "0";
        }
        config.rcv_buffer_size = env_size(properties::RCV_BUFFER_SIZE, config.rcv_buffer_size)?;
        if let Ok(v) = std::env::var(properties::COMMAND_BUFFER_SIZE) {
            // The historical property is sized in bytes; queues here are
            // entry-counted at a nominal 64-byte record.
            let bytes = parse_size(properties::COMMAND_BUFFER_SIZE, &v)? as usize;
            config.command_queue_capacity = (bytes / 64).next_power_of_two();
        }
        config.conductor_buffer_size =
            env_size(properties::CONDUCTOR_BUFFER_SIZE, config.conductor_buffer_size)?;
        config.to_clients_buffer_size = env_size(
            properties::TO_CLIENTS_BUFFER_SIZE,
            config.to_clients_buffer_size,
        )?;
        config.counters_buffer_size =
            env_size(properties::COUNTERS_BUFFER_SIZE, config.counters_buffer_size)?;
        config.term_length = env_size(properties::TERM_LENGTH, config.term_length)?;
        config.mtu_length = env_size(properties::MTU_LENGTH, config.mtu_length)?;
        if let Ok(v) = std::env::var(properties::MULTICAST_DEFAULT_INTERFACE) {
            config.multicast_interface =
                v.parse().map_err(|_| ConfigError::InvalidProperty {
                    name: properties::MULTICAST_DEFAULT_INTERFACE,
                    value: v,
                })?;
        }
        config.enabled_events =
            event::make_tag_bit_set(&event::enabled_event_codes(
                std::env::var(properties::EVENT_LOG).ok().as_deref(),
            ));

        Ok(config)
    }

    /// Validates derived constraints before any file is mapped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.conductor_buffer_size.is_power_of_two() {
            return Err(ConfigError::NotAPowerOfTwo {
                name: "conductor buffer size",
                value: self.conductor_buffer_size,
            });
        }
        if !self.to_clients_buffer_size.is_power_of_two() {
            return Err(ConfigError::NotAPowerOfTwo {
                name: "to-clients buffer size",
                value: self.to_clients_buffer_size,
            });
        }
        if !self.term_length.is_power_of_two() {
            return Err(ConfigError::NotAPowerOfTwo {
                name: "term length",
                value: self.term_length,
            });
        }
        if !self.wheel_slots.is_power_of_two() {
            return Err(ConfigError::NotAPowerOfTwo {
                name: "wheel slots",
                value: self.wheel_slots,
            });
        }
        if self.term_length < crate::buffer::log::TERM_MIN_LENGTH {
            return Err(ConfigError::OutOfRange {
                name: "term length",
                value: self.term_length,
            });
        }
        if self.mtu_length < 64 || self.mtu_length > 65504 {
            return Err(ConfigError::OutOfRange {
                name: "mtu length",
                value: self.mtu_length,
            });
        }
        Ok(())
    }

    /// Total to-driver file length including the ring trailer.
    pub fn to_driver_file_length(&self) -> usize {
        self.conductor_buffer_size + ring::TRAILER_LENGTH
    }

    /// Total to-clients file length including the broadcast trailer.
    pub fn to_clients_file_length(&self) -> usize {
        self.to_clients_buffer_size + broadcast::TRAILER_LENGTH
    }
}
