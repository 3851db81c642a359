//! Channel URIs.
//!
//! A channel is addressed as `udp://host:port`. The host must be a
//! literal IP address or `localhost`. A multicast group address selects
//! multicast mode: data flows to the given endpoint and control traffic
//! (status messages and NAKs) to the same group on the next port up.
//! For unicast, control traffic returns directly to the sender's socket
//! so data and control share the endpoint.

use std::net::IpAddr;

use thiserror::Error;

use super::Endpoint;

/// Errors parsing a channel URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel `{0}` must start with udp://")]
    InvalidScheme(String),
    #[error("channel `{0}` is missing a port")]
    MissingPort(String),
    #[error("channel `{0}` has a malformed address")]
    InvalidAddress(String),
}

/// Unicast or multicast delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Unicast,
    Multicast,
}

/// A parsed channel URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UdpChannel {
    uri: String,
    data: Endpoint,
    control: Endpoint,
    mode: ChannelMode,
}

impl UdpChannel {
    /// Parses a `udp://host:port` URI.
    pub fn parse(uri: &str) -> Result<Self, ChannelError> {
        let rest = uri
            .strip_prefix("udp://")
            .ok_or_else(|| ChannelError::InvalidScheme(uri.to_string()))?;

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ChannelError::MissingPort(uri.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ChannelError::MissingPort(uri.to_string()))?;

        let ip: IpAddr = if host == "localhost" {
            IpAddr::from([127, 0, 0, 1])
        } else {
            host.parse()
                .map_err(|_| ChannelError::InvalidAddress(uri.to_string()))?
        };

        let data = Endpoint::new(ip, port);
        let (mode, control) = if data.is_multicast() {
            (ChannelMode::Multicast, data.with_port(port + 1))
        } else {
            (ChannelMode::Unicast, data)
        };

        Ok(Self {
            uri: format!("udp://{ip}:{port}"),
            data,
            control,
            mode,
        })
    }

    /// The canonical URI form (IP literal, lowercase scheme).
    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.uri
    }

    /// The endpoint data frames travel to.
    #[must_use]
    pub const fn data_endpoint(&self) -> Endpoint {
        self.data
    }

    /// The endpoint control frames (SM, NAK) travel to.
    #[must_use]
    pub const fn control_endpoint(&self) -> Endpoint {
        self.control
    }

    /// Delivery mode.
    #[must_use]
    pub const fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// A filesystem-safe directory name for this channel.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("udp-{}-{}", self.data.ip(), self.data.port()).replace(':', "_")
    }
}

impl std::fmt::Display for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri)
    }
}
