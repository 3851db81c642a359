//! Network endpoints, sockets and channel URIs.

pub mod channel;
pub mod endpoint;
pub mod socket;

pub use channel::{ChannelMode, UdpChannel};
pub use endpoint::Endpoint;
pub use socket::UdpSocket;
