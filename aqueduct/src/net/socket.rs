//! UDP socket wrapper for mio-based I/O.
//!
//! A thin wrapper around [`mio::net::UdpSocket`] with ergonomic
//! non-blocking send/recv, multicast group management, and socket buffer
//! sizing via rustix. The socket registers with a [`mio::Poll`] through
//! its [`Source`] impl; the receiver drives one poll instance over all
//! of its channel sockets.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking UDP socket.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g. address in
    /// use), which is fatal at driver initialization.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Binds a socket for a multicast group: binds the wildcard address
    /// on the group's port and joins the group on `interface`.
    pub fn bind_multicast(group: Endpoint, interface: Ipv4Addr) -> io::Result<Self> {
        let IpAddr::V4(group_ip) = group.ip() else {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "only IPv4 multicast groups are supported",
            ));
        };
        let socket = Self::bind(Endpoint::any(group.port()))?;
        socket.inner.join_multicast_v4(&group_ip, &interface)?;
        socket.inner.set_multicast_loop_v4(true)?;
        Ok(socket)
    }

    /// Returns the local address this socket is bound to.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.inner.send_to(buf, dest.into()) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's receive buffer size.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's send buffer size.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_local_addr() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn send_recv_loopback() {
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let message = b"hello";
        // A freshly bound UDP socket is immediately writable.
        let sent = sender.try_send_to(message, receiver_addr).unwrap().unwrap();
        assert_eq!(sent, message.len());

        let mut buf = [0u8; 64];
        let received = loop {
            if let Some((n, from)) = receiver.try_recv_from(&mut buf).unwrap() {
                assert_eq!(from, sender.local_addr().unwrap());
                break n;
            }
            std::thread::yield_now();
        };
        assert_eq!(&buf[..received], message);
    }

    #[test]
    fn try_recv_empty_returns_none() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn buffer_sizes_can_grow() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        socket.set_recv_buffer_size(1024 * 1024).unwrap();
        socket.set_send_buffer_size(1024 * 1024).unwrap();
    }
}
