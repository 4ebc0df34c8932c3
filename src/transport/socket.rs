//! Async UDP socket wrapper.
//!
//! Moves datagrams between the network and the sans-I/O [`Host`](crate::host::Host)
//! or [`UserConnection`](crate::user::UserConnection).

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use super::netchan::Datagram;
use crate::core::MAX_PACKET_LEN;

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Async UDP socket for the protocol.
#[derive(Debug)]
pub struct HostSocket {
    /// The underlying UDP socket.
    socket: UdpSocket,
    /// Receive buffer.
    recv_buffer: Vec<u8>,
    /// Datagrams larger than this are not sent.
    max_datagram_size: usize,
}

impl HostSocket {
    /// Bind to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        HostSocketBuilder::new().bind(addr).await
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        HostSocketBuilder::new().from_socket(socket)
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Largest datagram this socket sends.
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    /// Send one datagram.
    pub async fn send(&self, datagram: &Datagram) -> io::Result<usize> {
        if datagram.data.len() > self.max_datagram_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds limit", datagram.data.len()),
            ));
        }
        self.socket.send_to(&datagram.data, datagram.addr).await
    }

    /// Receive data and return the sender's address.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }

    /// Try to receive without blocking.
    ///
    /// Returns `Ok(None)` if no data is available.
    pub fn try_recv(&mut self) -> io::Result<Option<Datagram>> {
        match self.socket.try_recv_from(&mut self.recv_buffer) {
            Ok((len, addr)) => Ok(Some(Datagram::new(addr, self.recv_buffer[..len].to_vec()))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Builder for sockets with custom options.
#[derive(Debug, Clone)]
pub struct HostSocketBuilder {
    recv_buffer_size: usize,
    max_datagram_size: usize,
}

impl Default for HostSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSocketBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_datagram_size: MAX_PACKET_LEN + 64,
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set the largest datagram to send.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    /// Bind to the given address and create a socket.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<HostSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Create a socket from an existing UDP socket.
    pub fn from_socket(self, socket: UdpSocket) -> HostSocket {
        HostSocket {
            socket,
            recv_buffer: vec![0u8; self.recv_buffer_size],
            max_datagram_size: self.max_datagram_size,
        }
    }
}
