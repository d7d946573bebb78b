//! Async UDP sockets.
//!
//! Every socket a node uses (the primary one and each punched one) is a
//! [`DatagramSocket`]: a Tokio socket created through `socket2` so buffer
//! sizes can be tuned before binding, plus shared traffic counters.

use crate::error::NodeError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Traffic counters of a socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams sent
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

/// Tokio UDP socket with statistics and a close flag
///
/// Clones share the socket and the counters.
#[derive(Debug, Clone)]
pub struct DatagramSocket {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl DatagramSocket {
    /// Bind a socket to `addr` with `buffer_size` send and receive buffers
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::BindFailed` if any step of socket setup fails.
    pub fn bind(addr: SocketAddr, buffer_size: usize) -> Result<Self, NodeError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| NodeError::bind_failed(e.to_string()))?;

        socket
            .set_recv_buffer_size(buffer_size)
            .map_err(|e| NodeError::bind_failed(e.to_string()))?;
        socket
            .set_send_buffer_size(buffer_size)
            .map_err(|e| NodeError::bind_failed(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| NodeError::bind_failed(format!("{}: {}", addr, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| NodeError::bind_failed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket =
            UdpSocket::from_std(std_socket).map_err(|e| NodeError::bind_failed(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Send one datagram
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Closed` after [`DatagramSocket::close`], or the
    /// underlying I/O error.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, NodeError> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }
        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(NodeError::Io(e))
            }
        }
    }

    /// Receive one datagram
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Closed` after [`DatagramSocket::close`], or the
    /// underlying I/O error.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NodeError> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }
        match self.socket.recv_from(buf).await {
            Ok((size, from)) => {
                self.counters
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.counters
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok((size, from))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(NodeError::Io(e))
            }
        }
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        self.socket.local_addr().map_err(NodeError::Io)
    }

    /// Refuse further sends and receives
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Whether [`DatagramSocket::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Snapshot of the traffic counters
    #[must_use]
    pub fn stats(&self) -> SocketStats {
        SocketStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}
