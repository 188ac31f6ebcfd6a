//! The datagram socket seam. The engine only ever talks to this trait, so tests can swap in
//!  mocks or in-memory links, and a future stream-based connection variant can reuse the
//!  worker unchanged.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tracing::debug;

/// A bidirectional, connected datagram endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Sends one datagram to the connected peer.
    async fn send_datagram(&self, payload: &[u8]) -> io::Result<()>;

    /// Non-blocking receive of one datagram; `WouldBlock` when nothing is pending.
    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Completes once a datagram is ready to be received.
    async fn readable(&self) -> io::Result<()>;

    /// The largest payload a single send may carry.
    fn max_send_size(&self) -> usize;

    fn is_read_open(&self) -> bool;
    fn is_write_open(&self) -> bool;

    /// Marks both directions closed. Datagram sockets have no wire-level close, this only
    ///  affects the local open flags.
    fn close(&self);
}

/// A `tokio::net::UdpSocket` connected to a single peer.
pub struct ConnectedUdpSocket {
    socket: UdpSocket,
    max_send_size: usize,
    read_open: AtomicBool,
    write_open: AtomicBool,
}

impl ConnectedUdpSocket {
    /// Binds `bind_addr` and connects the socket to `peer`.
    pub async fn connect(
        bind_addr: SocketAddr,
        peer: SocketAddr,
        max_send_size: usize,
    ) -> anyhow::Result<ConnectedUdpSocket> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        debug!(
            "bound {} and connected to {}",
            socket.local_addr()?,
            peer
        );
        Ok(ConnectedUdpSocket {
            socket,
            max_send_size,
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
        })
    }

    /// Wraps an already bound and connected socket, e.g. one handed over by an acceptor.
    pub fn from_socket(socket: UdpSocket, max_send_size: usize) -> ConnectedUdpSocket {
        ConnectedUdpSocket {
            socket,
            max_send_size,
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramSocket for ConnectedUdpSocket {
    async fn send_datagram(&self, payload: &[u8]) -> io::Result<()> {
        if !self.write_open.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.socket.send(payload).await.map(|_| ())
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_open.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.socket.try_recv(buf)
    }

    async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    fn max_send_size(&self) -> usize {
        self.max_send_size
    }

    fn is_read_open(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }

    fn is_write_open(&self) -> bool {
        self.write_open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.read_open.store(false, Ordering::Release);
        self.write_open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_pair_roundtrip() {
        let raw_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw_a.connect(raw_b.local_addr().unwrap()).await.unwrap();
        raw_b.connect(raw_a.local_addr().unwrap()).await.unwrap();

        let a = ConnectedUdpSocket::from_socket(raw_a, 1472);
        let b = ConnectedUdpSocket::from_socket(raw_b, 1472);

        a.send_datagram(b"hello").await.unwrap();
        b.readable().await.unwrap();

        let mut buf = [0u8; 64];
        let n = b.try_recv_datagram(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_close_marks_both_directions() {
        let socket = ConnectedUdpSocket::connect(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            1472,
        )
        .await
        .unwrap();

        assert!(socket.is_read_open());
        assert!(socket.is_write_open());

        socket.close();
        assert!(!socket.is_read_open());
        assert!(!socket.is_write_open());
        assert!(socket.send_datagram(b"x").await.is_err());
    }
}
