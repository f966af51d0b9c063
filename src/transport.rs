//! Single-peer UDP transport.
//!
//! One transport owns one socket and talks to one remote endpoint; it is
//! not a demultiplexer. Receives are bounded by a per-call deadline.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Largest datagram the channel accepts.
pub const MAX_DATAGRAM: usize = 10 * 1024;

#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl Transport {
    /// Bind the local address and record the remote endpoint. Port 0
    /// picks an ephemeral port.
    pub async fn bind(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await.map_err(Error::Bind)?;
        Ok(Self { socket, remote })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send one datagram to the peer.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket.send_to(data, self.remote).await?;
        Ok(())
    }

    /// Receive one datagram, waiting at most `deadline`.
    pub async fn receive(&self, deadline: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let received = tokio::time::timeout(deadline, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Timeout)?;
        let (n, _) = received?;
        buf.truncate(n);
        Ok(buf)
    }
}
