//! Outbound link to a storage endpoint
//!
//! The storage protocol is deliberately minimal: connect, write the complete
//! compressed buffer, close. No handshake, no length prefix, nothing is read
//! back. The storage node detects the end of the stream by EOF.

use super::poller::{poll_ready, Direction, Readiness};
use crate::error::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Result of [`OutboundLink::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was written to the socket
    Sent(usize),
    /// The socket did not become writable within the requested bound; nothing was written
    NotSent,
}

/// A single-use connection to the storage endpoint
#[derive(Debug)]
pub struct OutboundLink {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl OutboundLink {
    /// Connect to `host:port`
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Connection(format!("connect to {}:{} failed: {}", host, port, e)))?;
        let peer = stream.peer_addr()?;
        tracing::debug!(peer = %peer, "Outbound link established");

        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    /// Connect, giving up after `timeout` when one is set
    pub async fn connect_timeout(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, Self::connect(host, port))
                .await
                .map_err(|_| {
                    Error::Timeout(format!("connect to {}:{} exceeded {:?}", host, port, limit))
                })?,
            None => Self::connect(host, port).await,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Write the whole of `data`.
    ///
    /// With a `timeout`, waits at most that long for the socket to become
    /// writable and returns [`SendOutcome::NotSent`] if it does not. Once
    /// writing starts, partial writes are retried until every byte is
    /// accepted by the socket or a hard error occurs.
    pub async fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<SendOutcome> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ProtocolMisuse("send on a closed outbound link".to_string()))?;

        if timeout.is_some() {
            match poll_ready(stream, Direction::Write, timeout).await {
                Readiness::Ready => {}
                Readiness::TimedOut => return Ok(SendOutcome::NotSent),
                Readiness::Errored(e) => {
                    return Err(Error::Connection(format!("outbound socket error: {}", e)))
                }
            }
        }

        stream
            .write_all(data)
            .await
            .map_err(|e| Error::Connection(format!("send to {} failed: {}", self.peer, e)))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::Connection(format!("flush to {} failed: {}", self.peer, e)))?;

        Ok(SendOutcome::Sent(data.len()))
    }

    /// Signal EOF to the storage endpoint and release the socket. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        match stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Connection(format!("close of {} failed: {}", self.peer, e))),
        }
    }
}
