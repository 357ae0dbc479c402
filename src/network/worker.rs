//! Per-connection worker
//!
//! Handles the complete lifecycle of one inbound connection:
//!
//! 1. **Reading**: receive chunks and feed them to the compression session
//! 2. **Closing inbound**: the peer sent EOF, release the inbound socket
//! 3. **Forwarding**: finalize, open a fresh outbound link, send, close
//!
//! # Architecture
//!
//! ```text
//! Client → TCP → Reading ──EOF──→ ClosingInbound → Forwarding → Done
//!                   │                                  │
//!                   └──────────── Error ←──────────────┘
//! ```
//!
//! Compression runs on the blocking thread pool: received bytes are batched
//! and each batch, as well as the final flush, is handed to `spawn_blocking`
//! so bzip2 block sorting never stalls socket I/O on the runtime threads.
//!
//! Failures are fail-fast: buffered data of a failed connection is discarded.
//! They are reported through a [`RelayEvent`], a log line and a metric, never
//! to the acceptor.

use super::outbound::{OutboundLink, SendOutcome};
use super::poller::{poll_ready, Direction, Readiness};
use crate::compression::{CompressionLevel, CompressionSession};
use crate::error::{Error, Result};
use crate::events::{FailurePhase, RelayEvent, WorkerId, WorkerOutcome};
use crate::metrics;
use crate::settings::RelayConfig;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Received bytes buffered before a batch is handed to the compressor
const FEED_BATCH: usize = 64 * 1024;

/// Pause between forward attempts, multiplied by the attempt number
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Settings shared by every worker of an acceptor
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub compression_level: CompressionLevel,
    pub read_chunk_size: usize,
    pub idle_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub forward_retries: u32,
}

impl From<&RelayConfig> for WorkerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            compression_level: config.compression_level,
            read_chunk_size: config.read_chunk_size,
            idle_timeout: config.idle_timeout(),
            send_timeout: config.send_timeout(),
            connect_timeout: config.connect_timeout(),
            forward_retries: config.forward_retries,
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Reading,
    ClosingInbound,
    Forwarding,
    Done,
    Error,
}

/// Owns one inbound connection end to end
pub struct ConnectionWorker {
    id: WorkerId,
    peer: SocketAddr,
    inbound: Option<TcpStream>,
    /// Out of the worker only while a blocking compression step owns it
    session: Option<CompressionSession>,
    pending: Vec<u8>,
    config: Arc<WorkerConfig>,
    events: broadcast::Sender<RelayEvent>,
    state: WorkerState,
}

impl ConnectionWorker {
    pub fn new(
        id: WorkerId,
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<WorkerConfig>,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        let session = CompressionSession::new(config.compression_level);
        Self {
            id,
            peer,
            inbound: Some(stream),
            session: Some(session),
            pending: Vec::with_capacity(FEED_BATCH),
            config,
            events,
            state: WorkerState::Reading,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Bytes received from the inbound peer so far
    pub fn bytes_in(&self) -> u64 {
        let fed = self.session.as_ref().map_or(0, |s| s.bytes_in());
        fed + self.pending.len() as u64
    }

    /// Drive the connection to a terminal state
    pub async fn run(self) -> WorkerOutcome {
        let span = info_span!("worker", id = self.id, peer = %self.peer);
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> WorkerOutcome {
        let outcome = match self.read_inbound().await {
            Err(e) => {
                self.close_inbound().await;
                self.fail(FailurePhase::Reading, e)
            }
            Ok(()) => {
                self.transition(WorkerState::ClosingInbound);
                self.close_inbound().await;
                self.emit(RelayEvent::InboundClosed {
                    id: self.id,
                    peer: self.peer,
                    bytes_in: self.bytes_in(),
                });

                self.transition(WorkerState::Forwarding);
                match self.forward().await {
                    Ok(payload) => self.succeed(payload.len() as u64),
                    Err(e) => self.fail(FailurePhase::Forwarding, e),
                }
            }
        };

        self.emit(RelayEvent::Finished {
            id: self.id,
            peer: self.peer,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Feed the session until the peer closes its side
    async fn read_inbound(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.config.read_chunk_size];

        loop {
            let stream = self
                .inbound
                .as_mut()
                .ok_or_else(|| Error::ProtocolMisuse("inbound connection already closed".to_string()))?;

            let n = match self.config.idle_timeout {
                Some(limit) => {
                    let idle = || Error::Timeout(format!("inbound peer idle for {:?}", limit));
                    match poll_ready(stream, Direction::Read, Some(limit)).await {
                        Readiness::Ready => {}
                        Readiness::TimedOut => return Err(idle()),
                        Readiness::Errored(e) => {
                            return Err(Error::Connection(format!("inbound socket error: {}", e)))
                        }
                    }
                    // Readiness may be spurious; the read is bounded too
                    tokio::time::timeout(limit, stream.read(&mut buf))
                        .await
                        .map_err(|_| idle())?
                }
                None => stream.read(&mut buf).await,
            }
            .map_err(|e| Error::Connection(format!("inbound read failed: {}", e)))?;

            if n == 0 {
                self.compress_pending().await?;
                debug!(bytes_in = self.bytes_in(), "Inbound peer closed");
                return Ok(());
            }

            self.pending.extend_from_slice(&buf[..n]);
            if self.pending.len() >= FEED_BATCH {
                self.compress_pending().await?;
            }
        }
    }

    /// Hand buffered inbound bytes to the compressor
    async fn compress_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(FEED_BATCH));
        self.with_session(move |session| session.feed(&batch)).await
    }

    /// Run `op` against the session on the blocking thread pool
    async fn with_session<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut CompressionSession) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::Compression("compression session unavailable".to_string()))?;

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| Error::Compression(format!("compression task failed: {}", e)))?;

        self.session = Some(session);
        result
    }

    async fn close_inbound(&mut self) {
        if let Some(mut stream) = self.inbound.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Inbound socket already closed");
            }
        }
    }

    /// Finalize the session and deliver it over a fresh outbound link
    async fn forward(&mut self) -> Result<Bytes> {
        let payload = self.with_session(|session| session.finalize()).await?;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match Self::forward_once(&self.config, &payload).await {
                Ok(()) => return Ok(payload),
                Err(e) if attempt <= self.config.forward_retries => {
                    warn!(attempt, error = %e, "Forward attempt failed, retrying");
                    tokio::time::sleep(FORWARD_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn forward_once(config: &WorkerConfig, payload: &[u8]) -> Result<()> {
        let mut link =
            OutboundLink::connect_timeout(&config.remote_host, config.remote_port, config.connect_timeout)
                .await?;

        match link.send(payload, config.send_timeout).await? {
            SendOutcome::Sent(n) => {
                debug!(bytes = n, storage = %link.peer_addr(), "Compressed stream sent");
                link.close().await
            }
            SendOutcome::NotSent => Err(Error::Timeout(format!(
                "storage endpoint {} not writable within {:?}",
                link.peer_addr(),
                config.send_timeout
            ))),
        }
    }

    fn succeed(&mut self, bytes_out: u64) -> WorkerOutcome {
        self.transition(WorkerState::Done);
        let bytes_in = self.bytes_in();
        let saved_percent = self
            .session
            .as_ref()
            .map_or(0.0, |s| s.stats().space_saved_percent());
        info!(bytes_in, bytes_out, saved_percent, "Connection forwarded");
        metrics::record_forwarded(bytes_in, bytes_out);

        WorkerOutcome::Forwarded { bytes_in, bytes_out }
    }

    fn fail(&mut self, phase: FailurePhase, err: Error) -> WorkerOutcome {
        self.transition(WorkerState::Error);
        error!(
            phase = %phase,
            kind = err.kind(),
            bytes_in = self.bytes_in(),
            "Connection dropped: {}",
            err
        );
        metrics::record_failed(&phase.to_string(), err.kind());

        WorkerOutcome::Failed {
            phase,
            kind: err.kind(),
            error: err.to_string(),
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
