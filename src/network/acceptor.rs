//! TCP acceptor for the compression relay

use super::registry::{ShutdownReport, WorkerRegistry};
use super::worker::{ConnectionWorker, WorkerConfig};
use crate::error::{Error, Result};
use crate::events::{RelayEvent, WorkerId};
use crate::metrics;
use crate::settings::RelayConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Capacity of the relay event channel. Slow subscribers observe a lag error.
const EVENT_CAPACITY: usize = 1024;

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

enum Step {
    Shutdown,
    Sweep,
    Accepted(io::Result<(TcpStream, SocketAddr)>, Option<OwnedSemaphorePermit>),
}

/// Accepts inbound connections and runs one worker per connection
pub struct ConnectionAcceptor {
    config: RelayConfig,
    worker_config: Arc<WorkerConfig>,
    listener: TcpListener,
    local_addr: SocketAddr,
    admission: Option<Arc<Semaphore>>,
    events: broadcast::Sender<RelayEvent>,
    registry: WorkerRegistry,
    next_id: WorkerId,
}

impl ConnectionAcceptor {
    /// Validate `config` and bind the listening socket
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let addr = tokio::net::lookup_host(config.listen_addr())
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve {}", config.listen_addr())))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|e| Error::Connection(format!("bind to {} failed: {}", addr, e)))?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        let admission = config
            .max_workers
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            worker_config: Arc::new(WorkerConfig::from(&config)),
            config,
            listener,
            local_addr,
            admission,
            events,
            registry: WorkerRegistry::new(),
            next_id: 0,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Receive relay events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Workers currently tracked by the registry
    pub fn active_workers(&self) -> usize {
        self.registry.len()
    }

    /// Free worker slots, or `None` when admission is unbounded
    pub fn available_slots(&self) -> Option<usize> {
        self.admission.as_ref().map(|s| s.available_permits())
    }

    /// Serve until the process is terminated
    pub async fn serve(self) -> Result<ShutdownReport> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight workers.
    ///
    /// New connections stop being accepted as soon as the signal fires. Running
    /// workers get `shutdown_timeout` to finish; the rest are aborted.
    pub async fn serve_with_shutdown<F>(mut self, shutdown: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        info!(
            addr = %self.local_addr,
            storage = %self.config.remote_addr(),
            level = %self.config.compression_level,
            max_workers = ?self.config.max_workers,
            "Compression relay listening"
        );

        tokio::pin!(shutdown);
        let mut sweep = tokio::time::interval(self.config.poll_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                _ = sweep.tick() => Step::Sweep,
                (accepted, permit) = next_connection(&self.listener, self.admission.as_ref()) => {
                    Step::Accepted(accepted, permit)
                }
            };

            match step {
                Step::Shutdown => break,
                Step::Sweep => self.reap().await,
                Step::Accepted(Ok((stream, peer)), permit) => self.spawn_worker(stream, peer, permit),
                Step::Accepted(Err(e), _) => {
                    metrics::ACCEPT_ERRORS.inc();
                    error!("Failed to accept connection: {}", e);
                    if backoff_or_shutdown(shutdown.as_mut(), ACCEPT_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr, permit: Option<OwnedSemaphorePermit>) {
        self.next_id += 1;
        let id = self.next_id;

        metrics::CONNECTIONS_ACCEPTED.inc();
        debug!(id, peer = %peer, "Accepted connection");
        let _ = self.events.send(RelayEvent::Accepted { id, peer });

        let worker = ConnectionWorker::new(
            id,
            stream,
            peer,
            self.worker_config.clone(),
            self.events.clone(),
        );
        let task = tokio::spawn(async move {
            let outcome = worker.run().await;
            // Slot is released only once the worker is terminal
            drop(permit);
            outcome
        });

        self.registry.insert(id, peer, task);
        metrics::ACTIVE_WORKERS.set(self.registry.len() as i64);
    }

    async fn reap(&mut self) {
        for (id, outcome) in self.registry.reap().await {
            debug!(id, forwarded = outcome.is_forwarded(), "Reaped worker");
            let _ = self.events.send(RelayEvent::Reaped { id });
        }
        metrics::ACTIVE_WORKERS.set(self.registry.len() as i64);
    }

    async fn shutdown(self) -> Result<ShutdownReport> {
        let Self {
            config,
            listener,
            events,
            mut registry,
            ..
        } = self;
        drop(listener);

        info!(
            in_flight = registry.len(),
            timeout_secs = config.shutdown_timeout_secs,
            "Shutting down, draining workers"
        );
        let report = registry.drain(config.shutdown_timeout()).await;
        for (id, _) in &report.completed {
            let _ = events.send(RelayEvent::Reaped { id: *id });
        }
        metrics::ACTIVE_WORKERS.set(0);

        info!(
            completed = report.completed.len(),
            forwarded = report.forwarded(),
            aborted = report.aborted.len(),
            "Relay stopped"
        );
        Ok(report)
    }
}

/// Sleep for `pause`, returning `true` early if `shutdown` fires first
async fn backoff_or_shutdown<F>(shutdown: Pin<&mut F>, pause: Duration) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(pause) => false,
    }
}

/// Wait for an admission slot (if bounded) and then for a connection
async fn next_connection(
    listener: &TcpListener,
    admission: Option<&Arc<Semaphore>>,
) -> (io::Result<(TcpStream, SocketAddr)>, Option<OwnedSemaphorePermit>) {
    let permit = match admission {
        Some(semaphore) => match semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(e) => return (Err(io::Error::new(io::ErrorKind::Other, e)), None),
        },
        None => None,
    };

    (listener.accept().await, permit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RelayConfig {
        let mut config = RelayConfig::new("127.0.0.1", 9);
        config.bind_addr = "127.0.0.1".to_string();
        config.listen_port = 0;
        config
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let acceptor = ConnectionAcceptor::bind(local_config()).await.unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert_eq!(acceptor.active_workers(), 0);
        assert_eq!(acceptor.available_slots(), None);
    }

    #[tokio::test]
    async fn test_bind_rejects_missing_storage() {
        let mut config = local_config();
        config.remote_host.clear();
        assert!(matches!(
            ConnectionAcceptor::bind(config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_admission_slots() {
        let mut config = local_config();
        config.max_workers = Some(5);
        let acceptor = ConnectionAcceptor::bind(config).await.unwrap();
        assert_eq!(acceptor.available_slots(), Some(5));
    }

    #[tokio::test]
    async fn test_accept_backoff_yields_to_shutdown() {
        let shutdown = async {};
        tokio::pin!(shutdown);
        let started = std::time::Instant::now();
        assert!(backoff_or_shutdown(shutdown.as_mut(), Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        let pending = std::future::pending::<()>();
        tokio::pin!(pending);
        assert!(!backoff_or_shutdown(pending.as_mut(), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_workers() {
        let acceptor = ConnectionAcceptor::bind(local_config()).await.unwrap();
        let report = acceptor.serve_with_shutdown(async {}).await.unwrap();
        assert!(report.completed.is_empty());
        assert!(report.aborted.is_empty());
    }
}
