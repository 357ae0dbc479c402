//! Readiness polling with an optional bound
//!
//! Thin layer over tokio's readiness API giving the tri-state answer the rest
//! of the relay needs: ready, timed out, or the socket carries an error.

use std::io;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// I/O direction to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Result of a readiness wait
#[derive(Debug)]
pub enum Readiness {
    /// The next operation in the requested direction will not block.
    /// A peer half-close counts as read-ready.
    Ready,
    /// The bound elapsed first
    TimedOut,
    /// The socket reported an error (`SO_ERROR` or a failed registration)
    Errored(io::Error),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Wait until `stream` is ready in `direction`.
///
/// With `timeout == None` the wait is unbounded, matching a plain blocking
/// read or write on the socket.
pub async fn poll_ready(
    stream: &TcpStream,
    direction: Direction,
    timeout: Option<Duration>,
) -> Readiness {
    let wait = stream.ready(direction.interest());

    let ready = match timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(ready) => ready,
            Err(_) => return Readiness::TimedOut,
        },
        None => wait.await,
    };

    if let Err(e) = ready {
        return Readiness::Errored(e);
    }

    match stream.take_error() {
        Ok(None) => Readiness::Ready,
        Ok(Some(e)) | Err(e) => Readiness::Errored(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_write_ready_on_fresh_socket() {
        let (client, _server) = socket_pair().await;
        let readiness = poll_ready(&client, Direction::Write, Some(Duration::from_secs(1))).await;
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_read_times_out_without_data() {
        let (client, _server) = socket_pair().await;
        let readiness = poll_ready(&client, Direction::Read, Some(Duration::from_millis(50))).await;
        assert!(matches!(readiness, Readiness::TimedOut));
    }

    #[tokio::test]
    async fn test_read_ready_after_peer_writes() {
        let (client, mut server) = socket_pair().await;
        server.write_all(b"x").await.unwrap();

        let readiness = poll_ready(&client, Direction::Read, Some(Duration::from_secs(1))).await;
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_peer_close_is_read_ready() {
        let (client, server) = socket_pair().await;
        drop(server);

        let readiness = poll_ready(&client, Direction::Read, None).await;
        assert!(readiness.is_ready());
    }
}
