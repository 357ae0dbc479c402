//! Worker lifecycle events
//!
//! Workers never report errors back to the acceptor's caller. Instead every
//! lifecycle transition that matters to an operator is broadcast as a
//! [`RelayEvent`]; subscribe with [`ConnectionAcceptor::subscribe`](crate::ConnectionAcceptor::subscribe).

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// Identifier of a spawned worker, unique per acceptor
pub type WorkerId = u64;

/// Phase in which a worker failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// Receiving from the inbound peer; buffered data was discarded
    Reading,
    /// Finalizing, connecting or sending to the storage endpoint
    Forwarding,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Reading => write!(f, "reading"),
            FailurePhase::Forwarding => write!(f, "forwarding"),
        }
    }
}

/// Terminal result of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// The compressed stream reached the storage endpoint
    Forwarded { bytes_in: u64, bytes_out: u64 },
    /// The worker stopped in `phase`; nothing (or an incomplete stream) was stored
    Failed {
        phase: FailurePhase,
        kind: &'static str,
        error: String,
    },
    /// Shutdown timed out before the worker finished
    Aborted,
}

impl WorkerOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, WorkerOutcome::Forwarded { .. })
    }
}

/// Observable relay event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Accepted {
        id: WorkerId,
        peer: SocketAddr,
    },
    /// Inbound peer closed its side; compressed payload is ready for forwarding
    InboundClosed {
        id: WorkerId,
        peer: SocketAddr,
        bytes_in: u64,
    },
    Finished {
        id: WorkerId,
        peer: SocketAddr,
        outcome: WorkerOutcome,
    },
    /// The registry dropped a terminated worker
    Reaped { id: WorkerId },
}

impl RelayEvent {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            RelayEvent::Accepted { id, .. }
            | RelayEvent::InboundClosed { id, .. }
            | RelayEvent::Finished { id, .. }
            | RelayEvent::Reaped { id } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RelayEvent::Finished {
            id: 7,
            peer: "127.0.0.1:5555".parse().unwrap(),
            outcome: WorkerOutcome::Failed {
                phase: FailurePhase::Forwarding,
                kind: "connection",
                error: "refused".to_string(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["id"], 7);
        assert_eq!(json["outcome"]["outcome"], "failed");
        assert_eq!(json["outcome"]["phase"], "forwarding");
        assert_eq!(event.worker_id(), 7);
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(WorkerOutcome::Forwarded { bytes_in: 1, bytes_out: 40 }.is_forwarded());
        assert!(!WorkerOutcome::Aborted.is_forwarded());
    }
}
