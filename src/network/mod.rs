//! Network side of the relay
//!
//! ## Flow
//!
//! 1. **Accept**: [`ConnectionAcceptor`] polls the listening socket and spawns one
//!    [`ConnectionWorker`] per inbound connection
//! 2. **Compress**: the worker feeds every received chunk into its compression session
//! 3. **Forward**: after the inbound peer closes, the worker sends the finalized
//!    stream over a fresh [`OutboundLink`] to the storage endpoint
//! 4. **Reap**: the acceptor periodically drops finished workers from its
//!    [`WorkerRegistry`]
//!
//! ## Features
//!
//! - TCP listener with configurable backlog (default port 31337)
//! - Optional admission limit on concurrently running workers
//! - Graceful shutdown draining in-flight workers with a timeout
//! - Opt-in idle, connect and send timeouts via the readiness poller

pub mod acceptor;
pub mod outbound;
pub mod poller;
pub mod registry;
pub mod worker;

pub use acceptor::ConnectionAcceptor;
pub use outbound::{OutboundLink, SendOutcome};
pub use poller::{poll_ready, Direction, Readiness};
pub use registry::{ShutdownReport, WorkerRegistry};
pub use worker::{ConnectionWorker, WorkerConfig, WorkerState};
