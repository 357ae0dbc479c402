//! In-memory streaming compression
//!
//! Every inbound connection owns one [`CompressionSession`]. The session wraps a
//! bzip2 encoder writing into an in-memory buffer, so the complete compressed
//! stream of a connection lives in RAM until it is finalized and forwarded.
//!
//! ## Memory
//!
//! The encoder itself needs a fixed working set (about 7.6 MiB at level 9), but
//! the accumulated compressed output grows with the connection. Long-lived
//! connections are the dominant memory cost of a relay node.

pub mod session;

pub use session::{CompressionLevel, CompressionSession, CompressionStats};
