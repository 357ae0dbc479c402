//! Streaming bzip2 session for a single inbound connection

use crate::error::{Error, Result};
use bytes::Bytes;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

/// bzip2 block size level (1 = fastest, 9 = best ratio)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 9;

    /// Validate and wrap a level
    pub fn new(level: u32) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(Error::Config(format!(
                "compression level {} out of range {}..={}",
                level,
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(Self::MAX)
    }
}

impl TryFrom<u32> for CompressionLevel {
    type Error = Error;

    fn try_from(level: u32) -> Result<Self> {
        Self::new(level)
    }
}

impl From<CompressionLevel> for u32 {
    fn from(level: CompressionLevel) -> Self {
        level.0
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Streaming compression state of one connection.
///
/// A session is fed incrementally with [`feed`](Self::feed) and finalized
/// exactly once with [`finalize`](Self::finalize). After finalization the
/// session only hands out the stored output; feeding or finalizing again is
/// rejected with [`Error::ProtocolMisuse`] and leaves the output untouched.
pub struct CompressionSession {
    level: CompressionLevel,
    encoder: Option<BzEncoder<Vec<u8>>>,
    output: Option<Bytes>,
    bytes_in: u64,
}

impl CompressionSession {
    /// Create a new session at the given level
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            level,
            encoder: Some(BzEncoder::new(Vec::new(), Compression::new(level.get()))),
            output: None,
            bytes_in: 0,
        }
    }

    /// Append a chunk of plain bytes to the stream
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::ProtocolMisuse("feed after finalize".to_string()))?;

        encoder
            .write_all(chunk)
            .map_err(|e| Error::Compression(format!("Failed to compress chunk: {}", e)))?;
        self.bytes_in += chunk.len() as u64;
        Ok(())
    }

    /// Flush the encoder and return the complete compressed stream
    pub fn finalize(&mut self) -> Result<Bytes> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| Error::ProtocolMisuse("finalize called twice".to_string()))?;

        let compressed = encoder
            .finish()
            .map_err(|e| Error::Compression(format!("Failed to finish compression: {}", e)))?;
        let output = Bytes::from(compressed);
        self.output = Some(output.clone());
        Ok(output)
    }

    pub fn is_finalized(&self) -> bool {
        self.encoder.is_none()
    }

    /// Finalized output, if the session has been finalized
    pub fn output(&self) -> Option<&Bytes> {
        self.output.as_ref()
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Plain bytes fed so far
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Compressed bytes buffered so far (complete size once finalized)
    pub fn bytes_out(&self) -> u64 {
        match (&self.encoder, &self.output) {
            (Some(encoder), _) => encoder.get_ref().len() as u64,
            (None, Some(output)) => output.len() as u64,
            (None, None) => 0,
        }
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats::new(self.bytes_in, self.bytes_out())
    }
}

impl fmt::Debug for CompressionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionSession")
            .field("level", &self.level)
            .field("finalized", &self.is_finalized())
            .field("bytes_in", &self.bytes_in)
            .field("bytes_out", &self.bytes_out())
            .finish()
    }
}

/// Compression statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    pub original_size: u64,
    pub compressed_size: u64,
    pub ratio: f64,
}

impl CompressionStats {
    pub fn new(original_size: u64, compressed_size: u64) -> Self {
        let ratio = if original_size > 0 {
            compressed_size as f64 / original_size as f64
        } else {
            1.0
        };
        Self {
            original_size,
            compressed_size,
            ratio,
        }
    }

    /// Calculate space saved (percentage)
    pub fn space_saved_percent(&self) -> f64 {
        (1.0 - self.ratio) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::read::BzDecoder;
    use proptest::prelude::*;
    use std::io::Read;

    fn decompress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        BzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_level_validation() {
        assert!(CompressionLevel::new(0).is_err());
        assert!(CompressionLevel::new(10).is_err());
        assert_eq!(CompressionLevel::new(1).unwrap().get(), 1);
        assert_eq!(CompressionLevel::default().get(), 9);
        assert!(CompressionLevel::try_from(42u32).is_err());
    }

    #[test]
    fn test_hello_world() -> Result<()> {
        let mut session = CompressionSession::new(CompressionLevel::default());
        session.feed(b"hello ")?;
        session.feed(b"world")?;
        let compressed = session.finalize()?;

        assert!(compressed.starts_with(b"BZh9"));
        assert_eq!(decompress(&compressed), b"hello world");
        assert_eq!(session.bytes_in(), 11);
        assert_eq!(session.bytes_out(), compressed.len() as u64);
        Ok(())
    }

    #[test]
    fn test_empty_session_is_valid_stream() -> Result<()> {
        let mut session = CompressionSession::new(CompressionLevel::new(1)?);
        let compressed = session.finalize()?;

        assert!(!compressed.is_empty());
        assert!(decompress(&compressed).is_empty());
        Ok(())
    }

    #[test]
    fn test_finalize_twice_is_misuse() -> Result<()> {
        let mut session = CompressionSession::new(CompressionLevel::default());
        session.feed(b"payload")?;
        let first = session.finalize()?;

        let err = session.finalize().unwrap_err();
        assert!(matches!(err, Error::ProtocolMisuse(_)));

        // stored output survives the misuse
        assert_eq!(session.output(), Some(&first));
        assert_eq!(decompress(&first), b"payload");
        Ok(())
    }

    #[test]
    fn test_feed_after_finalize_is_misuse() -> Result<()> {
        let mut session = CompressionSession::new(CompressionLevel::default());
        session.feed(b"abc")?;
        let first = session.finalize()?;

        let err = session.feed(b"def").unwrap_err();
        assert!(matches!(err, Error::ProtocolMisuse(_)));
        assert!(session.is_finalized());
        assert_eq!(session.bytes_in(), 3);
        assert_eq!(decompress(session.output().unwrap()), b"abc");
        assert_eq!(session.output(), Some(&first));
        Ok(())
    }

    #[test]
    fn test_multi_megabyte_input() -> Result<()> {
        let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let mut session = CompressionSession::new(CompressionLevel::new(6)?);
        for chunk in data.chunks(1024) {
            session.feed(chunk)?;
        }
        let compressed = session.finalize()?;

        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed), data);
        Ok(())
    }

    #[test]
    fn test_compression_stats() {
        let stats = CompressionStats::new(1000, 250);
        assert_eq!(stats.ratio, 0.25);
        assert_eq!(stats.space_saved_percent(), 75.0);
        assert_eq!(CompressionStats::new(0, 40).ratio, 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunking_does_not_change_payload(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk_size in 1usize..512,
        ) {
            let mut session = CompressionSession::new(CompressionLevel::new(1).unwrap());
            for chunk in data.chunks(chunk_size) {
                session.feed(chunk).unwrap();
            }
            let compressed = session.finalize().unwrap();
            prop_assert_eq!(decompress(&compressed), data);
        }
    }
}
