//! Per-transfer byte accumulation and progress tracking.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Collects the bytes of one transfer and reports how far along it is.
///
/// Owned by exactly one worker; never shared.
#[derive(Debug)]
pub struct ByteAccumulator {
    name: String,
    target_size: usize,
    received: BytesMut,
    batch: usize,
}

impl ByteAccumulator {
    /// Creates an accumulator expecting `target_size` bytes.
    #[must_use]
    pub fn new(name: impl Into<String>, target_size: usize) -> Self {
        Self {
            name: name.into(),
            target_size,
            received: BytesMut::with_capacity(target_size),
            batch: 0,
        }
    }

    /// Name of the transfer this accumulator belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared size of the transfer.
    #[must_use]
    pub const fn target_size(&self) -> usize {
        self.target_size
    }

    /// Number of bytes received so far.
    #[must_use]
    pub fn received(&self) -> usize {
        self.received.len()
    }

    /// Appends a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if the chunk would take the
    /// transfer past its declared size. Nothing is appended in that case.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let total = self.received.len() + chunk.len();
        if total > self.target_size {
            return Err(Error::ProtocolViolation {
                expected: self.target_size as u64,
                received: total as u64,
            });
        }
        self.received.extend_from_slice(chunk);
        self.batch += chunk.len();
        Ok(())
    }

    /// Fraction of the transfer received, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.target_size == 0 {
            return 1.0;
        }
        (self.received.len() as f64 / self.target_size as f64).clamp(0.0, 1.0)
    }

    /// Whether the worker should stop reading and publish progress.
    #[must_use]
    pub fn is_batch_window_full(&self, batch_size: usize) -> bool {
        self.batch >= batch_size.max(1) || self.check_completed()
    }

    /// Closes the current batch window and returns the progress to publish.
    pub fn end_batch(&mut self) -> f64 {
        self.batch = 0;
        self.progress()
    }

    /// Whether all declared bytes have arrived.
    #[must_use]
    pub fn check_completed(&self) -> bool {
        self.received.len() >= self.target_size
    }

    /// Consumes the accumulator, returning whatever was received.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.received.freeze()
    }
}

impl fmt::Display for ByteAccumulator {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}%",
            self.name,
            (self.progress() * 100.0).round() as u32
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_size_completes() {
        let mut acc = ByteAccumulator::new("file.bin", 100);
        acc.append(&[0u8; 60]).unwrap();
        assert!(!acc.check_completed());
        acc.append(&[0u8; 40]).unwrap();
        assert!(acc.check_completed());
        assert!((acc.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overflow_is_protocol_violation() {
        let mut acc = ByteAccumulator::new("file.bin", 100);
        acc.append(&[0u8; 100]).unwrap();
        let err = acc.append(&[0u8; 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                expected: 100,
                received: 101
            }
        ));
        assert_eq!(acc.received(), 100);
    }

    #[test]
    fn single_oversized_chunk_is_rejected() {
        let mut acc = ByteAccumulator::new("file.bin", 100);
        assert!(acc.append(&[0u8; 101]).is_err());
        assert_eq!(acc.received(), 0);
    }

    #[test]
    fn zero_target_is_complete_immediately() {
        let acc = ByteAccumulator::new("empty", 0);
        assert!(acc.check_completed());
        assert!((acc.progress() - 1.0).abs() < f64::EPSILON);
        assert!(acc.into_bytes().is_empty());
    }

    #[test]
    fn batch_window_resets() {
        let mut acc = ByteAccumulator::new("file.bin", 1000);
        acc.append(&[0u8; 50]).unwrap();
        assert!(!acc.is_batch_window_full(100));
        acc.append(&[0u8; 50]).unwrap();
        assert!(acc.is_batch_window_full(100));
        let published = acc.end_batch();
        assert!((published - 0.1).abs() < 1e-9);
        assert!(!acc.is_batch_window_full(100));
    }

    #[test]
    fn completed_transfer_fills_window() {
        let mut acc = ByteAccumulator::new("small", 10);
        acc.append(&[1u8; 10]).unwrap();
        assert!(acc.is_batch_window_full(1_000_000));
    }

    #[test]
    fn display_shows_percent() {
        let mut acc = ByteAccumulator::new("movie.mkv", 200);
        acc.append(&[0u8; 50]).unwrap();
        assert_eq!(acc.to_string(), "[movie.mkv] 25%");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn progress_is_monotonic_and_reaches_one_iff_complete(
                target in 0usize..4096,
                chunks in proptest::collection::vec(1usize..512, 0..64),
            ) {
                let mut acc = ByteAccumulator::new("p", target);
                let mut last = acc.progress();
                for len in chunks {
                    if acc.append(&vec![0u8; len]).is_err() {
                        break;
                    }
                    let now = acc.progress();
                    prop_assert!(now >= last);
                    last = now;
                }
                prop_assert!(acc.received() <= target);
                prop_assert_eq!((acc.progress() - 1.0).abs() < f64::EPSILON, acc.check_completed());
            }
        }
    }
}
