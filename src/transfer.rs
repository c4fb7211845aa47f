//! Drives a chunk stream into a [`ByteAccumulator`] with cooperative stop.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::accumulator::ByteAccumulator;
use crate::error::{Error, Result};
use crate::progress::DownloadProgress;

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// Every declared byte arrived.
    Complete(Bytes),
    /// Stopped early; partial content was allowed and is returned as-is.
    Partial(Bytes),
}

impl Transfer {
    /// Returns the transferred bytes regardless of completeness.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Complete(data) | Self::Partial(data) => data,
        }
    }

    /// Returns true if every declared byte arrived.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Knobs of a single transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Bytes between two progress publications.
    pub batch_size: usize,
    /// Whether a stopped transfer may return partial content.
    pub supports_partial: bool,
}

/// Reads `body` into `accumulator` until it is complete or `stop` fires.
///
/// The stop token is checked once per batch window, never per chunk, and a
/// chunk read already in progress is allowed to finish. Progress is published
/// to `progress` after every window.
///
/// # Errors
///
/// - [`Error::Cancelled`] if stopped and partial content is not supported
/// - [`Error::ProtocolViolation`] if the body exceeds the declared size
/// - [`Error::Truncated`] if the body ends before the declared size
/// - any error yielded by the body stream
pub async fn receive<S>(
    mut accumulator: ByteAccumulator,
    body: S,
    stop: &CancellationToken,
    progress: &dyn DownloadProgress,
    options: TransferOptions,
) -> Result<Transfer>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut body = body.fuse();
    let mut exhausted = false;

    while !stop.is_cancelled() && !accumulator.check_completed() {
        while !accumulator.is_batch_window_full(options.batch_size) {
            match body.next().await {
                Some(chunk) => accumulator.append(&chunk?)?,
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let fraction = accumulator.end_batch();
        progress.on_progress(accumulator.name(), fraction);
        log::trace!("{accumulator}");

        if exhausted && !accumulator.check_completed() {
            return Err(Error::Truncated {
                expected: accumulator.target_size() as u64,
                received: accumulator.received() as u64,
            });
        }
    }

    if accumulator.check_completed() {
        progress.on_progress(accumulator.name(), 1.0);
        return Ok(Transfer::Complete(accumulator.into_bytes()));
    }

    if options.supports_partial {
        log::debug!(
            "Transfer {} stopped at {} of {} bytes, keeping partial content",
            accumulator.name(),
            accumulator.received(),
            accumulator.target_size()
        );
        Ok(Transfer::Partial(accumulator.into_bytes()))
    } else {
        Err(Error::Cancelled)
    }
}
