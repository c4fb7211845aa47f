//! Downloader façade tying fetcher, transfers, progress and scheduling together.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::accumulator::ByteAccumulator;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fetch::{self, ByteRange, Fetcher, RemoteFile, download_identifier};
use crate::progress::{DownloadProgress, ProgressBroadcaster};
use crate::scheduler::{ItemResult, Policy, Scheduler, WorkItem};
use crate::transfer::{Transfer, TransferOptions, receive};

/// One ranged slice of a multi-part download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// 1-based position of the part.
    pub index: usize,
    /// Progress record name, `"{file} (part {index})"`.
    pub name: String,
    /// Bytes covered by the part.
    pub range: ByteRange,
}

/// Splits `file` into at most `parts` contiguous ranges of equal size (the
/// last one may be shorter). An empty file has no parts.
#[must_use]
pub fn split_parts(file: &RemoteFile, parts: usize) -> Vec<PartInfo> {
    let size = file.size as u64;
    if size == 0 {
        return Vec::new();
    }
    let part_size = size.div_ceil(parts.max(1) as u64);
    (0..size)
        .step_by(usize::try_from(part_size).unwrap_or(usize::MAX))
        .enumerate()
        .map(|(i, offset)| PartInfo {
            index: i + 1,
            name: format!("{} (part {})", file.name, i + 1),
            range: ByteRange::new(offset, part_size.min(size - offset)),
        })
        .collect()
}

/// Streams one identifier into an accumulator of `size` bytes.
#[allow(clippy::too_many_arguments)]
async fn stream_into(
    fetcher: &dyn Fetcher,
    identifier: &str,
    name: &str,
    size: usize,
    range: Option<ByteRange>,
    stop: &CancellationToken,
    progress: &ProgressBroadcaster,
    options: TransferOptions,
) -> Result<Transfer> {
    let response = fetcher.fetch(identifier, range).await?.expect_status(range.as_ref())?;
    let accumulator = ByteAccumulator::new(name, size);
    receive(accumulator, response.body, stop, progress, options).await
}

/// Downloads `file` in one request, reporting under its own name.
async fn stream_file(
    fetcher: Arc<dyn Fetcher>,
    file: RemoteFile,
    stop: CancellationToken,
    progress: ProgressBroadcaster,
    options: TransferOptions,
) -> Result<Transfer> {
    progress.on_start(&file.name);
    let result = stream_into(
        fetcher.as_ref(),
        &download_identifier(&file.name),
        &file.name,
        file.size,
        None,
        &stop,
        &progress,
        options,
    )
    .await;
    if let Err(e) = &result
        && !e.is_cancelled()
    {
        progress.on_error(&file.name, &e.to_string());
    }
    result
}

/// High-level client of a file server.
///
/// Owns the session cancellation token that every transfer started through
/// it observes. [`stop`](Self::stop) cancels the session; [`reset`](Self::reset)
/// starts a fresh one.
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    config: EngineConfig,
    progress: ProgressBroadcaster,
    session: Mutex<CancellationToken>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Creates a downloader over `fetcher`.
    #[must_use]
    pub fn new(fetcher: impl Fetcher + 'static, config: EngineConfig) -> Self {
        Self::with_shared(Arc::new(fetcher), config)
    }

    /// Creates a downloader over an already shared fetcher.
    #[must_use]
    pub fn with_shared(fetcher: Arc<dyn Fetcher>, config: EngineConfig) -> Self {
        Self {
            fetcher,
            config,
            progress: ProgressBroadcaster::new(),
            session: Mutex::new(CancellationToken::new()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the progress broadcaster all transfers report to.
    #[must_use]
    pub const fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    /// Returns the current session token.
    #[must_use]
    pub fn session(&self) -> CancellationToken {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether [`stop`](Self::stop) was called since the last reset.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.session().is_cancelled()
    }

    /// Cancels every transfer of the current session.
    pub fn stop(&self) {
        log::info!("Stopping all downloads");
        self.session().cancel();
    }

    /// Starts a fresh session and forgets all progress records.
    pub fn reset(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.progress.remove_all();
    }

    const fn options(&self) -> TransferOptions {
        TransferOptions {
            batch_size: self.config.progress_batch_bytes,
            supports_partial: self.config.supports_partial_downloads,
        }
    }

    /// Lists the files the server offers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if the listing cannot be decoded, or the
    /// transport error.
    pub async fn available_files(&self) -> Result<Vec<RemoteFile>> {
        fetch::available_files(self.fetcher.as_ref()).await
    }

    /// Returns the server's status text.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the status cannot be fetched.
    pub async fn status(&self) -> Result<String> {
        fetch::server_status(self.fetcher.as_ref()).await
    }

    /// Downloads `file` in one piece, publishing 0 then 1.0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] or [`Error::Truncated`] if the
    /// body size differs from the advertised size, or the transport error.
    pub async fn download(&self, file: &RemoteFile) -> Result<Bytes> {
        self.progress.on_start(&file.name);
        let data = fetch::fetch_all(self.fetcher.as_ref(), &download_identifier(&file.name)).await?;
        let (expected, received) = (file.size as u64, data.len() as u64);
        if received > expected {
            return Err(Error::ProtocolViolation { expected, received });
        }
        if received < expected {
            return Err(Error::Truncated { expected, received });
        }
        self.progress.update(&file.name, 1.0);
        Ok(data)
    }

    /// Downloads `file` as a stream, publishing progress every
    /// `progress_batch_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the session is stopped and partial
    /// downloads are not supported, or any transfer error.
    pub async fn download_with_progress(&self, file: &RemoteFile) -> Result<Transfer> {
        stream_file(
            Arc::clone(&self.fetcher),
            file.clone(),
            self.session(),
            self.progress.clone(),
            self.options(),
        )
        .await
    }

    /// Downloads `file` as `parts_per_file` concurrent range requests and
    /// joins the parts in offset order.
    ///
    /// Each part gets its own progress record. Partial parts are never
    /// joined: a stopped session fails the whole download.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if a part is not answered with partial
    /// content, [`Error::Cancelled`] if stopped, or the first part error.
    pub async fn multi_download_with_progress(&self, file: &RemoteFile) -> Result<Bytes> {
        let parts = split_parts(file, self.config.parts_per_file);
        let identifier = download_identifier(&file.name);
        let stop = self.session();
        let options = TransferOptions {
            supports_partial: false,
            ..self.options()
        };
        log::debug!("Downloading {} in {} part(s)", file.name, parts.len());

        for part in &parts {
            self.progress.on_start(&part.name);
        }
        let pending = parts.iter().map(|part| {
            let (identifier, stop, progress) = (&identifier, &stop, &self.progress);
            async move {
                #[allow(clippy::cast_possible_truncation)]
                let length = part.range.length as usize;
                let transfer = stream_into(
                    self.fetcher.as_ref(),
                    identifier,
                    &part.name,
                    length,
                    Some(part.range),
                    stop,
                    progress,
                    options,
                )
                .await
                .inspect_err(|e| {
                    if !e.is_cancelled() {
                        progress.on_error(&part.name, &e.to_string());
                    }
                })?;
                Ok::<_, Error>(transfer.into_bytes())
            }
        });
        let chunks = try_join_all(pending).await?;

        let mut data = BytesMut::with_capacity(file.size);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }

    /// Downloads every file with at most `batch_size` transfers in flight.
    ///
    /// Returns one result per file, tagged with the file's position in
    /// `files`, in completion order. A failed file never stops the others.
    pub async fn download_all(&self, files: Vec<RemoteFile>) -> Vec<ItemResult<Transfer>> {
        let scheduler = Scheduler::with_token(
            Policy::SlidingWindow {
                batch_size: self.config.effective_batch_size(),
            },
            self.session(),
        );
        let items = files
            .into_iter()
            .zip(0u64..)
            .map(|(file, id)| WorkItem::new(id, file))
            .collect();

        let fetcher = Arc::clone(&self.fetcher);
        let progress = self.progress.clone();
        let options = self.options();
        let results = scheduler
            .run(items, move |item: WorkItem<RemoteFile>, stop| {
                stream_file(
                    Arc::clone(&fetcher),
                    item.payload,
                    stop,
                    progress.clone(),
                    options,
                )
            })
            .await;

        let stats = scheduler.stats();
        log::info!(
            "Downloaded {}/{} file(s), {} failed, peak {} in flight",
            stats.completed - stats.failed,
            stats.launched,
            stats.failed,
            stats.peak_in_flight
        );
        results
    }
}
