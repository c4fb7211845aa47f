//! fetchpool - bounded concurrent fetching with progress and a two-tier cache.
//!
//! The crate is split into small pieces that compose:
//!
//! - [`accumulator`] and [`transfer`] turn a chunk stream into bytes while
//!   enforcing the declared size and honouring a stop signal.
//! - [`scheduler`] runs work items sequentially, all at once, or through a
//!   sliding window of bounded size.
//! - [`progress`] keeps the shared list of in-flight records.
//! - [`cache`] answers repeated requests from memory or a [`fs::BlobStore`],
//!   loading each key at most once at a time.
//! - [`timeout`] races an operation against a deadline.
//! - [`download`] ties them together behind a [`fetch::Fetcher`].
//!
//! # Example
//!
//! ```no_run
//! use fetchpool::{Downloader, EngineConfig, HttpFetcher};
//!
//! # async fn example() -> fetchpool::Result<()> {
//! let fetcher = HttpFetcher::with_defaults("http://localhost:8080")?;
//! let downloader = Downloader::new(fetcher, EngineConfig::default());
//!
//! let files = downloader.available_files().await?;
//! for result in downloader.download_all(files).await {
//!     match result.result {
//!         Ok(transfer) => println!("#{}: {} bytes", result.id, transfer.into_bytes().len()),
//!         Err(e) => eprintln!("#{}: {e}", result.id),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod accumulator;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod progress;
pub mod scheduler;
pub mod stats;
pub mod timeout;
pub mod transfer;

// Re-export main types for convenience
pub use accumulator::ByteAccumulator;
pub use cache::{CacheCoordinator, CacheStats, FetchLoader, Loader};
pub use config::EngineConfig;
pub use download::{Downloader, PartInfo, split_parts};
pub use error::{Error, Result};
pub use fetch::{ByteRange, FetchResponse, Fetcher, HttpFetcher, RemoteFile};
pub use fs::{BlobStore, DiskBlobStore};
pub use progress::{DownloadInfo, DownloadProgress, NoProgress, ProgressBroadcaster};
pub use scheduler::{ItemResult, Policy, Scheduler, WorkItem};
pub use stats::ScanSnapshot;
pub use timeout::{Deadline, TimeoutTask, run_with_deadline};
pub use transfer::{Transfer, TransferOptions};
