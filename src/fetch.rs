//! Transport abstraction and the reqwest-backed implementation.
//!
//! The engine never speaks HTTP itself. It asks a [`Fetcher`] for an
//! identifier (optionally a byte range) and gets back a status code plus a
//! stream of chunks. A ranged request must answer with partial content (206),
//! a full request with 200; anything else is a transport failure.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Status of a complete response.
pub const STATUS_OK: u16 = 200;
/// Status of a ranged response.
pub const STATUS_PARTIAL_CONTENT: u16 = 206;

/// Stream of body chunks.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// A contiguous byte range of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Offset of the first byte.
    pub offset: u64,
    /// Number of bytes requested.
    pub length: u64,
}

impl ByteRange {
    /// Creates a range of `length` bytes starting at `offset`.
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Renders the value of an HTTP `Range` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        let end = (self.offset + self.length).saturating_sub(1);
        format!("bytes={}-{end}", self.offset)
    }
}

/// Response of a [`Fetcher`].
pub struct FetchResponse {
    /// Status code reported by the transport.
    pub status: u16,
    /// Body, delivered chunk by chunk.
    pub body: ChunkStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl FetchResponse {
    /// Builds a response whose body is already in memory.
    #[must_use]
    pub fn from_bytes(status: u16, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            status,
            body: futures::stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// Checks the status against the kind of request that was made.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if a ranged request did not get 206 or a
    /// full request did not get 200.
    pub fn expect_status(self, range: Option<&ByteRange>) -> Result<Self> {
        let expected = if range.is_some() {
            STATUS_PARTIAL_CONTENT
        } else {
            STATUS_OK
        };
        if self.status == expected {
            Ok(self)
        } else {
            Err(Error::Transport {
                status: self.status,
            })
        }
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by the body stream.
    pub async fn collect(self) -> Result<Bytes> {
        let buf = self
            .body
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await?;
        Ok(buf.freeze())
    }
}

/// Transport collaborator.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Requests `identifier`, or the given range of it.
    async fn fetch(&self, identifier: &str, range: Option<ByteRange>) -> Result<FetchResponse>;
}

/// Fetches `identifier` in full and returns its body.
///
/// # Errors
///
/// Returns [`Error::Transport`] for any status other than 200, or the
/// transport's own error.
pub async fn fetch_all<F: Fetcher + ?Sized>(fetcher: &F, identifier: &str) -> Result<Bytes> {
    fetcher
        .fetch(identifier, None)
        .await?
        .expect_status(None)?
        .collect()
        .await
}

/// A file advertised by the server's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// File name, used as the download identifier.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
    /// Publication date as sent by the server.
    #[serde(default)]
    pub date: String,
}

/// Identifier of the catalog listing.
pub const CATALOG_LIST: &str = "files/list";
/// Identifier of the server status text.
pub const CATALOG_STATUS: &str = "files/status";

/// Returns the identifier that downloads `name`.
#[must_use]
pub fn download_identifier(name: &str) -> String {
    format!("files/download?{name}")
}

/// Lists the files the server offers.
///
/// # Errors
///
/// Returns [`Error::Corrupt`] if the listing is not the expected JSON, or
/// a transport error if it could not be fetched.
pub async fn available_files<F: Fetcher + ?Sized>(fetcher: &F) -> Result<Vec<RemoteFile>> {
    let data = fetch_all(fetcher, CATALOG_LIST).await?;
    serde_json::from_slice(&data).map_err(|e| Error::Corrupt(format!("file list: {e}")))
}

/// Reads the server's status line.
///
/// # Errors
///
/// Returns a transport error if the status could not be fetched.
pub async fn server_status<F: Fetcher + ?Sized>(fetcher: &F) -> Result<String> {
    let data = fetch_all(fetcher, CATALOG_STATUS).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// [`Fetcher`] that resolves identifiers against an HTTP base URL.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    /// Creates a fetcher using the given client.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Creates a fetcher with a client tuned for many parallel transfers.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_defaults(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self::new(client, base_url))
    }

    /// Returns the absolute URL of an identifier.
    #[must_use]
    pub fn url_for(&self, identifier: &str) -> String {
        format!("{}/{}", self.base_url, identifier.trim_start_matches('/'))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, identifier: &str, range: Option<ByteRange>) -> Result<FetchResponse> {
        let url = self.url_for(identifier);
        let mut request = self.client.get(&url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        log::debug!("GET {url} {range:?}");
        let response = request.send().await?;
        Ok(FetchResponse {
            status: response.status().as_u16(),
            body: response.bytes_stream().map_err(Error::from).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Serves canned bodies keyed by identifier.
    struct StaticFetcher {
        bodies: HashMap<String, (u16, Vec<u8>)>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, identifier: &str, _range: Option<ByteRange>) -> Result<FetchResponse> {
            let (status, body) = self
                .bodies
                .get(identifier)
                .cloned()
                .ok_or_else(|| Error::NotFound(identifier.to_string()))?;
            Ok(FetchResponse::from_bytes(status, body))
        }
    }

    fn fetcher(entries: &[(&str, u16, &[u8])]) -> StaticFetcher {
        StaticFetcher {
            bodies: entries
                .iter()
                .map(|(id, status, body)| ((*id).to_string(), (*status, body.to_vec())))
                .collect(),
        }
    }

    #[test]
    fn range_header() {
        assert_eq!(ByteRange::new(0, 100).header_value(), "bytes=0-99");
        assert_eq!(ByteRange::new(100, 50).header_value(), "bytes=100-149");
    }

    #[test]
    fn expect_status_distinguishes_partial() {
        let range = ByteRange::new(0, 10);
        assert!(FetchResponse::from_bytes(206, "x").expect_status(Some(&range)).is_ok());
        assert!(FetchResponse::from_bytes(200, "x").expect_status(None).is_ok());
        assert!(matches!(
            FetchResponse::from_bytes(200, "x").expect_status(Some(&range)),
            Err(Error::Transport { status: 200 })
        ));
        assert!(matches!(
            FetchResponse::from_bytes(404, "x").expect_status(None),
            Err(Error::Transport { status: 404 })
        ));
    }

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let response = FetchResponse {
            status: 200,
            body: futures::stream::iter(vec![
                Ok(Bytes::from_static(b"ab")),
                Ok(Bytes::from_static(b"cd")),
            ])
            .boxed(),
        };
        assert_eq!(response.collect().await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn available_files_decodes_json() {
        let f = fetcher(&[(
            CATALOG_LIST,
            200,
            br#"[{"name":"a.png","size":12,"date":"2021-01-01"}]"#,
        )]);
        let files = available_files(&f).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.png");
        assert_eq!(files[0].size, 12);
    }

    #[tokio::test]
    async fn available_files_rejects_garbage() {
        let f = fetcher(&[(CATALOG_LIST, 200, b"not json")]);
        assert!(matches!(available_files(&f).await, Err(Error::Corrupt(_))));
    }

    #[tokio::test]
    async fn server_status_requires_ok() {
        let f = fetcher(&[(CATALOG_STATUS, 500, b"down")]);
        assert!(matches!(
            server_status(&f).await,
            Err(Error::Transport { status: 500 })
        ));
        let f = fetcher(&[(CATALOG_STATUS, 200, b"3 files")]);
        assert_eq!(server_status(&f).await.unwrap(), "3 files");
    }

    #[test]
    fn http_fetcher_joins_urls() {
        let f = HttpFetcher::new(reqwest::Client::new(), "http://localhost:8080/");
        assert_eq!(f.url_for("files/list"), "http://localhost:8080/files/list");
        assert_eq!(
            f.url_for(&download_identifier("a.png")),
            "http://localhost:8080/files/download?a.png"
        );
    }
}
