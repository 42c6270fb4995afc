use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{P2Error, Result};

///////////////
// Constants //
///////////////

/// Default timeout for a single remote range request (2 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// User agent sent with remote range requests
pub const DEFAULT_USER_AGENT: &str = concat!("p2data/", env!("CARGO_PKG_VERSION"));

////////////////////
// Configuration //
////////////////////

/// Settings for remote (HTTP) range readers
///
/// ### Fields
///
/// * `timeout` - Timeout per range request.
/// * `user_agent` - User agent header for the requests.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Where the bytes of a container live
#[derive(Clone, Debug)]
pub enum ContainerSource {
    /// A file on the local file system, memory-mapped on open
    LocalFile(PathBuf),
    /// A buffer that is already in memory
    Memory(Bytes),
    /// A URL served by a server supporting HTTP range requests
    Remote(String),
}

impl ContainerSource {
    /// Interpret a user supplied location
    ///
    /// `http://` and `https://` prefixes are remote, anything else is treated
    /// as a local path.
    pub fn parse(location: &str) -> Self {
        let lower = location.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ContainerSource::Remote(location.to_string())
        } else {
            ContainerSource::LocalFile(PathBuf::from(location))
        }
    }
}

////////////////
// Read stats //
////////////////

#[derive(Debug, Default)]
struct ReadStats {
    requests: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of the read counters of a `RangeReader`
///
/// ### Fields
///
/// * `requests` - Number of range requests issued.
/// * `bytes` - Number of bytes successfully delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadStatsSnapshot {
    pub requests: u64,
    pub bytes: u64,
}

/////////////////
// Local blobs //
/////////////////

enum BlobData {
    Mapped(Mmap),
    Memory(Bytes),
}

impl BlobData {
    fn as_slice(&self) -> &[u8] {
        match self {
            BlobData::Mapped(mmap) => &mmap[..],
            BlobData::Memory(bytes) => &bytes[..],
        }
    }
}

/// A local, fully addressable blob of bytes
pub struct LocalBlob {
    data: Arc<BlobData>,
}

impl LocalBlob {
    /// Memory-map a file
    ///
    /// ### Params
    ///
    /// * `path` - Path to the container file.
    ///
    /// ### Returns
    ///
    /// The `LocalBlob` or the I/O error of opening/mapping the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();

        // zero-length files cannot be mapped on every platform
        let data = if len == 0 {
            BlobData::Memory(Bytes::new())
        } else {
            BlobData::Mapped(unsafe { MmapOptions::new().map(&file)? })
        };

        debug!(path = %path.as_ref().display(), len, "mapped local container");

        Ok(Self {
            data: Arc::new(data),
        })
    }

    /// Wrap an in-memory buffer
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: Arc::new(BlobData::Memory(data.into())),
        }
    }

    /// Total length in bytes
    pub fn len(&self) -> u64 {
        self.data.as_slice().len() as u64
    }

    /// Is the blob empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let len = self.len();
        if start > end || end > len {
            return Err(P2Error::InvalidRange { start, end, len });
        }
        let (start, end) = (start as usize, end as usize);

        match &*self.data {
            BlobData::Memory(bytes) => Ok(bytes.slice(start..end)),
            BlobData::Mapped(_) => {
                // page faults on the mapping can block, keep them off the
                // async worker threads
                let data = Arc::clone(&self.data);
                let res = tokio::task::spawn_blocking(move || {
                    Bytes::copy_from_slice(&data.as_slice()[start..end])
                })
                .await?;
                Ok(res)
            }
        }
    }
}

//////////////////////
// Remote resources //
//////////////////////

/// A remote resource read through HTTP range requests
pub struct RemoteResource {
    url: String,
    client: reqwest::Client,
}

impl RemoteResource {
    /// Create a new remote resource
    ///
    /// ### Params
    ///
    /// * `url` - URL of the container.
    /// * `config` - The `RemoteConfig` with timeout and user agent.
    pub fn new(url: impl Into<String>, config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| P2Error::Network(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// URL of the resource
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        if start > end {
            return Err(P2Error::InvalidRange { start, end, len: 0 });
        }
        // an empty range cannot be expressed as an HTTP byte range
        if start == end {
            return Ok(Bytes::new());
        }

        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await
            .map_err(|e| P2Error::Network(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            206 => {}
            200 => {
                return Err(P2Error::Network(format!(
                    "Server does not support range requests (returned 200 instead of 206): {}",
                    self.url
                )));
            }
            416 => {
                let len = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                return Err(P2Error::InvalidRange { start, end, len });
            }
            _ if !status.is_success() => {
                return Err(P2Error::Http {
                    status: status.as_u16(),
                    url: self.url.clone(),
                });
            }
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| P2Error::Network(e.to_string()))?;

        // servers truncate ranges that run past the end of the resource
        if body.len() as u64 != end - start {
            return Err(P2Error::InvalidRange {
                start,
                end,
                len: start + body.len() as u64,
            });
        }

        Ok(body)
    }
}

//////////////////
// Range reader //
//////////////////

enum Backend {
    Local(LocalBlob),
    Remote(RemoteResource),
}

/// Uniform asynchronous range reads over a local blob or a remote resource
///
/// Exactly one backend is bound per reader. Clones share the backend and the
/// read counters.
#[derive(Clone)]
pub struct RangeReader {
    backend: Arc<Backend>,
    stats: Arc<ReadStats>,
}

impl RangeReader {
    /// Reader backed by a local blob
    pub fn local(blob: LocalBlob) -> Self {
        Self {
            backend: Arc::new(Backend::Local(blob)),
            stats: Arc::new(ReadStats::default()),
        }
    }

    /// Reader backed by a remote resource
    pub fn remote(resource: RemoteResource) -> Self {
        Self {
            backend: Arc::new(Backend::Remote(resource)),
            stats: Arc::new(ReadStats::default()),
        }
    }

    /// Reader over an in-memory buffer
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::local(LocalBlob::from_bytes(data))
    }

    /// Bind the backend matching a `ContainerSource`
    ///
    /// ### Params
    ///
    /// * `source` - Where the container lives.
    /// * `config` - Settings used if the source is remote.
    pub fn from_source(source: &ContainerSource, config: &RemoteConfig) -> Result<Self> {
        match source {
            ContainerSource::LocalFile(path) => Ok(Self::local(LocalBlob::open(path)?)),
            ContainerSource::Memory(bytes) => Ok(Self::from_bytes(bytes.clone())),
            ContainerSource::Remote(url) => Ok(Self::remote(RemoteResource::new(
                url.clone(),
                config,
            )?)),
        }
    }

    /// Read the bytes `[start, end)` of the resource
    ///
    /// ### Params
    ///
    /// * `start` - First byte, inclusive.
    /// * `end` - Last byte, exclusive.
    ///
    /// ### Returns
    ///
    /// The bytes, or `InvalidRange` / transport errors.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let res = match &*self.backend {
            Backend::Local(blob) => blob.read_range(start, end).await,
            Backend::Remote(resource) => resource.read_range(start, end).await,
        }?;

        self.stats
            .bytes
            .fetch_add(res.len() as u64, Ordering::Relaxed);

        Ok(res)
    }

    /// Read the bytes `[start, end)` decoded as UTF-8 text
    ///
    /// Invalid sequences are replaced rather than rejected, entries are
    /// block padded and may end in arbitrary bytes.
    pub async fn read_range_as_text(&self, start: u64, end: u64) -> Result<String> {
        let bytes = self.read_range(start, end).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Current read counters
    pub fn stats(&self) -> ReadStatsSnapshot {
        ReadStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.backend {
            Backend::Local(blob) => format!("local ({} bytes)", blob.len()),
            Backend::Remote(resource) => format!("remote ({})", resource.url()),
        };
        f.debug_struct("RangeReader").field("backend", &kind).finish()
    }
}
