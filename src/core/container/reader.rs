use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::container::format::*;
use crate::core::container::gate::ReadyGate;
use crate::core::io::range_reader::RangeReader;
use crate::error::{P2Error, Result};

////////////////
// Structures //
////////////////

/// Everything learned while opening a container
///
/// ### Fields
///
/// * `header` - The validated file header.
/// * `index` - The parsed entry index.
#[derive(Debug)]
pub struct ContainerLayout {
    pub header: ContainerHeader,
    pub index: ContainerIndex,
}

type OpenResult = std::result::Result<Arc<ContainerLayout>, Arc<P2Error>>;

/// Lifecycle of a `ContainerReader`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Header and index are still being read
    Initializing,
    /// Header and index are available
    Ready,
    /// Header or index were rejected, no entry can be read
    Failed,
}

/// Loads the header then the index of a container
///
/// ### Params
///
/// * `reader` - The `RangeReader` of the container bytes.
///
/// ### Returns
///
/// The `ContainerLayout`
async fn load_layout(reader: RangeReader) -> Result<ContainerLayout> {
    let header_buf = reader.read_range(0, FILE_HEADER_SIZE as u64).await?;
    let header = ContainerHeader::parse(&header_buf)?;

    debug!(
        block_size = header.block_size,
        index_offset = header.index_offset,
        index_size = header.index_size,
        "parsed container header"
    );

    let (index_start, index_end) = header.index_range();
    let index_buf = reader.read_range(index_start, index_end).await?;
    let index = ContainerIndex::parse(&index_buf, &header)?;

    Ok(ContainerLayout { header, index })
}

/// ContainerReader
///
/// Reader over the block based container format. Construction starts loading
/// the header and index in the background; every request issued before that
/// finished waits for it and then proceeds in arrival order.
#[derive(Clone)]
pub struct ContainerReader {
    reader: RangeReader,
    gate: Arc<ReadyGate<OpenResult>>,
}

impl ContainerReader {
    /// Start opening a container
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// ### Params
    ///
    /// * `reader` - The `RangeReader` over the container bytes.
    ///
    /// ### Returns
    ///
    /// The reader in the `Initializing` state.
    pub fn new(reader: RangeReader) -> Self {
        let gate = Arc::new(ReadyGate::new());

        let task_gate = Arc::clone(&gate);
        let task_reader = reader.clone();
        tokio::spawn(async move {
            let res = match tokio::spawn(load_layout(task_reader)).await {
                Ok(res) => res,
                Err(e) => Err(P2Error::from(e)),
            };

            let res: OpenResult = match res {
                Ok(layout) => {
                    info!(entries = layout.index.len(), "container ready");
                    Ok(Arc::new(layout))
                }
                Err(e) => {
                    warn!(error = %e, "container failed to open");
                    Err(Arc::new(e))
                }
            };
            task_gate.open(res);
        });

        Self { reader, gate }
    }

    /// Open a container and wait until it is ready
    pub async fn open(reader: RangeReader) -> Result<Self> {
        let container = Self::new(reader);
        container.ready().await?;
        Ok(container)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReaderState {
        match self.gate.peek() {
            None => ReaderState::Initializing,
            Some(Ok(_)) => ReaderState::Ready,
            Some(Err(_)) => ReaderState::Failed,
        }
    }

    /// Wait for the header and index
    ///
    /// ### Returns
    ///
    /// The `ContainerLayout`, or `ContainerOpen` with the fatal error that
    /// aborted the open.
    pub async fn ready(&self) -> Result<Arc<ContainerLayout>> {
        match self.gate.wait().await {
            Some(Ok(layout)) => Ok(layout),
            Some(Err(e)) => Err(P2Error::ContainerOpen(e)),
            None => Err(P2Error::Cancelled),
        }
    }

    /// Register a continuation for readiness
    ///
    /// Queued continuations run once, in registration order, when loading
    /// finishes. After that the continuation runs immediately.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<Arc<ContainerLayout>>) + Send + 'static,
    {
        self.gate
            .on_open(move |res| f(res.map_err(P2Error::ContainerOpen)));
    }

    /// The underlying range reader
    pub fn range_reader(&self) -> &RangeReader {
        &self.reader
    }

    /// The validated header
    pub async fn header(&self) -> Result<ContainerHeader> {
        Ok(self.ready().await?.header)
    }

    /// Byte position where the data region starts
    pub async fn data_offset(&self) -> Result<u64> {
        Ok(self.ready().await?.header.data_offset())
    }

    /// All entry keys in file order
    pub async fn keys(&self) -> Result<Vec<String>> {
        let layout = self.ready().await?;
        Ok(layout
            .index
            .entries()
            .iter()
            .map(|e| e.key.clone())
            .collect())
    }

    /// Index information of one entry
    pub async fn entry_info(&self, key: &str) -> Result<IndexEntry> {
        let layout = self.ready().await?;
        Self::lookup(&layout, key).cloned()
    }

    fn lookup<'a>(layout: &'a ContainerLayout, key: &str) -> Result<&'a IndexEntry> {
        layout.index.get(key).ok_or_else(|| {
            warn!(key, "unknown entry key");
            P2Error::not_found("entry", key)
        })
    }

    /// Absolute byte range of a sub-range of an entry
    async fn sub_range(&self, key: &str, rel_start: u64, rel_len: u64) -> Result<(u64, u64)> {
        let layout = self.ready().await?;
        let entry = Self::lookup(&layout, key)?;
        let entry_len = entry.byte_len(&layout.header);

        let rel_end = rel_start.saturating_add(rel_len);
        if rel_end > entry_len {
            return Err(P2Error::InvalidRange {
                start: rel_start,
                end: rel_end,
                len: entry_len,
            });
        }

        let (start, _) = entry.byte_range(&layout.header);
        Ok((start + rel_start, start + rel_end))
    }

    /// Read a whole entry
    ///
    /// The result is `size * block_size` bytes long, including the padding
    /// up to the end of the last block.
    ///
    /// ### Params
    ///
    /// * `key` - Key of the entry.
    pub async fn get_entry(&self, key: &str) -> Result<Bytes> {
        let layout = self.ready().await?;
        let (start, end) = Self::lookup(&layout, key)?.byte_range(&layout.header);
        self.reader.read_range(start, end).await
    }

    /// Read a whole entry as text
    pub async fn get_entry_as_text(&self, key: &str) -> Result<String> {
        let layout = self.ready().await?;
        let (start, end) = Self::lookup(&layout, key)?.byte_range(&layout.header);
        self.reader.read_range_as_text(start, end).await
    }

    /// Read bytes within an entry
    ///
    /// ### Params
    ///
    /// * `key` - Key of the entry.
    /// * `rel_start` - Start relative to the beginning of the entry.
    /// * `rel_len` - Number of bytes to read.
    ///
    /// ### Returns
    ///
    /// The bytes, or `InvalidRange` if the sub-range leaves the entry.
    pub async fn get_bytes_in_entry(&self, key: &str, rel_start: u64, rel_len: u64) -> Result<Bytes> {
        let (start, end) = self.sub_range(key, rel_start, rel_len).await?;
        self.reader.read_range(start, end).await
    }

    /// Read bytes within an entry as text
    pub async fn get_bytes_in_entry_as_text(
        &self,
        key: &str,
        rel_start: u64,
        rel_len: u64,
    ) -> Result<String> {
        let (start, end) = self.sub_range(key, rel_start, rel_len).await?;
        self.reader.read_range_as_text(start, end).await
    }

    /// Read a JSON encoded entry
    ///
    /// The entry content ends at its null terminator.
    pub async fn get_json_entry<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.get_entry(key).await?;
        let content = &bytes[..null_terminated_len(&bytes)];
        Ok(serde_json::from_slice(content)?)
    }
}

impl std::fmt::Debug for ContainerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerReader")
            .field("reader", &self.reader)
            .field("state", &self.state())
            .finish()
    }
}
