use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::core::container::format::read_u32_le;
use crate::core::container::reader::ContainerReader;
use crate::core::data::sparse_structures::CombinedSparseMatrix;
use crate::error::{P2Error, Result};

///////////////
// Constants //
///////////////

/// Size of the sub-header at the start of a sparse entry
pub const SPARSE_HEADER_SIZE: u64 = 32;

/// Width of one element of the p, i and x arrays
const ELEMENT_WIDTH: i64 = 4;

/////////////
// Helpers //
/////////////

fn decode_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Check a requested `[start, end)` slice against a dimension
fn check_slice(start: usize, end: usize, len: usize) -> Result<()> {
    if start > end || end > len {
        return Err(P2Error::InvalidRange {
            start: start as u64,
            end: end as u64,
            len: len as u64,
        });
    }
    Ok(())
}

////////////////
// Structures //
////////////////

/// SparseHeader
///
/// The eight u32 fields at the start of a sparse entry. All offsets are
/// relative to the start of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SparseHeader {
    pub dim1: u32,
    pub dim2: u32,
    pub p_start: u32,
    pub i_start: u32,
    pub x_start: u32,
    pub dimname1_start: u32,
    pub dimname2_start: u32,
    pub dimnames2_end: u32,
}

impl SparseHeader {
    /// Parse and validate the sub-header
    ///
    /// ### Params
    ///
    /// * `buffer` - The first `SPARSE_HEADER_SIZE` bytes of the entry.
    ///
    /// ### Returns
    ///
    /// The header, or a `Format` error if the regions are out of order or a
    /// dictionary block has no room for its terminator.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < SPARSE_HEADER_SIZE as usize {
            return Err(P2Error::Format(format!(
                "Sparse header needs {} bytes, got {}",
                SPARSE_HEADER_SIZE,
                buffer.len()
            )));
        }

        let header = Self {
            dim1: read_u32_le(buffer, 0),
            dim2: read_u32_le(buffer, 4),
            p_start: read_u32_le(buffer, 8),
            i_start: read_u32_le(buffer, 12),
            x_start: read_u32_le(buffer, 16),
            dimname1_start: read_u32_le(buffer, 20),
            dimname2_start: read_u32_le(buffer, 24),
            dimnames2_end: read_u32_le(buffer, 28),
        };

        let ordered = [
            header.p_start,
            header.i_start,
            header.x_start,
            header.dimname1_start,
            header.dimname2_start,
            header.dimnames2_end,
        ]
        .windows(2)
        .all(|w| w[0] <= w[1]);

        if !ordered || header.dimname1_start == header.dimname2_start {
            return Err(P2Error::Format(format!(
                "Sparse header regions out of order: {:?}",
                header
            )));
        }
        if header.dimname2_start == header.dimnames2_end {
            return Err(P2Error::Format(
                "Sparse header has an empty column dictionary".to_string(),
            ));
        }

        Ok(header)
    }

    /// Byte length of the column pointer array
    pub fn p_len(&self) -> u64 {
        (self.i_start - self.p_start) as u64
    }

    /// Row dictionary text length without its terminator
    pub fn dimnames1_len(&self) -> u64 {
        (self.dimname2_start - self.dimname1_start - 1) as u64
    }

    /// Column dictionary text length without its terminator
    pub fn dimnames2_len(&self) -> u64 {
        (self.dimnames2_end - self.dimname2_start - 1) as u64
    }
}

/// Dimnames
///
/// An ordered list of labels together with its reverse lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dimnames {
    names: Vec<String>,
    reverse: FxHashMap<String, usize>,
}

impl Dimnames {
    /// Generate a new dictionary
    ///
    /// Duplicated labels resolve to their last position.
    pub fn new(names: Vec<String>) -> Self {
        let reverse = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, reverse }
    }

    /// Position of a label
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.reverse.get(name).copied()
    }

    /// Labels in stored order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// SparsePreloadInfo
///
/// Metadata of one sparse entry, needed before any column can be read.
///
/// ### Fields
///
/// * `header` - The sparse sub-header.
/// * `dimnames1` - The row dictionary.
/// * `dimnames2` - The column dictionary.
/// * `p` - The column pointer array, `dim2 + 1` long.
#[derive(Debug, Clone, PartialEq)]
pub struct SparsePreloadInfo {
    pub header: SparseHeader,
    pub dimnames1: Dimnames,
    pub dimnames2: Dimnames,
    pub p: Vec<u32>,
}

impl SparsePreloadInfo {
    /// Number of rows
    pub fn dim1(&self) -> usize {
        self.header.dim1 as usize
    }

    /// Number of columns
    pub fn dim2(&self) -> usize {
        self.header.dim2 as usize
    }

    /// Total number of stored values
    pub fn nnz(&self) -> usize {
        self.p.last().copied().unwrap_or(0) as usize
    }

    /// Validate the preload against the sub-header
    fn validate(&self) -> Result<()> {
        let h = &self.header;

        if self.p.len() != self.dim2() + 1 {
            return Err(P2Error::Format(format!(
                "Column pointer array has {} elements, expected {}",
                self.p.len(),
                self.dim2() + 1
            )));
        }
        if self.p.windows(2).any(|w| w[0] > w[1]) {
            return Err(P2Error::Format(
                "Column pointer array is not monotone".to_string(),
            ));
        }

        let nnz = self.nnz() as u64 * ELEMENT_WIDTH as u64;
        if nnz > (h.x_start - h.i_start) as u64 || nnz > (h.dimname1_start - h.x_start) as u64 {
            return Err(P2Error::Format(format!(
                "Column pointers address {} values, more than stored",
                self.nnz()
            )));
        }

        if self.dimnames1.len() != self.dim1() || self.dimnames2.len() != self.dim2() {
            return Err(P2Error::Format(format!(
                "Dictionaries of {} x {} labels for a {} x {} matrix",
                self.dimnames1.len(),
                self.dimnames2.len(),
                self.dim1(),
                self.dim2()
            )));
        }

        Ok(())
    }

    /// Relative byte span of elements `[csi, cei)` of an array
    ///
    /// The payload of the i and x arrays starts one element after the array
    /// offset and the column pointers count from one, so element `k` of a
    /// column lives at `base + 4 + (p - 1 + k) * 4`.
    ///
    /// ### Params
    ///
    /// * `base` - Array offset from the sub-header.
    /// * `col_start` - First column.
    /// * `col_end` - Column after the last one.
    ///
    /// ### Returns
    ///
    /// `(rel_start, rel_len)` in bytes.
    fn element_span(&self, base: u32, col_start: usize, col_end: usize) -> Result<(u64, u64)> {
        let csi = self.p[col_start] as i64 - 1;
        let cei = self.p[col_end] as i64 - 1;

        let payload = base as i64 + ELEMENT_WIDTH;
        let start = payload + csi * ELEMENT_WIDTH;
        let len = (cei - csi) * ELEMENT_WIDTH;

        match (u64::try_from(start), u64::try_from(len)) {
            (Ok(start), Ok(len)) => Ok((start, len)),
            _ => Err(P2Error::Format(format!(
                "Negative element span {}+{} for columns {}..{}",
                start, len, col_start, col_end
            ))),
        }
    }
}

/// Reads and validates the preload of one sparse entry
///
/// ### Params
///
/// * `container` - The container holding the entry.
/// * `key` - Key of the sparse entry.
///
/// ### Returns
///
/// The `SparsePreloadInfo`
async fn load_preload(container: &ContainerReader, key: &str) -> Result<SparsePreloadInfo> {
    let header_buf = container
        .get_bytes_in_entry(key, 0, SPARSE_HEADER_SIZE)
        .await?;
    let header = SparseHeader::parse(&header_buf)?;

    let (p_buf, dimnames1, dimnames2) = tokio::try_join!(
        container.get_bytes_in_entry(key, header.p_start as u64, header.p_len()),
        container.get_bytes_in_entry_as_text(
            key,
            header.dimname1_start as u64,
            header.dimnames1_len()
        ),
        container.get_bytes_in_entry_as_text(
            key,
            header.dimname2_start as u64,
            header.dimnames2_len()
        ),
    )?;

    let dimnames1: Vec<String> = serde_json::from_str(&dimnames1)?;
    let dimnames2: Vec<String> = serde_json::from_str(&dimnames2)?;

    let preload = SparsePreloadInfo {
        header,
        dimnames1: Dimnames::new(dimnames1),
        dimnames2: Dimnames::new(dimnames2),
        p: decode_u32s(&p_buf),
    };
    preload.validate()?;

    Ok(preload)
}

/// SparseAccessor
///
/// Column and row access into one CSC encoded container entry. Clones share
/// the preload cache.
#[derive(Clone)]
pub struct SparseAccessor {
    inner: Arc<AccessorInner>,
}

struct AccessorInner {
    container: ContainerReader,
    key: String,
    preload: OnceCell<Arc<SparsePreloadInfo>>,
}

impl SparseAccessor {
    /// Generate a new accessor
    ///
    /// Nothing is read until the first access.
    ///
    /// ### Params
    ///
    /// * `container` - The container holding the entry.
    /// * `key` - Key of the sparse entry.
    pub fn new(container: ContainerReader, key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AccessorInner {
                container,
                key: key.into(),
                preload: OnceCell::new(),
            }),
        }
    }

    /// Key of the sparse entry
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Load (once) the preload information of the entry
    ///
    /// Repeated calls return the cached value without reading. A failed load
    /// is not cached.
    pub async fn load_sparse_preload(&self) -> Result<Arc<SparsePreloadInfo>> {
        let inner = &self.inner;
        inner
            .preload
            .get_or_try_init(|| async {
                let preload = load_preload(&inner.container, &inner.key).await?;
                info!(
                    key = %inner.key,
                    dim1 = preload.dim1(),
                    dim2 = preload.dim2(),
                    nnz = preload.nnz(),
                    "sparse preload complete"
                );
                Ok::<_, P2Error>(Arc::new(preload))
            })
            .await
            .cloned()
    }

    /// Resolve a column label
    fn column_index(preload: &SparsePreloadInfo, name: &str) -> Result<usize> {
        preload.dimnames2.index_of(name).ok_or_else(|| {
            warn!(name, "unknown column");
            P2Error::not_found("column", name)
        })
    }

    /// Read the i and x elements of the columns `[col_start, col_end)`
    ///
    /// ### Returns
    ///
    /// Tuple of `(row_indices, values)`, one element per stored value.
    async fn read_elements(
        &self,
        preload: &SparsePreloadInfo,
        col_start: usize,
        col_end: usize,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        let h = &preload.header;
        let (x_start, x_len) = preload.element_span(h.x_start, col_start, col_end)?;
        let (i_start, i_len) = preload.element_span(h.i_start, col_start, col_end)?;

        let container = &self.inner.container;
        let (x_buf, i_buf) = tokio::try_join!(
            container.get_bytes_in_entry(&self.inner.key, x_start, x_len),
            container.get_bytes_in_entry(&self.inner.key, i_start, i_len),
        )?;

        let values = decode_f32s(&x_buf);
        let rows = decode_u32s(&i_buf);
        if values.len() != rows.len() {
            return Err(P2Error::Format(format!(
                "{} values but {} row indices",
                values.len(),
                rows.len()
            )));
        }

        Ok((rows, values))
    }

    /// Dense version of one column
    ///
    /// ### Params
    ///
    /// * `name` - Column label.
    ///
    /// ### Returns
    ///
    /// A vector of length `dim1`.
    pub async fn get_column(&self, name: &str) -> Result<Vec<f32>> {
        let preload = self.load_sparse_preload().await?;
        self.get_column_range(name, 0, preload.dim1()).await
    }

    /// Dense slice of one column
    ///
    /// The full column is decoded and then sliced.
    ///
    /// ### Params
    ///
    /// * `name` - Column label.
    /// * `row_start` - First row.
    /// * `row_end` - Row after the last one.
    ///
    /// ### Returns
    ///
    /// A vector of length `row_end - row_start`.
    pub async fn get_column_range(
        &self,
        name: &str,
        row_start: usize,
        row_end: usize,
    ) -> Result<Vec<f32>> {
        let preload = self.load_sparse_preload().await?;
        let dim1 = preload.dim1();
        check_slice(row_start, row_end, dim1)?;

        let col = Self::column_index(&preload, name)?;
        let (rows, values) = self.read_elements(&preload, col, col + 1).await?;

        let mut dense = vec![0_f32; dim1];
        for (&row, &value) in rows.iter().zip(values.iter()) {
            let row = row as usize;
            if row >= dim1 {
                return Err(P2Error::Format(format!(
                    "Row index {} out of {} rows in column {}",
                    row, dim1, name
                )));
            }
            dense[row] = value;
        }

        debug!(name, nnz = values.len(), "read column");

        dense.truncate(row_end);
        Ok(dense.split_off(row_start))
    }

    /// Fetch many columns and combine them
    ///
    /// Every column is read concurrently. The result is returned once all of
    /// them finished, in whatever order that happened; the first failure
    /// aborts the outstanding reads.
    ///
    /// ### Params
    ///
    /// * `names` - Column labels, in the order of the result.
    /// * `row_start` - First row.
    /// * `row_end` - Row after the last one.
    ///
    /// ### Returns
    ///
    /// The `CombinedSparseMatrix` of shape `(row_end - row_start, names.len())`.
    pub async fn get_columns<S: AsRef<str>>(
        &self,
        names: &[S],
        row_start: usize,
        row_end: usize,
    ) -> Result<CombinedSparseMatrix> {
        let preload = self.load_sparse_preload().await?;
        check_slice(row_start, row_end, preload.dim1())?;

        let col_names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        for name in &col_names {
            Self::column_index(&preload, name)?;
        }

        let mut tasks = JoinSet::new();
        for (pos, name) in col_names.iter().enumerate() {
            let accessor = self.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let column = accessor.get_column_range(&name, row_start, row_end).await;
                (pos, column)
            });
        }

        let mut columns: Vec<Vec<f32>> = vec![Vec::new(); col_names.len()];
        while let Some(joined) = tasks.join_next().await {
            let (pos, column) = joined?;
            columns[pos] = column?;
        }

        let row_names = preload.dimnames1.names()[row_start..row_end].to_vec();
        let combined = CombinedSparseMatrix::from_dense_columns(&columns, row_names, col_names);

        debug!(
            columns = combined.ncol,
            rows = combined.nrow,
            nnz = combined.nnz(),
            "joined columns"
        );

        Ok(combined)
    }

    /// Dense slice of one row
    ///
    /// ### Params
    ///
    /// * `name` - Row label.
    /// * `col_start` - First column.
    /// * `col_end` - Column after the last one.
    ///
    /// ### Returns
    ///
    /// A vector of length `col_end - col_start`.
    pub async fn get_row(&self, name: &str, col_start: usize, col_end: usize) -> Result<Vec<f32>> {
        let preload = self.load_sparse_preload().await?;
        check_slice(col_start, col_end, preload.dim2())?;

        let row = preload.dimnames1.index_of(name).ok_or_else(|| {
            warn!(name, "unknown row");
            P2Error::not_found("row", name)
        })? as u32;

        let mut dense = vec![0_f32; col_end - col_start];
        if col_start == col_end {
            return Ok(dense);
        }

        let (rows, values) = self.read_elements(&preload, col_start, col_end).await?;

        let offset = preload.p[col_start] as usize;
        for (col, slot) in (col_start..col_end).zip(dense.iter_mut()) {
            let span = preload.p[col] as usize - offset..preload.p[col + 1] as usize - offset;
            if let Some(k) = rows[span.clone()].iter().position(|&r| r == row) {
                *slot = values[span.start + k];
            }
        }

        Ok(dense)
    }
}

impl std::fmt::Debug for SparseAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseAccessor")
            .field("key", &self.inner.key)
            .field("preloaded", &self.inner.preload.initialized())
            .finish()
    }
}
