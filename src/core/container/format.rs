use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::{P2Error, Result};

///////////////
// Constants //
///////////////

/// Identifier at the start of every container
pub const FILE_IDENTIFIER: &[u8; 15] = b"pagoda2datafile";

/// Size of the fixed file header in bytes
pub const FILE_HEADER_SIZE: usize = 48;

/// Size of one index record in bytes
pub const INDEX_ENTRY_SIZE: usize = 140;

/// Size of the null padded key field of an index record
pub const INDEX_KEY_SIZE: usize = 128;

/// The only (major, minor) version that can be read
pub const SUPPORTED_VERSION: (u8, u8) = (1, 0);

/////////////
// Helpers //
/////////////

#[inline]
pub(crate) fn read_u32_le(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// Length of a null terminated byte string
///
/// Entries are padded to full blocks, so their content ends at the first
/// null byte (or runs to the end of the buffer if there is none).
///
/// ### Params
///
/// * `bytes` - The padded buffer
///
/// ### Returns
///
/// Number of bytes before the first null.
pub fn null_terminated_len(bytes: &[u8]) -> usize {
    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
}

/// Trim a text at its null terminator
pub fn trim_null_terminated(text: &str) -> &str {
    &text[..null_terminated_len(text.as_bytes())]
}

////////////
// Header //
////////////

/// ContainerHeader
///
/// The fixed 48 byte header at the start of every container.
///
/// ### Fields
///
/// * `version_major` - Major format version (must be 1).
/// * `version_minor` - Minor format version (must be 0).
/// * `flags` - Unused flags.
/// * `block_size` - Allocation unit of entries in bytes.
/// * `index_offset` - Byte position of the index (the header size).
/// * `index_size` - Size of the index in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub flags: u16,
    pub block_size: u32,
    pub index_offset: u32,
    pub index_size: u32,
}

impl ContainerHeader {
    /// Parse and validate the header
    ///
    /// ### Params
    ///
    /// * `buffer` - At least the first `FILE_HEADER_SIZE` bytes of the file.
    ///
    /// ### Returns
    ///
    /// The header, or a `Format` error for a wrong identifier, an unsupported
    /// version or an index size that is not a whole number of records.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < FILE_HEADER_SIZE {
            return Err(P2Error::Format(format!(
                "Header needs {} bytes, got {}",
                FILE_HEADER_SIZE,
                buffer.len()
            )));
        }

        // only the identifier itself is checked, the zero padding up to 32
        // bytes is ignored
        if &buffer[0..FILE_IDENTIFIER.len()] != FILE_IDENTIFIER {
            return Err(P2Error::Format(
                "File is not a pagoda2 data file".to_string(),
            ));
        }

        let version_major = buffer[32];
        let version_minor = buffer[33];
        if (version_major, version_minor) != SUPPORTED_VERSION {
            return Err(P2Error::Format(format!(
                "Incompatible file version {}.{}",
                version_major, version_minor
            )));
        }

        let header = Self {
            version_major,
            version_minor,
            flags: u16::from_le_bytes([buffer[34], buffer[35]]),
            block_size: read_u32_le(buffer, 36),
            index_offset: read_u32_le(buffer, 40),
            index_size: read_u32_le(buffer, 44),
        };

        if header.block_size == 0 {
            return Err(P2Error::Format("Block size of zero".to_string()));
        }
        header.n_index_entries()?;

        Ok(header)
    }

    /// Number of index records
    ///
    /// A non-integral count is an internal consistency error.
    pub fn n_index_entries(&self) -> Result<usize> {
        let size = self.index_size as usize;
        if size % INDEX_ENTRY_SIZE != 0 {
            return Err(P2Error::Format(format!(
                "Internal error: index size {} is not a multiple of {}",
                size, INDEX_ENTRY_SIZE
            )));
        }
        Ok(size / INDEX_ENTRY_SIZE)
    }

    /// Byte position where the data region starts
    pub fn data_offset(&self) -> u64 {
        FILE_HEADER_SIZE as u64 + self.index_size as u64
    }

    /// Byte range `[start, end)` of the index
    pub fn index_range(&self) -> (u64, u64) {
        let start = self.index_offset as u64;
        (start, start + self.index_size as u64)
    }
}

///////////
// Index //
///////////

/// IndexEntry
///
/// ### Fields
///
/// * `key` - Name of the entry.
/// * `offset` - Offset from the data start, in blocks.
/// * `size` - Size in blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub key: String,
    pub offset: u32,
    pub size: u32,
}

impl IndexEntry {
    /// Absolute byte range of the entry
    ///
    /// ### Params
    ///
    /// * `header` - The header of the container holding this entry.
    ///
    /// ### Returns
    ///
    /// `(start, end)` with `end` exclusive.
    pub fn byte_range(&self, header: &ContainerHeader) -> (u64, u64) {
        let block_size = header.block_size as u64;
        let start = header.data_offset() + self.offset as u64 * block_size;
        (start, start + self.size as u64 * block_size)
    }

    /// Size of the entry in bytes
    pub fn byte_len(&self, header: &ContainerHeader) -> u64 {
        self.size as u64 * header.block_size as u64
    }
}

/// ContainerIndex
///
/// Mapping of entry keys to their position. Built once while the container
/// opens and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ContainerIndex {
    entries: Vec<IndexEntry>,
    lookup: FxHashMap<String, usize>,
}

impl ContainerIndex {
    /// Parse the index records
    ///
    /// ### Params
    ///
    /// * `buffer` - The `index_size` bytes of the index region.
    /// * `header` - The already validated header.
    ///
    /// ### Returns
    ///
    /// The `ContainerIndex`.
    pub fn parse(buffer: &[u8], header: &ContainerHeader) -> Result<Self> {
        let n_entries = header.n_index_entries()?;
        if buffer.len() < n_entries * INDEX_ENTRY_SIZE {
            return Err(P2Error::Format(format!(
                "Index needs {} bytes, got {}",
                n_entries * INDEX_ENTRY_SIZE,
                buffer.len()
            )));
        }

        let mut entries = Vec::with_capacity(n_entries);
        let mut lookup = FxHashMap::default();

        for i in 0..n_entries {
            let record = &buffer[i * INDEX_ENTRY_SIZE..(i + 1) * INDEX_ENTRY_SIZE];
            let key_field = &record[..INDEX_KEY_SIZE];
            let key = String::from_utf8_lossy(&key_field[..null_terminated_len(key_field)])
                .into_owned();

            let entry = IndexEntry {
                key: key.clone(),
                size: read_u32_le(record, 128),
                offset: read_u32_le(record, 132),
            };

            // later records shadow earlier ones with the same key
            lookup.insert(key, entries.len());
            entries.push(entry);
        }

        Ok(Self { entries, lookup })
    }

    /// Look up an entry by key
    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.lookup.get(key).map(|&i| &self.entries[i])
    }

    /// All entries in file order
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Has the index no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
