//! Builders for in-memory containers used across the test modules

use serde::Serialize;

use crate::core::container::format::*;

/// Writes a container with the given entries, in insertion order
pub(crate) struct ContainerBuilder {
    block_size: u32,
    entries: Vec<(String, Vec<u8>)>,
}

impl ContainerBuilder {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(mut self, key: &str, bytes: Vec<u8>) -> Self {
        self.entries.push((key.to_string(), bytes));
        self
    }

    pub fn add_json<S: Serialize>(self, key: &str, value: &S) -> Self {
        let bytes = serde_json::to_vec(value).unwrap();
        self.add_entry(key, bytes)
    }

    pub fn add_sparse(self, key: &str, matrix: &SparseFixture) -> Self {
        self.add_entry(key, matrix.encode())
    }

    pub fn build(&self) -> Vec<u8> {
        let block_size = self.block_size as usize;
        let index_size = self.entries.len() * INDEX_ENTRY_SIZE;

        let mut header = vec![0u8; FILE_HEADER_SIZE];
        header[..FILE_IDENTIFIER.len()].copy_from_slice(FILE_IDENTIFIER);
        header[32] = SUPPORTED_VERSION.0;
        header[33] = SUPPORTED_VERSION.1;
        header[36..40].copy_from_slice(&self.block_size.to_le_bytes());
        header[40..44].copy_from_slice(&(FILE_HEADER_SIZE as u32).to_le_bytes());
        header[44..48].copy_from_slice(&(index_size as u32).to_le_bytes());

        let mut index = Vec::with_capacity(index_size);
        let mut data = Vec::new();
        let mut offset_blocks = 0u32;

        for (key, bytes) in &self.entries {
            let size_blocks = bytes.len().div_ceil(block_size) as u32;

            let mut record = vec![0u8; INDEX_ENTRY_SIZE];
            record[..key.len()].copy_from_slice(key.as_bytes());
            record[128..132].copy_from_slice(&size_blocks.to_le_bytes());
            record[132..136].copy_from_slice(&offset_blocks.to_le_bytes());
            index.extend(record);

            let mut padded = bytes.clone();
            padded.resize(size_blocks as usize * block_size, 0);
            data.extend(padded);

            offset_blocks += size_blocks;
        }

        let mut file = header;
        file.extend(index);
        file.extend(data);
        file
    }
}

/// A CSC matrix in the sparse entry layout
pub(crate) struct SparseFixture {
    pub dim1: u32,
    pub dim2: u32,
    pub p: Vec<u32>,
    pub i: Vec<u32>,
    pub x: Vec<f32>,
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
}

impl SparseFixture {
    /// Encode dense columns (each of length `row_names.len()`)
    pub fn from_dense_columns(columns: &[Vec<f32>], row_names: &[&str], col_names: &[&str]) -> Self {
        let mut p = vec![0u32];
        let mut i = Vec::new();
        let mut x = Vec::new();

        for column in columns {
            for (row, &value) in column.iter().enumerate() {
                if value != 0.0 {
                    i.push(row as u32);
                    x.push(value);
                }
            }
            p.push(x.len() as u32);
        }

        Self {
            dim1: row_names.len() as u32,
            dim2: col_names.len() as u32,
            p,
            i,
            x,
            row_names: row_names.iter().map(|s| s.to_string()).collect(),
            col_names: col_names.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The 5 x 4 matrix with p = [0,2,2,3,4], i = [0,1,2,3], x = [1,2,3,4]
    pub fn small() -> Self {
        Self {
            dim1: 5,
            dim2: 4,
            p: vec![0, 2, 2, 3, 4],
            i: vec![0, 1, 2, 3],
            x: vec![1.0, 2.0, 3.0, 4.0],
            row_names: (0..5).map(|r| format!("r{}", r)).collect(),
            col_names: (0..4).map(|c| format!("c{}", c)).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dimnames1 = serde_json::to_vec(&self.row_names).unwrap();
        dimnames1.push(0);
        let mut dimnames2 = serde_json::to_vec(&self.col_names).unwrap();
        dimnames2.push(0);

        let p_start = 32u32;
        let i_start = p_start + 4 * self.p.len() as u32;
        let x_start = i_start + 4 * self.i.len() as u32;
        let dimname1_start = x_start + 4 * self.x.len() as u32;
        let dimname2_start = dimname1_start + dimnames1.len() as u32;
        let dimnames2_end = dimname2_start + dimnames2.len() as u32;

        let mut out = Vec::with_capacity(dimnames2_end as usize);
        for field in [
            self.dim1,
            self.dim2,
            p_start,
            i_start,
            x_start,
            dimname1_start,
            dimname2_start,
            dimnames2_end,
        ] {
            out.extend(field.to_le_bytes());
        }
        self.p.iter().for_each(|v| out.extend(v.to_le_bytes()));
        self.i.iter().for_each(|v| out.extend(v.to_le_bytes()));
        self.x.iter().for_each(|v| out.extend(v.to_le_bytes()));
        out.extend(dimnames1);
        out.extend(dimnames2);
        out
    }
}
