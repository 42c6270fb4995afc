use serde::Serialize;

////////////////
// Structures //
////////////////

/// Structure for the combined result of a multi-column fetch
///
/// CSC layout over the requested row slice. Columns appear in the order they
/// were requested.
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `row_indices` - Row index (within the slice) of every value.
/// * `col_ptrs` - Column pointers, `ncol + 1` long, starting at 0.
/// * `nrow` - Rows in the slice.
/// * `ncol` - Number of requested columns.
/// * `row_names` - Labels of the rows in the slice.
/// * `col_names` - Labels of the columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedSparseMatrix {
    pub data: Vec<f32>,
    pub row_indices: Vec<usize>,
    pub col_ptrs: Vec<usize>,
    pub nrow: usize,
    pub ncol: usize,
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
}

impl CombinedSparseMatrix {
    /// Repack dense columns into CSC
    ///
    /// Values equal to zero are treated as absent.
    ///
    /// ### Params
    ///
    /// * `columns` - Dense columns, each `row_names.len()` long.
    /// * `row_names` - Labels of the rows.
    /// * `col_names` - Labels of the columns, one per column.
    ///
    /// ### Returns
    ///
    /// The `CombinedSparseMatrix`
    pub fn from_dense_columns(
        columns: &[Vec<f32>],
        row_names: Vec<String>,
        col_names: Vec<String>,
    ) -> Self {
        let nrow = row_names.len();
        let ncol = columns.len();

        let mut data = Vec::new();
        let mut row_indices = Vec::new();
        let mut col_ptrs = Vec::with_capacity(ncol + 1);

        col_ptrs.push(0_usize);

        for column in columns {
            for (row, &value) in column.iter().enumerate() {
                if value != 0.0 {
                    data.push(value);
                    row_indices.push(row);
                }
            }
            col_ptrs.push(data.len());
        }

        Self {
            data,
            row_indices,
            col_ptrs,
            nrow,
            ncol,
            row_names,
            col_names,
        }
    }

    /// Dense version of one column
    ///
    /// ### Params
    ///
    /// * `col` - Column position.
    ///
    /// ### Returns
    ///
    /// A vector of length `nrow`.
    pub fn column(&self, col: usize) -> Vec<f32> {
        let mut dense = vec![0_f32; self.nrow];
        for idx in self.col_ptrs[col]..self.col_ptrs[col + 1] {
            dense[self.row_indices[idx]] = self.data[idx];
        }
        dense
    }

    /// Dense version of all columns
    pub fn to_dense_columns(&self) -> Vec<Vec<f32>> {
        (0..self.ncol).map(|col| self.column(col)).collect()
    }

    /// Return the number of non-zero values
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Returns the shape of the matrix
    ///
    /// ### Returns
    ///
    /// A tuple of `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }
}
