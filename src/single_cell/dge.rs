use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::base::stats::*;
use crate::core::data::sparse_structures::CombinedSparseMatrix;
use crate::error::{P2Error, Result};

////////////
// Params //
////////////

/// Parameters of a differential expression run
///
/// ### Fields
///
/// * `method` - Which test to run per gene.
/// * `z_threshold` - Genes are reported when their z-score reaches this.
/// * `min_observations` - Minimum number of non-zero values per group.
/// * `batch_divisor` - The gene list is split into roughly this many batches.
/// * `min_batch_size` - Lower bound for the number of genes per batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DgeParams {
    pub method: DgeMethod,
    pub z_threshold: f64,
    pub min_observations: usize,
    pub batch_divisor: usize,
    pub min_batch_size: usize,
}

impl Default for DgeParams {
    fn default() -> Self {
        Self {
            method: DgeMethod::KsTest,
            z_threshold: 3.0,
            min_observations: 10,
            batch_divisor: 200,
            min_batch_size: 10,
        }
    }
}

impl DgeParams {
    /// Number of genes requested per batch
    ///
    /// ### Params
    ///
    /// * `n_genes` - Total number of genes.
    ///
    /// ### Returns
    ///
    /// `max(floor(n_genes / batch_divisor), min_batch_size)`, at least 1.
    pub fn batch_size(&self, n_genes: usize) -> usize {
        (n_genes / self.batch_divisor.max(1))
            .max(self.min_batch_size)
            .max(1)
    }
}

////////////////
// Structures //
////////////////

/// Result for one reported gene
///
/// ### Fields
///
/// * `z` - Signed z-score.
/// * `abs_z` - Absolute z-score.
/// * `name` - Gene name.
/// * `fold` - Fold change estimate in `[-1, 1]`.
/// * `mean` - Mean log ratio (KS) or overall mean expression (Wilcoxon).
/// * `highest` - Is group A the higher one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub z: f64,
    #[serde(rename = "absZ")]
    pub abs_z: f64,
    pub name: String,
    pub fold: f64,
    pub mean: f64,
    pub highest: bool,
}

impl TestResult {
    /// Build the result of a scored gene
    pub fn from_score(name: impl Into<String>, score: &GeneScore) -> Self {
        Self {
            z: score.signed_z(),
            abs_z: score.z,
            name: name.into(),
            fold: score.fold,
            mean: score.mean,
            highest: score.sign >= 0.0,
        }
    }

    /// Two-sided p-value of the z-score
    pub fn p_value(&self) -> f64 {
        z_to_pval(self.abs_z)
    }
}

/// One batch of genes with their values over all cells
///
/// ### Fields
///
/// * `genes` - The gene names.
/// * `values` - One dense vector per gene, indexed by cell position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneBatch {
    pub genes: Vec<String>,
    pub values: Vec<Vec<f32>>,
}

impl GeneBatch {
    /// Dense batch from a combined column fetch
    ///
    /// ### Params
    ///
    /// * `matrix` - Cells as rows, genes as columns.
    pub fn from_sparse(matrix: &CombinedSparseMatrix) -> Self {
        Self {
            genes: matrix.col_names.clone(),
            values: matrix.to_dense_columns(),
        }
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

///////////////
// Functions //
///////////////

/// Score one gene regardless of the threshold
///
/// ### Params
///
/// * `values` - Values of the gene, indexed by cell position.
/// * `sel_a` - Cell positions of group A.
/// * `sel_b` - Cell positions of group B.
/// * `params` - The run parameters.
///
/// ### Returns
///
/// `None` if either group has fewer than `min_observations` non-zero values.
pub fn score_gene(
    values: &[f32],
    sel_a: &[usize],
    sel_b: &[usize],
    params: &DgeParams,
) -> Option<GeneScore> {
    let a = prepare_group(sel_a.iter().filter_map(|&i| values.get(i).copied()));
    let b = prepare_group(sel_b.iter().filter_map(|&i| values.get(i).copied()));

    let min_obs = params.min_observations.max(1);
    if a.len() < min_obs || b.len() < min_obs {
        return None;
    }

    let score = match params.method {
        DgeMethod::KsTest => ks_test(&a, &b),
        DgeMethod::Wilcoxon => wilcoxon_test(&a, &b),
    };
    Some(score)
}

/// Run the test over every gene of a batch
///
/// Genes are scored in parallel; the results keep the batch order.
///
/// ### Params
///
/// * `batch` - The `GeneBatch`.
/// * `sel_a` - Cell positions of group A.
/// * `sel_b` - Cell positions of group B.
/// * `n_cells` - Expected number of values per gene.
/// * `params` - The run parameters.
///
/// ### Returns
///
/// The genes reaching the z threshold.
pub fn run_test_on_batch(
    batch: &GeneBatch,
    sel_a: &[usize],
    sel_b: &[usize],
    n_cells: usize,
    params: &DgeParams,
) -> Result<Vec<TestResult>> {
    if batch.genes.len() != batch.values.len() {
        return Err(P2Error::Engine(format!(
            "Batch has {} genes but {} value vectors",
            batch.genes.len(),
            batch.values.len()
        )));
    }
    if let Some(values) = batch.values.iter().find(|v| v.len() != n_cells) {
        return Err(P2Error::Engine(format!(
            "Batch has {} values per gene, expected {} cells",
            values.len(),
            n_cells
        )));
    }

    let res: Vec<TestResult> = batch
        .genes
        .par_iter()
        .zip(batch.values.par_iter())
        .filter_map(|(gene, values)| {
            score_gene(values, sel_a, sel_b, params)
                .filter(|score| score.z >= params.z_threshold)
                .map(|score| TestResult::from_score(gene.as_str(), &score))
        })
        .collect();

    Ok(res)
}
