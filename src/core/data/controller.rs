use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::core::container::reader::ContainerReader;
use crate::core::data::sparse_accessor::SparseAccessor;
use crate::core::data::sparse_structures::CombinedSparseMatrix;
use crate::core::io::range_reader::{ContainerSource, RangeReader, RemoteConfig};
use crate::error::{P2Error, Result};
use crate::single_cell::dge::GeneBatch;
use crate::single_cell::dge_coordinator::GeneBatchSource;

/////////////
// Entries //
/////////////

pub const CELL_ORDER_KEY: &str = "cellorder";
pub const CELL_METADATA_KEY: &str = "cellmetadata";
pub const GENE_INFORMATION_KEY: &str = "geneinformation";
pub const REDUCED_DENDROGRAM_KEY: &str = "reduceddendrogram";
pub const EMBEDDING_STRUCTURE_KEY: &str = "embeddingstructure";
pub const ASPECT_INFORMATION_KEY: &str = "aspectinformation";
pub const GENESETS_KEY: &str = "genesets";
pub const GENESETS_GENES_KEY: &str = "genesetsgenes";
pub const EXPRESSION_MATRIX_KEY: &str = "sparseMatrix";
pub const ASPECT_MATRIX_KEY: &str = "aspectMatrix";

/// Reduction type -> embedding type -> container key of the embedding
pub type EmbeddingStructure = BTreeMap<String, BTreeMap<String, String>>;

////////////////
// Structures //
////////////////

/// Summary information of one gene
///
/// ### Fields
///
/// * `genename` - The gene name.
/// * `dispersion` - Dispersion of the gene, stored as number or string.
/// * `score` - Always 0 when read from a container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneInformation {
    pub genename: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub dispersion: f64,
    #[serde(default, skip_deserializing)]
    pub score: f64,
}

/// Accept numbers and numeric strings, anything else becomes NaN
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let res = match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    };
    Ok(res)
}

////////////////
// Controller //
////////////////

/// Typed access to the entries of a pagoda2 data container
///
/// Cheap to clone; clones share the container, the matrix accessors and the
/// cached entries.
#[derive(Clone)]
pub struct P2DataController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    container: ContainerReader,
    expression: SparseAccessor,
    aspects: SparseAccessor,
    aspect_information: OnceCell<Arc<Map<String, Value>>>,
    gene_information_map: OnceCell<Arc<FxHashMap<String, GeneInformation>>>,
}

impl P2DataController {
    /// Controller over an opening (or open) container
    pub fn new(container: ContainerReader) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                expression: SparseAccessor::new(container.clone(), EXPRESSION_MATRIX_KEY),
                aspects: SparseAccessor::new(container.clone(), ASPECT_MATRIX_KEY),
                container,
                aspect_information: OnceCell::new(),
                gene_information_map: OnceCell::new(),
            }),
        }
    }

    /// Bind a source and start opening the container
    ///
    /// Returns immediately; the first data access waits for the container to
    /// become ready.
    ///
    /// ### Params
    ///
    /// * `source` - Where the container lives.
    /// * `config` - Settings for remote sources.
    ///
    /// ### Returns
    ///
    /// The `P2DataController`
    pub fn open(source: &ContainerSource, config: &RemoteConfig) -> Result<Self> {
        let reader = RangeReader::from_source(source, config)?;
        Ok(Self::new(ContainerReader::new(reader)))
    }

    /// The underlying container
    pub fn container(&self) -> &ContainerReader {
        &self.inner.container
    }

    /// Accessor of the expression matrix (cells x genes)
    pub fn expression_accessor(&self) -> &SparseAccessor {
        &self.inner.expression
    }

    /// Accessor of the aspect matrix (cells x aspects)
    pub fn aspect_accessor(&self) -> &SparseAccessor {
        &self.inner.aspects
    }

    //////////////////
    // JSON entries //
    //////////////////

    /// Canonical order of the cells
    pub async fn cell_order(&self) -> Result<Vec<String>> {
        self.inner.container.get_json_entry(CELL_ORDER_KEY).await
    }

    /// Per-cell metadata, as stored
    pub async fn cell_metadata(&self) -> Result<Value> {
        self.inner.container.get_json_entry(CELL_METADATA_KEY).await
    }

    /// The reduced dendrogram, as stored
    pub async fn reduced_dendrogram(&self) -> Result<Value> {
        self.inner
            .container
            .get_json_entry(REDUCED_DENDROGRAM_KEY)
            .await
    }

    /// Rows of the gene information entry
    ///
    /// Rows that are not gene records (the entry has `null` gaps for genes
    /// that were dropped) are skipped.
    async fn gene_rows(&self) -> Result<Vec<GeneInformation>> {
        let rows: Vec<Value> = self
            .inner
            .container
            .get_json_entry(GENE_INFORMATION_KEY)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value::<GeneInformation>(row).ok())
            .collect())
    }

    /// Gene information, highest dispersion first
    pub async fn gene_information(&self) -> Result<Vec<GeneInformation>> {
        let mut genes = self.gene_rows().await?;
        genes.sort_by(|a, b| b.dispersion.total_cmp(&a.dispersion));
        Ok(genes)
    }

    /// Gene information keyed by gene name
    ///
    /// Read once and cached.
    pub async fn gene_information_map(&self) -> Result<Arc<FxHashMap<String, GeneInformation>>> {
        self.inner
            .gene_information_map
            .get_or_try_init(|| async {
                let map: FxHashMap<String, GeneInformation> = self
                    .gene_rows()
                    .await?
                    .into_iter()
                    .map(|gene| (gene.genename.clone(), gene))
                    .collect();
                debug!(genes = map.len(), "built gene information map");
                Ok::<_, P2Error>(Arc::new(map))
            })
            .await
            .cloned()
    }

    /// Mapping of reductions to their embeddings
    pub async fn embedding_structure(&self) -> Result<EmbeddingStructure> {
        self.inner
            .container
            .get_json_entry(EMBEDDING_STRUCTURE_KEY)
            .await
    }

    /// Names of the available reductions
    pub async fn available_reduction_types(&self) -> Result<Vec<String>> {
        Ok(self.embedding_structure().await?.into_keys().collect())
    }

    /// Embedding types computed for one reduction
    pub async fn available_embeddings(&self, reduction: &str) -> Result<Vec<String>> {
        let mut structure = self.embedding_structure().await?;
        let embeddings = structure
            .remove(reduction)
            .ok_or_else(|| P2Error::not_found("reduction", reduction))?;
        Ok(embeddings.into_keys().collect())
    }

    /// One embedding
    ///
    /// The value is returned as stored, packed coordinate arrays are not
    /// decoded.
    ///
    /// ### Params
    ///
    /// * `reduction` - Name of the reduction.
    /// * `embedding_type` - Name of the embedding within the reduction.
    ///
    /// ### Returns
    ///
    /// The embedding JSON, or `NotFound` if either name is unknown.
    pub async fn embedding(&self, reduction: &str, embedding_type: &str) -> Result<Value> {
        let structure = self.embedding_structure().await?;
        let key = structure
            .get(reduction)
            .and_then(|embeddings| embeddings.get(embedding_type))
            .ok_or_else(|| {
                warn!(reduction, embedding_type, "unknown embedding");
                P2Error::not_found("embedding", format!("{}/{}", reduction, embedding_type))
            })?;
        self.inner.container.get_json_entry(key).await
    }

    /// Aspect name -> gene sets of the aspect
    ///
    /// Read once and cached.
    pub async fn aspect_information(&self) -> Result<Arc<Map<String, Value>>> {
        let inner = &self.inner;
        inner
            .aspect_information
            .get_or_try_init(|| async {
                let info: Map<String, Value> = inner
                    .container
                    .get_json_entry(ASPECT_INFORMATION_KEY)
                    .await?;
                Ok::<_, P2Error>(Arc::new(info))
            })
            .await
            .cloned()
    }

    /// Names of all aspects
    pub async fn available_aspects(&self) -> Result<Vec<String>> {
        Ok(self.aspect_information().await?.keys().cloned().collect())
    }

    /// The gene sets of one aspect
    pub async fn genesets_in_aspect(&self, aspect: &str) -> Result<Vec<Value>> {
        let info = self.aspect_information().await?;
        match info.get(aspect) {
            Some(Value::Array(sets)) => Ok(sets.clone()),
            Some(other) => Ok(vec![other.clone()]),
            None => Err(P2Error::not_found("aspect", aspect)),
        }
    }

    /// Gene set descriptions, as stored
    pub async fn gene_set_information(&self) -> Result<Value> {
        self.inner.container.get_json_entry(GENESETS_KEY).await
    }

    /// Genes of a gene set with their information
    ///
    /// Genes missing from the gene information are left out.
    ///
    /// ### Params
    ///
    /// * `name` - Name of the gene set.
    ///
    /// ### Returns
    ///
    /// The genes in set order, or `NotFound` for an unknown set.
    pub async fn gene_set_genes(&self, name: &str) -> Result<Vec<GeneInformation>> {
        let mut sets: FxHashMap<String, Vec<String>> = self
            .inner
            .container
            .get_json_entry(GENESETS_GENES_KEY)
            .await?;
        let genes = sets
            .remove(name)
            .ok_or_else(|| P2Error::not_found("gene set", name))?;

        let info = self.gene_information_map().await?;
        Ok(genes
            .iter()
            .filter_map(|gene| info.get(gene).cloned())
            .collect())
    }

    //////////////
    // Matrices //
    //////////////

    /// Expression values of some genes over a slice of cells
    ///
    /// ### Params
    ///
    /// * `genes` - Gene names, in the order of the result columns.
    /// * `cell_start` - First cell.
    /// * `cell_end` - Cell after the last one.
    pub async fn expression_values_sparse<S: AsRef<str>>(
        &self,
        genes: &[S],
        cell_start: usize,
        cell_end: usize,
    ) -> Result<CombinedSparseMatrix> {
        self.inner
            .expression
            .get_columns(genes, cell_start, cell_end)
            .await
    }

    /// Aspect scores of some aspects over a slice of cells
    pub async fn aspect_matrix_by_aspect<S: AsRef<str>>(
        &self,
        cell_start: usize,
        cell_end: usize,
        aspects: &[S],
    ) -> Result<CombinedSparseMatrix> {
        self.inner
            .aspects
            .get_columns(aspects, cell_start, cell_end)
            .await
    }

    /// Aspect scores of every aspect over a slice of cells
    pub async fn aspect_matrix(
        &self,
        cell_start: usize,
        cell_end: usize,
    ) -> Result<CombinedSparseMatrix> {
        let aspects = self.available_aspects().await?;
        self.aspect_matrix_by_aspect(cell_start, cell_end, &aspects)
            .await
    }
}

impl GeneBatchSource for P2DataController {
    async fn cell_order(&self) -> Result<Vec<String>> {
        let preload = self.inner.expression.load_sparse_preload().await?;
        Ok(preload.dimnames1.names().to_vec())
    }

    async fn gene_names(&self) -> Result<Vec<String>> {
        let preload = self.inner.expression.load_sparse_preload().await?;
        Ok(preload.dimnames2.names().to_vec())
    }

    async fn gene_batch(&self, genes: &[String]) -> Result<GeneBatch> {
        let preload = self.inner.expression.load_sparse_preload().await?;
        let matrix = self.expression_values_sparse(genes, 0, preload.dim1()).await?;
        Ok(GeneBatch::from_sparse(&matrix))
    }
}

impl std::fmt::Debug for P2DataController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2DataController")
            .field("container", &self.inner.container)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::container::fixtures::*;
    use crate::single_cell::dge::DgeParams;
    use crate::single_cell::dge_coordinator::DgeJob;
    use serde_json::json;
    use std::io::Write;

    const N_CELLS: usize = 120;

    fn cells(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("cell{}", i)).collect()
    }

    /// 120 cells x 6 genes, `up*` genes are higher in the first 30 cells
    fn expression() -> SparseFixture {
        let genes = ["up0", "flat1", "flat2", "up3", "flat4", "flat5"];
        let columns: Vec<Vec<f32>> = genes
            .iter()
            .map(|g| {
                (0..N_CELLS)
                    .map(|c| {
                        if g.starts_with("up") && c < 30 {
                            500.0 + c as f32
                        } else {
                            1.0 + ((c * 7) % N_CELLS) as f32
                        }
                    })
                    .collect()
            })
            .collect();
        let cell_names = cells(N_CELLS);
        let row_names: Vec<&str> = cell_names.iter().map(|s| s.as_str()).collect();
        SparseFixture::from_dense_columns(&columns, &row_names, &genes)
    }

    fn aspects() -> SparseFixture {
        let columns = vec![
            (0..N_CELLS).map(|c| c as f32 * 0.5).collect(),
            (0..N_CELLS).map(|c| if c % 2 == 0 { 1.0 } else { 0.0 }).collect(),
        ];
        let cell_names = cells(N_CELLS);
        let row_names: Vec<&str> = cell_names.iter().map(|s| s.as_str()).collect();
        SparseFixture::from_dense_columns(&columns, &row_names, &["aspect1", "aspect2"])
    }

    fn container_bytes() -> Vec<u8> {
        ContainerBuilder::new(64)
            .add_json(CELL_ORDER_KEY, &cells(N_CELLS))
            .add_json(CELL_METADATA_KEY, &json!({"batch": {"data": [0, 1]}}))
            .add_json(
                GENE_INFORMATION_KEY,
                &json!([
                    {"genename": "up0", "dispersion": "1.5"},
                    {"genename": "flat1", "dispersion": 3.25},
                    {"genename": "up3", "dispersion": 0.5},
                    null
                ]),
            )
            .add_json(REDUCED_DENDROGRAM_KEY, &json!({"merge": [[-1, -2]]}))
            .add_json(
                EMBEDDING_STRUCTURE_KEY,
                &json!({"PCA": {"tSNE": "emb_PCA_tSNE", "largeVis": "emb_PCA_largeVis"}}),
            )
            .add_json("emb_PCA_tSNE", &json!({"values": "AAAA", "dim": [120, 2]}))
            .add_json(
                ASPECT_INFORMATION_KEY,
                &json!({"aspect1": ["gs1", "gs2"], "aspect2": ["gs3"]}),
            )
            .add_json(GENESETS_KEY, &json!({"gs1": {"desc": "first"}}))
            .add_json(
                GENESETS_GENES_KEY,
                &json!({"gs1": ["up3", "missing", "up0"], "gs2": []}),
            )
            .add_sparse(EXPRESSION_MATRIX_KEY, &expression())
            .add_sparse(ASPECT_MATRIX_KEY, &aspects())
            .build()
    }

    fn controller() -> P2DataController {
        let source = ContainerSource::Memory(container_bytes().into());
        P2DataController::open(&source, &RemoteConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_json_entries() {
        let dc = controller();

        assert_eq!(dc.cell_order().await.unwrap(), cells(N_CELLS));
        assert_eq!(
            dc.cell_metadata().await.unwrap()["batch"]["data"],
            json!([0, 1])
        );
        assert_eq!(
            dc.reduced_dendrogram().await.unwrap()["merge"],
            json!([[-1, -2]])
        );
        assert_eq!(dc.gene_set_information().await.unwrap()["gs1"]["desc"], "first");
    }

    #[tokio::test]
    async fn test_gene_information() {
        let dc = controller();

        let genes = dc.gene_information().await.unwrap();
        let names: Vec<&str> = genes.iter().map(|g| g.genename.as_str()).collect();
        assert_eq!(names, vec!["flat1", "up0", "up3"]);

        let map = dc.gene_information_map().await.unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["up0"].dispersion, 1.5);
        assert_eq!(map["flat1"].dispersion, 3.25);
        assert_eq!(map["up3"].score, 0.0);

        let again = dc.gene_information_map().await.unwrap();
        assert!(Arc::ptr_eq(&map, &again));

        let set = dc.gene_set_genes("gs1").await.unwrap();
        let names: Vec<&str> = set.iter().map(|g| g.genename.as_str()).collect();
        assert_eq!(names, vec!["up3", "up0"]);
        assert!(dc.gene_set_genes("gs2").await.unwrap().is_empty());
        assert!(matches!(
            dc.gene_set_genes("nope").await,
            Err(P2Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_gene_information_sorted_by_dispersion() {
        let bytes = ContainerBuilder::new(32)
            .add_json(
                GENE_INFORMATION_KEY,
                &json!([
                    {"genename": "a", "dispersion": 0.1},
                    {"genename": "b", "dispersion": "2"},
                    {"genename": "c", "dispersion": 1}
                ]),
            )
            .build();
        let dc = P2DataController::open(
            &ContainerSource::Memory(bytes.into()),
            &RemoteConfig::default(),
        )
        .unwrap();

        let genes = dc.gene_information().await.unwrap();
        let names: Vec<&str> = genes.iter().map(|g| g.genename.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_embeddings() {
        let dc = controller();

        assert_eq!(dc.available_reduction_types().await.unwrap(), vec!["PCA"]);
        assert_eq!(
            dc.available_embeddings("PCA").await.unwrap(),
            vec!["largeVis", "tSNE"]
        );
        assert!(dc.available_embeddings("ICA").await.is_err());

        let emb = dc.embedding("PCA", "tSNE").await.unwrap();
        assert_eq!(emb["values"], "AAAA");
        assert_eq!(emb["dim"], json!([120, 2]));

        assert!(matches!(
            dc.embedding("PCA", "umap").await,
            Err(P2Error::NotFound { .. })
        ));
        // listed in the structure but not stored
        assert!(matches!(
            dc.embedding("PCA", "largeVis").await,
            Err(P2Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_aspects() {
        let dc = controller();

        assert_eq!(
            dc.available_aspects().await.unwrap(),
            vec!["aspect1", "aspect2"]
        );
        assert_eq!(
            dc.genesets_in_aspect("aspect1").await.unwrap(),
            vec![json!("gs1"), json!("gs2")]
        );
        assert!(dc.genesets_in_aspect("aspect9").await.is_err());

        let info = dc.aspect_information().await.unwrap();
        let before = dc.container().range_reader().stats();
        let again = dc.aspect_information().await.unwrap();
        assert!(Arc::ptr_eq(&info, &again));
        assert_eq!(dc.container().range_reader().stats(), before);

        let all = dc.aspect_matrix(10, 14).await.unwrap();
        assert_eq!(all.shape(), (4, 2));
        assert_eq!(all.col_names, vec!["aspect1", "aspect2"]);
        assert_eq!(all.column(0), vec![5.0, 5.5, 6.0, 6.5]);
        assert_eq!(all.column(1), vec![1.0, 0.0, 1.0, 0.0]);

        let one = dc.aspect_matrix_by_aspect(0, N_CELLS, &["aspect2"]).await.unwrap();
        assert_eq!(one.nnz(), N_CELLS / 2);
    }

    #[tokio::test]
    async fn test_expression_values() {
        let dc = controller();

        let m = dc
            .expression_values_sparse(&["up3", "flat1"], 28, 32)
            .await
            .unwrap();
        assert_eq!(m.row_names, vec!["cell28", "cell29", "cell30", "cell31"]);
        assert_eq!(m.column(0)[..2], [528.0, 529.0]);
        assert_eq!(m.column(1), vec![77.0, 84.0, 91.0, 98.0]);

        assert!(matches!(
            dc.expression_values_sparse(&["up0", "nope"], 0, N_CELLS).await,
            Err(P2Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_batch_source() {
        let dc = controller();

        assert_eq!(GeneBatchSource::cell_order(&dc).await.unwrap(), cells(N_CELLS));
        assert_eq!(dc.gene_names().await.unwrap().len(), 6);

        let batch = dc
            .gene_batch(&["flat2".to_string(), "up0".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.genes, vec!["flat2", "up0"]);
        assert_eq!(batch.values.len(), 2);
        assert!(batch.values.iter().all(|v| v.len() == N_CELLS));
        assert_eq!(batch.values[1][0], 500.0);
    }

    #[tokio::test]
    async fn test_dge_job_over_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&container_bytes()).unwrap();
        file.flush().unwrap();

        let source = ContainerSource::parse(file.path().to_str().unwrap());
        let dc = Arc::new(P2DataController::open(&source, &RemoteConfig::default()).unwrap());

        let job = DgeJob::spawn(
            dc,
            vec![(0..30).map(|i| format!("cell{}", i)).collect()],
            DgeParams::default(),
            |_| {},
        );
        let results = job.wait().await.unwrap();

        let mut names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["up0", "up3"]);
        assert!(results.iter().all(|r| r.highest));
    }
}
