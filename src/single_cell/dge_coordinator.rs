use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{P2Error, Result};
use crate::single_cell::dge::*;
use crate::single_cell::dge_engine::*;

/////////////
// Sources //
/////////////

/// Where a differential expression run gets its data from
pub trait GeneBatchSource: Send + Sync + 'static {
    /// Canonical order of the cells
    fn cell_order(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// All genes to test
    fn gene_names(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Values of the given genes over all cells, in cell order
    fn gene_batch(&self, genes: &[String]) -> impl Future<Output = Result<GeneBatch>> + Send;
}

/////////
// Job //
/////////

/// A running differential expression job
///
/// Drives a spawned `StatsEngine`, answering its requests from a
/// `GeneBatchSource`. The completion callback runs only when the engine
/// finished all genes; a stopped job never invokes it.
pub struct DgeJob {
    stop: StopSignal,
    task: JoinHandle<Result<Vec<TestResult>>>,
}

impl DgeJob {
    /// Start a job
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// ### Params
    ///
    /// * `source` - Provides cell order, gene names and gene batches.
    /// * `selections` - One or two lists of cell names. With one list the
    ///   other group is every cell of the cell order, the selected ones
    ///   included.
    /// * `params` - The run parameters.
    /// * `on_complete` - Invoked with the results after a clean finish.
    ///
    /// ### Returns
    ///
    /// The `DgeJob`
    pub fn spawn<S, F>(
        source: Arc<S>,
        selections: Vec<Vec<String>>,
        params: DgeParams,
        on_complete: F,
    ) -> Self
    where
        S: GeneBatchSource,
        F: FnOnce(&[TestResult]) + Send + 'static,
    {
        let engine = StatsEngine::spawn();
        let stop = engine.stop_signal();

        let task = tokio::spawn(async move {
            let results = drive(engine, source, selections, params).await?;
            on_complete(&results);
            Ok(results)
        });

        Self { stop, task }
    }

    /// Stop the job
    pub fn stop(&self) {
        self.stop.fire();
    }

    /// A handle that can stop the job from elsewhere
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Wait for the job to end
    ///
    /// ### Returns
    ///
    /// The reported genes, or `Cancelled` if the job was stopped.
    pub async fn wait(self) -> Result<Vec<TestResult>> {
        self.task.await?
    }
}

/// Run one source call, giving way to the stop signal
async fn or_stop<T>(stop: &StopSignal, fut: impl Future<Output = Result<T>>) -> Option<Result<T>> {
    tokio::select! {
        biased;
        _ = stop.fired() => None,
        res = fut => Some(res),
    }
}

/// Answer engine requests until it terminates
async fn drive<S: GeneBatchSource>(
    mut engine: EngineHandle,
    source: Arc<S>,
    selections: Vec<Vec<String>>,
    params: DgeParams,
) -> Result<Vec<TestResult>> {
    let stop = engine.stop_signal();

    let Some(gene_names) = or_stop(&stop, source.gene_names()).await else {
        return wait_for_abrupt_death(engine).await;
    };
    engine.send(EngineMessage {
        command: Command::Setup,
        params: EngineParams::new(gene_names?, params),
    })?;

    let mut selections = Some(selections);

    loop {
        let reply = engine
            .recv()
            .await
            .ok_or_else(|| P2Error::Engine("engine ended without a reply".to_string()))?;
        let params = reply.params.unwrap_or_default();

        let command = match reply.request {
            Request::CellOrder => {
                let Some(cells) = or_stop(&stop, source.cell_order()).await else {
                    return wait_for_abrupt_death(engine).await;
                };
                Command::Initiate {
                    data: cells?,
                    selections: selections.take().unwrap_or_default(),
                }
            }
            Request::ExprVals { data } => {
                debug!(genes = data.len(), index = params.index, "fetching batch");
                let Some(batch) = or_stop(&stop, source.gene_batch(&data)).await else {
                    return wait_for_abrupt_death(engine).await;
                };
                Command::Process { data: batch? }
            }
            Request::CleanDeath => {
                info!(reported = params.results.len(), "differential expression complete");
                return Ok(params.results);
            }
            Request::AbruptDeath => return Err(P2Error::Cancelled),
            Request::Error { data } => return Err(P2Error::Engine(data)),
        };

        if engine.send(EngineMessage { command, params }).is_err() {
            // the engine only goes away unasked after a stop
            return wait_for_abrupt_death(engine).await;
        }
    }
}

/// Drain the engine after a stop
async fn wait_for_abrupt_death(mut engine: EngineHandle) -> Result<Vec<TestResult>> {
    engine.stop();
    while let Some(reply) = engine.recv().await {
        if reply.request == Request::AbruptDeath {
            break;
        }
    }
    Err(P2Error::Cancelled)
}
