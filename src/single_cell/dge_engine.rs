use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{P2Error, Result};
use crate::single_cell::dge::*;

//////////////
// Messages //
//////////////

/// Commands sent to the engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Start a run. The engine answers with a cell order request.
    #[serde(rename = "setup")]
    Setup,
    /// Canonical cell order plus one or two cell selections
    #[serde(rename = "initiate")]
    Initiate {
        data: Vec<String>,
        selections: Vec<Vec<String>>,
    },
    /// Values of the genes the engine asked for
    #[serde(rename = "process")]
    Process { data: GeneBatch },
    /// Cancel the run
    #[serde(rename = "stop")]
    Stop,
}

/// Requests sent back by the engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "cell order")]
    CellOrder,
    #[serde(rename = "expr vals")]
    ExprVals { data: Vec<String> },
    /// All genes are processed, the results are in the params
    #[serde(rename = "clean death")]
    CleanDeath,
    /// The run was stopped
    #[serde(rename = "abrupt death")]
    AbruptDeath,
    /// A command could not be handled, the engine has terminated
    #[serde(rename = "error")]
    Error { data: String },
}

/// State of one run. It travels with every message, the engine keeps none.
///
/// ### Fields
///
/// * `dge` - The run parameters.
/// * `gene_names` - All genes to test, in order.
/// * `sel_a_idx` - Cell positions of group A.
/// * `sel_b_idx` - Cell positions of group B.
/// * `step` - Genes per batch.
/// * `index` - Position of the next batch in `gene_names`.
/// * `num_cells` - Number of cells in the cell order.
/// * `results` - Reported genes so far.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineParams {
    #[serde(flatten)]
    pub dge: DgeParams,
    pub gene_names: Vec<String>,
    #[serde(rename = "selAidx")]
    pub sel_a_idx: Vec<usize>,
    #[serde(rename = "selBidx")]
    pub sel_b_idx: Vec<usize>,
    pub step: usize,
    pub index: usize,
    pub num_cells: usize,
    pub results: Vec<TestResult>,
}

impl EngineParams {
    /// Fresh state for a run over `gene_names`
    pub fn new(gene_names: Vec<String>, dge: DgeParams) -> Self {
        Self {
            dge,
            gene_names,
            ..Default::default()
        }
    }

    /// The genes of the batch starting at `index`
    fn next_batch(&self) -> Vec<String> {
        let end = (self.index + self.step).min(self.gene_names.len());
        self.gene_names[self.index.min(end)..end].to_vec()
    }
}

/// Inbound message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineMessage {
    pub command: Command,
    #[serde(default)]
    pub params: EngineParams,
}

/// Outbound message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineReply {
    pub request: Request,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<EngineParams>,
}

impl EngineReply {
    fn with_params(request: Request, params: EngineParams) -> Self {
        Self {
            request,
            params: Some(params),
        }
    }

    /// Does the engine stop after this reply
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.request,
            Request::CleanDeath | Request::AbruptDeath | Request::Error { .. }
        )
    }
}

/////////////
// Helpers //
/////////////

/// Positions of the named cells in the cell order
///
/// Names missing from the cell order are skipped.
fn selection_indices(lookup: &FxHashMap<&str, usize>, selection: &[String]) -> Vec<usize> {
    let idx: Vec<usize> = selection
        .iter()
        .filter_map(|name| lookup.get(name.as_str()).copied())
        .collect();

    if idx.len() < selection.len() {
        warn!(
            missing = selection.len() - idx.len(),
            "selected cells not in the cell order"
        );
    }
    idx
}

/// Cancellation flag shared between the coordinator and the engine
#[derive(Clone, Debug)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    /// Raise the flag. Raising it again has no effect.
    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is raised
    pub fn fired(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.0.subscribe();
        async move {
            if rx.wait_for(|&fired| fired).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

////////////
// Engine //
////////////

/// The differential expression engine
///
/// A message handler without state of its own. Run in its own task through
/// `StatsEngine::spawn`, talking to the coordinator only through messages.
pub struct StatsEngine;

impl StatsEngine {
    /// Handle one command
    ///
    /// ### Params
    ///
    /// * `msg` - The command together with the current state of the run.
    ///
    /// ### Returns
    ///
    /// The engine's next request carrying the updated state, or an `Engine`
    /// error for a command that does not fit the state.
    pub fn handle(msg: EngineMessage) -> Result<EngineReply> {
        let EngineMessage {
            command,
            mut params,
        } = msg;

        match command {
            Command::Setup => Ok(EngineReply::with_params(Request::CellOrder, params)),

            Command::Initiate { data, selections } => {
                let mut lookup: FxHashMap<&str, usize> = FxHashMap::default();
                for (i, name) in data.iter().enumerate().rev() {
                    lookup.insert(name.as_str(), i);
                }

                let (sel_a, sel_b) = match selections.as_slice() {
                    // a single selection is compared against every cell
                    [a] => (selection_indices(&lookup, a), (0..data.len()).collect()),
                    [a, b] => (selection_indices(&lookup, a), selection_indices(&lookup, b)),
                    _ => {
                        return Err(P2Error::Engine(format!(
                            "Expected one or two selections, got {}",
                            selections.len()
                        )))
                    }
                };

                params.sel_a_idx = sel_a;
                params.sel_b_idx = sel_b;
                params.num_cells = data.len();
                params.step = params.dge.batch_size(params.gene_names.len());
                params.index = 0;
                params.results.clear();

                info!(
                    genes = params.gene_names.len(),
                    cells = params.num_cells,
                    group_a = params.sel_a_idx.len(),
                    group_b = params.sel_b_idx.len(),
                    step = params.step,
                    "differential expression initiated"
                );

                if params.gene_names.is_empty() {
                    return Ok(EngineReply::with_params(Request::CleanDeath, params));
                }
                let genes = params.next_batch();
                Ok(EngineReply::with_params(
                    Request::ExprVals { data: genes },
                    params,
                ))
            }

            Command::Process { data } => {
                if params.step == 0 {
                    return Err(P2Error::Engine(
                        "process received before initiate".to_string(),
                    ));
                }

                let found = run_test_on_batch(
                    &data,
                    &params.sel_a_idx,
                    &params.sel_b_idx,
                    params.num_cells,
                    &params.dge,
                )?;
                debug!(
                    index = params.index,
                    genes = data.len(),
                    reported = found.len(),
                    "processed batch"
                );
                params.results.extend(found);
                params.index += params.step;

                if params.index < params.gene_names.len() {
                    let genes = params.next_batch();
                    Ok(EngineReply::with_params(
                        Request::ExprVals { data: genes },
                        params,
                    ))
                } else {
                    Ok(EngineReply::with_params(Request::CleanDeath, params))
                }
            }

            Command::Stop => Ok(EngineReply {
                request: Request::AbruptDeath,
                params: None,
            }),
        }
    }

    /// Start the engine in its own task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> EngineHandle {
        Self::spawn_with(StatsEngine::handle)
    }

    /// Start a message loop answering commands with `handler`
    fn spawn_with<H>(handler: H) -> EngineHandle
    where
        H: Fn(EngineMessage) -> Result<EngineReply> + Clone + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let stop = StopSignal::new();

        let task = tokio::spawn(engine_loop(cmd_rx, reply_tx, stop.clone(), handler));

        EngineHandle {
            commands: cmd_tx,
            replies: reply_rx,
            stop,
            task,
        }
    }
}

/// Message loop of a spawned engine
///
/// The stop signal always wins over queued commands and over a batch that is
/// still being scored.
async fn engine_loop<H>(
    mut commands: mpsc::UnboundedReceiver<EngineMessage>,
    replies: mpsc::UnboundedSender<EngineReply>,
    stop: StopSignal,
    handler: H,
) where
    H: Fn(EngineMessage) -> Result<EngineReply> + Clone + Send + 'static,
{
    let abrupt = || EngineReply {
        request: Request::AbruptDeath,
        params: None,
    };

    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.fired() => None,
            msg = commands.recv() => match msg {
                Some(msg) => Some(msg),
                // coordinator is gone
                None => return,
            },
        };

        let msg = match msg {
            Some(msg) if msg.command != Command::Stop => msg,
            _ => {
                info!("differential expression stopped");
                let _ = replies.send(abrupt());
                return;
            }
        };

        let handler = handler.clone();
        let work = tokio::task::spawn_blocking(move || handler(msg));
        let reply = tokio::select! {
            biased;
            _ = stop.fired() => {
                info!("differential expression stopped mid batch");
                let _ = replies.send(abrupt());
                return;
            }
            res = work => match res.map_err(P2Error::from).and_then(|r| r) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "engine failed");
                    EngineReply {
                        request: Request::Error { data: e.to_string() },
                        params: None,
                    }
                }
            },
        };

        if matches!(reply.request, Request::CleanDeath) {
            info!("differential expression finished");
        }
        let terminal = reply.is_terminal();
        if replies.send(reply).is_err() || terminal {
            return;
        }
    }
}

/// Coordinator side of a spawned engine
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineMessage>,
    replies: mpsc::UnboundedReceiver<EngineReply>,
    stop: StopSignal,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Send a command
    ///
    /// A `Stop` command raises the stop signal, so it overtakes any queued
    /// work.
    pub fn send(&self, msg: EngineMessage) -> Result<()> {
        if msg.command == Command::Stop {
            self.stop.fire();
            return Ok(());
        }
        self.commands
            .send(msg)
            .map_err(|_| P2Error::Engine("engine has terminated".to_string()))
    }

    /// Cancel the run
    pub fn stop(&self) {
        self.stop.fire();
    }

    /// The stop signal of this engine
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Next reply, `None` once the engine terminated and all replies were read
    pub async fn recv(&mut self) -> Option<EngineReply> {
        self.replies.recv().await
    }

    /// Has the engine task ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("cell{}", i)).collect()
    }

    fn genes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("gene{}", i)).collect()
    }

    fn message(command: Command, params: EngineParams) -> EngineMessage {
        EngineMessage { command, params }
    }

    const N_CELLS: usize = 120;

    /// The first 30 cells form A, every gene is up in A
    fn batch_for(genes: &[String]) -> GeneBatch {
        let values = genes
            .iter()
            .map(|_| {
                (0..N_CELLS)
                    .map(|c| {
                        if c < 30 {
                            500.0 + c as f32
                        } else {
                            1.0 + ((c * 7) % N_CELLS) as f32
                        }
                    })
                    .collect()
            })
            .collect();
        GeneBatch {
            genes: genes.to_vec(),
            values,
        }
    }

    #[test]
    fn test_message_wire_format() {
        let msg: EngineMessage = serde_json::from_str(
            r#"{"command": {"type": "initiate", "data": ["a", "b"], "selections": [["a"]]},
                "params": {"method": "default", "geneNames": ["g1"]}}"#,
        )
        .unwrap();
        assert!(matches!(msg.command, Command::Initiate { .. }));
        assert_eq!(msg.params.gene_names, vec!["g1"]);

        let reply = EngineReply::with_params(
            Request::ExprVals {
                data: vec!["g1".into()],
            },
            EngineParams::default(),
        );
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["request"]["type"], "expr vals");
        assert_eq!(json["request"]["data"][0], "g1");
        assert!(json["params"]["selAidx"].is_array());

        let abrupt = EngineReply {
            request: Request::AbruptDeath,
            params: None,
        };
        let json = serde_json::to_value(&abrupt).unwrap();
        assert_eq!(json["request"]["type"], "abrupt death");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_initiate_partitions_cells() {
        let order = cells(6);
        let params = EngineParams::new(genes(25), DgeParams::default());

        // two selections, unknown names are skipped
        let reply = StatsEngine::handle(message(
            Command::Initiate {
                data: order.clone(),
                selections: vec![
                    vec!["cell4".into(), "cell1".into(), "ghost".into()],
                    vec!["cell0".into()],
                ],
            },
            params.clone(),
        ))
        .unwrap();
        let p = reply.params.unwrap();
        assert_eq!(p.sel_a_idx, vec![4, 1]);
        assert_eq!(p.sel_b_idx, vec![0]);
        assert_eq!(p.num_cells, 6);
        assert_eq!(p.step, 10);
        assert_eq!(reply.request, Request::ExprVals { data: genes(10) });

        // one selection, B is every cell of the order
        let reply = StatsEngine::handle(message(
            Command::Initiate {
                data: order.clone(),
                selections: vec![vec!["cell2".into(), "cell5".into()]],
            },
            params.clone(),
        ))
        .unwrap();
        let p = reply.params.unwrap();
        assert_eq!(p.sel_a_idx, vec![2, 5]);
        assert_eq!(p.sel_b_idx, vec![0, 1, 2, 3, 4, 5]);

        let res = StatsEngine::handle(message(
            Command::Initiate {
                data: order,
                selections: vec![],
            },
            params,
        ));
        assert!(matches!(res, Err(P2Error::Engine(_))));
    }

    #[test]
    fn test_protocol_runs_to_clean_death() {
        let gene_names = genes(25);
        let reply = StatsEngine::handle(message(
            Command::Setup,
            EngineParams::new(gene_names.clone(), DgeParams::default()),
        ))
        .unwrap();
        assert_eq!(reply.request, Request::CellOrder);

        let mut reply = StatsEngine::handle(message(
            Command::Initiate {
                data: cells(N_CELLS),
                selections: vec![cells(30)],
            },
            reply.params.unwrap(),
        ))
        .unwrap();

        let mut requested = Vec::new();
        loop {
            match reply.request {
                Request::ExprVals { data } => {
                    requested.push(data.len());
                    reply = StatsEngine::handle(message(
                        Command::Process {
                            data: batch_for(&data),
                        },
                        reply.params.unwrap(),
                    ))
                    .unwrap();
                }
                Request::CleanDeath => break,
                other => panic!("unexpected request {:?}", other),
            }
        }

        assert_eq!(requested, vec![10, 10, 5]);
        let results = reply.params.unwrap().results;
        assert_eq!(results.len(), 25);
        assert!(results.iter().all(|r| r.highest));
        assert_eq!(results[24].name, "gene24");
    }

    #[test]
    fn test_process_before_initiate_is_rejected() {
        let res = StatsEngine::handle(message(
            Command::Process {
                data: GeneBatch::default(),
            },
            EngineParams::default(),
        ));
        assert!(matches!(res, Err(P2Error::Engine(_))));
    }

    #[tokio::test]
    async fn test_spawned_engine_round_trip() {
        let mut engine = StatsEngine::spawn();
        engine
            .send(message(
                Command::Setup,
                EngineParams::new(genes(3), DgeParams::default()),
            ))
            .unwrap();

        let reply = engine.recv().await.unwrap();
        assert_eq!(reply.request, Request::CellOrder);

        engine
            .send(message(
                Command::Initiate {
                    data: cells(N_CELLS),
                    selections: vec![cells(30)],
                },
                reply.params.unwrap(),
            ))
            .unwrap();
        let reply = engine.recv().await.unwrap();
        let Request::ExprVals { data } = reply.request.clone() else {
            panic!("expected expr vals");
        };

        engine
            .send(message(
                Command::Process {
                    data: batch_for(&data),
                },
                reply.params.unwrap(),
            ))
            .unwrap();
        let reply = engine.recv().await.unwrap();
        assert_eq!(reply.request, Request::CleanDeath);
        assert_eq!(reply.params.unwrap().results.len(), 3);

        assert!(engine.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_before_process_gives_abrupt_death() {
        let mut engine = StatsEngine::spawn();
        engine
            .send(message(
                Command::Setup,
                EngineParams::new(genes(100), DgeParams::default()),
            ))
            .unwrap();
        let reply = engine.recv().await.unwrap();

        engine
            .send(message(
                Command::Initiate {
                    data: cells(N_CELLS),
                    selections: vec![cells(30)],
                },
                reply.params.unwrap(),
            ))
            .unwrap();
        let reply = engine.recv().await.unwrap();
        let Request::ExprVals { data } = reply.request.clone() else {
            panic!("expected expr vals");
        };

        engine.send(message(Command::Stop, EngineParams::default())).unwrap();
        // already queued behind the stop, never answered
        let _ = engine.send(message(
            Command::Process {
                data: batch_for(&data),
            },
            reply.params.unwrap(),
        ));

        let reply = engine.recv().await.unwrap();
        assert_eq!(reply.request, Request::AbruptDeath);
        assert!(reply.params.is_none());
        assert!(engine.recv().await.is_none());
        assert!(engine.stop_signal().is_fired());
    }

    #[tokio::test]
    async fn test_stop_while_scoring_gives_one_abrupt_death() {
        let scoring = Arc::new(tokio::sync::Notify::new());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        // scoring of a batch only finishes once released
        let handler = {
            let scoring = Arc::clone(&scoring);
            move |msg: EngineMessage| {
                if matches!(msg.command, Command::Process { .. }) {
                    scoring.notify_one();
                    let _ = release_rx.lock().unwrap().recv();
                }
                StatsEngine::handle(msg)
            }
        };

        let mut engine = StatsEngine::spawn_with(handler);
        engine
            .send(message(
                Command::Setup,
                EngineParams::new(genes(500), DgeParams::default()),
            ))
            .unwrap();
        let reply = engine.recv().await.unwrap();

        engine
            .send(message(
                Command::Initiate {
                    data: cells(N_CELLS),
                    selections: vec![cells(30)],
                },
                reply.params.unwrap(),
            ))
            .unwrap();
        let reply = engine.recv().await.unwrap();
        let Request::ExprVals { data } = reply.request.clone() else {
            panic!("expected expr vals");
        };

        engine
            .send(message(
                Command::Process {
                    data: batch_for(&data),
                },
                reply.params.unwrap(),
            ))
            .unwrap();

        scoring.notified().await;
        engine.stop();

        let reply = engine.recv().await.unwrap();
        assert_eq!(reply.request, Request::AbruptDeath);
        assert!(reply.params.is_none());
        assert!(engine.recv().await.is_none());

        // the engine is gone, nothing else is accepted
        assert!(engine
            .send(message(Command::Setup, EngineParams::default()))
            .is_err());

        release_tx.send(()).unwrap();
    }
}
