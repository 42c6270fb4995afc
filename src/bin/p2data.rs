use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use p2data::core::base::stats::{get_dge_method, DgeMethod};
use p2data::core::data::controller::EXPRESSION_MATRIX_KEY;
use p2data::core::io::range_reader::DEFAULT_TIMEOUT;
use p2data::{
    ContainerReader, ContainerSource, DgeJob, DgeParams, P2DataController, RangeReader,
    RemoteConfig, SparseAccessor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect pagoda2 data containers.", long_about = None)]
struct CliArgs {
    /// Timeout in seconds for each remote range request
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header and the index
    Index { source: String },

    /// Print a JSON entry
    Entry { source: String, key: String },

    /// Print one dense column of a sparse matrix
    Column {
        source: String,
        name: String,
        #[arg(long, default_value = EXPRESSION_MATRIX_KEY)]
        matrix: String,
        #[arg(long)]
        start: Option<usize>,
        #[arg(long)]
        end: Option<usize>,
    },

    /// Run differential expression between two groups of cells
    De {
        source: String,
        /// Cells of group A, one per line or a JSON array
        #[arg(long)]
        sel_a: PathBuf,
        /// Cells of group B; every cell of the cell order if absent
        #[arg(long)]
        sel_b: Option<PathBuf>,
        #[arg(long, default_value = "ksTest", value_parser = parse_method)]
        method: DgeMethod,
        #[arg(long, default_value_t = 3.0)]
        z_threshold: f64,
    },
}

fn parse_method(s: &str) -> Result<DgeMethod, String> {
    get_dge_method(s).ok_or_else(|| format!("Unknown method '{}', use ksTest or wilcoxon", s))
}

/// Read a list of cell names
fn read_selection(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read selection {}", path.display()))?;
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON selection {}", path.display()));
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let config = RemoteConfig {
        timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };

    match args.command {
        Commands::Index { source } => {
            let reader = RangeReader::from_source(&ContainerSource::parse(&source), &config)?;
            let container = ContainerReader::open(reader).await?;
            let layout = container.ready().await?;
            print_json(&json!({
                "header": layout.header,
                "dataOffset": layout.header.data_offset(),
                "entries": layout.index.entries(),
            }))?;
        }
        Commands::Entry { source, key } => {
            let reader = RangeReader::from_source(&ContainerSource::parse(&source), &config)?;
            let container = ContainerReader::open(reader).await?;
            let value: serde_json::Value = container.get_json_entry(&key).await?;
            print_json(&value)?;
        }
        Commands::Column {
            source,
            name,
            matrix,
            start,
            end,
        } => {
            let reader = RangeReader::from_source(&ContainerSource::parse(&source), &config)?;
            let accessor = SparseAccessor::new(ContainerReader::new(reader), matrix);
            let preload = accessor.load_sparse_preload().await?;
            let start = start.unwrap_or(0);
            let end = end.unwrap_or(preload.dim1());
            let values = accessor.get_column_range(&name, start, end).await?;
            print_json(&json!({
                "name": name,
                "rows": &preload.dimnames1.names()[start..end],
                "values": values,
            }))?;
        }
        Commands::De {
            source,
            sel_a,
            sel_b,
            method,
            z_threshold,
        } => {
            let mut selections = vec![read_selection(&sel_a)?];
            if let Some(path) = sel_b {
                selections.push(read_selection(&path)?);
            }
            if selections[0].is_empty() {
                bail!("Selection {} is empty", sel_a.display());
            }

            let controller = P2DataController::open(&ContainerSource::parse(&source), &config)?;
            let params = DgeParams {
                method,
                z_threshold,
                ..Default::default()
            };

            let job = DgeJob::spawn(Arc::new(controller), selections, params, |res| {
                info!(reported = res.len(), "differential expression finished");
            });

            let mut results = job.wait().await?;
            results.sort_by(|a, b| b.abs_z.total_cmp(&a.abs_z));
            print_json(&results)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults_to_remote_config() {
        let args = CliArgs::try_parse_from(["p2data", "index", "data.bin"]).unwrap();
        assert_eq!(
            Duration::from_secs(args.timeout),
            RemoteConfig::default().timeout
        );

        let args =
            CliArgs::try_parse_from(["p2data", "--timeout", "5", "entry", "data.bin", "cellorder"])
                .unwrap();
        assert_eq!(args.timeout, 5);
        assert!(matches!(args.command, Commands::Entry { .. }));
    }

    #[test]
    fn test_method_parsing() {
        let args = CliArgs::try_parse_from([
            "p2data", "de", "data.bin", "--sel-a", "a.txt", "--method", "wilcoxon",
        ])
        .unwrap();
        let Commands::De { method, sel_b, .. } = args.command else {
            panic!("expected de");
        };
        assert_eq!(method, DgeMethod::Wilcoxon);
        assert!(sel_b.is_none());

        assert!(CliArgs::try_parse_from([
            "p2data", "de", "data.bin", "--sel-a", "a.txt", "--method", "ttest",
        ])
        .is_err());
    }
}
