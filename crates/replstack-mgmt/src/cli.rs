//! The `rstack` command line: argument parsing and the compose, snapshots and reconcile runs.

use crate::cluster::ClusterSpec;
use crate::report::{ComposeOutput, ReconcileOutput, SnapshotOutput};
use anyhow::Result;
use clap::{Parser, Subcommand};
use replstack_layer::{
    synthesize_snapshots, AccessContext, AllNodesPlacement, ClusterModel, CompositionReport,
    DeletionReconciler, EngineConfig, FailureMap, LocalNodePlacement, PlacementLookup, ResourceKey,
    SnapshotKey, StackBuilder,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Command line of the `rstack` binary.
#[derive(Parser, Debug)]
#[command(name = "rstack")]
#[command(about = "Layer stack composition for replicated volumes", long_about = None)]
pub struct Cli {
    /// Engine configuration (TOML or JSON); built-in defaults when absent.
    #[arg(long, env = "RSTACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// `rstack` subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Builds the layer stacks of every default resource.
    Compose {
        /// Cluster description file (TOML or JSON).
        #[arg(short, long)]
        cluster: PathBuf,
        /// Only print stacks placed on this node.
        #[arg(short, long)]
        node: Option<String>,
        /// Compose resource definitions concurrently.
        #[arg(long)]
        parallel: bool,
    },
    /// Synthesizes missing snapshot layer data.
    Snapshots {
        /// Cluster description file (TOML or JSON).
        #[arg(short, long)]
        cluster: PathBuf,
    },
    /// Composes, then computes and applies the removal sets.
    Reconcile {
        /// Cluster description file (TOML or JSON).
        #[arg(short, long)]
        cluster: PathBuf,
    },
}

fn placement(node: Option<String>) -> Box<dyn PlacementLookup + Send + Sync> {
    match node {
        Some(node) => Box::new(LocalNodePlacement::new(node)),
        None => Box::new(AllNodesPlacement),
    }
}

fn all_resource_keys(model: &ClusterModel) -> Vec<ResourceKey> {
    model.resources().map(|rsc| rsc.key.clone()).collect()
}

impl Cli {
    /// Runs the command and returns its JSON output.
    pub async fn run(self) -> Result<String> {
        let config = self.engine_config()?;
        let json = match &self.command {
            Command::Compose {
                cluster,
                node,
                parallel,
            } => {
                let report = compose(cluster, &config, node.clone(), *parallel).await?;
                serde_json::to_string_pretty(&ComposeOutput::from(&report))?
            }
            Command::Snapshots { cluster } => {
                serde_json::to_string_pretty(&snapshots(cluster, &config)?)?
            }
            Command::Reconcile { cluster } => {
                serde_json::to_string_pretty(&reconcile(cluster, &config)?)?
            }
        };
        Ok(json)
    }

    /// Loads `--config`, or the defaults when it is absent.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => Ok(EngineConfig::from_file(path)?),
            None => Ok(EngineConfig::default()),
        }
    }
}

fn load_model(cluster: &Path, config: &EngineConfig) -> Result<ClusterModel> {
    ClusterSpec::from_file(cluster)?.build(config)
}

async fn compose(
    cluster: &Path,
    config: &EngineConfig,
    node: Option<String>,
    parallel: bool,
) -> Result<CompositionReport> {
    let model = load_model(cluster, config)?;
    let builder = StackBuilder::new();
    let ctx = AccessContext::system();

    if !parallel {
        let keys = all_resource_keys(&model);
        return Ok(builder.compose_pass(&model, &ctx, &keys, placement(node).as_ref())?);
    }

    let model = Arc::new(model);
    let builder = Arc::new(builder);
    let names: Vec<_> = model.resource_definitions().map(|dfn| dfn.name.clone()).collect();
    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        let model = Arc::clone(&model);
        let builder = Arc::clone(&builder);
        let placement = placement(node.clone());
        handles.push(tokio::task::spawn_blocking(move || {
            builder.compose_definition(&model, &AccessContext::system(), &name, placement.as_ref())
        }));
    }

    let mut report = CompositionReport::default();
    for handle in handles {
        let part = handle.await??;
        report.stacks.extend(part.stacks);
        report.failures.extend(part.failures);
    }
    info!(
        stacks = report.stacks.len(),
        failed = report.failures.len(),
        "parallel composition"
    );
    Ok(report)
}

fn snapshots(cluster: &Path, config: &EngineConfig) -> Result<SnapshotOutput> {
    let model = load_model(cluster, config)?;
    let keys: Vec<SnapshotKey> = model.snapshots().map(|snap| snap.key.clone()).collect();
    let report = synthesize_snapshots(&model, &AccessContext::system(), &keys)?;
    Ok(SnapshotOutput::from(&report))
}

fn reconcile(cluster: &Path, config: &EngineConfig) -> Result<ReconcileOutput> {
    let mut model = load_model(cluster, config)?;
    let builder = StackBuilder::new();
    let ctx = AccessContext::system();

    let keys = all_resource_keys(&model);
    let mut failures: FailureMap =
        builder.compose_pass(&model, &ctx, &keys, &AllNodesPlacement)?.failures;
    let touched: BTreeSet<ResourceKey> = keys.into_iter().collect();
    let plan = DeletionReconciler::new(&model, &ctx).plan(&touched, &mut failures)?;
    let outcome = builder.apply_removals(&mut model, &plan)?;
    Ok(ReconcileOutput::new(&plan, &outcome, &failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CLUSTER: &str = r#"
[[pools]]
node = "n1"
name = "lvm0"
kind = "LVM"

[[pools]]
node = "n2"
name = "lvm0"
kind = "LVM"

[[pools]]
node = "n1"
name = "thin"
kind = "LVM_THIN"

[[resource_definitions]]
name = "data1"
port = 7000
volumes = [{ nr = 0, size_kib = 1024 }]

[[resource_definitions]]
name = "data2"
port = 7001
volumes = [{ nr = 0, size_kib = 1024 }]

[[resources]]
node = "n1"
name = "data1"
volumes = [{ nr = 0, pool = "lvm0" }]

[[resources]]
node = "n2"
name = "data1"
volumes = [{ nr = 0, pool = "lvm0" }]

[[resources]]
node = "n2"
name = "data2"
flags = { delete = true }

[[snapshots]]
node = "n1"
resource = "data1"
name = "snap1"
volumes = [{ nr = 0, pool = "thin" }]
"#;

    fn cluster_file() -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(file, "{}", CLUSTER).unwrap();
        file
    }

    #[test]
    fn test_parse_compose() {
        let cli = Cli::try_parse_from([
            "rstack",
            "compose",
            "--cluster",
            "c.toml",
            "--node",
            "n1",
            "--parallel",
        ])
        .unwrap();
        match cli.command {
            Command::Compose {
                cluster,
                node,
                parallel,
            } => {
                assert_eq!(cluster, PathBuf::from("c.toml"));
                assert_eq!(node.as_deref(), Some("n1"));
                assert!(parallel);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_requires_cluster() {
        assert!(Cli::try_parse_from(["rstack", "reconcile"]).is_err());
    }

    #[tokio::test]
    async fn test_compose_filters_node() {
        let file = cluster_file();
        let cli = Cli::try_parse_from([
            "rstack",
            "compose",
            "--cluster",
            file.path().to_str().unwrap(),
            "--node",
            "n1",
        ])
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&cli.run().await.unwrap()).unwrap();
        let stacks = json["stacks"].as_object().unwrap();
        assert_eq!(stacks.len(), 1);
        assert!(stacks.contains_key("n1/data1"));
        assert_eq!(stacks["n1/data1"]["data"]["layer"], "DRBD");
    }

    #[tokio::test]
    async fn test_parallel_matches_sequential_shape() {
        let file = cluster_file();
        let config = EngineConfig::default();
        let sequential = compose(file.path(), &config, None, false).await.unwrap();
        let parallel = compose(file.path(), &config, None, true).await.unwrap();
        let keys = |report: &CompositionReport| report.stacks.keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys(&sequential), keys(&parallel));
        assert_eq!(sequential.stacks.len(), 3);
    }

    #[test]
    fn test_snapshots_synthesized() {
        let file = cluster_file();
        let output = snapshots(file.path(), &EngineConfig::default()).unwrap();
        assert_eq!(output.created.len(), 1);
        assert_eq!(output.created[0].data.identifier(), "data1_00000");
    }

    #[test]
    fn test_reconcile_removes_deleted_resource() {
        let file = cluster_file();
        let output = reconcile(file.path(), &EngineConfig::default()).unwrap();
        assert_eq!(output.resources, vec!["n2/data2".to_string()]);
        assert!(output.failures.is_empty());
        assert_eq!(output.released_ids.len(), 1);
    }
}
