//! JSON views of pass results.

use replstack_layer::{
    CompositionReport, FailureMap, LayerRscId, RemovalOutcome, RemovalPlan, RscLayerObject,
    SnapshotReport, SnapshotVlmData,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn failure_strings(failures: &FailureMap) -> BTreeMap<String, String> {
    failures
        .iter()
        .map(|(key, err)| (key.to_string(), err.to_string()))
        .collect()
}

/// Output of `rstack compose`.
#[derive(Debug, Serialize)]
pub struct ComposeOutput {
    /// Composed stacks by resource key.
    pub stacks: BTreeMap<String, Arc<RscLayerObject>>,
    /// Per-resource failures by resource key.
    pub failures: BTreeMap<String, String>,
}

impl From<&CompositionReport> for ComposeOutput {
    fn from(report: &CompositionReport) -> Self {
        Self {
            stacks: report
                .stacks
                .iter()
                .map(|(key, stack)| (key.to_string(), Arc::clone(stack)))
                .collect(),
            failures: failure_strings(&report.failures),
        }
    }
}

/// Layer data created for one snapshot volume.
#[derive(Debug, Serialize)]
pub struct SnapshotVolumeOutput {
    /// Snapshot key.
    pub snapshot: String,
    /// Volume number.
    pub vlm_nr: u32,
    /// The created data.
    pub data: Arc<SnapshotVlmData>,
}

/// Output of `rstack snapshots`.
#[derive(Debug, Serialize)]
pub struct SnapshotOutput {
    /// Snapshot volumes that received layer data in this run.
    pub created: Vec<SnapshotVolumeOutput>,
    /// Snapshot volumes that already had layer data.
    pub existing: usize,
}

impl From<&SnapshotReport> for SnapshotOutput {
    fn from(report: &SnapshotReport) -> Self {
        Self {
            created: report
                .created
                .iter()
                .map(|((key, vlm_nr), data)| SnapshotVolumeOutput {
                    snapshot: key.to_string(),
                    vlm_nr: vlm_nr.as_u32(),
                    data: Arc::clone(data),
                })
                .collect(),
            existing: report.existing,
        }
    }
}

/// Output of `rstack reconcile`.
#[derive(Debug, Serialize)]
pub struct ReconcileOutput {
    /// Removed resources.
    pub resources: Vec<String>,
    /// Removed volumes.
    pub volumes: Vec<String>,
    /// Layer ids returned to the pool.
    pub released_ids: BTreeSet<LayerRscId>,
    /// Per-resource failures of the pass.
    pub failures: BTreeMap<String, String>,
}

impl ReconcileOutput {
    /// Collects the removal plan, its outcome and the pass failures.
    pub fn new(plan: &RemovalPlan, outcome: &RemovalOutcome, failures: &FailureMap) -> Self {
        Self {
            resources: plan.resources.iter().map(ToString::to_string).collect(),
            volumes: plan.volumes.iter().map(ToString::to_string).collect(),
            released_ids: outcome.released_ids.clone(),
            failures: failure_strings(failures),
        }
    }
}
