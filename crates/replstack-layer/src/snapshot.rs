//! Lazy layer data of snapshot volumes.
//!
//! Only thin-provisioning backends can hold snapshots. The synthesized record
//! names the physical object after the resource and volume number, so every
//! node derives the same name.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::access::{AccessContext, AccessType};
use crate::error::{LayerError, LayerResult};
use crate::layer_data::SnapshotVlmData;
use crate::model::{ClusterModel, Snapshot};
use crate::storage::{lvm_thin_pool, lvm_volume_group, zfs_pool};
use crate::types::{ProviderKind, SnapshotKey, VolumeNumber};

/// Outcome of one synthesis run.
#[derive(Debug, Default)]
pub struct SnapshotReport {
    /// Records created by this run.
    pub created: BTreeMap<(SnapshotKey, VolumeNumber), Arc<SnapshotVlmData>>,
    /// Volumes that already had layer data.
    pub existing: usize,
}

/// Ensures every volume of `snapshot` carries layer data. Returns the
/// records created by this call.
pub fn ensure_snapshot_layer_data(
    model: &ClusterModel,
    ctx: &AccessContext,
    snapshot: &Snapshot,
) -> LayerResult<Vec<(VolumeNumber, Arc<SnapshotVlmData>)>> {
    let factory = model.factory();
    let mut created = Vec::new();

    for snap_vlm in snapshot.volumes.values() {
        let pool = model.storage_pool(&snapshot.key.node, &snap_vlm.stor_pool)?;
        let kind = pool.provider_kind(ctx)?;
        if !kind.supports_snapshots() {
            return Err(LayerError::implementation(format!(
                "snapshot {} volume {} lives in storage pool {} of kind {} without snapshot support",
                snapshot.key, snap_vlm.vlm_nr, pool.name, kind
            )));
        }
        if snap_vlm.layer_data().is_some() {
            continue;
        }

        snapshot.protection.require_access(ctx, AccessType::Change)?;
        let identifier = snapshot.key.rsc_name.volume_identifier(snap_vlm.vlm_nr);
        let (data, was_created) = snap_vlm.layer_data.get_or_try_init(|| {
            let props = pool.props(ctx)?;
            let data = match kind {
                ProviderKind::LvmThin => {
                    factory.create_snapshot_lvm_thin_data(
                        lvm_volume_group(props),
                        lvm_thin_pool(props),
                        identifier,
                    )
                }
                ProviderKind::Zfs | ProviderKind::ZfsThin => {
                    factory.create_snapshot_zfs_data(zfs_pool(props, kind), identifier, kind)
                }
                other => {
                    return Err(LayerError::implementation(format!(
                        "no snapshot layer data for provider kind {}",
                        other
                    )))
                }
            };
            Ok(data)
        })?;
        if was_created {
            debug!(
                snapshot = %snapshot.key,
                vlm_nr = %snap_vlm.vlm_nr,
                name = data.identifier(),
                "synthesized snapshot layer data"
            );
            created.push((snap_vlm.vlm_nr, data));
        }
    }
    Ok(created)
}

/// Runs [`ensure_snapshot_layer_data`] over the given snapshots.
pub fn synthesize_snapshots<'k>(
    model: &ClusterModel,
    ctx: &AccessContext,
    keys: impl IntoIterator<Item = &'k SnapshotKey>,
) -> LayerResult<SnapshotReport> {
    let mut report = SnapshotReport::default();
    for key in keys {
        let snapshot = model.snapshot(key)?;
        let created = ensure_snapshot_layer_data(model, ctx, snapshot)?;
        report.existing += snapshot.volumes.len() - created.len();
        for (vlm_nr, data) in created {
            report.created.insert((key.clone(), vlm_nr), data);
        }
    }
    info!(created = report.created.len(), existing = report.existing, "snapshot synthesis");
    Ok(report)
}
