//! Flat persisted-record projection of built stacks and snapshot layer data.
//!
//! Records are keyed by `(node, resource name, snapshot name, volume number,
//! layer resource id, parent layer resource id)`; fields that do not apply
//! to a family are `None`.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::layer_data::{RscLayerData, RscLayerObject, SnapshotVlmData, StorageVlmData};
use crate::model::Snapshot;
use crate::types::{
    DeviceLayerKind, LayerRscId, NodeName, ProviderKind, ResourceName, SnapshotName, VolumeNumber,
};

/// Record family, one table per family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordFamily {
    /// Id, kind and parent of every layer object.
    LayerResourceId,
    /// Shared replication parameters of a resource definition.
    DrbdResourceDefinition,
    /// Shared minor number of a volume definition.
    DrbdVolumeDefinition,
    /// Per-replica replication parameters.
    DrbdResource,
    /// Per-replica replication volume.
    DrbdVolume,
    /// Encrypted volume.
    LuksVolume,
    /// Backing volume of a resource or snapshot.
    StorageVolume,
}

/// Primary key of a persisted record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LayerRecordKey {
    /// Node of the replica; `None` for definition records.
    pub node: Option<NodeName>,
    /// Resource definition name.
    pub rsc_name: ResourceName,
    /// Set on snapshot records only.
    pub snap_name: Option<SnapshotName>,
    /// Set on per-volume records.
    pub vlm_nr: Option<VolumeNumber>,
    /// Layer object the record belongs to.
    pub layer_rsc_id: Option<LayerRscId>,
    /// Parent of that layer object.
    pub parent_layer_rsc_id: Option<LayerRscId>,
}

impl LayerRecordKey {
    fn definition(rsc_name: &ResourceName, vlm_nr: Option<VolumeNumber>) -> Self {
        Self {
            node: None,
            rsc_name: rsc_name.clone(),
            snap_name: None,
            vlm_nr,
            layer_rsc_id: None,
            parent_layer_rsc_id: None,
        }
    }

    fn layer(obj: &RscLayerObject, vlm_nr: Option<VolumeNumber>) -> Self {
        Self {
            node: Some(obj.rsc.node.clone()),
            rsc_name: obj.rsc.name.clone(),
            snap_name: None,
            vlm_nr,
            layer_rsc_id: Some(obj.id),
            parent_layer_rsc_id: obj.parent_id,
        }
    }
}

/// One persisted row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LayerRecord {
    /// Table the row belongs to.
    pub family: RecordFamily,
    /// Primary key.
    pub key: LayerRecordKey,
    /// Column values, rendered as strings.
    pub fields: BTreeMap<&'static str, String>,
}

impl LayerRecord {
    fn new(family: RecordFamily, key: LayerRecordKey) -> Self {
        Self {
            family,
            key,
            fields: BTreeMap::new(),
        }
    }

    fn field(mut self, name: &'static str, value: impl ToString) -> Self {
        self.fields.insert(name, value.to_string());
        self
    }
}

fn storage_fields(record: LayerRecord, data: &StorageVlmData) -> LayerRecord {
    let record = record.field("provider", data.provider_kind());
    match data {
        StorageVlmData::DrbdDiskless {
            usable_size_kib, ..
        } => record.field("usable_size_kib", usable_size_kib),
        StorageVlmData::Lvm {
            volume_group,
            identifier,
            ..
        } => record.field("volume_group", volume_group).field("identifier", identifier),
        StorageVlmData::LvmThin {
            volume_group,
            thin_pool,
            identifier,
            ..
        } => record
            .field("volume_group", volume_group)
            .field("thin_pool", thin_pool)
            .field("identifier", identifier),
        StorageVlmData::Zfs {
            zpool, identifier, ..
        } => record.field("zpool", zpool).field("identifier", identifier),
        StorageVlmData::SwordfishInitiator { dfn, .. }
        | StorageVlmData::SwordfishTarget { dfn, .. } => match &dfn.vlm_odata {
            Some(odata) => record.field("vlm_odata", odata),
            None => record,
        },
    }
}

/// Flattens a stack. Definition records appear once per stack.
pub fn records_of(stack: &RscLayerObject) -> Vec<LayerRecord> {
    let mut records = Vec::new();
    let mut seen_dfns = BTreeSet::new();

    for obj in stack.iter() {
        records.push(
            LayerRecord::new(RecordFamily::LayerResourceId, LayerRecordKey::layer(obj, None))
                .field("kind", obj.kind())
                .field("suffix", &obj.rsc_name_suffix),
        );

        match &obj.data {
            RscLayerData::Drbd(drbd) => {
                let dfn_key = LayerRecordKey::definition(&drbd.dfn.rsc_name, None);
                if seen_dfns.insert(dfn_key.clone()) {
                    records.push(
                        LayerRecord::new(RecordFamily::DrbdResourceDefinition, dfn_key)
                            .field("port", drbd.dfn.port)
                            .field("transport", drbd.dfn.transport)
                            .field("peer_slots", drbd.dfn.peer_slots)
                            .field("al_stripes", drbd.dfn.al_stripes)
                            .field("al_stripe_size_kib", drbd.dfn.al_stripe_size_kib),
                    );
                }
                records.push(
                    LayerRecord::new(RecordFamily::DrbdResource, LayerRecordKey::layer(obj, None))
                        .field("node_id", drbd.node_id)
                        .field("peer_slots", drbd.peer_slots)
                        .field("al_stripes", drbd.al_stripes)
                        .field("al_stripe_size_kib", drbd.al_stripe_size_kib)
                        .field("diskless", drbd.diskless),
                );
                for (vlm_nr, vlm) in &drbd.volumes {
                    let vlm_dfn_key = LayerRecordKey::definition(&vlm.dfn.rsc_name, Some(*vlm_nr));
                    if seen_dfns.insert(vlm_dfn_key.clone()) {
                        records.push(
                            LayerRecord::new(RecordFamily::DrbdVolumeDefinition, vlm_dfn_key)
                                .field("minor", vlm.dfn.minor)
                                .field("peer_slots", vlm.dfn.peer_slots),
                        );
                    }
                    records.push(LayerRecord::new(
                        RecordFamily::DrbdVolume,
                        LayerRecordKey::layer(obj, Some(*vlm_nr)),
                    ));
                }
            }
            RscLayerData::Luks(luks) => {
                for (vlm_nr, vlm) in &luks.volumes {
                    let key = LayerRecordKey::layer(obj, Some(*vlm_nr));
                    let record = LayerRecord::new(RecordFamily::LuksVolume, key);
                    records.push(record.field("has_key", vlm.has_key()));
                }
            }
            RscLayerData::Storage(storage) => {
                for (vlm_nr, vlm) in &storage.volumes {
                    let key = LayerRecordKey::layer(obj, Some(*vlm_nr));
                    let record = LayerRecord::new(RecordFamily::StorageVolume, key);
                    records.push(storage_fields(record, vlm));
                }
            }
        }
    }
    records
}

/// Storage volume records of the synthesized snapshot volumes of `snapshot`.
pub fn snapshot_records(snapshot: &Snapshot) -> Vec<LayerRecord> {
    snapshot
        .volumes
        .values()
        .filter_map(|vlm| vlm.layer_data().map(|data| (vlm.vlm_nr, data)))
        .map(|(vlm_nr, data)| {
            let key = LayerRecordKey {
                node: Some(snapshot.key.node.clone()),
                rsc_name: snapshot.key.rsc_name.clone(),
                snap_name: Some(snapshot.key.snap_name.clone()),
                vlm_nr: Some(vlm_nr),
                layer_rsc_id: None,
                parent_layer_rsc_id: None,
            };
            let record = LayerRecord::new(RecordFamily::StorageVolume, key);
            match &*data {
                SnapshotVlmData::LvmThin {
                    volume_group,
                    thin_pool,
                    identifier,
                } => record
                    .field("provider", ProviderKind::LvmThin)
                    .field("volume_group", volume_group)
                    .field("thin_pool", thin_pool)
                    .field("identifier", identifier),
                SnapshotVlmData::Zfs { zpool, identifier, kind } => record
                    .field("provider", kind)
                    .field("zpool", zpool)
                    .field("identifier", identifier),
            }
        })
        .collect()
}

/// Number of records per family.
pub fn family_counts(records: &[LayerRecord]) -> BTreeMap<RecordFamily, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.family).or_insert(0) += 1;
    }
    counts
}

/// Layer kinds present in a record set, from the id records.
pub fn layer_kinds(records: &[LayerRecord]) -> Vec<DeviceLayerKind> {
    let mut kinds = Vec::new();
    for record in records.iter().filter(|r| r.family == RecordFamily::LayerResourceId) {
        let Some(name) = record.fields.get("kind") else {
            continue;
        };
        let kind = DeviceLayerKind::TOP_DOWN
            .into_iter()
            .find(|kind| kind.as_str() == name.as_str());
        kinds.extend(kind);
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessContext;
    use crate::config::EngineConfig;
    use crate::model::{
        ClusterModel, Resource, ResourceDefinition, StoragePool, Volume, VolumeDefinition,
    };
    use crate::stack::StackBuilder;
    use crate::types::{ProviderKind, ResourceKey};

    #[test]
    fn test_records_of_drbd_storage_stack() {
        let mut model = ClusterModel::new(EngineConfig::default()).unwrap();
        model.add_storage_pool(StoragePool::new("n1", "lvm0", ProviderKind::Lvm)).unwrap();
        model
            .add_resource_definition(
                ResourceDefinition::new("data1", 7000)
                    .with_volume_definition(VolumeDefinition::new(0, 1024))
                    .with_volume_definition(VolumeDefinition::new(1, 1024)),
            )
            .unwrap();
        let key = ResourceKey::new("n1", "data1");
        model
            .add_resource(
                Resource::new(key.clone(), 0)
                    .with_volume(Volume::new(0, "lvm0"))
                    .with_volume(Volume::new(1, "lvm0")),
            )
            .unwrap();

        let stack = StackBuilder::new()
            .build(&model, &AccessContext::system(), &key)
            .unwrap();
        let records = records_of(&stack);
        let counts = family_counts(&records);

        assert_eq!(counts[&RecordFamily::LayerResourceId], 2);
        assert_eq!(counts[&RecordFamily::DrbdResourceDefinition], 1);
        assert_eq!(counts[&RecordFamily::DrbdVolumeDefinition], 2);
        assert_eq!(counts[&RecordFamily::DrbdResource], 1);
        assert_eq!(counts[&RecordFamily::DrbdVolume], 2);
        assert_eq!(counts[&RecordFamily::StorageVolume], 2);
        assert!(!counts.contains_key(&RecordFamily::LuksVolume));
        assert_eq!(layer_kinds(&records), vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);

        let storage = records
            .iter()
            .find(|r| r.family == RecordFamily::StorageVolume)
            .unwrap();
        assert_eq!(storage.key.parent_layer_rsc_id, Some(stack.id));
        assert_eq!(storage.fields["identifier"], "data1_00000");

        let dfn = records
            .iter()
            .find(|r| r.family == RecordFamily::DrbdResourceDefinition)
            .unwrap();
        assert!(dfn.key.node.is_none());
        assert!(dfn.key.layer_rsc_id.is_none());
        assert_eq!(dfn.fields["port"], "7000");
        assert_eq!(dfn.fields["transport"], "IP");
        assert!(!dfn.fields.contains_key("secret"));
    }
}
