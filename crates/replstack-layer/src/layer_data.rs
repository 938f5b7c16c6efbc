//! Layer objects and the per-layer records they carry.
//!
//! A built stack is a tree of [`RscLayerObject`]s rooted at the topmost
//! present layer. Each object owns its children by value; records shared with
//! other stacks (definition records, reused volume records) are held in `Arc`s.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{
    DeviceLayerKind, LayerRscId, MinorNumber, NodeId, ProviderKind, ResourceKey, ResourceName,
    TcpPort, TransportType, VolumeNumber,
};

/// Replication settings shared by every resource of one resource definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrbdRscDfnData {
    /// Owning resource definition.
    pub rsc_name: ResourceName,
    /// TCP port of the replication link.
    pub port: TcpPort,
    /// Replication transport.
    pub transport: TransportType,
    /// Shared peer authentication secret.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Peer slots at the time the record was created.
    pub peer_slots: u16,
    /// Activity log stripe count.
    pub al_stripes: u32,
    /// Activity log stripe size in KiB.
    pub al_stripe_size_kib: u64,
}

/// Replication settings shared by every volume of one volume definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrbdVlmDfnData {
    /// Owning resource definition.
    pub rsc_name: ResourceName,
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// Device minor, identical on every node.
    pub minor: MinorNumber,
    /// Peer slots used for the metadata size.
    pub peer_slots: u16,
}

/// Replication data of one resource on one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrbdRscData {
    /// Definition record shared with every replica.
    pub dfn: Arc<DrbdRscDfnData>,
    /// Replica's node id within the resource.
    pub node_id: NodeId,
    /// Peer slots applied to this replica.
    pub peer_slots: u16,
    /// Activity log stripe count.
    pub al_stripes: u32,
    /// Activity log stripe size in KiB.
    pub al_stripe_size_kib: u64,
    /// Set when the replica has no local backing storage.
    pub diskless: bool,
    /// Per-volume data.
    pub volumes: BTreeMap<VolumeNumber, Arc<DrbdVlmData>>,
}

/// Replication data of one volume on one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrbdVlmData {
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// Definition record shared with every replica.
    pub dfn: Arc<DrbdVlmDfnData>,
}

/// Encryption key material. Wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CryptKey(Vec<u8>);

impl CryptKey {
    /// Wraps raw key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        CryptKey(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for an empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptKey([REDACTED; {}])", self.0.len())
    }
}

/// Encryption data of one resource on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LuksRscData {
    /// Per-volume data.
    pub volumes: BTreeMap<VolumeNumber, Arc<LuksVlmData>>,
}

/// Encryption data of one volume. Every volume of a resource holds the same key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LuksVlmData {
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// `None` when no key was available at composition time.
    #[serde(skip_serializing)]
    pub key: Option<Arc<CryptKey>>,
}

impl LuksVlmData {
    /// Whether key material is attached.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }
}

/// Remote descriptor of one disaggregated volume definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SfVlmDfnData {
    /// Owning resource definition.
    pub rsc_name: ResourceName,
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// Opaque remote volume locator, set once the target exists.
    pub vlm_odata: Option<String>,
}

/// Storage data of one resource on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageRscData {
    /// Per-volume data.
    pub volumes: BTreeMap<VolumeNumber, Arc<StorageVlmData>>,
}

/// Provider-specific storage data of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "provider", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageVlmData {
    /// No backing device; the replication layer serves the data remotely.
    DrbdDiskless {
        /// Volume slot.
        vlm_nr: VolumeNumber,
        /// Size reported to the replication layer.
        usable_size_kib: u64,
    },
    /// Thick logical volume.
    Lvm {
        /// Volume slot.
        vlm_nr: VolumeNumber,
        /// Volume group holding the volume.
        volume_group: String,
        /// Logical volume name.
        identifier: String,
    },
    /// Thin logical volume.
    LvmThin {
        /// Volume slot.
        vlm_nr: VolumeNumber,
        /// Volume group holding the thin pool.
        volume_group: String,
        /// Thin pool holding the volume.
        thin_pool: String,
        /// Logical volume name.
        identifier: String,
    },
    /// ZFS and ZFS-thin, distinguished by `kind`.
    Zfs {
        /// Volume slot.
        vlm_nr: VolumeNumber,
        /// Pool holding the volume.
        zpool: String,
        /// Zvol name within the pool.
        identifier: String,
        /// `Zfs` or `ZfsThin`.
        kind: ProviderKind,
    },
    /// Node attaching a remote volume.
    SwordfishInitiator {
        /// Volume slot.
        vlm_nr: VolumeNumber,
        /// Remote descriptor shared with the target.
        dfn: Arc<SfVlmDfnData>,
    },
    /// Node exporting a remote volume.
    SwordfishTarget {
        /// Volume slot.
        vlm_nr: VolumeNumber,
        /// Remote descriptor shared with the initiators.
        dfn: Arc<SfVlmDfnData>,
    },
}

impl StorageVlmData {
    /// Volume slot of the data.
    pub fn vlm_nr(&self) -> VolumeNumber {
        match self {
            StorageVlmData::DrbdDiskless { vlm_nr, .. }
            | StorageVlmData::Lvm { vlm_nr, .. }
            | StorageVlmData::LvmThin { vlm_nr, .. }
            | StorageVlmData::Zfs { vlm_nr, .. }
            | StorageVlmData::SwordfishInitiator { vlm_nr, .. }
            | StorageVlmData::SwordfishTarget { vlm_nr, .. } => *vlm_nr,
        }
    }

    /// Provider that produced the data.
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            StorageVlmData::DrbdDiskless { .. } => ProviderKind::DrbdDiskless,
            StorageVlmData::Lvm { .. } => ProviderKind::Lvm,
            StorageVlmData::LvmThin { .. } => ProviderKind::LvmThin,
            StorageVlmData::Zfs { kind, .. } => *kind,
            StorageVlmData::SwordfishInitiator { .. } => ProviderKind::SwordfishInitiator,
            StorageVlmData::SwordfishTarget { .. } => ProviderKind::SwordfishTarget,
        }
    }

    /// Remote descriptor of disaggregated volumes.
    pub fn sf_dfn(&self) -> Option<&Arc<SfVlmDfnData>> {
        match self {
            StorageVlmData::SwordfishInitiator { dfn, .. }
            | StorageVlmData::SwordfishTarget { dfn, .. } => Some(dfn),
            _ => None,
        }
    }
}

/// Layer data of one snapshot volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "provider", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotVlmData {
    /// Thin snapshot volume.
    LvmThin {
        /// Volume group of the source volume.
        volume_group: String,
        /// Thin pool of the source volume.
        thin_pool: String,
        /// Source volume name.
        identifier: String,
    },
    /// ZFS snapshot of a zvol.
    Zfs {
        /// Pool of the source zvol.
        zpool: String,
        /// Source zvol name.
        identifier: String,
        /// `Zfs` or `ZfsThin`.
        kind: ProviderKind,
    },
}

impl SnapshotVlmData {
    /// Name of the physical object backing the snapshot volume.
    pub fn identifier(&self) -> &str {
        match self {
            SnapshotVlmData::LvmThin { identifier, .. }
            | SnapshotVlmData::Zfs { identifier, .. } => identifier,
        }
    }
}

/// Kind-specific payload of a layer object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layer", rename_all = "UPPERCASE")]
pub enum RscLayerData {
    /// Replication layer.
    Drbd(DrbdRscData),
    /// Encryption layer.
    Luks(LuksRscData),
    /// Storage layer.
    Storage(StorageRscData),
}

impl RscLayerData {
    /// Layer kind of the payload.
    pub fn kind(&self) -> DeviceLayerKind {
        match self {
            RscLayerData::Drbd(_) => DeviceLayerKind::Drbd,
            RscLayerData::Luks(_) => DeviceLayerKind::Luks,
            RscLayerData::Storage(_) => DeviceLayerKind::Storage,
        }
    }

    /// Volume numbers this layer holds per-volume data for.
    pub fn volume_numbers(&self) -> Vec<VolumeNumber> {
        match self {
            RscLayerData::Drbd(data) => data.volumes.keys().copied().collect(),
            RscLayerData::Luks(data) => data.volumes.keys().copied().collect(),
            RscLayerData::Storage(data) => data.volumes.keys().copied().collect(),
        }
    }
}

/// One layer of one resource's stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RscLayerObject {
    /// Layer resource id, unique across the cluster.
    pub id: LayerRscId,
    /// Resource the object belongs to.
    pub rsc: ResourceKey,
    /// Suffix appended to the resource name for this layer's devices.
    pub rsc_name_suffix: String,
    /// Id of the layer above; `None` for the root and for peer objects.
    pub parent_id: Option<LayerRscId>,
    /// At most one entry; the next lower layer.
    pub children: Vec<RscLayerObject>,
    /// Kind-specific payload.
    pub data: RscLayerData,
}

impl RscLayerObject {
    /// Creates an object without children and with an empty name suffix.
    pub fn new(
        id: LayerRscId,
        rsc: ResourceKey,
        parent_id: Option<LayerRscId>,
        data: RscLayerData,
    ) -> Self {
        Self {
            id,
            rsc,
            rsc_name_suffix: String::new(),
            parent_id,
            children: Vec::new(),
            data,
        }
    }

    /// Layer kind of this object.
    pub fn kind(&self) -> DeviceLayerKind {
        self.data.kind()
    }

    /// The next lower layer, if any.
    pub fn child(&self) -> Option<&RscLayerObject> {
        self.children.first()
    }

    /// Finds the layer of `kind` in this object's subtree.
    pub fn find(&self, kind: DeviceLayerKind) -> Option<&RscLayerObject> {
        self.iter().find(|obj| obj.kind() == kind)
    }

    /// Layer kinds of this stack from top to bottom.
    pub fn layer_kinds(&self) -> Vec<DeviceLayerKind> {
        self.iter().map(RscLayerObject::kind).collect()
    }

    /// Layer ids of this stack from top to bottom.
    pub fn layer_ids(&self) -> Vec<LayerRscId> {
        self.iter().map(|obj| obj.id).collect()
    }

    /// Iterates over the stack from this object downwards.
    pub fn iter(&self) -> impl Iterator<Item = &RscLayerObject> {
        std::iter::successors(Some(self), |obj| obj.child())
    }

    /// Replication payload, if this is a replication object.
    pub fn drbd(&self) -> Option<&DrbdRscData> {
        match &self.data {
            RscLayerData::Drbd(data) => Some(data),
            _ => None,
        }
    }

    /// Encryption payload, if this is an encryption object.
    pub fn luks(&self) -> Option<&LuksRscData> {
        match &self.data {
            RscLayerData::Luks(data) => Some(data),
            _ => None,
        }
    }

    /// Storage payload, if this is a storage object.
    pub fn storage(&self) -> Option<&StorageRscData> {
        match &self.data {
            RscLayerData::Storage(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_obj(id: u32, parent: Option<u32>) -> RscLayerObject {
        let mut data = StorageRscData::default();
        data.volumes.insert(
            VolumeNumber::new(0),
            Arc::new(StorageVlmData::Lvm {
                vlm_nr: VolumeNumber::new(0),
                volume_group: "vg0".to_string(),
                identifier: "data1_00000".to_string(),
            }),
        );
        RscLayerObject::new(
            LayerRscId::new(id),
            ResourceKey::new("n1", "data1"),
            parent.map(LayerRscId::new),
            RscLayerData::Storage(data),
        )
    }

    #[test]
    fn test_find_and_layer_kinds() {
        let mut luks = RscLayerObject::new(
            LayerRscId::new(1),
            ResourceKey::new("n1", "data1"),
            None,
            RscLayerData::Luks(LuksRscData::default()),
        );
        luks.children.push(storage_obj(2, Some(1)));

        assert_eq!(
            luks.layer_kinds(),
            vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage]
        );
        assert_eq!(luks.layer_ids(), vec![LayerRscId::new(1), LayerRscId::new(2)]);
        let storage = luks.find(DeviceLayerKind::Storage).unwrap();
        assert_eq!(storage.parent_id, Some(LayerRscId::new(1)));
        assert!(luks.find(DeviceLayerKind::Drbd).is_none());
    }

    #[test]
    fn test_storage_vlm_accessors() {
        let dfn = Arc::new(SfVlmDfnData {
            rsc_name: ResourceName::new("data1"),
            vlm_nr: VolumeNumber::new(3),
            vlm_odata: Some("/redfish/v1/Volumes/7".to_string()),
        });
        let data = StorageVlmData::SwordfishTarget {
            vlm_nr: VolumeNumber::new(3),
            dfn: Arc::clone(&dfn),
        };
        assert_eq!(data.vlm_nr(), VolumeNumber::new(3));
        assert_eq!(data.provider_kind(), ProviderKind::SwordfishTarget);
        assert!(Arc::ptr_eq(data.sf_dfn().unwrap(), &dfn));
    }

    #[test]
    fn test_crypt_key_debug_redacted() {
        let key = CryptKey::new(b"hunter2".to_vec());
        let printed = format!("{:?}", key);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_serialize_hides_secrets() {
        let dfn = DrbdRscDfnData {
            rsc_name: ResourceName::new("data1"),
            port: TcpPort::new(7000),
            transport: TransportType::Ip,
            secret: "s3cr3t".to_string(),
            peer_slots: 7,
            al_stripes: 1,
            al_stripe_size_kib: 32,
        };
        let json = serde_json::to_string(&dfn).unwrap();
        assert!(!json.contains("s3cr3t"));
        assert!(json.contains("\"port\":7000"));

        let luks = LuksVlmData {
            vlm_nr: VolumeNumber::new(0),
            key: Some(Arc::new(CryptKey::new(b"k".to_vec()))),
        };
        let json = serde_json::to_string(&luks).unwrap();
        assert!(!json.contains("key"));
    }

    #[test]
    fn test_storage_vlm_serialize_tag() {
        let data = StorageVlmData::DrbdDiskless {
            vlm_nr: VolumeNumber::new(0),
            usable_size_kib: 1024,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["provider"], "DRBD_DISKLESS");
    }
}
