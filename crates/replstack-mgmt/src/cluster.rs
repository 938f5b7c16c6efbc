//! Serde description of a cluster, loaded from TOML or JSON.

use anyhow::Context;
use replstack_layer::{
    ClusterModel, DeviceLayerKind, EngineConfig, Props, ProviderKind, Resource,
    ResourceDefinition, ResourceFlags, ResourceKey, Snapshot, SnapshotKey, SnapshotVolume,
    StoragePool, TransportType, Volume, VolumeDefinition,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// A storage pool on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Node holding the pool.
    pub node: String,
    /// Pool name, unique per node.
    pub name: String,
    /// Storage provider backing the pool.
    pub kind: ProviderKind,
    /// Overrides the kind's replication capability.
    #[serde(default)]
    pub supports_replication: Option<bool>,
    /// Pool properties.
    #[serde(default)]
    pub props: Props,
    /// Pending driver error, reported by the reconciler as a storage fault.
    #[serde(default)]
    pub driver_fault: Option<String>,
}

/// A volume of a resource definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDefinitionSpec {
    /// Volume number.
    pub nr: u32,
    /// Usable size in KiB.
    pub size_kib: u64,
    /// Adds the encryption layer.
    #[serde(default)]
    pub encrypted: bool,
    /// Encryption key; only read when `encrypted` is set.
    #[serde(default)]
    pub crypt_key: Option<String>,
    /// Fixed minor number; allocated from the pool when absent.
    #[serde(default)]
    pub minor: Option<u32>,
    /// Volume definition properties.
    #[serde(default)]
    pub props: Props,
}

/// A resource definition and its volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinitionSpec {
    /// Resource name.
    pub name: String,
    /// Replication TCP port.
    pub port: u16,
    /// Replication transport.
    #[serde(default)]
    pub transport: TransportType,
    /// Shared replication secret; generated when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// Definition properties.
    #[serde(default)]
    pub props: Props,
    /// Volume definitions.
    #[serde(default)]
    pub volumes: Vec<VolumeDefinitionSpec>,
}

/// A volume of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume number.
    pub nr: u32,
    /// Storage pool on the resource's node.
    pub pool: String,
    /// Marks the volume for deletion.
    #[serde(default)]
    pub deleted: bool,
}

/// Reference to another resource on the same cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Node of the referenced resource.
    pub node: String,
    /// Name of the referenced resource.
    pub name: String,
    /// Layer kind of a typed resource, absent for a default resource.
    #[serde(default)]
    pub layer: Option<DeviceLayerKind>,
}

impl ResourceRef {
    /// Model key of the referenced resource.
    pub fn key(&self) -> ResourceKey {
        let key = ResourceKey::new(self.node.clone(), self.name.clone());
        match self.layer {
            Some(kind) => key.typed(kind),
            None => key,
        }
    }
}

/// A resource placed on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Node holding the resource.
    pub node: String,
    /// Resource definition name.
    pub name: String,
    /// Layer kind of a typed resource.
    #[serde(default)]
    pub layer: Option<DeviceLayerKind>,
    /// Assigned by order of appearance per resource definition when absent.
    #[serde(default)]
    pub node_id: Option<u16>,
    /// Delete and diskless flags.
    #[serde(default)]
    pub flags: ResourceFlags,
    /// Parent of a typed resource.
    #[serde(default)]
    pub parent: Option<ResourceRef>,
    /// Volumes of the resource.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    /// Resource properties.
    #[serde(default)]
    pub props: Props,
}

impl ResourceSpec {
    /// Model key of the resource.
    pub fn key(&self) -> ResourceKey {
        ResourceRef {
            node: self.node.clone(),
            name: self.name.clone(),
            layer: self.layer,
        }
        .key()
    }
}

/// A volume of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotVolumeSpec {
    /// Volume number.
    pub nr: u32,
    /// Storage pool holding the snapshot volume.
    pub pool: String,
}

/// A snapshot of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSpec {
    /// Node holding the snapshot.
    pub node: String,
    /// Snapshotted resource.
    pub resource: String,
    /// Snapshot name.
    pub name: String,
    /// Snapshot volumes.
    #[serde(default)]
    pub volumes: Vec<SnapshotVolumeSpec>,
}

/// Full cluster description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Storage pools.
    pub pools: Vec<PoolSpec>,
    /// Resource definitions.
    pub resource_definitions: Vec<ResourceDefinitionSpec>,
    /// Resources, default and typed.
    pub resources: Vec<ResourceSpec>,
    /// Snapshots.
    pub snapshots: Vec<SnapshotSpec>,
}

impl ClusterSpec {
    /// Loads a cluster description; the format follows the file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading cluster file {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let spec: ClusterSpec = toml::from_str(&contents)?;
                Ok(spec)
            }
            "json" => {
                let spec: ClusterSpec = serde_json::from_str(&contents)?;
                Ok(spec)
            }
            _ => anyhow::bail!("Unsupported cluster file extension: {}", ext),
        }
    }

    /// Node ids of resources that do not name one: typed resources share
    /// the id of their default resource, default resources are numbered per
    /// definition in order of appearance.
    fn node_ids(&self) -> anyhow::Result<BTreeMap<(String, String), u16>> {
        let mut ids: BTreeMap<(String, String), u16> = BTreeMap::new();
        for rsc in &self.resources {
            if let Some(id) = rsc.node_id {
                ids.entry((rsc.name.clone(), rsc.node.clone())).or_insert(id);
            }
        }
        for rsc in &self.resources {
            let slot = (rsc.name.clone(), rsc.node.clone());
            if ids.contains_key(&slot) {
                continue;
            }
            let highest = ids
                .iter()
                .filter(|((name, _), _)| name == &rsc.name)
                .map(|(_, id)| *id)
                .max();
            let next = match highest {
                Some(id) => id.checked_add(1).with_context(|| {
                    format!("no node id left for resource {} on node {}", rsc.name, rsc.node)
                })?,
                None => 0,
            };
            ids.insert(slot, next);
        }
        Ok(ids)
    }

    /// Builds the cluster model.
    pub fn build(&self, config: &EngineConfig) -> anyhow::Result<ClusterModel> {
        let mut model = ClusterModel::new(config.clone())?;

        for pool in &self.pools {
            let mut stor_pool = StoragePool::new(pool.node.clone(), pool.name.clone(), pool.kind)
                .with_props(pool.props.clone());
            if let Some(supported) = pool.supports_replication {
                stor_pool = stor_pool.with_replication_support(supported);
            }
            stor_pool.driver_fault = pool.driver_fault.clone();
            model.add_storage_pool(stor_pool)?;
        }

        for dfn in &self.resource_definitions {
            let mut rsc_dfn = ResourceDefinition::new(dfn.name.clone(), dfn.port)
                .with_transport(dfn.transport)
                .with_props(dfn.props.clone());
            if let Some(secret) = &dfn.secret {
                rsc_dfn = rsc_dfn.with_secret(secret.clone());
            }
            for vlm in &dfn.volumes {
                let mut vlm_dfn =
                    VolumeDefinition::new(vlm.nr, vlm.size_kib).with_props(vlm.props.clone());
                if vlm.encrypted {
                    let key = vlm.crypt_key.clone().map(String::into_bytes);
                    vlm_dfn = vlm_dfn.with_encryption(key);
                }
                if let Some(minor) = vlm.minor {
                    vlm_dfn = vlm_dfn.with_minor(minor);
                }
                rsc_dfn = rsc_dfn.with_volume_definition(vlm_dfn);
            }
            model.add_resource_definition(rsc_dfn)?;
        }

        let node_ids = self.node_ids()?;
        for spec in &self.resources {
            let node_id = node_ids
                .get(&(spec.name.clone(), spec.node.clone()))
                .copied()
                .unwrap_or_default();
            let mut rsc = Resource::new(spec.key(), node_id)
                .with_flags(spec.flags)
                .with_props(spec.props.clone());
            if let Some(parent) = &spec.parent {
                rsc = rsc.with_parent(parent.key());
            }
            for vlm in &spec.volumes {
                let volume = Volume::new(vlm.nr, vlm.pool.clone());
                rsc = rsc.with_volume(if vlm.deleted { volume.deleted() } else { volume });
            }
            model.add_resource(rsc)?;
        }

        for snap in &self.snapshots {
            let key = SnapshotKey::new(snap.node.clone(), snap.resource.clone(), snap.name.clone());
            let mut snapshot = Snapshot::new(key);
            for vlm in &snap.volumes {
                snapshot = snapshot.with_volume(SnapshotVolume::new(vlm.nr, vlm.pool.clone()));
            }
            model.add_snapshot(snapshot)?;
        }

        debug!(
            pools = self.pools.len(),
            resource_definitions = self.resource_definitions.len(),
            resources = self.resources.len(),
            snapshots = self.snapshots.len(),
            "built cluster model"
        );
        Ok(model)
    }
}
