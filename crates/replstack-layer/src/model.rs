//! In-memory cluster model the engine composes over.
//!
//! [`ClusterModel`] owns every entity in maps keyed by identity. Relations
//! between entities are expressed through keys, never through references, so
//! the graph can be walked in any direction without reference cycles.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::access::{AccessContext, AccessType, ObjectProtection};
use crate::config::EngineConfig;
use crate::error::{LayerError, LayerResult};
use crate::factory::LayerDataFactory;
use crate::layer_data::{
    DrbdRscDfnData, DrbdVlmDfnData, RscLayerObject, SfVlmDfnData, SnapshotVlmData,
};
use crate::props::Props;
use crate::shared::SharedRecord;
use crate::types::{
    LayerRscId, MinorNumber, NodeId, NodeName, ProviderKind, ResourceFlags, ResourceKey,
    ResourceName, SnapshotKey, TcpPort, TransportType, VolumeFlags, VolumeKey, VolumeNumber,
};

/// Node-local capacity source.
#[derive(Debug)]
pub struct StoragePool {
    /// Pool name, unique per node.
    pub name: String,
    /// Node hosting the pool.
    pub node: NodeName,
    /// Provider backing the pool.
    pub kind: ProviderKind,
    /// Whether the pool's driver can host the replication layer.
    pub supports_replication: bool,
    /// Driver properties, such as volume group or zpool names.
    pub props: Props,
    /// Access control of the pool.
    pub protection: ObjectProtection,
    /// Error last reported by the pool's driver, if any.
    pub driver_fault: Option<String>,
}

impl StoragePool {
    /// Pool with the provider's default replication capability.
    pub fn new(node: impl Into<String>, name: impl Into<String>, kind: ProviderKind) -> Self {
        let node = NodeName::new(node);
        let name = name.into();
        let protection = ObjectProtection::new(format!("storage pool {}/{}", node, name));
        Self {
            name,
            node,
            kind,
            supports_replication: kind.supports_replication(),
            props: Props::new(),
            protection,
            driver_fault: None,
        }
    }

    /// Replaces the properties.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Overrides the provider's replication capability.
    pub fn with_replication_support(mut self, supported: bool) -> Self {
        self.supports_replication = supported;
        self
    }

    /// Replaces the access control.
    pub fn with_protection(mut self, protection: ObjectProtection) -> Self {
        self.protection = protection;
        self
    }

    /// Properties, requiring `View`.
    pub fn props(&self, ctx: &AccessContext) -> LayerResult<&Props> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(&self.props)
    }

    /// Provider kind, requiring `Use`.
    pub fn provider_kind(&self, ctx: &AccessContext) -> LayerResult<ProviderKind> {
        self.protection.require_access(ctx, AccessType::Use)?;
        Ok(self.kind)
    }

    /// Replication capability of the driver, requiring `Use`.
    pub fn driver_supports_replication(&self, ctx: &AccessContext) -> LayerResult<bool> {
        self.protection.require_access(ctx, AccessType::Use)?;
        Ok(self.supports_replication)
    }

    /// Fails with the driver's pending error, if any.
    pub fn check_driver(&self) -> LayerResult<()> {
        match &self.driver_fault {
            Some(reason) => Err(LayerError::StorageFault {
                pool: self.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// One numbered slot of a resource definition.
#[derive(Debug)]
pub struct VolumeDefinition {
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// Net size in KiB.
    pub size_kib: u64,
    /// Whether the volume is encrypted.
    pub encrypted: bool,
    /// Key material of encrypted volumes.
    pub crypt_key: Option<Vec<u8>>,
    /// Minor number assigned ahead of composition.
    pub minor: Option<MinorNumber>,
    /// Volume definition properties.
    pub props: Props,
    /// Access control of the volume definition.
    pub protection: ObjectProtection,
    pub(crate) drbd: SharedRecord<DrbdVlmDfnData>,
    pub(crate) sf: SharedRecord<SfVlmDfnData>,
}

impl VolumeDefinition {
    /// Unencrypted volume definition without a minor.
    pub fn new(vlm_nr: u32, size_kib: u64) -> Self {
        Self {
            vlm_nr: VolumeNumber::new(vlm_nr),
            size_kib,
            encrypted: false,
            crypt_key: None,
            minor: None,
            props: Props::new(),
            protection: ObjectProtection::new(format!("volume definition {}", vlm_nr)),
            drbd: SharedRecord::new(),
            sf: SharedRecord::new(),
        }
    }

    /// Flags the volume as encrypted with `key`.
    pub fn with_encryption(mut self, key: Option<Vec<u8>>) -> Self {
        self.encrypted = true;
        self.crypt_key = key;
        self
    }

    /// Pins the minor number.
    pub fn with_minor(mut self, minor: u32) -> Self {
        self.minor = Some(MinorNumber::new(minor));
        self
    }

    /// Replaces the properties.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Replaces the access control.
    pub fn with_protection(mut self, protection: ObjectProtection) -> Self {
        self.protection = protection;
        self
    }

    /// Properties, requiring `View`.
    pub fn props(&self, ctx: &AccessContext) -> LayerResult<&Props> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(&self.props)
    }

    /// Encryption flag, requiring `View`.
    pub fn is_encrypted(&self, ctx: &AccessContext) -> LayerResult<bool> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(self.encrypted)
    }

    /// Cached replication volume record.
    pub fn drbd_data(&self) -> Option<Arc<DrbdVlmDfnData>> {
        self.drbd.get()
    }

    /// Cached remote descriptor.
    pub fn sf_data(&self) -> Option<Arc<SfVlmDfnData>> {
        self.sf.get()
    }
}

/// Cluster-wide identity of a replicated volume group.
#[derive(Debug)]
pub struct ResourceDefinition {
    /// Cluster-wide resource name.
    pub name: ResourceName,
    /// TCP port of the replication link.
    pub port: TcpPort,
    /// Replication transport.
    pub transport: TransportType,
    /// Peer secret; generated when absent.
    pub secret: Option<String>,
    /// Resource definition properties.
    pub props: Props,
    /// Access control of the resource definition.
    pub protection: ObjectProtection,
    /// Volume slots by number.
    pub volume_definitions: BTreeMap<VolumeNumber, VolumeDefinition>,
    pub(crate) drbd: SharedRecord<DrbdRscDfnData>,
}

impl ResourceDefinition {
    /// Definition without volumes, using the default transport.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        let name = ResourceName::new(name);
        let protection = ObjectProtection::new(format!("resource definition {}", name));
        Self {
            name,
            port: TcpPort::new(port),
            transport: TransportType::default(),
            secret: None,
            props: Props::new(),
            protection,
            volume_definitions: BTreeMap::new(),
            drbd: SharedRecord::new(),
        }
    }

    /// Adds a volume slot.
    pub fn with_volume_definition(mut self, mut vlm_dfn: VolumeDefinition) -> Self {
        vlm_dfn
            .protection
            .set_object(format!("volume definition {}/{}", self.name, vlm_dfn.vlm_nr));
        self.volume_definitions.insert(vlm_dfn.vlm_nr, vlm_dfn);
        self
    }

    /// Sets the replication transport.
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the peer secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Replaces the properties.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Replaces the access control.
    pub fn with_protection(mut self, protection: ObjectProtection) -> Self {
        self.protection = protection;
        self
    }

    /// Properties, requiring `View`.
    pub fn props(&self, ctx: &AccessContext) -> LayerResult<&Props> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(&self.props)
    }

    /// Volume slot `vlm_nr`.
    pub fn volume_definition(&self, vlm_nr: VolumeNumber) -> LayerResult<&VolumeDefinition> {
        self.volume_definitions
            .get(&vlm_nr)
            .ok_or_else(|| LayerError::NotFound {
                what: format!("volume definition {}/{}", self.name, vlm_nr),
            })
    }

    /// Cached replication definition record.
    pub fn drbd_data(&self) -> Option<Arc<DrbdRscDfnData>> {
        self.drbd.get()
    }
}

/// One node's realization of one volume definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// Name of the backing storage pool on the resource's node.
    pub stor_pool: String,
    /// Lifecycle flags.
    pub flags: VolumeFlags,
}

impl Volume {
    /// Volume backed by `stor_pool`.
    pub fn new(vlm_nr: u32, stor_pool: impl Into<String>) -> Self {
        Self {
            vlm_nr: VolumeNumber::new(vlm_nr),
            stor_pool: stor_pool.into(),
            flags: VolumeFlags::default(),
        }
    }

    /// Marks the volume for deletion.
    pub fn deleted(mut self) -> Self {
        self.flags.delete = true;
        self
    }
}

/// One node's realization of a resource definition.
#[derive(Debug)]
pub struct Resource {
    /// Node, name and layer type.
    pub key: ResourceKey,
    /// Replica id within the resource definition.
    pub node_id: NodeId,
    /// Lifecycle flags.
    pub flags: ResourceFlags,
    /// Resource this one was split from, if any.
    pub parent: Option<ResourceKey>,
    /// Volumes by number.
    pub volumes: BTreeMap<VolumeNumber, Volume>,
    /// Resource properties; override the definition's.
    pub props: Props,
    /// Access control of the resource.
    pub protection: ObjectProtection,
    layer_stack: Mutex<Option<Arc<RscLayerObject>>>,
}

impl Resource {
    /// Resource without volumes, flags or parent.
    pub fn new(key: ResourceKey, node_id: u16) -> Self {
        let protection = ObjectProtection::new(format!("resource {}", key));
        Self {
            key,
            node_id: NodeId::new(node_id),
            flags: ResourceFlags::default(),
            parent: None,
            volumes: BTreeMap::new(),
            props: Props::new(),
            protection,
            layer_stack: Mutex::new(None),
        }
    }

    /// Adds a volume.
    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volumes.insert(volume.vlm_nr, volume);
        self
    }

    /// Replaces the flags.
    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the resource this one was split from.
    pub fn with_parent(mut self, parent: ResourceKey) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Replaces the properties.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Replaces the access control.
    pub fn with_protection(mut self, protection: ObjectProtection) -> Self {
        self.protection = protection;
        self
    }

    /// Properties, requiring `View`.
    pub fn props(&self, ctx: &AccessContext) -> LayerResult<&Props> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(&self.props)
    }

    /// Flags, requiring `View`.
    pub fn flags(&self, ctx: &AccessContext) -> LayerResult<ResourceFlags> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(self.flags)
    }

    /// Whether the resource is marked for deletion.
    pub fn is_deleted(&self, ctx: &AccessContext) -> LayerResult<bool> {
        Ok(self.flags(ctx)?.delete)
    }

    /// Flags of volume `vlm_nr`, requiring `View`.
    pub fn volume_flags(
        &self,
        ctx: &AccessContext,
        vlm_nr: VolumeNumber,
    ) -> LayerResult<VolumeFlags> {
        self.protection.require_access(ctx, AccessType::View)?;
        self.volumes
            .get(&vlm_nr)
            .map(|vlm| vlm.flags)
            .ok_or_else(|| LayerError::NotFound {
                what: format!("volume {}/{}", self.key, vlm_nr),
            })
    }

    /// The currently attached layer stack.
    pub fn layer_stack(&self) -> Option<Arc<RscLayerObject>> {
        self.layer_stack.lock().clone()
    }

    /// Replaces the attached layer stack, requiring `Change`.
    pub fn attach_layer_stack(
        &self,
        ctx: &AccessContext,
        stack: Arc<RscLayerObject>,
    ) -> LayerResult<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        *self.layer_stack.lock() = Some(stack);
        Ok(())
    }

    pub(crate) fn detach_layer_stack(&self) -> Option<Arc<RscLayerObject>> {
        self.layer_stack.lock().take()
    }
}

/// One volume of a snapshot.
#[derive(Debug)]
pub struct SnapshotVolume {
    /// Volume slot.
    pub vlm_nr: VolumeNumber,
    /// Pool holding the snapshot volume.
    pub stor_pool: String,
    pub(crate) layer_data: SharedRecord<SnapshotVlmData>,
}

impl SnapshotVolume {
    /// Snapshot volume on `stor_pool`.
    pub fn new(vlm_nr: u32, stor_pool: impl Into<String>) -> Self {
        Self {
            vlm_nr: VolumeNumber::new(vlm_nr),
            stor_pool: stor_pool.into(),
            layer_data: SharedRecord::new(),
        }
    }

    /// Synthesized layer data, once present.
    pub fn layer_data(&self) -> Option<Arc<SnapshotVlmData>> {
        self.layer_data.get()
    }
}

/// Point-in-time copy of one resource.
#[derive(Debug)]
pub struct Snapshot {
    /// Node, resource and snapshot name.
    pub key: SnapshotKey,
    /// Snapshot volumes by number.
    pub volumes: BTreeMap<VolumeNumber, SnapshotVolume>,
    /// Access control of the snapshot.
    pub protection: ObjectProtection,
}

impl Snapshot {
    /// Snapshot without volumes.
    pub fn new(key: SnapshotKey) -> Self {
        let protection = ObjectProtection::new(format!("snapshot {}", key));
        Self {
            key,
            volumes: BTreeMap::new(),
            protection,
        }
    }

    /// Adds a snapshot volume.
    pub fn with_volume(mut self, volume: SnapshotVolume) -> Self {
        self.volumes.insert(volume.vlm_nr, volume);
        self
    }
}

/// Resources and volumes selected for physical removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RemovalPlan {
    /// Resources to remove.
    pub resources: BTreeSet<ResourceKey>,
    /// Volumes to remove from resources that stay.
    pub volumes: BTreeSet<VolumeKey>,
}

impl RemovalPlan {
    /// Returns true if nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.volumes.is_empty()
    }
}

/// What [`ClusterModel::apply_removals`] actually removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// Removed resources.
    pub resources: Vec<ResourceKey>,
    /// Removed volumes.
    pub volumes: Vec<VolumeKey>,
    /// Layer ids returned to the pool.
    pub released_ids: BTreeSet<LayerRscId>,
}

/// Every entity known to one reconciliation pass.
#[derive(Debug)]
pub struct ClusterModel {
    factory: LayerDataFactory,
    pools: BTreeMap<(NodeName, String), StoragePool>,
    rsc_dfns: BTreeMap<ResourceName, ResourceDefinition>,
    resources: BTreeMap<ResourceKey, Resource>,
    snapshots: BTreeMap<SnapshotKey, Snapshot>,
}

impl ClusterModel {
    /// Empty model. Fails on an invalid `config`.
    pub fn new(config: EngineConfig) -> LayerResult<Self> {
        config.validate()?;
        Ok(Self {
            factory: LayerDataFactory::new(config),
            pools: BTreeMap::new(),
            rsc_dfns: BTreeMap::new(),
            resources: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        })
    }

    /// Factory owning the number pools.
    pub fn factory(&self) -> &LayerDataFactory {
        &self.factory
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        self.factory.config()
    }

    /// Adds a pool. Pool names are unique per node.
    pub fn add_storage_pool(&mut self, pool: StoragePool) -> LayerResult<()> {
        let key = (pool.node.clone(), pool.name.clone());
        if self.pools.contains_key(&key) {
            return Err(LayerError::implementation(format!(
                "storage pool {}/{} already exists",
                key.0, key.1
            )));
        }
        self.pools.insert(key, pool);
        Ok(())
    }

    /// Adds a resource definition, reserving minor numbers its volume
    /// definitions already carry.
    pub fn add_resource_definition(&mut self, rsc_dfn: ResourceDefinition) -> LayerResult<()> {
        if self.rsc_dfns.contains_key(&rsc_dfn.name) {
            return Err(LayerError::implementation(format!(
                "resource definition {} already exists",
                rsc_dfn.name
            )));
        }
        for vlm_dfn in rsc_dfn.volume_definitions.values() {
            if let Some(minor) = vlm_dfn.minor {
                if !self.factory.reserve_minor(minor)? {
                    return Err(LayerError::implementation(format!(
                        "minor number {} of {}/{} is already in use",
                        minor, rsc_dfn.name, vlm_dfn.vlm_nr
                    )));
                }
            }
        }
        self.rsc_dfns.insert(rsc_dfn.name.clone(), rsc_dfn);
        Ok(())
    }

    /// Adds a resource. Its definition, volume definitions and pools must exist.
    pub fn add_resource(&mut self, rsc: Resource) -> LayerResult<()> {
        let rsc_dfn = self.resource_definition(&rsc.key.name)?;
        for vlm in rsc.volumes.values() {
            rsc_dfn.volume_definition(vlm.vlm_nr)?;
            self.storage_pool(&rsc.key.node, &vlm.stor_pool)?;
        }
        if let Some(parent) = &rsc.parent {
            if parent == &rsc.key {
                return Err(LayerError::implementation(format!(
                    "resource {} is its own parent",
                    rsc.key
                )));
            }
        }
        if self.resources.contains_key(&rsc.key) {
            return Err(LayerError::implementation(format!(
                "resource {} already exists",
                rsc.key
            )));
        }
        self.resources.insert(rsc.key.clone(), rsc);
        Ok(())
    }

    /// Adds a snapshot. Its definition and pools must exist.
    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> LayerResult<()> {
        self.resource_definition(&snapshot.key.rsc_name)?;
        for vlm in snapshot.volumes.values() {
            self.storage_pool(&snapshot.key.node, &vlm.stor_pool)?;
        }
        self.snapshots.insert(snapshot.key.clone(), snapshot);
        Ok(())
    }

    /// Pool `name` on `node`.
    pub fn storage_pool(&self, node: &NodeName, name: &str) -> LayerResult<&StoragePool> {
        self.pools
            .get(&(node.clone(), name.to_string()))
            .ok_or_else(|| LayerError::NotFound {
                what: format!("storage pool {}/{}", node, name),
            })
    }

    /// Mutable pool `name` on `node`.
    pub fn storage_pool_mut(
        &mut self,
        node: &NodeName,
        name: &str,
    ) -> LayerResult<&mut StoragePool> {
        self.pools
            .get_mut(&(node.clone(), name.to_string()))
            .ok_or_else(|| LayerError::NotFound {
                what: format!("storage pool {}/{}", node, name),
            })
    }

    /// All pools, ordered by node and name.
    pub fn storage_pools(&self) -> impl Iterator<Item = &StoragePool> {
        self.pools.values()
    }

    /// Storage pool backing one volume of `rsc`, requiring `Use` on the pool.
    pub fn storage_pool_of(
        &self,
        ctx: &AccessContext,
        rsc: &Resource,
        vlm_nr: VolumeNumber,
    ) -> LayerResult<&StoragePool> {
        let vlm = rsc.volumes.get(&vlm_nr).ok_or_else(|| LayerError::NotFound {
            what: format!("volume {}/{}", rsc.key, vlm_nr),
        })?;
        let pool = self.storage_pool(&rsc.key.node, &vlm.stor_pool)?;
        pool.protection.require_access(ctx, AccessType::Use)?;
        Ok(pool)
    }

    /// Resource definition `name`.
    pub fn resource_definition(&self, name: &ResourceName) -> LayerResult<&ResourceDefinition> {
        self.rsc_dfns.get(name).ok_or_else(|| LayerError::NotFound {
            what: format!("resource definition {}", name),
        })
    }

    /// All resource definitions, ordered by name.
    pub fn resource_definitions(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.rsc_dfns.values()
    }

    /// Resource `key`.
    pub fn resource(&self, key: &ResourceKey) -> LayerResult<&Resource> {
        self.resources.get(key).ok_or_else(|| LayerError::NotFound {
            what: format!("resource {}", key),
        })
    }

    /// Mutable resource `key`.
    pub fn resource_mut(&mut self, key: &ResourceKey) -> LayerResult<&mut Resource> {
        self.resources.get_mut(key).ok_or_else(|| LayerError::NotFound {
            what: format!("resource {}", key),
        })
    }

    /// Whether resource `key` exists.
    pub fn contains_resource(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    /// All resources, default and typed.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Default resources realizing `name`, in node order.
    pub fn resources_of<'a>(
        &'a self,
        name: &'a ResourceName,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources
            .values()
            .filter(move |rsc| &rsc.key.name == name && rsc.key.is_default())
    }

    /// Resources whose parent is `key`.
    pub fn children_of<'a>(
        &'a self,
        key: &'a ResourceKey,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources
            .values()
            .filter(move |rsc| rsc.parent.as_ref() == Some(key))
    }

    /// Snapshot `key`.
    pub fn snapshot(&self, key: &SnapshotKey) -> LayerResult<&Snapshot> {
        self.snapshots.get(key).ok_or_else(|| LayerError::NotFound {
            what: format!("snapshot {}", key),
        })
    }

    /// All snapshots.
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    /// Removes the planned volumes, then the planned resources, releasing
    /// the layer ids of every detached stack.
    pub fn apply_removals(&mut self, plan: &RemovalPlan) -> LayerResult<RemovalOutcome> {
        let mut outcome = RemovalOutcome::default();

        for vlm_key in &plan.volumes {
            if plan.resources.contains(&vlm_key.rsc) {
                continue;
            }
            if let Some(rsc) = self.resources.get_mut(&vlm_key.rsc) {
                if rsc.volumes.remove(&vlm_key.vlm_nr).is_some() {
                    debug!(vlm = %vlm_key, "removed volume");
                    outcome.volumes.push(vlm_key.clone());
                }
            }
        }

        for key in &plan.resources {
            if let Some(rsc) = self.resources.remove(key) {
                if let Some(stack) = rsc.detach_layer_stack() {
                    for id in stack.layer_ids() {
                        self.factory.release_layer_id(id)?;
                        outcome.released_ids.insert(id);
                    }
                }
                debug!(rsc = %key, "removed resource");
                outcome.resources.push(key.clone());
            }
        }

        info!(
            resources = outcome.resources.len(),
            volumes = outcome.volumes.len(),
            "applied removals"
        );
        Ok(outcome)
    }
}
