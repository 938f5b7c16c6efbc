//! Deletion and orphan reconciliation.
//!
//! After a reconciliation pass the reconciler decides which resources and
//! volumes can be physically removed. Resources that failed in the pass are
//! never removed, and neither is anything whose ancestor chain contains one:
//! those subtrees are retried by the next pass.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::access::AccessContext;
use crate::error::{LayerError, LayerResult};
use crate::model::{ClusterModel, RemovalPlan, Resource};
use crate::types::{ResourceKey, VolumeKey, VolumeNumber};

/// Failure recorded per resource during a pass.
pub type FailureMap = BTreeMap<ResourceKey, LayerError>;

/// Volume a volume of the layer above is stacked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingVolume {
    /// Backing volume.
    pub key: VolumeKey,
    /// The volume or its resource is flagged for deletion.
    pub deleted: bool,
}

/// Resolves the backing volumes of a volume.
pub trait BackingVolumeLookup {
    /// Storage pool driver errors surface as [`LayerError::StorageFault`].
    fn backing_volumes(
        &self,
        model: &ClusterModel,
        ctx: &AccessContext,
        rsc: &Resource,
        vlm_nr: VolumeNumber,
    ) -> LayerResult<Vec<BackingVolume>>;
}

/// Looks up backing volumes among the typed children of a resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelBackingLookup;

impl BackingVolumeLookup for ModelBackingLookup {
    fn backing_volumes(
        &self,
        model: &ClusterModel,
        ctx: &AccessContext,
        rsc: &Resource,
        vlm_nr: VolumeNumber,
    ) -> LayerResult<Vec<BackingVolume>> {
        model.storage_pool_of(ctx, rsc, vlm_nr)?.check_driver()?;

        let mut backing = Vec::new();
        for child in model.children_of(&rsc.key) {
            if !child.volumes.contains_key(&vlm_nr) {
                continue;
            }
            model.storage_pool_of(ctx, child, vlm_nr)?.check_driver()?;
            let deleted = child.is_deleted(ctx)? || child.volume_flags(ctx, vlm_nr)?.delete;
            backing.push(BackingVolume {
                key: VolumeKey {
                    rsc: child.key.clone(),
                    vlm_nr,
                },
                deleted,
            });
        }
        Ok(backing)
    }
}

/// Computes removal sets from the resources touched by a pass.
pub struct DeletionReconciler<'a, B = ModelBackingLookup> {
    model: &'a ClusterModel,
    ctx: &'a AccessContext,
    lookup: B,
}

impl<'a> DeletionReconciler<'a, ModelBackingLookup> {
    /// Reconciler resolving backing volumes from the model itself.
    pub fn new(model: &'a ClusterModel, ctx: &'a AccessContext) -> Self {
        Self::with_lookup(model, ctx, ModelBackingLookup)
    }
}

impl<'a, B: BackingVolumeLookup> DeletionReconciler<'a, B> {
    /// Reconciler resolving backing volumes through `lookup`.
    pub fn with_lookup(model: &'a ClusterModel, ctx: &'a AccessContext, lookup: B) -> Self {
        Self { model, ctx, lookup }
    }

    /// Walks the parent chain of `key`. A failed ancestor anywhere on the
    /// chain vetoes; otherwise any deleted or already removed ancestor makes
    /// `key` an orphan.
    pub fn is_orphan(&self, key: &ResourceKey, failures: &FailureMap) -> LayerResult<bool> {
        let mut seen = BTreeSet::new();
        seen.insert(key.clone());
        let mut deleted_ancestor = false;
        let mut cur = self.model.resource(key)?.parent.clone();

        while let Some(ancestor_key) = cur {
            if !seen.insert(ancestor_key.clone()) {
                return Err(LayerError::implementation(format!(
                    "parent chain of {} loops through {}",
                    key, ancestor_key
                )));
            }
            if failures.contains_key(&ancestor_key) {
                debug!(rsc = %key, ancestor = %ancestor_key, "ancestor failed, not an orphan");
                return Ok(false);
            }
            match self.model.resource(&ancestor_key) {
                Ok(ancestor) => {
                    if ancestor.is_deleted(self.ctx)? {
                        deleted_ancestor = true;
                    }
                    cur = ancestor.parent.clone();
                }
                Err(LayerError::NotFound { .. }) => {
                    deleted_ancestor = true;
                    cur = None;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(deleted_ancestor)
    }

    /// Resources of `touched` that can be physically removed.
    pub fn resources_to_delete(
        &self,
        touched: &BTreeSet<ResourceKey>,
        failures: &FailureMap,
    ) -> LayerResult<BTreeSet<ResourceKey>> {
        let mut selected = BTreeSet::new();
        for key in touched {
            if failures.contains_key(key) {
                continue;
            }
            let rsc = self.model.resource(key)?;
            if key.is_default() && rsc.is_deleted(self.ctx)? {
                let children: Vec<String> = self
                    .model
                    .children_of(key)
                    .map(|child| child.key.to_string())
                    .collect();
                if !children.is_empty() {
                    return Err(LayerError::implementation(format!(
                        "deleted resource {} still has layer resources [{}]",
                        key,
                        children.join(", ")
                    )));
                }
                selected.insert(key.clone());
                continue;
            }
            if self.is_orphan(key, failures)? {
                debug!(rsc = %key, "orphaned resource");
                selected.insert(key.clone());
            }
        }
        Ok(selected)
    }

    /// Deleted volumes of touched, non-failed default resources that can be
    /// physically removed. Storage faults are recorded into `failures` and
    /// exclude the whole resource.
    pub fn volumes_to_delete(
        &self,
        touched: &BTreeSet<ResourceKey>,
        failures: &mut FailureMap,
    ) -> LayerResult<BTreeSet<VolumeKey>> {
        let mut selected = BTreeSet::new();
        for key in touched {
            if !key.is_default() || failures.contains_key(key) {
                continue;
            }
            let rsc = self.model.resource(key)?;
            match self.deleted_volumes_of(rsc) {
                Ok(volumes) => selected.extend(volumes),
                Err(err) if err.is_per_resource() => {
                    warn!(rsc = %key, error = %err, "excluding resource from volume removal");
                    failures.insert(key.clone(), err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(selected)
    }

    fn deleted_volumes_of(&self, rsc: &Resource) -> LayerResult<Vec<VolumeKey>> {
        let mut volumes = Vec::new();
        for vlm_nr in rsc.volumes.keys() {
            if !rsc.volume_flags(self.ctx, *vlm_nr)?.delete {
                continue;
            }
            let backing = self
                .lookup
                .backing_volumes(self.model, self.ctx, rsc, *vlm_nr)?;
            if let Some(live) = backing.iter().find(|b| !b.deleted) {
                return Err(LayerError::implementation(format!(
                    "deleted volume {}/{} is still backed by {}",
                    rsc.key, vlm_nr, live.key
                )));
            }
            volumes.push(VolumeKey {
                rsc: rsc.key.clone(),
                vlm_nr: *vlm_nr,
            });
        }
        Ok(volumes)
    }

    /// Volumes first, so that faults recorded there also keep the resource.
    pub fn plan(
        &self,
        touched: &BTreeSet<ResourceKey>,
        failures: &mut FailureMap,
    ) -> LayerResult<RemovalPlan> {
        let volumes = self.volumes_to_delete(touched, failures)?;
        let resources = self.resources_to_delete(touched, failures)?;
        info!(
            touched = touched.len(),
            failed = failures.len(),
            resources = resources.len(),
            volumes = volumes.len(),
            "deletion reconciliation"
        );
        Ok(RemovalPlan { resources, volumes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{ResourceDefinition, StoragePool, Volume, VolumeDefinition};
    use crate::types::{DeviceLayerKind, NodeName, ProviderKind, ResourceFlags};

    const DELETED: ResourceFlags = ResourceFlags {
        delete: true,
        diskless: false,
    };

    fn base() -> ClusterModel {
        let mut model = ClusterModel::new(EngineConfig::default()).unwrap();
        model.add_storage_pool(StoragePool::new("n1", "lvm0", ProviderKind::Lvm)).unwrap();
        model
            .add_resource_definition(
                ResourceDefinition::new("data1", 7000)
                    .with_volume_definition(VolumeDefinition::new(0, 1024)),
            )
            .unwrap();
        model
    }

    fn keys() -> (ResourceKey, ResourceKey, ResourceKey) {
        let a = ResourceKey::new("n1", "data1");
        let b = a.typed(DeviceLayerKind::Drbd);
        let c = a.typed(DeviceLayerKind::Storage);
        (a, b, c)
    }

    /// A -> B -> C, with B flagged as given.
    fn chain(b_flags: ResourceFlags) -> ClusterModel {
        let mut model = base();
        let (a, b, c) = keys();
        model.add_resource(Resource::new(a.clone(), 0)).unwrap();
        model
            .add_resource(Resource::new(b.clone(), 0).with_parent(a).with_flags(b_flags))
            .unwrap();
        model.add_resource(Resource::new(c, 0).with_parent(b)).unwrap();
        model
    }

    #[test]
    fn test_orphan_when_ancestor_deleted() {
        let model = chain(DELETED);
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let (_, _, c) = keys();
        assert!(reconciler.is_orphan(&c, &FailureMap::new()).unwrap());
    }

    #[test]
    fn test_failed_grandparent_vetoes_orphan() {
        let model = chain(DELETED);
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let (a, _, c) = keys();
        let mut failures = FailureMap::new();
        failures.insert(
            a,
            LayerError::StorageFault {
                pool: "lvm0".to_string(),
                reason: "vg missing".to_string(),
            },
        );
        assert!(!reconciler.is_orphan(&c, &failures).unwrap());
    }

    #[test]
    fn test_not_orphan_without_deleted_ancestor() {
        let model = chain(ResourceFlags::default());
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let (_, _, c) = keys();
        assert!(!reconciler.is_orphan(&c, &FailureMap::new()).unwrap());
    }

    #[test]
    fn test_deleted_default_with_child_is_fatal() {
        let mut model = base();
        let (a, _, c) = keys();
        model.add_resource(Resource::new(a.clone(), 0).with_flags(DELETED)).unwrap();
        model.add_resource(Resource::new(c, 0).with_parent(a.clone())).unwrap();
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let touched: BTreeSet<_> = [a].into_iter().collect();
        let err = reconciler.resources_to_delete(&touched, &FailureMap::new()).unwrap_err();
        assert!(matches!(err, LayerError::ImplementationError { .. }));
    }

    #[test]
    fn test_deleted_default_without_children_selected() {
        let mut model = base();
        let (a, _, _) = keys();
        model.add_resource(Resource::new(a.clone(), 0).with_flags(DELETED)).unwrap();
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let touched: BTreeSet<_> = [a.clone()].into_iter().collect();
        let selected = reconciler.resources_to_delete(&touched, &FailureMap::new()).unwrap();
        assert!(selected.contains(&a));

        let mut failures = FailureMap::new();
        failures.insert(a.clone(), LayerError::implementation("x"));
        assert!(reconciler.resources_to_delete(&touched, &failures).unwrap().is_empty());
    }

    #[test]
    fn test_parent_cycle_is_fatal() {
        let mut model = base();
        let (_, b, c) = keys();
        model.add_resource(Resource::new(b.clone(), 0).with_parent(c.clone())).unwrap();
        model.add_resource(Resource::new(c.clone(), 0).with_parent(b)).unwrap();
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        assert!(reconciler.is_orphan(&c, &FailureMap::new()).is_err());
    }

    #[test]
    fn test_volume_with_live_backing_is_fatal() {
        let mut model = base();
        let (a, _, c) = keys();
        model
            .add_resource(Resource::new(a.clone(), 0).with_volume(Volume::new(0, "lvm0").deleted()))
            .unwrap();
        let child = Resource::new(c, 0).with_parent(a.clone()).with_volume(Volume::new(0, "lvm0"));
        model.add_resource(child).unwrap();
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let touched: BTreeSet<_> = [a].into_iter().collect();
        let err = reconciler.volumes_to_delete(&touched, &mut FailureMap::new()).unwrap_err();
        assert!(matches!(err, LayerError::ImplementationError { .. }));
    }

    #[test]
    fn test_pool_fault_recorded_and_excluded() {
        let mut model = base();
        let (a, _, _) = keys();
        model
            .add_resource(Resource::new(a.clone(), 0).with_volume(Volume::new(0, "lvm0").deleted()))
            .unwrap();
        model
            .storage_pool_mut(&NodeName::new("n1"), "lvm0")
            .unwrap()
            .driver_fault = Some("vgs timed out".to_string());
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let touched: BTreeSet<_> = [a.clone()].into_iter().collect();
        let mut failures = FailureMap::new();
        let plan = reconciler.plan(&touched, &mut failures).unwrap();
        assert!(plan.is_empty());
        assert!(matches!(failures.get(&a), Some(LayerError::StorageFault { .. })));
    }

    #[test]
    fn test_deleted_volume_with_deleted_backing_selected() {
        let mut model = base();
        let (a, _, c) = keys();
        model
            .add_resource(Resource::new(a.clone(), 0).with_volume(Volume::new(0, "lvm0").deleted()))
            .unwrap();
        let child = Resource::new(c, 0)
            .with_parent(a.clone())
            .with_volume(Volume::new(0, "lvm0").deleted());
        model.add_resource(child).unwrap();
        let ctx = AccessContext::system();
        let reconciler = DeletionReconciler::new(&model, &ctx);
        let touched: BTreeSet<_> = [a.clone()].into_iter().collect();
        let volumes = reconciler.volumes_to_delete(&touched, &mut FailureMap::new()).unwrap();
        assert!(volumes.contains(&VolumeKey {
            rsc: a,
            vlm_nr: VolumeNumber::new(0)
        }));
    }
}
