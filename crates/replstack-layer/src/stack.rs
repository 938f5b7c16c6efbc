//! Stack builder and composition pass.
//!
//! The builder runs the converters top-down (replication, encryption,
//! storage), skipping layers the resource does not need, then links the
//! returned objects bottom-up. A resource whose composition fails at any
//! layer gets nothing: partial objects are dropped, freshly allocated layer
//! ids are released and no peer registration is committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::access::AccessContext;
use crate::converter::{CompositionScope, Converted, LayerConverter, ParentLink};
use crate::drbd::DrbdConverter;
use crate::error::{LayerError, LayerResult};
use crate::layer_data::RscLayerObject;
use crate::luks::LuksConverter;
use crate::model::{ClusterModel, RemovalOutcome, RemovalPlan, Resource};
use crate::reconcile::FailureMap;
use crate::registry::PeerRegistry;
use crate::storage::StorageConverter;
use crate::types::{DeviceLayerKind, NodeName, ResourceKey, ResourceName};

/// Decides which composed stacks belong to the local node.
pub trait PlacementLookup {
    /// Whether the stack of `key` is reported by this node.
    fn is_local(&self, key: &ResourceKey) -> bool;
}

/// Placement of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNodePlacement {
    node: NodeName,
}

impl LocalNodePlacement {
    /// Placement of `node`.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: NodeName::new(node),
        }
    }
}

impl PlacementLookup for LocalNodePlacement {
    fn is_local(&self, key: &ResourceKey) -> bool {
        key.node == self.node
    }
}

/// Placement that keeps every stack, as seen by the cluster controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllNodesPlacement;

impl PlacementLookup for AllNodesPlacement {
    fn is_local(&self, _key: &ResourceKey) -> bool {
        true
    }
}

/// Result of one composition pass.
#[derive(Debug, Default)]
pub struct CompositionReport {
    /// Root layer object per composed, locally placed resource.
    pub stacks: BTreeMap<ResourceKey, Arc<RscLayerObject>>,
    /// Per-resource failures; these resources got no stack.
    pub failures: FailureMap,
}

/// Orchestrates the layer converters.
pub struct StackBuilder {
    converters: Vec<Box<dyn LayerConverter>>,
    registry: PeerRegistry,
}

impl Default for StackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StackBuilder {
    /// Builder with the replication, encryption and storage converters.
    pub fn new() -> Self {
        Self::with_converters(vec![
            Box::new(DrbdConverter::new()),
            Box::new(LuksConverter::new()),
            Box::new(StorageConverter::new()),
        ])
    }

    /// Builder running `converters` in the given top-down order.
    pub fn with_converters(converters: Vec<Box<dyn LayerConverter>>) -> Self {
        Self {
            converters,
            registry: PeerRegistry::new(),
        }
    }

    /// Peer objects registered by earlier compositions.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Layer kinds run by this builder, top to bottom.
    pub fn layer_order(&self) -> Vec<DeviceLayerKind> {
        self.converters.iter().map(|c| c.kind()).collect()
    }

    /// Builds, attaches and returns the stack of one resource.
    pub fn build(
        &self,
        model: &ClusterModel,
        ctx: &AccessContext,
        key: &ResourceKey,
    ) -> LayerResult<Arc<RscLayerObject>> {
        let rsc = model.resource(key)?;
        let mut scope = CompositionScope::new(model, ctx, &self.registry);

        let built = self
            .convert_all(&mut scope, rsc)
            .and_then(|root| {
                let root = Arc::new(root);
                rsc.attach_layer_stack(ctx, Arc::clone(&root))?;
                Ok(root)
            });

        match built {
            Ok(root) => {
                let peers = scope.commit();
                debug!(rsc = %key, layers = ?root.layer_kinds(), peers, "composed layer stack");
                Ok(root)
            }
            Err(err) => {
                if let Err(release_err) = scope.rollback() {
                    warn!(rsc = %key, error = %release_err, "partial stack kept some layer ids");
                }
                Err(err)
            }
        }
    }

    fn convert_all(
        &self,
        scope: &mut CompositionScope<'_>,
        rsc: &Resource,
    ) -> LayerResult<RscLayerObject> {
        let mut converted: Vec<Converted> = Vec::with_capacity(self.converters.len());
        let mut parent: Option<ParentLink> = None;

        for converter in &self.converters {
            if !converter.is_needed(scope, rsc)? {
                continue;
            }
            let step = converter.convert(scope, rsc, parent.as_ref())?;
            if step.object.kind() != converter.kind() {
                return Err(LayerError::implementation(format!(
                    "{} converter produced a {} object for {}",
                    converter.kind(),
                    step.object.kind(),
                    rsc.key
                )));
            }
            parent = Some(ParentLink::of(&step.object));
            converted.push(step);
        }

        match converted.last() {
            Some(bottom) if bottom.object.kind() == DeviceLayerKind::Storage => {}
            _ => {
                return Err(LayerError::implementation(format!(
                    "layer stack of {} does not end in a storage layer",
                    rsc.key
                )))
            }
        }

        let mut below: Option<RscLayerObject> = None;
        for mut step in converted.into_iter().rev() {
            if let Some(child) = below.take() {
                step.child_slot.push(child);
            }
            below = Some(step.into_linked());
        }
        below.ok_or_else(|| {
            LayerError::implementation(format!("empty layer stack for {}", rsc.key))
        })
    }

    /// Composes every default resource in `keys`. Fatal errors abort the
    /// pass; per-resource errors are recorded in the report.
    pub fn compose_pass<'k>(
        &self,
        model: &ClusterModel,
        ctx: &AccessContext,
        keys: impl IntoIterator<Item = &'k ResourceKey>,
        placement: &dyn PlacementLookup,
    ) -> LayerResult<CompositionReport> {
        let mut report = CompositionReport::default();
        let mut composed = 0usize;

        for key in keys {
            if !key.is_default() {
                debug!(rsc = %key, "skipping typed resource");
                continue;
            }
            match self.build(model, ctx, key) {
                Ok(stack) => {
                    composed += 1;
                    if placement.is_local(key) {
                        report.stacks.insert(key.clone(), stack);
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(rsc = %key, error = %err, "composition pass aborted");
                    return Err(err);
                }
                Err(err) => {
                    warn!(rsc = %key, error = %err, "composition failed");
                    report.failures.insert(key.clone(), err);
                }
            }
        }

        info!(
            composed,
            local = report.stacks.len(),
            failed = report.failures.len(),
            "composition pass"
        );
        Ok(report)
    }

    /// Composes every resource of one resource definition.
    pub fn compose_definition(
        &self,
        model: &ClusterModel,
        ctx: &AccessContext,
        name: &ResourceName,
        placement: &dyn PlacementLookup,
    ) -> LayerResult<CompositionReport> {
        let keys: Vec<ResourceKey> = model.resources_of(name).map(|rsc| rsc.key.clone()).collect();
        self.compose_pass(model, ctx, &keys, placement)
    }

    /// Applies a removal plan and forgets peer registrations of the removed
    /// resources.
    pub fn apply_removals(
        &self,
        model: &mut ClusterModel,
        plan: &RemovalPlan,
    ) -> LayerResult<RemovalOutcome> {
        let mut peer_ids = BTreeSet::new();
        for key in &plan.resources {
            if let Some(peer) = self.registry.remove(key) {
                peer_ids.insert(peer.id);
            }
        }
        let mut outcome = model.apply_removals(plan)?;
        for id in peer_ids {
            model.factory().release_layer_id(id)?;
            outcome.released_ids.insert(id);
        }
        Ok(outcome)
    }
}
