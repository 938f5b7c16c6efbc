//! Common contract of the per-layer converters.
//!
//! A converter turns one resource into the layer object of its kind plus an
//! empty [`ChildSlot`]. It never links objects itself: the stack builder
//! fills each slot with the object returned by the converter below.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::access::AccessContext;
use crate::error::LayerResult;
use crate::layer_data::{RscLayerData, RscLayerObject};
use crate::model::{ClusterModel, Resource};
use crate::predicates;
use crate::registry::PeerRegistry;
use crate::types::{DeviceLayerKind, LayerRscId, VolumeNumber};

/// Identity of the already converted layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    /// Layer resource id of the parent object.
    pub id: LayerRscId,
    /// Layer kind of the parent object.
    pub kind: DeviceLayerKind,
}

impl ParentLink {
    /// Link to `obj` as the parent of the next layer down.
    pub fn of(obj: &RscLayerObject) -> Self {
        Self {
            id: obj.id,
            kind: obj.kind(),
        }
    }
}

/// Ordered slot for the next lower layer's object.
#[derive(Debug, Default)]
pub struct ChildSlot(Vec<RscLayerObject>);

impl ChildSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a child object.
    pub fn push(&mut self, child: RscLayerObject) {
        self.0.push(child);
    }

    /// Number of children in the slot.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no child was pushed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Children in push order.
    pub fn into_vec(self) -> Vec<RscLayerObject> {
        self.0
    }
}

/// Output of one converter.
#[derive(Debug)]
pub struct Converted {
    /// Layer object built for the resource, without children.
    pub object: RscLayerObject,
    /// Filled by the builder with the next lower layer's object.
    pub child_slot: ChildSlot,
}

impl Converted {
    /// Wraps `object` with an empty child slot.
    pub fn new(object: RscLayerObject) -> Self {
        Self {
            object,
            child_slot: ChildSlot::new(),
        }
    }

    /// Moves the slot's contents under the object.
    pub fn into_linked(self) -> RscLayerObject {
        let mut object = self.object;
        object.children = self.child_slot.into_vec();
        object
    }
}

/// Previously built layer object of one kind, as found on a resource's
/// attached stack or in the peer registry.
#[derive(Debug, Clone)]
pub struct PriorLayer {
    /// Id kept by the rebuilt object.
    pub id: LayerRscId,
    /// Layer data the rebuilt object may reuse.
    pub data: RscLayerData,
}

/// One device layer's conversion step.
pub trait LayerConverter: Send + Sync {
    /// Layer kind this converter produces.
    fn kind(&self) -> DeviceLayerKind;

    /// Whether `rsc` needs this layer at all.
    fn is_needed(&self, scope: &CompositionScope<'_>, rsc: &Resource) -> LayerResult<bool> {
        predicates::is_layer_needed(scope.model(), scope.ctx(), rsc, self.kind())
    }

    /// Builds the layer object of `rsc`.
    ///
    /// `parent` is `None` for the topmost present layer.
    fn convert(
        &self,
        scope: &mut CompositionScope<'_>,
        rsc: &Resource,
        parent: Option<&ParentLink>,
    ) -> LayerResult<Converted>;
}

/// State of one resource's composition.
///
/// Collects peer objects and freshly allocated layer ids so the builder can
/// either commit or discard everything once the whole stack is known.
pub struct CompositionScope<'a> {
    model: &'a ClusterModel,
    ctx: &'a AccessContext,
    registry: &'a PeerRegistry,
    staged_peers: Vec<RscLayerObject>,
    allocated_ids: Vec<LayerRscId>,
}

impl<'a> CompositionScope<'a> {
    /// Opens a scope over `model` on behalf of `ctx`.
    pub fn new(
        model: &'a ClusterModel,
        ctx: &'a AccessContext,
        registry: &'a PeerRegistry,
    ) -> Self {
        Self {
            model,
            ctx,
            registry,
            staged_peers: Vec::new(),
            allocated_ids: Vec::new(),
        }
    }

    /// Model being composed.
    pub fn model(&self) -> &'a ClusterModel {
        self.model
    }

    /// Caller identity used for every access check of the scope.
    pub fn ctx(&self) -> &'a AccessContext {
        self.ctx
    }

    /// Layer object of `kind` built earlier for `rsc`: its attached stack
    /// first, then a registration made while composing one of its peers.
    pub fn prior_layer(&self, rsc: &Resource, kind: DeviceLayerKind) -> Option<PriorLayer> {
        if let Some(stack) = rsc.layer_stack() {
            if let Some(obj) = stack.find(kind) {
                return Some(PriorLayer {
                    id: obj.id,
                    data: obj.data.clone(),
                });
            }
        }
        self.registry
            .get(&rsc.key)
            .filter(|obj| obj.kind() == kind)
            .map(|obj| PriorLayer {
                id: obj.id,
                data: obj.data.clone(),
            })
    }

    /// Keeps the prior id, or allocates a new one that is released again if
    /// the composition fails.
    pub fn layer_id(&mut self, prior: Option<&PriorLayer>) -> LayerResult<LayerRscId> {
        if let Some(prior) = prior {
            return Ok(prior.id);
        }
        let id = self.model.factory().next_layer_id()?;
        self.allocated_ids.push(id);
        Ok(id)
    }

    /// Queues a peer object for registration on commit.
    pub fn stage_peer(&mut self, obj: RscLayerObject) {
        self.staged_peers.push(obj);
    }

    /// Peer objects queued so far.
    pub fn staged_peers(&self) -> &[RscLayerObject] {
        &self.staged_peers
    }

    /// Registers the staged peer objects and returns how many there were.
    pub fn commit(self) -> usize {
        let count = self.staged_peers.len();
        for peer in self.staged_peers {
            self.registry.register(Arc::new(peer));
        }
        count
    }

    /// Discards staged peers and releases the ids allocated in this scope.
    ///
    /// Every id is attempted; the first release error is returned.
    pub fn rollback(self) -> LayerResult<()> {
        debug!(
            peers = self.staged_peers.len(),
            ids = self.allocated_ids.len(),
            "discarding partial composition"
        );
        let mut first_err = None;
        for id in self.allocated_ids {
            if let Err(err) = self.model.factory().release_layer_id(id) {
                warn!(layer_rsc_id = %id, error = %err, "failed to release layer id");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn track_layer_id(&mut self, id: LayerRscId) {
        self.allocated_ids.push(id);
    }
}

/// Per-volume records of a prior layer, keyed by volume number.
pub(crate) fn prior_volumes<T, F>(
    prior: Option<&PriorLayer>,
    select: F,
) -> BTreeMap<VolumeNumber, Arc<T>>
where
    F: Fn(&RscLayerData) -> Option<&BTreeMap<VolumeNumber, Arc<T>>>,
{
    prior
        .and_then(|prior| select(&prior.data))
        .cloned()
        .unwrap_or_default()
}
