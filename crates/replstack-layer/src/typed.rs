//! Per-layer split of default resources into typed resources.
//!
//! Each needed layer gets its own typed resource on the same node, chained
//! through parent links: the topmost typed resource's parent is the default
//! resource, every other one's parent is the typed resource of the layer
//! above. The deletion reconciler walks this chain.

use tracing::{debug, info};

use crate::access::{AccessContext, AccessType};
use crate::error::{LayerError, LayerResult};
use crate::model::{ClusterModel, Resource};
use crate::predicates;
use crate::types::{ResourceFlags, ResourceKey};

/// Creates the missing typed resources under `default_key` and returns the
/// keys of the ones created, top to bottom.
pub fn split_typed_resources(
    model: &mut ClusterModel,
    ctx: &AccessContext,
    default_key: &ResourceKey,
) -> LayerResult<Vec<ResourceKey>> {
    if !default_key.is_default() {
        return Err(LayerError::implementation(format!(
            "cannot split typed resource {}",
            default_key
        )));
    }

    let (layers, template) = {
        let rsc = model.resource(default_key)?;
        rsc.protection.require_access(ctx, AccessType::Change)?;
        let layers = predicates::needed_layers(model, ctx, rsc)?;
        let flags = ResourceFlags {
            delete: false,
            diskless: rsc.flags(ctx)?.diskless,
        };
        (
            layers,
            (rsc.node_id, flags, rsc.volumes.clone(), rsc.protection.clone()),
        )
    };
    let (node_id, flags, volumes, protection) = template;

    let mut created = Vec::new();
    let mut parent = default_key.clone();
    for kind in layers {
        let key = default_key.typed(kind);
        if model.contains_resource(&key) {
            debug!(rsc = %key, "typed resource already present");
            parent = key;
            continue;
        }
        let mut typed_protection = protection.clone();
        typed_protection.set_object(format!("resource {}", key));
        let mut typed = Resource::new(key.clone(), node_id.as_u16())
            .with_parent(parent.clone())
            .with_flags(flags)
            .with_protection(typed_protection);
        typed.volumes = volumes.clone();
        model.add_resource(typed)?;
        created.push(key.clone());
        parent = key;
    }

    info!(rsc = %default_key, created = created.len(), "split typed resources");
    Ok(created)
}
