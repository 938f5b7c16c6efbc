//! Layer need predicates.
//!
//! Both decisions are resource-wide: one encrypted volume puts the encryption
//! layer under every volume of the resource, and one replication-capable pool
//! puts the replication layer over every volume. The storage layer is always
//! present. The converter path and the typed-resource split both call these.

use crate::access::AccessContext;
use crate::error::LayerResult;
use crate::model::{ClusterModel, Resource};
use crate::types::DeviceLayerKind;

/// True iff any volume's definition is flagged encrypted.
pub fn needs_encryption(
    model: &ClusterModel,
    ctx: &AccessContext,
    rsc: &Resource,
) -> LayerResult<bool> {
    let rsc_dfn = model.resource_definition(&rsc.key.name)?;
    for vlm_nr in rsc.volumes.keys() {
        if rsc_dfn.volume_definition(*vlm_nr)?.is_encrypted(ctx)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True iff any volume's storage pool driver supports the replication layer.
pub fn needs_replication(
    model: &ClusterModel,
    ctx: &AccessContext,
    rsc: &Resource,
) -> LayerResult<bool> {
    for vlm_nr in rsc.volumes.keys() {
        if model
            .storage_pool_of(ctx, rsc, *vlm_nr)?
            .driver_supports_replication(ctx)?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `kind` belongs in the stack of `rsc`.
pub fn is_layer_needed(
    model: &ClusterModel,
    ctx: &AccessContext,
    rsc: &Resource,
    kind: DeviceLayerKind,
) -> LayerResult<bool> {
    match kind {
        DeviceLayerKind::Drbd => needs_replication(model, ctx, rsc),
        DeviceLayerKind::Luks => needs_encryption(model, ctx, rsc),
        DeviceLayerKind::Storage => Ok(true),
    }
}

/// Needed layer kinds of `rsc`, top to bottom.
pub fn needed_layers(
    model: &ClusterModel,
    ctx: &AccessContext,
    rsc: &Resource,
) -> LayerResult<Vec<DeviceLayerKind>> {
    let mut layers = Vec::with_capacity(DeviceLayerKind::TOP_DOWN.len());
    for kind in DeviceLayerKind::TOP_DOWN {
        if is_layer_needed(model, ctx, rsc, kind)? {
            layers.push(kind);
        }
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessType, ObjectProtection};
    use crate::config::EngineConfig;
    use crate::error::LayerError;
    use crate::model::{ResourceDefinition, StoragePool, Volume, VolumeDefinition};
    use crate::types::{ProviderKind, ResourceKey};

    fn model(encrypt_second: bool, kind: ProviderKind) -> ClusterModel {
        let mut model = ClusterModel::new(EngineConfig::default()).unwrap();
        model.add_storage_pool(StoragePool::new("n1", "pool", kind)).unwrap();
        let second = VolumeDefinition::new(1, 1024);
        let second = if encrypt_second {
            second.with_encryption(Some(b"key".to_vec()))
        } else {
            second
        };
        model
            .add_resource_definition(
                ResourceDefinition::new("data1", 7000)
                    .with_volume_definition(VolumeDefinition::new(0, 1024))
                    .with_volume_definition(second),
            )
            .unwrap();
        model
            .add_resource(
                Resource::new(ResourceKey::new("n1", "data1"), 0)
                    .with_volume(Volume::new(0, "pool"))
                    .with_volume(Volume::new(1, "pool")),
            )
            .unwrap();
        model
    }

    fn data1(model: &ClusterModel) -> &Resource {
        model.resource(&ResourceKey::new("n1", "data1")).unwrap()
    }

    #[test]
    fn test_one_encrypted_volume_encrypts_resource() {
        let model = model(true, ProviderKind::Lvm);
        let ctx = AccessContext::system();
        assert!(needs_encryption(&model, &ctx, data1(&model)).unwrap());
        assert_eq!(
            needed_layers(&model, &ctx, data1(&model)).unwrap(),
            vec![DeviceLayerKind::Drbd, DeviceLayerKind::Luks, DeviceLayerKind::Storage]
        );
    }

    #[test]
    fn test_storage_only_without_replication_support() {
        let model = model(false, ProviderKind::SwordfishTarget);
        let ctx = AccessContext::system();
        assert!(!needs_replication(&model, &ctx, data1(&model)).unwrap());
        assert_eq!(
            needed_layers(&model, &ctx, data1(&model)).unwrap(),
            vec![DeviceLayerKind::Storage]
        );
    }

    #[test]
    fn test_resource_without_volumes_is_storage_only() {
        let mut model = model(true, ProviderKind::Lvm);
        let key = ResourceKey::new("n1", "data1").typed(DeviceLayerKind::Storage);
        model.add_resource(Resource::new(key.clone(), 0)).unwrap();
        let ctx = AccessContext::system();
        let rsc = model.resource(&key).unwrap();
        assert_eq!(needed_layers(&model, &ctx, rsc).unwrap(), vec![DeviceLayerKind::Storage]);
    }

    #[test]
    fn test_replication_check_requires_pool_use() {
        let mut model = model(false, ProviderKind::Lvm);
        let mut prot = ObjectProtection::new("storage pool n1/pool");
        prot.grant("ops", AccessType::View);
        model
            .storage_pool_mut(&crate::types::NodeName::new("n1"), "pool")
            .unwrap()
            .protection = prot;
        let ctx = AccessContext::new("bob", "ops");
        let err = needs_replication(&model, &ctx, data1(&model)).unwrap_err();
        assert!(matches!(err, LayerError::AccessDenied { .. }));
    }
}
