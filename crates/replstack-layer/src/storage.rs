//! Storage layer converter, the mandatory bottom of every stack.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::access::{AccessContext, AccessType};
use crate::converter::{prior_volumes, CompositionScope, Converted, LayerConverter, ParentLink};
use crate::error::{LayerError, LayerResult};
use crate::factory::LayerDataFactory;
use crate::layer_data::{RscLayerData, RscLayerObject, SfVlmDfnData, StorageRscData, StorageVlmData};
use crate::model::{Resource, ResourceDefinition, StoragePool, VolumeDefinition};
use crate::props::keys::{
    DEFAULT_LVM_THIN_POOL, DEFAULT_LVM_VOLUME_GROUP, DEFAULT_ZFS_POOL, KEY_LVM_THIN_POOL,
    KEY_LVM_VOLUME_GROUP, KEY_SF_VLM_ODATA, KEY_ZFS_POOL, KEY_ZFS_THIN_POOL,
    NAMESPC_INTERNAL_STORAGE_DRIVER, NAMESPC_STORAGE_DRIVER,
};
use crate::props::Props;
use crate::types::{DeviceLayerKind, ProviderKind, VolumeNumber};

pub(crate) fn lvm_volume_group(props: &Props) -> String {
    props
        .get_prop_or(KEY_LVM_VOLUME_GROUP, Some(NAMESPC_STORAGE_DRIVER), DEFAULT_LVM_VOLUME_GROUP)
        .to_string()
}

pub(crate) fn lvm_thin_pool(props: &Props) -> String {
    props
        .get_prop_or(KEY_LVM_THIN_POOL, Some(NAMESPC_STORAGE_DRIVER), DEFAULT_LVM_THIN_POOL)
        .to_string()
}

/// ZFS pool of a ZFS or ZFS-thin pool.
pub(crate) fn zfs_pool(props: &Props, kind: ProviderKind) -> String {
    let key = if kind == ProviderKind::ZfsThin {
        KEY_ZFS_THIN_POOL
    } else {
        KEY_ZFS_POOL
    };
    props
        .get_prop_or(key, Some(NAMESPC_STORAGE_DRIVER), DEFAULT_ZFS_POOL)
        .to_string()
}

/// Builds the storage layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct StorageConverter;

impl StorageConverter {
    /// Creates the converter.
    pub fn new() -> Self {
        StorageConverter
    }

    /// Cached remote descriptor of `vlm_dfn`, created on first use.
    fn ensure_sf_dfn_data(
        &self,
        ctx: &AccessContext,
        factory: &LayerDataFactory,
        rsc_dfn: &ResourceDefinition,
        vlm_dfn: &VolumeDefinition,
    ) -> LayerResult<Arc<SfVlmDfnData>> {
        vlm_dfn.protection.require_access(ctx, AccessType::Change)?;
        let (data, created) = vlm_dfn.sf.get_or_try_init(|| {
            let odata = vlm_dfn
                .props(ctx)?
                .get_prop(KEY_SF_VLM_ODATA, Some(NAMESPC_INTERNAL_STORAGE_DRIVER))
                .map(str::to_string);
            Ok::<_, LayerError>(factory.create_sf_vlm_dfn_data(
                rsc_dfn.name.clone(),
                vlm_dfn.vlm_nr,
                odata,
            ))
        })?;
        debug!(rsc = %rsc_dfn.name, vlm_nr = %vlm_dfn.vlm_nr, created, "remote volume descriptor");
        Ok(data)
    }

    fn build_volume(
        &self,
        ctx: &AccessContext,
        factory: &LayerDataFactory,
        rsc: &Resource,
        rsc_dfn: &ResourceDefinition,
        pool: &StoragePool,
        vlm_nr: VolumeNumber,
    ) -> LayerResult<StorageVlmData> {
        let vlm_dfn = rsc_dfn.volume_definition(vlm_nr)?;
        let identifier = rsc.key.name.volume_identifier(vlm_nr);
        let kind = if rsc.flags(ctx)?.diskless {
            ProviderKind::DrbdDiskless
        } else {
            pool.provider_kind(ctx)?
        };

        let data = match kind {
            ProviderKind::DrbdDiskless => factory.create_diskless_data(vlm_nr, vlm_dfn.size_kib),
            ProviderKind::Lvm => {
                factory.create_lvm_data(vlm_nr, lvm_volume_group(pool.props(ctx)?), identifier)
            }
            ProviderKind::LvmThin => {
                let props = pool.props(ctx)?;
                factory.create_lvm_thin_data(
                    vlm_nr,
                    lvm_volume_group(props),
                    lvm_thin_pool(props),
                    identifier,
                )
            }
            ProviderKind::Zfs | ProviderKind::ZfsThin => {
                factory.create_zfs_data(vlm_nr, zfs_pool(pool.props(ctx)?, kind), identifier, kind)
            }
            ProviderKind::SwordfishInitiator => {
                let dfn = self.ensure_sf_dfn_data(ctx, factory, rsc_dfn, vlm_dfn)?;
                factory.create_sf_initiator_data(vlm_nr, dfn)
            }
            ProviderKind::SwordfishTarget => {
                let dfn = self.ensure_sf_dfn_data(ctx, factory, rsc_dfn, vlm_dfn)?;
                factory.create_sf_target_data(vlm_nr, dfn)
            }
            ProviderKind::Layer(layer) => {
                return Err(LayerError::implementation(format!(
                    "storage pool {}/{} of {} names device layer {} as its provider",
                    pool.node, pool.name, rsc.key, layer
                )))
            }
        };
        Ok(data)
    }
}

impl LayerConverter for StorageConverter {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Storage
    }

    fn convert(
        &self,
        scope: &mut CompositionScope<'_>,
        rsc: &Resource,
        parent: Option<&ParentLink>,
    ) -> LayerResult<Converted> {
        let model = scope.model();
        let ctx = scope.ctx();
        let rsc_dfn = model.resource_definition(&rsc.key.name)?;

        let prior = scope.prior_layer(rsc, DeviceLayerKind::Storage);
        let id = scope.layer_id(prior.as_ref())?;
        let prior_vlms = prior_volumes(prior.as_ref(), |data| match data {
            RscLayerData::Storage(storage) => Some(&storage.volumes),
            _ => None,
        });

        let mut volumes = BTreeMap::new();
        for vlm_nr in rsc.volumes.keys() {
            let prior_vlm = prior_vlms.get(vlm_nr);
            if rsc.volume_flags(ctx, *vlm_nr)?.delete {
                if let Some(prior_vlm) = prior_vlm {
                    volumes.insert(*vlm_nr, Arc::clone(prior_vlm));
                }
                continue;
            }
            let pool = model.storage_pool_of(ctx, rsc, *vlm_nr)?;
            let built = self.build_volume(ctx, model.factory(), rsc, rsc_dfn, pool, *vlm_nr)?;
            let data = match prior_vlm {
                Some(prior_vlm) if **prior_vlm == built => Arc::clone(prior_vlm),
                _ => Arc::new(built),
            };
            debug!(
                rsc = %rsc.key,
                vlm_nr = %vlm_nr,
                provider = %data.provider_kind(),
                "built storage volume"
            );
            volumes.insert(*vlm_nr, data);
        }

        Ok(Converted::new(RscLayerObject::new(
            id,
            rsc.key.clone(),
            parent.map(|p| p.id),
            RscLayerData::Storage(StorageRscData { volumes }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{ClusterModel, Volume};
    use crate::registry::PeerRegistry;
    use crate::types::{ResourceFlags, ResourceKey};

    fn model(pool: StoragePool, vlm_dfn: VolumeDefinition, flags: ResourceFlags) -> ClusterModel {
        let pool_name = pool.name.clone();
        let mut model = ClusterModel::new(EngineConfig::default()).unwrap();
        model.add_storage_pool(pool).unwrap();
        let rsc_dfn = ResourceDefinition::new("data1", 7000).with_volume_definition(vlm_dfn);
        model.add_resource_definition(rsc_dfn).unwrap();
        model
            .add_resource(
                Resource::new(ResourceKey::new("n1", "data1"), 0)
                    .with_flags(flags)
                    .with_volume(Volume::new(0, pool_name)),
            )
            .unwrap();
        model
    }

    fn convert(model: &ClusterModel) -> LayerResult<Converted> {
        let ctx = AccessContext::system();
        let registry = PeerRegistry::new();
        let mut scope = CompositionScope::new(model, &ctx, &registry);
        let rsc = model.resource(&ResourceKey::new("n1", "data1")).unwrap();
        StorageConverter::new().convert(&mut scope, rsc, None)
    }

    fn volume0(converted: &Converted) -> Arc<StorageVlmData> {
        Arc::clone(&converted.object.storage().unwrap().volumes[&VolumeNumber::new(0)])
    }

    #[test]
    fn test_lvm_thin_reads_pool_props() {
        let props = Props::new()
            .with_prop(KEY_LVM_VOLUME_GROUP, "vg1", Some(NAMESPC_STORAGE_DRIVER))
            .with_prop(KEY_LVM_THIN_POOL, "tp1", Some(NAMESPC_STORAGE_DRIVER));
        let model = model(
            StoragePool::new("n1", "thin", ProviderKind::LvmThin).with_props(props),
            VolumeDefinition::new(0, 1024),
            ResourceFlags::default(),
        );
        let converted = convert(&model).unwrap();
        assert_eq!(
            *volume0(&converted),
            StorageVlmData::LvmThin {
                vlm_nr: VolumeNumber::new(0),
                volume_group: "vg1".to_string(),
                thin_pool: "tp1".to_string(),
                identifier: "data1_00000".to_string(),
            }
        );
    }

    #[test]
    fn test_zfs_thin_defaults_and_kind_tag() {
        let model = model(
            StoragePool::new("n1", "zt", ProviderKind::ZfsThin),
            VolumeDefinition::new(0, 1024),
            ResourceFlags::default(),
        );
        let converted = convert(&model).unwrap();
        assert_eq!(
            *volume0(&converted),
            StorageVlmData::Zfs {
                vlm_nr: VolumeNumber::new(0),
                zpool: "drbdpool".to_string(),
                identifier: "data1_00000".to_string(),
                kind: ProviderKind::ZfsThin,
            }
        );
    }

    #[test]
    fn test_diskless_resource_gets_marker() {
        let model = model(
            StoragePool::new("n1", "lvm0", ProviderKind::Lvm),
            VolumeDefinition::new(0, 4096),
            ResourceFlags {
                diskless: true,
                ..ResourceFlags::default()
            },
        );
        let converted = convert(&model).unwrap();
        assert_eq!(
            *volume0(&converted),
            StorageVlmData::DrbdDiskless {
                vlm_nr: VolumeNumber::new(0),
                usable_size_kib: 4096,
            }
        );
    }

    #[test]
    fn test_swordfish_descriptor_cached_once() {
        let vlm_props = Props::new().with_prop(
            KEY_SF_VLM_ODATA,
            "/redfish/v1/Volumes/1",
            Some(NAMESPC_INTERNAL_STORAGE_DRIVER),
        );
        let model = model(
            StoragePool::new("n1", "sf", ProviderKind::SwordfishTarget),
            VolumeDefinition::new(0, 1024).with_props(vlm_props),
            ResourceFlags::default(),
        );
        let first = volume0(&convert(&model).unwrap());
        let second = volume0(&convert(&model).unwrap());
        let first_dfn = first.sf_dfn().unwrap();
        assert_eq!(first_dfn.vlm_odata.as_deref(), Some("/redfish/v1/Volumes/1"));
        assert!(Arc::ptr_eq(first_dfn, second.sf_dfn().unwrap()));
    }

    #[test]
    fn test_layer_kind_as_provider_is_fatal() {
        let model = model(
            StoragePool::new("n1", "bad", ProviderKind::Layer(DeviceLayerKind::Luks)),
            VolumeDefinition::new(0, 1024),
            ResourceFlags::default(),
        );
        let err = convert(&model).unwrap_err();
        assert!(matches!(err, LayerError::ImplementationError { .. }));
        assert!(err.is_fatal());
    }
}
