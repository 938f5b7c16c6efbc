//! Encryption layer converter.
//!
//! One key per resource: it is read from the first volume definition of the
//! resource definition and used for every volume, whatever key the other
//! volume definitions carry.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::access::{AccessContext, AccessType};
use crate::converter::{prior_volumes, CompositionScope, Converted, LayerConverter, ParentLink};
use crate::error::LayerResult;
use crate::layer_data::{CryptKey, LuksRscData, RscLayerData, RscLayerObject};
use crate::model::{Resource, ResourceDefinition};
use crate::types::DeviceLayerKind;

/// Builds the encryption layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LuksConverter;

impl LuksConverter {
    /// Creates the converter.
    pub fn new() -> Self {
        LuksConverter
    }
}

fn resource_key(
    ctx: &AccessContext,
    rsc_dfn: &ResourceDefinition,
) -> LayerResult<Option<Arc<CryptKey>>> {
    let Some(first) = rsc_dfn.volume_definitions.values().next() else {
        return Ok(None);
    };
    first.protection.require_access(ctx, AccessType::View)?;
    Ok(first.crypt_key.clone().map(|bytes| Arc::new(CryptKey::new(bytes))))
}

impl LayerConverter for LuksConverter {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Luks
    }

    fn convert(
        &self,
        scope: &mut CompositionScope<'_>,
        rsc: &Resource,
        parent: Option<&ParentLink>,
    ) -> LayerResult<Converted> {
        let ctx = scope.ctx();
        let rsc_dfn = scope.model().resource_definition(&rsc.key.name)?;
        let mut key = resource_key(ctx, rsc_dfn)?;
        if key.is_none() {
            warn!(rsc = %rsc.key, "no encryption key on first volume definition");
        }

        let prior = scope.prior_layer(rsc, DeviceLayerKind::Luks);
        let id = scope.layer_id(prior.as_ref())?;
        let prior_vlms = prior_volumes(prior.as_ref(), |data| match data {
            RscLayerData::Luks(luks) => Some(&luks.volumes),
            _ => None,
        });
        // Keep sharing the prior key record while the key is unchanged.
        if let Some(prior_key) = prior_vlms.values().find_map(|vlm| vlm.key.clone()) {
            if key.as_deref() == Some(&*prior_key) {
                key = Some(prior_key);
            }
        }

        let mut volumes = BTreeMap::new();
        for vlm_nr in rsc.volumes.keys() {
            let prior_vlm = prior_vlms.get(vlm_nr);
            if rsc.volume_flags(ctx, *vlm_nr)?.delete {
                if let Some(prior_vlm) = prior_vlm {
                    volumes.insert(*vlm_nr, Arc::clone(prior_vlm));
                }
                continue;
            }
            let data = match prior_vlm {
                Some(prior_vlm) if prior_vlm.key.as_deref() == key.as_deref() => {
                    Arc::clone(prior_vlm)
                }
                _ => Arc::new(
                    scope
                        .model()
                        .factory()
                        .create_luks_vlm_data(*vlm_nr, key.clone()),
                ),
            };
            volumes.insert(*vlm_nr, data);
        }
        debug!(rsc = %rsc.key, volumes = volumes.len(), "built encryption layer");

        Ok(Converted::new(RscLayerObject::new(
            id,
            rsc.key.clone(),
            parent.map(|p| p.id),
            RscLayerData::Luks(LuksRscData { volumes }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{ClusterModel, StoragePool, Volume, VolumeDefinition};
    use crate::registry::PeerRegistry;
    use crate::types::{LayerRscId, ProviderKind, ResourceKey, VolumeNumber};

    fn model(first_key: Option<&[u8]>) -> ClusterModel {
        let mut model = ClusterModel::new(EngineConfig::default()).unwrap();
        model.add_storage_pool(StoragePool::new("n1", "lvm0", ProviderKind::Lvm)).unwrap();
        let first = VolumeDefinition::new(0, 1024);
        let first = match first_key {
            Some(k) => first.with_encryption(Some(k.to_vec())),
            None => first,
        };
        let second = VolumeDefinition::new(1, 1024).with_encryption(Some(b"second".to_vec()));
        model
            .add_resource_definition(
                ResourceDefinition::new("data1", 7000)
                    .with_volume_definition(first)
                    .with_volume_definition(second),
            )
            .unwrap();
        model
            .add_resource(
                Resource::new(ResourceKey::new("n1", "data1"), 0)
                    .with_volume(Volume::new(0, "lvm0"))
                    .with_volume(Volume::new(1, "lvm0")),
            )
            .unwrap();
        model
    }

    #[test]
    fn test_first_volume_key_applies_to_all() {
        let model = model(Some(&b"first"[..]));
        let ctx = AccessContext::system();
        let registry = PeerRegistry::new();
        let mut scope = CompositionScope::new(&model, &ctx, &registry);
        let rsc = model.resource(&ResourceKey::new("n1", "data1")).unwrap();
        let parent = ParentLink {
            id: LayerRscId::new(9),
            kind: DeviceLayerKind::Drbd,
        };
        let converted = LuksConverter::new().convert(&mut scope, rsc, Some(&parent)).unwrap();
        assert_eq!(converted.object.parent_id, Some(LayerRscId::new(9)));

        let luks = converted.object.luks().unwrap();
        assert_eq!(luks.volumes.len(), 2);
        let keys: Vec<_> = luks.volumes.values().map(|v| v.key.clone().unwrap()).collect();
        assert_eq!(keys[0].as_bytes(), b"first");
        assert!(Arc::ptr_eq(&keys[0], &keys[1]));
    }

    #[test]
    fn test_unencrypted_first_volume_yields_no_key() {
        let model = model(None);
        let ctx = AccessContext::system();
        let registry = PeerRegistry::new();
        let mut scope = CompositionScope::new(&model, &ctx, &registry);
        let rsc = model.resource(&ResourceKey::new("n1", "data1")).unwrap();
        let converted = LuksConverter::new().convert(&mut scope, rsc, None).unwrap();
        let luks = converted.object.luks().unwrap();
        assert!(luks.volumes.values().all(|v| !v.has_key()));
        assert!(luks.volumes.contains_key(&VolumeNumber::new(1)));
    }
}
