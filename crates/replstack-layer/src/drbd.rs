//! Replication layer converter with replica fan-out.
//!
//! Converting one resource also builds the replication object of every other
//! resource of the same definition. All of them share the definition's single
//! [`DrbdRscDfnData`] and, per volume slot, the single [`DrbdVlmDfnData`]
//! cached on the volume definition.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::access::AccessType;
use crate::converter::{prior_volumes, CompositionScope, Converted, LayerConverter, ParentLink};
use crate::error::{LayerError, LayerResult};
use crate::layer_data::{
    DrbdRscData, DrbdRscDfnData, DrbdVlmData, DrbdVlmDfnData, RscLayerData, RscLayerObject,
};
use crate::model::{ClusterModel, Resource, ResourceDefinition};
use crate::props::keys::{
    KEY_AL_STRIPES, KEY_AL_STRIPE_SIZE, KEY_PEER_SLOTS_NEW_RESOURCE, NAMESPC_DRBD_OPTIONS,
};
use crate::props::PriorityProps;
use crate::types::{DeviceLayerKind, LayerRscId, VolumeNumber};

/// Builds the replication layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrbdConverter;

/// Fails unless `peer_slots` covers every resource of `rsc_dfn`.
fn check_peer_slots(
    model: &ClusterModel,
    rsc_dfn: &ResourceDefinition,
    peer_slots: u16,
) -> LayerResult<()> {
    let resource_count = model.resources_of(&rsc_dfn.name).count();
    if (peer_slots as usize) < resource_count {
        return Err(LayerError::InsufficientPeerSlots {
            rsc_name: rsc_dfn.name.to_string(),
            peer_slots,
            resource_count,
        });
    }
    Ok(())
}

impl DrbdConverter {
    /// Creates the converter.
    pub fn new() -> Self {
        DrbdConverter
    }

    /// Peer slots applied to `rsc`: its own prop, else the definition's, else
    /// the configured default. Checked against the replica count.
    fn resource_peer_slots(
        &self,
        scope: &CompositionScope<'_>,
        rsc: &Resource,
        rsc_dfn: &ResourceDefinition,
    ) -> LayerResult<u16> {
        let model = scope.model();
        let ctx = scope.ctx();
        let peer_slots = PriorityProps::new(vec![rsc.props(ctx)?, rsc_dfn.props(ctx)?])
            .get_parsed::<u16>(KEY_PEER_SLOTS_NEW_RESOURCE, None)?
            .unwrap_or(model.config().default_peer_slots);
        check_peer_slots(model, rsc_dfn, peer_slots)?;
        Ok(peer_slots)
    }

    /// Cached definition record, created on first use.
    fn ensure_rsc_dfn_data(
        &self,
        scope: &CompositionScope<'_>,
        rsc_dfn: &ResourceDefinition,
    ) -> LayerResult<Arc<DrbdRscDfnData>> {
        let model = scope.model();
        let ctx = scope.ctx();
        rsc_dfn.protection.require_access(ctx, AccessType::Change)?;

        let (data, created) = rsc_dfn.drbd.get_or_try_init(|| {
            let config = model.config();
            let props = rsc_dfn.props(ctx)?;
            let peer_slots = props
                .get_parsed::<u16>(KEY_PEER_SLOTS_NEW_RESOURCE, None)?
                .unwrap_or(config.default_peer_slots);
            check_peer_slots(model, rsc_dfn, peer_slots)?;
            let al_stripes = props
                .get_parsed::<u32>(KEY_AL_STRIPES, Some(NAMESPC_DRBD_OPTIONS))?
                .unwrap_or(config.default_al_stripes);
            let al_stripe_size_kib = props
                .get_parsed::<u64>(KEY_AL_STRIPE_SIZE, Some(NAMESPC_DRBD_OPTIONS))?
                .unwrap_or(config.default_al_stripe_size_kib);
            let secret = match &rsc_dfn.secret {
                Some(secret) => secret.clone(),
                None => model.factory().generate_secret(),
            };
            Ok(model.factory().create_drbd_rsc_dfn_data(
                rsc_dfn.name.clone(),
                rsc_dfn.port,
                rsc_dfn.transport,
                secret,
                peer_slots,
                al_stripes,
                al_stripe_size_kib,
            ))
        })?;

        debug!(rsc = %rsc_dfn.name, created, "replication definition record");
        Ok(data)
    }

    /// Cached volume definition records of every volume slot, created on
    /// first use with `peer_slots`.
    fn ensure_vlm_dfn_data(
        &self,
        scope: &CompositionScope<'_>,
        rsc_dfn: &ResourceDefinition,
        peer_slots: u16,
    ) -> LayerResult<BTreeMap<VolumeNumber, Arc<DrbdVlmDfnData>>> {
        let factory = scope.model().factory();
        let mut records = BTreeMap::new();
        for vlm_dfn in rsc_dfn.volume_definitions.values() {
            vlm_dfn.protection.require_access(scope.ctx(), AccessType::Change)?;
            let (data, created) = vlm_dfn.drbd.get_or_try_init(|| {
                factory.create_drbd_vlm_dfn_data(
                    rsc_dfn.name.clone(),
                    vlm_dfn.vlm_nr,
                    vlm_dfn.minor,
                    peer_slots,
                )
            })?;
            debug!(
                rsc = %rsc_dfn.name,
                vlm_nr = %vlm_dfn.vlm_nr,
                minor = %data.minor,
                created,
                "replication volume record"
            );
            records.insert(vlm_dfn.vlm_nr, data);
        }
        Ok(records)
    }

    fn build_object(
        &self,
        scope: &mut CompositionScope<'_>,
        rsc: &Resource,
        parent_id: Option<LayerRscId>,
        dfn: &Arc<DrbdRscDfnData>,
        vlm_dfns: &BTreeMap<VolumeNumber, Arc<DrbdVlmDfnData>>,
        peer_slots: u16,
    ) -> LayerResult<RscLayerObject> {
        let ctx = scope.ctx();
        let flags = rsc.flags(ctx)?;
        let prior = scope.prior_layer(rsc, DeviceLayerKind::Drbd);
        let id = scope.layer_id(prior.as_ref())?;
        let prior_vlms = prior_volumes(prior.as_ref(), |data| match data {
            RscLayerData::Drbd(drbd) => Some(&drbd.volumes),
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
            let vlm_dfn = vlm_dfns.get(vlm_nr).ok_or_else(|| LayerError::NotFound {
                what: format!("volume definition {}/{}", rsc.key.name, vlm_nr),
            })?;
            let data = match prior_vlm {
                Some(prior_vlm) if Arc::ptr_eq(&prior_vlm.dfn, vlm_dfn) => Arc::clone(prior_vlm),
                _ => Arc::new(DrbdVlmData {
                    vlm_nr: *vlm_nr,
                    dfn: Arc::clone(vlm_dfn),
                }),
            };
            volumes.insert(*vlm_nr, data);
        }

        let data = DrbdRscData {
            dfn: Arc::clone(dfn),
            node_id: rsc.node_id,
            peer_slots,
            al_stripes: dfn.al_stripes,
            al_stripe_size_kib: dfn.al_stripe_size_kib,
            diskless: flags.diskless,
            volumes,
        };
        Ok(RscLayerObject::new(id, rsc.key.clone(), parent_id, RscLayerData::Drbd(data)))
    }
}

impl LayerConverter for DrbdConverter {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Drbd
    }

    fn convert(
        &self,
        scope: &mut CompositionScope<'_>,
        rsc: &Resource,
        parent: Option<&ParentLink>,
    ) -> LayerResult<Converted> {
        let model = scope.model();
        let rsc_dfn = model.resource_definition(&rsc.key.name)?;

        let peer_slots = self.resource_peer_slots(scope, rsc, rsc_dfn)?;
        let dfn = self.ensure_rsc_dfn_data(scope, rsc_dfn)?;
        let vlm_dfns = self.ensure_vlm_dfn_data(scope, rsc_dfn, peer_slots)?;

        let parent_id = parent.map(|p| p.id);
        let local = self.build_object(scope, rsc, parent_id, &dfn, &vlm_dfns, peer_slots)?;

        for peer in model.resources_of(&rsc.key.name) {
            if peer.key == rsc.key {
                continue;
            }
            let peer_slots = match self.resource_peer_slots(scope, peer, rsc_dfn) {
                Ok(peer_slots) => peer_slots,
                Err(err @ LayerError::InsufficientPeerSlots { .. }) => {
                    warn!(rsc = %rsc.key, peer = %peer.key, error = %err, "peer not admitted");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let obj = self.build_object(scope, peer, None, &dfn, &vlm_dfns, peer_slots)?;
            debug!(
                rsc = %rsc.key,
                peer = %peer.key,
                layer_rsc_id = %obj.id,
                "built peer replication object"
            );
            scope.stage_peer(obj);
        }

        Ok(Converted::new(local))
    }
}
