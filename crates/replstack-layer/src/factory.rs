//! Constructors for layer records and the number pools they draw from.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::LayerResult;
use crate::layer_data::{
    CryptKey, DrbdRscDfnData, DrbdVlmDfnData, LuksVlmData, SfVlmDfnData, SnapshotVlmData,
    StorageVlmData,
};
use crate::numberpool::NumberPool;
use crate::types::{
    LayerRscId, MinorNumber, ProviderKind, ResourceName, TcpPort, TransportType, VolumeNumber,
};

/// Builds layer records. Owns the minor-number and layer-id pools.
#[derive(Debug)]
pub struct LayerDataFactory {
    config: EngineConfig,
    layer_ids: NumberPool,
    minors: NumberPool,
}

impl LayerDataFactory {
    /// Creates a factory with empty pools sized from `config`.
    pub fn new(config: EngineConfig) -> Self {
        let layer_ids = NumberPool::new("layer-rsc-ids", config.layer_id_range);
        let minors = NumberPool::new("minor-numbers", config.minor_range);
        Self {
            config,
            layer_ids,
            minors,
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the minor number pool.
    pub fn minors(&self) -> &NumberPool {
        &self.minors
    }

    /// Returns the layer id pool.
    pub fn layer_ids(&self) -> &NumberPool {
        &self.layer_ids
    }

    /// Allocates a fresh layer resource id.
    pub fn next_layer_id(&self) -> LayerResult<LayerRscId> {
        self.layer_ids.auto_allocate().map(LayerRscId::new)
    }

    /// Returns a layer resource id to the pool. Releasing twice is a no-op.
    pub fn release_layer_id(&self, id: LayerRscId) -> LayerResult<()> {
        if self.layer_ids.deallocate(id.as_u32())? {
            debug!(layer_rsc_id = %id, "released layer id");
        }
        Ok(())
    }

    /// Marks `id` as used, e.g. when loading previously persisted stacks.
    pub fn reserve_layer_id(&self, id: LayerRscId) -> LayerResult<bool> {
        self.layer_ids.allocate(id.as_u32())
    }

    /// Marks `minor` as used.
    pub fn reserve_minor(&self, minor: MinorNumber) -> LayerResult<bool> {
        self.minors.allocate(minor.as_u32())
    }

    /// Random alphanumeric shared secret of the configured length.
    pub fn generate_secret(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.config.secret_length)
            .map(char::from)
            .collect()
    }

    /// Replication definition record of `rsc_name`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_drbd_rsc_dfn_data(
        &self,
        rsc_name: ResourceName,
        port: TcpPort,
        transport: TransportType,
        secret: String,
        peer_slots: u16,
        al_stripes: u32,
        al_stripe_size_kib: u64,
    ) -> DrbdRscDfnData {
        DrbdRscDfnData {
            rsc_name,
            port,
            transport,
            secret,
            peer_slots,
            al_stripes,
            al_stripe_size_kib,
        }
    }

    /// Uses `minor` when given (it must have been reserved by whoever assigned
    /// it), otherwise allocates the lowest free minor number.
    pub fn create_drbd_vlm_dfn_data(
        &self,
        rsc_name: ResourceName,
        vlm_nr: VolumeNumber,
        minor: Option<MinorNumber>,
        peer_slots: u16,
    ) -> LayerResult<DrbdVlmDfnData> {
        let minor = match minor {
            Some(minor) => {
                self.reserve_minor(minor)?;
                minor
            }
            None => MinorNumber::new(self.minors.auto_allocate()?),
        };
        debug!(
            rsc = %rsc_name,
            vlm_nr = %vlm_nr,
            minor = %minor,
            "created replication volume definition record"
        );
        Ok(DrbdVlmDfnData {
            rsc_name,
            vlm_nr,
            minor,
            peer_slots,
        })
    }

    /// Encryption data of one volume.
    pub fn create_luks_vlm_data(
        &self,
        vlm_nr: VolumeNumber,
        key: Option<Arc<CryptKey>>,
    ) -> LuksVlmData {
        LuksVlmData { vlm_nr, key }
    }

    /// Remote descriptor of one volume definition.
    pub fn create_sf_vlm_dfn_data(
        &self,
        rsc_name: ResourceName,
        vlm_nr: VolumeNumber,
        vlm_odata: Option<String>,
    ) -> SfVlmDfnData {
        SfVlmDfnData {
            rsc_name,
            vlm_nr,
            vlm_odata,
        }
    }

    /// Diskless marker of one volume.
    pub fn create_diskless_data(
        &self,
        vlm_nr: VolumeNumber,
        usable_size_kib: u64,
    ) -> StorageVlmData {
        StorageVlmData::DrbdDiskless {
            vlm_nr,
            usable_size_kib,
        }
    }

    /// Thick logical volume data.
    pub fn create_lvm_data(
        &self,
        vlm_nr: VolumeNumber,
        volume_group: String,
        identifier: String,
    ) -> StorageVlmData {
        StorageVlmData::Lvm {
            vlm_nr,
            volume_group,
            identifier,
        }
    }

    /// Thin logical volume data.
    pub fn create_lvm_thin_data(
        &self,
        vlm_nr: VolumeNumber,
        volume_group: String,
        thin_pool: String,
        identifier: String,
    ) -> StorageVlmData {
        StorageVlmData::LvmThin {
            vlm_nr,
            volume_group,
            thin_pool,
            identifier,
        }
    }

    /// Zvol data; `kind` is `Zfs` or `ZfsThin`.
    pub fn create_zfs_data(
        &self,
        vlm_nr: VolumeNumber,
        zpool: String,
        identifier: String,
        kind: ProviderKind,
    ) -> StorageVlmData {
        StorageVlmData::Zfs {
            vlm_nr,
            zpool,
            identifier,
            kind,
        }
    }

    /// Remote volume data of an attaching node.
    pub fn create_sf_initiator_data(
        &self,
        vlm_nr: VolumeNumber,
        dfn: Arc<SfVlmDfnData>,
    ) -> StorageVlmData {
        StorageVlmData::SwordfishInitiator { vlm_nr, dfn }
    }

    /// Remote volume data of the exporting node.
    pub fn create_sf_target_data(
        &self,
        vlm_nr: VolumeNumber,
        dfn: Arc<SfVlmDfnData>,
    ) -> StorageVlmData {
        StorageVlmData::SwordfishTarget { vlm_nr, dfn }
    }

    /// Thin snapshot volume data.
    pub fn create_snapshot_lvm_thin_data(
        &self,
        volume_group: String,
        thin_pool: String,
        identifier: String,
    ) -> SnapshotVlmData {
        SnapshotVlmData::LvmThin {
            volume_group,
            thin_pool,
            identifier,
        }
    }

    /// ZFS snapshot volume data.
    pub fn create_snapshot_zfs_data(
        &self,
        zpool: String,
        identifier: String,
        kind: ProviderKind,
    ) -> SnapshotVlmData {
        SnapshotVlmData::Zfs {
            zpool,
            identifier,
            kind,
        }
    }
}
