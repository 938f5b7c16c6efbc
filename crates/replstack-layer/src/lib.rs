#![warn(missing_docs)]

//! replstack layer subsystem: layer stack composition for replicated block volumes
//!
//! Given a cluster model of resource definitions, resources, volumes and
//! storage pools, this crate decides which device layers (replication,
//! encryption, storage) each resource needs, builds the ordered layer stack,
//! fans replication data out to every replica of a definition, synthesizes
//! snapshot layer data and computes which resources and volumes can be
//! removed once they are marked deleted.

pub mod access;
pub mod config;
pub mod converter;
pub mod drbd;
pub mod error;
pub mod factory;
pub mod layer_data;
pub mod luks;
pub mod model;
pub mod numberpool;
pub mod predicates;
pub mod props;
pub mod reconcile;
pub mod records;
pub mod registry;
pub mod shared;
pub mod snapshot;
pub mod stack;
pub mod storage;
pub mod typed;
pub mod types;

pub use access::{AccessContext, AccessType, ObjectProtection};
pub use config::EngineConfig;
pub use converter::{ChildSlot, CompositionScope, Converted, LayerConverter, ParentLink, PriorLayer};
pub use drbd::DrbdConverter;
pub use error::{LayerError, LayerResult};
pub use factory::LayerDataFactory;
pub use layer_data::{
    CryptKey, DrbdRscData, DrbdRscDfnData, DrbdVlmData, DrbdVlmDfnData, LuksRscData, LuksVlmData,
    RscLayerData, RscLayerObject, SfVlmDfnData, SnapshotVlmData, StorageRscData, StorageVlmData,
};
pub use luks::LuksConverter;
pub use model::{
    ClusterModel, RemovalOutcome, RemovalPlan, Resource, ResourceDefinition, Snapshot,
    SnapshotVolume, StoragePool, Volume, VolumeDefinition,
};
pub use numberpool::{NumberPool, NumberRange};
pub use props::{PriorityProps, Props};
pub use reconcile::{
    BackingVolume, BackingVolumeLookup, DeletionReconciler, FailureMap, ModelBackingLookup,
};
pub use records::{records_of, snapshot_records, LayerRecord, LayerRecordKey, RecordFamily};
pub use registry::PeerRegistry;
pub use shared::SharedRecord;
pub use snapshot::{ensure_snapshot_layer_data, synthesize_snapshots, SnapshotReport};
pub use stack::{
    AllNodesPlacement, CompositionReport, LocalNodePlacement, PlacementLookup, StackBuilder,
};
pub use storage::StorageConverter;
pub use typed::split_typed_resources;
pub use types::{
    DeviceLayerKind, LayerRscId, MinorNumber, NodeId, NodeName, ProviderKind, ResourceFlags,
    ResourceKey, ResourceName, ResourceType, SnapshotKey, SnapshotName, TcpPort, TransportType,
    VolumeFlags, VolumeKey, VolumeNumber,
};
