//! Identifiers, names and kinds shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LayerError;

/// Name of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    /// Creates a new node name.
    pub fn new(name: impl Into<String>) -> Self {
        NodeName(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster-wide name of a resource definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    /// Creates a new resource name.
    pub fn new(name: impl Into<String>) -> Self {
        ResourceName(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the backing object (LVM logical volume, ZFS dataset) for one
    /// volume of this resource. Stable across nodes and invocations.
    pub fn volume_identifier(&self, vlm_nr: VolumeNumber) -> String {
        format!("{}_{:05}", self.0, vlm_nr.as_u32())
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a point-in-time snapshot of a resource definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotName(String);

impl SnapshotName {
    /// Creates a new snapshot name.
    pub fn new(name: impl Into<String>) -> Self {
        SnapshotName(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of a volume slot within a resource definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeNumber(u32);

impl VolumeNumber {
    /// Creates a new volume number.
    pub fn new(nr: u32) -> Self {
        VolumeNumber(nr)
    }

    /// Returns the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one layer object, unique across the cluster model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerRscId(u32);

impl LayerRscId {
    /// Creates a new layer resource id.
    pub fn new(id: u32) -> Self {
        LayerRscId(id)
    }

    /// Returns the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LayerRscId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication device minor number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinorNumber(u32);

impl MinorNumber {
    /// Creates a new minor number.
    pub fn new(nr: u32) -> Self {
        MinorNumber(nr)
    }

    /// Returns the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MinorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TCP port used by the replication layer of one resource definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpPort(u16);

impl TcpPort {
    /// Creates a new port.
    pub fn new(port: u16) -> Self {
        TcpPort(port)
    }

    /// Returns the raw value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for TcpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication-layer node id of one resource among its peers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u16);

impl NodeId {
    /// Creates a new node id.
    pub fn new(id: u16) -> Self {
        NodeId(id)
    }

    /// Returns the raw value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport used by the replication layer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportType {
    /// TCP/IP.
    #[default]
    Ip,
    /// RDMA.
    Rdma,
    /// Reliable datagram sockets.
    Rd,
}

impl TransportType {
    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Ip => "IP",
            TransportType::Rdma => "RDMA",
            TransportType::Rd => "RD",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [TransportType::Ip, TransportType::Rdma, TransportType::Rd]
            .into_iter()
            .find(|transport| transport.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| LayerError::implementation(format!("unknown transport '{}'", s)))
    }
}

impl TryFrom<String> for TransportType {
    type Error = LayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportType> for String {
    fn from(transport: TransportType) -> Self {
        transport.as_str().to_string()
    }
}

/// Kind of a device layer in a resource's stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceLayerKind {
    /// Synchronous block replication.
    Drbd,
    /// Block-level encryption.
    Luks,
    /// Storage backing, always the bottom layer.
    Storage,
}

impl DeviceLayerKind {
    /// All layer kinds from top to bottom of a stack.
    pub const TOP_DOWN: [DeviceLayerKind; 3] = [
        DeviceLayerKind::Drbd,
        DeviceLayerKind::Luks,
        DeviceLayerKind::Storage,
    ];

    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceLayerKind::Drbd => "DRBD",
            DeviceLayerKind::Luks => "LUKS",
            DeviceLayerKind::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for DeviceLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider kind advertised by a storage pool.
///
/// `Layer` exists because pool kinds are read from stored configuration: a
/// pool record naming a device layer instead of a leaf provider parses, but
/// every consumer treats it as an internal-consistency fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    /// Diskless replica, no backing device.
    DrbdDiskless,
    /// Thick LVM.
    Lvm,
    /// Thin LVM.
    LvmThin,
    /// ZFS zvol.
    Zfs,
    /// Thin (sparse) ZFS zvol.
    ZfsThin,
    /// Disaggregated remote volume, initiator side.
    SwordfishInitiator,
    /// Disaggregated remote volume, target side.
    SwordfishTarget,
    /// A layer kind recorded where a provider was expected.
    Layer(DeviceLayerKind),
}

impl ProviderKind {
    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::DrbdDiskless => "DRBD_DISKLESS",
            ProviderKind::Lvm => "LVM",
            ProviderKind::LvmThin => "LVM_THIN",
            ProviderKind::Zfs => "ZFS",
            ProviderKind::ZfsThin => "ZFS_THIN",
            ProviderKind::SwordfishInitiator => "SWORDFISH_INITIATOR",
            ProviderKind::SwordfishTarget => "SWORDFISH_TARGET",
            ProviderKind::Layer(kind) => kind.as_str(),
        }
    }

    /// Whether a pool of this kind can host the replication layer, unless the
    /// pool overrides it.
    pub fn supports_replication(&self) -> bool {
        match self {
            ProviderKind::DrbdDiskless
            | ProviderKind::Lvm
            | ProviderKind::LvmThin
            | ProviderKind::Zfs
            | ProviderKind::ZfsThin => true,
            ProviderKind::SwordfishInitiator
            | ProviderKind::SwordfishTarget
            | ProviderKind::Layer(_) => false,
        }
    }

    /// Whether point-in-time snapshots can exist on this kind.
    pub fn supports_snapshots(&self) -> bool {
        matches!(
            self,
            ProviderKind::LvmThin | ProviderKind::Zfs | ProviderKind::ZfsThin
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_uppercase().as_str() {
            "DRBD_DISKLESS" | "DISKLESS" => ProviderKind::DrbdDiskless,
            "LVM" => ProviderKind::Lvm,
            "LVM_THIN" => ProviderKind::LvmThin,
            "ZFS" => ProviderKind::Zfs,
            "ZFS_THIN" => ProviderKind::ZfsThin,
            "SWORDFISH_INITIATOR" => ProviderKind::SwordfishInitiator,
            "SWORDFISH_TARGET" => ProviderKind::SwordfishTarget,
            "DRBD" => ProviderKind::Layer(DeviceLayerKind::Drbd),
            "LUKS" => ProviderKind::Layer(DeviceLayerKind::Luks),
            "STORAGE" => ProviderKind::Layer(DeviceLayerKind::Storage),
            _ => {
                return Err(LayerError::implementation(format!(
                    "unknown storage provider kind '{}'",
                    s
                )))
            }
        };
        Ok(kind)
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = LayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Tag distinguishing the authoritative resource from its per-layer split.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// The authoritative, not-yet-layer-split instance.
    #[default]
    Default,
    /// A per-layer resource derived from a default resource.
    Typed(DeviceLayerKind),
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Default => f.write_str("DEFAULT"),
            ResourceType::Typed(kind) => write!(f, "{}", kind),
        }
    }
}

/// Identity of one resource in the cluster model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Node the resource is placed on.
    pub node: NodeName,
    /// Resource definition name.
    pub name: ResourceName,
    /// Default or typed.
    pub rsc_type: ResourceType,
}

impl ResourceKey {
    /// Key of a default resource.
    pub fn new(node: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node: NodeName::new(node),
            name: ResourceName::new(name),
            rsc_type: ResourceType::Default,
        }
    }

    /// Key of the typed resource for `kind` sharing node and name with `self`.
    pub fn typed(&self, kind: DeviceLayerKind) -> Self {
        Self {
            node: self.node.clone(),
            name: self.name.clone(),
            rsc_type: ResourceType::Typed(kind),
        }
    }

    /// Returns true for the authoritative instance.
    pub fn is_default(&self) -> bool {
        self.rsc_type == ResourceType::Default
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rsc_type {
            ResourceType::Default => write!(f, "{}/{}", self.node, self.name),
            ResourceType::Typed(kind) => write!(f, "{}/{}/{}", self.node, self.name, kind),
        }
    }
}

/// Identity of one volume in the cluster model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    /// Owning resource.
    pub rsc: ResourceKey,
    /// Volume number within the resource.
    pub vlm_nr: VolumeNumber,
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rsc, self.vlm_nr)
    }
}

/// Identity of one snapshot of one resource on one node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    /// Node the snapshot was taken on.
    pub node: NodeName,
    /// Resource definition name.
    pub rsc_name: ResourceName,
    /// Snapshot name.
    pub snap_name: SnapshotName,
}

impl SnapshotKey {
    /// Creates a new snapshot key.
    pub fn new(
        node: impl Into<String>,
        rsc_name: impl Into<String>,
        snap_name: impl Into<String>,
    ) -> Self {
        Self {
            node: NodeName::new(node),
            rsc_name: ResourceName::new(rsc_name),
            snap_name: SnapshotName::new(snap_name),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.node, self.rsc_name, self.snap_name)
    }
}

/// State flags of a resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceFlags {
    /// The user removed the resource; physical removal is pending.
    pub delete: bool,
    /// The resource has no local backing storage.
    pub diskless: bool,
}

/// State flags of a volume.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeFlags {
    /// The volume was removed; physical removal is pending.
    pub delete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_serde_name_matches_display() {
        for transport in [TransportType::Ip, TransportType::Rdma, TransportType::Rd] {
            let json = serde_json::to_string(&transport).unwrap();
            assert_eq!(json, format!("\"{}\"", transport));
            assert_eq!(serde_json::from_str::<TransportType>(&json).unwrap(), transport);
        }
        assert_eq!("rdma".parse::<TransportType>().unwrap(), TransportType::Rdma);
        assert!("tcp".parse::<TransportType>().is_err());
    }

    #[test]
    fn test_volume_identifier_format() {
        let name = ResourceName::new("data1");
        assert_eq!(name.volume_identifier(VolumeNumber::new(0)), "data1_00000");
        assert_eq!(name.volume_identifier(VolumeNumber::new(42)), "data1_00042");
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("lvm_thin".parse::<ProviderKind>().unwrap(), ProviderKind::LvmThin);
        assert_eq!("ZFS".parse::<ProviderKind>().unwrap(), ProviderKind::Zfs);
        assert_eq!(
            "DRBD".parse::<ProviderKind>().unwrap(),
            ProviderKind::Layer(DeviceLayerKind::Drbd)
        );
        let err = "CEPH".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, LayerError::ImplementationError { .. }));
    }

    #[test]
    fn test_provider_kind_capabilities() {
        assert!(ProviderKind::Lvm.supports_replication());
        assert!(ProviderKind::DrbdDiskless.supports_replication());
        assert!(!ProviderKind::SwordfishTarget.supports_replication());
        assert!(!ProviderKind::Lvm.supports_snapshots());
        assert!(ProviderKind::LvmThin.supports_snapshots());
        assert!(ProviderKind::ZfsThin.supports_snapshots());
    }

    #[test]
    fn test_provider_kind_serde() {
        let json = serde_json::to_string(&ProviderKind::SwordfishInitiator).unwrap();
        assert_eq!(json, "\"SWORDFISH_INITIATOR\"");
        let back: ProviderKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProviderKind::SwordfishInitiator);
        assert!(serde_json::from_str::<ProviderKind>("\"TAPE\"").is_err());
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new("n1", "data1");
        assert_eq!(key.to_string(), "n1/data1");
        assert!(key.is_default());
        let typed = key.typed(DeviceLayerKind::Storage);
        assert_eq!(typed.to_string(), "n1/data1/STORAGE");
        assert!(!typed.is_default());
    }

    #[test]
    fn test_layer_order() {
        assert_eq!(
            DeviceLayerKind::TOP_DOWN,
            [DeviceLayerKind::Drbd, DeviceLayerKind::Luks, DeviceLayerKind::Storage]
        );
    }
}
