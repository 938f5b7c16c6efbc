//! Namespaced property store.
//!
//! Keys are `/`-separated paths. A lookup takes an optional namespace that is
//! prepended to the key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{LayerError, LayerResult};

/// Well-known property keys, namespaces and their defaults.
pub mod keys {
    /// Peer-slot count for new replication resources.
    pub const KEY_PEER_SLOTS_NEW_RESOURCE: &str = "PeerSlotsNewResource";

    /// Namespace of replication options on a resource definition.
    pub const NAMESPC_DRBD_OPTIONS: &str = "DrbdOptions";
    /// Activity-log stripe count.
    pub const KEY_AL_STRIPES: &str = "AlStripes";
    /// Activity-log stripe size in KiB.
    pub const KEY_AL_STRIPE_SIZE: &str = "AlStripeSizeKib";

    /// Namespace of storage driver properties on a storage pool.
    pub const NAMESPC_STORAGE_DRIVER: &str = "StorDriver";
    /// Namespace of engine-maintained storage driver properties.
    pub const NAMESPC_INTERNAL_STORAGE_DRIVER: &str = "Internal/StorDriver";

    /// LVM volume group of a pool.
    pub const KEY_LVM_VOLUME_GROUP: &str = "LvmVg";
    /// LVM thin pool of a pool.
    pub const KEY_LVM_THIN_POOL: &str = "ThinPool";
    /// ZFS pool of a ZFS pool.
    pub const KEY_ZFS_POOL: &str = "ZPool";
    /// ZFS pool of a ZFS-thin pool.
    pub const KEY_ZFS_THIN_POOL: &str = "ZPoolThin";
    /// Remote object reference of a disaggregated volume.
    pub const KEY_SF_VLM_ODATA: &str = "SfVlmOdata";

    /// Volume group used when a pool does not name one.
    pub const DEFAULT_LVM_VOLUME_GROUP: &str = "drbdpool";
    /// Thin pool used when a pool does not name one.
    pub const DEFAULT_LVM_THIN_POOL: &str = "thinpool";
    /// ZFS pool used when a pool does not name one.
    pub const DEFAULT_ZFS_POOL: &str = "drbdpool";
}

/// Ordered key/value property container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props {
    map: BTreeMap<String, String>,
}

fn full_key(key: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns.trim_end_matches('/'), key),
        _ => key.to_string(),
    }
}

impl Props {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` within `namespace`, returning the previous value.
    pub fn set_prop(
        &mut self,
        key: &str,
        value: impl Into<String>,
        namespace: Option<&str>,
    ) -> Option<String> {
        self.map.insert(full_key(key, namespace), value.into())
    }

    /// Builder-style [`Props::set_prop`].
    pub fn with_prop(
        mut self,
        key: &str,
        value: impl Into<String>,
        namespace: Option<&str>,
    ) -> Self {
        self.set_prop(key, value, namespace);
        self
    }

    /// Returns the value of `key` within `namespace`.
    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Option<&str> {
        self.map.get(&full_key(key, namespace)).map(String::as_str)
    }

    /// Returns the value of `key` or `default` when absent.
    pub fn get_prop_or<'a>(
        &'a self,
        key: &str,
        namespace: Option<&str>,
        default: &'a str,
    ) -> &'a str {
        self.get_prop(key, namespace).unwrap_or(default)
    }

    /// Removes `key` within `namespace`.
    pub fn remove_prop(&mut self, key: &str, namespace: Option<&str>) -> Option<String> {
        self.map.remove(&full_key(key, namespace))
    }

    /// Parses the value of `key`. Absent keys yield `Ok(None)`; malformed
    /// values yield [`LayerError::PropertyFormat`].
    pub fn get_parsed<T: FromStr>(
        &self,
        key: &str,
        namespace: Option<&str>,
    ) -> LayerResult<Option<T>> {
        parse_value(&full_key(key, namespace), self.get_prop(key, namespace))
    }

    /// Iterates over all entries directly or transitively inside `namespace`,
    /// yielding keys relative to it.
    pub fn namespace<'a>(
        &'a self,
        namespace: &str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let prefix = format!("{}/", namespace.trim_end_matches('/'));
        self.map.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix.as_str()).map(|rest| (rest, v.as_str()))
        })
    }

    /// Iterates over all entries with fully qualified keys.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Checks if the container holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parse_value<T: FromStr>(key: &str, raw: Option<&str>) -> LayerResult<Option<T>> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| LayerError::PropertyFormat {
                key: key.to_string(),
                value: value.to_string(),
                expected: std::any::type_name::<T>().to_string(),
            }),
    }
}

/// Resolves keys across several containers, first hit wins.
#[derive(Debug, Default)]
pub struct PriorityProps<'a> {
    layers: Vec<&'a Props>,
}

impl<'a> PriorityProps<'a> {
    /// Creates a resolver over `layers`, highest priority first.
    pub fn new(layers: Vec<&'a Props>) -> Self {
        Self { layers }
    }

    /// Appends a lower-priority container.
    pub fn push(&mut self, props: &'a Props) {
        self.layers.push(props);
    }

    /// Returns the first value of `key` found.
    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Option<&'a str> {
        self.layers
            .iter()
            .find_map(|props| props.get_prop(key, namespace))
    }

    /// Parses the first value of `key` found.
    pub fn get_parsed<T: FromStr>(
        &self,
        key: &str,
        namespace: Option<&str>,
    ) -> LayerResult<Option<T>> {
        parse_value(&full_key(key, namespace), self.get_prop(key, namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::keys::*;
    use super::*;

    #[test]
    fn test_namespaced_lookup() {
        let props =
            Props::new().with_prop(KEY_LVM_VOLUME_GROUP, "vg0", Some(NAMESPC_STORAGE_DRIVER));
        assert_eq!(
            props.get_prop(KEY_LVM_VOLUME_GROUP, Some(NAMESPC_STORAGE_DRIVER)),
            Some("vg0")
        );
        assert_eq!(props.get_prop("StorDriver/LvmVg", None), Some("vg0"));
        assert_eq!(props.get_prop(KEY_LVM_VOLUME_GROUP, None), None);
    }

    #[test]
    fn test_get_prop_or_default() {
        let props = Props::new();
        let namespace = Some(NAMESPC_STORAGE_DRIVER);
        let thin_pool = props.get_prop_or(KEY_LVM_THIN_POOL, namespace, DEFAULT_LVM_THIN_POOL);
        assert_eq!(thin_pool, "thinpool");
    }

    #[test]
    fn test_get_parsed() {
        let mut props = Props::new();
        assert_eq!(props.get_parsed::<u16>(KEY_PEER_SLOTS_NEW_RESOURCE, None).unwrap(), None);

        props.set_prop(KEY_PEER_SLOTS_NEW_RESOURCE, " 12 ", None);
        assert_eq!(props.get_parsed::<u16>(KEY_PEER_SLOTS_NEW_RESOURCE, None).unwrap(), Some(12));

        props.set_prop(KEY_PEER_SLOTS_NEW_RESOURCE, "lots", None);
        let err = props.get_parsed::<u16>(KEY_PEER_SLOTS_NEW_RESOURCE, None).unwrap_err();
        assert!(matches!(
            err,
            LayerError::PropertyFormat { ref key, ref value, .. }
                if key == "PeerSlotsNewResource" && value == "lots"
        ));
    }

    #[test]
    fn test_namespace_iteration() {
        let props = Props::new()
            .with_prop("LvmVg", "vg0", Some("StorDriver"))
            .with_prop("ThinPool", "tp0", Some("StorDriver"))
            .with_prop("Other", "x", None);
        let entries: Vec<_> = props.namespace("StorDriver").collect();
        assert_eq!(entries, vec![("LvmVg", "vg0"), ("ThinPool", "tp0")]);
    }

    #[test]
    fn test_remove_prop() {
        let mut props = Props::new().with_prop("a", "1", Some("ns"));
        assert_eq!(props.remove_prop("a", Some("ns")), Some("1".to_string()));
        assert!(props.is_empty());
    }

    #[test]
    fn test_priority_props() {
        let high = Props::new().with_prop(KEY_PEER_SLOTS_NEW_RESOURCE, "3", None);
        let low = Props::new()
            .with_prop(KEY_PEER_SLOTS_NEW_RESOURCE, "9", None)
            .with_prop(KEY_AL_STRIPES, "2", Some(NAMESPC_DRBD_OPTIONS));

        let prio = PriorityProps::new(vec![&high, &low]);
        assert_eq!(prio.get_prop(KEY_PEER_SLOTS_NEW_RESOURCE, None), Some("3"));
        assert_eq!(
            prio.get_parsed::<u32>(KEY_AL_STRIPES, Some(NAMESPC_DRBD_OPTIONS)).unwrap(),
            Some(2)
        );
        assert_eq!(prio.get_prop("missing", None), None);
    }

    #[test]
    fn test_serde_transparent() {
        let props = Props::new().with_prop("LvmVg", "vg0", Some("StorDriver"));
        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"StorDriver/LvmVg":"vg0"}"#);
    }
}
