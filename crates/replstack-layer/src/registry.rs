//! Registrations of replication layer objects built for peer resources.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::layer_data::RscLayerObject;
use crate::types::{ResourceKey, ResourceName};

/// Concurrent store of peer layer objects, keyed by the peer resource.
///
/// Entries are only ever inserted after the local stack that produced them
/// was built successfully.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<ResourceKey, Arc<RscLayerObject>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `obj` under its resource key, returning the replaced entry.
    pub fn register(&self, obj: Arc<RscLayerObject>) -> Option<Arc<RscLayerObject>> {
        debug!(rsc = %obj.rsc, layer_rsc_id = %obj.id, "registered peer layer object");
        self.peers.insert(obj.rsc.clone(), obj)
    }

    /// Registered object of `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<RscLayerObject>> {
        self.peers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Forgets the registration of `key`.
    pub fn remove(&self, key: &ResourceKey) -> Option<Arc<RscLayerObject>> {
        self.peers.remove(key).map(|(_, obj)| obj)
    }

    /// Whether `key` has a registration.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Registered peer objects of one resource definition, in key order.
    pub fn peers_of(&self, name: &ResourceName) -> Vec<Arc<RscLayerObject>> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| &entry.key().name == name)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        peers.sort_by(|a, b| a.rsc.cmp(&b.rsc));
        peers
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer_data::{LuksRscData, RscLayerData};
    use crate::types::LayerRscId;

    fn obj(node: &str, name: &str, id: u32) -> Arc<RscLayerObject> {
        Arc::new(RscLayerObject::new(
            LayerRscId::new(id),
            ResourceKey::new(node, name),
            None,
            RscLayerData::Luks(LuksRscData::default()),
        ))
    }

    #[test]
    fn test_register_replaces() {
        let registry = PeerRegistry::new();
        assert!(registry.register(obj("n2", "data1", 1)).is_none());
        let old = registry.register(obj("n2", "data1", 2)).unwrap();
        assert_eq!(old.id, LayerRscId::new(1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&ResourceKey::new("n2", "data1")).unwrap().id, LayerRscId::new(2));
    }

    #[test]
    fn test_peers_of_sorted_and_filtered() {
        let registry = PeerRegistry::new();
        registry.register(obj("n3", "data1", 3));
        registry.register(obj("n2", "data1", 2));
        registry.register(obj("n2", "other", 4));
        let peers = registry.peers_of(&ResourceName::new("data1"));
        let nodes: Vec<_> = peers.iter().map(|p| p.rsc.node.as_str().to_string()).collect();
        assert_eq!(nodes, vec!["n2", "n3"]);
    }

    #[test]
    fn test_remove() {
        let registry = PeerRegistry::new();
        registry.register(obj("n2", "data1", 1));
        assert!(registry.remove(&ResourceKey::new("n2", "data1")).is_some());
        assert!(registry.is_empty());
        assert!(!registry.contains(&ResourceKey::new("n2", "data1")));
    }
}
