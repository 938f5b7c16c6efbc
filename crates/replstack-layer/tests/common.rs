//! Common fixtures for integration tests.

#![allow(dead_code)]

use replstack_layer::{
    AccessContext, ClusterModel, EngineConfig, ProviderKind, Resource, ResourceDefinition,
    ResourceKey, StoragePool, Volume, VolumeDefinition,
};

/// Encryption key used by encrypted fixtures.
pub const TEST_KEY: &[u8] = b"0123456789abcdef";

/// Shape of a fixture resource definition.
pub struct TestCluster {
    pub nodes: Vec<&'static str>,
    pub volumes: u32,
    /// Volume numbers whose definitions are flagged encrypted.
    pub encrypted: Vec<u32>,
    pub pool_kind: ProviderKind,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self {
            nodes: vec!["n1", "n2"],
            volumes: 1,
            encrypted: Vec::new(),
            pool_kind: ProviderKind::Lvm,
        }
    }
}

impl TestCluster {
    pub fn nodes(mut self, nodes: &[&'static str]) -> Self {
        self.nodes = nodes.to_vec();
        self
    }

    pub fn volumes(mut self, volumes: u32) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn encrypted(mut self, vlm_nrs: &[u32]) -> Self {
        self.encrypted = vlm_nrs.to_vec();
        self
    }

    pub fn pool_kind(mut self, kind: ProviderKind) -> Self {
        self.pool_kind = kind;
        self
    }

    /// Builds a model with one pool `pool0` per node and resource `data1`
    /// placed on every node.
    pub fn build(&self) -> ClusterModel {
        let mut model =
            ClusterModel::new(EngineConfig::default()).expect("default config is valid");
        let mut rsc_dfn = ResourceDefinition::new("data1", 7000);
        for vlm_nr in 0..self.volumes {
            let mut vlm_dfn = VolumeDefinition::new(vlm_nr, 1 << 20);
            if self.encrypted.contains(&vlm_nr) {
                vlm_dfn = vlm_dfn.with_encryption(Some(TEST_KEY.to_vec()));
            }
            rsc_dfn = rsc_dfn.with_volume_definition(vlm_dfn);
        }
        model.add_resource_definition(rsc_dfn).expect("add definition");

        for (idx, node) in self.nodes.iter().enumerate() {
            model
                .add_storage_pool(StoragePool::new(*node, "pool0", self.pool_kind))
                .expect("add pool");
            let mut rsc = Resource::new(ResourceKey::new(*node, "data1"), idx as u16);
            for vlm_nr in 0..self.volumes {
                rsc = rsc.with_volume(Volume::new(vlm_nr, "pool0"));
            }
            model.add_resource(rsc).expect("add resource");
        }
        model
    }
}

/// Keys of every default resource of `model`.
pub fn default_keys(model: &ClusterModel) -> Vec<ResourceKey> {
    model
        .resources()
        .filter(|rsc| rsc.key.is_default())
        .map(|rsc| rsc.key.clone())
        .collect()
}

pub fn system() -> AccessContext {
    AccessContext::system()
}
