//! Region directory: where other regions live and how to reach them.

use crate::protocol::RegionOnline;
use crate::types::{Aabb, Vec3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What one region knows about another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneInfo {
    pub id: Uuid,
    pub name: String,
    /// World-space bounds.
    pub min: Vec3,
    pub max: Vec3,
    pub public_seed_capability: String,
    /// Verb → URL, filled in lazily from the seed capability.
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
}

impl SceneInfo {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        min: Vec3,
        max: Vec3,
        public_seed_capability: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            min,
            max,
            public_seed_capability: public_seed_capability.into(),
            capabilities: HashMap::new(),
        }
    }

    pub fn from_online(msg: &RegionOnline) -> Self {
        let min = Vec3::new(msg.region_x, msg.region_y, 0.0);
        let max = min + Vec3::new(msg.region_size_x, msg.region_size_y, 0.0);
        Self::new(
            msg.region_id,
            msg.region_name.clone(),
            min,
            max,
            msg.public_region_seed_capability.clone(),
        )
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.min, self.max)
    }

    /// Half-open on the far edges, so a point on a shared border belongs
    /// to exactly one region.
    pub fn contains(&self, global: Vec3) -> bool {
        global.x >= self.min.x
            && global.x < self.max.x
            && global.y >= self.min.y
            && global.y < self.max.y
    }

    pub fn capability(&self, verb: &str) -> Option<&str> {
        self.capabilities.get(verb).map(String::as_str)
    }
}

/// Grid service lookups. Positions are world-space.
pub trait DirectoryLookup: Send + Sync {
    fn find_region_containing(&self, position: Vec3) -> Option<SceneInfo>;

    /// Every region whose bounds intersect the box `min..max`.
    fn find_regions_in_range(&self, min: Vec3, max: Vec3) -> Vec<SceneInfo>;
}

/// Fixed in-memory directory, seeded from configuration or by tests.
#[derive(Default)]
pub struct StaticDirectory {
    regions: RwLock<Vec<SceneInfo>>,
}

impl StaticDirectory {
    pub fn new(regions: Vec<SceneInfo>) -> Self {
        Self {
            regions: RwLock::new(regions),
        }
    }

    /// Insert or replace by region id.
    pub fn insert(&self, info: SceneInfo) {
        let mut regions = self.regions.write();
        match regions.iter_mut().find(|r| r.id == info.id) {
            Some(existing) => *existing = info,
            None => regions.push(info),
        }
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        let mut regions = self.regions.write();
        let before = regions.len();
        regions.retain(|r| r.id != *id);
        regions.len() != before
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

impl DirectoryLookup for StaticDirectory {
    fn find_region_containing(&self, position: Vec3) -> Option<SceneInfo> {
        self.regions
            .read()
            .iter()
            .find(|r| r.contains(position))
            .cloned()
    }

    fn find_regions_in_range(&self, min: Vec3, max: Vec3) -> Vec<SceneInfo> {
        self.regions
            .read()
            .iter()
            .filter(|r| r.min.x < max.x && r.max.x > min.x && r.min.y < max.y && r.max.y > min.y)
            .cloned()
            .collect()
    }
}
