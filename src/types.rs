//! Core region types shared across all modules.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn dot(self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn distance_squared(self, other: Vec3) -> f32 {
        let d = self - other;
        d.dot(d)
    }

    pub fn distance(self, other: Vec3) -> f32 {
        self.distance_squared(other).sqrt()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Unit quaternion used for entity rotations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Hamilton product `self * rhs` (apply `rhs` first, then `self`).
    pub fn compose(self, rhs: Quat) -> Quat {
        Quat::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }

    pub fn rotate(self, v: Vec3) -> Vec3 {
        let u = Vec3::new(self.x, self.y, self.z);
        let t = u.cross(v) * 2.0;
        v + t * self.w + u.cross(t)
    }
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Axis-aligned box on the ground plane. The vertical axis is unbounded:
/// regions are columns, so only `x`/`y` take part in containment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn expanded(&self, margin: f32) -> Aabb {
        let m = Vec3::new(margin, margin, 0.0);
        Aabb::new(self.min - m, self.max + m)
    }

    /// Squared ground-plane distance from `p` to the nearest point of the box.
    pub fn distance_squared_xy(&self, p: Vec3) -> f32 {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        dx * dx + dy * dy
    }
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

/// Client viewpoint reported by a presence's viewer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Camera {
    pub center: Vec3,
    pub at_axis: Vec3,
    pub left_axis: Vec3,
    pub up_axis: Vec3,
    pub draw_distance: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            center: Vec3::zero(),
            at_axis: Vec3::new(1.0, 0.0, 0.0),
            left_axis: Vec3::new(0.0, 1.0, 0.0),
            up_axis: Vec3::new(0.0, 0.0, 1.0),
            draw_distance: 128.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SceneStats {
    pub entities: usize,
    pub root_presences: usize,
    pub child_presences: usize,
    pub neighbors: usize,
    pub total_ticks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub region_id: Uuid,
    pub name: String,
    /// World-space south-west corner of the region.
    pub region_x: f32,
    pub region_y: f32,
    /// Width/height of the region in world units.
    pub size_x: f32,
    pub size_y: f32,
    /// Distance past the region edge an entity may stray before a
    /// crossing is attempted.
    pub border_margin: f32,
    /// Cooldown after a failed crossing before the agent is retried.
    pub crossing_cooldown_ms: u64,
    pub handoff_timeout_ms: u64,
    /// Regions within this distance of our bounds are told we came online.
    pub neighbor_radius: f32,
    /// Camera movement (world units) that triggers a child update.
    pub child_update_threshold: f32,
    pub child_updates_per_second: f64,
    pub child_update_interval_ms: u64,
    /// Child presences not refreshed for this long are dropped.
    pub child_timeout_ms: u64,
    /// Events dispatched per presence per tick.
    pub interest_batch: usize,
    /// Interest lists are reprioritized every N ticks.
    pub reprioritize_every: u64,
    pub sim_host: String,
    pub sim_port: u16,
    /// Base URL under which this region's capabilities are served.
    pub public_url: String,
}

impl RegionConfig {
    pub fn origin(&self) -> Vec3 {
        Vec3::new(self.region_x, self.region_y, 0.0)
    }

    /// Region bounds in world space.
    pub fn world_bounds(&self) -> Aabb {
        let origin = self.origin();
        Aabb::new(origin, origin + Vec3::new(self.size_x, self.size_y, 0.0))
    }

    /// Region bounds in region-local space.
    pub fn local_bounds(&self) -> Aabb {
        Aabb::new(Vec3::zero(), Vec3::new(self.size_x, self.size_y, 0.0))
    }

    pub fn capability_url(&self, verb: &str) -> String {
        format!("{}/{}", self.public_url.trim_end_matches('/'), verb)
    }

    pub fn crossing_cooldown(&self) -> Duration {
        Duration::from_millis(self.crossing_cooldown_ms)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn child_timeout(&self) -> Duration {
        Duration::from_millis(self.child_timeout_ms)
    }

    pub fn child_update_interval(&self) -> Duration {
        Duration::from_millis(self.child_update_interval_ms)
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            region_id: Uuid::nil(),
            name: "region".into(),
            region_x: 0.0,
            region_y: 0.0,
            size_x: 256.0,
            size_y: 256.0,
            border_margin: 5.0,
            crossing_cooldown_ms: 2_000,
            handoff_timeout_ms: 10_000,
            neighbor_radius: 256.0,
            child_update_threshold: 10.0,
            child_updates_per_second: 20.0,
            child_update_interval_ms: 100,
            child_timeout_ms: 60_000,
            interest_batch: 100,
            reprioritize_every: 10,
            sim_host: "127.0.0.1".into(),
            sim_port: 9000,
            public_url: "http://127.0.0.1:9000/caps".into(),
        }
    }
}
