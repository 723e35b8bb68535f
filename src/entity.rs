//! Entity model: capability traits and the generic scene object.
//!
//! Behavior is dispatched through small capability traits rather than by
//! inspecting concrete types. Every entity is a [`SceneEntity`]; entities
//! that move on their own expose [`Physical`], entities that can sit in a
//! link set expose [`Linkable`], and presences answer
//! [`SceneEntity::as_presence`].

use crate::presence::ScenePresence;
use crate::types::{Quat, Vec3};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity & transform
// ---------------------------------------------------------------------------

/// Immutable identity of an entity, fixed at spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdentity {
    /// Dense scene-local handle, recycled after removal.
    pub local_id: u32,
    /// Globally unique identifier, never reused.
    pub id: Uuid,
    pub owner_id: Uuid,
    pub creator_id: Uuid,
    pub group_id: Uuid,
}

impl EntityIdentity {
    pub fn new(local_id: u32, id: Uuid) -> Self {
        Self {
            local_id,
            id,
            owner_id: Uuid::nil(),
            creator_id: Uuid::nil(),
            group_id: Uuid::nil(),
        }
    }
}

/// Parent-relative placement of an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zero(),
            rotation: Quat::IDENTITY,
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

pub trait SceneEntity: Send + Sync {
    fn identity(&self) -> &EntityIdentity;

    fn name(&self) -> String;

    fn transform(&self) -> Transform;

    fn set_transform(&self, transform: Transform);

    fn local_id(&self) -> u32 {
        self.identity().local_id
    }

    fn id(&self) -> Uuid {
        self.identity().id
    }

    fn scale(&self) -> Vec3 {
        self.transform().scale
    }

    fn relative_position(&self) -> Vec3 {
        self.transform().position
    }

    fn relative_rotation(&self) -> Quat {
        self.transform().rotation
    }

    fn set_relative_position(&self, position: Vec3) {
        let mut t = self.transform();
        t.position = position;
        self.set_transform(t);
    }

    /// Position in region-local space, resolved through any parent link.
    fn scene_position(&self) -> Vec3 {
        let t = self.transform();
        match self.as_linkable().and_then(|l| l.parent()) {
            Some(parent) => parent.scene_position() + parent.scene_rotation().rotate(t.position),
            None => t.position,
        }
    }

    fn scene_rotation(&self) -> Quat {
        let t = self.transform();
        match self.as_linkable().and_then(|l| l.parent()) {
            Some(parent) => parent.scene_rotation().compose(t.rotation),
            None => t.rotation,
        }
    }

    /// Rough radius of the entity, used as a size hint for prioritization.
    fn size_hint(&self) -> f32 {
        let s = self.scale();
        s.x.max(s.y).max(s.z)
    }

    fn as_physical(&self) -> Option<&dyn Physical> {
        None
    }

    fn as_linkable(&self) -> Option<&dyn Linkable> {
        None
    }

    fn as_presence(self: Arc<Self>) -> Option<Arc<ScenePresence>> {
        None
    }
}

/// Entities with their own velocity.
pub trait Physical {
    fn velocity(&self) -> Vec3;
    fn set_velocity(&self, velocity: Vec3);
}

/// Entities that can be children of a link set.
pub trait Linkable {
    fn parent(&self) -> Option<Arc<dyn SceneEntity>>;
    fn set_parent(&self, parent: Option<&Arc<dyn SceneEntity>>);
}

// ---------------------------------------------------------------------------
// Scene object
// ---------------------------------------------------------------------------

/// A generic rezzed object: prim, attachment root, vehicle, and so on.
pub struct SceneObject {
    identity: EntityIdentity,
    name: RwLock<String>,
    transform: RwLock<Transform>,
    velocity: RwLock<Vec3>,
    parent: RwLock<Option<Weak<dyn SceneEntity>>>,
    /// Arbitrary metadata (asset id, tags, …).
    pub metadata: RwLock<HashMap<String, serde_json::Value>>,
}

impl SceneObject {
    pub fn new(identity: EntityIdentity, name: impl Into<String>, position: Vec3) -> Self {
        Self {
            identity,
            name: RwLock::new(name.into()),
            transform: RwLock::new(Transform {
                position,
                ..Default::default()
            }),
            velocity: RwLock::new(Vec3::zero()),
            parent: RwLock::new(None),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }
}

impl SceneEntity for SceneObject {
    fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn transform(&self) -> Transform {
        *self.transform.read()
    }

    fn set_transform(&self, transform: Transform) {
        *self.transform.write() = transform;
    }

    fn as_physical(&self) -> Option<&dyn Physical> {
        Some(self)
    }

    fn as_linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }
}

impl Physical for SceneObject {
    fn velocity(&self) -> Vec3 {
        *self.velocity.read()
    }

    fn set_velocity(&self, velocity: Vec3) {
        *self.velocity.write() = velocity;
    }
}

impl Linkable for SceneObject {
    fn parent(&self) -> Option<Arc<dyn SceneEntity>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    fn set_parent(&self, parent: Option<&Arc<dyn SceneEntity>>) {
        *self.parent.write() = parent.map(Arc::downgrade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(local_id: u32, position: Vec3) -> Arc<SceneObject> {
        Arc::new(SceneObject::new(
            EntityIdentity::new(local_id, Uuid::new_v4()),
            "box",
            position,
        ))
    }

    #[test]
    fn unlinked_object_is_positioned_absolutely() {
        let o = object(1, Vec3::new(10.0, 20.0, 30.0));
        assert_eq!(o.scene_position(), Vec3::new(10.0, 20.0, 30.0));
        assert!(o.clone().as_presence().is_none());
    }

    #[test]
    fn child_position_follows_parent() {
        let parent = object(1, Vec3::new(100.0, 100.0, 20.0));
        let half = std::f32::consts::FRAC_PI_4;
        parent.set_transform(Transform {
            position: Vec3::new(100.0, 100.0, 20.0),
            rotation: Quat::new(0.0, 0.0, half.sin(), half.cos()),
            ..Default::default()
        });
        let child = object(2, Vec3::new(2.0, 0.0, 0.0));
        let parent_dyn: Arc<dyn SceneEntity> = parent.clone();
        child.set_parent(Some(&parent_dyn));

        let p = child.scene_position();
        assert!((p.x - 100.0).abs() < 1e-4);
        assert!((p.y - 102.0).abs() < 1e-4);
        assert!((p.z - 20.0).abs() < 1e-4);
    }

    #[test]
    fn dropped_parent_unlinks() {
        let child = object(2, Vec3::new(2.0, 0.0, 0.0));
        {
            let parent: Arc<dyn SceneEntity> = object(1, Vec3::new(50.0, 0.0, 0.0));
            child.set_parent(Some(&parent));
            assert_eq!(child.scene_position(), Vec3::new(52.0, 0.0, 0.0));
        }
        assert_eq!(child.scene_position(), Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn size_hint_is_largest_axis() {
        let o = object(1, Vec3::zero());
        o.set_transform(Transform {
            scale: Vec3::new(0.5, 4.0, 2.0),
            ..Default::default()
        });
        assert_eq!(o.size_hint(), 4.0);
    }
}
