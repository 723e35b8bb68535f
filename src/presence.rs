//! Scene presences: the in-region representation of a connected agent.

use crate::entity::{EntityIdentity, Physical, SceneEntity, Transform};
use crate::interest::{EventHandler, InterestList, InterestListEvent};
use crate::transport::ClientEventChannel;
use crate::types::{Camera, Vec3};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// An agent's avatar in this region.
///
/// A root presence is simulated here. A child presence is a placeholder for
/// an avatar simulated by a neighbor but visible from this region; it is
/// refreshed by child updates and expires when they stop arriving.
pub struct ScenePresence {
    identity: EntityIdentity,
    name: String,
    session_id: Uuid,
    transform: RwLock<Transform>,
    velocity: RwLock<Vec3>,
    camera: RwLock<Camera>,
    child: AtomicBool,
    /// Region that owns the root of a child presence.
    origin_region: RwLock<Option<Uuid>>,
    last_update: Mutex<Instant>,
    /// Camera center as of the last child update streamed to neighbors.
    last_streamed: Mutex<Option<Vec3>>,
    channel: Arc<dyn ClientEventChannel>,
    interest: InterestList,
}

impl ScenePresence {
    pub fn new(
        identity: EntityIdentity,
        name: impl Into<String>,
        session_id: Uuid,
        position: Vec3,
        channel: Arc<dyn ClientEventChannel>,
    ) -> Self {
        Self {
            identity,
            name: name.into(),
            session_id,
            transform: RwLock::new(Transform {
                position,
                ..Default::default()
            }),
            velocity: RwLock::new(Vec3::zero()),
            camera: RwLock::new(Camera {
                center: position,
                ..Default::default()
            }),
            child: AtomicBool::new(false),
            origin_region: RwLock::new(None),
            last_update: Mutex::new(Instant::now()),
            last_streamed: Mutex::new(None),
            channel,
            interest: InterestList::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_child(&self) -> bool {
        self.child.load(Ordering::Acquire)
    }

    pub fn is_root(&self) -> bool {
        !self.is_child()
    }

    /// Flip between root and child. Only the handoff protocol should call
    /// this; anything else risks an agent being root in two regions.
    pub fn set_child(&self, child: bool) {
        self.child.store(child, Ordering::Release);
        if !child {
            *self.origin_region.write() = None;
        }
    }

    pub fn origin_region(&self) -> Option<Uuid> {
        *self.origin_region.read()
    }

    pub fn set_origin_region(&self, region: Option<Uuid>) {
        *self.origin_region.write() = region;
    }

    pub fn camera(&self) -> Camera {
        *self.camera.read()
    }

    pub fn set_camera(&self, camera: Camera) {
        *self.camera.write() = camera;
    }

    pub fn channel(&self) -> &Arc<dyn ClientEventChannel> {
        &self.channel
    }

    // -----------------------------------------------------------------------
    // Child bookkeeping
    // -----------------------------------------------------------------------

    pub fn touch(&self, now: Instant) {
        *self.last_update.lock() = now;
    }

    pub fn last_update(&self) -> Instant {
        *self.last_update.lock()
    }

    /// True if the camera has moved more than `threshold` since the last
    /// call that returned true. The first call always returns true.
    pub fn take_camera_moved(&self, threshold: f32) -> bool {
        let center = self.camera().center;
        let mut last = self.last_streamed.lock();
        match *last {
            Some(prev) if prev.distance_squared(center) <= threshold * threshold => false,
            _ => {
                *last = Some(center);
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interest list
    // -----------------------------------------------------------------------

    pub fn interest_list(&self) -> &InterestList {
        &self.interest
    }

    pub fn enqueue_event(&self, event: Arc<InterestListEvent>, handler: Arc<dyn EventHandler>) {
        self.interest.enqueue_event(event, handler, self);
    }

    pub fn dequeue_events(&self, count: usize) -> usize {
        self.interest.dequeue_events(count, self)
    }

    pub fn reprioritize(&self) {
        self.interest.reprioritize(self);
    }
}

impl SceneEntity for ScenePresence {
    fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    fn name(&self) -> String {
        self.name.clone()
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

    fn as_presence(self: Arc<Self>) -> Option<Arc<ScenePresence>> {
        Some(self)
    }
}

impl Physical for ScenePresence {
    fn velocity(&self) -> Vec3 {
        *self.velocity.read()
    }

    fn set_velocity(&self, velocity: Vec3) {
        *self.velocity.write() = velocity;
    }
}

impl std::fmt::Debug for ScenePresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenePresence")
            .field("local_id", &self.identity.local_id)
            .field("id", &self.identity.id)
            .field("name", &self.name)
            .field("child", &self.is_child())
            .finish()
    }
}
