//! SceneGraph: the authoritative entity index for one region.
//!
//! Entities are reachable by scene-local id and by global id. Presences are
//! a projected view of the same map, so a presence leaves every index in the
//! same critical section that removes its entity, and per-tick iteration over
//! presences reads a lock-free snapshot instead of taking the entity lock.

use crate::dual_key_map::DualKeyMap;
use crate::entity::SceneEntity;
use crate::presence::ScenePresence;
use log::error;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

/// Hands out dense scene-local ids, recycling released ones.
struct LocalIdAllocator {
    next: u32,
    free: Vec<u32>,
}

impl LocalIdAllocator {
    fn allocate(&mut self) -> u32 {
        if let Some(id) = self.free.pop() {
            return id;
        }
        self.next += 1;
        self.next
    }

    fn release(&mut self, id: u32) {
        if id != 0 && id <= self.next && !self.free.contains(&id) {
            self.free.push(id);
        }
    }
}

type EntityMap = DualKeyMap<u32, Uuid, Arc<dyn SceneEntity>, Arc<ScenePresence>>;

pub struct SceneGraph {
    entities: EntityMap,
    local_ids: Mutex<LocalIdAllocator>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self {
            entities: DualKeyMap::with_view(|entity: &Arc<dyn SceneEntity>| {
                entity.clone().as_presence()
            }),
            local_ids: Mutex::new(LocalIdAllocator {
                next: 0,
                free: Vec::new(),
            }),
        }
    }

    /// Reserve a scene-local id for a new entity. Id 0 is never issued.
    pub fn allocate_local_id(&self) -> u32 {
        self.local_ids.lock().allocate()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Insert or replace an entity. Returns `true` for a new entity.
    ///
    /// # Panics
    ///
    /// Panics if the entity's local id is held by a different global id, or
    /// its global id by a different local id.
    pub fn add_or_update(&self, entity: Arc<dyn SceneEntity>) -> bool {
        self.entities
            .add_or_update(entity.local_id(), entity.id(), entity)
    }

    /// Convenience for callers already holding a concrete presence.
    pub fn add_presence(&self, presence: Arc<ScenePresence>) -> bool {
        self.add_or_update(presence)
    }

    /// Return the presence for `id`, or build one with a freshly allocated
    /// local id and insert it, atomically. `make` only runs when nothing is
    /// bound to `id`. Returns `None` if `id` belongs to a non-presence
    /// entity. The flag is `true` when a presence was created.
    pub fn get_or_add_presence(
        &self,
        id: Uuid,
        make: impl FnOnce(u32) -> Arc<ScenePresence>,
    ) -> Option<(Arc<ScenePresence>, bool)> {
        let (entity, created) = self.entities.get_or_insert_with(id, || {
            let local_id = self.allocate_local_id();
            let presence: Arc<dyn SceneEntity> = make(local_id);
            (local_id, presence)
        });
        entity.as_presence().map(|p| (p, created))
    }

    /// Bind `presence` to its global id, evicting whatever entity held that
    /// id in the same critical section. Returns the evicted entity.
    ///
    /// # Panics
    ///
    /// Panics if the presence's local id is held by another entity.
    pub fn replace_presence(&self, presence: Arc<ScenePresence>) -> Option<Arc<dyn SceneEntity>> {
        let (local_id, id) = (presence.local_id(), presence.id());
        let evicted = self.entities.swap(local_id, id, presence);
        match evicted {
            Some((old_local_id, entity)) => {
                if old_local_id != local_id {
                    self.local_ids.lock().release(old_local_id);
                }
                Some(entity)
            }
            None => None,
        }
    }

    pub fn remove(&self, local_id: u32, id: Uuid) -> bool {
        let removed = self.entities.remove(local_id, id);
        if removed {
            self.local_ids.lock().release(local_id);
        }
        removed
    }

    pub fn remove_entity(&self, entity: &dyn SceneEntity) -> bool {
        self.remove(entity.local_id(), entity.id())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn try_get_entity(&self, id: &Uuid) -> Option<Arc<dyn SceneEntity>> {
        self.entities.get_by_second(id)
    }

    pub fn try_get_entity_by_local_id(&self, local_id: u32) -> Option<Arc<dyn SceneEntity>> {
        self.entities.get_by_first(&local_id)
    }

    pub fn try_get_presence(&self, id: &Uuid) -> Option<Arc<ScenePresence>> {
        self.entities.get_by_second(id)?.as_presence()
    }

    pub fn try_get_presence_by_local_id(&self, local_id: u32) -> Option<Arc<ScenePresence>> {
        self.entities.get_by_first(&local_id)?.as_presence()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn presence_count(&self) -> usize {
        self.entities.view().len()
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    /// Visit every entity under the shared lock. A panicking callback is
    /// logged and iteration continues with the next entity. The callback
    /// must not add or remove entities.
    pub fn for_each_entity(&self, mut action: impl FnMut(&Arc<dyn SceneEntity>)) {
        self.entities.for_each(|entity| {
            if catch_unwind(AssertUnwindSafe(|| action(entity))).is_err() {
                error!("Entity callback panicked for {} ({})", entity.id(), entity.local_id());
            }
        });
    }

    /// Visit every presence in the current snapshot without locking. Same
    /// panic isolation as [`for_each_entity`](Self::for_each_entity); the
    /// callback may mutate the scene.
    pub fn for_each_presence(&self, mut action: impl FnMut(&Arc<ScenePresence>)) {
        for presence in self.entities.view().iter() {
            if catch_unwind(AssertUnwindSafe(|| action(presence))).is_err() {
                error!("Presence callback panicked for {}", presence.id());
            }
        }
    }

    pub fn find_presence(
        &self,
        mut predicate: impl FnMut(&ScenePresence) -> bool,
    ) -> Option<Arc<ScenePresence>> {
        self.entities.view().iter().find_map(|presence| {
            match catch_unwind(AssertUnwindSafe(|| predicate(presence))) {
                Ok(true) => Some(presence.clone()),
                Ok(false) => None,
                Err(_) => {
                    error!("Presence predicate panicked for {}", presence.id());
                    None
                }
            }
        })
    }

    pub fn presences(&self) -> Arc<Vec<Arc<ScenePresence>>> {
        self.entities.view()
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}
