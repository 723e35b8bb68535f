//! RegionService – per-tick orchestration of one region: border checks,
//! child presence streaming, interest list dispatch and child expiry.

use crate::border::BorderCrossing;
use crate::directory::DirectoryLookup;
use crate::entity::{EntityIdentity, SceneEntity, SceneObject};
use crate::interest::{EventHandler, InterestListEvent};
use crate::neighbors::{NeighborReply, NeighborService};
use crate::presence::ScenePresence;
use crate::scene::SceneGraph;
use crate::transport::{ClientConnector, ClientEventChannel, RemoteRegionTransport};
use crate::types::{RegionConfig, SceneStats, Vec3};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Tick result
// ---------------------------------------------------------------------------

/// What a single [`RegionService::tick`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The tick counter that produced this report.
    pub tick: u64,
    /// Handoff tasks started for root presences past the border.
    pub crossings_started: usize,
    pub child_updates_queued: usize,
    /// Interest list events handed to senders across all presences.
    pub events_dispatched: usize,
    pub children_expired: usize,
    pub reprioritized: bool,
}

pub struct RegionService {
    config: Arc<RegionConfig>,
    scene: Arc<SceneGraph>,
    neighbors: Arc<NeighborService>,
    border: Arc<BorderCrossing>,
    tick_count: AtomicU64,
}

impl RegionService {
    pub fn new(
        config: RegionConfig,
        directory: Arc<dyn DirectoryLookup>,
        transport: Arc<dyn RemoteRegionTransport>,
        connector: Option<Arc<dyn ClientConnector>>,
    ) -> Self {
        let config = Arc::new(config);
        let scene = Arc::new(SceneGraph::new());
        let mut neighbors =
            NeighborService::new(config.clone(), scene.clone(), directory.clone(), transport);
        if let Some(connector) = connector {
            neighbors = neighbors.with_connector(connector);
        }
        let neighbors = Arc::new(neighbors);
        let border = Arc::new(BorderCrossing::new(
            config.clone(),
            directory,
            neighbors.clone(),
        ));
        Self {
            config,
            scene,
            neighbors,
            border,
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn scene(&self) -> &Arc<SceneGraph> {
        &self.scene
    }

    pub fn neighbors(&self) -> &Arc<NeighborService> {
        &self.neighbors
    }

    pub fn border(&self) -> &Arc<BorderCrossing> {
        &self.border
    }

    // -----------------------------------------------------------------------
    // Scene population
    // -----------------------------------------------------------------------

    /// Log an agent straight into this region as a root presence.
    pub fn add_presence(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
        name: impl Into<String>,
        position: Vec3,
        channel: Arc<dyn ClientEventChannel>,
    ) -> Arc<ScenePresence> {
        let identity = EntityIdentity::new(self.scene.allocate_local_id(), agent_id);
        let presence = Arc::new(ScenePresence::new(
            identity, name, session_id, position, channel,
        ));
        self.scene.add_presence(presence.clone());
        presence
    }

    pub fn add_object(&self, name: impl Into<String>, position: Vec3) -> Arc<SceneObject> {
        let identity = EntityIdentity::new(self.scene.allocate_local_id(), Uuid::new_v4());
        let object = Arc::new(SceneObject::new(identity, name, position));
        self.scene.add_or_update(object.clone());
        object
    }

    pub fn remove_entity(&self, local_id: u32, id: Uuid) -> bool {
        self.neighbors.forget_presence(local_id);
        self.border.forget(&id);
        self.scene.remove(local_id, id)
    }

    /// Position-change hook for scene mutation code. Presences may start a
    /// handoff; objects past the border are only reported.
    pub fn entity_moved(&self, entity: &Arc<dyn SceneEntity>) {
        match entity.clone().as_presence() {
            Some(presence) => {
                self.border.check_presence(&presence);
            }
            None => {
                if let Some(dest) = self.border.detect(entity.as_ref()) {
                    debug!(
                        "Object {} is inside {}, object transfer is not supported",
                        entity.id(),
                        dest.name
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Offer `event` to every root presence. Returns how many queued it.
    pub fn publish_event(&self, event: InterestListEvent, handler: Arc<dyn EventHandler>) -> usize {
        let event = Arc::new(event);
        let mut queued = 0;
        self.scene.for_each_presence(|presence| {
            if presence.is_root()
                && presence
                    .interest_list()
                    .enqueue_event(event.clone(), handler.clone(), presence)
            {
                queued += 1;
            }
        });
        queued
    }

    pub fn handle_message(&self, verb: &str, body: &[u8]) -> NeighborReply {
        self.neighbors.handle_message(verb, body)
    }

    // -----------------------------------------------------------------------
    // Main tick
    // -----------------------------------------------------------------------

    /// Advance the region by one tick.
    pub fn tick(&self) -> TickReport {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.config.reprioritize_every.max(1);
        let mut report = TickReport {
            tick,
            reprioritized: tick % every == 0,
            ..Default::default()
        };

        self.scene.for_each_presence(|presence| {
            if presence.is_child() {
                return;
            }
            if self.border.check_presence(presence) {
                report.crossings_started += 1;
            }
            if self.neighbors.queue_child_update(presence) {
                report.child_updates_queued += 1;
            }
            if report.reprioritized {
                presence.reprioritize();
            }
            report.events_dispatched += presence.dequeue_events(self.config.interest_batch);
        });

        let now = Instant::now();
        report.children_expired = self.neighbors.expire_children(now);
        self.border.prune_throttle(now);
        report
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> SceneStats {
        let presences = self.scene.presences();
        let child_presences = presences.iter().filter(|p| p.is_child()).count();
        SceneStats {
            entities: self.scene.entity_count(),
            root_presences: presences.len() - child_presences,
            child_presences,
            neighbors: self.neighbors.neighbor_count(),
            total_ticks: self.tick_count.load(Ordering::Relaxed),
        }
    }
}
