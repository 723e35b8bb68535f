//! Neighbor protocol: which regions are next door and what we tell them.
//!
//! ```text
//! NeighborService
//!   ├── NeighborTable          ← tracked neighbors, capability cache, outbound POSTs
//!   ├── CompactingQueue        ← child avatar updates, keyed by local id
//!   └── handle_message()       ← inbound seed / online / offline / child / rez
//! ```
//!
//! Outbound delivery is best-effort: failures are logged and never change
//! local state. Capability URLs are learned from a neighbor's public seed
//! capability the first time a verb is needed, then cached.

use crate::compacting_queue::CompactingQueue;
use crate::directory::{DirectoryLookup, SceneInfo};
use crate::entity::{EntityIdentity, Physical, SceneEntity};
use crate::error::{HandoffError, MessageError};
use crate::presence::ScenePresence;
use crate::protocol::{
    capabilities, ChildAvatarUpdate, RegionOffline, RegionOnline, RezAvatarRequest,
    RezAvatarResponse, SeedRequest, SeedResponse,
};
use crate::scene::SceneGraph;
use crate::transport::{ClientConnector, NullChannel, RemoteRegionTransport};
use crate::types::{Camera, RegionConfig, Vec3};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Reply to an inbound neighbor message, ready for the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborReply {
    pub status: u16,
    pub body: Value,
}

impl NeighborReply {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub(crate) fn encode<T: Serialize>(msg: &T) -> Result<Value, HandoffError> {
    serde_json::to_value(msg).map_err(|e| HandoffError::Malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Neighbor table
// ---------------------------------------------------------------------------

/// Tracked neighbors and the outbound side of the protocol.
pub(crate) struct NeighborTable {
    config: Arc<RegionConfig>,
    transport: Arc<dyn RemoteRegionTransport>,
    regions: RwLock<HashMap<Uuid, SceneInfo>>,
    /// Capabilities learned through seed requests, by region id.
    learned: RwLock<HashMap<Uuid, HashMap<String, String>>>,
}

impl NeighborTable {
    fn upsert(&self, info: SceneInfo) {
        self.regions.write().insert(info.id, info);
    }

    fn forget(&self, id: &Uuid) -> Option<SceneInfo> {
        self.learned.write().remove(id);
        self.regions.write().remove(id)
    }

    fn snapshot(&self) -> Vec<SceneInfo> {
        self.regions.read().values().cloned().collect()
    }

    /// Resolve `verb` for `info`, asking its seed capability if neither the
    /// caller's copy nor the cache has it yet.
    pub(crate) async fn capability_for(
        &self,
        info: &SceneInfo,
        verb: &str,
    ) -> Result<String, HandoffError> {
        if let Some(url) = info.capability(verb) {
            return Ok(url.to_string());
        }
        let cached = {
            let learned = self.learned.read();
            learned.get(&info.id).and_then(|caps| caps.get(verb).cloned())
        };
        if let Some(url) = cached {
            return Ok(url);
        }

        let request = SeedRequest {
            capabilities: capabilities::NEIGHBOR.iter().map(|v| v.to_string()).collect(),
        };
        let reply = self
            .transport
            .post_json(&info.public_seed_capability, encode(&request)?)
            .await?;
        let seed: SeedResponse =
            serde_json::from_value(reply).map_err(|e| HandoffError::Malformed(e.to_string()))?;
        debug!(
            "Learned {} capabilities from {}",
            seed.capabilities.len(),
            info.name
        );

        let url = seed.capabilities.get(verb).cloned();
        self.learned.write().insert(info.id, seed.capabilities);
        url.ok_or_else(|| HandoffError::NoCapability {
            region: info.name.clone(),
            verb: verb.to_string(),
        })
    }

    pub(crate) async fn post(
        &self,
        info: &SceneInfo,
        verb: &str,
        payload: Value,
    ) -> Result<Value, HandoffError> {
        let url = self.capability_for(info, verb).await?;
        Ok(self.transport.post_json(&url, payload).await?)
    }

    /// Send one world-frame child update to every neighbor within the
    /// agent's draw distance, translated into each neighbor's frame.
    fn stream_child_update(self: &Arc<Self>, update: ChildAvatarUpdate) {
        let reach = update.draw_distance * update.draw_distance;
        let targets: Vec<SceneInfo> = self
            .regions
            .read()
            .values()
            .filter(|n| n.bounds().distance_squared_xy(update.position) <= reach)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No runtime to stream child update for {}, dropping",
                    update.agent_id
                );
                return;
            }
        };

        for info in targets {
            let mut msg = update.clone();
            msg.position = update.position - info.min;
            msg.camera_center = update.camera_center - info.min;
            msg.source_region_id = Some(self.config.region_id);
            let table = Arc::clone(self);
            runtime.spawn(async move {
                let payload = match encode(&msg) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode child update: {e}");
                        return;
                    }
                };
                if let Err(e) = table
                    .post(&info, capabilities::CHILD_AVATAR_UPDATE, payload)
                    .await
                {
                    debug!(
                        "Child update for {} to {} failed: {e}",
                        msg.agent_id, info.name
                    );
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// NeighborService
// ---------------------------------------------------------------------------

pub struct NeighborService {
    config: Arc<RegionConfig>,
    scene: Arc<SceneGraph>,
    directory: Arc<dyn DirectoryLookup>,
    table: Arc<NeighborTable>,
    child_updates: Arc<CompactingQueue<u32, ChildAvatarUpdate>>,
    connector: Option<Arc<dyn ClientConnector>>,
    admission: Mutex<()>,
}

impl NeighborService {
    pub fn new(
        config: Arc<RegionConfig>,
        scene: Arc<SceneGraph>,
        directory: Arc<dyn DirectoryLookup>,
        transport: Arc<dyn RemoteRegionTransport>,
    ) -> Self {
        let table = Arc::new(NeighborTable {
            config: config.clone(),
            transport,
            regions: RwLock::new(HashMap::new()),
            learned: RwLock::new(HashMap::new()),
        });
        let fanout = table.clone();
        let child_updates = Arc::new(CompactingQueue::new(
            config.child_updates_per_second,
            config.child_update_interval(),
            move |update: ChildAvatarUpdate| fanout.stream_child_update(update),
        ));
        Self {
            config,
            scene,
            directory,
            table,
            child_updates,
            connector: None,
            admission: Mutex::new(()),
        }
    }

    /// Accept agents arriving from neighbors. Without a connector every
    /// root rez request is refused.
    pub fn with_connector(mut self, connector: Arc<dyn ClientConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub(crate) fn table(&self) -> &Arc<NeighborTable> {
        &self.table
    }

    pub fn neighbors(&self) -> Vec<SceneInfo> {
        self.table.snapshot()
    }

    pub fn neighbor(&self, id: &Uuid) -> Option<SceneInfo> {
        self.table.regions.read().get(id).cloned()
    }

    pub fn neighbor_count(&self) -> usize {
        self.table.regions.read().len()
    }

    /// Resolve a capability URL on a neighbor, learning it if needed.
    pub async fn capability_for(&self, info: &SceneInfo, verb: &str) -> Result<String, HandoffError> {
        self.table.capability_for(info, verb).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the child update timer.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self) {
        self.child_updates.start();
    }

    /// Stop the child update timer, sending whatever is still queued.
    pub fn shutdown(&self) {
        self.child_updates.stop(true);
    }

    fn online_message(&self) -> RegionOnline {
        RegionOnline {
            region_id: self.config.region_id,
            region_name: self.config.name.clone(),
            region_x: self.config.region_x,
            region_y: self.config.region_y,
            region_size_x: self.config.size_x,
            region_size_y: self.config.size_y,
            public_region_seed_capability: self.config.capability_url(capabilities::SEED),
        }
    }

    /// Tell every region within `neighbor_radius` that we are up. Regions
    /// that acknowledge are tracked as neighbors. Returns how many did.
    pub async fn announce_online(&self) -> usize {
        let bounds = self.config.world_bounds();
        let radius = Vec3::new(self.config.neighbor_radius, self.config.neighbor_radius, 0.0);
        let candidates = self
            .directory
            .find_regions_in_range(bounds.min - radius, bounds.max + radius);

        let payload = match encode(&self.online_message()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode online announcement: {e}");
                return 0;
            }
        };

        let mut reached = 0;
        for info in candidates.into_iter().filter(|r| r.id != self.config.region_id) {
            match self
                .table
                .post(&info, capabilities::REGION_ONLINE, payload.clone())
                .await
            {
                Ok(_) => {
                    debug!("Announced online to {}", info.name);
                    self.table.upsert(info);
                    reached += 1;
                }
                Err(e) => warn!("Online announcement to {} failed: {e}", info.name),
            }
        }
        info!(
            "Region {} online, {} neighbor(s) reached",
            self.config.name, reached
        );
        reached
    }

    /// Tell every tracked neighbor we are going away, then forget them.
    /// Returns how many acknowledged.
    pub async fn announce_offline(&self) -> usize {
        let payload = match encode(&RegionOffline {
            region_id: self.config.region_id,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode offline announcement: {e}");
                return 0;
            }
        };

        let mut reached = 0;
        for info in self.table.snapshot() {
            match self
                .table
                .post(&info, capabilities::REGION_OFFLINE, payload.clone())
                .await
            {
                Ok(_) => reached += 1,
                Err(e) => warn!("Offline announcement to {} failed: {e}", info.name),
            }
        }
        self.table.regions.write().clear();
        self.table.learned.write().clear();
        info!(
            "Region {} offline, {} neighbor(s) notified",
            self.config.name, reached
        );
        reached
    }

    // -----------------------------------------------------------------------
    // Child presence streaming
    // -----------------------------------------------------------------------

    /// Queue a child update for a root presence whose camera moved past
    /// the threshold. Returns `true` if something was queued.
    pub fn queue_child_update(&self, presence: &ScenePresence) -> bool {
        if presence.is_child() || self.neighbor_count() == 0 {
            return false;
        }
        if !presence.take_camera_moved(self.config.child_update_threshold) {
            return false;
        }

        let origin = self.config.origin();
        let camera = presence.camera();
        let update = ChildAvatarUpdate {
            agent_id: presence.id(),
            position: origin + presence.scene_position(),
            rotation: presence.scene_rotation(),
            camera_center: origin + camera.center,
            camera_at: camera.at_axis,
            camera_left: camera.left_axis,
            camera_up: camera.up_axis,
            draw_distance: camera.draw_distance,
            source_region_id: Some(self.config.region_id),
        };
        self.child_updates.add(presence.local_id(), update);
        true
    }

    pub fn pending_child_updates(&self) -> usize {
        self.child_updates.len()
    }

    /// Drive the child update queue from an external clock.
    pub fn release_child_updates(&self, now: Instant) -> usize {
        self.child_updates.release_due(now)
    }

    /// Drop queued child updates for a presence that left the scene.
    pub fn forget_presence(&self, local_id: u32) {
        self.child_updates.remove(&local_id);
    }

    /// Remove child presences that have not been refreshed within
    /// `child_timeout`. Returns the number removed.
    pub fn expire_children(&self, now: Instant) -> usize {
        let timeout = self.config.child_timeout();
        let mut expired = 0;
        for presence in self.scene.presences().iter() {
            if presence.is_child()
                && now.saturating_duration_since(presence.last_update()) > timeout
                && self.scene.remove_entity(presence.as_ref())
            {
                debug!("Child presence {} expired", presence.id());
                expired += 1;
            }
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Handle one inbound neighbor message. Malformed or refused messages
    /// are logged and turned into an error status; nothing here panics on
    /// peer input.
    pub fn handle_message(&self, verb: &str, body: &[u8]) -> NeighborReply {
        match self.dispatch(verb, body) {
            Ok(reply) => NeighborReply::ok(reply),
            Err(e) => {
                warn!("Dropped '{verb}' message: {e}");
                NeighborReply {
                    status: e.status(),
                    body: serde_json::json!({ "error": e.to_string() }),
                }
            }
        }
    }

    fn dispatch(&self, verb: &str, body: &[u8]) -> Result<Value, MessageError> {
        match verb {
            capabilities::SEED => {
                let req: SeedRequest = serde_json::from_slice(body)?;
                Ok(serde_json::to_value(self.on_seed(&req))?)
            }
            capabilities::REGION_ONLINE => {
                let msg: RegionOnline = serde_json::from_slice(body)?;
                self.on_region_online(&msg)?;
                Ok(Value::Null)
            }
            capabilities::REGION_OFFLINE => {
                let msg: RegionOffline = serde_json::from_slice(body)?;
                self.on_region_offline(&msg);
                Ok(Value::Null)
            }
            capabilities::CHILD_AVATAR_UPDATE => {
                let msg: ChildAvatarUpdate = serde_json::from_slice(body)?;
                self.on_child_update(&msg);
                Ok(Value::Null)
            }
            capabilities::REZ_AVATAR_REQUEST => {
                let req: RezAvatarRequest = serde_json::from_slice(body)?;
                Ok(serde_json::to_value(self.on_rez_avatar(&req)?)?)
            }
            other => Err(MessageError::UnknownVerb(other.to_string())),
        }
    }

    fn on_seed(&self, req: &SeedRequest) -> SeedResponse {
        let capabilities = req
            .capabilities
            .iter()
            .filter(|verb| capabilities::NEIGHBOR.contains(&verb.as_str()))
            .map(|verb| (verb.clone(), self.config.capability_url(verb)))
            .collect();
        SeedResponse { capabilities }
    }

    fn on_region_online(&self, msg: &RegionOnline) -> Result<(), MessageError> {
        if msg.region_id == self.config.region_id {
            return Err(MessageError::Rejected(
                "online announcement carries our own region id".into(),
            ));
        }
        info!("Neighbor {} ({}) is online", msg.region_name, msg.region_id);
        // A restarted region may serve its capabilities elsewhere.
        self.table.forget(&msg.region_id);
        self.table.upsert(SceneInfo::from_online(msg));
        Ok(())
    }

    fn on_region_offline(&self, msg: &RegionOffline) {
        let known = self.table.forget(&msg.region_id);
        let mut dropped = 0;
        for presence in self.scene.presences().iter() {
            if presence.is_child()
                && presence.origin_region() == Some(msg.region_id)
                && self.scene.remove_entity(presence.as_ref())
            {
                dropped += 1;
            }
        }
        match known {
            Some(info) => info!(
                "Neighbor {} went offline, dropped {} child presence(s)",
                info.name, dropped
            ),
            None => debug!("Offline notice from untracked region {}", msg.region_id),
        }
    }

    fn on_child_update(&self, msg: &ChildAvatarUpdate) {
        let placeholder = |local_id| {
            let presence = Arc::new(ScenePresence::new(
                EntityIdentity::new(local_id, msg.agent_id),
                msg.agent_id.to_string(),
                Uuid::nil(),
                msg.position,
                Arc::new(NullChannel),
            ));
            presence.set_child(true);
            presence
        };
        let presence = match self.scene.get_or_add_presence(msg.agent_id, placeholder) {
            None => {
                warn!("Child update for {} names a non-avatar entity", msg.agent_id);
                return;
            }
            Some((p, false)) if p.is_root() => {
                debug!("Ignoring child update for root agent {}", msg.agent_id);
                return;
            }
            Some((p, created)) => {
                if created {
                    debug!("Created child presence for {}", msg.agent_id);
                }
                p
            }
        };

        let mut transform = presence.transform();
        transform.position = msg.position;
        transform.rotation = msg.rotation;
        presence.set_transform(transform);
        presence.set_camera(Camera {
            center: msg.camera_center,
            at_axis: msg.camera_at,
            left_axis: msg.camera_left,
            up_axis: msg.camera_up,
            draw_distance: msg.draw_distance,
        });
        if msg.source_region_id.is_some() {
            presence.set_origin_region(msg.source_region_id);
        }
        presence.touch(Instant::now());
    }

    fn on_rez_avatar(&self, req: &RezAvatarRequest) -> Result<RezAvatarResponse, MessageError> {
        // Rez requests for one region are admitted one at a time so the
        // root check and the insert see the same scene.
        let _admission = self.admission.lock();
        let existing = self.scene.try_get_entity(&req.agent_id);
        match existing.map(|e| e.as_presence()) {
            Some(None) => {
                return Err(MessageError::Rejected(format!(
                    "{} is not an avatar",
                    req.agent_id
                )));
            }
            Some(Some(p)) if p.is_root() => {
                if p.session_id() != req.session_id {
                    return Err(MessageError::Rejected(format!(
                        "agent {} is already root here with another session",
                        req.agent_id
                    )));
                }
                self.place(&p, req);
            }
            _ => {
                let connector = self
                    .connector
                    .as_ref()
                    .ok_or_else(|| MessageError::Rejected("region is not accepting agents".into()))?;
                let channel = connector
                    .connect(req.agent_id, req.session_id)
                    .ok_or_else(|| MessageError::Rejected("client connection refused".into()))?;

                let identity = EntityIdentity::new(self.scene.allocate_local_id(), req.agent_id);
                let presence = Arc::new(ScenePresence::new(
                    identity,
                    req.agent_id.to_string(),
                    req.session_id,
                    req.position,
                    channel,
                ));
                self.place(&presence, req);
                if req.child {
                    presence.set_child(true);
                    presence.set_origin_region(req.source_region_id);
                }
                // Evicts a child placeholder, including one a concurrent
                // child update created after the lookup above.
                if let Some(stale) = self.scene.replace_presence(presence) {
                    self.child_updates.remove(&stale.local_id());
                }
            }
        }

        info!(
            "Accepted {} agent {} at {}",
            if req.child { "child" } else { "root" },
            req.agent_id,
            req.position
        );
        Ok(RezAvatarResponse {
            connect: true,
            sim_host: Some(self.config.sim_host.clone()),
            sim_port: Some(self.config.sim_port),
            region_id: Some(self.config.region_id),
            region_x: Some(self.config.region_x),
            region_y: Some(self.config.region_y),
            region_seed_capability: Some(self.config.capability_url(capabilities::SEED)),
            message: None,
        })
    }

    fn place(&self, presence: &ScenePresence, req: &RezAvatarRequest) {
        presence.set_relative_position(req.position);
        presence.set_velocity(req.velocity);
        let mut camera = presence.camera();
        camera.center = req.position;
        camera.at_axis = req.look_at;
        presence.set_camera(camera);
        presence.touch(Instant::now());
    }
}
