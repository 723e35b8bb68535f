//! Border crossing: noticing that an entity has left the region and handing
//! avatars over to the neighbor that now contains them.
//!
//! Per-agent state machine:
//!
//! ```text
//! Root ──detect──▶ Crossing ──accepted──▶ Child ──expiry/offline──▶ Gone
//!                     │
//!                     └──rejected/timeout──▶ Root (retry throttled)
//! ```
//!
//! A handoff runs as its own Tokio task bounded by `handoff_timeout`, so a
//! slow neighbor never stalls the tick. On any failure the presence stays
//! root here.

use crate::directory::{DirectoryLookup, SceneInfo};
use crate::entity::{Physical, SceneEntity};
use crate::error::HandoffError;
use crate::neighbors::{encode, NeighborService};
use crate::presence::ScenePresence;
use crate::protocol::{
    capabilities, client_events, EnableSimulator, EstablishAgentCommunication, RezAvatarRequest,
    RezAvatarResponse,
};
use crate::types::RegionConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub struct BorderCrossing {
    config: Arc<RegionConfig>,
    directory: Arc<dyn DirectoryLookup>,
    neighbors: Arc<NeighborService>,
    /// Earliest time a failed agent may be retried.
    throttle: Mutex<HashMap<Uuid, Instant>>,
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Endpoint fields of an accepted handoff.
struct Accepted {
    sim_host: String,
    sim_port: u16,
    seed_capability: String,
}

impl BorderCrossing {
    pub fn new(
        config: Arc<RegionConfig>,
        directory: Arc<dyn DirectoryLookup>,
        neighbors: Arc<NeighborService>,
    ) -> Self {
        Self {
            config,
            directory,
            neighbors,
            throttle: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    /// The region an entity has wandered into, if it is past the border
    /// margin and some other region contains it.
    pub fn detect(&self, entity: &dyn SceneEntity) -> Option<SceneInfo> {
        let local = entity.scene_position();
        let inside = self
            .config
            .local_bounds()
            .expanded(self.config.border_margin)
            .contains(local);
        if inside {
            return None;
        }
        let global = self.config.origin() + local;
        self.directory
            .find_region_containing(global)
            .filter(|dest| dest.id != self.config.region_id)
    }

    pub fn is_throttled(&self, agent_id: &Uuid, now: Instant) -> bool {
        let mut throttle = self.throttle.lock();
        match throttle.get(agent_id) {
            Some(until) if now < *until => true,
            Some(_) => {
                throttle.remove(agent_id);
                false
            }
            None => false,
        }
    }

    /// Drop retry state for an agent that left the scene.
    pub fn forget(&self, agent_id: &Uuid) {
        self.throttle.lock().remove(agent_id);
    }

    /// Drop throttle entries whose cooldown has passed. Returns how many
    /// were dropped.
    pub fn prune_throttle(&self, now: Instant) -> usize {
        let mut throttle = self.throttle.lock();
        let before = throttle.len();
        throttle.retain(|_, until| now < *until);
        before - throttle.len()
    }

    pub fn throttled_count(&self) -> usize {
        self.throttle.lock().len()
    }

    pub fn is_crossing(&self, agent_id: &Uuid) -> bool {
        self.in_flight.lock().contains(agent_id)
    }

    fn arm_throttle(&self, agent_id: Uuid) {
        let until = Instant::now() + self.config.crossing_cooldown();
        self.throttle.lock().insert(agent_id, until);
    }

    // -----------------------------------------------------------------------
    // Handoff
    // -----------------------------------------------------------------------

    /// Start a handoff for `presence` if it is root, outside the border,
    /// not throttled and not already crossing. Returns `true` if a handoff
    /// task was spawned.
    pub fn check_presence(self: &Arc<Self>, presence: &Arc<ScenePresence>) -> bool {
        if presence.is_child() {
            return false;
        }
        let agent_id = presence.id();
        if self.is_throttled(&agent_id, Instant::now()) {
            return false;
        }
        let Some(dest) = self.detect(presence.as_ref()) else {
            return false;
        };
        if !self.in_flight.lock().insert(agent_id) {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime for handoff of {agent_id}");
                self.in_flight.lock().remove(&agent_id);
                return false;
            }
        };

        debug!("Agent {} crossing into {}", agent_id, dest.name);
        let crossing = Arc::clone(self);
        let presence = Arc::clone(presence);
        runtime.spawn(async move {
            let _ = crossing.cross_agent(&presence, &dest).await;
            crossing.in_flight.lock().remove(&agent_id);
        });
        true
    }

    /// Hand a root presence over to `dest`.
    ///
    /// On success the presence is demoted to child and its client is told
    /// to connect to the destination. On failure nothing changes locally
    /// except that the agent's retry throttle is armed.
    pub async fn cross_agent(
        &self,
        presence: &ScenePresence,
        dest: &SceneInfo,
    ) -> Result<RezAvatarResponse, HandoffError> {
        let outcome = match tokio::time::timeout(
            self.config.handoff_timeout(),
            self.request_handoff(presence, dest),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandoffError::Timeout),
        };

        match outcome {
            Ok((response, accepted)) => {
                self.commit(presence, dest, &accepted);
                info!("Agent {} handed off to {}", presence.id(), dest.name);
                Ok(response)
            }
            Err(e) => {
                self.arm_throttle(presence.id());
                warn!(
                    "Handoff of {} to {} failed, staying root: {e}",
                    presence.id(),
                    dest.name
                );
                Err(e)
            }
        }
    }

    async fn request_handoff(
        &self,
        presence: &ScenePresence,
        dest: &SceneInfo,
    ) -> Result<(RezAvatarResponse, Accepted), HandoffError> {
        let global = self.config.origin() + presence.scene_position();
        let request = RezAvatarRequest {
            agent_id: presence.id(),
            session_id: presence.session_id(),
            position: global - dest.min,
            look_at: presence.camera().at_axis,
            velocity: presence.velocity(),
            child: false,
            source_region_id: Some(self.config.region_id),
        };

        let reply = self
            .neighbors
            .table()
            .post(dest, capabilities::REZ_AVATAR_REQUEST, encode(&request)?)
            .await?;
        let response: RezAvatarResponse =
            serde_json::from_value(reply).map_err(|e| HandoffError::Malformed(e.to_string()))?;
        let accepted = validate(&response)?;
        Ok((response, accepted))
    }

    fn commit(&self, presence: &ScenePresence, dest: &SceneInfo, accepted: &Accepted) {
        presence.set_child(true);
        presence.set_origin_region(Some(dest.id));
        presence.touch(Instant::now());
        presence.interest_list().clear();
        self.neighbors.forget_presence(presence.local_id());
        self.throttle.lock().remove(&presence.id());

        let enable = EnableSimulator {
            sim_host: accepted.sim_host.clone(),
            sim_port: accepted.sim_port,
            region_x: dest.min.x,
            region_y: dest.min.y,
        };
        let establish = EstablishAgentCommunication {
            agent_id: presence.id(),
            sim_host: accepted.sim_host.clone(),
            sim_port: accepted.sim_port,
            seed_capability: accepted.seed_capability.clone(),
        };
        for (event_type, payload) in [
            (client_events::ENABLE_SIMULATOR, encode(&enable)),
            (client_events::ESTABLISH_AGENT_COMMUNICATION, encode(&establish)),
        ] {
            match payload {
                Ok(payload) => presence.channel().queue_event(event_type, payload),
                Err(e) => warn!("Failed to encode {event_type}: {e}"),
            }
        }
    }
}

fn validate(response: &RezAvatarResponse) -> Result<Accepted, HandoffError> {
    if !response.connect {
        return Err(HandoffError::Rejected(
            response
                .message
                .clone()
                .unwrap_or_else(|| "no reason given".into()),
        ));
    }
    match (
        &response.sim_host,
        response.sim_port,
        &response.region_seed_capability,
    ) {
        (Some(host), Some(port), Some(seed)) if !host.is_empty() && !seed.is_empty() => {
            Ok(Accepted {
                sim_host: host.clone(),
                sim_port: port,
                seed_capability: seed.clone(),
            })
        }
        _ => Err(HandoffError::Malformed(
            "accepted handoff is missing its endpoint".into(),
        )),
    }
}
