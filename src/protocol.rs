//! Region-to-region and region-to-client wire protocol.
//!
//! This module owns **every message that crosses a region boundary**:
//! neighbor capability requests between simulators, and the events pushed
//! down a client's event channel when its avatar changes regions.
//!
//! ## Capability verbs
//!
//! | Verb                  | Request              | Reply                |
//! |-----------------------|----------------------|----------------------|
//! | `seed`                | [`SeedRequest`]      | [`SeedResponse`]     |
//! | `region/online`       | [`RegionOnline`]     | empty                |
//! | `region/offline`      | [`RegionOffline`]    | empty                |
//! | `child_avatar/update` | [`ChildAvatarUpdate`]| empty                |
//! | `rez_avatar/request`  | [`RezAvatarRequest`] | [`RezAvatarResponse`]|
//!
//! ## Design rules
//!
//! 1. Every struct is `Serialize + Deserialize` with snake_case JSON.
//! 2. Positions are always in the **receiver's** region-local frame.
//! 3. Fields added after the first revision carry `#[serde(default)]` so
//!    older peers stay readable.

use crate::types::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Seed handshake  (verb: seed)
// ---------------------------------------------------------------------------

/// Ask a region for the URLs of the named capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedRequest {
    pub capabilities: Vec<String>,
}

/// Verb → URL for every requested capability the region serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SeedResponse {
    pub capabilities: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Region lifecycle  (verbs: region/online, region/offline)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionOnline {
    pub region_id: Uuid,
    pub region_name: String,
    /// World-space south-west corner.
    pub region_x: f32,
    pub region_y: f32,
    #[serde(default = "default_region_size")]
    pub region_size_x: f32,
    #[serde(default = "default_region_size")]
    pub region_size_y: f32,
    pub public_region_seed_capability: String,
}

fn default_region_size() -> f32 {
    256.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionOffline {
    pub region_id: Uuid,
}

// ---------------------------------------------------------------------------
// Child presence streaming  (verb: child_avatar/update)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildAvatarUpdate {
    pub agent_id: Uuid,
    pub position: Vec3,
    pub rotation: Quat,
    pub camera_center: Vec3,
    pub camera_at: Vec3,
    pub camera_left: Vec3,
    pub camera_up: Vec3,
    pub draw_distance: f32,
    /// Region simulating the root presence.
    #[serde(default)]
    pub source_region_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Avatar handoff  (verb: rez_avatar/request)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RezAvatarRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub position: Vec3,
    pub look_at: Vec3,
    pub velocity: Vec3,
    /// `true` provisions a child presence only; `false` hands over the root.
    pub child: bool,
    #[serde(default)]
    pub source_region_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RezAvatarResponse {
    pub connect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_y: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_seed_capability: Option<String>,
    /// Reason for a refusal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RezAvatarResponse {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            connect: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Client events  (pushed through ClientEventChannel)
// ---------------------------------------------------------------------------

/// Tell the client to open a connection to another simulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnableSimulator {
    pub sim_host: String,
    pub sim_port: u16,
    pub region_x: f32,
    pub region_y: f32,
}

/// Tell the client where to fetch the new region's capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstablishAgentCommunication {
    pub agent_id: Uuid,
    pub sim_host: String,
    pub sim_port: u16,
    pub seed_capability: String,
}

// ---------------------------------------------------------------------------
// Verb & event name constants
// ---------------------------------------------------------------------------

pub mod capabilities {
    pub const SEED: &str = "seed";
    pub const REGION_ONLINE: &str = "region/online";
    pub const REGION_OFFLINE: &str = "region/offline";
    pub const CHILD_AVATAR_UPDATE: &str = "child_avatar/update";
    pub const REZ_AVATAR_REQUEST: &str = "rez_avatar/request";

    /// Everything a region serves besides `seed` itself.
    pub const NEIGHBOR: [&str; 4] = [
        REGION_ONLINE,
        REGION_OFFLINE,
        CHILD_AVATAR_UPDATE,
        REZ_AVATAR_REQUEST,
    ];
}

pub mod client_events {
    pub const ENABLE_SIMULATOR: &str = "EnableSimulator";
    pub const ESTABLISH_AGENT_COMMUNICATION: &str = "EstablishAgentCommunication";
}
