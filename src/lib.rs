//! Region Simulator Core
//!
//! Scene concurrency, interest management and region-to-region handoff for
//! one region of a multi-region virtual world.
//!
//! ## Architecture
//!
//! ```text
//! RegionHost  (host.rs)                ← lifecycle, tick loop
//!   └── RegionService  (service.rs)    ← per-tick orchestration, stats
//!         ├── SceneGraph  (scene.rs)   ← DualKeyMap by local id / global id
//!         │     └── ScenePresence  (presence.rs)
//!         │           └── InterestList  (interest.rs) ← IntervalHeap
//!         ├── NeighborService  (neighbors.rs) ← CompactingQueue, inbound verbs
//!         └── BorderCrossing  (border.rs)     ← detection, throttle, handoff
//! ```
//!
//! Collaborators outside the core are injected as traits:
//! [`DirectoryLookup`], [`RemoteRegionTransport`], [`ClientEventChannel`]
//! and [`ClientConnector`]. The `server` feature adds a reqwest-backed
//! transport and the `region-sim-server` binary.

pub mod border;
pub mod compacting_queue;
pub mod directory;
pub mod dual_key_map;
pub mod entity;
pub mod error;
pub mod host;
pub mod interest;
pub mod interval_heap;
pub mod neighbors;
pub mod presence;
pub mod protocol;
pub mod scene;
pub mod service;
pub mod transport;
pub mod types;

// Network transport requires the `server` feature.
#[cfg(feature = "server")]
pub mod http;

// Convenience re-exports
pub use border::BorderCrossing;
pub use compacting_queue::CompactingQueue;
pub use directory::{DirectoryLookup, SceneInfo, StaticDirectory};
pub use dual_key_map::DualKeyMap;
pub use entity::{EntityIdentity, Linkable, Physical, SceneEntity, SceneObject, Transform};
pub use error::{HandoffError, MessageError, QueueError, TransportError};
pub use host::{HostConfig, RegionHost};
#[cfg(feature = "server")]
pub use http::HttpTransport;
pub use interest::{
    ChannelHandler, DefaultHandler, EventHandler, InterestList, InterestListEvent, QueuedEvent,
};
pub use interval_heap::{Handle, IntervalHeap};
pub use neighbors::{NeighborReply, NeighborService};
pub use presence::ScenePresence;
pub use scene::SceneGraph;
pub use service::{RegionService, TickReport};
pub use transport::{ClientConnector, ClientEventChannel, NullChannel, RemoteRegionTransport};
pub use types::{Aabb, Camera, Quat, RegionConfig, SceneStats, Vec3};
