//! region-sim-server binary
//!
//! Brings one region online, ticks it, and announces it offline on Ctrl-C.
//!
//! ## Configuration (TOML file + `REGION_*` env via `config` crate)
//!
//! | Key                         | Default                        | Description                     |
//! |-----------------------------|--------------------------------|---------------------------------|
//! | `REGION_REGION_ID`          | random                         | Region UUID                     |
//! | `REGION_NAME`               | `region`                       | Display name                    |
//! | `REGION_REGION_X` / `_Y`    | `0`                            | World-space south-west corner   |
//! | `REGION_SIM_HOST`           | `127.0.0.1`                    | Host handed to arriving clients |
//! | `REGION_SIM_PORT`           | `9000`                         | Port handed to arriving clients |
//! | `REGION_PUBLIC_URL`         | `http://127.0.0.1:9000/caps`   | Capability base URL             |
//! | `REGION_HANDOFF_TIMEOUT_MS` | `10000`                        | Handoff request timeout         |
//!
//! Static neighbors are listed in the file as `[[neighbors]]` tables with
//! `id`, `name`, `x`, `y` and `seed_capability`. CLI flags override both.

use anyhow::{Context, Result};
use clap::Parser;
use region_sim::{
    host::{HostConfig, RegionHost},
    ClientConnector, ClientEventChannel, HttpTransport, RegionConfig, RegionService, SceneInfo,
    StaticDirectory, Vec3,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "region-sim-server", about = "Region Simulator", version)]
struct Args {
    /// Configuration file (TOML, optional)
    #[arg(long, env = "REGION_CONFIG", default_value = "region.toml")]
    config: String,

    /// Region display name
    #[arg(long)]
    name: Option<String>,

    /// World-space X of the region's south-west corner
    #[arg(long)]
    region_x: Option<f32>,

    /// World-space Y of the region's south-west corner
    #[arg(long)]
    region_y: Option<f32>,

    /// Host handed to clients arriving from neighbors
    #[arg(long)]
    sim_host: Option<String>,

    /// Port handed to clients arriving from neighbors
    #[arg(long)]
    sim_port: Option<u16>,

    /// Base URL of this region's capabilities
    #[arg(long)]
    public_url: Option<String>,

    /// Tick rate (Hz)
    #[arg(long, env = "REGION_TICK_RATE_HZ", default_value_t = 20.0)]
    tick_rate_hz: f32,
}

/// Static neighbor entry from the configuration file.
#[derive(Debug, Clone, Deserialize)]
struct NeighborEntry {
    id: Uuid,
    name: String,
    x: f32,
    y: f32,
    #[serde(default = "default_size")]
    size_x: f32,
    #[serde(default = "default_size")]
    size_y: f32,
    seed_capability: String,
}

fn default_size() -> f32 {
    256.0
}

impl From<NeighborEntry> for SceneInfo {
    fn from(n: NeighborEntry) -> Self {
        let min = Vec3::new(n.x, n.y, 0.0);
        SceneInfo::new(
            n.id,
            n.name,
            min,
            min + Vec3::new(n.size_x, n.size_y, 0.0),
            n.seed_capability,
        )
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Accepts every arriving agent and logs what would be sent to its viewer.
struct LoggingConnector;

struct LoggingChannel {
    agent_id: Uuid,
}

impl ClientEventChannel for LoggingChannel {
    fn queue_event(&self, event_type: &str, payload: serde_json::Value) {
        tracing::debug!(agent = %self.agent_id, event_type, %payload, "client event");
    }
}

impl ClientConnector for LoggingConnector {
    fn connect(&self, agent_id: Uuid, _session_id: Uuid) -> Option<Arc<dyn ClientEventChannel>> {
        Some(Arc::new(LoggingChannel { agent_id }))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn load_config(args: &Args) -> Result<(RegionConfig, Vec<NeighborEntry>)> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::with_prefix("REGION").try_parsing(true))
        .build()
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    let mut region: RegionConfig = settings
        .clone()
        .try_deserialize()
        .context("Invalid region configuration")?;
    let neighbors: Vec<NeighborEntry> = match settings.get("neighbors") {
        Ok(list) => list,
        Err(config::ConfigError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e).context("Invalid neighbor list"),
    };

    if let Some(name) = &args.name {
        region.name = name.clone();
    }
    if let Some(x) = args.region_x {
        region.region_x = x;
    }
    if let Some(y) = args.region_y {
        region.region_y = y;
    }
    if let Some(host) = &args.sim_host {
        region.sim_host = host.clone();
    }
    if let Some(port) = args.sim_port {
        region.sim_port = port;
    }
    if let Some(url) = &args.public_url {
        region.public_url = url.clone();
    }
    if region.region_id.is_nil() {
        region.region_id = Uuid::new_v4();
        log::warn!("No region id configured, using {}", region.region_id);
    }
    Ok((region, neighbors))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("region_sim=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let (region, neighbors) = load_config(&args)?;

    log::info!(
        "Starting region-sim-server (name='{}', id={}, origin=({}, {}), neighbors={})",
        region.name,
        region.region_id,
        region.region_x,
        region.region_y,
        neighbors.len(),
    );

    let directory = Arc::new(StaticDirectory::new(
        neighbors.into_iter().map(SceneInfo::from).collect(),
    ));
    let transport = Arc::new(
        HttpTransport::new(region.handoff_timeout()).context("Failed to build HTTP client")?,
    );

    let service = Arc::new(RegionService::new(
        region,
        directory,
        transport,
        Some(Arc::new(LoggingConnector)),
    ));

    let host_config = HostConfig {
        tick_rate_hz: args.tick_rate_hz,
    };

    // Run until shutdown
    RegionHost::new(host_config, service).run().await;
    Ok(())
}
