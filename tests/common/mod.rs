//! Shared test doubles: an in-memory transport that routes capability URLs
//! to other in-process regions, a recording client channel, and a
//! two-region fixture laid out side by side along X.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use region_sim::{
    ClientConnector, ClientEventChannel, RegionConfig, RegionService, RemoteRegionTransport,
    SceneInfo, StaticDirectory, TransportError, Vec3,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockTransport {
    regions: Mutex<HashMap<String, Weak<RegionService>>>,
    calls: Mutex<Vec<(String, Value)>>,
    /// Verbs that fail with a network error.
    failing: Mutex<HashSet<String>>,
    /// Canned replies by verb, bypassing the target region.
    overrides: Mutex<HashMap<String, Value>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn register(&self, region: &Arc<RegionService>) {
        let base = region.config().public_url.trim_end_matches('/').to_string();
        self.regions.lock().insert(base, Arc::downgrade(region));
    }

    pub fn fail_verb(&self, verb: &str) {
        self.failing.lock().insert(verb.to_string());
    }

    pub fn override_verb(&self, verb: &str, reply: Value) {
        self.overrides.lock().insert(verb.to_string(), reply);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Number of POSTs whose URL ends with `/verb`.
    pub fn count(&self, verb: &str) -> usize {
        let suffix = format!("/{verb}");
        self.calls
            .lock()
            .iter()
            .filter(|(url, _)| url.ends_with(&suffix))
            .count()
    }

    fn route(&self, url: &str) -> Option<(Arc<RegionService>, String)> {
        let regions = self.regions.lock();
        regions.iter().find_map(|(base, region)| {
            let verb = url.strip_prefix(base.as_str())?.strip_prefix('/')?;
            Some((region.upgrade()?, verb.to_string()))
        })
    }
}

#[async_trait]
impl RemoteRegionTransport for MockTransport {
    async fn post_json(&self, url: &str, payload: Value) -> Result<Value, TransportError> {
        self.calls.lock().push((url.to_string(), payload.clone()));

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (region, verb) = self
            .route(url)
            .ok_or_else(|| TransportError::Network(format!("no route to {url}")))?;
        if self.failing.lock().contains(&verb) {
            return Err(TransportError::Network("connection refused".into()));
        }
        let canned = self.overrides.lock().get(&verb).cloned();
        if let Some(reply) = canned {
            return Ok(reply);
        }

        let body = serde_json::to_vec(&payload)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        let reply = region.handle_message(&verb, &body);
        if reply.is_success() {
            Ok(reply.body)
        } else {
            Err(TransportError::Status(reply.status))
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingChannel {
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<String> {
        self.events.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl ClientEventChannel for RecordingChannel {
    fn queue_event(&self, event_type: &str, payload: Value) {
        self.events.lock().push((event_type.to_string(), payload));
    }
}

#[derive(Default)]
pub struct RecordingConnector {
    channels: Mutex<HashMap<Uuid, Arc<RecordingChannel>>>,
    refuse: AtomicBool,
}

impl RecordingConnector {
    pub fn refuse_all(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn channel(&self, agent_id: &Uuid) -> Option<Arc<RecordingChannel>> {
        self.channels.lock().get(agent_id).cloned()
    }
}

impl ClientConnector for RecordingConnector {
    fn connect(&self, agent_id: Uuid, _session_id: Uuid) -> Option<Arc<dyn ClientEventChannel>> {
        if self.refuse.load(Ordering::SeqCst) {
            return None;
        }
        let channel = Arc::new(RecordingChannel::default());
        self.channels.lock().insert(agent_id, channel.clone());
        Some(channel)
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub struct Pair {
    /// Region A spans (0,0)–(256,256).
    pub a: Arc<RegionService>,
    /// Region B spans (256,0)–(512,256).
    pub b: Arc<RegionService>,
    pub transport: Arc<MockTransport>,
    pub directory: Arc<StaticDirectory>,
    pub connector_a: Arc<RecordingConnector>,
    pub connector_b: Arc<RecordingConnector>,
}

pub fn region_config(name: &str, x: f32, port: u16) -> RegionConfig {
    RegionConfig {
        region_id: Uuid::new_v4(),
        name: name.into(),
        region_x: x,
        region_y: 0.0,
        sim_host: format!("10.0.0.{}", port - 9000 + 1),
        sim_port: port,
        public_url: format!("http://{}/caps", name.to_lowercase()),
        ..Default::default()
    }
}

pub fn scene_info(config: &RegionConfig) -> SceneInfo {
    let bounds = config.world_bounds();
    SceneInfo::new(
        config.region_id,
        config.name.clone(),
        bounds.min,
        bounds.max,
        config.capability_url("seed"),
    )
}

pub fn pair_with(tweak: impl Fn(&mut RegionConfig)) -> Pair {
    let mut config_a = region_config("A", 0.0, 9000);
    let mut config_b = region_config("B", 256.0, 9001);
    tweak(&mut config_a);
    tweak(&mut config_b);

    let directory = Arc::new(StaticDirectory::new(vec![
        scene_info(&config_a),
        scene_info(&config_b),
    ]));
    let transport = Arc::new(MockTransport::default());
    let connector_a = Arc::new(RecordingConnector::default());
    let connector_b = Arc::new(RecordingConnector::default());

    let a = Arc::new(RegionService::new(
        config_a,
        directory.clone(),
        transport.clone(),
        Some(connector_a.clone()),
    ));
    let b = Arc::new(RegionService::new(
        config_b,
        directory.clone(),
        transport.clone(),
        Some(connector_b.clone()),
    ));
    transport.register(&a);
    transport.register(&b);

    Pair {
        a,
        b,
        transport,
        directory,
        connector_a,
        connector_b,
    }
}

pub fn pair() -> Pair {
    pair_with(|_| {})
}

pub fn at(x: f32, y: f32) -> Vec3 {
    Vec3::new(x, y, 25.0)
}

/// Poll `cond` until it holds or about a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
