//! Rate-limited queue that coalesces repeated updates per key.
//!
//! Values are held in an insertion-ordered map: re-adding a key overwrites
//! its value but keeps its place in line. A Tokio interval task releases
//! the oldest entries at no more than `events_per_second`, carrying the
//! fractional remainder of its release budget from tick to tick.

use indexmap::IndexMap;
use log::{debug, error};
use parking_lot::Mutex;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type Deliver<V> = Arc<dyn Fn(V) + Send + Sync>;

struct QueueState<K, V> {
    pending: IndexMap<K, V>,
    /// Unspent release budget in milliseconds.
    ticket_ms: f64,
    last_tick: Option<Instant>,
}

pub struct CompactingQueue<K, V> {
    state: Mutex<QueueState<K, V>>,
    events_per_second: f64,
    interval: Duration,
    deliver: Deliver<V>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> CompactingQueue<K, V>
where
    K: Hash + Eq + Send + 'static,
    V: Send + 'static,
{
    /// `deliver` is called once per released value, outside the queue lock.
    /// A panicking delivery is logged and drops only that value.
    pub fn new(
        events_per_second: f64,
        interval: Duration,
        deliver: impl Fn(V) + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: IndexMap::new(),
                ticket_ms: 0.0,
                last_tick: None,
            }),
            events_per_second: events_per_second.max(f64::MIN_POSITIVE),
            interval,
            deliver: Arc::new(deliver),
            timer: Mutex::new(None),
        }
    }

    /// Queue `value` under `key`. Returns `true` if the key was not already
    /// pending; an existing key keeps its position and takes the new value.
    pub fn add(&self, key: K, value: V) -> bool {
        self.state.lock().pending.insert(key, value).is_none()
    }

    pub fn remove(&self, key: &K) -> bool {
        self.state.lock().pending.shift_remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Start the release timer. Does nothing if already running.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.last_tick = Some(Instant::now());
            state.ticket_ms = 0.0;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = weak.upgrade() else {
                    break;
                };
                queue.release_due(Instant::now());
            }
        }));
    }

    /// Stop the timer. With `flush`, every pending value is delivered in
    /// queue order before returning; otherwise pending values are dropped.
    pub fn stop(&self, flush: bool) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        let drained: Vec<V> = {
            let mut state = self.state.lock();
            state.last_tick = None;
            state.ticket_ms = 0.0;
            state.pending.drain(..).map(|(_, v)| v).collect()
        };
        if flush {
            debug!("Flushing {} queued values", drained.len());
            for value in drained {
                self.deliver_one(value);
            }
        } else if !drained.is_empty() {
            debug!("Dropping {} queued values", drained.len());
        }
    }

    /// Release whatever the rate budget allows as of `now`. This is the
    /// timer's tick body; hosts with their own clock may drive it directly.
    /// Returns the number of values delivered.
    pub fn release_due(&self, now: Instant) -> usize {
        let batch: Vec<V> = {
            let mut state = self.state.lock();
            let elapsed = match state.last_tick {
                Some(last) => now.saturating_duration_since(last),
                None => Duration::ZERO,
            };
            state.last_tick = Some(now);
            state.ticket_ms += elapsed.as_nanos() as f64 / 1_000_000.0;

            let ms_per_event = 1000.0 / self.events_per_second;
            let allowed = (state.ticket_ms / ms_per_event).floor();
            // Whole tickets are spent whether or not there was work for
            // them; only the fraction carries over.
            state.ticket_ms -= allowed * ms_per_event;

            let count = (allowed as usize).min(state.pending.len());
            state.pending.drain(..count).map(|(_, v)| v).collect()
        };

        let released = batch.len();
        for value in batch {
            self.deliver_one(value);
        }
        released
    }

    fn deliver_one(&self, value: V) {
        if catch_unwind(AssertUnwindSafe(|| (self.deliver)(value))).is_err() {
            error!("Queued value delivery panicked, value dropped");
        }
    }
}

impl<K, V> Drop for CompactingQueue<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}
