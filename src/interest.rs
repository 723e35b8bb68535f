//! Per-presence prioritized outbound event queue.
//!
//! ## Flow
//!
//! ```text
//! scene mutation ──► InterestListEvent ──► EventHandler::prioritize
//!                                              │ None → dropped
//!                                              ▼
//!                     existing id? ── yes ──► EventHandler::combine ──► replace
//!                                  └─ no ───► add (handle recorded by id)
//!
//! tick ──► dequeue_events(n) ──► group by event type ──► EventHandler::send
//! ```
//!
//! Lower priority values are more urgent. Each list has its own lock, so
//! presences never contend with each other; handlers run with no list lock
//! held except `combine` and the prioritizer during `reprioritize`, which
//! must not call back into the same list.

use crate::entity::SceneEntity;
use crate::interval_heap::{Handle, IntervalHeap};
use crate::presence::ScenePresence;
use crate::types::Vec3;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something happened that a client may want to hear about.
#[derive(Debug, Clone)]
pub struct InterestListEvent {
    id: Uuid,
    event_type: String,
    position: Vec3,
    size: f32,
    payload: serde_json::Value,
}

impl InterestListEvent {
    /// `id` is the combinable identifier: a later event with the same id
    /// supersedes or merges with a queued one.
    pub fn new(
        id: Uuid,
        event_type: impl Into<String>,
        position: Vec3,
        size: f32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            position,
            size,
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn size(&self) -> f32 {
        self.size
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// An event bound to its computed priority and handler.
#[derive(Clone)]
pub struct QueuedEvent {
    pub event: Arc<InterestListEvent>,
    pub priority: f64,
    pub handler: Arc<dyn EventHandler>,
    seq: u64,
}

impl QueuedEvent {
    pub fn new(event: Arc<InterestListEvent>, priority: f64, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            event,
            priority,
            handler,
            seq: 0,
        }
    }
}

// Equal priorities dequeue in arrival order.
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedEvent {}

impl std::fmt::Debug for QueuedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedEvent")
            .field("id", &self.event.id)
            .field("type", &self.event.event_type)
            .field("priority", &self.priority)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Squared distance from the presence to the event. Monotonic in distance,
/// so it orders the same as the true distance without the square root.
pub fn distance_priority(event: &InterestListEvent, presence: &ScenePresence) -> f64 {
    f64::from(presence.scene_position().distance_squared(event.position()))
}

/// Prioritize, merge and deliver events of one type.
///
/// The defaults prioritize by squared distance, let the newer event win a
/// merge, and discard on send.
pub trait EventHandler: Send + Sync {
    /// `None` suppresses the event for this presence.
    fn prioritize(&self, event: &InterestListEvent, presence: &ScenePresence) -> Option<f64> {
        Some(distance_priority(event, presence))
    }

    fn combine(&self, existing: QueuedEvent, incoming: QueuedEvent) -> QueuedEvent {
        let _ = existing;
        incoming
    }

    /// Deliver one batch of same-typed events, most urgent first.
    fn send(&self, batch: Vec<QueuedEvent>, presence: &ScenePresence) {
        let _ = (batch, presence);
    }
}

/// All defaults: events of this type are queued, then discarded.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl EventHandler for DefaultHandler {}

/// Writes each batch to the presence's client channel as one JSON array.
///
/// Events beyond the presence's draw distance (plus the event's own size,
/// so large objects stay visible from further away) are suppressed.
#[derive(Debug, Default)]
pub struct ChannelHandler;

impl EventHandler for ChannelHandler {
    fn prioritize(&self, event: &InterestListEvent, presence: &ScenePresence) -> Option<f64> {
        let priority = distance_priority(event, presence);
        let reach = f64::from(presence.camera().draw_distance + event.size());
        (priority <= reach * reach).then_some(priority)
    }

    fn send(&self, batch: Vec<QueuedEvent>, presence: &ScenePresence) {
        let Some(first) = batch.first() else {
            return;
        };
        let event_type = first.event.event_type().to_string();
        let payloads = batch
            .iter()
            .map(|q| q.event.payload().clone())
            .collect::<Vec<_>>();
        presence
            .channel()
            .queue_event(&event_type, serde_json::Value::Array(payloads));
    }
}

// ---------------------------------------------------------------------------
// Interest list
// ---------------------------------------------------------------------------

struct ListState {
    heap: IntervalHeap<QueuedEvent>,
    by_id: HashMap<Uuid, Handle>,
    next_seq: u64,
}

pub struct InterestList {
    state: Mutex<ListState>,
}

impl InterestList {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ListState {
                heap: IntervalHeap::new(),
                by_id: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.state.lock().by_id.contains_key(id)
    }

    /// Priority of the queued entry for `id`, if any.
    pub fn priority_of(&self, id: &Uuid) -> Option<f64> {
        let state = self.state.lock();
        let handle = state.by_id.get(id)?;
        state.heap.get(*handle).map(|q| q.priority)
    }

    /// Queue `event` for `presence`, merging with any queued event that
    /// shares its id. Returns `false` if the handler suppressed it.
    pub fn enqueue_event(
        &self,
        event: Arc<InterestListEvent>,
        handler: Arc<dyn EventHandler>,
        presence: &ScenePresence,
    ) -> bool {
        let Some(priority) = handler.prioritize(&event, presence) else {
            return false;
        };

        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let mut incoming = QueuedEvent::new(event, priority, handler.clone());
        incoming.seq = seq;

        let id = incoming.event.id();
        let existing = state
            .by_id
            .get(&id)
            .copied()
            .and_then(|h| state.heap.get(h).cloned().map(|q| (h, q)));

        match existing {
            Some((handle, queued)) => {
                let mut survivor = handler.combine(queued, incoming);
                survivor.seq = seq;
                debug_assert_eq!(survivor.event.id(), id, "combine must keep the event id");
                state.heap.replace(handle, survivor);
            }
            None => {
                let handle = state.heap.add(incoming);
                state.by_id.insert(id, handle);
            }
        }
        true
    }

    /// Pop up to `count` of the most urgent events and hand them to their
    /// senders, one call per event type. Returns how many were dequeued.
    pub fn dequeue_events(&self, count: usize, presence: &ScenePresence) -> usize {
        let mut batches: IndexMap<String, Vec<QueuedEvent>> = IndexMap::new();
        let mut dequeued = 0;
        {
            let mut state = self.state.lock();
            while dequeued < count {
                let Ok(queued) = state.heap.delete_min() else {
                    break;
                };
                state.by_id.remove(&queued.event.id());
                batches
                    .entry(queued.event.event_type().to_string())
                    .or_default()
                    .push(queued);
                dequeued += 1;
            }
        }

        for (_, batch) in batches {
            let handler = batch[0].handler.clone();
            handler.send(batch, presence);
        }
        dequeued
    }

    /// Recompute every queued priority against the presence's current
    /// position; events the handler now suppresses are dropped.
    pub fn reprioritize(&self, presence: &ScenePresence) {
        let mut state = self.state.lock();
        let entries: Vec<(Handle, QueuedEvent)> = state
            .heap
            .iter()
            .map(|(h, q)| (h, q.clone()))
            .collect();

        for (handle, mut queued) in entries {
            match queued.handler.prioritize(&queued.event, presence) {
                Some(priority) => {
                    queued.priority = priority;
                    state.heap.replace(handle, queued);
                }
                None => {
                    let dropped = state.heap.delete(handle);
                    state.by_id.remove(&dropped.event.id());
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.heap.clear();
        state.by_id.clear();
    }
}

impl Default for InterestList {
    fn default() -> Self {
        Self::new()
    }
}
