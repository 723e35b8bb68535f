//! Map reachable through two independent keys, with snapshot iteration.
//!
//! Mutation and keyed lookup go through a single reader/writer lock over
//! both hash maps. Every mutation also publishes a fresh immutable array of
//! the values through an [`ArcSwap`], so hot iteration paths can walk a
//! consistent snapshot without touching the lock at all.
//!
//! A map may also carry a projected view: a second published array holding
//! the values a projection accepts, rebuilt under the same write lock as the
//! main snapshot so the two never disagree about membership.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

struct Maps<K1, K2, V> {
    by_first: HashMap<K1, (K2, V)>,
    by_second: HashMap<K2, (K1, V)>,
}

impl<K1, K2, V> Maps<K1, K2, V>
where
    K1: Copy + Eq + Hash + Debug,
    K2: Copy + Eq + Hash + Debug,
    V: Clone,
{
    fn insert(&mut self, first: K1, second: K2, value: V) -> bool {
        let known_second = self.by_first.get(&first).map(|(k, _)| *k);
        let known_first = self.by_second.get(&second).map(|(k, _)| *k);

        let inserted = match (known_second, known_first) {
            (None, None) => true,
            (Some(s), Some(f)) if s == second && f == first => false,
            _ => panic!(
                "dual-key integrity violation: ({:?}, {:?}) collides with existing ({:?}, {:?})",
                first, second, known_first, known_second
            ),
        };

        self.by_first.insert(first, (second, value.clone()));
        self.by_second.insert(second, (first, value));
        inserted
    }

    fn remove_second(&mut self, second: &K2) -> Option<(K1, V)> {
        let (first, value) = self.by_second.remove(second)?;
        self.by_first.remove(&first);
        Some((first, value))
    }
}

type Projection<V, W> = Box<dyn Fn(&V) -> Option<W> + Send + Sync>;

struct View<V, W> {
    project: Projection<V, W>,
    values: ArcSwap<Vec<W>>,
}

pub struct DualKeyMap<K1, K2, V, W = V> {
    maps: RwLock<Maps<K1, K2, V>>,
    snapshot: ArcSwap<Vec<V>>,
    view: Option<View<V, W>>,
}

impl<K1, K2, V> DualKeyMap<K1, K2, V>
where
    K1: Copy + Eq + Hash + Debug,
    K2: Copy + Eq + Hash + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self::build(None)
    }
}

impl<K1, K2, V, W> DualKeyMap<K1, K2, V, W>
where
    K1: Copy + Eq + Hash + Debug,
    K2: Copy + Eq + Hash + Debug,
    V: Clone,
{
    /// A map that also publishes `project(v)` for every value the
    /// projection accepts. See [`view`](Self::view).
    pub fn with_view(project: impl Fn(&V) -> Option<W> + Send + Sync + 'static) -> Self {
        Self::build(Some(View {
            project: Box::new(project),
            values: ArcSwap::from_pointee(Vec::new()),
        }))
    }

    fn build(view: Option<View<V, W>>) -> Self {
        Self {
            maps: RwLock::new(Maps {
                by_first: HashMap::new(),
                by_second: HashMap::new(),
            }),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            view,
        }
    }

    /// Insert `value` under both keys, or replace it if this exact key pair
    /// is already present. Returns `true` for a fresh insert.
    ///
    /// # Panics
    ///
    /// Panics if either key is already bound to a different partner key:
    /// two distinct values would be sharing one slot.
    pub fn add_or_update(&self, first: K1, second: K2, value: V) -> bool {
        let mut maps = self.maps.write();
        let inserted = maps.insert(first, second, value);
        self.publish(&maps);
        inserted
    }

    /// Return the value bound to `second`, or insert the pair produced by
    /// `make` if there is none. Lookup and insert happen under one write
    /// lock, and `make` only runs when the insert goes ahead. The flag is
    /// `true` when `make` ran.
    ///
    /// # Panics
    ///
    /// Panics if the first key produced by `make` is already taken.
    pub fn get_or_insert_with(&self, second: K2, make: impl FnOnce() -> (K1, V)) -> (V, bool) {
        let mut maps = self.maps.write();
        if let Some((_, value)) = maps.by_second.get(&second) {
            return (value.clone(), false);
        }
        let (first, value) = make();
        maps.insert(first, second, value.clone());
        self.publish(&maps);
        (value, true)
    }

    /// Bind `value` to `(first, second)`, evicting whatever entry held
    /// `second` before, in one critical section. Returns the evicted pair.
    ///
    /// # Panics
    ///
    /// Panics if `first` is bound to some other second key.
    pub fn swap(&self, first: K1, second: K2, value: V) -> Option<(K1, V)> {
        let mut maps = self.maps.write();
        if let Some((bound, _)) = maps.by_first.get(&first) {
            if *bound != second {
                panic!(
                    "dual-key integrity violation: {:?} is bound to {:?}, not {:?}",
                    first, bound, second
                );
            }
        }
        let evicted = maps.remove_second(&second);
        maps.insert(first, second, value);
        self.publish(&maps);
        evicted
    }

    /// Remove the value bound to either key, together with its partner key.
    /// Returns `true` if anything was present under either key.
    pub fn remove(&self, first: K1, second: K2) -> bool {
        let mut maps = self.maps.write();
        let mut removed = false;
        if let Some((partner, _)) = maps.by_first.remove(&first) {
            maps.by_second.remove(&partner);
            removed = true;
        }
        if maps.remove_second(&second).is_some() {
            removed = true;
        }
        if removed {
            self.publish(&maps);
        }
        removed
    }

    pub fn remove_by_first(&self, first: K1) -> Option<V> {
        let mut maps = self.maps.write();
        let (second, value) = maps.by_first.remove(&first)?;
        maps.by_second.remove(&second);
        self.publish(&maps);
        Some(value)
    }

    pub fn remove_by_second(&self, second: K2) -> Option<V> {
        let mut maps = self.maps.write();
        let (_, value) = maps.remove_second(&second)?;
        self.publish(&maps);
        Some(value)
    }

    pub fn get_by_first(&self, first: &K1) -> Option<V> {
        self.maps.read().by_first.get(first).map(|(_, v)| v.clone())
    }

    pub fn get_by_second(&self, second: &K2) -> Option<V> {
        self.maps.read().by_second.get(second).map(|(_, v)| v.clone())
    }

    /// Visit every value while holding the shared lock. The lock is not
    /// reentrant: `action` must not mutate this map.
    pub fn for_each(&self, mut action: impl FnMut(&V)) {
        let maps = self.maps.read();
        for (_, value) in maps.by_first.values() {
            action(value);
        }
    }

    /// Lock-free view of all values as of the last mutation.
    pub fn snapshot(&self) -> Arc<Vec<V>> {
        self.snapshot.load_full()
    }

    /// Lock-free projected values as of the last mutation. Always empty for
    /// a map built without a projection.
    pub fn view(&self) -> Arc<Vec<W>> {
        match &self.view {
            Some(view) => view.values.load_full(),
            None => Arc::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.by_first.clear();
        maps.by_second.clear();
        self.publish(&maps);
    }

    // Called with the write lock held so snapshots publish in mutation order.
    fn publish(&self, maps: &Maps<K1, K2, V>) {
        let values: Vec<V> = maps.by_first.values().map(|(_, v)| v.clone()).collect();
        if let Some(view) = &self.view {
            let projected: Vec<W> = values.iter().filter_map(|v| (view.project)(v)).collect();
            view.values.store(Arc::new(projected));
        }
        self.snapshot.store(Arc::new(values));
    }
}

impl<K1, K2, V> Default for DualKeyMap<K1, K2, V>
where
    K1: Copy + Eq + Hash + Debug,
    K2: Copy + Eq + Hash + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
