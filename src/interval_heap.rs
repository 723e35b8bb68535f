//! Double-ended priority queue with stable handles.
//!
//! An interval heap stores its elements in pairs: node `i` owns positions
//! `2i` (the low end) and `2i + 1` (the high end). The low ends form a
//! min-heap, the high ends a max-heap, and every node's interval encloses
//! the intervals of its children. This gives `O(log n)` removal from both
//! ends, and removal or replacement at an arbitrary position is a local
//! repair that works the same way for either end.
//!
//! Every element is tracked through a slot in a side arena. A [`Handle`]
//! names a slot plus the generation it was issued under, so a handle keeps
//! resolving to its element however much the heap reorders, and a handle
//! to a deleted element is detected instead of silently aliasing a newer one.

use crate::error::QueueError;

/// Opaque reference to an element of an [`IntervalHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    position: usize,
    generation: u32,
    occupied: bool,
}

#[derive(Debug)]
struct Entry<T> {
    item: T,
    slot: u32,
}

#[derive(Debug)]
pub struct IntervalHeap<T> {
    entries: Vec<Entry<T>>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl<T: Ord> IntervalHeap<T> {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `item`, returning a handle that stays valid until the item is
    /// deleted.
    pub fn add(&mut self, item: T) -> Handle {
        let handle = self.allocate_slot();
        let pos = self.entries.len();
        self.entries.push(Entry {
            item,
            slot: handle.slot,
        });
        self.slots[handle.slot as usize].position = pos;

        if pos % 2 == 1 && self.less(pos, pos - 1) {
            self.swap(pos, pos - 1);
        }
        let node = pos / 2;
        self.bubble_up_min(node);
        self.bubble_up_max(node);
        handle
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.position_of(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.position_of(handle).map(|pos| &self.entries[pos].item)
    }

    /// Swap the element behind `handle` for `item` and restore heap order.
    /// The handle remains valid and now refers to `item`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is stale or was issued by another heap.
    pub fn replace(&mut self, handle: Handle, item: T) -> T {
        let pos = self.expect_position(handle);
        let old = std::mem::replace(&mut self.entries[pos].item, item);
        self.restore(pos);
        old
    }

    /// Remove the element behind `handle`. The handle becomes stale.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is stale or was issued by another heap.
    pub fn delete(&mut self, handle: Handle) -> T {
        let pos = self.expect_position(handle);
        self.remove_at(pos)
    }

    pub fn find_min(&self) -> Result<&T, QueueError> {
        self.entries
            .first()
            .map(|e| &e.item)
            .ok_or(QueueError::EmptyCollection)
    }

    pub fn find_max(&self) -> Result<&T, QueueError> {
        match self.entries.len() {
            0 => Err(QueueError::EmptyCollection),
            1 => Ok(&self.entries[0].item),
            _ => Ok(&self.entries[1].item),
        }
    }

    pub fn delete_min(&mut self) -> Result<T, QueueError> {
        if self.entries.is_empty() {
            return Err(QueueError::EmptyCollection);
        }
        Ok(self.remove_at(0))
    }

    pub fn delete_max(&mut self) -> Result<T, QueueError> {
        match self.entries.len() {
            0 => Err(QueueError::EmptyCollection),
            1 => Ok(self.remove_at(0)),
            _ => Ok(self.remove_at(1)),
        }
    }

    /// Iterate over every element with its handle, in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.entries.iter().map(move |e| {
            let handle = Handle {
                slot: e.slot,
                generation: self.slots[e.slot as usize].generation,
            };
            (handle, &e.item)
        })
    }

    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            let slot = &mut self.slots[entry.slot as usize];
            slot.occupied = false;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(entry.slot);
        }
    }

    // -----------------------------------------------------------------------
    // Slot arena
    // -----------------------------------------------------------------------

    fn allocate_slot(&mut self) -> Handle {
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.occupied = true;
            return Handle {
                slot,
                generation: s.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            position: 0,
            generation: 0,
            occupied: true,
        });
        Handle {
            slot,
            generation: 0,
        }
    }

    fn position_of(&self, handle: Handle) -> Option<usize> {
        let slot = self.slots.get(handle.slot as usize)?;
        (slot.occupied && slot.generation == handle.generation).then_some(slot.position)
    }

    fn expect_position(&self, handle: Handle) -> usize {
        match self.position_of(handle) {
            Some(pos) => pos,
            None => panic!("stale or foreign interval heap handle {:?}", handle),
        }
    }

    fn remove_at(&mut self, pos: usize) -> T {
        let entry = self.entries.swap_remove(pos);
        let slot = &mut self.slots[entry.slot as usize];
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(entry.slot);

        if pos < self.entries.len() {
            let moved = self.entries[pos].slot;
            self.slots[moved as usize].position = pos;
            self.restore(pos);
        }
        entry.item
    }

    // -----------------------------------------------------------------------
    // Heap maintenance
    // -----------------------------------------------------------------------

    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[a].item < self.entries[b].item
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        let sa = self.entries[a].slot as usize;
        let sb = self.entries[b].slot as usize;
        self.slots[sa].position = a;
        self.slots[sb].position = b;
    }

    /// Position holding the high end of `node` (the low end for a lone
    /// element in the last node).
    fn max_pos(&self, node: usize) -> usize {
        let hi = 2 * node + 1;
        if hi < self.entries.len() {
            hi
        } else {
            2 * node
        }
    }

    /// Repair the heap after the element at `pos` changed arbitrarily.
    fn restore(&mut self, pos: usize) {
        let node = pos / 2;
        let lo = 2 * node;
        if lo + 1 < self.entries.len() && self.less(lo + 1, lo) {
            self.swap(lo, lo + 1);
        }
        self.trickle_down_min(node);
        self.trickle_down_max(node);
        self.bubble_up_min(node);
        self.bubble_up_max(node);
    }

    fn bubble_up_min(&mut self, mut node: usize) {
        while node > 0 {
            let parent = (node - 1) / 2;
            if !self.less(2 * node, 2 * parent) {
                break;
            }
            self.swap(2 * node, 2 * parent);
            node = parent;
        }
    }

    fn bubble_up_max(&mut self, mut node: usize) {
        while node > 0 {
            let parent = (node - 1) / 2;
            let pos = self.max_pos(node);
            if !self.less(2 * parent + 1, pos) {
                break;
            }
            self.swap(pos, 2 * parent + 1);
            node = parent;
        }
    }

    fn trickle_down_min(&mut self, mut node: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * node + 1;
            let right = left + 1;
            if 2 * left >= len {
                break;
            }
            let mut child = left;
            if 2 * right < len && self.less(2 * right, 2 * left) {
                child = right;
            }
            if !self.less(2 * child, 2 * node) {
                break;
            }
            self.swap(2 * child, 2 * node);
            if 2 * child + 1 < len && self.less(2 * child + 1, 2 * child) {
                self.swap(2 * child, 2 * child + 1);
            }
            node = child;
        }
    }

    fn trickle_down_max(&mut self, mut node: usize) {
        let len = self.entries.len();
        loop {
            let hi = 2 * node + 1;
            let left = 2 * node + 1;
            let right = left + 1;
            if hi >= len || 2 * left >= len {
                break;
            }
            let mut child = left;
            if 2 * right < len && self.less(self.max_pos(left), self.max_pos(right)) {
                child = right;
            }
            let child_hi = self.max_pos(child);
            if !self.less(hi, child_hi) {
                break;
            }
            self.swap(hi, child_hi);
            if child_hi == 2 * child + 1 && self.less(child_hi, 2 * child) {
                self.swap(2 * child, child_hi);
            }
            node = child;
        }
    }
}

impl<T: Ord> Default for IntervalHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}
