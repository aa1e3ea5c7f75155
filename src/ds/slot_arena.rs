//! Slot-indexed storage for segment entries.
//!
//! Every entry a segment owns lives in one `SlotArena`. The eviction and
//! expiration orderings refer to entries by [`SlotId`], so one slot backs
//! both lists and no entry ever points at another through a Rust reference.
//!
//! ```text
//!   slots:     [ Some(e0) | None | Some(e2) | Some(e3) | None ]
//!   free_list: [ 4, 1 ]          (LIFO: next insert reuses slot 1)
//! ```
//!
//! Freed slots are recycled, so a `SlotId` alone does not identify an entry
//! across its whole lifetime. Callers that hold ids outside the owning lock
//! (the recency queue) pair them with a per-entry stamp.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) usize);

#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Option<T>>,
    free_list: Vec<usize>,
    len: usize,
}

impl<T> SlotArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Stores `value` in a free slot (reusing the most recently freed one).
    pub fn insert(&mut self, value: T) -> SlotId {
        let idx = if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(value);
            idx
        } else {
            self.slots.push(Some(value));
            self.slots.len() - 1
        };
        self.len += 1;
        SlotId(idx)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.0)?;
        let value = slot.take()?;
        self.free_list.push(id.0);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Moves every stored value out, leaving the arena empty.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.free_list.clear();
        self.len = 0;
        self.slots.drain(..).flatten()
    }
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
