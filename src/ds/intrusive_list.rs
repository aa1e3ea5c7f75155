//! Intrusive doubly linked list threaded through values in a `SlotArena`.
//!
//! Unlike a list that owns its nodes, an `IntrusiveList<O>` only owns a head,
//! a tail and a length. The `prev`/`next` links live inside the arena values
//! themselves, one [`Links`] pair per ordering `O`. A value that carries two
//! pairs can therefore sit in two lists at once, each ordering it
//! independently, with no allocation per list operation.
//!
//! ## Architecture
//!
//! ```text
//!   arena (SlotArena<Entry>)
//!   ┌────────┬──────────────────────────────────────────────────────┐
//!   │ SlotId │ Entry { ..., eviction: Links, expiration: Links }    │
//!   ├────────┼──────────────────────────────────────────────────────┤
//!   │ id_1   │ eviction { -, id_3 }     expiration { id_3, - }      │
//!   │ id_2   │ (not linked)             (not linked)                │
//!   │ id_3   │ eviction { id_1, - }     expiration { -, id_1 }      │
//!   └────────┴──────────────────────────────────────────────────────┘
//!
//!   IntrusiveList<EvictionOrder>:   head ─► [id_1] ◄──► [id_3] ◄── tail
//!   IntrusiveList<ExpirationOrder>: head ─► [id_3] ◄──► [id_1] ◄── tail
//! ```
//!
//! ## Operations
//! - `push_back(id)`: append, or move to the tail if already linked
//! - `remove(id)`: unlink; the value stays in the arena
//! - `front()`: next candidate at the head
//!
//! All operations are O(1) except `iter_ids` and `validate`.

use std::marker::PhantomData;

use crate::ds::slot_arena::{SlotArena, SlotId};

/// One ordering's link pair, embedded in an arena value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    linked: bool,
}

/// Gives an [`IntrusiveList<O>`] access to the link pair for ordering `O`.
pub trait Linked<O> {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Head/tail bookkeeping for one ordering over a shared arena.
pub struct IntrusiveList<O> {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
    _order: PhantomData<fn() -> O>,
}

impl<O> std::fmt::Debug for IntrusiveList<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrusiveList")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

impl<O> IntrusiveList<O> {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _order: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The id at the head (oldest end) of the list.
    pub fn front(&self) -> Option<SlotId> {
        self.head
    }

    /// The id at the tail (newest end) of the list.
    pub fn back(&self) -> Option<SlotId> {
        self.tail
    }

    /// Forgets every member without touching the arena.
    ///
    /// Only valid when the arena values are being discarded as well.
    pub fn reset(&mut self) {
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    pub fn contains<T: Linked<O>>(&self, arena: &SlotArena<T>, id: SlotId) -> bool {
        arena
            .get(id)
            .map(|value| value.links().linked)
            .unwrap_or(false)
    }

    /// Appends `id` at the tail, moving it there if it is already linked.
    ///
    /// Returns `false` if `id` is not in the arena.
    pub fn push_back<T: Linked<O>>(&mut self, arena: &mut SlotArena<T>, id: SlotId) -> bool {
        let linked = match arena.get(id) {
            Some(value) => value.links().linked,
            None => return false,
        };
        if linked {
            if self.tail == Some(id) {
                return true;
            }
            self.detach(arena, id);
        }
        self.attach_back(arena, id);
        true
    }

    /// Unlinks `id`; returns `false` if it was not a member.
    pub fn remove<T: Linked<O>>(&mut self, arena: &mut SlotArena<T>, id: SlotId) -> bool {
        if !self.contains(arena, id) {
            return false;
        }
        self.detach(arena, id);
        true
    }

    /// Unlinks and returns the head.
    pub fn pop_front<T: Linked<O>>(&mut self, arena: &mut SlotArena<T>) -> Option<SlotId> {
        let id = self.head?;
        self.detach(arena, id);
        Some(id)
    }

    /// Iterates ids from head to tail.
    pub fn iter_ids<'a, T: Linked<O>>(&self, arena: &'a SlotArena<T>) -> IdIter<'a, T, O> {
        IdIter {
            arena,
            current: self.head,
            _order: PhantomData,
        }
    }

    fn detach<T: Linked<O>>(&mut self, arena: &mut SlotArena<T>, id: SlotId) {
        let (prev, next) = match arena.get(id) {
            Some(value) => (value.links().prev, value.links().next),
            None => return,
        };

        if let Some(prev_id) = prev {
            if let Some(prev_value) = arena.get_mut(prev_id) {
                prev_value.links_mut().next = next;
            }
        } else {
            self.head = next;
        }

        if let Some(next_id) = next {
            if let Some(next_value) = arena.get_mut(next_id) {
                next_value.links_mut().prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if let Some(value) = arena.get_mut(id) {
            *value.links_mut() = Links::default();
        }
        self.len -= 1;
    }

    fn attach_back<T: Linked<O>>(&mut self, arena: &mut SlotArena<T>, id: SlotId) {
        let old_tail = self.tail;
        match arena.get_mut(id) {
            Some(value) => {
                *value.links_mut() = Links {
                    prev: old_tail,
                    next: None,
                    linked: true,
                };
            },
            None => return,
        }
        if let Some(old_tail) = old_tail {
            if let Some(tail_value) = arena.get_mut(old_tail) {
                tail_value.links_mut().next = Some(id);
            }
        } else {
            self.head = Some(id);
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Walks the list and checks linkage, membership flags and length.
    ///
    /// Returns a description of the first violation found.
    pub fn validate<T: Linked<O>>(&self, arena: &SlotArena<T>) -> Result<(), String> {
        if self.head.is_none() || self.tail.is_none() {
            if self.head.is_some() || self.tail.is_some() || self.len != 0 {
                return Err(format!(
                    "empty list has head {:?}, tail {:?}, len {}",
                    self.head, self.tail, self.len
                ));
            }
            return Ok(());
        }

        let mut count = 0usize;
        let mut current = self.head;
        let mut prev = None;
        while let Some(id) = current {
            let Some(value) = arena.get(id) else {
                return Err(format!("list member {:?} missing from arena", id));
            };
            let links = value.links();
            if !links.linked {
                return Err(format!("list member {:?} not flagged as linked", id));
            }
            if links.prev != prev {
                return Err(format!(
                    "member {:?} has prev {:?}, expected {:?}",
                    id, links.prev, prev
                ));
            }
            if links.next.is_none() && self.tail != Some(id) {
                return Err(format!("member {:?} ends the chain but is not the tail", id));
            }
            count += 1;
            if count > self.len {
                return Err(format!("chain longer than recorded len {}", self.len));
            }
            prev = Some(id);
            current = links.next;
        }

        if count != self.len {
            return Err(format!("chain has {} members, len says {}", count, self.len));
        }
        Ok(())
    }
}

impl<O> Default for IntrusiveList<O> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over ids from head to tail.
pub struct IdIter<'a, T, O> {
    arena: &'a SlotArena<T>,
    current: Option<SlotId>,
    _order: PhantomData<fn() -> O>,
}

impl<'a, T: Linked<O>, O> Iterator for IdIter<'a, T, O> {
    type Item = SlotId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let value = self.arena.get(id)?;
        self.current = value.links().next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct First;
    struct Second;

    #[derive(Default)]
    struct Node {
        first: Links,
        second: Links,
    }

    impl Linked<First> for Node {
        fn links(&self) -> &Links {
            &self.first
        }
        fn links_mut(&mut self) -> &mut Links {
            &mut self.first
        }
    }

    impl Linked<Second> for Node {
        fn links(&self) -> &Links {
            &self.second
        }
        fn links_mut(&mut self) -> &mut Links {
            &mut self.second
        }
    }

    fn arena_with(n: usize) -> (SlotArena<Node>, Vec<SlotId>) {
        let mut arena = SlotArena::new();
        let ids = (0..n).map(|_| arena.insert(Node::default())).collect();
        (arena, ids)
    }

    #[test]
    fn push_back_appends_and_moves() {
        let (mut arena, ids) = arena_with(3);
        let mut list: IntrusiveList<First> = IntrusiveList::new();
        for &id in &ids {
            assert!(list.push_back(&mut arena, id));
        }
        assert_eq!(list.iter_ids(&arena).collect::<Vec<_>>(), ids);

        list.push_back(&mut arena, ids[0]);
        assert_eq!(
            list.iter_ids(&arena).collect::<Vec<_>>(),
            vec![ids[1], ids[2], ids[0]]
        );
        assert_eq!(list.len(), 3);
        list.validate(&arena).unwrap();
    }

    #[test]
    fn two_orderings_are_independent() {
        let (mut arena, ids) = arena_with(3);
        let mut first: IntrusiveList<First> = IntrusiveList::new();
        let mut second: IntrusiveList<Second> = IntrusiveList::new();
        for &id in &ids {
            first.push_back(&mut arena, id);
        }
        for &id in ids.iter().rev() {
            second.push_back(&mut arena, id);
        }

        first.remove(&mut arena, ids[1]);
        assert!(!first.contains(&arena, ids[1]));
        assert!(second.contains(&arena, ids[1]));
        assert_eq!(first.front(), Some(ids[0]));
        assert_eq!(second.front(), Some(ids[2]));
        first.validate(&arena).unwrap();
        second.validate(&arena).unwrap();
    }

    #[test]
    fn pop_front_drains_in_order() {
        let (mut arena, ids) = arena_with(4);
        let mut list: IntrusiveList<First> = IntrusiveList::new();
        for &id in &ids {
            list.push_back(&mut arena, id);
        }
        let popped: Vec<_> = std::iter::from_fn(|| list.pop_front(&mut arena)).collect();
        assert_eq!(popped, ids);
        assert!(list.is_empty());
        assert_eq!(list.back(), None);
        list.validate(&arena).unwrap();
    }

    #[test]
    fn remove_unlinked_is_noop() {
        let (mut arena, ids) = arena_with(2);
        let mut list: IntrusiveList<First> = IntrusiveList::new();
        list.push_back(&mut arena, ids[0]);
        assert!(!list.remove(&mut arena, ids[1]));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn validate_reports_length_mismatch() {
        let (mut arena, ids) = arena_with(2);
        let mut list: IntrusiveList<First> = IntrusiveList::new();
        list.push_back(&mut arena, ids[0]);
        list.push_back(&mut arena, ids[1]);
        list.len = 5;
        assert!(list.validate(&arena).is_err());
    }
}
