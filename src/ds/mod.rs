pub mod intrusive_list;
pub mod shard;
pub mod slot_arena;

pub use intrusive_list::{IntrusiveList, Linked, Links};
pub use shard::{MAX_SEGMENTS, SegmentSelector, hash_key, spread_hash};
pub use slot_arena::{SlotArena, SlotId};
