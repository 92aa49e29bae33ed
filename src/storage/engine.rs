//! Item Store
//!
//! This module implements the core storage engine for flashcache: a
//! size-classed LRU registry of items backed by the slab allocator and
//! indexed by key.
//!
//! ## Item Lifecycle
//!
//! ```text
//!   allocate ──> candidate ──link──> linked ──unlink──> unlinked ──┐
//!                   │                 │  ▲                          │
//!                   │ discard         └──┘ touch                    │ refcount == 0
//!                   ▼                                               ▼
//!                 freed <───────────────────────────────────────── freed
//! ```
//!
//! An item is visible to lookups exactly while it is linked; while linked
//! it sits in its class's LRU list. Storage goes back to the slab allocator
//! only once the item is unlinked **and** nobody holds a reference to it.
//! Connections streaming an item and the deletion queue pin items with
//! [`StorageEngine::add_reference`] and must give the pin back with
//! [`StorageEngine::remove_reference`].
//!
//! ## Eviction
//!
//! When a slab class is full, the allocator looks for a victim in that
//! class's LRU list only, probing at most [`EVICTION_PROBES`] items from the
//! tail. Pinned items are skipped; if none of the probed items is free the
//! allocation fails without touching anything.

use crate::storage::deletion::DeleteQueue;
use crate::storage::index::ItemIndex;
use crate::storage::items::{item_total_size, Item, ItemArena, ItemId};
use crate::storage::lru::LruList;
use crate::storage::slabs::{ClassId, SlabAllocator, SlabConfig};
use crate::storage::stats::Stats;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::trace;

/// Longest key accepted by the protocol.
pub const MAX_KEY_LENGTH: usize = 250;

/// How many items from the LRU tail are probed for an eviction victim.
pub const EVICTION_PROBES: usize = 50;

/// Output budget of `stats cachedump` (2 MiB).
pub const CACHEDUMP_LIMIT: usize = 2 * 1024 * 1024;

/// Output budget of `stats items`.
pub const ITEM_STATS_LIMIT: usize = 4096;

/// Granularity of the `stats sizes` histogram.
const SIZE_BUCKET: usize = 32;

/// Number of histogram buckets (objects up to 1 MiB).
const SIZE_BUCKETS: usize = 32768;

const END: &str = "END\r\n";

/// Errors returned by [`StorageEngine::allocate`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No slab class can hold an item this large
    #[error("object too large for cache")]
    TooLarge,

    /// The class is full and nothing could be evicted
    #[error("out of memory")]
    OutOfMemory,
}

/// The item store.
///
/// Owns every item, the per-class LRU lists, the key index, the slab
/// allocator, the deletion queue and the global statistics. It is owned by
/// the event loop and shared between connections as
/// `Rc<RefCell<StorageEngine>>`.
///
/// # Example
///
/// ```
/// use flashcache::storage::{SlabConfig, StorageEngine};
///
/// let mut engine = StorageEngine::new(SlabConfig::default());
///
/// let id = engine.allocate(b"name", 0, None, 6).unwrap();
/// engine.item_mut(id).value_mut().copy_from_slice(b"Ariz\r\n");
/// engine.link(id);
///
/// assert_eq!(engine.find(b"name"), Some(id));
/// assert_eq!(engine.item(id).value(), b"Ariz\r\n");
/// ```
pub struct StorageEngine {
    items: ItemArena,
    lru: Vec<LruList>,
    index: ItemIndex,
    slabs: SlabAllocator,
    deletes: DeleteQueue,
    stats: Stats,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("classes", &self.lru.len())
            .field("linked", &self.index.len())
            .field("allocated", &self.items.len())
            .field("pending_deletes", &self.deletes.len())
            .finish()
    }
}

impl StorageEngine {
    /// Creates an empty store on top of a fresh slab allocator.
    pub fn new(config: SlabConfig) -> Self {
        let slabs = SlabAllocator::new(config);
        let lru = vec![LruList::default(); slabs.num_classes()];

        Self {
            items: ItemArena::new(),
            lru,
            index: ItemIndex::new(),
            slabs,
            deletes: DeleteQueue::new(),
            stats: Stats::new(),
        }
    }

    pub fn item(&self, id: ItemId) -> &Item {
        &self.items[id]
    }

    pub fn item_mut(&mut self, id: ItemId) -> &mut Item {
        &mut self.items[id]
    }

    /// Returns true while `id` still holds storage.
    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains(id)
    }

    /// Number of items holding storage, linked or not.
    pub fn allocated(&self) -> usize {
        self.items.len()
    }

    /// Number of linked items.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    pub fn slabs(&self) -> &SlabAllocator {
        &self.slabs
    }

    /// Items of one class from most to least recently used.
    pub fn lru_order(&self, class: ClassId) -> Vec<ItemId> {
        self.lru[class.index()].iter(&self.items).collect()
    }

    /// Raw index lookup. Does not look at the deleted flag or expiry.
    pub fn find(&self, key: &[u8]) -> Option<ItemId> {
        self.index.find(key)
    }

    /// Looks up an item that a client may see.
    ///
    /// Deleted items are invisible. Expired items are unlinked as a side
    /// effect and reported as missing.
    pub fn find_live(&mut self, key: &[u8], now: Instant) -> Option<ItemId> {
        let id = self.index.find(key)?;
        if self.items[id].deleted {
            return None;
        }
        if self.items[id].is_expired(now) {
            self.unlink(id);
            return None;
        }
        Some(id)
    }

    /// Allocates an unlinked item with room for `nbytes` bytes of value.
    ///
    /// If the size class is full, one unpinned item is evicted from the tail
    /// of that class's LRU list and the allocation is retried once.
    pub fn allocate(
        &mut self,
        key: &[u8],
        flags: u32,
        expire_at: Option<Instant>,
        nbytes: usize,
    ) -> Result<ItemId, AllocError> {
        let ntotal = item_total_size(key.len(), nbytes);
        let class = self.slabs.classify(ntotal).ok_or(AllocError::TooLarge)?;

        let chunk = match self.slabs.allocate(class) {
            Some(chunk) => chunk,
            None => {
                if !self.evict(class) {
                    return Err(AllocError::OutOfMemory);
                }
                self.slabs
                    .allocate(class)
                    .ok_or(AllocError::OutOfMemory)?
            }
        };

        let item = Item::new(
            Bytes::copy_from_slice(key),
            chunk,
            nbytes,
            ntotal,
            class,
            flags,
            expire_at,
        );
        Ok(self.items.insert(item))
    }

    /// Evicts the first unpinned item found from the tail of `class`.
    fn evict(&mut self, class: ClassId) -> bool {
        let mut cursor = self.lru[class.index()].tail();

        for _ in 0..EVICTION_PROBES {
            let Some(id) = cursor else { break };
            if self.items[id].refcount == 0 {
                trace!(class = %class, key = ?self.items[id].key(), "Evicting item");
                self.unlink(id);
                self.stats.evictions += 1;
                return true;
            }
            cursor = self.items[id].prev;
        }

        false
    }

    /// Makes an item visible: index entry, LRU head, stats.
    ///
    /// Any item previously linked under the same key must have been
    /// unlinked first (see [`StorageEngine::replace`]).
    pub fn link(&mut self, id: ItemId) {
        let item = &mut self.items[id];
        if item.linked {
            debug_assert!(false, "item linked twice");
            return;
        }
        item.linked = true;
        item.last_access = Instant::now();
        let (key, class, ntotal) = (item.key().clone(), item.class(), item.ntotal() as u64);

        let replaced = self.index.insert(key, id);
        debug_assert!(replaced.is_none(), "key was still linked to another item");

        self.lru[class.index()].push_head(&mut self.items, id);

        self.stats.curr_bytes += ntotal;
        self.stats.curr_items += 1;
        self.stats.total_items += 1;
    }

    /// Hides an item from lookups and frees it unless it is pinned.
    pub fn unlink(&mut self, id: ItemId) {
        let item = &mut self.items[id];
        if !item.linked {
            return;
        }
        item.linked = false;
        let (class, ntotal, refcount) = (item.class(), item.ntotal() as u64, item.refcount);

        self.index.delete(self.items[id].key());
        self.lru[class.index()].remove(&mut self.items, id);

        self.stats.curr_bytes = self.stats.curr_bytes.saturating_sub(ntotal);
        self.stats.curr_items = self.stats.curr_items.saturating_sub(1);

        if refcount == 0 {
            self.free(id);
        }
    }

    /// Pins an item so its storage outlives an unlink.
    pub fn add_reference(&mut self, id: ItemId) {
        self.items[id].refcount += 1;
    }

    /// Drops one pin. Frees the item if that was the last pin and the item
    /// is no longer linked.
    pub fn remove_reference(&mut self, id: ItemId) {
        let item = &mut self.items[id];
        if item.refcount > 0 {
            item.refcount -= 1;
        }
        if item.refcount == 0 && !item.linked {
            self.free(id);
        }
    }

    /// Moves a linked item to the head of its LRU list.
    pub fn touch(&mut self, id: ItemId) {
        let item = &mut self.items[id];
        if !item.linked {
            return;
        }
        item.last_access = Instant::now();
        let class = item.class();

        let list = &mut self.lru[class.index()];
        list.remove(&mut self.items, id);
        list.push_head(&mut self.items, id);
    }

    /// Unlinks `old` and links `new` in its place.
    pub fn replace(&mut self, old: ItemId, new: ItemId) {
        self.unlink(old);
        self.link(new);
    }

    /// Frees a candidate item that was never linked.
    pub fn discard(&mut self, id: ItemId) {
        let item = &self.items[id];
        debug_assert!(!item.linked, "discarding a linked item");
        if !item.linked && item.refcount == 0 {
            self.free(id);
        }
    }

    fn free(&mut self, id: ItemId) {
        if let Some(item) = self.items.remove(id) {
            debug_assert!(!item.is_linked() && item.refcount() == 0);
            let (class, chunk) = item.into_chunk();
            self.slabs.release(class, chunk);
        }
    }

    /// Marks a linked item deleted until `until`, pinning it and queueing it
    /// for the sweeper.
    pub fn mark_deleted(&mut self, id: ItemId, until: Instant) {
        let item = &mut self.items[id];
        item.refcount += 1;
        item.expire_at = Some(until);
        item.deleted = true;
        self.deletes.push(id);
    }

    /// Finalizes every queued deletion whose grace period has passed and
    /// returns how many were finalized.
    ///
    /// The item stays linked, but its expiry is now in the past, so the next
    /// lookup unlinks it (or eviction picks it up first).
    pub fn sweep_deleted(&mut self, now: Instant) -> usize {
        let items = &self.items;
        let due = self.deletes.take_due(|id| items[id].is_expired(now));

        for &id in &due {
            self.items[id].deleted = false;
            self.remove_reference(id);
        }
        due.len()
    }

    /// Number of items waiting in the deletion queue.
    pub fn pending_deletes(&self) -> usize {
        self.deletes.len()
    }

    /// `stats cachedump`: lists up to `limit` items of one class from the
    /// head of its LRU list (0 = no limit).
    pub fn cachedump(&self, class: ClassId, limit: usize) -> String {
        let mut out = String::new();

        for (shown, id) in self.lru[class.index()].iter(&self.items).enumerate() {
            if limit != 0 && shown >= limit {
                break;
            }
            let item = &self.items[id];
            let line = format!(
                "ITEM {} [{} b; {} s]\r\n",
                String::from_utf8_lossy(item.key()),
                item.data_len(),
                self.stats.unix_time(item.last_access),
            );
            if out.len() + line.len() + END.len() > CACHEDUMP_LIMIT {
                break;
            }
            out.push_str(&line);
        }

        out.push_str(END);
        out
    }

    /// `stats items`: item count and age of the oldest item per class.
    pub fn item_stats(&self) -> String {
        let now = Instant::now();
        let mut out = String::new();

        for class in self.slabs.class_ids() {
            let list = &self.lru[class.index()];
            let Some(tail) = list.tail() else { continue };
            let age = now
                .saturating_duration_since(self.items[tail].last_access)
                .as_secs();
            let entry = format!(
                "STAT items:{class}:number {}\r\nSTAT items:{class}:age {age}\r\n",
                list.len()
            );
            if out.len() + entry.len() + END.len() > ITEM_STATS_LIMIT {
                break;
            }
            out.push_str(&entry);
        }

        out.push_str(END);
        out
    }

    /// `stats sizes`: histogram of linked item sizes in 32-byte buckets.
    pub fn size_histogram(&self) -> String {
        let mut histogram: BTreeMap<usize, u64> = BTreeMap::new();

        for list in &self.lru {
            for id in list.iter(&self.items) {
                let bucket = self.items[id].ntotal().div_ceil(SIZE_BUCKET);
                if bucket < SIZE_BUCKETS {
                    *histogram.entry(bucket).or_default() += 1;
                }
            }
        }

        let mut out = String::new();
        for (bucket, count) in histogram {
            let _ = write!(out, "{} {}\r\n", bucket * SIZE_BUCKET, count);
        }
        out.push_str(END);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::items::ITEM_HEADER_SIZE;
    use std::time::Duration;

    /// One 1 KiB page of budget, so the 512-byte class holds two items.
    fn tiny_engine() -> StorageEngine {
        StorageEngine::new(SlabConfig {
            mem_limit: 1024,
            page_size: 1024,
            min_chunk: 64,
        })
    }

    fn store(engine: &mut StorageEngine, key: &str, value: &str) -> ItemId {
        let mut data = value.as_bytes().to_vec();
        data.extend_from_slice(b"\r\n");
        let id = engine.allocate(key.as_bytes(), 0, None, data.len()).unwrap();
        engine.item_mut(id).value_mut().copy_from_slice(&data);
        engine.link(id);
        id
    }

    /// A value big enough to land in the 512-byte class.
    fn big_value() -> String {
        "x".repeat(400)
    }

    #[test]
    fn test_link_makes_item_visible() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");

        assert_eq!(engine.find(b"key"), Some(id));
        assert!(engine.item(id).is_linked());
        assert_eq!(engine.item(id).value(), b"value\r\n");
        assert_eq!(engine.item(id).data_len(), 5);
        assert_eq!(engine.lru_order(engine.item(id).class()), vec![id]);
        assert_eq!(engine.stats().curr_items, 1);
        assert_eq!(engine.stats().total_items, 1);
        assert_eq!(engine.stats().curr_bytes, engine.item(id).ntotal() as u64);
    }

    #[test]
    fn test_unlink_removes_and_frees() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");
        let class = engine.item(id).class();

        engine.unlink(id);

        assert_eq!(engine.find(b"key"), None);
        assert!(engine.lru_order(class).is_empty());
        assert!(!engine.contains(id));
        assert_eq!(engine.allocated(), 0);
        assert_eq!(engine.stats().curr_items, 0);
        assert_eq!(engine.stats().curr_bytes, 0);
        assert_eq!(engine.stats().total_items, 1);
    }

    #[test]
    fn test_pinned_item_outlives_unlink() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");

        engine.add_reference(id);
        engine.unlink(id);

        // Invisible, but still readable by whoever holds the pin
        assert_eq!(engine.find(b"key"), None);
        assert!(engine.contains(id));
        assert_eq!(engine.item(id).value(), b"value\r\n");

        engine.remove_reference(id);
        assert!(!engine.contains(id));
    }

    #[test]
    fn test_refcount_floor() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");

        // Dropping a pin that was never taken keeps a linked item alive
        engine.remove_reference(id);
        assert_eq!(engine.item(id).refcount(), 0);
        assert!(engine.contains(id));
        assert_eq!(engine.find(b"key"), Some(id));
    }

    #[test]
    fn test_touch_orders_lru() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let a = store(&mut engine, "a", "1");
        let b = store(&mut engine, "b", "2");
        let c = store(&mut engine, "c", "3");
        let class = engine.item(a).class();

        assert_eq!(engine.lru_order(class), vec![c, b, a]);

        engine.touch(a);
        engine.touch(b);
        assert_eq!(engine.lru_order(class), vec![b, a, c]);
    }

    #[test]
    fn test_replace_swaps_items() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let old = store(&mut engine, "key", "old");
        engine.add_reference(old);

        let new = engine.allocate(b"key", 7, None, 5).unwrap();
        engine.item_mut(new).value_mut().copy_from_slice(b"new\r\n");
        engine.replace(old, new);

        assert_eq!(engine.find(b"key"), Some(new));
        assert_eq!(engine.item(new).flags, 7);
        assert!(!engine.item(old).is_linked());
        assert_eq!(engine.stats().curr_items, 1);

        engine.remove_reference(old);
        assert!(!engine.contains(old));
    }

    #[test]
    fn test_discard_candidate() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = engine.allocate(b"key", 0, None, 5).unwrap();
        assert_eq!(engine.allocated(), 1);

        engine.discard(id);
        assert_eq!(engine.allocated(), 0);
        assert_eq!(engine.find(b"key"), None);
    }

    #[test]
    fn test_allocate_too_large() {
        let mut engine = tiny_engine();
        let result = engine.allocate(b"key", 0, None, 2000);
        assert_eq!(result, Err(AllocError::TooLarge));
    }

    #[test]
    fn test_eviction_takes_lru_tail() {
        let mut engine = tiny_engine();
        let first = store(&mut engine, "first", &big_value());
        let second = store(&mut engine, "second", &big_value());

        let third = store(&mut engine, "third", &big_value());

        assert!(!engine.contains(first));
        assert_eq!(engine.find(b"first"), None);
        assert_eq!(engine.find(b"second"), Some(second));
        assert_eq!(engine.find(b"third"), Some(third));
        assert_eq!(engine.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_skips_pinned_items() {
        let mut engine = tiny_engine();
        let first = store(&mut engine, "first", &big_value());
        let second = store(&mut engine, "second", &big_value());
        engine.add_reference(first);

        let _third = store(&mut engine, "third", &big_value());

        assert!(engine.contains(first));
        assert_eq!(engine.find(b"first"), Some(first));
        assert!(!engine.contains(second));
    }

    #[test]
    fn test_eviction_fails_cleanly_when_all_pinned() {
        let mut engine = tiny_engine();
        let first = store(&mut engine, "first", &big_value());
        let second = store(&mut engine, "second", &big_value());
        engine.add_reference(first);
        engine.add_reference(second);
        let class = engine.item(first).class();

        let result = engine.allocate(b"third", 0, None, 402);

        assert_eq!(result, Err(AllocError::OutOfMemory));
        assert_eq!(engine.lru_order(class), vec![second, first]);
        assert_eq!(engine.allocated(), 2);
        assert_eq!(engine.stats().evictions, 0);
    }

    #[test]
    fn test_eviction_stays_within_class() {
        let mut engine = tiny_engine();
        // Small items fill their own class's first page
        let small = store(&mut engine, "small", "v");
        let _a = store(&mut engine, "a", &big_value());
        let _b = store(&mut engine, "b", &big_value());
        let _c = store(&mut engine, "c", &big_value());

        assert!(engine.contains(small));
        assert_eq!(engine.find(b"small"), Some(small));
    }

    #[test]
    fn test_find_live_unlinks_expired() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");
        let now = Instant::now();
        engine.item_mut(id).expire_at = Some(now);

        assert_eq!(engine.find_live(b"key", now), None);
        assert_eq!(engine.find(b"key"), None);
        assert!(!engine.contains(id));
    }

    #[test]
    fn test_find_live_keeps_unexpired() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");
        let now = Instant::now();
        engine.item_mut(id).expire_at = Some(now + Duration::from_secs(60));

        assert_eq!(engine.find_live(b"key", now), Some(id));
    }

    #[test]
    fn test_deleted_item_hidden_until_swept() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");
        let now = Instant::now();
        let grace = now + Duration::from_secs(4);

        engine.mark_deleted(id, grace);

        assert_eq!(engine.find_live(b"key", now), None);
        assert_eq!(engine.find(b"key"), Some(id));
        assert_eq!(engine.item(id).refcount(), 1);
        assert_eq!(engine.pending_deletes(), 1);

        // Grace period not over yet
        assert_eq!(engine.sweep_deleted(now), 0);
        assert!(engine.item(id).is_deleted());

        let later = grace + Duration::from_secs(1);
        assert_eq!(engine.sweep_deleted(later), 1);
        assert_eq!(engine.pending_deletes(), 0);
        assert!(!engine.item(id).is_deleted());
        assert_eq!(engine.item(id).refcount(), 0);

        // Now simply expired: the next lookup reclaims it
        assert_eq!(engine.find_live(b"key", later), None);
        assert!(!engine.contains(id));
    }

    #[test]
    fn test_sweep_frees_unlinked_deleted_item() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");
        let now = Instant::now();

        engine.mark_deleted(id, now);
        engine.unlink(id);
        assert!(engine.contains(id));

        assert_eq!(engine.sweep_deleted(now), 1);
        assert!(!engine.contains(id));
    }

    #[test]
    fn test_cachedump() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let a = store(&mut engine, "a", "one");
        let _b = store(&mut engine, "b", "two");
        let class = engine.item(a).class();

        let dump = engine.cachedump(class, 0);
        let lines: Vec<&str> = dump.split("\r\n").collect();
        assert!(lines[0].starts_with("ITEM b [3 b; "));
        assert!(lines[1].starts_with("ITEM a [3 b; "));
        assert_eq!(lines[2], "END");

        let limited = engine.cachedump(class, 1);
        assert_eq!(limited.matches("ITEM ").count(), 1);
    }

    #[test]
    fn test_item_stats_and_sizes() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let id = store(&mut engine, "key", "value");
        let class = engine.item(id).class();

        let report = engine.item_stats();
        assert!(report.contains(&format!("STAT items:{class}:number 1\r\n")));
        assert!(report.ends_with("END\r\n"));

        // 48 + 4 + 7 = 59 bytes, bucket 64
        assert_eq!(engine.item(id).ntotal(), ITEM_HEADER_SIZE + 4 + 7);
        assert_eq!(engine.size_histogram(), "64 1\r\nEND\r\n");
    }
}
