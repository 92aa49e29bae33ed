//! Cache Items and the Item Arena
//!
//! An [`Item`] is shared between the associative index, its size-class LRU
//! list, the deletion queue and any connection streaming it to a client.
//! None of them owns it: items live in an [`ItemArena`] and everybody else
//! holds a copyable [`ItemId`]. The reference count on the item decides when
//! the arena slot (and the slab chunk behind it) may be reclaimed.

use crate::storage::slabs::ClassId;
use bytes::Bytes;
use std::ops::{Index, IndexMut};
use std::time::Instant;

/// Fixed per-item overhead counted against the slab class, in bytes.
pub const ITEM_HEADER_SIZE: usize = 48;

/// Total accounted size of an item: header, key padded to 4 bytes
/// (including a terminator byte), and value.
pub fn item_total_size(key_len: usize, nbytes: usize) -> usize {
    let mut len = key_len + 1;
    if len % 4 != 0 {
        len += 4 - (len % 4);
    }
    ITEM_HEADER_SIZE
        .saturating_add(len)
        .saturating_add(nbytes)
}

/// Stable handle to an item in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(usize);

impl ItemId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A cache entry.
#[derive(Debug)]
pub struct Item {
    key: Bytes,
    /// Slab chunk; the first `nbytes` bytes hold the value
    data: Box<[u8]>,
    nbytes: usize,
    ntotal: usize,
    class: ClassId,
    /// Opaque client flags, returned verbatim
    pub flags: u32,
    /// When this item expires (None = never)
    pub expire_at: Option<Instant>,
    pub(crate) refcount: u32,
    pub(crate) linked: bool,
    pub(crate) deleted: bool,
    pub(crate) last_access: Instant,
    pub(crate) prev: Option<ItemId>,
    pub(crate) next: Option<ItemId>,
}

impl Item {
    pub(crate) fn new(
        key: Bytes,
        data: Box<[u8]>,
        nbytes: usize,
        ntotal: usize,
        class: ClassId,
        flags: u32,
        expire_at: Option<Instant>,
    ) -> Self {
        debug_assert!(nbytes <= data.len());
        Self {
            key,
            data,
            nbytes,
            ntotal,
            class,
            flags,
            expire_at,
            refcount: 0,
            linked: false,
            deleted: false,
            last_access: Instant::now(),
            prev: None,
            next: None,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The stored value, including its trailing `\r\n`.
    pub fn value(&self) -> &[u8] {
        &self.data[..self.nbytes]
    }

    pub fn value_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.nbytes]
    }

    /// Length of the stored value, including its trailing `\r\n`.
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Length reported to clients (without the trailing `\r\n`).
    pub fn data_len(&self) -> usize {
        self.nbytes.saturating_sub(2)
    }

    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Checks if this item has expired.
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.map(|exp| now >= exp).unwrap_or(false)
    }

    pub(crate) fn into_chunk(self) -> (ClassId, Box<[u8]>) {
        (self.class, self.data)
    }
}

/// Slot arena holding every allocated item.
#[derive(Debug, Default)]
pub struct ItemArena {
    slots: Vec<Option<Item>>,
    free_list: Vec<usize>,
    len: usize,
}

impl ItemArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: Item) -> ItemId {
        let idx = if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(item);
            idx
        } else {
            self.slots.push(Some(item));
            self.slots.len() - 1
        };
        self.len += 1;
        ItemId(idx)
    }

    pub fn remove(&mut self, id: ItemId) -> Option<Item> {
        let item = self.slots.get_mut(id.0)?.take()?;
        self.free_list.push(id.0);
        self.len -= 1;
        Some(item)
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.get(id).is_some()
    }

    /// Number of items currently holding storage.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Index<ItemId> for ItemArena {
    type Output = Item;

    fn index(&self, id: ItemId) -> &Item {
        match self.slots.get(id.0) {
            Some(Some(item)) => item,
            _ => panic!("stale item handle {}", id.0),
        }
    }
}

impl IndexMut<ItemId> for ItemArena {
    fn index_mut(&mut self, id: ItemId) -> &mut Item {
        match self.slots.get_mut(id.0) {
            Some(Some(item)) => item,
            _ => panic!("stale item handle {}", id.0),
        }
    }
}
