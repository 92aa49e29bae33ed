//! Associative index: exact-match key lookup for linked items.

use crate::storage::items::ItemId;
use bytes::Bytes;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ItemIndex {
    map: HashMap<Bytes, ItemId>,
}

impl ItemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `key` to `id`, returning the handle it replaced.
    pub fn insert(&mut self, key: Bytes, id: ItemId) -> Option<ItemId> {
        self.map.insert(key, id)
    }

    pub fn find(&self, key: &[u8]) -> Option<ItemId> {
        self.map.get(key).copied()
    }

    pub fn delete(&mut self, key: &[u8]) -> Option<ItemId> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
