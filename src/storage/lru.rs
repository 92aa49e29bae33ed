//! Per-Class LRU Lists
//!
//! Each slab class has its own doubly linked list threaded through the
//! `prev`/`next` handles of the items in the arena. The head is the most
//! recently used item and the tail the least recently used one, which is
//! where eviction starts looking.

use crate::storage::items::{ItemArena, ItemId};

/// One size class's LRU list.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruList {
    head: Option<ItemId>,
    tail: Option<ItemId>,
    len: usize,
}

impl LruList {
    pub fn head(&self) -> Option<ItemId> {
        self.head
    }

    pub fn tail(&self) -> Option<ItemId> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Makes `id` the new head.
    pub fn push_head(&mut self, items: &mut ItemArena, id: ItemId) {
        let old_head = self.head;
        {
            let item = &mut items[id];
            item.prev = None;
            item.next = old_head;
        }
        if let Some(next) = old_head {
            items[next].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
        self.len += 1;
    }

    /// Detaches `id` from the list.
    pub fn remove(&mut self, items: &mut ItemArena, id: ItemId) {
        let (prev, next) = {
            let item = &mut items[id];
            (item.prev.take(), item.next.take())
        };

        if self.head == Some(id) {
            self.head = next;
        }
        if self.tail == Some(id) {
            self.tail = prev;
        }
        if let Some(next) = next {
            items[next].prev = prev;
        }
        if let Some(prev) = prev {
            items[prev].next = next;
        }
        self.len -= 1;
    }

    /// Walks the list from head to tail.
    pub fn iter<'a>(&self, items: &'a ItemArena) -> LruIter<'a> {
        LruIter {
            items,
            cursor: self.head,
        }
    }
}

/// Head-to-tail iterator over an [`LruList`].
pub struct LruIter<'a> {
    items: &'a ItemArena,
    cursor: Option<ItemId>,
}

impl Iterator for LruIter<'_> {
    type Item = ItemId;

    fn next(&mut self) -> Option<ItemId> {
        let id = self.cursor?;
        self.cursor = self.items[id].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::items::Item;
    use crate::storage::slabs::{SlabAllocator, SlabConfig};
    use bytes::Bytes;

    fn insert(items: &mut ItemArena, key: &'static str) -> ItemId {
        let slabs = SlabAllocator::new(SlabConfig::default());
        let class = slabs.classify(64).unwrap();
        items.insert(Item::new(
            Bytes::from_static(key.as_bytes()),
            vec![0u8; 64].into_boxed_slice(),
            0,
            64,
            class,
            0,
            None,
        ))
    }

    #[test]
    fn test_push_head_orders_newest_first() {
        let mut items = ItemArena::new();
        let mut list = LruList::default();
        let a = insert(&mut items, "a");
        let b = insert(&mut items, "b");
        let c = insert(&mut items, "c");

        for id in [a, b, c] {
            list.push_head(&mut items, id);
        }

        assert_eq!(list.iter(&items).collect::<Vec<_>>(), vec![c, b, a]);
        assert_eq!(list.head(), Some(c));
        assert_eq!(list.tail(), Some(a));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_relinks_neighbours() {
        let mut items = ItemArena::new();
        let mut list = LruList::default();
        let ids: Vec<_> = ["a", "b", "c"].into_iter().map(|k| insert(&mut items, k)).collect();
        for &id in &ids {
            list.push_head(&mut items, id);
        }

        // Middle
        list.remove(&mut items, ids[1]);
        assert_eq!(list.iter(&items).collect::<Vec<_>>(), vec![ids[2], ids[0]]);
        assert!(items[ids[1]].prev.is_none() && items[ids[1]].next.is_none());

        // Tail, then head
        list.remove(&mut items, ids[0]);
        assert_eq!(list.tail(), Some(ids[2]));
        list.remove(&mut items, ids[2]);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail(), None);
    }
}
