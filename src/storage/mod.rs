//! Storage Module
//!
//! This module provides the item store behind flashcache: slab-allocated
//! items, per-class LRU lists, the key index, deferred deletion and the
//! global counters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StorageEngine                          │
//! │  ┌───────────┐  ┌─────────────────────┐  ┌──────────────┐   │
//! │  │ ItemIndex │  │ LRU per slab class  │  │ DeleteQueue  │   │
//! │  │ key → id  │  │ head ⇄ ... ⇄ tail   │  │ pinned ids   │   │
//! │  └─────┬─────┘  └──────────┬──────────┘  └──────┬───────┘   │
//! │        └──────────┬────────┴─────────────────────┘          │
//! │                   ▼                                         │
//! │             ItemArena ◄──── chunks ──── SlabAllocator       │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!              ┌─────────────┴─────────────┐
//!              │      DeleteSweeper        │
//!              │   (spawn_local, every 5s) │
//!              └───────────────────────────┘
//! ```
//!
//! The whole server runs on one thread, so the engine is shared as
//! `Rc<RefCell<StorageEngine>>` and never borrowed across an `.await`.
//!
//! ## Example
//!
//! ```
//! use flashcache::storage::{SlabConfig, StorageEngine};
//! use std::time::Instant;
//!
//! let mut engine = StorageEngine::new(SlabConfig::default());
//!
//! let id = engine.allocate(b"session", 0, None, 10).unwrap();
//! engine.item_mut(id).value_mut().copy_from_slice(b"token123\r\n");
//! engine.link(id);
//!
//! let found = engine.find_live(b"session", Instant::now()).unwrap();
//! assert_eq!(engine.item(found).data_len(), 8);
//! ```

pub mod deletion;
pub mod engine;
pub mod index;
pub mod items;
pub mod lru;
pub mod slabs;
pub mod stats;

// Re-export commonly used types
pub use deletion::{DeleteSweeper, DeletionConfig};
pub use engine::{AllocError, StorageEngine, MAX_KEY_LENGTH};
pub use items::{Item, ItemId};
pub use slabs::{ClassId, SlabConfig};
pub use stats::Stats;
