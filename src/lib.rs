//! # flashcache - A memcached-compatible caching daemon
//!
//! flashcache keeps arbitrary byte values in memory, addressed by short text
//! keys, and serves them over the memcached text protocol. Memory is carved
//! into power-of-two slab classes and each class evicts in LRU order once
//! its memory runs out.
//!
//! ## Features
//!
//! - **memcached text protocol**: `get`, `set`, `add`, `replace`, `delete`,
//!   `incr`, `decr`, `stats`, `version`, `quit`
//! - **Slab allocation**: bounded memory with per-class LRU eviction
//! - **Delayed deletes**: deleted keys stay blocked for a short grace period
//! - **Single-threaded event loop**: one Tokio thread, no locks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              flashcache                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │ state mach. │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │   Line      │    │              StorageEngine                   │    │
//! │  │   Parser    │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │    │
//! │  │             │    │  │ Slabs  │ │  LRU   │ │ Index  │ │ Stats  │ │    │
//! │  └─────────────┘    │  └────────┘ └────────┘ └────────┘ └────────┘ │    │
//! │                     └──────────────────────────────────────────────┘    │
//! │                                               ▲                         │
//! │                     ┌─────────────────────────┴───────────────────────┐ │
//! │                     │           DeleteSweeper                         │ │
//! │                     │      (spawn_local timer task)                   │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use flashcache::commands::{CommandHandler, HandlerSettings};
//! use flashcache::server::accept_loop;
//! use flashcache::storage::{DeleteSweeper, DeletionConfig, SlabConfig, StorageEngine};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use tokio::net::TcpListener;
//! use tokio::task::LocalSet;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     LocalSet::new()
//!         .run_until(async {
//!             let storage = Rc::new(RefCell::new(StorageEngine::new(SlabConfig::default())));
//!             let _sweeper = DeleteSweeper::start(Rc::clone(&storage), DeletionConfig::default());
//!             let handler = CommandHandler::new(storage, HandlerSettings::default());
//!
//!             let listener = TcpListener::bind("127.0.0.1:11211").await?;
//!             accept_loop(listener, handler, 1024).await;
//!             Ok::<_, anyhow::Error>(())
//!         })
//!         .await
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: request line parser and reply types
//! - [`storage`]: slab allocator, items, LRU lists and the engine tying them together
//! - [`commands`]: executes parsed commands against the engine
//! - [`connection`]: the per-client state machine
//! - [`server`]: accept loop and connection tasks
//! - [`config`]: command-line configuration
//!
//! ## Design Highlights
//!
//! ### No Locks
//!
//! Every task runs on the same thread, so the engine is shared as
//! `Rc<RefCell<_>>`. A borrow is never held across an `.await`.
//!
//! ### Pinned Values
//!
//! `get` pins each hit with a reference count while its value is streamed
//! out. A pinned item may be replaced or deleted, but its memory is only
//! reused once the last reader lets go.
//!
//! ### Lazy Expiry
//!
//! Expired items are not swept. A lookup that finds one unlinks it, and the
//! LRU tail reclaims the rest under memory pressure.

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::{CliAction, Config, ConfigError};
pub use connection::Connection;
pub use protocol::{parse_command, Command, ParseError, Reply};
pub use server::{accept_loop, serve_connection};
pub use storage::{DeleteSweeper, DeletionConfig, StorageEngine};

/// The default port flashcache listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// Version of flashcache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
