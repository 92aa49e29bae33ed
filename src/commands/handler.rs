//! Command Handler Module
//!
//! This module implements the memcached-style commands for flashcache. It
//! receives request lines, parses them, executes them against the item store
//! and tells the connection what to do next.
//!
//! ## Supported Commands
//!
//! ### Storage Commands
//! - `set <key> <flags> <exptime> <bytes> [noreply]` - Store unconditionally
//! - `add <key> <flags> <exptime> <bytes> [noreply]` - Store if absent
//! - `replace <key> <flags> <exptime> <bytes> [noreply]` - Store if present
//!
//! ### Retrieval and Update Commands
//! - `get <key> [<key> ...]` - Fetch one or more items
//! - `delete <key> [noreply]` - Delete with a short grace period
//! - `incr <key> <delta> [noreply]` - Add to a numeric value
//! - `decr <key> <delta> [noreply]` - Subtract from a numeric value
//!
//! ### Server Commands
//! - `stats [reset|items|slabs|sizes|cachedump <class> [<limit>]]`
//! - `version`
//! - `quit`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │   parse()   │───>│  process()  │───>│   Action    │      │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘      │
//! │                            │                  │ payload     │
//! │                            ▼                  ▼             │
//! │                      StorageEngine <── complete_store()     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage commands take two steps: [`CommandHandler::process`] allocates a
//! candidate item and asks the connection to read the payload into it, then
//! [`CommandHandler::complete_store`] decides whether the candidate gets
//! linked.

use crate::protocol::{
    parse_command, ArithKind, Command, ParseError, Reply, StatsCommand, StoreCommand, StoreKind,
    CRLF,
};
use crate::storage::{ItemId, StorageEngine};
use crate::VERSION;
use bytes::Bytes;
use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const BAD_DATA_CHUNK: &str = "bad data chunk";
const NON_NUMERIC: &str = "cannot increment or decrement non-numeric value";

/// Limits and timings reported or applied by the command layer.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Memory limit shown as `limit_maxbytes`
    pub limit_maxbytes: u64,
    /// Item limit shown as `limit_maxitems` (not enforced)
    pub limit_maxitems: u64,
    /// How long a deleted key stays blocked
    pub delete_grace: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            limit_maxbytes: crate::storage::slabs::DEFAULT_MEM_LIMIT as u64,
            limit_maxitems: 0,
            delete_grace: Duration::from_secs(4),
        }
    }
}

/// A storage command waiting for its payload.
///
/// Owns the candidate item until it is handed back through
/// [`CommandHandler::complete_store`], or discarded if the connection closes
/// first.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingStore {
    pub kind: StoreKind,
    /// Unlinked candidate item sized for the payload plus `\r\n`
    pub item: ItemId,
    pub noreply: bool,
}

/// What the connection should do after a command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Send this reply, then read the next command
    Reply(Reply),

    /// Nothing to send (`noreply`)
    Silent,

    /// Read the payload into the candidate item
    ReadPayload(PendingStore),

    /// Send `reply`, then discard `bytes` bytes of payload
    Swallow { reply: Reply, bytes: usize },

    /// Stream these pinned items followed by `END`
    Values(Vec<ItemId>),

    /// Close the connection without a reply
    Close,
}

/// Executes commands against the shared item store.
#[derive(Clone)]
pub struct CommandHandler {
    /// The storage engine
    storage: Rc<RefCell<StorageEngine>>,
    settings: HandlerSettings,
    pid: u32,
}

impl CommandHandler {
    /// Creates a new command handler with the given storage engine.
    pub fn new(storage: Rc<RefCell<StorageEngine>>, settings: HandlerSettings) -> Self {
        Self {
            storage,
            settings,
            pid: std::process::id(),
        }
    }

    /// Returns the shared item store.
    pub fn storage(&self) -> &Rc<RefCell<StorageEngine>> {
        &self.storage
    }

    /// Executes one request line.
    ///
    /// # Arguments
    ///
    /// * `line` - The request line without its terminator
    ///
    /// # Returns
    ///
    /// The [`Action`] the connection has to carry out next.
    pub fn process(&self, line: &Bytes) -> Action {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(err) => {
                debug!(error = %err, "Rejected command line");
                return Action::Reply(err.into());
            }
        };

        trace!(command = command.name(), "Processing command");

        match command {
            Command::Store(store) => self.cmd_store(store),
            Command::Get { keys } => self.cmd_get(&keys),
            Command::Delete { key, noreply } => self.cmd_delete(&key, noreply),
            Command::Arith {
                kind,
                key,
                delta,
                noreply,
            } => self.cmd_arith(kind, &key, delta, noreply),
            Command::Stats(sub) => Action::Reply(self.cmd_stats(sub)),
            Command::Version => Action::Reply(Reply::Version(VERSION)),
            Command::Quit => Action::Close,
        }
    }

    /// Finishes a storage command once its payload has been read.
    ///
    /// Returns the reply to send, or `None` if `noreply` suppressed it.
    pub fn complete_store(&self, pending: PendingStore) -> Option<Reply> {
        let mut engine = self.storage.borrow_mut();
        engine.stats_mut().set_cmds += 1;

        let id = pending.item;
        if !engine.item(id).value().ends_with(CRLF) {
            engine.discard(id);
            return Some(Reply::client_error(BAD_DATA_CHUNK));
        }

        let now = Instant::now();
        let key = engine.item(id).key().clone();
        let mut old = engine.find(&key);

        if let Some(old_id) = old {
            if engine.item(old_id).is_expired(now) {
                engine.unlink(old_id);
                old = None;
            }
        }

        let reply = match (pending.kind, old) {
            (StoreKind::Add, Some(old_id)) => {
                engine.touch(old_id);
                engine.discard(id);
                Reply::NotStored
            }
            (StoreKind::Replace, None) => {
                engine.discard(id);
                Reply::NotStored
            }
            (StoreKind::Replace, Some(old_id)) if engine.item(old_id).is_deleted() => {
                engine.discard(id);
                Reply::NotStored
            }
            (_, Some(old_id)) => {
                engine.replace(old_id, id);
                Reply::Stored
            }
            (_, None) => {
                engine.link(id);
                Reply::Stored
            }
        };

        trace!(kind = ?pending.kind, key = ?key, reply = ?reply, "Store completed");
        quiet(reply, pending.noreply)
    }

    fn cmd_store(&self, store: StoreCommand) -> Action {
        // The payload is followed by "\r\n"
        let Some(nbytes) = store.bytes.checked_add(2) else {
            return Action::Reply(ParseError::BadFormat.into());
        };
        let expire_at = expiry_instant(store.exptime, Instant::now());

        let mut engine = self.storage.borrow_mut();
        match engine.allocate(&store.key, store.flags, expire_at, nbytes) {
            Ok(item) => Action::ReadPayload(PendingStore {
                kind: store.kind,
                item,
                noreply: store.noreply,
            }),
            Err(err) => {
                debug!(key = ?store.key, bytes = store.bytes, error = %err, "Cannot allocate item");
                Action::Swallow {
                    reply: Reply::server_error(err.to_string()),
                    bytes: nbytes,
                }
            }
        }
    }

    fn cmd_get(&self, keys: &[Bytes]) -> Action {
        let mut engine = self.storage.borrow_mut();
        let now = Instant::now();
        let mut hits = Vec::with_capacity(keys.len());

        for key in keys {
            engine.stats_mut().get_cmds += 1;
            match engine.find_live(key, now) {
                Some(id) => {
                    engine.stats_mut().get_hits += 1;
                    engine.add_reference(id);
                    engine.touch(id);
                    hits.push(id);
                }
                None => engine.stats_mut().get_misses += 1,
            }
        }

        Action::Values(hits)
    }

    fn cmd_delete(&self, key: &[u8], noreply: bool) -> Action {
        let mut engine = self.storage.borrow_mut();
        let now = Instant::now();

        let Some(id) = engine.find_live(key, now) else {
            return quiet_action(Reply::NotFound, noreply);
        };

        engine.mark_deleted(id, now + self.settings.delete_grace);
        quiet_action(Reply::Deleted, noreply)
    }

    fn cmd_arith(&self, kind: ArithKind, key: &[u8], delta: u64, noreply: bool) -> Action {
        let mut engine = self.storage.borrow_mut();
        let now = Instant::now();

        let Some(id) = engine.find_live(key, now) else {
            return quiet_action(Reply::NotFound, noreply);
        };

        let Some(current) = parse_counter(engine.item(id).value()) else {
            return Action::Reply(Reply::client_error(NON_NUMERIC));
        };

        let value = match kind {
            ArithKind::Incr => current.saturating_add_unsigned(delta),
            ArithKind::Decr => current.saturating_sub_unsigned(delta),
        };
        let digits = value.to_string();
        let data_len = engine.item(id).data_len();

        if digits.len() == data_len {
            engine.item_mut(id).value_mut()[..data_len].copy_from_slice(digits.as_bytes());
        } else {
            let (flags, expire_at) = {
                let item = engine.item(id);
                (item.flags, item.expire_at)
            };

            // Keep the old item alive while the allocator may evict
            engine.add_reference(id);
            let result = engine.allocate(key, flags, expire_at, digits.len() + 2);
            let new_id = match result {
                Ok(new_id) => new_id,
                Err(err) => {
                    engine.remove_reference(id);
                    debug!(key = ?key, error = %err, "Cannot grow counter");
                    return Action::Reply(Reply::server_error(err.to_string()));
                }
            };

            let data = engine.item_mut(new_id).value_mut();
            data[..digits.len()].copy_from_slice(digits.as_bytes());
            data[digits.len()..].copy_from_slice(CRLF);

            engine.replace(id, new_id);
            engine.remove_reference(id);
        }

        quiet_action(Reply::Counter(value), noreply)
    }

    fn cmd_stats(&self, sub: StatsCommand) -> Reply {
        let mut engine = self.storage.borrow_mut();

        match sub {
            StatsCommand::General => Reply::Report(self.render_stats(&engine)),
            StatsCommand::Reset => {
                engine.stats_mut().reset();
                Reply::Reset
            }
            StatsCommand::Items => Reply::Report(engine.item_stats()),
            StatsCommand::Slabs => Reply::Report(engine.slabs().render_stats()),
            StatsCommand::Sizes => Reply::Report(engine.size_histogram()),
            StatsCommand::Cachedump { class, limit } => match engine.slabs().class_id(class) {
                Some(class) => Reply::Report(engine.cachedump(class, limit)),
                None => Reply::End,
            },
        }
    }

    fn render_stats(&self, engine: &StorageEngine) -> String {
        let stats = engine.stats();
        let mut out = String::with_capacity(768);

        let _ = write!(
            out,
            "STAT pid {}\r\n\
             STAT uptime {}\r\n\
             STAT time {}\r\n\
             STAT version {}\r\n\
             STAT curr_items {}\r\n\
             STAT total_items {}\r\n\
             STAT bytes {}\r\n\
             STAT evictions {}\r\n\
             STAT curr_connections {}\r\n\
             STAT total_connections {}\r\n\
             STAT connection_structures {}\r\n\
             STAT cmd_get {}\r\n\
             STAT cmd_set {}\r\n\
             STAT get_hits {}\r\n\
             STAT get_misses {}\r\n\
             STAT bytes_read {}\r\n\
             STAT bytes_written {}\r\n\
             STAT limit_maxbytes {}\r\n\
             STAT limit_maxitems {}\r\n\
             END\r\n",
            self.pid,
            stats.uptime(),
            crate::storage::stats::unix_now(),
            VERSION,
            stats.curr_items,
            stats.total_items,
            stats.curr_bytes,
            stats.evictions,
            stats.curr_conns,
            stats.total_conns,
            stats.conn_structs,
            stats.get_cmds,
            stats.set_cmds,
            stats.get_hits,
            stats.get_misses,
            stats.bytes_read,
            stats.bytes_written,
            self.settings.limit_maxbytes,
            self.settings.limit_maxitems,
        );

        out
    }
}

/// Applies `noreply`: success and benign failures are dropped, errors never.
fn quiet(reply: Reply, noreply: bool) -> Option<Reply> {
    if noreply && !reply.is_error() {
        None
    } else {
        Some(reply)
    }
}

fn quiet_action(reply: Reply, noreply: bool) -> Action {
    match quiet(reply, noreply) {
        Some(reply) => Action::Reply(reply),
        None => Action::Silent,
    }
}

/// Converts a relative expiry in seconds into an instant (0 = never).
fn expiry_instant(exptime: u64, now: Instant) -> Option<Instant> {
    if exptime == 0 {
        return None;
    }
    now.checked_add(Duration::from_secs(exptime))
}

/// Reads a stored counter: an optionally signed decimal number immediately
/// followed by `\r\n`.
fn parse_counter(value: &[u8]) -> Option<i64> {
    let number = value.strip_suffix(CRLF)?;

    let digits = match number.first() {
        Some(b'+' | b'-') => &number[1..],
        _ => number,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    std::str::from_utf8(number).ok()?.parse().ok()
}
