//! Text Protocol Implementation
//!
//! This module implements the line-oriented text protocol spoken by
//! flashcache clients.
//!
//! ## Overview
//!
//! Every request is a single line terminated by `\r\n` (a bare `\n` is
//! accepted too). Storage commands are followed by a data block of the
//! announced length plus `\r\n`. Replies are status lines, `VALUE` blocks
//! closed by `END`, or multi-line stats reports.
//!
//! ## Modules
//!
//! - `types`: Defines the `Reply` enum and serialization
//! - `parser`: Zero-copy parser for request lines
//!
//! ## Example
//!
//! ```
//! use bytes::Bytes;
//! use flashcache::protocol::{parse_command, Command, Reply};
//!
//! let line = Bytes::from_static(b"delete name");
//! let command = parse_command(&line).unwrap();
//! assert_eq!(command.name(), "delete");
//!
//! assert_eq!(Reply::Deleted.serialize(), b"DELETED\r\n");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{
    parse_command, ArithKind, Command, ParseError, ParseResult, StatsCommand, StoreCommand,
    StoreKind,
};
pub use types::{write_value_header, Reply, CRLF, MAX_LINE_REPLY};
