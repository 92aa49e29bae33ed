//! Command Line Parser
//!
//! Turns one request line (without its `\r\n`) into a [`Command`]. Keys are
//! carved out of the line with [`Bytes::slice_ref`], so parsing never copies
//! them; the line itself was split off the connection's read buffer.
//!
//! ## Grammar
//!
//! ```text
//! set|add|replace <key> <flags> <exptime> <bytes> [noreply]
//! get <key> [<key> ...]
//! delete <key> [noreply]
//! incr|decr <key> <delta> [noreply]
//! stats [reset|items|slabs|sizes|cachedump <class> [<limit>]]
//! version
//! quit
//! ```
//!
//! Tokens are separated by ASCII whitespace. Command names are case
//! sensitive.

use crate::protocol::types::Reply;
use crate::storage::MAX_KEY_LENGTH;
use bytes::Bytes;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while parsing a command line.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown command or wrong use of an argument-less command
    #[error("unknown command")]
    UnknownCommand,

    /// Known command with malformed arguments
    #[error("bad command line format")]
    BadFormat,

    /// `stats cachedump` without a usable class
    #[error("bad command line")]
    BadCommandLine,
}

impl From<ParseError> for Reply {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::UnknownCommand => Reply::Error,
            ParseError::BadFormat | ParseError::BadCommandLine => {
                Reply::client_error(err.to_string())
            }
        }
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Which storage command was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Store unconditionally
    Set,
    /// Store only if the key is absent
    Add,
    /// Store only if the key is present
    Replace,
}

/// Direction of an arithmetic command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithKind {
    Incr,
    Decr,
}

/// A parsed storage command, waiting for its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCommand {
    pub kind: StoreKind,
    pub key: Bytes,
    pub flags: u32,
    /// Seconds until expiry (0 = never)
    pub exptime: u64,
    /// Payload length announced by the client, without the trailing `\r\n`
    pub bytes: usize,
    pub noreply: bool,
}

/// `stats` and its sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsCommand {
    General,
    Reset,
    Items,
    Slabs,
    Sizes,
    Cachedump { class: u32, limit: usize },
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Store(StoreCommand),
    Get {
        keys: Vec<Bytes>,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Arith {
        kind: ArithKind,
        key: Bytes,
        delta: u64,
        noreply: bool,
    },
    Stats(StatsCommand),
    Version,
    Quit,
}

impl Command {
    /// Returns the command name as sent by the client.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Store(store) => match store.kind {
                StoreKind::Set => "set",
                StoreKind::Add => "add",
                StoreKind::Replace => "replace",
            },
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Arith { kind, .. } => match kind {
                ArithKind::Incr => "incr",
                ArithKind::Decr => "decr",
            },
            Command::Stats(_) => "stats",
            Command::Version => "version",
            Command::Quit => "quit",
        }
    }
}

/// Parses one request line.
///
/// # Arguments
///
/// * `line` - The request line with its `\r\n` (or `\n`) already stripped
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use flashcache::protocol::{parse_command, Command};
///
/// let line = Bytes::from_static(b"get a b");
/// match parse_command(&line).unwrap() {
///     Command::Get { keys } => assert_eq!(keys.len(), 2),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
pub fn parse_command(line: &Bytes) -> ParseResult<Command> {
    let tokens: Vec<&[u8]> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .collect();

    let Some((&name, args)) = tokens.split_first() else {
        return Err(ParseError::UnknownCommand);
    };

    match name {
        b"set" => parse_store(StoreKind::Set, line, args),
        b"add" => parse_store(StoreKind::Add, line, args),
        b"replace" => parse_store(StoreKind::Replace, line, args),
        b"get" => parse_get(line, args),
        b"delete" => parse_delete(line, args),
        b"incr" => parse_arith(ArithKind::Incr, line, args),
        b"decr" => parse_arith(ArithKind::Decr, line, args),
        b"stats" => parse_stats(args),
        b"version" if args.is_empty() => Ok(Command::Version),
        b"quit" if args.is_empty() => Ok(Command::Quit),
        _ => Err(ParseError::UnknownCommand),
    }
}

fn parse_store(kind: StoreKind, line: &Bytes, args: &[&[u8]]) -> ParseResult<Command> {
    let (fixed, noreply) = split_noreply(args, 4)?;

    Ok(Command::Store(StoreCommand {
        kind,
        key: parse_key(line, fixed[0])?,
        flags: parse_number(fixed[1])?,
        exptime: parse_number(fixed[2])?,
        bytes: parse_number(fixed[3])?,
        noreply,
    }))
}

fn parse_get(line: &Bytes, args: &[&[u8]]) -> ParseResult<Command> {
    if args.is_empty() {
        return Err(ParseError::UnknownCommand);
    }

    let keys = args
        .iter()
        .map(|key| parse_key(line, key))
        .collect::<ParseResult<Vec<_>>>()?;

    Ok(Command::Get { keys })
}

fn parse_delete(line: &Bytes, args: &[&[u8]]) -> ParseResult<Command> {
    let (fixed, noreply) = split_noreply(args, 1)?;

    Ok(Command::Delete {
        key: parse_key(line, fixed[0])?,
        noreply,
    })
}

fn parse_arith(kind: ArithKind, line: &Bytes, args: &[&[u8]]) -> ParseResult<Command> {
    let (fixed, noreply) = split_noreply(args, 2)?;

    Ok(Command::Arith {
        kind,
        key: parse_key(line, fixed[0])?,
        delta: parse_number(fixed[1])?,
        noreply,
    })
}

fn parse_stats(args: &[&[u8]]) -> ParseResult<Command> {
    let sub = match args {
        [] => StatsCommand::General,
        [b"reset"] => StatsCommand::Reset,
        [b"items"] => StatsCommand::Items,
        [b"slabs"] => StatsCommand::Slabs,
        [b"sizes"] => StatsCommand::Sizes,
        [b"cachedump", rest @ ..] => parse_cachedump(rest)?,
        _ => return Err(ParseError::UnknownCommand),
    };
    Ok(Command::Stats(sub))
}

fn parse_cachedump(args: &[&[u8]]) -> ParseResult<StatsCommand> {
    let (class, limit) = match args {
        [class] => (*class, None),
        [class, limit] => (*class, Some(*limit)),
        _ => return Err(ParseError::BadCommandLine),
    };

    let class = parse_number(class).map_err(|_| ParseError::BadCommandLine)?;
    let limit = match limit {
        Some(limit) => parse_number(limit).map_err(|_| ParseError::BadCommandLine)?,
        None => 0,
    };

    Ok(StatsCommand::Cachedump { class, limit })
}

/// Splits `args` into exactly `fixed` positional arguments and an optional
/// trailing `noreply`.
fn split_noreply<'a, 'b>(
    args: &'a [&'b [u8]],
    fixed: usize,
) -> ParseResult<(&'a [&'b [u8]], bool)> {
    match args.len() {
        n if n == fixed => Ok((args, false)),
        n if n == fixed + 1 && args[fixed] == b"noreply" => Ok((&args[..fixed], true)),
        _ => Err(ParseError::BadFormat),
    }
}

fn parse_key(line: &Bytes, token: &[u8]) -> ParseResult<Bytes> {
    if token.len() > MAX_KEY_LENGTH {
        return Err(ParseError::BadFormat);
    }
    Ok(line.slice_ref(token))
}

fn parse_number<T: FromStr>(token: &[u8]) -> ParseResult<T> {
    // A sign would let negative values through for signed targets
    if !token.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::BadFormat);
    }
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::BadFormat)
}
