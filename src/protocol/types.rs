//! Text Protocol Replies
//!
//! Every reply the server sends is either a single status line or a
//! pre-rendered multi-line report. Retrieval results (`VALUE` blocks) are
//! not replies: the connection streams them straight out of the item store
//! using [`write_value_header`].
//!
//! ## Examples
//!
//! ```text
//! STORED\r\n
//! CLIENT_ERROR bad command line format\r\n
//! 15\r\n
//! VALUE k 0 3\r\nabc\r\nEND\r\n
//! ```

use std::io::Write;

/// The CRLF terminator used by the text protocol
pub const CRLF: &[u8] = b"\r\n";

/// Longest single-line reply, terminator included.
pub const MAX_LINE_REPLY: usize = 2048;

/// A reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `STORED`
    Stored,

    /// `NOT_STORED`
    NotStored,

    /// `DELETED`
    Deleted,

    /// `NOT_FOUND`
    NotFound,

    /// `END`
    End,

    /// `ERROR` (unknown command)
    Error,

    /// `RESET`, the answer to `stats reset`
    Reset,

    /// `CLIENT_ERROR <message>`
    ClientError(String),

    /// `SERVER_ERROR <message>`
    ServerError(String),

    /// New value after `incr`/`decr`
    Counter(i64),

    /// `VERSION <version>`
    Version(&'static str),

    /// A multi-line report, already terminated (stats output)
    Report(String),
}

impl Reply {
    pub fn client_error(msg: impl Into<String>) -> Self {
        Reply::ClientError(msg.into())
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        Reply::ServerError(msg.into())
    }

    /// Returns true for replies that occupy a single line.
    pub fn is_line(&self) -> bool {
        !matches!(self, Reply::Report(_))
    }

    /// Returns true for `ERROR`, `CLIENT_ERROR` and `SERVER_ERROR`.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Reply::Error | Reply::ClientError(_) | Reply::ServerError(_)
        )
    }

    /// Serializes the reply to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    ///
    /// A single-line reply that would not fit in [`MAX_LINE_REPLY`] bytes is
    /// replaced by `SERVER_ERROR output line too long`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        self.write_raw(buf);

        if self.is_line() && buf.len() - start > MAX_LINE_REPLY {
            buf.truncate(start);
            buf.extend_from_slice(b"SERVER_ERROR output line too long\r\n");
        }
    }

    fn write_raw(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Stored => buf.extend_from_slice(b"STORED\r\n"),
            Reply::NotStored => buf.extend_from_slice(b"NOT_STORED\r\n"),
            Reply::Deleted => buf.extend_from_slice(b"DELETED\r\n"),
            Reply::NotFound => buf.extend_from_slice(b"NOT_FOUND\r\n"),
            Reply::End => buf.extend_from_slice(b"END\r\n"),
            Reply::Error => buf.extend_from_slice(b"ERROR\r\n"),
            Reply::Reset => buf.extend_from_slice(b"RESET\r\n"),
            Reply::ClientError(msg) => {
                buf.extend_from_slice(b"CLIENT_ERROR ");
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::ServerError(msg) => {
                buf.extend_from_slice(b"SERVER_ERROR ");
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Counter(n) => {
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Version(version) => {
                buf.extend_from_slice(b"VERSION ");
                buf.extend_from_slice(version.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Report(text) => buf.extend_from_slice(text.as_bytes()),
        }
    }
}

/// Writes `VALUE <key> <flags> <bytes>\r\n` for one retrieved item.
pub fn write_value_header(buf: &mut Vec<u8>, key: &[u8], flags: u32, data_len: usize) {
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    // Writing into a Vec cannot fail
    let _ = write!(buf, " {} {}\r\n", flags, data_len);
}
