//! Connection State Machine
//!
//! This module drives one client connection. All network I/O goes through a
//! synchronous state machine: [`Connection::resume`] makes as much progress
//! as the socket allows and then reports which readiness it needs before it
//! can continue. The async task in `server.rs` only waits for that readiness.
//!
//! ## States
//!
//! ```text
//!            ┌──────────────── line ────────────────┐
//!            │                                      ▼
//!   ┌──────────────┐  store cmd  ┌───────┐   ┌─────────────┐
//!   │     Read     │────────────>│ Nread │──>│    Write    │──┐
//!   └──────────────┘             └───────┘   └─────────────┘  │
//!     ▲    │    │ get                           │ too large    │
//!     │    │    ▼                               ▼              │
//!     │    │  ┌────────────┐               ┌─────────┐         │
//!     │    │  │ MultiWrite │               │ Swallow │         │
//!     │    │  └────────────┘               └─────────┘         │
//!     │    │ EOF / error / quit                                │
//!     │    ▼                                                   │
//!     │  ┌─────────┐                                           │
//!     │  │ Closing │                                           │
//!     │  └─────────┘                                           │
//!     └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in a `BytesMut` that starts at
//! [`DATA_BUFFER_SIZE`] and doubles when full. A client that sends more than
//! [`MAX_READ_BUFFER`] bytes without a line terminator is answered with
//! `SERVER_ERROR out of memory` and disconnected. Payload bytes that arrive
//! after the buffered ones are read straight into the candidate item.
//!
//! Retrieved values are written from the item itself; each item stays
//! pinned until its value has been sent or the connection closes.

use crate::commands::{Action, CommandHandler, PendingStore};
use crate::connection::transport::Transport;
use crate::protocol::{write_value_header, Reply};
use crate::storage::ItemId;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Initial read and write buffer size (2 KB)
pub const DATA_BUFFER_SIZE: usize = 2048;

/// Largest read buffer a connection may build up without a complete line (1 MB)
pub const MAX_READ_BUFFER: usize = 1024 * 1024;

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for a command line
    Read,
    /// Reading a store payload into the candidate item
    Nread { filled: usize },
    /// Discarding the payload of a rejected store
    Swallow { remaining: usize },
    /// Sending the write buffer
    Write { then: AfterWrite },
    /// Streaming retrieved items
    MultiWrite { stage: MultiStage },
    /// Releasing resources; terminal
    Closing,
}

/// State to enter once a reply has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterWrite {
    Read,
    Swallow(usize),
    Close,
}

/// Progress through the current item of a multi-get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiStage {
    /// `VALUE` line in the write buffer
    Header,
    /// Value bytes straight from the item
    Value { offset: usize },
    /// `END` line in the write buffer
    End,
}

/// Readiness the connection needs before it can make progress again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Readable,
    Writable,
    /// The connection is finished and has released everything it held
    Closed,
}

/// Reasons a connection ends.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Client sent `quit`
    #[error("Client quit")]
    Quit,

    /// End of stream in the middle of a command or payload
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Read buffer limit exceeded
    #[error("Read buffer limit exceeded")]
    BufferFull,
}

/// One client connection.
pub struct Connection {
    /// Client's address (for logging)
    addr: SocketAddr,

    state: ConnState,

    /// Buffer for incoming data
    rbuf: BytesMut,

    /// Outgoing reply or header, sent from `wpos`
    wbuf: Vec<u8>,
    wpos: usize,

    /// Store waiting for its payload
    pending: Option<PendingStore>,

    /// Pinned items still to be streamed
    values: VecDeque<ItemId>,

    /// The command handler (shared across connections)
    handler: CommandHandler,

    close_reason: Option<ConnectionError>,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("buffered", &self.rbuf.len())
            .field("pinned", &self.values.len())
            .finish()
    }
}

impl Connection {
    /// Creates a connection in the `Read` state.
    ///
    /// # Arguments
    ///
    /// * `addr` - The client's socket address
    /// * `handler` - The command handler for executing commands
    pub fn new(addr: SocketAddr, handler: CommandHandler) -> Self {
        {
            let mut engine = handler.storage().borrow_mut();
            let stats = engine.stats_mut();
            stats.curr_conns += 1;
            stats.total_conns += 1;
            stats.conn_structs += 1;
        }

        Self {
            addr,
            state: ConnState::Read,
            rbuf: BytesMut::with_capacity(DATA_BUFFER_SIZE),
            wbuf: Vec::with_capacity(DATA_BUFFER_SIZE),
            wpos: 0,
            pending: None,
            values: VecDeque::new(),
            handler,
            close_reason: None,
            closed: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Moves the connection to `Closing` after a failure outside of the
    /// state machine (e.g. while waiting for readiness).
    pub fn abort(&mut self, err: io::Error) {
        self.fail(ConnectionError::IoError(err));
    }

    /// Runs the state machine until it would block or the connection closes.
    pub fn resume<T: Transport>(&mut self, io: &mut T) -> Wait {
        loop {
            let wait = match self.state {
                ConnState::Read => self.on_read(io),
                ConnState::Nread { filled } => self.on_nread(io, filled),
                ConnState::Swallow { remaining } => self.on_swallow(io, remaining),
                ConnState::Write { then } => self.on_write(io, then),
                ConnState::MultiWrite { stage } => self.on_multi_write(io, stage),
                ConnState::Closing => {
                    self.close();
                    Some(Wait::Closed)
                }
            };

            if let Some(wait) = wait {
                return wait;
            }
        }
    }

    fn on_read<T: Transport>(&mut self, io: &mut T) -> Option<Wait> {
        if let Some(line) = self.take_line() {
            self.dispatch(line);
            return None;
        }

        if self.rbuf.len() >= MAX_READ_BUFFER {
            warn!(client = %self.addr, buffered = self.rbuf.len(), "Read buffer limit exceeded");
            self.rbuf.clear();
            self.close_reason = Some(ConnectionError::BufferFull);
            self.start_write(&Reply::server_error("out of memory"), AfterWrite::Close);
            return None;
        }

        match self.fill(io) {
            Ok(0) => {
                let reason = if self.rbuf.is_empty() {
                    ConnectionError::ClientDisconnected
                } else {
                    ConnectionError::UnexpectedEof
                };
                self.fail(reason);
                None
            }
            Ok(_) => None,
            Err(e) => self.on_io_error(e, Wait::Readable),
        }
    }

    /// Splits one line off the read buffer, without its `\n` or `\r\n`.
    fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.rbuf.iter().position(|&b| b == b'\n')?;
        let mut line = self.rbuf.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Some(line.freeze())
    }

    /// Reads once into the spare capacity of the read buffer, doubling it
    /// first if it is full.
    fn fill<T: Transport>(&mut self, io: &mut T) -> io::Result<usize> {
        if self.rbuf.len() == self.rbuf.capacity() {
            let grow = self.rbuf.capacity().max(DATA_BUFFER_SIZE);
            self.rbuf.reserve(grow);
        }

        let start = self.rbuf.len();
        self.rbuf.resize(self.rbuf.capacity(), 0);
        let result = io.recv(&mut self.rbuf[start..]);
        self.rbuf.truncate(start + result.as_ref().map_or(0, |n| *n));

        if let Ok(n) = result {
            self.record_read(n);
        }
        result
    }

    fn dispatch(&mut self, line: Bytes) {
        trace!(client = %self.addr, line = %String::from_utf8_lossy(&line), "Received command");

        match self.handler.process(&line) {
            Action::Reply(reply) => self.start_write(&reply, AfterWrite::Read),
            Action::Silent => self.state = ConnState::Read,
            Action::ReadPayload(pending) => {
                self.pending = Some(pending);
                self.state = ConnState::Nread { filled: 0 };
            }
            Action::Swallow { reply, bytes } => {
                self.start_write(&reply, AfterWrite::Swallow(bytes))
            }
            Action::Values(ids) => {
                self.values = ids.into();
                self.next_value();
            }
            Action::Close => self.fail(ConnectionError::Quit),
        }
    }

    fn on_nread<T: Transport>(&mut self, io: &mut T, filled: usize) -> Option<Wait> {
        let Some(id) = self.pending.as_ref().map(|pending| pending.item) else {
            self.state = ConnState::Read;
            return None;
        };

        let storage = Rc::clone(self.handler.storage());
        let mut engine = storage.borrow_mut();
        let total = engine.item(id).nbytes();

        if filled >= total {
            drop(engine);
            self.finish_store();
            return None;
        }

        // Bytes that arrived together with the command line come first
        if !self.rbuf.is_empty() {
            let n = self.rbuf.len().min(total - filled);
            engine.item_mut(id).value_mut()[filled..filled + n].copy_from_slice(&self.rbuf[..n]);
            self.rbuf.advance(n);
            self.state = ConnState::Nread { filled: filled + n };
            return None;
        }

        let result = io.recv(&mut engine.item_mut(id).value_mut()[filled..total]);
        drop(engine);

        match result {
            Ok(0) => {
                self.fail(ConnectionError::UnexpectedEof);
                None
            }
            Ok(n) => {
                self.record_read(n);
                self.state = ConnState::Nread { filled: filled + n };
                None
            }
            Err(e) => self.on_io_error(e, Wait::Readable),
        }
    }

    fn finish_store(&mut self) {
        let reply = match self.pending.take() {
            Some(pending) => self.handler.complete_store(pending),
            None => None,
        };

        match reply {
            Some(reply) => self.start_write(&reply, AfterWrite::Read),
            None => self.state = ConnState::Read,
        }
    }

    fn on_swallow<T: Transport>(&mut self, io: &mut T, remaining: usize) -> Option<Wait> {
        if remaining == 0 {
            self.state = ConnState::Read;
            return None;
        }

        if !self.rbuf.is_empty() {
            let n = self.rbuf.len().min(remaining);
            self.rbuf.advance(n);
            self.state = ConnState::Swallow {
                remaining: remaining - n,
            };
            return None;
        }

        let mut scratch = [0u8; DATA_BUFFER_SIZE];
        let want = remaining.min(scratch.len());

        match io.recv(&mut scratch[..want]) {
            Ok(0) => {
                self.fail(ConnectionError::UnexpectedEof);
                None
            }
            Ok(n) => {
                self.record_read(n);
                self.state = ConnState::Swallow {
                    remaining: remaining - n,
                };
                None
            }
            Err(e) => self.on_io_error(e, Wait::Readable),
        }
    }

    fn start_write(&mut self, reply: &Reply, then: AfterWrite) {
        self.wbuf.clear();
        self.wpos = 0;
        reply.serialize_into(&mut self.wbuf);
        self.state = ConnState::Write { then };
    }

    /// Sends the rest of the write buffer.
    fn flush<T: Transport>(&mut self, io: &mut T) -> io::Result<()> {
        while self.wpos < self.wbuf.len() {
            let n = io.send(&self.wbuf[self.wpos..])?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.wpos += n;
            self.record_written(n);
        }

        self.wbuf.clear();
        self.wpos = 0;
        Ok(())
    }

    fn on_write<T: Transport>(&mut self, io: &mut T, then: AfterWrite) -> Option<Wait> {
        if let Err(e) = self.flush(io) {
            return self.on_io_error(e, Wait::Writable);
        }

        self.state = match then {
            AfterWrite::Read => ConnState::Read,
            AfterWrite::Swallow(remaining) => ConnState::Swallow { remaining },
            AfterWrite::Close => ConnState::Closing,
        };
        None
    }

    /// Queues the header of the next pinned item, or `END` if none is left.
    fn next_value(&mut self) {
        self.wbuf.clear();
        self.wpos = 0;

        let stage = match self.values.front() {
            Some(&id) => {
                let engine = self.handler.storage().borrow();
                let item = engine.item(id);
                write_value_header(&mut self.wbuf, item.key(), item.flags, item.data_len());
                MultiStage::Header
            }
            None => {
                Reply::End.serialize_into(&mut self.wbuf);
                MultiStage::End
            }
        };

        self.state = ConnState::MultiWrite { stage };
    }

    fn on_multi_write<T: Transport>(&mut self, io: &mut T, stage: MultiStage) -> Option<Wait> {
        match stage {
            MultiStage::Header => {
                if let Err(e) = self.flush(io) {
                    return self.on_io_error(e, Wait::Writable);
                }
                self.state = ConnState::MultiWrite {
                    stage: MultiStage::Value { offset: 0 },
                };
                None
            }
            MultiStage::Value { offset } => {
                let Some(&id) = self.values.front() else {
                    self.next_value();
                    return None;
                };

                let (result, len) = {
                    let engine = self.handler.storage().borrow();
                    let value = engine.item(id).value();
                    (io.send(&value[offset..]), value.len())
                };

                match result {
                    Ok(0) => self.on_io_error(io::ErrorKind::WriteZero.into(), Wait::Writable),
                    Ok(n) => {
                        self.record_written(n);
                        if offset + n >= len {
                            self.release_front();
                            self.next_value();
                        } else {
                            self.state = ConnState::MultiWrite {
                                stage: MultiStage::Value { offset: offset + n },
                            };
                        }
                        None
                    }
                    Err(e) => self.on_io_error(e, Wait::Writable),
                }
            }
            MultiStage::End => {
                if let Err(e) = self.flush(io) {
                    return self.on_io_error(e, Wait::Writable);
                }
                self.state = ConnState::Read;
                None
            }
        }
    }

    fn release_front(&mut self) {
        if let Some(id) = self.values.pop_front() {
            self.handler.storage().borrow_mut().remove_reference(id);
        }
    }

    /// Would-block suspends, interrupts retry, anything else closes.
    fn on_io_error(&mut self, err: io::Error, wait: Wait) -> Option<Wait> {
        match err.kind() {
            io::ErrorKind::WouldBlock => Some(wait),
            io::ErrorKind::Interrupted => None,
            _ => {
                self.fail(ConnectionError::IoError(err));
                None
            }
        }
    }

    fn fail(&mut self, reason: ConnectionError) {
        self.close_reason.get_or_insert(reason);
        self.state = ConnState::Closing;
    }

    fn record_read(&self, n: usize) {
        self.handler.storage().borrow_mut().stats_mut().bytes_read += n as u64;
    }

    fn record_written(&self, n: usize) {
        self.handler.storage().borrow_mut().stats_mut().bytes_written += n as u64;
    }

    /// Releases the candidate item, every pin and the buffers.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = ConnState::Closing;

        let pending = self.pending.take();
        let values: Vec<ItemId> = self.values.drain(..).collect();

        // Nothing holds the store across a close; a failed borrow here
        // would leak every pin this connection owns.
        match self.handler.storage().try_borrow_mut() {
            Ok(mut engine) => {
                if let Some(pending) = pending {
                    engine.discard(pending.item);
                }
                for id in values {
                    engine.remove_reference(id);
                }
                let stats = engine.stats_mut();
                stats.curr_conns = stats.curr_conns.saturating_sub(1);
            }
            Err(_) => {
                debug_assert!(false, "item store borrowed while closing a connection");
                warn!(
                    client = %self.addr,
                    candidate = pending.is_some(),
                    pins = values.len(),
                    "Item store busy while closing connection, resources leaked"
                );
            }
        }

        self.rbuf.clear();
        self.wbuf.clear();
        self.wpos = 0;

        match self.close_reason.take() {
            None | Some(ConnectionError::ClientDisconnected) | Some(ConnectionError::Quit) => {
                info!(client = %self.addr, "Client disconnected")
            }
            Some(ConnectionError::IoError(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Some(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
