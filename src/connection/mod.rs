//! Connection Handler Module
//!
//! This module manages individual client connections to flashcache.
//! Every connection is a `spawn_local` task on the single event-loop thread;
//! the task owns the socket and a [`Connection`] state machine and does
//! nothing but wait for the readiness the machine asks for.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn_local
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  loop {                                                     │
//! │      match connection.resume(&mut stream) {                 │
//! │          Wait::Readable => stream.readable().await,         │
//! │          Wait::Writable => stream.writable().await,         │
//! │          Wait::Closed   => break,                           │
//! │      }                                                      │
//! │  }                                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Resumable I/O**: every state picks up exactly where a would-block left it
//! - **Buffer Management**: growable BytesMut read buffer with a hard limit
//! - **Pipelining**: Supports multiple commands in a single TCP packet
//! - **Pin Safety**: pinned items are released on every exit path

pub mod handler;
pub mod transport;

// Re-export commonly used types
pub use handler::{
    AfterWrite, ConnState, Connection, ConnectionError, MultiStage, Wait, DATA_BUFFER_SIZE,
    MAX_READ_BUFFER,
};
pub use transport::Transport;
