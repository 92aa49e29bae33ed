//! Non-blocking byte transport.
//!
//! The connection state machine never awaits. It calls [`Transport::recv`]
//! and [`Transport::send`], which either make progress or fail with
//! [`io::ErrorKind::WouldBlock`], and then tells the caller which readiness
//! to wait for.

use std::io;
use tokio::net::TcpStream;

/// A socket-like endpoint with non-blocking reads and writes.
pub trait Transport {
    /// Reads into `buf`. `Ok(0)` means end of stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning how many bytes were accepted.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}
