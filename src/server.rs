//! TCP listener and per-connection tasks.
//!
//! Everything here runs on one thread inside a [`tokio::task::LocalSet`]:
//! the accept loop and every connection are `spawn_local` tasks sharing the
//! same `Rc<RefCell<StorageEngine>>`.

use crate::commands::CommandHandler;
use crate::connection::{Connection, Wait};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Accepts connections forever, spawning a local task for each one.
///
/// Connections beyond `max_conns` are still served; the overload is logged.
pub async fn accept_loop(listener: TcpListener, handler: CommandHandler, max_conns: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                }

                let open = handler.storage().borrow().stats().curr_conns;
                if open >= max_conns as u64 {
                    warn!(
                        client = %addr,
                        open,
                        limit = max_conns,
                        "Connection limit exceeded"
                    );
                }

                let handler = handler.clone();
                tokio::task::spawn_local(async move {
                    serve_connection(stream, addr, handler).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Drives one connection's state machine until it closes.
pub async fn serve_connection(mut stream: TcpStream, addr: SocketAddr, handler: CommandHandler) {
    info!(client = %addr, "Client connected");

    let mut conn = Connection::new(addr, handler);
    loop {
        let ready = match conn.resume(&mut stream) {
            Wait::Readable => stream.readable().await,
            Wait::Writable => stream.writable().await,
            Wait::Closed => break,
        };

        if let Err(e) = ready {
            conn.abort(e);
        }
    }
}
