//! flashcache - A memcached-compatible caching daemon
//!
//! This is the main entry point for the flashcache server.
//! It sets up the TCP listener, storage engine, and handles incoming connections.

use anyhow::Context;
use flashcache::commands::CommandHandler;
use flashcache::config::{help_text, CliAction, Config};
use flashcache::server::accept_loop;
use flashcache::storage::{DeleteSweeper, DeletionConfig, StorageEngine};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_banner(config: &Config) {
    println!(
        r#"
flashcache v{} - memcached-compatible caching daemon
──────────────────────────────────────────────────────────────
Listening on {} with {} MB for items
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashcache::VERSION,
        config.bind_address(),
        config.max_bytes / (1024 * 1024)
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(CliAction::Run(config)) => config,
        Ok(CliAction::Help) => {
            println!("{}", help_text());
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("flashcache version {}", flashcache::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("{}", help_text());
            std::process::exit(1);
        }
    };

    // Set up logging; RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level().as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    // All tasks share the storage engine on this one thread
    LocalSet::new().run_until(run(config)).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let storage = Rc::new(RefCell::new(StorageEngine::new(config.slab_config())));
    info!(
        classes = storage.borrow().slabs().num_classes(),
        limit_bytes = config.max_bytes,
        "Storage engine initialized"
    );

    let deletion = DeletionConfig::default();
    let _sweeper = DeleteSweeper::start(Rc::clone(&storage), deletion.clone());
    info!("Background delete sweeper started");

    let handler = CommandHandler::new(Rc::clone(&storage), config.handler_settings(&deletion));

    let addr = config.bind_address();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, handler, config.max_conns) => {}
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}
