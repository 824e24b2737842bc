// dispatcher: routes OneBot v11 traffic between chat frontends and bot
// backends according to the configured command sets.

use clap::Parser;
use dispatcher::dispatcher::Dispatcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dispatcher", about = "OneBot WebSocket command dispatcher")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/ob-dispatch/dispatcher.toml")]
    config: PathBuf,
    /// Override the configured WS listen address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "dispatcher starting");

    let cfg = match dispatcher::config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    let bind = args.bind.clone().unwrap_or_else(|| cfg.listen.bind.clone());
    info!(
        bind = %bind,
        connections = cfg.connections.len(),
        command_sets = cfg.command_sets.len(),
        "config loaded"
    );

    let db_path = PathBuf::from(&cfg.storage.sqlite_path);
    if let Some(parent) = db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("FATAL: cannot create data dir {}: {e}", parent.display());
            std::process::exit(1);
        }
    }
    let db = match dispatcher::db::Db::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("FATAL: failed to open user database: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = db.integrity_check() {
        eprintln!("FATAL: user database integrity check failed: {e}");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (dispatcher, upstream_events) = Dispatcher::new(cfg, db, shutdown_rx.clone());
    dispatcher.start().await;

    tokio::spawn(Arc::clone(&dispatcher).run_upstream_events(upstream_events));
    tokio::spawn(dispatcher::correlation::run_sweeper(
        dispatcher.correlation(),
        shutdown_rx.clone(),
    ));

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: cannot bind {bind}: {e}");
            std::process::exit(1);
        }
    };
    info!(bind = %bind, "frontend server listening");

    let server = tokio::spawn(dispatcher::frontend::serve(
        listener,
        Arc::clone(&dispatcher),
        shutdown_rx,
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: cannot listen for shutdown signal: {e}");
        std::process::exit(1);
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = server.await;
}
