// src/server/mod.rs

//! The HTTP front end: listeners, the cache-aware handler, the reverse
//! proxy leg and the management surfaces.

pub mod body;
pub mod coalesce;
pub mod conn;
pub mod device;
pub mod handler;
pub mod httplog;
mod listener;
mod log_socket;
mod metrics_server;
pub mod proxy;
pub mod range;
pub mod ratelimit;
mod tls;

use crate::config::Config;
use crate::rules::Rules;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{error, info};

pub use handler::Handler;

/// Budget for reading a request's header block.
pub const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Where to re-read configuration from on SIGHUP.
pub struct ReloadPaths {
    pub server: PathBuf,
    pub cache: PathBuf,
}

/// The main server startup function: builds the handler, spawns the
/// management surfaces and every listener, then waits for shutdown.
pub async fn run(cfg: Config, rules: Rules, reload: Option<ReloadPaths>) -> anyhow::Result<()> {
    let handler = Handler::new(cfg.handler.clone(), rules)?;
    let (shutdown_tx, _) = broadcast::channel(1);

    if cfg.metrics_port != 0 {
        tokio::spawn(metrics_server::run(
            handler.clone(),
            cfg.metrics_port,
            shutdown_tx.subscribe(),
        ));
    }

    if !cfg.log_socket.is_empty() {
        tokio::spawn(log_socket::run(
            handler.publisher().clone(),
            PathBuf::from(&cfg.log_socket),
            shutdown_tx.subscribe(),
        ));
    }

    listener::spawn_all(&cfg, handler.clone(), &shutdown_tx)?;

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => reload_config(&handler, reload.as_ref()),
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(());
    Ok(())
}

/// Re-reads and swaps in the configuration and cache rules. A file that no
/// longer parses leaves the running configuration untouched.
fn reload_config(handler: &Handler, reload: Option<&ReloadPaths>) {
    let Some(paths) = reload else {
        info!("SIGHUP received but no config paths to reload from");
        return;
    };

    let config = match Config::from_file(&paths.server) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("reload {}: {err}", paths.server.display());
            return;
        }
    };
    let rules = match Rules::from_file(&paths.cache) {
        Ok(rules) => rules,
        Err(err) => {
            error!("reload {}: {err}", paths.cache.display());
            return;
        }
    };

    handler.reload(config.handler, rules);
    info!("configuration reloaded");
}
