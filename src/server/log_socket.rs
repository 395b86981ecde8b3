// src/server/log_socket.rs

//! The access-log publisher socket: a Unix socket where each connected
//! subscriber receives one JSON record per completed request.

use crate::server::httplog::Publisher;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Listens on `path` and fans the publisher's records out to every
/// connected subscriber. Slow subscribers skip records instead of slowing
/// the proxy down.
pub async fn run(publisher: Publisher, path: PathBuf, mut shutdown_rx: broadcast::Receiver<()>) {
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(err) => {
            error!("httpsrv/log_socket bind {}: {err}", path.display());
            return;
        }
    };
    if let Err(err) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o770)) {
        warn!("httpsrv/log_socket chmod {}: {err}", path.display());
    }
    info!("httpsrv/log_socket listening on {}", path.display());

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = std::fs::remove_file(&path);
                info!("log socket shutting down");
                return;
            }
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                tokio::spawn(pump(stream, publisher.subscribe()));
            }
        }
    }
}

async fn pump(mut stream: tokio::net::UnixStream, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if stream.write_all(line.as_bytes()).await.is_err()
                    || stream.write_all(b"\n").await.is_err()
                {
                    debug!("log subscriber went away");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("log subscriber lagging, {skipped} records skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
