// src/server/listener.rs

//! Accept loops: plaintext and TLS, optionally one SO_REUSEPORT socket per
//! CPU, each connection served by hyper over the shared handler.

use crate::config::Config;
use crate::server::READ_HEADER_TIMEOUT;
use crate::server::conn::DeadlineStream;
use crate::server::handler::Handler;
use crate::server::tls;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Binds every configured address and spawns its accept loop. With `reuse`
/// enabled, each address gets one SO_REUSEPORT listener per CPU.
pub fn spawn_all(
    cfg: &Config,
    handler: Arc<Handler>,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let copies = if cfg.reuse {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        1
    };

    for addr in &cfg.listen {
        for _ in 0..copies {
            let listener = bind(addr, cfg.reuse)?;
            info!("httpsrv listen: {addr}");
            tokio::spawn(accept_loop(
                listener,
                handler.clone(),
                None,
                shutdown.subscribe(),
            ));
        }
    }

    if !cfg.listen_tls.is_empty() {
        let tls_config = tls::server_config(&cfg.certs)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        for addr in &cfg.listen_tls {
            for _ in 0..copies {
                let listener = bind(addr, cfg.reuse)?;
                info!("httpsrv listen TLS: {addr}");
                tokio::spawn(accept_loop(
                    listener,
                    handler.clone(),
                    Some(acceptor.clone()),
                    shutdown.subscribe(),
                ));
            }
        }
    }

    Ok(())
}

fn bind(addr: &str, reuse: bool) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr.parse()?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    if reuse {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<Handler>,
    acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("accept: {err}");
                        continue;
                    }
                };

                let handler = handler.clone();
                match acceptor.clone() {
                    None => {
                        tokio::spawn(serve_connection(stream, peer, handler, false));
                    }
                    Some(acceptor) => {
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    serve_connection(tls_stream, peer, handler, true).await;
                                }
                                Err(err) => debug!("tls accept from {peer}: {err}"),
                            }
                        });
                    }
                }
            }
        }
    }
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, handler: Arc<Handler>, tls: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(DeadlineStream::new(stream));
    let svc = service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.serve(req, peer, tls).await }
    });

    let mut http = http1::Builder::new();
    http.timer(TokioTimer::new());
    http.header_read_timeout(READ_HEADER_TIMEOUT);
    http.keep_alive(true);

    if let Err(err) = http.serve_connection(io, svc).await {
        debug!("connection from {peer}: {err}");
    }
}
