//! gRPC server loop.
//!
//! Serves the dispatcher over raw HTTP/2 connections. Routing happens inside
//! the dispatcher because the served method set is only known at runtime, so
//! there is no static router here, just an accept loop and per-connection
//! tasks.

use crate::dispatch::Dispatcher;
use anyhow::{Context, Result};
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct MockServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    grace_period: Duration,
}

impl MockServer {
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        grace_period: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            listener,
            dispatcher,
            grace_period,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    /// Accept connections until `shutdown` resolves, then drain in-flight
    /// calls for up to the grace period before aborting what remains.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let MockServer {
            listener,
            dispatcher,
            grace_period,
        } = self;

        tokio::pin!(shutdown);
        let (drain_tx, drain_rx) = tokio::sync::watch::channel(false);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "connection accepted");
                    connections.spawn(serve_connection(
                        stream,
                        Arc::clone(&dispatcher),
                        drain_rx.clone(),
                    ));
                }
                _ = &mut shutdown => break,
            }
        }

        // Stop accepting before draining.
        drop(listener);
        let _ = drain_tx.send(true);

        if !connections.is_empty() {
            info!(
                connections = connections.len(),
                grace_secs = grace_period.as_secs(),
                "draining connections"
            );
            let drained = tokio::time::timeout(grace_period, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("grace period expired, aborting remaining connections");
                connections.shutdown().await;
            }
        }

        info!("server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    dispatcher: Arc<Dispatcher>,
    mut drain: tokio::sync::watch::Receiver<bool>,
) {
    let service = service_fn(move |req: http::Request<hyper::body::Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let response = dispatcher.handle(req.map(tonic::body::Body::new)).await;
            Ok::<_, Infallible>(response)
        }
    });

    let conn = http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(error = %err, "connection closed with error");
            }
        }
        _ = drain.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!(error = %err, "connection closed with error");
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
