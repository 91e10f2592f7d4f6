//! The HTTP transport.
//!
//! Each connection is served on its own task with hyper's automatic
//! HTTP/1.1 / HTTP/2 builder. Every request is collected, turned into a
//! [`Request`], run through [`App::handle`], and answered with whatever the
//! shared [`Response`] holds once the chain settles.
//!
//! On shutdown the listener stops accepting at once; connections already
//! accepted run to completion before [`Server::serve`] returns. Under
//! Kubernetes, keep `terminationGracePeriodSeconds` above the slowest
//! request.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::application::App;
use crate::error::{Error, Result};
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;

/// Serves an [`App`] over HTTP.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sluice::Server;
    /// assert!(Server::bind("0.0.0.0:3000").is_ok());
    /// assert!(Server::bind("not an address").is_err());
    /// ```
    pub fn bind(addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::config(format!("invalid socket address `{addr}`: {e}")))?;
        Ok(Self { addr })
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains in-flight
    /// connections.
    pub async fn serve(self, app: App) -> Result<()> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `shutdown` resolves.
    pub async fn serve_with_shutdown(
        self,
        app: App,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        serve_listener(listener, app, shutdown).await
    }
}

/// Serves `app` on an already bound listener until `shutdown` resolves.
///
/// Connections accepted before shutdown are allowed to finish; the function
/// returns once the last one has.
pub async fn serve_listener(
    listener: TcpListener,
    app: App,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "sluice listening");

    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Shutdown first, so no connection is accepted after the signal.
            biased;

            () = &mut shutdown => {
                info!(in_flight = connections.len(), "shutting down, draining connections");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(connection(app.clone(), stream, peer));
                }
                Err(e) => error!("accept error: {e}"),
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    info!("sluice stopped");
    Ok(())
}

/// Serves every request of one connection, HTTP/1.1 or HTTP/2.
async fn connection(app: App, stream: TcpStream, peer: SocketAddr) {
    let service = service_fn(move |req| dispatch(app.clone(), req, peer));
    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %peer, "connection closed with error: {e}");
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs one request through `app` and converts the settled response.
///
/// The error type is [`Infallible`]: failures become responses (400, 405,
/// or whatever the application's terminal handler writes) so hyper never
/// sees an error.
async fn dispatch(
    app: App,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let Ok(method) = Method::try_from(&parts.method) else {
        debug!(method = %parts.method, "unsupported method");
        return Ok(bare(StatusCode::METHOD_NOT_ALLOWED));
    };

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(bare(StatusCode::BAD_REQUEST));
        }
    };

    let url = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let request = Request::new(method, url)
        .with_headers(parts.headers)
        .with_body(body)
        .with_remote_addr(remote_addr);
    let response = Response::new();

    app.handle(request, response.clone()).await;
    Ok(response.to_http())
}

fn bare(status: StatusCode) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or Ctrl-C; Ctrl-C only off Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
