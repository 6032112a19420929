//! Minimal host HTTP server with the engine router in front of a local handler
//!
//! Used by the `enginegate` binary and handy for embedding: anything that is
//! not engine traffic reaches the [`LocalHandler`].

use crate::client::boxed;
use crate::router::{EngineRouter, RouterBody};
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The host application's own request handler
pub type LocalHandler =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<RouterBody>> + Send + Sync>;

pub struct HostServer {
    bind_addr: SocketAddr,
    router: EngineRouter,
    local: LocalHandler,
    shutdown_rx: watch::Receiver<bool>,
}

impl HostServer {
    pub fn new(bind_addr: SocketAddr, router: EngineRouter, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            local: not_found_handler(),
            shutdown_rx,
        }
    }

    /// Serve non-engine traffic with `handler` (builder pattern)
    pub fn with_local_handler(mut self, handler: LocalHandler) -> Self {
        self.local = handler;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            %addr,
            mount_path = self.router.state().mount_path(),
            "Host server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let router = self.router.clone();
                            let local = Arc::clone(&self.local);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, router, local).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Host server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    router: EngineRouter,
    local: LocalHandler,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        let local = Arc::clone(&local);
        async move { Ok::<_, Infallible>(router.handle(req, |req| (*local)(req)).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

fn not_found_handler() -> LocalHandler {
    Arc::new(|_req: Request<Incoming>| -> BoxFuture<'static, Response<RouterBody>> {
        Box::pin(async {
            let mut response = Response::new(boxed(Full::new(Bytes::from_static(b"Not Found"))));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        })
    })
}
