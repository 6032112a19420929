//! Per-request routing between the host's own handler and the engine
//!
//! Every inbound request goes through [`decide`]. Only GET/POST requests for
//! the mount path are forwarded, and only while the supervisor has published
//! an engine URI. Requests the engine itself sends back to the host carry the
//! loop-prevention header and always stay local.

use crate::client::{boxed, ClientError, EngineClient};
use crate::error::{json_error_response, BoxError, ProxyErrorCode};
use crate::state::{SharedRouteState, LOOP_HEADER};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame};
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Body type produced by the router for both local and forwarded responses
pub type RouterBody = UnsyncBoxBody<Bytes, BoxError>;

/// Minimal view of an inbound request the decision core needs
pub trait InboundRequest {
    fn method(&self) -> &Method;
    /// Path plus query string as received, e.g. `/graphql?query=...`
    fn path_and_query(&self) -> &str;
    fn header(&self, name: &str) -> Option<&HeaderValue>;
}

impl<B> InboundRequest for Request<B> {
    fn method(&self) -> &Method {
        Request::method(self)
    }

    fn path_and_query(&self) -> &str {
        self.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri().path())
    }

    fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers().get(name)
    }
}

/// Why a request stays with the local handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReason {
    /// No engine URI is published
    NoEngine,
    /// The request targets another path
    OtherPath,
    /// The engine only handles GET and POST
    Method,
    /// The request came from the engine itself
    LoopBack,
}

/// Outcome of the routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Local(LocalReason),
    /// Forward to the engine at this base URI
    Forward(Arc<String>),
}

/// Decide where a request goes. Never mutates the route state.
pub fn decide<R: InboundRequest + ?Sized>(state: &SharedRouteState, req: &R) -> RouteDecision {
    let Some(base) = state.engine_uri() else {
        return RouteDecision::Local(LocalReason::NoEngine);
    };

    if !state.matches_mount(req.path_and_query()) {
        return RouteDecision::Local(LocalReason::OtherPath);
    }

    if req.method() != Method::GET && req.method() != Method::POST {
        return RouteDecision::Local(LocalReason::Method);
    }

    let from_engine = req
        .header(LOOP_HEADER)
        .map(|v| v.as_bytes() == state.loop_secret().as_bytes())
        .unwrap_or(false);
    if from_engine {
        return RouteDecision::Local(LocalReason::LoopBack);
    }

    RouteDecision::Forward(base)
}

/// Router shared by every hosting adapter
#[derive(Clone)]
pub struct EngineRouter {
    state: SharedRouteState,
    client: Arc<EngineClient>,
}

impl EngineRouter {
    pub fn new(state: SharedRouteState) -> Self {
        Self::with_client(state, Arc::new(EngineClient::default()))
    }

    pub fn with_client(state: SharedRouteState, client: Arc<EngineClient>) -> Self {
        Self { state, client }
    }

    pub fn state(&self) -> &SharedRouteState {
        &self.state
    }

    pub fn client(&self) -> &Arc<EngineClient> {
        &self.client
    }

    pub fn decide<R: InboundRequest + ?Sized>(&self, req: &R) -> RouteDecision {
        decide(&self.state, req)
    }

    /// Route a request, calling `next` when it should be served locally.
    ///
    /// This is the adapter for hyper `service_fn` servers and any other stack
    /// that can express its local handler as an async closure.
    pub async fn handle<B, F, Fut, ResBody>(&self, req: Request<B>, next: F) -> Response<RouterBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
        F: FnOnce(Request<B>) -> Fut,
        Fut: Future<Output = Response<ResBody>>,
        ResBody: Body<Data = Bytes> + Send + 'static,
        ResBody::Error: Into<BoxError>,
    {
        match self.decide(&req) {
            RouteDecision::Forward(base) => self.forward(req, &base).await,
            RouteDecision::Local(reason) => {
                debug!(?reason, path = req.path_and_query(), "Serving request locally");
                next(req).await.map(boxed)
            }
        }
    }

    /// Stream a request to the engine and its response back.
    ///
    /// A failed connection answers 502 to this caller only. A request that
    /// cannot be built from `base_uri` answers 500.
    pub async fn forward<B>(&self, req: Request<B>, base_uri: &str) -> Response<RouterBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let dump = self.state.dump_traffic();
        let method = req.method().clone();
        let path = req.path_and_query().to_string();

        let req = req.map(|body| {
            let body = boxed(body);
            if dump {
                tap(body, "request")
            } else {
                body
            }
        });

        debug!(%method, path, engine = base_uri, "Forwarding request to engine");

        match self.client.send_request(req, base_uri).await {
            Ok(response) => response.map(|body| {
                let body = boxed(body);
                if dump {
                    tap(body, "response")
                } else {
                    body
                }
            }),
            Err(e @ ClientError::RequestBuild(_)) => {
                warn!(%method, path, engine = base_uri, error = %e, "Failed to build engine request");
                json_error_response(ProxyErrorCode::InternalError, "Failed to build engine request")
            }
            Err(e) => {
                warn!(%method, path, engine = base_uri, error = %e, "Failed to forward request to engine");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to engine")
            }
        }
    }
}

/// Copy each data frame to the traffic log without altering it.
///
/// Bytes are logged escaped, so binary payloads survive intact.
fn tap(body: RouterBody, direction: &'static str) -> RouterBody {
    body.map_frame(move |frame: Frame<Bytes>| {
        if let Some(data) = frame.data_ref() {
            info!(
                target: "enginegate::traffic",
                direction,
                len = data.len(),
                "{}",
                data.escape_ascii()
            );
        }
        frame
    })
    .boxed_unsync()
}
