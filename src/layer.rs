//! `tower` adapter for the engine router
//!
//! Wraps any tower service (an axum router, a `tower::service_fn`, ...) so
//! that requests for the mount path are forwarded to the engine while
//! everything else reaches the wrapped service unchanged.

use crate::client::boxed;
use crate::error::BoxError;
use crate::router::{EngineRouter, RouteDecision, RouterBody};
use futures::future::BoxFuture;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Layer installing an [`EngineService`] around the inner service
#[derive(Clone)]
pub struct EngineLayer {
    router: EngineRouter,
}

impl EngineLayer {
    pub fn new(router: EngineRouter) -> Self {
        Self { router }
    }
}

impl<S> Layer<S> for EngineLayer {
    type Service = EngineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EngineService {
            inner,
            router: self.router.clone(),
        }
    }
}

/// Service forwarding mount-path traffic to the engine
#[derive(Clone)]
pub struct EngineService<S> {
    inner: S,
    router: EngineRouter,
}

impl<S, B, ResBody> Service<Request<B>> for EngineService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<RouterBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        match self.router.decide(&req) {
            RouteDecision::Forward(base) => {
                let router = self.router.clone();
                Box::pin(async move { Ok(router.forward(req, &base).await) })
            }
            RouteDecision::Local(_) => {
                let fut = self.inner.call(req);
                Box::pin(async move { fut.await.map(|response| response.map(boxed)) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RouteState, SharedRouteState, LOOP_HEADER};
    use http_body_util::{BodyExt, Full};
    use hyper::StatusCode;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn call(state: SharedRouteState, req: Request<Full<Bytes>>) -> Response<RouterBody> {
        let inner = tower::service_fn(|_req: Request<Full<Bytes>>| async {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"local"))))
        });
        EngineLayer::new(EngineRouter::new(state))
            .layer(inner)
            .oneshot(req)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_without_engine_calls_inner_service() {
        let state = Arc::new(RouteState::with_secret("/graphql", "secret", false));
        let req = Request::post("/graphql").body(Full::new(Bytes::new())).unwrap();
        let response = call(state, req).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"local");
    }

    #[tokio::test]
    async fn test_loop_header_calls_inner_service() {
        let state = Arc::new(RouteState::with_secret("/graphql", "secret", false));
        state.publish("http://127.0.0.1:1".to_string());
        let req = Request::post("/graphql")
            .header(LOOP_HEADER, "secret")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = call(state, req).await;

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"local");
    }

    #[tokio::test]
    async fn test_forward_failure_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let state = Arc::new(RouteState::with_secret("/graphql", "secret", false));
        state.publish(format!("http://127.0.0.1:{}", port));
        let req = Request::get("/graphql?query=%7Bx%7D")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = call(state, req).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
