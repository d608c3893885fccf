//! Admin endpoints for health checks and metrics.

use crate::metrics::Metrics;
use crate::service::ResponseBody;
use http::header::CONTENT_TYPE;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Admin service for health checks and metrics endpoints.
///
/// Serves:
/// - `/health` - Liveness check returning `healthy`
/// - `/metrics` - Prometheus metrics in text format
///
/// Fault injection never applies here, so health checks keep passing
/// while the service itself is latched.
#[derive(Clone, Default)]
pub struct AdminService;

impl AdminService {
    pub fn new() -> Self {
        Self
    }

    /// Routes one admin request.
    pub fn respond<B>(req: &Request<B>) -> Response<ResponseBody> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Self::text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method not allowed");
        }

        match req.uri().path() {
            "/health" => {
                debug!("health check requested");
                Self::text(StatusCode::OK, "text/plain", "healthy")
            }
            "/metrics" => {
                debug!("metrics requested");
                match Metrics::encode() {
                    Ok(metrics) => Self::text(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, metrics),
                    Err(e) => {
                        warn!("failed to encode metrics: {}", e);
                        Self::text(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "text/plain",
                            "Failed to encode metrics",
                        )
                    }
                }
            }
            _ => Self::text(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        }
    }

    fn text(
        status: StatusCode,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> Response<ResponseBody> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| Response::new(Empty::new().map_err(|never| match never {}).boxed()))
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let response = Self::respond(&req);
        Box::pin(async move { Ok(response) })
    }
}
