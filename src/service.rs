//! Tower service answering fragment and composite requests.

use crate::config::{ConfigError, FacesConfig};
use crate::dependency::{CallerMeta, Dependency, DependencyClient, Fetch};
use crate::faces::{pick, Color, ServiceKind, Smiley, QUOTES, SHAPES};
use crate::fallback::FallbackTable;
use crate::fault::FaultInjector;
use crate::metrics::Metrics;
use crate::orchestrator::CompositeOrchestrator;
use crate::ratelimit::RateLimiter;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Service;
use tracing::{debug, instrument};

/// Response body type used by every handler.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Header identifying the pod that answered.
pub const POD_HEADER: &str = "x-faces-pod";

const TOO_MANY_REQUESTS: u16 = 429;

/// HTTP front end for one faces service.
///
/// Cheap to clone: everything shared lives behind an `Arc`. The listener
/// clones one instance per connection and stamps the peer address on it.
///
/// # Example
///
/// ```no_run
/// use faces_mesh::faces::ServiceKind;
/// use faces_mesh::fault::FaultInjector;
/// use faces_mesh::service::FacesService;
/// use http::header::HeaderName;
/// use std::sync::Arc;
///
/// let service: FacesService = FacesService::new(
///     ServiceKind::Color,
///     Arc::new(FaultInjector::disabled()),
///     HeaderName::from_static("x-faces-user"),
///     "10.0.0.7",
/// )
/// .with_leaf_value("rgb(55 117 59)");
/// ```
pub struct FacesService<F: Fetch = DependencyClient> {
    kind: ServiceKind,
    faults: Arc<FaultInjector>,
    limiter: Option<Arc<RateLimiter>>,
    orchestrator: Option<CompositeOrchestrator<F>>,
    fallbacks: Arc<FallbackTable>,
    leaf_value: Option<Arc<str>>,
    user_header: HeaderName,
    host_id: Arc<str>,
    peer_addr: Option<SocketAddr>,
}

impl<F: Fetch> Clone for FacesService<F> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            faults: Arc::clone(&self.faults),
            limiter: self.limiter.clone(),
            orchestrator: self.orchestrator.clone(),
            fallbacks: Arc::clone(&self.fallbacks),
            leaf_value: self.leaf_value.clone(),
            user_header: self.user_header.clone(),
            host_id: Arc::clone(&self.host_id),
            peer_addr: self.peer_addr,
        }
    }
}

impl FacesService<DependencyClient> {
    /// Builds the service described by `config`.
    ///
    /// The rate limiter, if any, is shared with the composite gate so `/rl`
    /// reports the same counter the gate consults.
    pub fn from_config(
        config: &FacesConfig,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self, ConfigError> {
        let user_header = config.user_header()?;
        let faults = Arc::new(FaultInjector::new(config.fault_config()));

        let service = Self::new(
            config.service,
            faults,
            user_header.clone(),
            config.host_id.as_str(),
        )
        .with_rate_limiter(limiter.clone());

        let service = match config.service {
            ServiceKind::Face => {
                let dependencies = vec![
                    Dependency::new("smiley", "smiley").with_service(&config.smiley_service),
                    Dependency::new("color", "color").with_service(&config.color_service),
                ];
                let client = DependencyClient::new(config.request_timeout, user_header);
                let orchestrator = CompositeOrchestrator::new(
                    dependencies,
                    FallbackTable::faces_defaults(),
                    client,
                )
                .with_rate_limiter(limiter);
                service.with_orchestrator(orchestrator)
            }
            ServiceKind::Color => service.with_leaf_value(Color::resolve(&config.color)),
            ServiceKind::Smiley => service.with_leaf_value(Smiley::lookup(&config.smiley).entity()),
            ServiceKind::Shape | ServiceKind::Quote => service,
        };

        Ok(service)
    }
}

impl<F: Fetch> FacesService<F> {
    /// Creates a service with no rate limiter and no fixed fragment value.
    pub fn new(
        kind: ServiceKind,
        faults: Arc<FaultInjector>,
        user_header: HeaderName,
        host_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            kind,
            faults,
            limiter: None,
            orchestrator: None,
            fallbacks: Arc::new(FallbackTable::faces_defaults()),
            leaf_value: None,
            user_header,
            host_id: host_id.into(),
            peer_addr: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Answers `GET /` by composing fragments from dependencies.
    pub fn with_orchestrator(mut self, orchestrator: CompositeOrchestrator<F>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Fixes the fragment a leaf service returns. Without one, shape and
    /// quote services pick from their catalogs per request.
    pub fn with_leaf_value(mut self, value: impl Into<Arc<str>>) -> Self {
        self.leaf_value = Some(value.into());
        self
    }

    /// Stamps the address of the connected client.
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Handles one request.
    #[instrument(level = "debug", skip(self, req), fields(service = %self.kind, method = %req.method(), path = %req.uri().path()))]
    pub async fn respond<B>(&self, req: Request<B>) -> Response<ResponseBody> {
        let start = Instant::now();
        let (parts, _) = req.into_parts();

        let response = match (&parts.method, parts.uri.path()) {
            (&Method::HEAD, _) => self.empty_response(&parts),
            (&Method::GET, "/") => self.handle_get(&parts).await,
            (&Method::GET, "/rl") => self.handle_rate(&parts),
            (&Method::GET, path) => {
                self.text_response(&parts, 404, &format!("Path {} not found", path))
            }
            (method, _) => {
                self.text_response(&parts, 405, &format!("Method {} not allowed", method))
            }
        };

        let status = response.status().as_u16();
        debug!(status, "responded");
        Metrics::record_request(self.kind.name(), status, start.elapsed().as_secs_f64());

        response
    }

    async fn handle_get(&self, parts: &Parts) -> Response<ResponseBody> {
        let admission = self.faults.admit().await;
        if !admission.is_admitted() {
            return self.text_response(parts, admission.status(), admission.body());
        }

        let (status, data) = match &self.orchestrator {
            Some(orchestrator) => {
                let caller = CallerMeta::from_headers(&parts.headers, &self.user_header);
                let composite = orchestrator.handle(&caller).await;

                let mut data = composite.to_json();
                if let Some(rate) = composite.rate {
                    data.insert("rate".to_string(), json!(format!("{:.1} RPS", rate)));
                }
                data.insert("latency".to_string(), json!(composite.latency_ms));

                (200, data)
            }
            None => self.leaf_fragment(),
        };

        self.json_response(parts, status, data)
    }

    /// Fragment body for a leaf service, after the rate-limit gate.
    fn leaf_fragment(&self) -> (u16, Map<String, Value>) {
        let field = self.kind.name();
        let decision = self.limiter.as_ref().map(|limiter| (limiter, limiter.check()));

        let mut data = Map::new();

        match decision {
            Some((limiter, decision)) if decision.limited => {
                let value = self
                    .fallbacks
                    .resolve_rate_limited(field, TOO_MANY_REQUESTS)
                    .unwrap_or_default();
                data.insert(field.to_string(), json!(value));
                data.insert("rate".to_string(), json!(format!("{:.1} RPS", decision.rate)));
                data.insert(
                    "errors".to_string(),
                    json!([limiter.limited_message(decision.rate)]),
                );
                (TOO_MANY_REQUESTS, data)
            }
            decision => {
                let value = match (&self.leaf_value, self.kind) {
                    (Some(value), _) => value.to_string(),
                    (None, ServiceKind::Shape) => pick(&SHAPES).to_string(),
                    (None, ServiceKind::Quote) => pick(&QUOTES).to_string(),
                    (None, _) => String::new(),
                };
                data.insert(field.to_string(), json!(value));
                let rate = decision.map_or(0.0, |(_, d)| d.rate);
                data.insert("rate".to_string(), json!(format!("{:.1} RPS", rate)));
                (200, data)
            }
        }
    }

    fn handle_rate(&self, parts: &Parts) -> Response<ResponseBody> {
        let rl = match &self.limiter {
            Some(limiter) => format!("{:.1}", limiter.current_rate()),
            None => "N/A".to_string(),
        };

        let mut data = Map::new();
        data.insert("rl".to_string(), json!(rl));
        self.json_response(parts, 200, data)
    }

    fn json_response(
        &self,
        parts: &Parts,
        status: u16,
        data: Map<String, Value>,
    ) -> Response<ResponseBody> {
        let mut body = Map::new();
        body.insert("path".to_string(), json!(parts.uri.path()));
        body.insert(
            "client_address".to_string(),
            json!(self.peer_addr.map(|a| a.to_string()).unwrap_or_default()),
        );
        body.insert("method".to_string(), json!(parts.method.as_str()));
        body.insert("headers".to_string(), headers_json(&parts.headers));
        body.insert("status".to_string(), json!(status));
        body.extend(data);

        match serde_json::to_vec(&Value::Object(body)) {
            Ok(bytes) => self.build(parts, status, "application/json", full(bytes)),
            Err(e) => self.text_response(parts, 500, &format!("Error marshalling response: {}", e)),
        }
    }

    fn text_response(&self, parts: &Parts, status: u16, message: &str) -> Response<ResponseBody> {
        self.build(parts, status, "text/plain", full(message.to_string()))
    }

    fn empty_response(&self, parts: &Parts) -> Response<ResponseBody> {
        self.build(parts, 200, "text/plain", empty())
    }

    /// Attaches the standard headers. A builder failure degrades to an
    /// empty 500 rather than panicking.
    fn build(
        &self,
        parts: &Parts,
        status: u16,
        content_type: &'static str,
        body: ResponseBody,
    ) -> Response<ResponseBody> {
        let echoed_user = parts
            .headers
            .get(&self.user_header)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));
        let echoed_agent = parts
            .headers
            .get(USER_AGENT)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));
        let pod = HeaderValue::from_str(&self.host_id)
            .unwrap_or_else(|_| HeaderValue::from_static("unknown"));

        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .header(&self.user_header, echoed_user)
            .header(USER_AGENT, echoed_agent)
            .header(POD_HEADER, pod)
            .body(body)
            .unwrap_or_else(|_| {
                let mut response = Response::new(empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            })
    }
}

/// Request headers as `{name: [values...]}`.
fn headers_json(headers: &HeaderMap) -> Value {
    let map: Map<String, Value> = headers
        .keys()
        .map(|name| {
            let values: Vec<Value> = headers
                .get_all(name)
                .iter()
                .map(|v| json!(String::from_utf8_lossy(v.as_bytes())))
                .collect();
            (name.as_str().to_string(), Value::Array(values))
        })
        .collect();
    Value::Object(map)
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

fn empty() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

impl<F: Fetch> Service<Request<Incoming>> for FacesService<F> {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.respond(req).await) })
    }
}
