//! Outbound calls to fragment services.
//!
//! A fetch never fails in the Rust sense: every transport error, upstream
//! error and malformed success is folded into a [`DependencyOutcome`] the
//! orchestrator can match on.

use crate::metrics::Metrics;
use crate::orchestrator::latency_ms;
use http::header::{HeaderName, USER_AGENT};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Placeholder used when the caller did not identify itself.
pub const UNKNOWN_CALLER: &str = "unknown";

/// Status reported when a success response carries nothing usable.
pub const MALFORMED_STATUS: u16 = 400;

/// Status reported when the dependency could not be reached at all.
pub const TRANSPORT_STATUS: u16 = 500;

/// A fragment service the orchestrator depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Name used in error strings and fallback keys.
    pub name: String,
    /// Host (and optional port) the service answers on.
    pub service: String,
    /// JSON field carrying the fragment, also the output field.
    pub field: String,
}

impl Dependency {
    /// A dependency reachable at `http://<name>/` whose field is `field`.
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            service: name.clone(),
            name,
            field: field.into(),
        }
    }

    /// Overrides the address the service is reached at.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// URL fetched for this dependency.
    pub fn url(&self) -> String {
        format!("http://{}/", self.service)
    }
}

/// Identity of the original caller, forwarded to every dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerMeta {
    pub user: String,
    pub user_agent: String,
}

impl Default for CallerMeta {
    fn default() -> Self {
        Self {
            user: UNKNOWN_CALLER.to_string(),
            user_agent: UNKNOWN_CALLER.to_string(),
        }
    }
}

impl CallerMeta {
    /// Builds caller metadata from inbound headers.
    pub fn from_headers(headers: &HeaderMap, user_header: &HeaderName) -> Self {
        let read = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN_CALLER)
                .to_string()
        };

        Self {
            user: read(user_header),
            user_agent: read(&USER_AGENT),
        }
    }
}

/// Classified result of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyOutcome {
    /// 200 with a non-empty fragment.
    Value(String),
    /// Anything else.
    Failed { status: u16, detail: String },
}

impl DependencyOutcome {
    /// 200 for a value, otherwise the failure status.
    pub fn status(&self) -> u16 {
        match self {
            DependencyOutcome::Value(_) => 200,
            DependencyOutcome::Failed { status, .. } => *status,
        }
    }

    /// The fragment, or `""` on failure.
    pub fn value(&self) -> &str {
        match self {
            DependencyOutcome::Value(v) => v,
            DependencyOutcome::Failed { .. } => "",
        }
    }

    /// Diagnostic text, or `""` on success.
    pub fn error_detail(&self) -> &str {
        match self {
            DependencyOutcome::Value(_) => "",
            DependencyOutcome::Failed { detail, .. } => detail,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DependencyOutcome::Value(_))
    }
}

/// Classifies a completed HTTP exchange.
pub fn classify(service: &str, field: &str, status: u16, body: &[u8]) -> DependencyOutcome {
    if status != 200 {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        let detail = if text.is_empty() {
            format!("error from {}: {:03}", service, status)
        } else {
            format!("error from {}: {:03} ({})", service, status, text)
        };
        return DependencyOutcome::Failed { status, detail };
    }

    let data: Value = match serde_json::from_slice(body) {
        Ok(data) => data,
        Err(e) => {
            return DependencyOutcome::Failed {
                status: MALFORMED_STATUS,
                detail: format!("couldn't decode response from {}: {}", service, e),
            }
        }
    };

    match data.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => DependencyOutcome::Value(value.to_string()),
        _ => DependencyOutcome::Failed {
            status: MALFORMED_STATUS,
            detail: format!("no {} in response from {}", field, service),
        },
    }
}

/// Something that can fetch a fragment from a dependency.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(
        &self,
        dependency: &Dependency,
        caller: &CallerMeta,
    ) -> impl Future<Output = DependencyOutcome> + Send;
}

/// HTTP client for fragment services.
#[derive(Clone)]
pub struct DependencyClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    request_timeout: Duration,
    user_header: HeaderName,
}

impl DependencyClient {
    /// Creates a client that forwards the caller's identity under
    /// `user_header` and gives up after `request_timeout`.
    pub fn new(request_timeout: Duration, user_header: HeaderName) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            request_timeout,
            user_header,
        }
    }

    fn build_request(
        &self,
        dependency: &Dependency,
        caller: &CallerMeta,
    ) -> std::result::Result<Request<Empty<Bytes>>, String> {
        let uri: Uri = dependency.url().parse().map_err(|e| format!("{}", e))?;

        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(&self.user_header, caller.user.as_str())
            .header(USER_AGENT, caller.user_agent.as_str())
            .body(Empty::new())
            .map_err(|e| e.to_string())
    }

    async fn exchange(
        &self,
        req: Request<Empty<Bytes>>,
    ) -> std::result::Result<(u16, Bytes), String> {
        let response = self.client.request(req).await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?
            .to_bytes();
        Ok((status, body))
    }

    #[instrument(level = "debug", skip_all, fields(dependency = %dependency.name))]
    async fn fetch_once(&self, dependency: &Dependency, caller: &CallerMeta) -> DependencyOutcome {
        let start = Instant::now();
        let url = dependency.url();
        debug!(url = %url, "fetch starting");

        let outcome = match self.build_request(dependency, caller) {
            Err(e) => DependencyOutcome::Failed {
                status: TRANSPORT_STATUS,
                detail: format!("couldn't create request to {}: {}", dependency.service, e),
            },
            Ok(req) => match timeout(self.request_timeout, self.exchange(req)).await {
                Ok(Ok((status, body))) => {
                    classify(&dependency.service, &dependency.field, status, &body)
                }
                Ok(Err(e)) => DependencyOutcome::Failed {
                    status: TRANSPORT_STATUS,
                    detail: format!("couldn't make request to {}: {}", dependency.service, e),
                },
                Err(_) => DependencyOutcome::Failed {
                    status: TRANSPORT_STATUS,
                    detail: format!(
                        "request to {} timed out after {}ms",
                        dependency.service,
                        self.request_timeout.as_millis()
                    ),
                },
            },
        };

        let elapsed_ms = latency_ms(start.elapsed());
        Metrics::record_dependency(&dependency.name, outcome.status());

        match &outcome {
            DependencyOutcome::Value(value) => {
                debug!(url = %url, latency_ms = elapsed_ms, value = %value, "fetch done");
            }
            DependencyOutcome::Failed { status, detail } => {
                warn!(url = %url, latency_ms = elapsed_ms, status = *status, "{}", detail);
            }
        }

        outcome
    }
}

impl Fetch for DependencyClient {
    fn fetch(
        &self,
        dependency: &Dependency,
        caller: &CallerMeta,
    ) -> impl Future<Output = DependencyOutcome> + Send {
        self.fetch_once(dependency, caller)
    }
}
