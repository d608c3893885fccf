//! Prometheus metrics collection and export.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for inbound request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Service kind answering the request (color, face, ...)
    pub service: String,
    /// HTTP status code sent back
    pub status: String,
}

/// Labels for outbound dependency metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DependencyLabels {
    pub dependency: String,
    /// Classified status (200, upstream code, 400 or 500)
    pub status: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for a faces service.
///
/// Tracks request counts and latencies, plus the outcome of every
/// dependency fetch.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<RequestLabels, Histogram>,
    dependency_requests_total: Family<DependencyLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "faces_requests_total",
            "Total number of inbound requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            });
        registry.register(
            "faces_request_duration_seconds",
            "Inbound request latency in seconds",
            request_duration_seconds.clone(),
        );

        let dependency_requests_total = Family::<DependencyLabels, Counter>::default();
        registry.register(
            "faces_dependency_requests_total",
            "Total number of dependency fetches by outcome",
            dependency_requests_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            dependency_requests_total,
        }
    }

    /// Records an inbound request.
    ///
    /// # Arguments
    ///
    /// * `service` - Service kind name
    /// * `status` - HTTP status code sent
    /// * `duration_secs` - Time from arrival to response in seconds
    pub fn record_request(service: &str, status: u16, duration_secs: f64) {
        let labels = RequestLabels {
            service: service.to_string(),
            status: status.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Records one classified dependency fetch.
    pub fn record_dependency(dependency: &str, status: u16) {
        let labels = DependencyLabels {
            dependency: dependency.to_string(),
            status: status.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.dependency_requests_total.get_or_create(&labels).inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}
