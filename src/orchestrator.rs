//! Composite requests: fan out to fragment services and merge the results.
//!
//! A composite request never fails as a whole. Each dependency that cannot
//! deliver has its field replaced from the [`FallbackTable`] and an entry
//! appended to the `errors` list, so the caller always receives a best-effort
//! face.

use crate::dependency::{CallerMeta, Dependency, DependencyClient, DependencyOutcome, Fetch};
use crate::fallback::{FallbackTable, RATELIMIT_SUFFIX};
use crate::ratelimit::RateLimiter;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Status fed to the fallback chain for rate-limited fragments.
const RATE_LIMITED_STATUS: u16 = 429;

/// Converts an elapsed time to whole milliseconds, rounding half up.
pub fn latency_ms(elapsed: Duration) -> u64 {
    (elapsed.as_secs_f64() * 1000.0 + 0.5).floor() as u64
}

/// Merged result of one composite request.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    /// Output field and value per dependency, in declaration order.
    pub fields: Vec<(String, String)>,
    /// One entry per failed fragment, or `["ratelimit"]`.
    pub errors: Vec<String>,
    /// Rate observed by the gate, when one is configured.
    pub rate: Option<f64>,
    /// Whether the rate-limit branch was taken.
    pub rate_limited: bool,
    /// Time spent composing, in milliseconds.
    pub latency_ms: u64,
}

impl Composite {
    /// Value of an output field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// JSON members for the response body. `errors` is present only when
    /// something failed.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut data: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        if !self.errors.is_empty() {
            data.insert(
                "errors".to_string(),
                Value::Array(self.errors.iter().cloned().map(Value::String).collect()),
            );
        }

        data
    }
}

/// Drives the fan-out for a composite service.
pub struct CompositeOrchestrator<F: Fetch = DependencyClient> {
    dependencies: Arc<Vec<Dependency>>,
    fallbacks: Arc<FallbackTable>,
    limiter: Option<Arc<RateLimiter>>,
    fetcher: Arc<F>,
}

impl<F: Fetch> Clone for CompositeOrchestrator<F> {
    fn clone(&self) -> Self {
        Self {
            dependencies: Arc::clone(&self.dependencies),
            fallbacks: Arc::clone(&self.fallbacks),
            limiter: self.limiter.clone(),
            fetcher: Arc::clone(&self.fetcher),
        }
    }
}

impl<F: Fetch> CompositeOrchestrator<F> {
    /// Creates an orchestrator over `dependencies`, fetched in that order.
    pub fn new(dependencies: Vec<Dependency>, fallbacks: FallbackTable, fetcher: F) -> Self {
        Self {
            dependencies: Arc::new(dependencies),
            fallbacks: Arc::new(fallbacks),
            limiter: None,
            fetcher: Arc::new(fetcher),
        }
    }

    /// Puts a rate-limit gate in front of the fan-out.
    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Composes one response for `caller`.
    pub async fn handle(&self, caller: &CallerMeta) -> Composite {
        let start = Instant::now();

        let decision = self.limiter.as_ref().map(|limiter| limiter.check());
        let rate_limited = decision.map_or(false, |d| d.limited);

        let (fields, errors) = if rate_limited {
            self.rate_limited_fields()
        } else {
            self.fan_out(caller).await
        };

        let composite = Composite {
            fields,
            errors,
            rate: decision.map(|d| d.rate),
            rate_limited,
            latency_ms: latency_ms(start.elapsed()),
        };

        match composite.rate {
            Some(rate) => info!(
                latency_ms = composite.latency_ms,
                rate = %format!("{:.1} RPS", rate),
                errors = ?composite.errors,
                "composite done"
            ),
            None => info!(
                latency_ms = composite.latency_ms,
                errors = ?composite.errors,
                "composite done"
            ),
        }

        composite
    }

    fn rate_limited_fields(&self) -> (Vec<(String, String)>, Vec<String>) {
        let fields = self
            .dependencies
            .iter()
            .map(|dep| {
                let value = self
                    .fallbacks
                    .resolve_rate_limited(&dep.name, RATE_LIMITED_STATUS)
                    .unwrap_or_default();
                (dep.field.clone(), value.to_string())
            })
            .collect();

        (fields, vec![RATELIMIT_SUFFIX.to_string()])
    }

    async fn fan_out(&self, caller: &CallerMeta) -> (Vec<(String, String)>, Vec<String>) {
        let mut tasks = JoinSet::new();

        for (idx, dep) in self.dependencies.iter().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let dep = dep.clone();
            let caller = caller.clone();
            tasks.spawn(async move { (idx, fetcher.fetch(&dep, &caller).await) });
        }

        let mut outcomes: Vec<Option<DependencyOutcome>> = vec![None; self.dependencies.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => warn!("dependency task failed: {}", e),
            }
        }

        let mut fields = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();

        for (dep, outcome) in self.dependencies.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| DependencyOutcome::Failed {
                status: 500,
                detail: format!("fetch of {} did not complete", dep.name),
            });

            let value = match outcome {
                DependencyOutcome::Value(value) => value,
                DependencyOutcome::Failed { status, .. } => {
                    errors.push(format!("{}: {}", dep.name, status));
                    self.fallbacks
                        .resolve(&dep.name, status)
                        .unwrap_or_default()
                        .to_string()
                }
            };

            fields.push((dep.field.clone(), value));
        }

        (fields, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::{Color, Smiley};
    use std::collections::HashMap;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubFetcher {
        outcomes: HashMap<String, DependencyOutcome>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl StubFetcher {
        fn new(outcomes: &[(&str, DependencyOutcome)]) -> Self {
            Self {
                outcomes: outcomes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl Fetch for StubFetcher {
        fn fetch(
            &self,
            dependency: &Dependency,
            _caller: &CallerMeta,
        ) -> impl Future<Output = DependencyOutcome> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .get(&dependency.name)
                .cloned()
                .unwrap_or(DependencyOutcome::Failed {
                    status: 500,
                    detail: "no stub".to_string(),
                });
            let delay = self.delay;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                outcome
            }
        }
    }

    fn ok(v: &str) -> DependencyOutcome {
        DependencyOutcome::Value(v.to_string())
    }

    fn failed(status: u16) -> DependencyOutcome {
        DependencyOutcome::Failed {
            status,
            detail: String::new(),
        }
    }

    fn face_deps() -> Vec<Dependency> {
        vec![
            Dependency::new("smiley", "smiley"),
            Dependency::new("color", "color"),
        ]
    }

    fn orchestrator(fetcher: StubFetcher) -> CompositeOrchestrator<StubFetcher> {
        CompositeOrchestrator::new(face_deps(), FallbackTable::faces_defaults(), fetcher)
    }

    #[test]
    fn test_latency_ms_rounds_half_up() {
        assert_eq!(latency_ms(Duration::from_micros(0)), 0);
        assert_eq!(latency_ms(Duration::from_micros(499)), 0);
        assert_eq!(latency_ms(Duration::from_micros(500)), 1);
        assert_eq!(latency_ms(Duration::from_micros(1499)), 1);
        assert_eq!(latency_ms(Duration::from_micros(1500)), 2);
        assert_eq!(latency_ms(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    async fn test_all_dependencies_succeed() {
        let fetcher = StubFetcher::new(&[("smiley", ok("S")), ("color", ok("C"))]);
        let orch = orchestrator(fetcher);

        let composite = orch.handle(&CallerMeta::default()).await;
        assert_eq!(composite.field("smiley"), Some("S"));
        assert_eq!(composite.field("color"), Some("C"));
        assert!(composite.errors.is_empty());
        assert!(!composite.rate_limited);
        assert_eq!(composite.rate, None);

        let json = composite.to_json();
        assert!(!json.contains_key("errors"));
        assert_eq!(json["smiley"], "S");
    }

    #[tokio::test]
    async fn test_timeout_uses_status_specific_fallback() {
        let fetcher = StubFetcher::new(&[("smiley", ok("S")), ("color", failed(504))]);
        let composite = orchestrator(fetcher).handle(&CallerMeta::default()).await;

        assert_eq!(composite.field("color"), Some(Color::Pink.value()));
        assert_eq!(composite.errors, vec!["color: 504".to_string()]);
        assert_eq!(composite.to_json()["errors"][0], "color: 504");
    }

    #[tokio::test]
    async fn test_other_failures_use_bare_fallback() {
        let fetcher = StubFetcher::new(&[("smiley", failed(400)), ("color", failed(599))]);
        let composite = orchestrator(fetcher).handle(&CallerMeta::default()).await;

        assert_eq!(composite.field("smiley"), Some(Smiley::Cursing.entity()));
        assert_eq!(composite.field("color"), Some(Color::Grey.value()));
        assert_eq!(
            composite.errors,
            vec!["smiley: 400".to_string(), "color: 599".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_fallback_leaves_empty_field() {
        let fetcher = StubFetcher::new(&[("quote", failed(503))]);
        let orch = CompositeOrchestrator::new(
            vec![Dependency::new("quote", "quote")],
            FallbackTable::new(),
            fetcher,
        );

        let composite = orch.handle(&CallerMeta::default()).await;
        assert_eq!(composite.field("quote"), Some(""));
        assert_eq!(composite.errors, vec!["quote: 503".to_string()]);
    }

    #[tokio::test]
    async fn test_rate_limited_skips_fan_out() {
        let fetcher = StubFetcher::new(&[("smiley", ok("S")), ("color", ok("C"))]);
        let calls = Arc::clone(&fetcher.calls);

        let limiter = Arc::new(RateLimiter::new(1.0, 10));
        for _ in 0..9 {
            limiter.counter().mark();
        }

        let orch = orchestrator(fetcher).with_rate_limiter(Some(Arc::clone(&limiter)));
        let composite = orch.handle(&CallerMeta::default()).await;

        assert!(composite.rate_limited);
        assert!(composite.rate.unwrap() >= 1.0);
        assert_eq!(composite.errors, vec!["ratelimit".to_string()]);
        assert_eq!(composite.field("smiley"), Some(Smiley::Kaboom.entity()));
        assert_eq!(composite.field("color"), Some(Color::Pink.value()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_under_rate_limit_fans_out() {
        let fetcher = StubFetcher::new(&[("smiley", ok("S")), ("color", ok("C"))]);
        let calls = Arc::clone(&fetcher.calls);
        let limiter = Arc::new(RateLimiter::new(5.0, 10));

        let orch = orchestrator(fetcher).with_rate_limiter(Some(limiter));
        let composite = orch.handle(&CallerMeta::default()).await;

        assert!(!composite.rate_limited);
        assert_eq!(composite.rate, Some(0.1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_is_concurrent() {
        let fetcher = StubFetcher::new(&[("smiley", ok("S")), ("color", ok("C"))])
            .with_delay(Duration::from_millis(300));
        let orch = orchestrator(fetcher);

        let before = tokio::time::Instant::now();
        let composite = orch.handle(&CallerMeta::default()).await;
        let elapsed = before.elapsed();

        assert!(composite.errors.is_empty());
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_fields_follow_declaration_order() {
        let fetcher = StubFetcher::new(&[("smiley", ok("S")), ("color", ok("C"))]);
        let composite = orchestrator(fetcher).handle(&CallerMeta::default()).await;
        let keys: Vec<&str> = composite.fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["smiley", "color"]);
    }
}
