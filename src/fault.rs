//! Per-process fault injection.
//!
//! Every inbound request passes through [`FaultInjector::admit`] before any
//! service logic runs. The injector may delay the request, fail it with a
//! generic error, or fail it because the process has latched into a sticky
//! error state. The latch clears itself once the service has been left alone
//! for [`LATCH_RESET_AFTER`].

use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Status used for requests refused because the injector is latched.
pub const LATCHED_STATUS: u16 = 599;

/// Status used for injected, non-latched errors.
pub const ERROR_STATUS: u16 = 500;

/// Body returned with [`LATCHED_STATUS`].
pub const LATCHED_MESSAGE: &str = "Error state latched";

/// Default body returned with [`ERROR_STATUS`].
pub const DEFAULT_ERROR_TEXT: &str = "Error fraction triggered";

/// Idle gap after which a latched injector recovers.
pub const LATCH_RESET_AFTER: Duration = Duration::from_secs(30);

/// Fault injection settings, already clamped to valid ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    /// Percent chance (0-100) a request fails.
    pub error_fraction: u8,
    /// Percent chance (0-100) a failure latches.
    pub latch_fraction: u8,
    /// Candidate delays in milliseconds; one is picked per request.
    pub delay_buckets: Vec<u64>,
    /// Body sent with injected errors.
    pub error_text: String,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            error_fraction: 0,
            latch_fraction: 0,
            delay_buckets: Vec::new(),
            error_text: DEFAULT_ERROR_TEXT.to_string(),
        }
    }
}

impl FaultConfig {
    /// Creates a configuration with the given fractions, clamped to 100.
    pub fn new(error_fraction: u8, latch_fraction: u8) -> Self {
        Self {
            error_fraction: error_fraction.min(100),
            latch_fraction: latch_fraction.min(100),
            ..Default::default()
        }
    }

    /// Sets the delay buckets.
    pub fn with_delay_buckets(mut self, buckets: Vec<u64>) -> Self {
        self.delay_buckets = buckets;
        self
    }

    /// Sets the error body.
    pub fn with_error_text(mut self, text: impl Into<String>) -> Self {
        self.error_text = text.into();
        self
    }
}

/// Outcome of admission for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed to the service handler.
    Admitted,
    /// The request failed by the error fraction.
    Errored { message: String },
    /// The request failed because the injector is latched.
    Latched,
}

impl Admission {
    /// Whether the handler should run.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// HTTP status for the response.
    pub fn status(&self) -> u16 {
        match self {
            Admission::Admitted => 200,
            Admission::Errored { .. } => ERROR_STATUS,
            Admission::Latched => LATCHED_STATUS,
        }
    }

    /// Plain-text body for a rejected request.
    pub fn body(&self) -> &str {
        match self {
            Admission::Admitted => "",
            Admission::Errored { message } => message,
            Admission::Latched => LATCHED_MESSAGE,
        }
    }
}

/// Point-in-time copy of the latch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSnapshot {
    pub latched: bool,
    pub latch_count: u64,
}

#[derive(Debug)]
struct FaultState {
    latched: bool,
    latch_count: u64,
    last_request_time: Instant,
}

/// Latching error-injection state machine.
///
/// # Example
///
/// ```
/// use faces_mesh::fault::{Admission, FaultConfig, FaultInjector};
///
/// #[tokio::main]
/// async fn main() {
///     let injector = FaultInjector::new(FaultConfig::new(100, 0));
///     let admission = injector.admit().await;
///     assert_eq!(admission.status(), 500);
/// }
/// ```
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultConfig,
    state: Mutex<FaultState>,
}

impl FaultInjector {
    /// Creates an injector. The idle clock starts now.
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FaultState {
                latched: false,
                latch_count: 0,
                last_request_time: Instant::now(),
            }),
        }
    }

    /// Creates an injector that never delays or fails.
    pub fn disabled() -> Self {
        Self::new(FaultConfig::default())
    }

    /// Decides the fate of a request arriving now.
    pub async fn admit(&self) -> Admission {
        self.admit_at(Instant::now()).await
    }

    /// Decides the fate of a request that arrived at `now`.
    pub async fn admit_at(&self, now: Instant) -> Admission {
        self.observe_arrival(now);

        if let Some(delay) = self.pick_delay() {
            tokio::time::sleep(delay).await;
        }

        self.decide()
    }

    /// Records an arrival, clearing the latch if the service sat idle long
    /// enough.
    fn observe_arrival(&self, now: Instant) {
        let mut state = self.state.lock();
        let idle = now.saturating_duration_since(state.last_request_time);
        state.last_request_time = now;

        if idle > LATCH_RESET_AFTER && state.latched {
            debug!(idle_ms = idle.as_millis() as u64, "idle gap elapsed, unlatching");
            state.latched = false;
            state.latch_count = 0;
        }
    }

    fn pick_delay(&self) -> Option<Duration> {
        if self.config.delay_buckets.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..self.config.delay_buckets.len());
        match self.config.delay_buckets[idx] {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn decide(&self) -> Admission {
        {
            let mut state = self.state.lock();
            if state.latched {
                state.latch_count += 1;
                return Admission::Latched;
            }
        }

        if self.config.error_fraction == 0 {
            return Admission::Admitted;
        }

        let mut rng = rand::thread_rng();
        if rng.gen_range(0..100u8) > self.config.error_fraction {
            return Admission::Admitted;
        }

        debug!("error fraction triggered");

        if self.config.latch_fraction > 0 && rng.gen_range(0..100u8) <= self.config.latch_fraction
        {
            self.latch();
            debug!("error latched");
            return Admission::Latched;
        }

        Admission::Errored {
            message: self.config.error_text.clone(),
        }
    }

    /// Forces the injector into the latched state.
    pub fn latch(&self) {
        let mut state = self.state.lock();
        state.latched = true;
        state.latch_count = 0;
    }

    /// Clears the latched state.
    pub fn unlatch(&self) {
        let mut state = self.state.lock();
        state.latched = false;
        state.latch_count = 0;
    }

    /// Whether the injector is currently latched.
    pub fn is_latched(&self) -> bool {
        self.state.lock().latched
    }

    /// Copy of the latch fields, read atomically.
    pub fn snapshot(&self) -> FaultSnapshot {
        let state = self.state.lock();
        FaultSnapshot {
            latched: state.latched,
            latch_count: state.latch_count,
        }
    }
}
