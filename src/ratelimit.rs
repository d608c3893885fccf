//! Sliding-window rate estimation and the rate-limit gate.
//!
//! [`RateCounter`] keeps one bucket per whole second over a fixed window and
//! reports the mean events per second across it. [`RateLimiter`] marks the
//! counter on every request and trips once the mean reaches a ceiling.
//!
//! Unlike a token bucket, nothing is consumed here: a limited request is still
//! counted, so a caller hammering a limited service stays limited until it
//! backs off for long enough that the window drains.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Window size used by services that have rate limiting configured.
pub const DEFAULT_WINDOW_SECS: usize = 10;

/// Ceilings below this are treated as "no rate limiting".
pub const MIN_MAX_RATE: f64 = 0.1;

/// Origin and buckets, always mutated together.
#[derive(Debug)]
struct Window {
    origin: Option<Instant>,
    buckets: Vec<u64>,
}

impl Window {
    /// Slides the window so that `now` falls inside it and returns the
    /// bucket index for `now`.
    fn advance(&mut self, now: Instant) -> usize {
        let size = self.buckets.len();
        let origin = *self.origin.get_or_insert(now);

        let offset = now.saturating_duration_since(origin).as_secs() as usize;
        if offset < size {
            return offset;
        }

        let shift = offset - size + 1;
        if shift >= size {
            self.buckets.iter_mut().for_each(|b| *b = 0);
        } else {
            self.buckets.drain(..shift);
            self.buckets.resize(size, 0);
        }

        let origin = origin + Duration::from_secs(shift as u64);
        self.origin = Some(origin);

        now.saturating_duration_since(origin).as_secs() as usize
    }
}

/// Thread-safe counter of events in an N-second sliding window.
///
/// # Example
///
/// ```
/// use faces_mesh::ratelimit::RateCounter;
/// use std::time::{Duration, Instant};
///
/// let counter = RateCounter::new(10);
/// let start = Instant::now();
/// for i in 0..5 {
///     counter.mark_at(start + Duration::from_millis(i * 100));
/// }
/// assert!((counter.current_rate() - 0.5).abs() < f64::EPSILON);
/// ```
#[derive(Debug)]
pub struct RateCounter {
    window: Mutex<Window>,
}

impl RateCounter {
    /// Creates a counter with `window_size` one-second buckets.
    ///
    /// A zero window is bumped to a single bucket.
    pub fn new(window_size: usize) -> Self {
        Self {
            window: Mutex::new(Window {
                origin: None,
                buckets: vec![0; window_size.max(1)],
            }),
        }
    }

    /// Number of buckets in the window.
    pub fn window_size(&self) -> usize {
        self.window.lock().buckets.len()
    }

    /// Records one event now.
    pub fn mark(&self) {
        self.mark_at(Instant::now());
    }

    /// Records one event at `now`.
    pub fn mark_at(&self, now: Instant) {
        let mut window = self.window.lock();
        let bucket = window.advance(now);
        window.buckets[bucket] += 1;
    }

    /// Moves the window forward to `now` without recording anything.
    ///
    /// Returns the bucket index `now` falls into.
    pub fn tick_at(&self, now: Instant) -> usize {
        self.window.lock().advance(now)
    }

    /// Mean events per second over the window.
    pub fn current_rate(&self) -> f64 {
        let window = self.window.lock();
        let total: u64 = window.buckets.iter().sum();
        total as f64 / window.buckets.len() as f64
    }

    /// Copy of the current bucket counts, oldest first.
    pub fn buckets(&self) -> Vec<u64> {
        self.window.lock().buckets.clone()
    }
}

impl fmt::Display for RateCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let window = self.window.lock();
        match window.origin {
            Some(origin) => write!(
                f,
                "RateCounter@-{}ms: {:?}",
                origin.elapsed().as_millis(),
                window.buckets
            ),
            None => write!(f, "RateCounter@unset: {:?}", window.buckets),
        }
    }
}

/// Result of passing a request through the rate-limit gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Rate observed after marking this request.
    pub rate: f64,
    /// Whether the rate reached the ceiling.
    pub limited: bool,
}

/// Rate-limit gate over a [`RateCounter`].
#[derive(Debug)]
pub struct RateLimiter {
    counter: RateCounter,
    max_rate: f64,
}

impl RateLimiter {
    /// Creates a gate with the given ceiling in requests per second.
    pub fn new(max_rate: f64, window_size: usize) -> Self {
        Self {
            counter: RateCounter::new(window_size),
            max_rate: max_rate.max(0.0),
        }
    }

    /// Returns a gate with the default window, or `None` when `max_rate` is
    /// too small to mean anything.
    pub fn from_max_rate(max_rate: f64) -> Option<Self> {
        if max_rate >= MIN_MAX_RATE {
            Some(Self::new(max_rate, DEFAULT_WINDOW_SECS))
        } else {
            None
        }
    }

    /// Configured ceiling.
    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    /// Current rate of the underlying counter.
    pub fn current_rate(&self) -> f64 {
        self.counter.current_rate()
    }

    /// The underlying counter.
    pub fn counter(&self) -> &RateCounter {
        &self.counter
    }

    /// Marks a request now and decides whether it is rate limited.
    pub fn check(&self) -> RateDecision {
        self.check_at(Instant::now())
    }

    /// Marks a request at `now` and decides whether it is rate limited.
    pub fn check_at(&self, now: Instant) -> RateDecision {
        self.counter.mark_at(now);
        let rate = self.counter.current_rate();
        let limited = rate >= self.max_rate;

        if limited {
            debug!(rate = rate, max_rate = self.max_rate, "rate limit tripped");
        }

        RateDecision { rate, limited }
    }

    /// Message used when a request is refused for rate.
    pub fn limited_message(&self, rate: f64) -> String {
        format!(
            "Rate limited ({:.1} RPS > max {:.1} RPS)",
            rate, self.max_rate
        )
    }

    /// Spawns a task that ticks the counter once per second so the rate
    /// decays while no requests arrive.
    pub fn spawn_ticker(limiter: Arc<RateLimiter>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                limiter.counter.tick_at(Instant::now());
            }
        })
    }
}
