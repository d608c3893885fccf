//! Fallback values for failed dependency fetches.
//!
//! Keys are tried from most to least specific:
//!
//! 1. `"<dependency>-<status>"`, e.g. `color-504`
//! 2. `"<dependency>-<class>xx"`, e.g. `color-5xx`
//! 3. `"<dependency>"`
//!
//! Rate-limited fragments use `"<dependency>-ratelimit"` ahead of the same
//! chain.

use crate::faces::{Color, Smiley, CROSSED_OUT_SHAPE, FALLBACK_QUOTE};
use std::collections::HashMap;

/// Suffix for entries used when a request is rate limited.
pub const RATELIMIT_SUFFIX: &str = "ratelimit";

/// Candidate keys for a failed fetch, in lookup order.
pub fn candidate_keys(dependency: &str, status: u16) -> [String; 3] {
    [
        format!("{}-{}", dependency, status),
        format!("{}-{}xx", dependency, status / 100),
        dependency.to_string(),
    ]
}

/// Read-only mapping from fallback keys to substitute values.
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    entries: HashMap<String, String>,
}

impl FallbackTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// The table used by the face service.
    pub fn faces_defaults() -> Self {
        Self::new()
            .with_entry("color", Color::Grey.value())
            .with_entry("smiley", Smiley::Cursing.entity())
            // Timeouts from the fragment services get a sleepy face.
            .with_entry("color-504", Color::Pink.value())
            .with_entry("smiley-504", Smiley::Sleeping.entity())
            .with_entry("color-ratelimit", Color::Pink.value())
            .with_entry("smiley-ratelimit", Smiley::Kaboom.entity())
            .with_entry("shape", CROSSED_OUT_SHAPE)
            .with_entry("quote", FALLBACK_QUOTE)
    }

    /// Looks up a single key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Resolves the fallback for `dependency` failing with `status`.
    pub fn resolve(&self, dependency: &str, status: u16) -> Option<&str> {
        candidate_keys(dependency, status)
            .iter()
            .find_map(|key| self.get(key))
    }

    /// Resolves the fallback for a rate-limited `dependency`.
    ///
    /// `status` feeds the ordinary chain when no rate-limit entry exists.
    pub fn resolve_rate_limited(&self, dependency: &str, status: u16) -> Option<&str> {
        self.get(&format!("{}-{}", dependency, RATELIMIT_SUFFIX))
            .or_else(|| self.resolve(dependency, status))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
