//! faces-mesh - fault-injecting microservices for service mesh demos
//!
//! Each process runs as one fragment service (`color`, `smiley`, `shape`,
//! `quote`) or as the composite `face` service that fans out to the
//! fragments. Every service can inject latency and errors, latch into a
//! persistent failure state, and rate limit itself, so a mesh's retries,
//! timeouts and circuit breaking have something real to react to.

pub mod admin;
pub mod config;
pub mod dependency;
pub mod error;
pub mod faces;
pub mod fallback;
pub mod fault;
pub mod listener;
pub mod metrics;
pub mod orchestrator;
pub mod ratelimit;
pub mod service;
