//! Floodgate - Admission Control for Web Services
//!
//! Floodgate decides whether an inbound request may proceed. Rate limiters
//! (fixed or sliding window, counted in-process or in Redis so every
//! instance shares one quota) run first; requests that pass are then gated
//! by a per-resource circuit breaker that stops traffic to a failing
//! dependency and tries it again after a cool-down.
//!
//! The gate is available as a tower middleware for axum routers and as a
//! small JSON sidecar API.

pub mod admission;
pub mod api;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
