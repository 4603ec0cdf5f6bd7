//! Gatekeeper - Admission Control for API Middleware
//!
//! This crate implements a two-layer throttling core. Inbound requests are
//! limited per client and per operation category within fixed minute and hour
//! windows, and outbound calls to external dependencies are bounded in
//! concurrency and paced to a minimum interval per upstream.

pub mod admission;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod upstream;

pub use admission::Admission;
