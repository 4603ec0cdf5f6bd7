//! Outbound throttling of calls to external dependencies.

mod registry;
mod throttler;

pub use registry::{GateSnapshot, ThrottlePermit, UpstreamGate, UpstreamLimits, UpstreamTable, UpstreamThrottleRegistry};
pub use throttler::{OutboundThrottler, ThrottleError};
