//! Inbound rate limiting logic and state management.

mod category;
mod clock;
mod counter;
mod identity;
mod limiter;
mod rules;

pub use category::{Category, CategoryClassifier, CategoryRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, CounterKey, CounterStore, Granularity, MemoryCounterStore, StoreError};
pub use identity::{RequestIdentity, UNKNOWN_CLIENT};
pub use limiter::{Decision, FailurePolicy, InboundRateLimiter, RETRY_AFTER_SECS};
pub use rules::{PolicyTable, RateLimitPolicy};
