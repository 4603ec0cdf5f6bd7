//! HTTP surface: admission middleware, 429 rendering and the check server.

mod middleware;
mod response;
mod server;

pub use middleware::{admission_middleware, identify, AuthenticatedUser, API_KEY_HEADER};
pub use response::{apply_limit_headers, RateLimitBody, RateLimitExceeded, LIMIT_HOUR_HEADER, LIMIT_MINUTE_HEADER};
pub use server::HttpServer;
