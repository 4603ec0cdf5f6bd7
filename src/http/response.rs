//! HTTP rendering of rate limit decisions.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::ratelimit::{Decision, RateLimitPolicy};

pub const LIMIT_MINUTE_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit-minute");
pub const LIMIT_HOUR_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit-hour");

/// JSON body returned with a 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

/// Write the per-minute and per-hour limits of `policy` into `headers`.
pub fn apply_limit_headers(headers: &mut HeaderMap, policy: &RateLimitPolicy) {
    headers.insert(LIMIT_MINUTE_HEADER, HeaderValue::from(policy.requests_per_minute));
    headers.insert(LIMIT_HOUR_HEADER, HeaderValue::from(policy.requests_per_hour));
}

/// A denied decision, rendered as `429 Too Many Requests`.
#[derive(Debug, Clone)]
pub struct RateLimitExceeded {
    decision: Decision,
}

impl RateLimitExceeded {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }

    pub fn body(&self) -> RateLimitBody {
        RateLimitBody {
            error: "Rate limit exceeded".to_string(),
            message: format!(
                "Too many {} requests. Limits are {} per minute and {} per hour. Please retry after {} seconds.",
                self.decision.category,
                self.decision.policy.requests_per_minute,
                self.decision.policy.requests_per_hour,
                self.decision.retry_after_secs
            ),
            retry_after: self.decision.retry_after_secs,
        }
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        apply_limit_headers(&mut headers, &self.decision.policy);
        headers.insert(RETRY_AFTER, HeaderValue::from(self.decision.retry_after_secs));

        (StatusCode::TOO_MANY_REQUESTS, headers, Json(self.body())).into_response()
    }
}
