//! HTTP admission middleware.
//!
//! Runs the inbound rate limit check before the request reaches business
//! logic, and makes the `OutboundThrottler` available to handlers as a
//! request extension.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::response::{apply_limit_headers, RateLimitExceeded};
use crate::admission::Admission;
use crate::config::IdentityConfig;
use crate::ratelimit::RequestIdentity;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// An authenticated user id, inserted into request extensions by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Gather what is known about the caller of `request`.
pub fn identify(request: &Request, config: &IdentityConfig) -> RequestIdentity {
    let headers = request.headers();

    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone())
        .or_else(|| {
            config
                .user_header
                .as_deref()
                .and_then(|name| header_str(headers, name))
                .map(str::to_string)
        });

    let api_key = header_str(headers, API_KEY_HEADER).map(str::to_string);

    let forwarded = if config.trust_forwarded_for {
        forwarded_for(headers)
    } else {
        None
    };
    let remote_addr = forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    });

    RequestIdentity {
        user_id,
        api_key,
        remote_addr,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The first hop of `X-Forwarded-For`, if it parses as an address.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    header_str(headers, FORWARDED_FOR_HEADER)?
        .split(',')
        .next()
        .and_then(|hop| hop.trim().parse().ok())
}

/// axum middleware: reject with 429 or pass the request on.
///
/// Install with `axum::middleware::from_fn_with_state(admission, admission_middleware)`.
pub async fn admission_middleware(
    State(admission): State<Arc<Admission>>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = identify(&request, admission.identity());
    let decision = admission.check(&identity, request.uri().path()).await;

    if !decision.allowed {
        return RateLimitExceeded::new(decision).into_response();
    }

    request.extensions_mut().insert(admission.throttler().clone());
    let mut response = next.run(request).await;

    if admission.emit_headers() {
        apply_limit_headers(response.headers_mut(), &decision.policy);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::{RateLimitBody, LIMIT_HOUR_HEADER, LIMIT_MINUTE_HEADER};
    use crate::ratelimit::{
        CategoryClassifier, InboundRateLimiter, MemoryCounterStore, PolicyTable, RateLimitPolicy, SystemClock,
    };
    use crate::upstream::OutboundThrottler;
    use axum::body::Body;
    use axum::http::header::RETRY_AFTER;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::{Extension, Router};
    use tower::ServiceExt;

    fn admission(policies: PolicyTable) -> Arc<Admission> {
        let store = Arc::new(MemoryCounterStore::new(Arc::new(SystemClock)));
        Arc::new(Admission::new(
            CategoryClassifier::default(),
            InboundRateLimiter::new(store, policies),
            OutboundThrottler::default(),
        ))
    }

    fn app(admission: Arc<Admission>) -> Router {
        Router::new()
            .route("/api/labs/{id}", get(|| async { "result" }))
            .route(
                "/api/terminology/lookup",
                get(|Extension(throttler): Extension<OutboundThrottler>| async move {
                    throttler
                        .execute("rxnorm", || async { "lookup" })
                        .await
                        .unwrap_or("throttled")
                }),
            )
            .layer(axum::middleware::from_fn_with_state(admission, admission_middleware))
    }

    fn lab_request(user: &str) -> Request {
        let mut request = HttpRequest::builder().uri("/api/labs/1").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(AuthenticatedUser(user.to_string()));
        request
    }

    #[tokio::test]
    async fn test_allowed_request_gets_limit_headers() {
        let app = app(admission(
            PolicyTable::new(RateLimitPolicy::default()).with_policy("lab", RateLimitPolicy::new(3, 100)),
        ));

        let response = app.oneshot(lab_request("42")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&LIMIT_MINUTE_HEADER], "3");
        assert_eq!(response.headers()[&LIMIT_HOUR_HEADER], "100");
    }

    #[tokio::test]
    async fn test_limit_headers_omitted_when_disabled() {
        let store = Arc::new(MemoryCounterStore::new(Arc::new(SystemClock)));
        let admission = Admission::new(
            CategoryClassifier::default(),
            InboundRateLimiter::new(store, PolicyTable::default()),
            OutboundThrottler::default(),
        )
        .with_emit_headers(false);

        let response = app(Arc::new(admission)).oneshot(lab_request("42")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&LIMIT_MINUTE_HEADER).is_none());
        assert!(response.headers().get(&LIMIT_HOUR_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_fourth_request_gets_429() {
        let app = app(admission(
            PolicyTable::new(RateLimitPolicy::default()).with_policy("lab", RateLimitPolicy::new(3, 100)),
        ));

        for _ in 0..3 {
            let response = app.clone().oneshot(lab_request("42")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(lab_request("42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "60");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: RateLimitBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "Rate limit exceeded");
        assert_eq!(body.retry_after, 60);

        // A different user is unaffected.
        let response = app.oneshot(lab_request("43")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_handlers_receive_throttler() {
        let app = app(admission(PolicyTable::default()));
        let request = HttpRequest::builder()
            .uri("/api/terminology/lookup")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"lookup");
    }

    #[test]
    fn test_identify_priority() {
        let mut request = HttpRequest::builder()
            .uri("/")
            .header(API_KEY_HEADER, "k-1")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 4000))));

        let identity = identify(&request, &IdentityConfig::default());
        assert_eq!(identity.client_id(), "apikey:k-1");

        request.extensions_mut().insert(AuthenticatedUser("7".to_string()));
        assert_eq!(identify(&request, &IdentityConfig::default()).client_id(), "user:7");
    }

    #[test]
    fn test_identify_connect_info() {
        let mut request = HttpRequest::builder()
            .uri("/")
            .header(FORWARDED_FOR_HEADER, "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 4000))));

        assert_eq!(
            identify(&request, &IdentityConfig::default()).client_id(),
            "ip:10.0.0.5"
        );

        let trusting = IdentityConfig {
            trust_forwarded_for: true,
            user_header: None,
        };
        assert_eq!(identify(&request, &trusting).client_id(), "ip:203.0.113.9");
    }

    #[test]
    fn test_identify_user_header() {
        let request = HttpRequest::builder()
            .uri("/")
            .header("x-authenticated-user", "alice")
            .header(API_KEY_HEADER, "k-1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(
            identify(&request, &IdentityConfig::default()).client_id(),
            "apikey:k-1"
        );

        let config = IdentityConfig {
            trust_forwarded_for: false,
            user_header: Some("X-Authenticated-User".to_string()),
        };
        assert_eq!(identify(&request, &config).client_id(), "user:alice");
    }

    #[test]
    fn test_identify_unknown() {
        let request = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(identify(&request, &IdentityConfig::default()).client_id(), "ip:unknown");
    }
}
