use super::service::RateLimiter;
use super::types::{client_key, Decision, Policy};
use crate::error::ApiError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use chrono::SecondsFormat;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Rate limiting middleware state: one limiter, one policy
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    policy: Arc<Policy>,
    trust_proxy: bool,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, policy: Policy, trust_proxy: bool) -> Self {
        Self {
            limiter,
            policy: Arc::new(policy),
            trust_proxy,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Throttle every route currently registered on `router`
    pub fn apply<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(from_fn_with_state(self, rate_limit_middleware))
    }

    /// Client key for a request: peer address and forwarded-for header
    pub fn client_key(&self, request: &Request) -> String {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let forwarded_for = request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok());

        client_key(peer, forwarded_for, self.trust_proxy)
    }
}

/// Axum middleware function for rate limiting
pub async fn rate_limit_middleware(
    State(layer): State<RateLimitMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let key = layer.client_key(&request);
    let decision = layer.limiter.check(&key, &layer.policy).await;

    if !decision.admitted {
        warn!(
            policy = layer.policy.name(),
            client = %key,
            count = decision.count,
            "Rate limit exceeded"
        );
        return create_rate_limit_response(&layer.policy, &decision);
    }

    debug!(
        policy = layer.policy.name(),
        remaining = decision.remaining,
        "Rate limit check passed"
    );

    let mut response = next.run(request).await;
    add_rate_limit_headers(response.headers_mut(), &decision);
    response
}

/// Create a 429 Too Many Requests response with rate limit headers
pub fn create_rate_limit_response(policy: &Policy, decision: &Decision) -> Response {
    let mut response = ApiError::TooManyRequests(policy.message().to_string()).into_response();

    let headers = response.headers_mut();
    add_rate_limit_headers(headers, decision);
    headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from(policy.retry_after_secs()),
    );

    response
}

/// Attach `X-RateLimit-*` headers
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));

    let reset = decision
        .reset_at
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert(X_RATELIMIT_RESET, value);
    }
}
