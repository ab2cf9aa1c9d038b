use crate::config::{env_opt, env_or};
use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, State},
    http::{self, Request, StatusCode, header::HeaderValue, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Agent,
    Subscriber,
    Buyer,
}

impl Role {
    pub fn from_label(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "agent" => Some(Role::Agent),
            "subscriber" => Some(Role::Subscriber),
            "buyer" => Some(Role::Buyer),
            _ => None,
        }
    }
}

/// Caller identity established by the API key middleware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub role: Role,
    pub key_id: String,
}

impl AuthContext {
    pub fn has_role(&self, allowed: &[Role]) -> bool {
        allowed.contains(&self.role)
    }

    /// Admins manage every listing; agents only the ones they created.
    pub fn can_manage(&self, owner: Option<&str>) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Agent => owner == Some(self.user_id.as_str()),
            Role::Subscriber | Role::Buyer => false,
        }
    }

    pub fn can_filter_by_confidence(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Subscriber)
    }
}

/// Identity attached by [`identify_caller`], `None` for anonymous requests.
pub struct Caller(pub Option<AuthContext>);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(parts.extensions.get::<AuthContext>().cloned()))
    }
}

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env_opt("API_KEYS").unwrap_or_default();
        let rate_per_sec = Some(env_or("RATE_LIMIT_PER_SEC", 5.0))
            .filter(|value: &f64| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = Some(env_or("RATE_LIMIT_CAPACITY", 10.0))
            .filter(|value: &f64| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(&raw, TokenBuckets::new(rate_per_sec, capacity))
    }

    pub fn new(key_spec: &str, limiter: TokenBuckets) -> Self {
        Self {
            records: Arc::new(parse_keys(key_spec)),
            limiter: Arc::new(limiter),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).cloned()
    }
}

/// Attaches an [`AuthContext`] when a valid key is presented. Requests without
/// a key pass through anonymously; handlers decide whether that is enough.
/// A key that is present but unknown is rejected outright.
pub async fn identify_caller(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(next.run(request).await);
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response(
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.user_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            warn!(target = "fixedprice.api", user_id = %context.user_id, "rate_limited");
            let mut response = too_many_requests("rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Api-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
        existing_listing: None,
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
        existing_listing: None,
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

/// Parses `user_id:role:secret` entries separated by commas.
fn parse_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(3, ':').map(str::trim);
        let user_id = parts.next().filter(|s| !s.is_empty());
        let role = parts.next().and_then(Role::from_label);
        let secret = parts.next().filter(|s| !s.is_empty());
        match (user_id, role, secret) {
            (Some(user_id), Some(role), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    AuthContext {
                        user_id: user_id.to_string(),
                        role,
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "fixedprice.api",
                entry = idx + 1,
                "ignored malformed API_KEYS entry"
            ),
        }
    }

    if entries.is_empty() {
        error!(
            target = "fixedprice.api",
            "API_KEYS produced no valid keys; only anonymous reads are available"
        );
        return entries;
    }

    info!(
        target = "fixedprice.api",
        key_count = entries.len(),
        "loaded API keys"
    );
    entries
}

/// Per-user token buckets refilled continuously at `rate_per_sec`.
#[derive(Clone)]
pub struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl TokenBuckets {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

fn numeric_header(value: u64, fallback: &'static str) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(fallback))
}

#[derive(Debug, Clone)]
struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", numeric_header(self.capacity as u64, "0"));
        headers.insert("X-RateLimit-Remaining", numeric_header(remaining, "0"));
        headers.insert("X-RateLimit-Reset", numeric_header(reset, "0"));
    }
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(1.0) as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(http::header::RETRY_AFTER, numeric_header(retry, "1"));
        headers.insert("X-RateLimit-Limit", numeric_header(self.capacity as u64, "0"));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("X-RateLimit-Reset", numeric_header(reset, "0"));
    }
}
