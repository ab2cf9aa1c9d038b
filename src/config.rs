use std::{env, str::FromStr, time::Duration};

/// Reads `key` from the environment, falling back to `default` when the value
/// is missing or does not parse.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub body_limit: usize,
    pub redis_url: Option<String>,
    pub idempotency_ttl_secs: u64,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_or("PORT", 8000),
            body_limit: Some(env_or("REQUEST_MAX_BYTES", 256 * 1024))
                .filter(|v: &usize| *v > 0)
                .unwrap_or(256 * 1024),
            redis_url: env_opt("REDIS_URL"),
            idempotency_ttl_secs: env_or("IDEMPOTENCY_TTL_SECS", 3600),
            metrics_key: env_opt("METRICS_KEY"),
            openapi_key: env_opt("OPENAPI_KEY"),
        }
    }
}

/// Attempt budget and backoff bases for the classification client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_delay: Duration,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after a rate-limit signal on `attempt` (1-based): `base * attempt`.
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        self.rate_limit_delay * attempt
    }

    /// Wait after any other transient failure on `attempt` (1-based):
    /// `base * 2^(attempt - 1)`.
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_delay * 2u32.pow(exponent)
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_id: String,
    pub retry: RetryPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_id: "gpt-4o".into(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            model_id: env_opt("CLASSIFIER_MODEL_ID").unwrap_or_else(|| "gpt-4o".into()),
            retry: RetryPolicy {
                max_attempts: Some(env_or("CLASSIFIER_MAX_ATTEMPTS", defaults.max_attempts))
                    .filter(|v| *v >= 1)
                    .unwrap_or(defaults.max_attempts),
                rate_limit_delay: Duration::from_secs(env_or(
                    "CLASSIFIER_RATE_LIMIT_DELAY_SECS",
                    defaults.rate_limit_delay.as_secs(),
                )),
                retry_delay: Duration::from_secs(env_or(
                    "CLASSIFIER_RETRY_DELAY_SECS",
                    defaults.retry_delay.as_secs(),
                )),
                attempt_timeout: Duration::from_secs(
                    Some(env_or(
                        "CLASSIFIER_ATTEMPT_TIMEOUT_SECS",
                        defaults.attempt_timeout.as_secs(),
                    ))
                    .filter(|v| *v > 0)
                    .unwrap_or(defaults.attempt_timeout.as_secs()),
                ),
            },
        }
    }
}
