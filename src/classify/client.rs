use super::prompt::build_messages;
use crate::config::ClassifierConfig;
use crate::llm::{CompletionBackend, CompletionError, LlmMessage};
use crate::models::{ClassificationStatus, Verdict};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};

/// Classifies listing price language through a completion backend.
///
/// `classify` never fails: exhausted retries and unusable replies both
/// resolve to `competitive` with confidence 0 and the failure as the reason.
#[derive(Clone)]
pub struct Classifier {
    backend: Arc<dyn CompletionBackend>,
    config: ClassifierConfig,
}

/// Why one backend attempt did not yield a verdict. Drives the retry policy.
#[derive(Debug, PartialEq, Eq)]
enum AttemptFailure {
    RateLimited(String),
    Transient(String),
    Permanent(String),
}

impl From<CompletionError> for AttemptFailure {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::RateLimited(detail) => AttemptFailure::RateLimited(detail),
            other => AttemptFailure::Transient(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVerdict {
    status: String,
    confidence_score: i64,
    reason: String,
}

impl Classifier {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: ClassifierConfig) -> Self {
        Self { backend, config }
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    pub async fn classify(&self, description: &str, price_text: &str) -> Verdict {
        let messages = build_messages(price_text, description);
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let failure = match self.attempt(&messages).await {
                Ok(verdict) => {
                    crate::metrics::classification(verdict.status.as_str(), false);
                    return verdict;
                }
                Err(failure) => failure,
            };

            let (wait, class) = match &failure {
                AttemptFailure::Permanent(detail) => {
                    error!(target = "fixedprice.classify", attempt, error = %detail, "classification_response_unusable");
                    return fallback(format!("Error parsing response: {detail}"));
                }
                AttemptFailure::RateLimited(_) => (policy.rate_limit_backoff(attempt), "rate_limited"),
                AttemptFailure::Transient(_) => (policy.transient_backoff(attempt), "transient"),
            };

            if attempt >= max_attempts {
                error!(target = "fixedprice.classify", attempts = attempt, ?failure, "classification_retries_exhausted");
                return match failure {
                    AttemptFailure::RateLimited(detail) => {
                        fallback(format!("Rate limit error: {detail}"))
                    }
                    AttemptFailure::Transient(detail) | AttemptFailure::Permanent(detail) => {
                        fallback(format!("API error: {detail}"))
                    }
                };
            }

            warn!(
                target = "fixedprice.classify",
                attempt,
                max_attempts,
                wait_secs = wait.as_secs_f64(),
                class,
                "classification_retry"
            );
            crate::metrics::classifier_retry(class);
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, messages: &[LlmMessage]) -> Result<Verdict, AttemptFailure> {
        let limit = self.config.retry.attempt_timeout;
        let reply = tokio::time::timeout(limit, self.backend.complete(messages))
            .await
            .map_err(|_| {
                AttemptFailure::Transient(format!("no reply within {}s", limit.as_secs()))
            })??;
        parse_verdict(&reply).map_err(AttemptFailure::Permanent)
    }
}

fn fallback(reason: String) -> Verdict {
    crate::metrics::classification(ClassificationStatus::Competitive.as_str(), true);
    Verdict {
        status: ClassificationStatus::Competitive,
        confidence_score: 0,
        reason,
    }
}

/// Validates a backend reply against the `{status, confidence_score, reason}`
/// contract. Extra fields and scores outside 0..=100 are rejected; a status
/// outside the taxonomy becomes `competitive`.
pub fn parse_verdict(reply: &str) -> Result<Verdict, String> {
    let cleaned = strip_markdown_fence(reply);
    if cleaned.is_empty() {
        return Err("empty response from completion backend".into());
    }
    let raw: RawVerdict = serde_json::from_str(&cleaned).map_err(|err| err.to_string())?;
    let confidence_score = u8::try_from(raw.confidence_score)
        .ok()
        .filter(|score| *score <= 100)
        .ok_or_else(|| format!("confidence_score {} outside 0..=100", raw.confidence_score))?;
    Ok(Verdict {
        status: ClassificationStatus::from_model_label(&raw.status),
        confidence_score,
        reason: raw.reason.trim().to_string(),
    })
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const EXPLICIT_REPLY: &str =
        r#"{"status":"explicit","confidence_score":95,"reason":"States a fixed price."}"#;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<String, CompletionError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _messages: &[LlmMessage]) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Http("script exhausted".into())))
        }
    }

    /// Answers the way a well-behaved model applies the taxonomy to the
    /// listing section of the prompt.
    struct RuleBackend;

    #[async_trait]
    impl CompletionBackend for RuleBackend {
        async fn complete(&self, messages: &[LlmMessage]) -> Result<String, CompletionError> {
            let user = &messages[1].content;
            let listing = user
                .split("LISTING TO ANALYZE:")
                .nth(1)
                .and_then(|rest| rest.split("CLASSIFICATION CATEGORIES:").next())
                .unwrap_or_default()
                .to_lowercase();
            let reply = if listing.contains("closing date") {
                r#"{"status":"competitive","confidence_score":92,"reason":"A closing date is set."}"#
            } else if listing.contains("fixed price") {
                EXPLICIT_REPLY
            } else {
                r#"{"status":"likely","confidence_score":55,"reason":"Mixed signals."}"#
            };
            Ok(reply.to_string())
        }
    }

    struct StalledBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for StalledBackend {
        async fn complete(&self, _messages: &[LlmMessage]) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(EXPLICIT_REPLY.to_string())
        }
    }

    fn classifier(backend: Arc<dyn CompletionBackend>) -> Classifier {
        Classifier::new(backend, ClassifierConfig::default())
    }

    fn rate_limited() -> Result<String, CompletionError> {
        Err(CompletionError::RateLimited("HTTP 429".into()))
    }

    fn server_error() -> Result<String, CompletionError> {
        Err(CompletionError::Http("HTTP 503 Service Unavailable".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_back_off_linearly_then_succeed() {
        let backend = ScriptedBackend::new(vec![
            rate_limited(),
            rate_limited(),
            Ok(EXPLICIT_REPLY.into()),
        ]);
        let started = Instant::now();
        let verdict = classifier(backend.clone()).classify("", "Fixed Price £250,000").await;

        assert_eq!(backend.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(5 + 10));
        assert_eq!(verdict.status, ClassificationStatus::Explicit);
        assert_eq!(verdict.confidence_score, 95);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limits_fall_back_to_competitive() {
        let backend = ScriptedBackend::new(vec![rate_limited(), rate_limited(), rate_limited()]);
        let started = Instant::now();
        let verdict = classifier(backend.clone()).classify("desc", "£1").await;

        assert_eq!(backend.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(verdict.status, ClassificationStatus::Competitive);
        assert_eq!(verdict.confidence_score, 0);
        assert!(verdict.reason.starts_with("Rate limit error:"), "{}", verdict.reason);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_exponentially() {
        let backend = ScriptedBackend::new(vec![server_error(), server_error(), server_error()]);
        let started = Instant::now();
        let verdict = classifier(backend.clone()).classify("desc", "£1").await;

        assert_eq!(backend.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4));
        assert_eq!(verdict.status, ClassificationStatus::Competitive);
        assert_eq!(verdict.confidence_score, 0);
        assert!(verdict.reason.starts_with("API error:"), "{}", verdict.reason);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_failures_use_the_backoff_for_their_class() {
        let backend = ScriptedBackend::new(vec![
            rate_limited(),
            Err(CompletionError::InvalidResponse("truncated envelope".into())),
            Ok(EXPLICIT_REPLY.into()),
        ]);
        let started = Instant::now();
        let verdict = classifier(backend.clone()).classify("", "Fixed Price £1").await;

        assert_eq!(backend.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(5 + 4));
        assert_eq!(verdict.status, ClassificationStatus::Explicit);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_not_retried() {
        for reply in [
            "not json at all",
            "",
            r#"{"status":"explicit","reason":"no score"}"#,
        ] {
            let backend = ScriptedBackend::new(vec![Ok(reply.into()), Ok(EXPLICIT_REPLY.into())]);
            let started = Instant::now();
            let verdict = classifier(backend.clone()).classify("desc", "£1").await;

            assert_eq!(backend.calls(), 1, "reply {reply:?}");
            assert_eq!(started.elapsed(), Duration::ZERO);
            assert_eq!(verdict.status, ClassificationStatus::Competitive);
            assert_eq!(verdict.confidence_score, 0);
            assert!(verdict.reason.starts_with("Error parsing response:"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempts_are_bounded() {
        let backend = Arc::new(StalledBackend {
            calls: AtomicUsize::new(0),
        });
        let config = ClassifierConfig {
            model_id: "gpt-4o".into(),
            retry: RetryPolicy {
                attempt_timeout: Duration::from_secs(10),
                ..RetryPolicy::default()
            },
        };
        let started = Instant::now();
        let verdict = Classifier::new(backend.clone(), config)
            .classify("desc", "£1")
            .await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10 + 2 + 10 + 4 + 10));
        assert_eq!(verdict.status, ClassificationStatus::Competitive);
        assert!(verdict.reason.starts_with("API error:"));
    }

    #[tokio::test]
    async fn fixed_price_text_is_explicit() {
        let verdict = classifier(Arc::new(RuleBackend))
            .classify("Bright two bedroom flat.", "Fixed Price £250,000")
            .await;
        assert_eq!(verdict.status, ClassificationStatus::Explicit);
    }

    #[tokio::test]
    async fn closing_date_is_competitive() {
        let verdict = classifier(Arc::new(RuleBackend))
            .classify(
                "Seller happy to discuss.",
                "Offers Over £200,000. Closing date set for 14 March.",
            )
            .await;
        assert_eq!(verdict.status, ClassificationStatus::Competitive);
    }

    #[test]
    fn status_labels_must_match_exactly() {
        for label in ["EXPLICIT", " Likely ", "fixed"] {
            let reply = format!(r#"{{"status":"{label}","confidence_score":90,"reason":"r"}}"#);
            let verdict = parse_verdict(&reply).unwrap();
            assert_eq!(verdict.status, ClassificationStatus::Competitive, "label {label:?}");
            assert_eq!(verdict.confidence_score, 90);
        }
    }

    #[test]
    fn out_of_range_scores_are_rejected() {
        for score in ["250", "101", "-5"] {
            let reply = format!(r#"{{"status":"explicit","confidence_score":{score},"reason":"r"}}"#);
            let err = parse_verdict(&reply).unwrap_err();
            assert!(err.contains("outside 0..=100"), "score {score}: {err}");
        }
        let edge = parse_verdict(r#"{"status":"likely","confidence_score":100,"reason":" ok "}"#)
            .unwrap();
        assert_eq!(edge.confidence_score, 100);
        assert_eq!(edge.reason, "ok");
    }

    #[test]
    fn extra_fields_are_rejected() {
        let reply = r#"{"status":"explicit","confidence_score":90,"reason":"r","extra":1}"#;
        assert!(parse_verdict(reply).unwrap_err().contains("extra"));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_score_falls_back_without_retry() {
        let reply = r#"{"status":"explicit","confidence_score":250,"reason":"sure"}"#;
        let backend = ScriptedBackend::new(vec![Ok(reply.into()), Ok(EXPLICIT_REPLY.into())]);
        let verdict = classifier(backend.clone()).classify("desc", "£1").await;

        assert_eq!(backend.calls(), 1);
        assert_eq!(verdict.status, ClassificationStatus::Competitive);
        assert_eq!(verdict.confidence_score, 0);
        assert!(verdict.reason.starts_with("Error parsing response:"));
    }

    #[test]
    fn fenced_replies_are_accepted() {
        let reply = "```json\n{\"status\":\"likely\",\"confidence_score\":70,\"reason\":\"Fixed price considered.\"}\n```";
        let verdict = parse_verdict(reply).unwrap();
        assert_eq!(verdict.status, ClassificationStatus::Likely);
        assert_eq!(verdict.confidence_score, 70);
    }
}
