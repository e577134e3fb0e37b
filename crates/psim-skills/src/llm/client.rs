//! OpenAI-compatible chat-completion client with bounded retries.

use crate::error::LlmError;
use async_trait::async_trait;
use psim_core::LlmSettings;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChatParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
    /// Populated by reasoning models instead of (or in addition to) `content`.
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl ChatResponse {
    /// Answer text of the first choice: `reasoning_content` when non-empty, else `content`.
    /// `None` when the response has no choices.
    pub fn answer(&self) -> Option<&str> {
        let message = &self.choices.first()?.message;
        let reasoning = message.reasoning_content.as_deref().filter(|s| !s.is_empty());
        Some(reasoning.or(message.content.as_deref()).unwrap_or(""))
    }

    /// Plain `content` of the first choice, ignoring reasoning output.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_deref().unwrap_or(""))
    }

    pub fn from_text(content: &str) -> Self {
        Self {
            choices: vec![ChatChoice {
                message: ChoiceMessage {
                    content: Some(content.to_string()),
                    reasoning_content: None,
                },
            }],
        }
    }
}

/// One chat-completion round trip. Implementations own retries and timeouts.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, model: &str, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatResponse, LlmError>;
}

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random delay added after capping.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_jitter: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// min(initial * multiplier^attempt, max) + uniform(0, max_jitter).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::random::<f64>() * self.max_jitter.as_secs_f64();
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    pub fn should_retry(&self, attempt: u32, err: &LlmError) -> bool {
        attempt + 1 < self.max_attempts && err.is_retryable()
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(attempt, &err) => {
                    let delay = self.calculate_delay(attempt);
                    tracing::warn!(
                        target: "psim::llm",
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "LLM request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// reqwest client with the per-request timeout applied. A builder failure is returned
/// instead of falling back to a client without a timeout.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder().timeout(timeout).build().map_err(|err| {
        tracing::error!(target: "psim::llm", error = %err, timeout_ms = timeout.as_millis() as u64, "HTTP client build failed");
        LlmError::from(err)
    })
}

/// Live chat-completion client: bearer auth, per-request timeout, retry policy.
pub struct ModelRouter {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl ModelRouter {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            http: http_client(timeout)?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs_f64(settings.timeout_secs.max(0.1));
        let router = Self::new(&settings.base_url, settings.api_key.clone(), timeout)?;
        let retry = router.retry.clone().with_max_attempts(settings.max_attempts);
        Ok(router.with_retry_policy(retry))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send_once(&self, body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
        let mut request = self.http.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }
        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChatClient for ModelRouter {
    async fn chat(&self, model: &str, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatResponse, LlmError> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        tracing::debug!(
            target: "psim::llm",
            model,
            messages = messages.len(),
            max_tokens = params.max_tokens,
            "Chat completion request"
        );
        self.retry.run(|_| self.send_once(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));

        let jittered = RetryPolicy::default().calculate_delay(0);
        assert!(jittered >= Duration::from_secs(1) && jittered <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retries_server_errors_up_to_the_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = instant_policy()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Status { status: 502, body: String::new() }) }
            })
            .await;
        assert!(matches!(result, Err(LlmError::Status { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = instant_policy()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Status { status: 401, body: "bad key".into() }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_a_timeout() {
        let result = instant_policy()
            .run(|attempt| async move {
                if attempt == 0 {
                    Err(LlmError::Timeout)
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn answer_prefers_reasoning_content() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": "plain", "reasoning_content": "{\"a\":1}"}}]
        });
        let resp: ChatResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.answer(), Some("{\"a\":1}"));
        assert_eq!(resp.content(), Some("plain"));

        let resp: ChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "only", "reasoning_content": ""}}]
        }))
        .unwrap();
        assert_eq!(resp.answer(), Some("only"));

        let empty: ChatResponse = serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert_eq!(empty.answer(), None);
    }

    #[test]
    fn endpoint_and_key_handling() {
        let router = ModelRouter::new("https://api.example.com/v1/", Some("  ".into()), Duration::from_secs(1)).unwrap();
        assert_eq!(router.endpoint, "https://api.example.com/v1/chat/completions");
        assert!(!router.has_api_key());
    }

    #[test]
    fn settings_build_a_timed_client_with_configured_attempts() {
        let mut settings = psim_core::CoreConfig::default_values().unwrap().llm;
        settings.max_attempts = 5;
        settings.api_key = Some("sk-test".into());
        let router = ModelRouter::from_settings(&settings).unwrap();
        assert_eq!(router.retry.max_attempts, 5);
        assert!(router.has_api_key());
        assert!(http_client(Duration::from_millis(250)).is_ok());
    }
}
