//! Hosted chat-model client over an OpenAI-compatible HTTP API.

use std::time::Duration;

use aidgent_core::config::LlmConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 4_000;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Shared HTTP plumbing for the chat and embedding endpoints.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    max_retries: u32,
}

impl HttpApi {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&base_url)
            .with_context(|| format!("invalid model endpoint `{base_url}`"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("model endpoint must use http or https, got `{}`", parsed.scheme());
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client, base_url, api_key, max_retries })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::new(
            &config.effective_base_url(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// POSTs `body` to `path`, retrying transport failures, 5xx and 429 with
    /// capped exponential backoff.
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut last_error = anyhow!("no request attempted");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_for(attempt - 1);
                warn!(
                    event_name = "agent.llm.retry",
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "retrying model request"
                );
                tokio::time::sleep(backoff).await;
            }

            let response =
                match self.client.post(&url).headers(self.headers()).json(body).send().await {
                    Ok(response) => response,
                    Err(error) if is_retryable_error(&error) => {
                        last_error = anyhow!(error).context(format!("request to `{url}` failed"));
                        continue;
                    }
                    Err(error) => {
                        return Err(anyhow!(error).context(format!("request to `{url}` failed")))
                    }
                };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<R>()
                    .await
                    .with_context(|| format!("unexpected response body from `{url}`"));
            }

            let body = response.text().await.unwrap_or_default();
            let error = anyhow!("`{url}` returned {status}: {}", truncate(&body, 300));
            if is_retryable_status(status) {
                last_error = error;
                continue;
            }
            return Err(error);
        }

        Err(last_error.context(format!("giving up after {} attempts", self.max_retries + 1)))
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() {
        return true;
    }
    error.status().is_some_and(is_retryable_status)
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

fn backoff_for(attempt: u32) -> Duration {
    let delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// `/chat/completions` client with a system and a user message per call.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    api: HttpApi,
    model: String,
    temperature: f32,
}

impl OpenAiCompatibleClient {
    pub fn new(api: HttpApi, model: impl Into<String>, temperature: f32) -> Self {
        Self { api, model: model.into(), temperature }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self::new(HttpApi::from_config(config)?, config.model.clone(), config.temperature))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
        };

        debug!(event_name = "agent.llm.request", model = %self.model, "calling chat model");
        let response: ChatCompletionResponse =
            self.api.post_json("chat/completions", &request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("model returned no choices"))?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{backoff_for, is_retryable_status, HttpApi};

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(250));
        assert_eq!(backoff_for(2), Duration::from_millis(1_000));
        assert_eq!(backoff_for(10), Duration::from_millis(4_000));
    }

    #[test]
    fn only_server_errors_and_rate_limits_retry() {
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn endpoint_must_be_http() {
        assert!(HttpApi::new("ftp://models.local", None, Duration::from_secs(1), 0).is_err());
        assert!(HttpApi::new("http://localhost:11434/v1/", None, Duration::from_secs(1), 0).is_ok());
    }
}
