//! The generation boundary: chat messages in, completion text out.
//!
//! Orchestration code only sees [`GenerationClient`]; the OpenRouter-backed
//! implementation below handles transport, retries, and the quirks of
//! error-in-200 responses.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::util::truncate;

pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff
/// Whole-file generations are slow; allow several minutes per request.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Anything that can turn a transcript into a completion.
///
/// Implementations are shared across concurrent migration tasks, so they
/// must be stateless apart from connection pooling.
pub trait GenerationClient: Send + Sync {
    fn generate(&self, messages: &[Message]) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenRouter error payload, also seen inside HTTP 200 responses.
#[derive(Deserialize)]
struct OpenRouterError {
    error: OpenRouterErrorBody,
}

#[derive(Deserialize)]
struct OpenRouterErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

/// OpenRouter-backed [`GenerationClient`].
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenRouterClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            anyhow!(
                "No API key found. Set {} or add \"api_key\" to {}.",
                Config::API_KEY_ENV,
                Config::location()
            )
        })?;
        Ok(OpenRouterClient {
            http: create_http_client(REQUEST_TIMEOUT_SECS)?,
            api_key,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_with_retry(&self, request_body: &ChatRequest<'_>) -> Result<String> {
        let mut last_error = String::new();
        let mut retry_count = 0;

        while retry_count <= MAX_RETRIES {
            let response = match self
                .http
                .post(&self.base_url)
                .header("Content-Type", "application/json")
                .header("X-Title", "ai-migrate")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(request_body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    last_error = err.to_string();
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                        continue;
                    }
                    return Err(map_timeout_error(err));
                }
            };

            let status = response.status();
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    last_error = err.to_string();
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                        continue;
                    }
                    return Err(map_timeout_error(err));
                }
            };

            if status.is_success() {
                // OpenRouter sometimes returns errors with 200 status
                // (upstream provider issues).
                if let Ok(err_resp) = serde_json::from_str::<OpenRouterError>(&text) {
                    let is_retryable = err_resp
                        .error
                        .code
                        .map(|c| c >= 500 || c == 429)
                        .unwrap_or(true);

                    if is_retryable && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                        continue;
                    }

                    return Err(anyhow!(
                        "OpenRouter error: {}",
                        truncate(&err_resp.error.message, MAX_ERROR_CONTENT_LEN)
                    ));
                }

                return Ok(text);
            }

            last_error = text.clone();

            // Rate limit - retry with backoff
            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after =
                    parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count));
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            // Server errors - retry with backoff
            if status.is_server_error() && retry_count < MAX_RETRIES {
                retry_count += 1;
                tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                continue;
            }

            // Non-retryable error or max retries exceeded
            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Check your stored credentials.".to_string(),
                429 => format!(
                    "Rate limited by OpenRouter after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "OpenRouter server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, truncate(&text, MAX_ERROR_CONTENT_LEN)),
            };
            return Err(anyhow!("{}", error_msg));
        }

        Err(anyhow!("{}", last_error))
    }
}

impl GenerationClient for OpenRouterClient {
    async fn generate(&self, messages: &[Message]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };
        let text = self.send_with_retry(&request).await?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).context("Unexpected response shape from OpenRouter")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| anyhow!("Model returned an empty completion"))
    }
}

fn parse_retry_after(text: &str) -> Option<u64> {
    // Look for patterns like "retry after X seconds" or "retry in Xs"
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    let secs = ms / 1000;
    if secs == 0 {
        1
    } else {
        secs
    }
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn map_timeout_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow!("Request timed out after {REQUEST_TIMEOUT_SECS}s")
    } else {
        anyhow!("Network error: {err}")
    }
}

fn create_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to create HTTP client")
}

/// Scripted client for tests: pops canned responses in order and records
/// call concurrency so scheduling bounds can be asserted.
#[cfg(test)]
pub struct FakeGenerationClient {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    calls: std::sync::atomic::AtomicUsize,
    in_flight: std::sync::atomic::AtomicUsize,
    max_in_flight: std::sync::atomic::AtomicUsize,
    delay: Option<Duration>,
}

#[cfg(test)]
impl FakeGenerationClient {
    pub fn new(responses: Vec<&str>) -> Self {
        FakeGenerationClient {
            responses: std::sync::Mutex::new(
                responses.into_iter().map(str::to_string).collect(),
            ),
            calls: std::sync::atomic::AtomicUsize::new(0),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            max_in_flight: std::sync::atomic::AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl GenerationClient for FakeGenerationClient {
    async fn generate(&self, _messages: &[Message]) -> Result<String> {
        use std::sync::atomic::Ordering;

        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("fake client lock poisoned"))?
            .pop_front();
        next.ok_or_else(|| anyhow!("fake client has no responses left"))
    }
}
