use super::models::Usage;
use super::ChatTurn;
use crate::config::Config;
use crate::error::OracleError;
use crate::util::head_chars;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Response from the model including content and usage stats
#[derive(Debug)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    #[allow(dead_code)]
    pub model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

/// Extract a retry-after hint ("retry after 12 seconds") from an error body
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    let after_retry = &text_lower[pos..];
    for word in after_retry.split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word
            .trim_matches(|c: char| !c.is_numeric())
            .parse::<u64>()
        {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl ChatClient {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.oracle.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: config.oracle.api_url.clone(),
            api_key: config.api_key(),
            model: config.oracle.model.clone(),
            max_tokens: config.oracle.max_tokens,
        })
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn default_model(&self) -> &str {
        &self.model
    }

    /// Send `messages` and return the first choice. Rate limits are retried
    /// with exponential backoff.
    pub async fn chat(
        &self,
        messages: &[ChatTurn],
        model: Option<&str>,
        temperature: f32,
        json_mode: bool,
    ) -> Result<LlmResponse, OracleError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            OracleError::Unavailable(
                "No API key configured. Set VULCHAIN_API_KEY or OPENAI_API_KEY.".to_string(),
            )
        })?;

        let request = ChatRequest {
            model: model.unwrap_or(&self.model),
            messages,
            max_tokens: self.max_tokens,
            temperature,
            stream: false,
            response_format: json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&request)
                .send()
                .await
                .map_err(|e| OracleError::Unavailable(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| OracleError::Unavailable(e.to_string()))?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    OracleError::Decode(format!("{}\n{}", e, head_chars(&text, 500)))
                })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                return Ok(LlmResponse {
                    content,
                    usage: parsed.usage,
                    model: parsed.model.unwrap_or_default(),
                });
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or_else(|| {
                    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000
                });
                warn!(
                    "Rate limited. Retrying in {}s (attempt {}/{})",
                    retry_after, retry_count, MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "Invalid API key.".to_string(),
                429 => format!(
                    "Rate limited after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "Server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, head_chars(&text, 200)),
            };
            return Err(OracleError::Http {
                status: status.as_u16(),
                message,
            });
        }
    }
}
