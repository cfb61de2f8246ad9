//! Chat-completions client for thread analysis.
//!
//! Sends the canonical thread rendering to an OpenAI-compatible
//! `/chat/completions` endpoint and parses the JSON insight (sentiment,
//! topics, gaps, summary) out of the assistant reply, tolerating code
//! fences and surrounding prose.

use insights_types::Sentiment;
use rand::Rng;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::config::Config;

const SYSTEM_PROMPT: &str = "You analyze customer support conversation threads from Twitter/X.\n\
Given a full thread (messages in order), output a JSON object with:\n\
- \"sentiment\": one of \"positive\", \"negative\", \"neutral\", or \"mixed\"\n\
- \"topics\": list of short topic strings (e.g. [\"billing\", \"delay\", \"refund\"])\n\
- \"gaps\": list of service or communication gaps (e.g. \"slow response\", \"no ETA\")\n\
- \"summary\": one short sentence summarizing the conversation\n\
\n\
Output only valid JSON, no markdown or extra text.";

const MAX_ATTEMPTS: u32 = 4;
const BASE_DELAY_MS: u64 = 500;

// =====================================================
// Error Type
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Connection-level failure; retried.
    Transport,
    /// Request timeout; retried.
    Timeout,
    /// Non-2xx response; retried only for 408/429/5xx.
    Http,
    /// Response arrived but no JSON insight could be extracted.
    Protocol,
    /// Response carried no assistant content.
    NoContent,
    /// No API key configured.
    NotConfigured,
}

/// LLM API error with status code information.
#[derive(Debug, Clone)]
pub struct LlmError {
    pub message: String,
    pub status_code: Option<u16>,
    pub kind: LlmErrorKind,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        LlmError {
            message: message.into(),
            status_code: None,
            kind,
        }
    }

    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        LlmError {
            message: message.into(),
            status_code: Some(status_code),
            kind: LlmErrorKind::Http,
        }
    }

    /// Short class tag used in `skipped_reason = "llm_error:<class>"`.
    pub fn class(&self) -> String {
        match self.kind {
            LlmErrorKind::Transport => "transport".to_string(),
            LlmErrorKind::Timeout => "timeout".to_string(),
            LlmErrorKind::Http => match self.status_code {
                Some(code) => format!("http_{}", code),
                None => "http".to_string(),
            },
            LlmErrorKind::Protocol => "protocol".to_string(),
            LlmErrorKind::NoContent => "no_content".to_string(),
            LlmErrorKind::NotConfigured => "not_configured".to_string(),
        }
    }

    fn is_retryable(&self) -> bool {
        match self.kind {
            LlmErrorKind::Transport | LlmErrorKind::Timeout => true,
            LlmErrorKind::Http => matches!(self.status_code, Some(408) | Some(429))
                || self.status_code.map(|c| c >= 500).unwrap_or(false),
            _ => false,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.status_code {
            write!(f, "[HTTP {}] {}", code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LlmError {}

// =====================================================
// Analysis Result
// =====================================================

/// Parsed outcome of one successful analysis call.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub llm_output: Value,
    pub sentiment: Sentiment,
    pub topics: Vec<String>,
    pub gaps: Vec<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_estimate: f64,
}

// =====================================================
// Wire Types
// =====================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
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

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

// =====================================================
// Client
// =====================================================

pub struct LlmClient {
    client: Client,
    endpoint: String,
    auth_headers: header::HeaderMap,
    model: String,
    prompt_price_per_1k: f64,
    completion_price_per_1k: f64,
    configured: bool,
}

impl LlmClient {
    pub fn new(config: &Config) -> Result<Self, String> {
        let mut auth_headers = header::HeaderMap::new();
        auth_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let configured = !config.llm_api_key.is_empty();
        if configured {
            let auth_value =
                header::HeaderValue::from_str(&format!("Bearer {}", config.llm_api_key))
                    .map_err(|e| format!("Invalid API key format: {}", e))?;
            auth_headers.insert(header::AUTHORIZATION, auth_value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_seconds))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.llm_base_url.trim_end_matches('/')
            ),
            auth_headers,
            model: config.llm_model.clone(),
            prompt_price_per_1k: config.llm_prompt_price_per_1k,
            completion_price_per_1k: config.llm_completion_price_per_1k,
            configured,
        })
    }

    /// Analyze one canonical thread rendering. Retries transient failures
    /// with exponential backoff; protocol failures and non-transient HTTP
    /// errors fail immediately.
    pub async fn analyze(&self, thread_text: &str) -> Result<Analysis, LlmError> {
        if !self.configured {
            return Err(LlmError::new(
                LlmErrorKind::NotConfigured,
                "LLM_API_KEY not set",
            ));
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Conversation thread:\n\n{}", thread_text),
                },
            ],
            stream: false,
            temperature: 0.0,
        };

        let mut last_error: Option<LlmError> = None;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(attempt, retry_after.take());
                log::warn!(
                    "[LLM] retry attempt {}/{} after {}ms ({})",
                    attempt,
                    MAX_ATTEMPTS - 1,
                    delay.as_millis(),
                    last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&self.endpoint)
                .headers(self.auth_headers.clone())
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let kind = if e.is_timeout() {
                        LlmErrorKind::Timeout
                    } else {
                        LlmErrorKind::Transport
                    };
                    last_error = Some(LlmError::new(kind, format!("request failed: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                let body = response.text().await.unwrap_or_default();
                let err = LlmError::with_status(
                    format!("API error: {}", truncate(&body, 200)),
                    status.as_u16(),
                );
                if err.is_retryable() {
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }

            let data: ChatResponse = response.json().await.map_err(|e| {
                LlmError::new(LlmErrorKind::Protocol, format!("invalid response body: {}", e))
            })?;
            return self.parse_analysis(data);
        }

        Err(last_error
            .unwrap_or_else(|| LlmError::new(LlmErrorKind::Transport, "max retries exceeded")))
    }

    fn parse_analysis(&self, data: ChatResponse) -> Result<Analysis, LlmError> {
        let content = data
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("");
        if content.trim().is_empty() {
            return Err(LlmError::new(
                LlmErrorKind::NoContent,
                "response carried no content",
            ));
        }

        let llm_output = extract_json(content).ok_or_else(|| {
            LlmError::new(
                LlmErrorKind::Protocol,
                format!("no JSON object in response: {}", truncate(content, 120)),
            )
        })?;

        let sentiment = llm_output
            .get("sentiment")
            .and_then(Value::as_str)
            .map(Sentiment::from_raw)
            .unwrap_or(Sentiment::Unknown);
        let topics = string_array(llm_output.get("topics"));
        let gaps = string_array(llm_output.get("gaps"));

        let usage = data.usage.unwrap_or_default();
        let cost_estimate = usage.prompt_tokens as f64 / 1000.0 * self.prompt_price_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.completion_price_per_1k;

        Ok(Analysis {
            llm_output,
            sentiment,
            topics,
            gaps,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_estimate,
        })
    }
}

/// Exponential backoff with +/-20% jitter; a Retry-After header wins.
fn backoff_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_secs(secs.min(120));
    }
    let base = BASE_DELAY_MS * (1u64 << (attempt - 1));
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Extract the first JSON object from assistant content, tolerating code
/// fences and surrounding prose.
fn extract_json(content: &str) -> Option<Value> {
    let mut raw = content.trim();
    if let Some(stripped) = raw.strip_prefix("```") {
        let stripped = stripped.strip_prefix("json").unwrap_or(stripped);
        raw = stripped.split("```").next().unwrap_or(stripped).trim();
    }
    if let Ok(v @ Value::Object(_)) = serde_json::from_str(raw) {
        return Some(v);
    }
    let region = balanced_object(raw)?;
    serde_json::from_str(region).ok().filter(Value::is_object)
}

/// First balanced `{...}` region, string-literal aware.
fn balanced_object(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn string_array(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// =====================================================
// Backend Selection
// =====================================================

/// Unified analyzer backend: the real HTTP client, or a scripted mock in
/// tests.
pub enum LlmBackend {
    Http(LlmClient),
    #[cfg(test)]
    Mock(MockLlm),
}

impl LlmBackend {
    pub async fn analyze(&self, thread_text: &str) -> Result<Analysis, LlmError> {
        match self {
            LlmBackend::Http(client) => client.analyze(thread_text).await,
            #[cfg(test)]
            LlmBackend::Mock(mock) => mock.analyze(thread_text).await,
        }
    }
}

/// Scripted LLM for tests: pops pre-configured results and counts calls.
#[cfg(test)]
pub struct MockLlm {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Analysis, LlmError>>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockLlm {
    pub fn new(responses: Vec<Result<Analysis, LlmError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub async fn analyze(&self, _thread_text: &str) -> Result<Analysis, LlmError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::new(LlmErrorKind::Transport, "mock exhausted")))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
pub fn mock_analysis(sentiment: Sentiment, topics: &[&str], gaps: &[&str]) -> Analysis {
    Analysis {
        llm_output: serde_json::json!({
            "sentiment": sentiment.as_str(),
            "topics": topics,
            "gaps": gaps,
            "summary": "mock summary",
        }),
        sentiment,
        topics: topics.iter().map(|s| s.to_string()).collect(),
        gaps: gaps.iter().map(|s| s.to_string()).collect(),
        prompt_tokens: 100,
        completion_tokens: 20,
        cost_estimate: 0.0,
    }
}
