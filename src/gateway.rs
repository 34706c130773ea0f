// LLM gateway client: deterministic prompt construction plus a thin client
// for the external generation API (Gemini generateContent wire format).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Model-facing role labels. `Model` is the single canonical assistant role;
/// log creators are mapped onto it before anything reaches the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

/// One role/text pair of formatted history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

/// External model call failure. Distinct from the not-found/validation
/// errors elsewhere so callers can tell a flaky gateway from bad input.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// The single seam to the external model. One synchronous request per call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_text: &str)
        -> Result<String, GatewayError>;
}

// ── Prompt construction ──────────────────────────────────────────────

/// Render an army descriptor for the prompt: plain strings verbatim,
/// structured values as compact JSON.
fn render_army(army: &Value) -> String {
    match army {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the system prompt from the rules text, both army descriptors, and
/// the formatted history. Pure: identical inputs produce identical output.
pub fn build_prompt(
    rules_text: &str,
    player_army: &Value,
    opponent_army: Option<&Value>,
    history: &[ChatMessage],
) -> String {
    let instructions = "***** Your Instructions *****\n\
        You are the AI opponent in a practice game of Warhammer 40K. You are an expert \
        on the latest rules for every faction and detachment, and you address your \
        opponent as a seasoned commander of the 41st millennium."
        .to_string();

    let opponent = opponent_army
        .map(render_army)
        .unwrap_or_else(|| "an undeclared force".to_string());
    let assignment = format!(
        "Your opponent is fielding {}. You are fielding {}.",
        render_army(player_army),
        opponent
    );

    let history_block = if history.is_empty() {
        "The battle has not started yet.".to_string()
    } else {
        let mut block = String::from("Here is the battle log so far:\n");
        for message in history {
            block.push_str(&format!("{}: {}\n", message.role.as_str(), message.text));
        }
        block.trim_end().to_string()
    };

    let rules = format!("Here are the rules for the game:\n{rules_text}");

    [instructions, assignment, history_block, rules].join("\n\n")
}

// ── Gemini client ────────────────────────────────────────────────────

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Request timeout. A timed-out call fails the turn before any log mutation.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Delay before the single retry on a connection-level failure.
const RETRY_DELAY_MS: u64 = 250;

/// Client for the Gemini generateContent API.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self::with_timeout(base_url, model, api_key, REQUEST_TIMEOUT_SECS)
    }

    /// Create a client with a custom timeout (for testing).
    pub fn with_timeout(base_url: &str, model: &str, api_key: &str, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Create a client from environment variables.
    ///
    /// Uses `GEMINI_API_KEY`, `GEMINI_BASE_URL`, and `GEMINI_MODEL`,
    /// falling back to defaults for the latter two.
    pub fn from_env() -> Self {
        let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("GEMINI_API_KEY is not set; gateway calls will fail");
        }
        let base_url = std::env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string());
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        Self::new(&base_url, &model, &api_key)
    }

    async fn post(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, GatewayError> {
        let request = GenerateContentRequest {
            system_instruction: Instruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
            contents: vec![Content {
                role: Some(ChatRole::User.as_str().to_string()),
                parts: vec![Part {
                    text: user_text.to_string(),
                }],
            }],
        };

        crate::metrics::GATEWAY_REQUESTS_TOTAL.inc();

        let response = match self.post(&request).await {
            Ok(r) => r,
            // One retry for connection-level failures only; HTTP errors and
            // timeouts are surfaced immediately.
            Err(e) if e.is_connect() => {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                self.post(&request).await.map_err(|e| {
                    crate::metrics::GATEWAY_FAILURES_TOTAL.inc();
                    GatewayError::RequestFailed(e.to_string())
                })?
            }
            Err(e) => {
                crate::metrics::GATEWAY_FAILURES_TOTAL.inc();
                return Err(GatewayError::RequestFailed(e.to_string()));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            crate::metrics::GATEWAY_FAILURES_TOTAL.inc();
            return Err(GatewayError::RequestFailed(format!("{status}: {body}")));
        }

        let api_response: GenerateContentResponse = response.json().await.map_err(|e| {
            crate::metrics::GATEWAY_FAILURES_TOTAL.inc();
            GatewayError::InvalidResponse(e.to_string())
        })?;

        extract_text(api_response).inspect_err(|_| {
            crate::metrics::GATEWAY_FAILURES_TOTAL.inc();
        })
    }
}

fn extract_text(response: GenerateContentResponse) -> Result<String, GatewayError> {
    let candidate = response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::InvalidResponse("no candidates in response".to_string()))?;

    let parts = candidate
        .content
        .ok_or_else(|| GatewayError::InvalidResponse("candidate has no content".to_string()))?
        .parts;

    if parts.is_empty() {
        return Err(GatewayError::InvalidResponse(
            "candidate content has no parts".to_string(),
        ));
    }

    Ok(parts.into_iter().map(|p| p.text).collect())
}

// ── Wire format ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    system_instruction: Instruction,
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Instruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}
