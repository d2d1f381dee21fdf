//! Client for the Gemini `generativelanguage` REST API.
//!
//! The batch pipeline only depends on the [`Generator`] trait, so runs can be
//! driven by any backend; [`GeminiClient`] is the production implementation.

use crate::config::DEFAULT_MODEL;
use crate::error::{Error, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Production endpoint of the Gemini API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Models offered when the model list cannot be fetched.
pub const FALLBACK_MODELS: [&str; 2] = ["gemini-1.5-pro-latest", "gemini-2.5-flash"];

const API_KEY_HEADER: &str = "x-goog-api-key";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const MODELS_PAGE_SIZE: u32 = 1000;

/// Harm categories whose blocking is disabled for every request.
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Produces text for one input under a system prompt.
///
/// Implementations must be thread-safe; the pipeline calls them from a
/// background worker.
pub trait Generator: Send + Sync {
    /// Generates the processed text for `content`.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or yields no text.
    fn generate(&self, system_prompt: &str, content: &str) -> Result<String>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Default)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    safety_settings: Vec<SafetySetting>,
}

impl GenerateRequest {
    fn new(system_prompt: &str, content: &str) -> Self {
        Self {
            system_instruction: Content::text(None, system_prompt),
            contents: vec![Content::text(Some("user"), content)],
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ModelsPage {
    #[serde(default)]
    models: Vec<ModelInfo>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

/// Extracts the generated text from a response.
fn response_text(response: GenerateResponse) -> Result<String> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(Error::api(None, format!("prompt was blocked ({reason})")));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::api(None, "response contained no candidates"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
        return Err(Error::api(
            None,
            format!("response contained no text (finish reason: {reason})"),
        ));
    }

    Ok(text)
}

/// Maps a non-success HTTP answer to an error category.
fn error_from_response(status: u16, body: &str) -> Error {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);

    let message = parsed
        .as_ref()
        .map(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {status}")
            } else {
                trimmed.chars().take(500).collect()
            }
        });

    let key_rejected = parsed.as_ref().is_some_and(|e| {
        e.status == "UNAUTHENTICATED"
            || e.details.iter().any(|d| {
                d.get("reason").and_then(serde_json::Value::as_str) == Some("API_KEY_INVALID")
            })
    }) || message.contains("API key not valid");

    match status {
        401 | 403 => Error::invalid_api_key(message),
        400 if key_rejected => Error::invalid_api_key(message),
        _ => Error::api(Some(status), message),
    }
}

// ============================================================================
// Client
// ============================================================================

/// Blocking client bound to one API key and one model.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiClient {
    /// Creates a client for `model`. The key is trimmed before use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingApiKey`] for a blank key, or a network error if
    /// the HTTP client cannot be initialized.
    pub fn new(api_key: &str, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.into().trim().trim_start_matches("models/").to_string(),
        })
    }

    /// Points the client at another endpoint (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[cfg(test)]
    fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Returns the model requests are sent to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn model_url(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.base_url, self.model)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        Err(error_from_response(status.as_u16(), &body))
    }

    /// Counts the tokens of `text` for the configured model.
    ///
    /// # Errors
    ///
    /// Returns a credentials, network or API error.
    pub fn count_tokens(&self, text: &str) -> Result<u64> {
        let body = CountTokensRequest {
            contents: vec![Content::text(Some("user"), text)],
        };
        let response: CountTokensResponse = self
            .send(self.http.post(self.model_url("countTokens")).json(&body))?
            .json()?;
        Ok(response.total_tokens)
    }

    /// Lists models supporting `generateContent`, ordered by [`sort_models`].
    ///
    /// # Errors
    ///
    /// Returns a credentials, network or API error.
    pub fn list_models(&self) -> Result<Vec<String>> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/models", self.base_url))
                .query(&[("pageSize", MODELS_PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page: ModelsPage = self.send(request)?.json()?;
            models.extend(
                page.models
                    .into_iter()
                    .filter(|m| {
                        m.supported_generation_methods
                            .iter()
                            .any(|method| method == "generateContent")
                    })
                    .map(|m| m.name.trim_start_matches("models/").to_string()),
            );

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!("Fetched {} available models", models.len());
        Ok(sort_models(models))
    }

    /// Checks the key with a cheap token-count request.
    #[must_use]
    pub fn check_key(&self) -> KeyStatus {
        match self.count_tokens("test") {
            Ok(_) => KeyStatus::Valid,
            Err(e) => KeyStatus::from_error(&e),
        }
    }
}

impl Generator for GeminiClient {
    fn generate(&self, system_prompt: &str, content: &str) -> Result<String> {
        debug!(model = %self.model, bytes = content.len(), "Sending generateContent request");
        let body = GenerateRequest::new(system_prompt, content);
        let response: GenerateResponse = self
            .send(self.http.post(self.model_url("generateContent")).json(&body))?
            .json()?;
        response_text(response)
    }
}

// ============================================================================
// Key validation and model helpers
// ============================================================================

/// Outcome of validating an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// The API accepted the key
    Valid,
    /// No key was entered
    Missing,
    /// The API rejected the key or the request
    Invalid,
    /// The API could not be reached
    Unreachable,
}

impl KeyStatus {
    fn from_error(error: &Error) -> Self {
        match error {
            Error::MissingApiKey => Self::Missing,
            Error::Network { .. } => Self::Unreachable,
            _ => Self::Invalid,
        }
    }

    /// Returns true for [`KeyStatus::Valid`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Message shown to the user.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Valid => "API Key is valid!",
            Self::Missing => "Please enter an API key.",
            Self::Invalid => "Invalid API Key. Please check the key and try again.",
            Self::Unreachable => "Could not connect. Please check your internet connection.",
        }
    }
}

/// Validates `api_key` against the production API.
#[must_use]
pub fn validate_key(api_key: &str) -> KeyStatus {
    match GeminiClient::new(api_key, DEFAULT_MODEL) {
        Ok(client) => client.check_key(),
        Err(e) => KeyStatus::from_error(&e),
    }
}

/// Lists models for `api_key`, falling back to [`FALLBACK_MODELS`] on any error.
#[must_use]
pub fn available_models(api_key: &str) -> Vec<String> {
    match GeminiClient::new(api_key, DEFAULT_MODEL).and_then(|c| c.list_models()) {
        Ok(models) if !models.is_empty() => models,
        Ok(_) => fallback_models(),
        Err(e) => {
            warn!("Could not fetch model list: {}", e);
            fallback_models()
        }
    }
}

fn fallback_models() -> Vec<String> {
    FALLBACK_MODELS.iter().map(ToString::to_string).collect()
}

/// Orders models: Gemini first, then Gemma, then the rest, each group
/// in descending name order so newer versions come first.
#[must_use]
pub fn sort_models(models: Vec<String>) -> Vec<String> {
    let (mut gemini, rest): (Vec<_>, Vec<_>) = models.into_iter().partition(|m| m.contains("gemini"));
    let (mut gemma, mut other): (Vec<_>, Vec<_>) = rest.into_iter().partition(|m| m.contains("gemma"));

    for group in [&mut gemini, &mut gemma, &mut other] {
        group.sort_by(|a, b| b.cmp(a));
    }

    gemini.into_iter().chain(gemma).chain(other).collect()
}

/// Returns the preferred default from a model list.
#[must_use]
pub fn default_model(models: &[String]) -> Option<&str> {
    models
        .iter()
        .find(|m| m.contains(DEFAULT_MODEL))
        .map(String::as_str)
}

/// Display category for a model family.
#[must_use]
pub fn model_hint(model: &str) -> Option<&'static str> {
    const HINTS: [(&str, &str); 3] = [
        ("pro", "High Quality"),
        ("flash", "Speed & Efficiency"),
        ("gemma", "Compact & Fast"),
    ];

    HINTS
        .iter()
        .find(|(key, _)| model.contains(key))
        .map(|(_, hint)| *hint)
}
