//! External oracles and the clients behind them.
//!
//! Real clients make a single bounded attempt. Retries only happen through an
//! explicit [`RetryPolicy`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Oracle timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle rate limited")]
    RateLimited,

    #[error("Malformed oracle output: {0}")]
    Malformed(String),

    #[error("Oracle transport error: {0}")]
    Transport(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OracleError::Malformed(_))
    }
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.7,
            max_tokens: 2000,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
pub trait TextOracle: Send + Sync {
    /// Provider name recorded in generation history.
    fn provider(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<String, OracleError>;
}

// ============================================================================
// DeepSeek chat completions client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
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

pub struct DeepSeekClient {
    http: reqwest::Client,
    config: OracleConfig,
}

impl DeepSeekClient {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    async fn send(&self, api_key: &str, prompt: &Prompt) -> Result<String, OracleError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: prompt.temperature,
            max_tokens: prompt.max_tokens,
            stream: false,
        };

        let response = self
            .http
            .post(&self.config.url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(OracleError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(OracleError::Unavailable(format!(
                "credentials rejected ({status})"
            )));
        }
        if status.is_server_error() {
            return Err(OracleError::Unavailable(format!("provider returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::Transport(format!("{status}: {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("unreadable completion body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| OracleError::Malformed("empty completion".to_string()))
    }

    fn map_reqwest(&self, e: reqwest::Error) -> OracleError {
        if e.is_timeout() {
            OracleError::Timeout(self.config.timeout)
        } else if e.is_connect() {
            OracleError::Unavailable(e.to_string())
        } else {
            OracleError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl TextOracle for DeepSeekClient {
    fn provider(&self) -> &str {
        "deepseek"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, OracleError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(OracleError::Unavailable(
                "API key not configured".to_string(),
            ));
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, self.send(api_key, prompt))
            .await
            .unwrap_or(Err(OracleError::Timeout(self.config.timeout)));

        match &result {
            Ok(text) => info!(
                "Oracle call to {} succeeded in {}ms ({} chars)",
                self.config.model,
                started.elapsed().as_millis(),
                text.len()
            ),
            Err(e) => warn!(
                "Oracle call to {} failed after {}ms: {}",
                self.config.model,
                started.elapsed().as_millis(),
                e
            ),
        }
        result
    }
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Runs the completion, bounding every attempt by `timeout` on its own.
    pub async fn complete(
        &self,
        oracle: &dyn TextOracle,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<String, OracleError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(timeout, oracle.complete(prompt))
                .await
                .unwrap_or(Err(OracleError::Timeout(timeout)));
            match result {
                Ok(text) => return Ok(text),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    debug!("Oracle attempt {attempt}/{attempts} failed: {e}, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Strips code fences and surrounding prose from a JSON completion.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let start = trimmed.find(|c: char| c == '{' || c == '[');
    let end = trimmed.rfind(|c: char| c == '}' || c == ']');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

// ============================================================================
// Speech / translation
// ============================================================================

pub const SUPPORTED_LANGUAGE_TAGS: [&str; 3] = ["en", "en-sh", "sh"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub unified_text: String,
    pub language_tag: String,
    pub confidence: f64,
}

#[async_trait]
pub trait SpeechOracle: Send + Sync {
    async fn detect_and_translate(&self, text: &str) -> Result<Translation, OracleError>;
}

/// Language detection and unification done by the text oracle.
pub struct LlmTranslator {
    oracle: Arc<dyn TextOracle>,
}

impl LlmTranslator {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self { oracle }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslationReply {
    unified_transcript: String,
    language_detected: String,
    confidence: f64,
}

pub fn parse_translation(text: &str) -> Result<Translation, OracleError> {
    let reply: TranslationReply = serde_json::from_str(extract_json(text))
        .map_err(|e| OracleError::Malformed(format!("translation reply: {e}")))?;

    if reply.unified_transcript.trim().is_empty() {
        return Err(OracleError::Malformed("empty unified transcript".to_string()));
    }
    if !SUPPORTED_LANGUAGE_TAGS.contains(&reply.language_detected.as_str()) {
        return Err(OracleError::Malformed(format!(
            "unsupported language tag '{}'",
            reply.language_detected
        )));
    }
    if !(0.0..=1.0).contains(&reply.confidence) {
        return Err(OracleError::Malformed(format!(
            "confidence {} outside [0, 1]",
            reply.confidence
        )));
    }

    Ok(Translation {
        unified_text: reply.unified_transcript,
        language_tag: reply.language_detected,
        confidence: reply.confidence,
    })
}

#[async_trait]
impl SpeechOracle for LlmTranslator {
    async fn detect_and_translate(&self, text: &str) -> Result<Translation, OracleError> {
        let prompt = Prompt::new(
            r#"You are a medical transcription specialist. The transcript may mix English and Serbo-Croatian.
Detect the language and produce a unified English transcript, preserving every medical term.
Return ONLY JSON: {"unifiedTranscript": "...", "languageDetected": "en" | "en-sh" | "sh", "confidence": 0.0-1.0}"#,
            text,
        )
        .temperature(0.1)
        .max_tokens(4000);

        let reply = self.oracle.complete(&prompt).await?;
        parse_translation(&reply)
    }
}

// ============================================================================
// Document rendering
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Section {
    pub heading: String,
    pub paragraphs: Vec<String>,
    pub bullets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    pub title: String,
    pub subtitle: Option<String>,
    pub sections: Vec<Section>,
}

pub trait DocumentRenderer: Send + Sync {
    fn render_to_file(&self, document: &Document) -> Result<PathBuf, OracleError>;
}

/// Writes a printable, self-contained HTML file.
pub struct HtmlRenderer {
    out_dir: PathBuf,
}

impl HtmlRenderer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn render_html(document: &Document) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", escape_html(&document.title)));
        html.push_str(
            "<style>body{font-family:Georgia,serif;max-width:48rem;margin:2rem auto;line-height:1.5}\
             h1{border-bottom:2px solid #333}h2{margin-top:2rem}@media print{body{margin:0}}</style>\n",
        );
        html.push_str("</head>\n<body>\n");
        html.push_str(&format!("<h1>{}</h1>\n", escape_html(&document.title)));
        if let Some(subtitle) = &document.subtitle {
            html.push_str(&format!("<p><em>{}</em></p>\n", escape_html(subtitle)));
        }

        for section in &document.sections {
            html.push_str(&format!("<h2>{}</h2>\n", escape_html(&section.heading)));
            for paragraph in &section.paragraphs {
                html.push_str(&format!("<p>{}</p>\n", escape_html(paragraph)));
            }
            if !section.bullets.is_empty() {
                html.push_str("<ul>\n");
                for bullet in &section.bullets {
                    html.push_str(&format!("<li>{}</li>\n", escape_html(bullet)));
                }
                html.push_str("</ul>\n");
            }
        }

        html.push_str("</body>\n</html>\n");
        html
    }
}

impl DocumentRenderer for HtmlRenderer {
    fn render_to_file(&self, document: &Document) -> Result<PathBuf, OracleError> {
        std::fs::create_dir_all(&self.out_dir).map_err(|e| {
            OracleError::Unavailable(format!("cannot create {}: {e}", self.out_dir.display()))
        })?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self
            .out_dir
            .join(format!("{}-{}.html", slugify(&document.title), &id[..8]));

        std::fs::write(&path, Self::render_html(document)).map_err(|e| {
            OracleError::Unavailable(format!("cannot write {}: {e}", path.display()))
        })?;

        info!("Rendered '{}' to {}", document.title, path.display());
        Ok(path)
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn slugify(title: &str) -> String {
    let slug: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "document".to_string()
    } else {
        slug
    }
}

// ============================================================================
// Fakes for tests
// ============================================================================
