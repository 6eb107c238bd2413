//! Upstream season-stat providers and description generators.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hitrank_core::{DescriptionSubject, RawRecord};
use hitrank_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "hitrank-adapters";

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.sampleapis.com/baseball/hitsSingleSeason";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {source_id} payload: {source}")]
    Decode {
        source_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Provider of the full raw season-stat batch.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_all(&self) -> Result<Vec<RawRecord>, AdapterError>;
}

pub fn decode_raw_records(source_id: &str, bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    serde_json::from_slice(bytes).map_err(|source| AdapterError::Decode {
        source_id: source_id.to_string(),
        source,
    })
}

pub struct HttpUpstream {
    http: HttpFetcher,
    url: String,
}

impl HttpUpstream {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstream {
    fn source_id(&self) -> &str {
        &self.url
    }

    async fn fetch_all(&self) -> Result<Vec<RawRecord>, AdapterError> {
        let response = self.http.fetch_bytes(&self.url).await?;
        let records = decode_raw_records(&self.url, &response.body)?;
        info!(url = %response.final_url, count = records.len(), "fetched upstream batch");
        Ok(records)
    }
}

/// Reads the upstream JSON array from a file on disk.
#[derive(Debug, Clone)]
pub struct FixtureUpstream {
    path: PathBuf,
}

impl FixtureUpstream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn load_raw_records(path: impl AsRef<Path>) -> Result<Vec<RawRecord>, AdapterError> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_raw_records(&path.display().to_string(), &data)
}

#[async_trait]
impl UpstreamProvider for FixtureUpstream {
    fn source_id(&self) -> &str {
        self.path.to_str().unwrap_or("fixture")
    }

    async fn fetch_all(&self) -> Result<Vec<RawRecord>, AdapterError> {
        let records = load_raw_records(&self.path)?;
        debug!(path = %self.path.display(), count = records.len(), "loaded fixture batch");
        Ok(records)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("text generation is not configured")]
    NotConfigured,
    #[error("text generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("text generation returned http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected completion payload: {0}")]
    Decode(String),
    #[error("completion contained no text")]
    EmptyCompletion,
}

/// Produces a short human-readable description for a season line.
#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    async fn synthesize(&self, subject: &DescriptionSubject) -> Result<String, GenerationError>;
}

pub fn build_prompt(subject: &DescriptionSubject) -> String {
    format!(
        "Provide a detailed description of a baseball player based on the following information:\n\
         Name: {}\n\
         Hits: {}\n\
         Year: {}\n\
         Age: {}\n\
         Bats: {}\n\
         Generate a summary in a couple of sentences.",
        subject.player_name, subject.hits, subject.year, subject.age, subject.bats
    )
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl ChatCompletionsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 50,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsDescriber {
    client: reqwest::Client,
    config: ChatCompletionsConfig,
}

impl ChatCompletionsDescriber {
    pub fn new(config: ChatCompletionsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building chat completions client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Pull `choices[0].message.content` out of a chat completion response.
pub fn parse_completion(payload: &JsonValue) -> Result<String, GenerationError> {
    let content = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| GenerationError::Decode(payload.to_string()))?;
    let content = content.trim();
    if content.is_empty() {
        return Err(GenerationError::EmptyCompletion);
    }
    Ok(content.to_string())
}

#[async_trait]
impl DescriptionGenerator for ChatCompletionsDescriber {
    async fn synthesize(&self, subject: &DescriptionSubject) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: build_prompt(subject),
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: JsonValue = response.json().await?;
        let description = parse_completion(&payload)?;
        debug!(player = %subject.player_name, "generated description");
        Ok(description)
    }
}

/// Stand-in used when no API key is configured; every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDescriber;

#[async_trait]
impl DescriptionGenerator for DisabledDescriber {
    async fn synthesize(&self, _subject: &DescriptionSubject) -> Result<String, GenerationError> {
        Err(GenerationError::NotConfigured)
    }
}

/// Deterministic offline generator that fills a fixed sentence template.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateDescriber;

#[async_trait]
impl DescriptionGenerator for TemplateDescriber {
    async fn synthesize(&self, subject: &DescriptionSubject) -> Result<String, GenerationError> {
        let side = match subject.bats.as_str() {
            "L" => "left-handed",
            "R" => "right-handed",
            "B" | "S" => "switch-hitting",
            _ => "unlisted-handed",
        };
        Ok(format!(
            "{} was a {side} batter who collected {} hits in {} at age {}.",
            subject.player_name, subject.hits, subject.year, subject.age
        ))
    }
}
