use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Sampling profiles for the generation backend. The conservative profile is
/// the first attempt for every segment; the diverse profile adds a frequency
/// penalty to break the repetition loops that truncate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Conservative,
    Diverse,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_new_tokens: u32,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
}

impl GenerateRequest {
    pub fn new(prompt: String, max_new_tokens: u32, sampling: Sampling) -> Self {
        match sampling {
            Sampling::Conservative => Self {
                prompt,
                max_new_tokens,
                do_sample: true,
                temperature: 0.1,
                top_p: 0.3,
                frequency_penalty: 0.0,
            },
            Sampling::Diverse => Self {
                prompt,
                max_new_tokens,
                do_sample: true,
                temperature: 0.5,
                top_p: 0.95,
                frequency_penalty: 0.2,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    /// Number of tokens the backend generated; reaching `max_new_tokens`
    /// means the output was cut off.
    pub tokens: u32,
}

#[async_trait]
pub trait TranslateBackend: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;
}

/// Stateless HTTP client for one GPU-hosted generation endpoint.
#[derive(Debug, Clone)]
pub struct RemoteTranslateClient {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteTranslateClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .with_context(|| "failed to build generation backend client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl TranslateBackend for RemoteTranslateClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/api/v1/generate", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("generation request to {} failed", url))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!(
                "generation backend error ({}): {}",
                status,
                text.trim()
            ));
        }
        extract_generate_response(&text)
    }
}

fn extract_generate_response(text: &str) -> Result<GenerateResponse> {
    let payload: GenerateApiResponse =
        serde_json::from_str(text).with_context(|| "failed to parse generation response JSON")?;
    let result = payload
        .results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("generation backend returned no results"))?;
    Ok(GenerateResponse {
        text: result.text,
        tokens: result.tokens.unwrap_or(0),
    })
}

#[derive(Debug, Deserialize)]
struct GenerateApiResponse {
    #[serde(default)]
    results: Vec<GenerateApiResult>,
}

#[derive(Debug, Deserialize)]
struct GenerateApiResult {
    text: String,
    tokens: Option<u32>,
}
