//! Gemini completion backend (API key authentication).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{Completion, CompletionBackend};
use crate::error::Error;
use crate::Result;

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Text-completion client for the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiBackend {
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiBackend {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }

    fn build_url(&self) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            GEMINI_API_URL, self.model, self.api_key
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u32>,
}

fn parse_completion(response: GenerateResponse) -> Result<Completion> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::BackendUnavailable("no candidates in response".to_string()))?;

    let text: String = candidate
        .content
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(Error::BackendUnavailable("empty completion".to_string()));
    }

    Ok(Completion {
        text,
        tokens_used: response
            .usage_metadata
            .and_then(|usage| usage.total_token_count),
    })
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    async fn generate(&self, prompt: &str) -> Result<Completion> {
        let request = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.7,
                "maxOutputTokens": 8192
            }
        });

        let response = match self
            .client
            .post(self.build_url())
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            // Connect errors and timeouts are transient by definition.
            Err(e) => return Err(Error::BackendUnavailable(format!("request failed: {e}"))),
        };

        let status = response.status();
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::BackendRejected {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            return Err(Error::BackendUnavailable(format!(
                "backend returned {status}"
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("bad response body: {e}")))?;
        parse_completion(body)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
