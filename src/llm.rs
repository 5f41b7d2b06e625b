//! Text-completion client used for optional summarization

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Condenses text before it is spoken
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Return a condensed version of `text`
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Client for the text-completion backend (`POST { prompt } -> { message }`)
#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    message: Option<String>,
    response: Option<String>,
    text: Option<String>,
}

impl LlmClient {
    /// Create a client for the given endpoint
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Send a prompt and return the completion text
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, non-success status, or an empty reply
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&CompletionRequest { prompt })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("completion failed {status}: {body}")));
        }

        let body: CompletionResponse = response.json().await?;
        body.message
            .or(body.response)
            .or(body.text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Llm("completion response had no text".to_string()))
    }
}

#[async_trait]
impl Summarizer for LlmClient {
    async fn summarize(&self, text: &str) -> Result<String> {
        let prompt = format!(
            "Summarize the following in 2-3 sentences suitable for reading aloud. \
             Reply with the summary only.\n\n{text}"
        );
        self.complete(&prompt).await
    }
}
