//! Synthesis request negotiation with the TTS backend

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::frame::{FRAMING_HEADER, Framing};
use crate::{Error, Result};

/// Ordered body chunks of a synthesis response
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One synthesis request, fixed once issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    /// Text to synthesize (already prepared)
    pub text: String,
    /// Fetch clean display text first, then audio for it
    pub two_phase: bool,
    /// Ask for a streamed audio body
    pub wants_stream: bool,
}

/// Audio response handed to the demultiplexer
pub struct AudioResponse {
    /// Framing declared by the backend
    pub framing: Framing,
    /// Response content type, if any
    pub content_type: Option<String>,
    /// Display text returned by the JSON phase
    pub display_text: Option<String>,
    /// Body chunks in arrival order
    pub body: ByteStream,
}

impl std::fmt::Debug for AudioResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioResponse")
            .field("framing", &self.framing)
            .field("content_type", &self.content_type)
            .field("display_text", &self.display_text)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<bool>,
}

#[derive(Deserialize)]
struct DisplayTextBody {
    response: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// HTTP client for the synthesis backend
#[derive(Debug, Clone)]
pub struct SynthesisClient {
    client: reqwest::Client,
    url: String,
}

impl SynthesisClient {
    /// Create a client for the given endpoint
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Negotiate audio for `request`
    ///
    /// Runs the JSON phase first when `two_phase` is set; its display text
    /// replaces the request text for the audio phase. Nothing is retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Negotiation`] for transport failures and non-success
    /// statuses, [`Error::Cancelled`] if cancelled first
    pub async fn request_audio(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<AudioResponse> {
        let display_text = if request.two_phase {
            Some(self.request_display_text(&request.text, cancel).await?)
        } else {
            None
        };
        let text = display_text.as_deref().unwrap_or(&request.text);

        let body = SynthesisBody {
            text,
            stream: request.wants_stream,
            json: None,
        };
        let response = self.post(&body, cancel).await?;
        let status = response.status();

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        if !status.is_success() {
            let body = read_text(response, cancel).await?;
            return Err(Error::Negotiation {
                status: Some(status.as_u16()),
                message: failure_message(status, content_type.as_deref(), &body),
            });
        }

        if content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/json"))
        {
            let body = read_text(response, cancel).await?;
            return Err(Error::Negotiation {
                status: Some(status.as_u16()),
                message: error_field(&body)
                    .unwrap_or_else(|| "speech backend answered with JSON instead of audio".to_string()),
            });
        }

        let framing = Framing::from_header(
            response
                .headers()
                .get(FRAMING_HEADER)
                .and_then(|v| v.to_str().ok()),
        );

        tracing::debug!(
            status = status.as_u16(),
            %framing,
            content_type = content_type.as_deref().unwrap_or_default(),
            "synthesis response accepted"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(AudioResponse {
            framing,
            content_type,
            display_text,
            body,
        })
    }

    /// JSON phase: ask the backend for clean display text
    async fn request_display_text(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        let body = SynthesisBody {
            text,
            stream: false,
            json: Some(true),
        };
        let response = self.post(&body, cancel).await?;
        let status = response.status();
        let body = read_text(response, cancel).await?;

        if !status.is_success() {
            return Err(Error::Negotiation {
                status: Some(status.as_u16()),
                message: format!("display text request failed ({status}): {body}"),
            });
        }

        let parsed: DisplayTextBody = serde_json::from_str(&body).map_err(|e| Error::Negotiation {
            status: Some(status.as_u16()),
            message: format!("display text response unreadable: {e}: {body}"),
        })?;

        parsed
            .response
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| Error::Negotiation {
                status: Some(status.as_u16()),
                message: format!("display text response missing `response`: {body}"),
            })
    }

    async fn post(&self, body: &SynthesisBody<'_>, cancel: &CancellationToken) -> Result<reqwest::Response> {
        let send = self.client.post(&self.url).json(body).send();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            sent = send => sent.map_err(|e| Error::Negotiation {
                status: None,
                message: format!("speech backend unreachable: {e}"),
            }),
        }
    }
}

async fn read_text(response: reqwest::Response, cancel: &CancellationToken) -> Result<String> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        text = response.text() => Ok(text.unwrap_or_default()),
    }
}

/// Pull `error` (or `message`) out of a JSON error body
fn error_field(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.error.or(parsed.message).filter(|m| !m.is_empty())
}

/// Message for a failed audio request: JSON `error`, else plain body, else status
fn failure_message(status: reqwest::StatusCode, content_type: Option<&str>, body: &str) -> String {
    let json_error = if content_type.is_none_or(|ct| ct.contains("json")) {
        error_field(body)
    } else {
        None
    };

    json_error.unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            format!("TTS request failed: {status}")
        } else {
            trimmed.to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;

    #[test]
    fn request_body_shape() {
        let body = SynthesisBody {
            text: "hi",
            stream: true,
            json: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "text": "hi", "stream": true })
        );

        let body = SynthesisBody {
            text: "hi",
            stream: false,
            json: Some(true),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "text": "hi", "stream": false, "json": true })
        );
    }

    #[test]
    fn failure_message_prefers_json_error() {
        let msg = failure_message(
            StatusCode::INTERNAL_SERVER_ERROR,
            Some("application/json"),
            r#"{"error":"synth unavailable"}"#,
        );
        assert_eq!(msg, "synth unavailable");
    }

    #[test]
    fn failure_message_falls_back_to_text_then_status() {
        let msg = failure_message(StatusCode::BAD_GATEWAY, Some("text/plain"), "upstream down\n");
        assert_eq!(msg, "upstream down");

        let msg = failure_message(StatusCode::BAD_GATEWAY, Some("application/json"), "{not json");
        assert_eq!(msg, "{not json");

        let msg = failure_message(StatusCode::SERVICE_UNAVAILABLE, None, "");
        assert_eq!(msg, "TTS request failed: 503 Service Unavailable");
    }
}
