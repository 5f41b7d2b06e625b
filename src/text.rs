//! Outgoing text preparation: optional summarization and truncation

use std::sync::Arc;

use crate::llm::Summarizer;

/// Marker appended to truncated text
pub const ELLIPSIS: &str = "...";

/// Text ready for synthesis, with the untouched input kept for local fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    /// Raw text as submitted by the caller
    pub original: String,
    /// Text to send to the synthesis backend
    pub text: String,
    /// Whether the text was cut at the character limit
    pub truncated: bool,
}

/// Prepares text before a synthesis request is issued
#[derive(Clone)]
pub struct TextPreprocessor {
    summarizer: Option<Arc<dyn Summarizer>>,
    max_chars: usize,
}

impl std::fmt::Debug for TextPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextPreprocessor")
            .field("summarize", &self.summarizer.is_some())
            .field("max_chars", &self.max_chars)
            .finish()
    }
}

impl TextPreprocessor {
    /// Create a preprocessor with a character limit and no summarization
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            summarizer: None,
            max_chars,
        }
    }

    /// Enable summarization through the given backend
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Prepare `raw` for synthesis
    ///
    /// Returns `None` for empty or whitespace-only input. A failed summary
    /// falls back to the raw text.
    pub async fn prepare(&self, raw: &str) -> Option<PreparedText> {
        if raw.trim().is_empty() {
            return None;
        }

        let mut text = raw.trim().to_string();

        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(&text).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    tracing::debug!(
                        before = text.chars().count(),
                        after = summary.chars().count(),
                        "summarized text for speech"
                    );
                    text = summary.trim().to_string();
                }
                Ok(_) => tracing::debug!("empty summary, speaking raw text"),
                Err(e) => tracing::warn!(error = %e, "summarization failed, speaking raw text"),
            }
        }

        let (text, truncated) = truncate(&text, self.max_chars);

        Some(PreparedText {
            original: raw.to_string(),
            text,
            truncated,
        })
    }
}

/// Cut `text` to `max_chars` characters and append [`ELLIPSIS`] when it was longer
#[must_use]
pub fn truncate(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            let mut cut = text[..byte_idx].trim_end().to_string();
            cut.push_str(ELLIPSIS);
            (cut, true)
        }
        None => (text.to_string(), false),
    }
}
