//! Error types for the Holly speech engine

use thiserror::Error;

/// Result type alias for speech operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, fetching, or playing speech
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or output graph error
    #[error("audio error: {0}")]
    Audio(String),

    /// Synthesis backend rejected the request or could not be reached
    #[error("{message}")]
    Negotiation {
        /// HTTP status, when a response was received at all
        status: Option<u16>,
        /// Message surfaced verbatim to the user
        message: String,
    },

    /// The first unit of a stream could not be decoded
    ///
    /// Taken as proof that incremental decoding is not viable for the response.
    #[error("first audio unit undecodable: {0}")]
    FirstUnitDecode(String),

    /// A unit (or a whole blob) could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// The response body failed after playback had already started
    #[error("speech stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Local on-device synthesis failed
    #[error("local synthesis error: {0}")]
    LocalSynthesis(String),

    /// Text-completion (summarization) backend error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Every playback level failed
    #[error("speech unavailable: {0}")]
    Exhausted(Box<Error>),

    /// Session was stopped or superseded
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error is an explicit stop or supersession
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Human-readable text for the toast/banner surface
    ///
    /// Backend error bodies pass through untouched.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Negotiation { message, .. } => message.clone(),
            Self::Exhausted(cause) => cause.user_message(),
            Self::Http(e) if e.is_connect() => "speech unavailable: backend unreachable".to_string(),
            other => other.to_string(),
        }
    }
}
