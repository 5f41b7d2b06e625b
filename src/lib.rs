//! Holly Speech - streaming speech playback for the Holly voice chat client
//!
//! This library turns synthesized speech arriving over HTTP into continuous,
//! interruptible audio:
//! - Text preparation (optional summarization, truncation)
//! - Synthesis request negotiation (optional two-phase display text)
//! - Length-prefixed frame demultiplexing
//! - Gapless decode-and-schedule playback
//! - Fallback from streaming to whole-response playback to local synthesis
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 SpeechController                    │
//! │     speak  │  stop  │  toggle_pause  │  events      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 SpeechPipeline                      │
//! │  framed/raw stream  │  blob  │  local synthesizer   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          TTS backend  │  LLM backend  │  cpal       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod speech;
pub mod text;

pub use config::Config;
pub use error::{Error, Result};
pub use llm::{LlmClient, Summarizer};
pub use speech::{
    SessionHandle, SessionOutcome, SpeechController, SpeechEvent, SpeechPipeline, SpeechStatus,
};
pub use text::{PreparedText, TextPreprocessor};
