//! Configuration management for the Holly speech engine

pub mod file;

use crate::{Error, Result};

/// Default synthesis endpoint
pub const DEFAULT_TTS_URL: &str = "http://localhost:3001/tts";

/// Default text-completion endpoint
pub const DEFAULT_LLM_URL: &str = "http://localhost:3001/llm";

/// Default character limit before truncation
pub const DEFAULT_MAX_TEXT_CHARS: usize = 1000;

/// Holly speech configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Speech playback configuration
    pub speech: SpeechConfig,

    /// Text-completion endpoint used for summarization
    pub llm_url: String,
}

/// Speech playback configuration
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct SpeechConfig {
    /// Synthesis endpoint URL
    pub tts_url: String,

    /// Maximum characters sent for synthesis
    pub max_text_chars: usize,

    /// Condense text via the LLM before speaking
    pub summarize: bool,

    /// Use the on-device synthesizer when the network path fails
    pub local_fallback: bool,

    /// Request display text (JSON phase) before audio
    pub two_phase: bool,

    /// Request a streamed audio body
    pub stream: bool,

    /// Explicit local synthesis command; `None` probes `PATH`
    pub local_synth_command: Option<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            tts_url: DEFAULT_TTS_URL.to_string(),
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            summarize: false,
            local_fallback: false,
            two_phase: false,
            stream: true,
            local_synth_command: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            speech: SpeechConfig::default(),
            llm_url: DEFAULT_LLM_URL.to_string(),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an invalid value
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an invalid value
    pub fn from_sources<F>(fc: file::HollyConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SpeechConfig::default();
        let fs = fc.speech;

        let max_text_chars = match env("HOLLY_MAX_TEXT_CHARS") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                Error::Config(format!("HOLLY_MAX_TEXT_CHARS must be a positive integer, got {raw:?}"))
            })?,
            None => fs.max_text_chars.unwrap_or(defaults.max_text_chars),
        };
        if max_text_chars == 0 {
            return Err(Error::Config("max_text_chars must be greater than zero".to_string()));
        }

        let speech = SpeechConfig {
            tts_url: env("HOLLY_TTS_URL")
                .or(fs.tts_url)
                .unwrap_or(defaults.tts_url),
            max_text_chars,
            summarize: env_flag(&env, "HOLLY_SUMMARIZE")?
                .or(fs.summarize)
                .unwrap_or(defaults.summarize),
            local_fallback: env_flag(&env, "HOLLY_LOCAL_FALLBACK")?
                .or(fs.local_fallback)
                .unwrap_or(defaults.local_fallback),
            two_phase: env_flag(&env, "HOLLY_TWO_PHASE")?
                .or(fs.two_phase)
                .unwrap_or(defaults.two_phase),
            stream: env_flag(&env, "HOLLY_STREAM")?
                .or(fs.stream)
                .unwrap_or(defaults.stream),
            local_synth_command: env("HOLLY_LOCAL_SYNTH_COMMAND")
                .or(fs.local_synth_command)
                .filter(|c| !c.trim().is_empty()),
        };

        let llm_url = env("HOLLY_LLM_URL")
            .or(fc.llm.url)
            .unwrap_or_else(|| DEFAULT_LLM_URL.to_string());

        Ok(Self { speech, llm_url })
    }
}

/// Parse a boolean environment flag
fn env_flag<F>(env: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!("{key} must be a boolean, got {raw:?}"))),
    }
}
