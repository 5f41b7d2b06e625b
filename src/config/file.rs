//! TOML configuration file loading
//!
//! Supports `~/.config/holly/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HollyConfigFile {
    /// Speech playback configuration
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Text-completion backend configuration
    #[serde(default)]
    pub llm: LlmFileConfig,
}

/// Speech playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Synthesis endpoint (e.g. "http://localhost:3001/tts")
    pub tts_url: Option<String>,

    /// Character limit applied before synthesis
    pub max_text_chars: Option<usize>,

    /// Condense text through the LLM before speaking
    pub summarize: Option<bool>,

    /// Fall back to the on-device synthesizer
    pub local_fallback: Option<bool>,

    /// Fetch display text before requesting audio
    pub two_phase: Option<bool>,

    /// Request streamed audio
    pub stream: Option<bool>,

    /// Command used for local synthesis (e.g. "espeak-ng")
    pub local_synth_command: Option<String>,
}

/// Text-completion backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Endpoint (e.g. "http://localhost:3001/llm")
    pub url: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `HollyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HollyConfigFile {
    let Some(path) = config_file_path() else {
        return HollyConfigFile::default();
    };

    if !path.exists() {
        return HollyConfigFile::default();
    }

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> HollyConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HollyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HollyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/holly/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("xyz", "hollyai", "holly")
        .map(|d| d.config_dir().join("config.toml"))
}
