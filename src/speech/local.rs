//! On-device speech synthesis used as the last fallback level

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// System commands probed when none is configured, in order
const CANDIDATES: &[&str] = &["espeak-ng", "espeak", "spd-say", "say"];

/// Speaks text without touching the network
#[async_trait]
pub trait LocalSynthesizer: Send + Sync {
    /// Speak `text`, returning once speech has finished
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if cancelled, or
    /// [`Error::LocalSynthesis`] if the synthesizer fails
    async fn speak(&self, text: &str, cancel: &CancellationToken) -> Result<()>;

    /// Synthesizer name for logs
    fn name(&self) -> &str;
}

/// Runs a system speech command such as `espeak-ng` or `say`
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: std::path::PathBuf,
    args: Vec<String>,
}

impl CommandSynthesizer {
    /// Use an explicit command line; the text is appended as the last argument
    ///
    /// # Errors
    ///
    /// Returns error if the command is empty or not found on `PATH`
    pub fn from_command(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("local synthesis command is empty".to_string()))?;
        let program = which::which(program)
            .map_err(|e| Error::Config(format!("local synthesis command {program:?}: {e}")))?;

        Ok(Self {
            program,
            args: parts.map(ToString::to_string).collect(),
        })
    }

    /// Find the first available system synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if none of the known commands is installed
    pub fn detect() -> Result<Self> {
        CANDIDATES
            .iter()
            .find_map(|bin| which::which(bin).ok())
            .map(|program| Self {
                program,
                args: Vec::new(),
            })
            .ok_or_else(|| {
                Error::Config(format!(
                    "no local synthesizer found (tried {})",
                    CANDIDATES.join(", ")
                ))
            })
    }
}

#[async_trait]
impl LocalSynthesizer for CommandSynthesizer {
    async fn speak(&self, text: &str, cancel: &CancellationToken) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::LocalSynthesis(format!("{}: {e}", self.program.display())))?;

        tracing::debug!(program = %self.program.display(), chars = text.chars().count(), "local synthesis started");

        let finished = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let Some(status) = finished else {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        };

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::LocalSynthesis(format!(
                "{} exited with {status}",
                self.program.display()
            )))
        }
    }

    fn name(&self) -> &str {
        self.program
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("command")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandSynthesizer::from_command("   "),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_command_is_rejected() {
        assert!(CommandSynthesizer::from_command("definitely-not-a-real-tts-binary").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_to_completion() {
        let synth = CommandSynthesizer::from_command("true").unwrap();
        synth.speak("hello", &CancellationToken::new()).await.unwrap();
        assert_eq!(synth.name(), "true");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_error() {
        let synth = CommandSynthesizer::from_command("false").unwrap();
        let err = synth.speak("hello", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::LocalSynthesis(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_child() {
        let synth = CommandSynthesizer::from_command("sleep 30").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = synth.speak("5", &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
