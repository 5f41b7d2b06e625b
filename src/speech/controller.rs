//! Playback lifecycle controller
//!
//! Owns the single active session. `speak()` retires whatever is playing
//! before the new session negotiates, `stop()` tears everything down, and
//! `toggle_pause()` suspends the active output clock.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ladder::SpeechPipeline;
use super::local::{CommandSynthesizer, LocalSynthesizer};
use super::negotiate::SynthesisClient;
use super::output::OutputFactory;
use super::session::{PlaybackPath, PlaybackSession, Reporter, SessionId, SpeechEvent, SpeechStatus};
use crate::config::Config;
use crate::llm::LlmClient;
use crate::text::TextPreprocessor;
use crate::{Error, Result};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Played to the end through `path`
    Completed {
        /// Ladder level that produced the audio
        path: PlaybackPath,
    },
    /// Stopped or superseded
    Cancelled,
    /// Failed; `message` is what the user was shown
    Failed {
        /// User-facing error text
        message: String,
    },
}

/// Completion handle for one `speak()` call
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    outcome: oneshot::Receiver<SessionOutcome>,
}

impl SessionHandle {
    /// Session id
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for the session to end
    pub async fn wait(self) -> SessionOutcome {
        self.outcome.await.unwrap_or(SessionOutcome::Cancelled)
    }
}

struct Running {
    id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Entry point for speaking text
pub struct SpeechController {
    preprocessor: TextPreprocessor,
    pipeline: Arc<SpeechPipeline>,
    reporter: Arc<Reporter>,
    current: Mutex<Option<Running>>,
}

impl std::fmt::Debug for SpeechController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechController")
            .field("preprocessor", &self.preprocessor)
            .field("pipeline", &self.pipeline)
            .field("status", &self.reporter.status())
            .finish_non_exhaustive()
    }
}

impl SpeechController {
    /// Create a controller
    #[must_use]
    pub fn new(preprocessor: TextPreprocessor, pipeline: SpeechPipeline) -> Self {
        Self {
            preprocessor,
            pipeline: Arc::new(pipeline),
            reporter: Arc::new(Reporter::new()),
            current: Mutex::new(None),
        }
    }

    /// Build a controller from configuration, playing through `outputs`
    ///
    /// # Errors
    ///
    /// Returns error if local fallback is enabled but no synthesizer is usable
    pub fn from_config(config: &Config, outputs: Arc<dyn OutputFactory>) -> Result<Self> {
        let speech = &config.speech;

        let mut preprocessor = TextPreprocessor::new(speech.max_text_chars);
        if speech.summarize {
            preprocessor = preprocessor.with_summarizer(Arc::new(LlmClient::new(&config.llm_url)));
        }

        let mut pipeline = SpeechPipeline::new(SynthesisClient::new(&speech.tts_url), outputs)
            .two_phase(speech.two_phase)
            .stream(speech.stream);

        if speech.local_fallback {
            let local = match &speech.local_synth_command {
                Some(command) => CommandSynthesizer::from_command(command)?,
                None => CommandSynthesizer::detect()?,
            };
            tracing::debug!(synthesizer = local.name(), "local fallback enabled");
            pipeline = pipeline.with_local(Arc::new(local));
        }

        Ok(Self::new(preprocessor, pipeline))
    }

    /// Start speaking `text`, stopping whatever is playing first
    ///
    /// Returns `None` for empty or whitespace-only text, leaving any current
    /// session untouched.
    pub async fn speak(&self, text: &str) -> Option<SessionHandle> {
        if text.trim().is_empty() {
            return None;
        }

        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.retire(previous).await;
        }

        let id = SessionId::new();
        let cancel = CancellationToken::new();
        self.reporter.activate(id);
        tracing::info!(session = %id, chars = text.chars().count(), "speak");

        let session = PlaybackSession::new(id, cancel.clone(), Arc::clone(&self.reporter));
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            session,
            self.preprocessor.clone(),
            Arc::clone(&self.pipeline),
            text.to_string(),
            tx,
        ));

        *current = Some(Running { id, cancel, task });
        Some(SessionHandle { id, outcome: rx })
    }

    /// Stop any active session and reset to idle; idempotent
    pub async fn stop(&self) {
        let mut current = self.current.lock().await;
        if let Some(running) = current.take() {
            self.retire(running).await;
        }
        self.reporter.reset_idle();
    }

    /// Suspend or resume the active output clock
    ///
    /// Returns the new paused state, or `None` when nothing can be paused.
    pub fn toggle_pause(&self) -> Option<bool> {
        let paused = self.reporter.toggle_pause();
        if let Some(paused) = paused {
            tracing::debug!(paused, "toggled pause");
        }
        paused
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> SpeechStatus {
        self.reporter.status()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SpeechStatus> {
        self.reporter.subscribe_status()
    }

    /// Receive speech events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SpeechEvent> {
        self.reporter.subscribe_events()
    }

    /// Cancel the session, revoke its writes, silence it, and wait for its task
    async fn retire(&self, running: Running) {
        running.cancel.cancel();
        if self.reporter.deactivate(running.id) {
            tracing::debug!(session = %running.id, "retiring session");
        }
        if let Err(e) = running.task.await {
            tracing::warn!(session = %running.id, error = %e, "session task ended abnormally");
        }
    }
}

impl Drop for SpeechController {
    fn drop(&mut self) {
        if let Some(running) = self.current.get_mut().take() {
            running.cancel.cancel();
            self.reporter.deactivate(running.id);
        }
    }
}

async fn run_session(
    mut session: PlaybackSession,
    preprocessor: TextPreprocessor,
    pipeline: Arc<SpeechPipeline>,
    raw: String,
    outcome: oneshot::Sender<SessionOutcome>,
) {
    let id = session.id();
    let result = drive(&mut session, &preprocessor, &pipeline, &raw).await;

    let reported = match result {
        Ok(path) => {
            tracing::info!(session = %id, ?path, "speech finished");
            session.finish(path);
            SessionOutcome::Completed { path }
        }
        // A retired session may trip over its closed output before it sees the token
        Err(e) if e.is_cancellation() || session.cancel_token().is_cancelled() => {
            tracing::info!(session = %id, error = %e, "speech cancelled");
            SessionOutcome::Cancelled
        }
        Err(e) => {
            let message = e.user_message();
            tracing::error!(session = %id, error = %e, "speech failed");
            session.fail(&message);
            SessionOutcome::Failed { message }
        }
    };

    // Receiver may have been dropped
    let _ = outcome.send(reported);
}

async fn drive(
    session: &mut PlaybackSession,
    preprocessor: &TextPreprocessor,
    pipeline: &SpeechPipeline,
    raw: &str,
) -> Result<PlaybackPath> {
    let cancel = session.cancel_token().clone();

    let prepared = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        prepared = preprocessor.prepare(raw) => prepared,
    };
    // Blank input is filtered by `speak`; nothing left to say is not a failure
    let Some(prepared) = prepared else {
        return Err(Error::Cancelled);
    };
    if prepared.truncated {
        tracing::debug!(session = %session.id(), "text truncated for synthesis");
    }

    pipeline.run(session, &prepared).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::output::RecordingFactory;
    use crate::speech::session::Phase;

    fn controller() -> SpeechController {
        // Nothing listens here; every session fails fast at negotiation
        let pipeline = SpeechPipeline::new(
            SynthesisClient::new("http://127.0.0.1:9/tts"),
            Arc::new(RecordingFactory::new()),
        );
        SpeechController::new(TextPreprocessor::new(100), pipeline)
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let controller = controller();
        assert!(controller.speak("   \n").await.is_none());
        assert_eq!(controller.status().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let controller = controller();
        controller.stop().await;
        controller.stop().await;
        assert_eq!(controller.status(), SpeechStatus::default());
        assert_eq!(controller.toggle_pause(), None);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_once() {
        let controller = controller();
        let mut events = controller.subscribe_events();

        let handle = controller.speak("hello").await.unwrap();
        let outcome = handle.wait().await;
        assert!(matches!(outcome, SessionOutcome::Failed { .. }));

        assert!(matches!(events.recv().await, Ok(SpeechEvent::Error { .. })));
        assert!(events.try_recv().is_err());
        assert_eq!(controller.status().phase, Phase::Errored);

        controller.stop().await;
        assert_eq!(controller.status().phase, Phase::Idle);
    }
}
