//! Playback sessions and the observable speech state they write
//!
//! Status and events are process-wide, but only the active session may
//! write them. Every write goes through [`Reporter`], which checks the
//! writer's id against the active id under one lock.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::frame::Framing;
use super::output::AudioOutput;

/// Channel capacity for speech events
const EVENT_CAPACITY: usize = 64;

/// Identifier of one `speak()` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of the speech engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing active
    #[default]
    Idle,
    /// Text preparation and synthesis request in flight
    Negotiating,
    /// Response body is being demultiplexed and decoded
    Streaming,
    /// Moving down the fallback ladder
    FallingBack,
    /// Audio is audible
    Playing,
    /// Session finished naturally
    Stopped,
    /// Session failed
    Errored,
}

/// Fallback ladder level below streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackLevel {
    /// Whole response decoded as one buffer
    Blob,
    /// On-device synthesizer
    Local,
}

impl std::fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob => write!(f, "blob"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Which ladder level ended up producing the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybackPath {
    /// Incremental decode of a framed or raw stream
    Streamed {
        /// Framing the backend declared
        #[serde(serialize_with = "serialize_framing")]
        framing: Framing,
    },
    /// Whole-response blob
    Blob,
    /// Local synthesizer
    Local,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_framing<S: serde::Serializer>(framing: &Framing, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(framing)
}

/// Ladder levels already attempted by a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackState {
    /// Blob playback was attempted
    pub blob_attempted: bool,
    /// Local synthesis was attempted
    pub local_attempted: bool,
}

/// Snapshot of the process-wide speech state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct SpeechStatus {
    /// Current phase
    pub phase: Phase,
    /// Audio is audible (or the local synthesizer is talking)
    pub is_speaking: bool,
    /// Output clock is suspended
    pub is_paused: bool,
    /// Waiting for the first audio
    pub is_loading: bool,
    /// Most recent user-facing error, including one that triggered a fallback
    pub last_error: Option<String>,
    /// Display text returned by the JSON phase
    pub display_text: Option<String>,
    /// Session the snapshot belongs to
    pub session: Option<SessionId>,
}

/// Notification broadcast to presentation code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpeechEvent {
    /// First audio of a session became audible
    Started { session: SessionId },
    /// Session played to the end
    Finished {
        session: SessionId,
        path: PlaybackPath,
    },
    /// Session moved down the ladder
    FallingBack {
        session: SessionId,
        level: FallbackLevel,
        reason: String,
    },
    /// Toast/banner text for a failed session
    Error { session: SessionId, message: String },
}

#[derive(Default)]
struct ActiveSlot {
    id: Option<SessionId>,
    output: Option<Arc<dyn AudioOutput>>,
}

/// Single-writer gate over the speech status and event channels
pub(crate) struct Reporter {
    status: watch::Sender<SpeechStatus>,
    events: broadcast::Sender<SpeechEvent>,
    active: Mutex<ActiveSlot>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Reporter {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(SpeechStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            status,
            events,
            active: Mutex::new(ActiveSlot::default()),
        }
    }

    fn active(&self) -> MutexGuard<'_, ActiveSlot> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> SpeechStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn subscribe_status(&self) -> watch::Receiver<SpeechStatus> {
        self.status.subscribe()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<SpeechEvent> {
        self.events.subscribe()
    }

    /// Make `id` the only writer and reset the status for it
    pub(crate) fn activate(&self, id: SessionId) {
        let mut active = self.active();
        active.id = Some(id);
        active.output = None;
        self.status.send_replace(SpeechStatus {
            phase: Phase::Negotiating,
            is_loading: true,
            session: Some(id),
            ..SpeechStatus::default()
        });
    }

    /// Revoke `id`'s write access and silence its output
    ///
    /// Returns whether `id` was the active session.
    pub(crate) fn deactivate(&self, id: SessionId) -> bool {
        let output = {
            let mut active = self.active();
            if active.id != Some(id) {
                return false;
            }
            active.id = None;
            active.output.take()
        };
        if let Some(output) = output {
            output.pause();
            output.close();
        }
        true
    }

    /// Reset to `Idle`; only valid once no session is active
    pub(crate) fn reset_idle(&self) {
        let active = self.active();
        if active.id.is_none() {
            self.status.send_replace(SpeechStatus::default());
        }
    }

    /// Apply `update` to the status if `id` is still active
    pub(crate) fn publish(&self, id: SessionId, update: impl FnOnce(&mut SpeechStatus)) -> bool {
        let active = self.active();
        if active.id != Some(id) {
            return false;
        }
        self.status.send_modify(update);
        true
    }

    /// Broadcast `event` if `id` is still active
    pub(crate) fn emit(&self, id: SessionId, event: SpeechEvent) -> bool {
        let active = self.active();
        if active.id != Some(id) {
            return false;
        }
        // No subscribers is fine
        let _ = self.events.send(event);
        true
    }

    /// Record `output` as the active session's output
    pub(crate) fn attach_output(&self, id: SessionId, output: &Arc<dyn AudioOutput>) -> bool {
        let mut active = self.active();
        if active.id != Some(id) {
            return false;
        }
        active.output = Some(Arc::clone(output));
        self.status.send_modify(|s| s.is_paused = false);
        true
    }

    /// Forget `output` if it is still the recorded one
    pub(crate) fn detach_output(&self, id: SessionId, output: &Arc<dyn AudioOutput>) {
        let mut active = self.active();
        if active.id == Some(id)
            && active
                .output
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, output))
        {
            active.output = None;
            self.status.send_modify(|s| s.is_paused = false);
        }
    }

    /// Suspend or resume the active output clock
    ///
    /// Returns the new paused state, or `None` when there is nothing to pause.
    pub(crate) fn toggle_pause(&self) -> Option<bool> {
        let active = self.active();
        active.id?;
        let output = active.output.as_ref()?;

        let paused = if output.is_paused() {
            output.resume();
            false
        } else {
            output.pause();
            true
        };
        self.status.send_modify(|s| s.is_paused = paused);
        Some(paused)
    }
}

/// Live state of one `speak()` call
///
/// Owned by the task driving the session; each ladder level borrows it.
#[derive(Debug)]
pub struct PlaybackSession {
    id: SessionId,
    cancel: CancellationToken,
    phase: Phase,
    fallback: FallbackState,
    started: bool,
    reported: bool,
    reporter: Arc<Reporter>,
}

impl PlaybackSession {
    pub(crate) fn new(id: SessionId, cancel: CancellationToken, reporter: Arc<Reporter>) -> Self {
        Self {
            id,
            cancel,
            phase: Phase::Negotiating,
            fallback: FallbackState {
                blob_attempted: false,
                local_attempted: false,
            },
            started: false,
            reported: false,
            reporter,
        }
    }

    /// Session id
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Session cancellation token
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Ladder levels attempted so far
    #[must_use]
    pub const fn fallback(&self) -> FallbackState {
        self.fallback
    }

    /// Whether any audio has become audible
    #[must_use]
    pub const fn has_started(&self) -> bool {
        self.started
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        let loading = !self.started;
        self.reporter.publish(self.id, |s| {
            s.phase = phase;
            s.is_loading = loading;
        });
    }

    pub(crate) fn set_display_text(&self, text: &str) {
        self.reporter
            .publish(self.id, |s| s.display_text = Some(text.to_string()));
    }

    /// Mark audio as audible; only the first call has any effect
    pub(crate) fn started(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.phase = Phase::Playing;
        self.reporter.publish(self.id, |s| {
            s.phase = Phase::Playing;
            s.is_speaking = true;
            s.is_loading = false;
        });
        self.reporter
            .emit(self.id, SpeechEvent::Started { session: self.id });
        tracing::info!(session = %self.id, "speaking started");
        true
    }

    /// Enter the fallback sub-state for `level`
    ///
    /// A local fallback also records `reason` as the last error, so the
    /// triggering failure stays visible even if local speech succeeds.
    pub(crate) fn falling_back(&mut self, level: FallbackLevel, reason: &str) {
        match level {
            FallbackLevel::Blob => self.fallback.blob_attempted = true,
            FallbackLevel::Local => self.fallback.local_attempted = true,
        }
        self.phase = Phase::FallingBack;
        let loading = !self.started;
        self.reporter.publish(self.id, |s| {
            s.phase = Phase::FallingBack;
            s.is_loading = loading;
            if level == FallbackLevel::Local {
                s.last_error = Some(reason.to_string());
            }
        });
        self.reporter.emit(
            self.id,
            SpeechEvent::FallingBack {
                session: self.id,
                level,
                reason: reason.to_string(),
            },
        );
        tracing::warn!(session = %self.id, %level, reason, "falling back");
    }

    pub(crate) fn finish(&mut self, path: PlaybackPath) {
        self.phase = Phase::Stopped;
        self.reporter.publish(self.id, |s| {
            s.phase = Phase::Stopped;
            s.is_speaking = false;
            s.is_loading = false;
            s.is_paused = false;
        });
        self.reporter.emit(
            self.id,
            SpeechEvent::Finished {
                session: self.id,
                path,
            },
        );
    }

    /// Surface `message` once; later calls are ignored
    pub(crate) fn fail(&mut self, message: &str) {
        self.phase = Phase::Errored;
        if self.reported {
            return;
        }
        self.reported = true;
        self.reporter.publish(self.id, |s| {
            s.phase = Phase::Errored;
            s.is_speaking = false;
            s.is_loading = false;
            s.is_paused = false;
            s.last_error = Some(message.to_string());
        });
        self.reporter.emit(
            self.id,
            SpeechEvent::Error {
                session: self.id,
                message: message.to_string(),
            },
        );
    }

    pub(crate) fn attach_output(&self, output: &Arc<dyn AudioOutput>) -> bool {
        self.reporter.attach_output(self.id, output)
    }

    pub(crate) fn output_release(&self) -> OutputRelease {
        OutputRelease {
            id: self.id,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

/// Detaches an output from the active slot without borrowing the session
#[derive(Debug)]
pub(crate) struct OutputRelease {
    id: SessionId,
    reporter: Arc<Reporter>,
}

impl OutputRelease {
    pub(crate) fn release(&self, output: &Arc<dyn AudioOutput>) {
        self.reporter.detach_output(self.id, output);
    }
}
