//! Audio output graph abstraction and a virtual-clock recorder

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::decode::DecodedAudio;
use crate::{Error, Result};

/// A scheduled-playback sink with its own monotonic clock
///
/// Positions are measured from the moment the output was opened. The clock
/// stops advancing while paused, so queued units keep their relative timing.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Current position of the output clock
    fn now(&self) -> Duration;

    /// Queue `audio` to start at clock position `at`
    ///
    /// # Errors
    ///
    /// Returns error if the output is closed or the unit cannot be converted
    fn schedule(&self, audio: DecodedAudio, at: Duration) -> Result<()>;

    /// Suspend the clock
    fn pause(&self);

    /// Resume the clock
    fn resume(&self);

    /// Whether the clock is suspended
    fn is_paused(&self) -> bool;

    /// Wait until the clock reaches `at`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first
    async fn wait_until(&self, at: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Stop all audio and release the device; idempotent
    fn close(&self);
}

/// Opens a fresh, exclusively owned output per playback level
pub trait OutputFactory: Send + Sync {
    /// Open an output
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    fn open(&self) -> Result<Arc<dyn AudioOutput>>;
}

/// One unit handed to a [`RecordingOutput`]
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    /// Clock position the unit starts at
    pub start: Duration,
    /// Unit length
    pub duration: Duration,
    /// Decoded audio
    pub audio: DecodedAudio,
}

#[derive(Debug, Default)]
struct RecorderState {
    clock: Duration,
    closed: bool,
    units: Vec<ScheduledUnit>,
}

/// Output with a virtual clock that records everything scheduled on it
///
/// The clock only moves when [`AudioOutput::wait_until`] is called, jumping
/// straight to the requested position unless paused.
#[derive(Debug)]
pub struct RecordingOutput {
    state: Mutex<RecorderState>,
    paused: watch::Sender<bool>,
}

impl Default for RecordingOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingOutput {
    /// Create a recorder whose clock starts at zero
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    /// Create a recorder whose clock starts at `start`
    #[must_use]
    pub fn starting_at(start: Duration) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(RecorderState {
                clock: start,
                ..Default::default()
            }),
            paused,
        }
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Units scheduled so far, in scheduling order
    #[must_use]
    pub fn units(&self) -> Vec<ScheduledUnit> {
        self.state().units.clone()
    }

    /// Whether [`AudioOutput::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Mix every scheduled unit onto one timeline at the first unit's rate
    #[must_use]
    pub fn mixdown(&self) -> Option<DecodedAudio> {
        let state = self.state();
        let first = state.units.first()?;
        let rate = first.audio.sample_rate;
        let origin = first.start;

        let mut mix: Vec<f32> = Vec::new();
        for unit in &state.units {
            let offset = frames_at(unit.start.saturating_sub(origin), rate);
            let ratio = f64::from(unit.audio.sample_rate) / f64::from(rate);
            let len = unit.duration.as_secs_f64() * f64::from(rate);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let len = len.round() as usize;

            if mix.len() < offset + len {
                mix.resize(offset + len, 0.0);
            }
            for i in 0..len {
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let src = (i as f64 * ratio) as usize;
                if let Some(s) = unit.audio.samples.get(src) {
                    mix[offset + i] += s;
                }
            }
        }

        Some(DecodedAudio {
            samples: mix,
            sample_rate: rate,
        })
    }
}

/// Convert a clock position to a frame index at `rate`
#[must_use]
pub fn frames_at(at: Duration, rate: u32) -> usize {
    let frames = at.as_nanos() * u128::from(rate) / 1_000_000_000;
    usize::try_from(frames).unwrap_or(usize::MAX)
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    fn now(&self) -> Duration {
        self.state().clock
    }

    fn schedule(&self, audio: DecodedAudio, at: Duration) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Audio("output closed".to_string()));
        }
        let duration = audio.duration();
        state.units.push(ScheduledUnit {
            start: at,
            duration,
            audio,
        });
        Ok(())
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn wait_until(&self, at: Duration, cancel: &CancellationToken) -> Result<()> {
        let mut paused = self.paused.subscribe();
        loop {
            if !*paused.borrow_and_update() {
                let mut state = self.state();
                if state.clock < at {
                    state.clock = at;
                }
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Err(Error::Audio("output dropped".to_string()));
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.state().closed = true;
    }
}

/// Hands out [`RecordingOutput`]s and keeps every one it opened
#[derive(Debug, Default, Clone)]
pub struct RecordingFactory {
    opened: Arc<Mutex<Vec<Arc<RecordingOutput>>>>,
}

impl RecordingFactory {
    /// Create an empty factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every output opened so far, in order
    #[must_use]
    pub fn opened(&self) -> Vec<Arc<RecordingOutput>> {
        self.opened
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}

impl OutputFactory for RecordingFactory {
    fn open(&self) -> Result<Arc<dyn AudioOutput>> {
        let output = Arc::new(RecordingOutput::new());
        self.opened
            .lock()
            .map_err(|_| Error::Audio("recorder registry poisoned".to_string()))?
            .push(Arc::clone(&output));
        Ok(output)
    }
}
