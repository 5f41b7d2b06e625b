//! Decode & schedule engine
//!
//! Decodes each unit independently and places it on the output clock
//! directly after the previous one, so playback is gapless no matter how
//! unevenly units arrive.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::decode::{AudioDecoder, DecodedAudio};
use super::output::AudioOutput;
use crate::{Error, Result};

/// What happened to one fed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Decoded and queued on the output
    Scheduled {
        /// Clock position the unit starts at
        start: Duration,
        /// Unit length
        duration: Duration,
        /// First unit of the session to play
        first: bool,
    },
    /// Undecodable mid-stream unit, skipped
    Dropped,
}

/// Feeds decoded units onto an output in arrival order
pub struct ScheduleEngine {
    decoder: Arc<dyn AudioDecoder>,
    output: Arc<dyn AudioOutput>,
    cursor: Duration,
    seen: usize,
    scheduled: usize,
    dropped: usize,
}

impl std::fmt::Debug for ScheduleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEngine")
            .field("cursor", &self.cursor)
            .field("seen", &self.seen)
            .field("scheduled", &self.scheduled)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

impl ScheduleEngine {
    /// Create an engine whose cursor is seeded at the output's current time
    #[must_use]
    pub fn new(decoder: Arc<dyn AudioDecoder>, output: Arc<dyn AudioOutput>) -> Self {
        let cursor = output.now();
        Self {
            decoder,
            output,
            cursor,
            seen: 0,
            scheduled: 0,
            dropped: 0,
        }
    }

    /// Decode one unit and schedule it at the cursor
    ///
    /// # Errors
    ///
    /// Returns [`Error::FirstUnitDecode`] if the very first unit cannot be
    /// decoded or scheduled, which means the response cannot be played
    /// incrementally. Later failures are reported as [`UnitOutcome::Dropped`].
    pub async fn feed(&mut self, unit: Bytes, cancel: &CancellationToken) -> Result<UnitOutcome> {
        let index = self.seen;
        self.seen += 1;
        let len = unit.len();

        let result = decode_cancellable(Arc::clone(&self.decoder), unit, cancel)
            .await
            .and_then(|audio| self.schedule(audio));

        match result {
            Ok(outcome) => Ok(outcome),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if index == 0 => {
                tracing::debug!(bytes = len, error = %e, "first unit unplayable");
                Err(Error::FirstUnitDecode(e.to_string()))
            }
            Err(e) => {
                self.dropped += 1;
                tracing::warn!(unit = index, bytes = len, error = %e, "dropping unplayable unit");
                Ok(UnitOutcome::Dropped)
            }
        }
    }

    fn schedule(&mut self, audio: DecodedAudio) -> Result<UnitOutcome> {
        let now = self.output.now();
        if self.cursor < now {
            tracing::debug!(
                behind_ms = (now - self.cursor).as_millis(),
                "output underrun, re-seeding cursor"
            );
            self.cursor = now;
        }

        let start = self.cursor;
        let duration = audio.duration();
        self.output.schedule(audio, start)?;
        self.cursor += duration;

        let first = self.scheduled == 0;
        self.scheduled += 1;
        tracing::debug!(
            unit = self.seen - 1,
            start_ms = start.as_millis(),
            duration_ms = duration.as_millis(),
            "scheduled unit"
        );

        Ok(UnitOutcome::Scheduled {
            start,
            duration,
            first,
        })
    }

    /// Whether any unit has been scheduled
    #[must_use]
    pub const fn started(&self) -> bool {
        self.scheduled > 0
    }

    /// Units fed so far
    #[must_use]
    pub const fn units_seen(&self) -> usize {
        self.seen
    }

    /// Units dropped as undecodable
    #[must_use]
    pub const fn units_dropped(&self) -> usize {
        self.dropped
    }

    /// Clock position where the last scheduled unit ends
    #[must_use]
    pub const fn end(&self) -> Duration {
        self.cursor
    }

    /// Wait for the last scheduled unit to finish playing
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if cancelled first
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<()> {
        self.output.wait_until(self.cursor, cancel).await
    }
}

/// Decode off the async executor, abandoning the result on cancellation
///
/// # Errors
///
/// Returns the decoder's error, or [`Error::Cancelled`]
pub async fn decode_cancellable(
    decoder: Arc<dyn AudioDecoder>,
    unit: Bytes,
    cancel: &CancellationToken,
) -> Result<DecodedAudio> {
    let task = tokio::task::spawn_blocking(move || decoder.decode(&unit));
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        joined = task => joined.map_err(|e| Error::Decode(format!("decoder task failed: {e}")))?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::decode::{ContainerDecoder, encode_wav};
    use crate::speech::output::RecordingOutput;

    fn wav(samples: usize, rate: u32) -> Bytes {
        Bytes::from(encode_wav(&vec![0.2; samples], rate).unwrap())
    }

    fn engine(output: &Arc<RecordingOutput>) -> ScheduleEngine {
        ScheduleEngine::new(Arc::new(ContainerDecoder), Arc::clone(output) as Arc<dyn AudioOutput>)
    }

    #[tokio::test]
    async fn units_are_gapless_from_seeded_clock() {
        let start = Duration::from_millis(250);
        let output = Arc::new(RecordingOutput::starting_at(start));
        let mut engine = engine(&output);
        let cancel = CancellationToken::new();

        let sizes = [2400, 800, 1600, 24];
        for n in sizes {
            engine.feed(wav(n, 24_000), &cancel).await.unwrap();
        }

        let units = output.units();
        assert_eq!(units.len(), sizes.len());
        let mut expected = start;
        for unit in &units {
            assert_eq!(unit.start, expected);
            expected += unit.duration;
        }
        assert_eq!(engine.end(), expected);
    }

    #[tokio::test]
    async fn first_unit_failure_is_fatal() {
        let output = Arc::new(RecordingOutput::new());
        let mut engine = engine(&output);

        let err = engine
            .feed(Bytes::from_static(b"not audio at all"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FirstUnitDecode(_)));
        assert!(!engine.started());
        assert!(output.units().is_empty());
    }

    #[tokio::test]
    async fn later_failures_are_dropped() {
        let output = Arc::new(RecordingOutput::new());
        let mut engine = engine(&output);
        let cancel = CancellationToken::new();

        let first = engine.feed(wav(240, 24_000), &cancel).await.unwrap();
        assert!(matches!(first, UnitOutcome::Scheduled { first: true, .. }));

        let good = wav(480, 24_000);
        let truncated = good.slice(..good.len() - 101);
        assert_eq!(engine.feed(truncated, &cancel).await.unwrap(), UnitOutcome::Dropped);

        let third = engine.feed(wav(240, 24_000), &cancel).await.unwrap();
        assert_eq!(
            third,
            UnitOutcome::Scheduled {
                start: Duration::from_millis(10),
                duration: Duration::from_millis(10),
                first: false,
            }
        );
        assert_eq!(engine.units_dropped(), 1);
        assert_eq!(engine.units_seen(), 3);
    }

    #[tokio::test]
    async fn underrun_reseeds_cursor() {
        let output = Arc::new(RecordingOutput::new());
        let mut engine = engine(&output);
        let cancel = CancellationToken::new();

        engine.feed(wav(240, 24_000), &cancel).await.unwrap();
        // Clock runs past the end of queued audio before the next unit arrives
        output
            .wait_until(Duration::from_millis(40), &cancel)
            .await
            .unwrap();

        let outcome = engine.feed(wav(240, 24_000), &cancel).await.unwrap();
        assert!(matches!(
            outcome,
            UnitOutcome::Scheduled { start, .. } if start == Duration::from_millis(40)
        ));
    }

    #[tokio::test]
    async fn schedule_failure_follows_unit_policy() {
        let cancel = CancellationToken::new();

        let output = Arc::new(RecordingOutput::new());
        let mut engine = engine(&output);
        output.close();
        let err = engine.feed(wav(240, 24_000), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::FirstUnitDecode(_)));

        let output = Arc::new(RecordingOutput::new());
        let mut engine = self::engine(&output);
        engine.feed(wav(240, 24_000), &cancel).await.unwrap();
        output.close();
        assert_eq!(
            engine.feed(wav(240, 24_000), &cancel).await.unwrap(),
            UnitOutcome::Dropped
        );
        assert_eq!(engine.units_dropped(), 1);
        assert_eq!(engine.end(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancelled_decode_is_not_a_failure() {
        let output = Arc::new(RecordingOutput::new());
        let mut engine = engine(&output);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.feed(wav(240, 24_000), &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
