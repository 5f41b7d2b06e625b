//! Audio playback to speakers through `cpal`
//!
//! The device callback renders a sample-accurate timeline: each scheduled
//! unit is placed at a frame index and mixed in when the render position
//! reaches it. The render position is the output clock.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio_util::sync::CancellationToken;

use super::decode::DecodedAudio;
use super::output::{AudioOutput, OutputFactory, frames_at};
use crate::{Error, Result};

/// Preferred playback rate (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Input block size for resampling
const RESAMPLE_CHUNK: usize = 1024;

/// Poll interval while waiting for the clock
const CLOCK_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct PlacedUnit {
    start: u64,
    samples: Vec<f32>,
}

#[derive(Debug, Default)]
struct Timeline {
    rendered: u64,
    paused: bool,
    closed: bool,
    units: VecDeque<PlacedUnit>,
}

impl Timeline {
    /// Render one device buffer
    #[allow(clippy::cast_possible_truncation)]
    fn render(&mut self, data: &mut [f32], channels: usize) {
        if self.paused || self.closed {
            data.fill(0.0);
            return;
        }

        for frame in data.chunks_mut(channels) {
            let pos = self.rendered;
            let mut sample = 0.0;
            for unit in &self.units {
                if unit.start > pos {
                    break;
                }
                if let Some(s) = unit.samples.get((pos - unit.start) as usize) {
                    sample += s;
                }
            }
            frame.fill(sample.clamp(-1.0, 1.0));
            self.rendered += 1;
        }

        let rendered = self.rendered;
        self.units
            .retain(|u| u.start + u.samples.len() as u64 > rendered);
    }
}

/// Plays scheduled units on the default output device
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for CpalOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalOutput")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl CpalOutput {
    /// Open the default output device and start its (silent) stream
    ///
    /// The stream lives on a dedicated thread because `cpal::Stream` is not
    /// `Send` on every host.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open() -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let render_timeline = Arc::clone(&timeline);
        std::thread::Builder::new()
            .name("holly-audio-out".to_string())
            .spawn(move || {
                let stream = match build_stream(render_timeline) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Block until closed or the owner is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio output stream released");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::Audio("audio thread exited during setup".to_string()))??;

        Ok(Self {
            timeline,
            sample_rate,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Device sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn build_stream(timeline: Arc<Mutex<Timeline>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let preferred = SampleRate(PLAYBACK_SAMPLE_RATE);
    let config: StreamConfig = match device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .find(|c| {
            c.channels() <= 2 && c.min_sample_rate() <= preferred && c.max_sample_rate() >= preferred
        }) {
        Some(supported) => supported.with_sample_rate(preferred).config(),
        None => device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?
            .config(),
    };

    let channels = usize::from(config.channels);
    let rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels,
        "audio output initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match timeline.lock() {
                Ok(mut t) => t.render(data, channels),
                Err(_) => data.fill(0.0),
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    Ok((stream, rate))
}

#[async_trait]
impl AudioOutput for CpalOutput {
    fn now(&self) -> Duration {
        let rendered = self.timeline().rendered;
        let rate = u64::from(self.sample_rate);
        Duration::from_secs(rendered / rate)
            + Duration::from_nanos((rendered % rate) * 1_000_000_000 / rate)
    }

    fn schedule(&self, audio: DecodedAudio, at: Duration) -> Result<()> {
        let samples = resample(&audio.samples, audio.sample_rate, self.sample_rate)?;
        let mut timeline = self.timeline();
        if timeline.closed {
            return Err(Error::Audio("output closed".to_string()));
        }

        // A unit scheduled in the past starts immediately
        let start = (frames_at(at, self.sample_rate) as u64).max(timeline.rendered);
        let idx = timeline.units.partition_point(|u| u.start <= start);
        timeline.units.insert(idx, PlacedUnit { start, samples });
        Ok(())
    }

    fn pause(&self) {
        self.timeline().paused = true;
    }

    fn resume(&self) {
        self.timeline().paused = false;
    }

    fn is_paused(&self) -> bool {
        self.timeline().paused
    }

    async fn wait_until(&self, at: Duration, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.now() >= at {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(CLOCK_POLL) => {}
            }
        }
    }

    fn close(&self) {
        {
            let mut timeline = self.timeline();
            timeline.closed = true;
            timeline.units.clear();
        }
        if let Ok(mut shutdown) = self.shutdown.lock() {
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a [`CpalOutput`] on the default device
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalFactory;

impl OutputFactory for CpalFactory {
    fn open(&self) -> Result<Arc<dyn AudioOutput>> {
        Ok(Arc::new(CpalOutput::open()?))
    }
}

/// Resample mono samples between rates
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| Error::Audio(format!("failed to create resampler: {e}")))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as u64 * u64::from(to)).div_ceil(u64::from(from));
    #[allow(clippy::cast_possible_truncation)]
    let expected = expected as usize;
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0;
    while out.len() < expected + delay {
        let need = resampler.input_frames_next();
        let mut block = vec![0.0; need];
        if pos < samples.len() {
            let end = (pos + need).min(samples.len());
            block[..end - pos].copy_from_slice(&samples[pos..end]);
            pos = end;
        }
        let frames = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }

    Ok(out.into_iter().skip(delay).take(expected).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_renders_back_to_back_units() {
        let mut t = Timeline::default();
        t.units.push_back(PlacedUnit {
            start: 0,
            samples: vec![0.25; 3],
        });
        t.units.push_back(PlacedUnit {
            start: 3,
            samples: vec![0.5; 2],
        });

        let mut out = vec![9.0; 12];
        t.render(&mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.25, 0.25, 0.25, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(t.rendered, 6);
        assert!(t.units.is_empty());
    }

    #[test]
    fn paused_timeline_holds_clock() {
        let mut t = Timeline {
            paused: true,
            ..Default::default()
        };
        t.units.push_back(PlacedUnit {
            start: 0,
            samples: vec![1.0; 4],
        });

        let mut out = vec![9.0; 4];
        t.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(t.rendered, 0);
        assert_eq!(t.units.len(), 1);
    }

    #[test]
    fn resample_length_matches_ratio() {
        let input = vec![0.1; 2205];
        let out = resample(&input, 22_050, 24_000).unwrap();
        assert_eq!(out.len(), 2400);

        let same = resample(&input, 24_000, 24_000).unwrap();
        assert_eq!(same.len(), input.len());
    }
}
