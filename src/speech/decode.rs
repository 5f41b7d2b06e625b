//! Decoding of self-contained audio units (WAV or MP3) into PCM

use std::io::Cursor;
use std::time::Duration;

use crate::{Error, Result};

/// One decoded unit: mono `f32` samples at a known rate
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length of the unit
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let rate = u64::from(self.sample_rate);
        let n = self.samples.len() as u64;
        Duration::from_secs(n / rate) + Duration::from_nanos((n % rate) * 1_000_000_000 / rate)
    }
}

/// Turns one encoded unit into playable audio
pub trait AudioDecoder: Send + Sync {
    /// Decode a complete unit
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the unit is not a complete, decodable container
    fn decode(&self, unit: &[u8]) -> Result<DecodedAudio>;
}

/// Sniffs the container and decodes WAV via `hound`, MPEG audio via `minimp3`
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerDecoder;

impl AudioDecoder for ContainerDecoder {
    fn decode(&self, unit: &[u8]) -> Result<DecodedAudio> {
        if unit.is_empty() {
            return Err(Error::Decode("empty unit".to_string()));
        }
        if is_wav(unit) {
            decode_wav(unit)
        } else {
            decode_mp3(unit)
        }
    }
}

fn is_wav(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

/// Decode a RIFF/WAVE buffer, down-mixing to mono
fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Decode(format!("WAV header: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, _) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(format!("WAV data: {e}")))?,
        (hound::SampleFormat::Int, bits) if bits <= 16 => {
            let scale = f32::from(1u16 << (bits - 1));
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(format!("WAV data: {e}")))?
        }
        (hound::SampleFormat::Int, bits) => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    #[allow(clippy::cast_precision_loss)]
                    s.map(|v| v as f32 / scale)
                })
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(format!("WAV data: {e}")))?
        }
    };

    let samples = downmix(&interleaved, channels);
    if samples.is_empty() {
        return Err(Error::Decode("WAV contains no samples".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Decode MPEG audio frames, tolerating leading tags
fn decode_mp3(data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let rate = u32::try_from(frame.sample_rate)
                    .map_err(|_| Error::Decode("MP3 frame with negative sample rate".to_string()))?;
                if sample_rate == 0 {
                    sample_rate = rate;
                } else if rate != sample_rate {
                    return Err(Error::Decode(format!(
                        "MP3 sample rate changed mid-unit ({sample_rate} -> {rate})"
                    )));
                }

                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&pcm, frame.channels.max(1)));
            }
            Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Decode("no audio frames in unit".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Average interleaved channels down to mono
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let n = channels as f32;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / n)
        .collect()
}

/// Encode mono `f32` samples as 16-bit PCM WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
