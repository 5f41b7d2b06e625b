//! Streaming speech playback
//!
//! ```text
//!  text ─▶ TextPreprocessor ─▶ SynthesisClient ─▶ Demuxer ─▶ ScheduleEngine ─▶ AudioOutput
//!                                   │                            │
//!                                   └──────── SpeechPipeline (fallback ladder) ──────┘
//!                                                   │
//!                                          SpeechController (one active session)
//! ```
//!
//! The ladder prefers framed streaming, then raw streaming, then decoding
//! the whole response as one blob, then (if enabled) local synthesis of the
//! untruncated text.

pub mod controller;
pub mod decode;
pub mod engine;
pub mod frame;
pub mod ladder;
pub mod local;
pub mod negotiate;
pub mod output;
pub mod playback;
pub mod session;

pub use controller::{SessionHandle, SessionOutcome, SpeechController};
pub use decode::{AudioDecoder, ContainerDecoder, DecodedAudio, encode_wav};
pub use engine::{ScheduleEngine, UnitOutcome};
pub use frame::{Demuxer, FRAMING_HEADER, Framing, LENGTH_PREFIXED, encode_frame};
pub use ladder::SpeechPipeline;
pub use local::{CommandSynthesizer, LocalSynthesizer};
pub use negotiate::{AudioResponse, SpeechRequest, SynthesisClient};
pub use output::{AudioOutput, OutputFactory, RecordingFactory, RecordingOutput, ScheduledUnit};
pub use playback::{CpalFactory, CpalOutput};
pub use session::{
    FallbackLevel, FallbackState, Phase, PlaybackPath, PlaybackSession, SessionId, SpeechEvent,
    SpeechStatus,
};
