//! Shared test utilities

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use holly_speech::speech::{
    FRAMING_HEADER, FallbackLevel, LENGTH_PREFIXED, LocalSynthesizer, OutputFactory, RecordingFactory,
    SpeechEvent, SpeechPipeline, SynthesisClient, encode_frame,
};
use holly_speech::{SpeechController, TextPreprocessor};

/// Sample rate of generated test audio
pub const TEST_RATE: u32 = 24_000;

/// What the fake backend answers with
#[derive(Debug, Clone)]
pub enum Reply {
    /// Audio body sent as `chunks`, pausing `delay` before each one
    Audio {
        framed: bool,
        chunks: Vec<Vec<u8>>,
        delay: Duration,
        /// Keep the body open after the last chunk
        hang: bool,
    },
    /// Non-audio response with an explicit status
    Status {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// 200 JSON body (display-text phase)
    Json(Value),
}

impl Reply {
    /// Framed body delivered in the given network chunks
    pub fn framed(chunks: Vec<Vec<u8>>) -> Self {
        Self::Audio {
            framed: true,
            chunks,
            delay: Duration::from_millis(5),
            hang: false,
        }
    }

    /// Raw body delivered in the given network chunks
    pub fn raw(chunks: Vec<Vec<u8>>) -> Self {
        Self::Audio {
            framed: false,
            chunks,
            delay: Duration::from_millis(20),
            hang: false,
        }
    }

    /// Same body, but the connection stays open after the last chunk
    #[must_use]
    pub fn hanging(self) -> Self {
        match self {
            Self::Audio {
                framed,
                chunks,
                delay,
                ..
            } => Self::Audio {
                framed,
                chunks,
                delay,
                hang: true,
            },
            other => other,
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Self::Audio {
                framed,
                chunks,
                delay,
                hang,
            } => {
                let body = futures::stream::iter(chunks).then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, std::convert::Infallible>(Bytes::from(chunk))
                });
                let body = if hang {
                    body.chain(futures::stream::pending::<Result<Bytes, std::convert::Infallible>>())
                        .boxed()
                } else {
                    body.boxed()
                };

                let mut response = Response::new(Body::from_stream(body));
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
                if framed {
                    headers.insert(FRAMING_HEADER, HeaderValue::from_static(LENGTH_PREFIXED));
                }
                response
            }
            Self::Status {
                status,
                content_type,
                body,
            } => (
                StatusCode::from_u16(status).unwrap(),
                [(header::CONTENT_TYPE, content_type)],
                body,
            )
                .into_response(),
            Self::Json(value) => Json(value).into_response(),
        }
    }
}

type ReplyFn = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

#[derive(Clone)]
struct Shared {
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
    reply: ReplyFn,
}

/// In-process synthesis backend bound to an ephemeral port
pub struct FakeBackend {
    pub url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeBackend {
    /// Start a backend that answers every request through `reply`
    pub async fn start<F>(reply: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let shared = Shared {
            hits: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            reply: Arc::new(reply),
        };

        let app = axum::Router::new()
            .route("/tts", post(tts))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake backend");
        let addr = listener.local_addr().expect("no local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            url: format!("http://{addr}/tts"),
            hits: shared.hits,
            requests: shared.requests,
        }
    }

    /// Start a backend that always gives the same answer
    pub async fn always(reply: Reply) -> Self {
        Self::start(move |_| reply.clone()).await
    }

    /// Number of requests received
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// JSON bodies received, in order
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn tts(State(shared): State<Shared>, Json(body): Json<Value>) -> Response {
    shared.hits.fetch_add(1, Ordering::SeqCst);
    shared.requests.lock().unwrap().push(body.clone());
    (shared.reply)(&body).into_response()
}

/// Mono 16-bit WAV holding `samples` samples of a quiet tone
pub fn wav(samples: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TEST_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..samples {
            let t = i as f32 / TEST_RATE as f32;
            let s = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.2;
            writer.write_sample((s * f32::from(i16::MAX)) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Length-prefix every payload and concatenate
pub fn framed(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut out = BytesMut::new();
    for payload in payloads {
        encode_frame(payload, &mut out);
    }
    out.to_vec()
}

/// Cut `bytes` at the given offsets
pub fn split(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        chunks.push(bytes[start..cut].to_vec());
        start = cut;
    }
    chunks.push(bytes[start..].to_vec());
    chunks
}

/// Duration of `samples` samples at [`TEST_RATE`]
pub fn duration_of(samples: usize) -> Duration {
    Duration::from_nanos(samples as u64 * 1_000_000_000 / u64::from(TEST_RATE))
}

/// Local synthesizer that records what it was asked to say
#[derive(Debug, Default)]
pub struct RecordingSynth {
    spoken: Mutex<Vec<String>>,
    fail: bool,
    /// Keep speaking until cancelled
    block: bool,
}

impl RecordingSynth {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn blocking() -> Self {
        Self {
            block: true,
            ..Self::default()
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalSynthesizer for RecordingSynth {
    async fn speak(&self, text: &str, cancel: &CancellationToken) -> holly_speech::Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.block {
            cancel.cancelled().await;
            return Err(holly_speech::Error::Cancelled);
        }
        if self.fail {
            Err(holly_speech::Error::LocalSynthesis("no voices installed".to_string()))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Controller options for tests
#[derive(Default)]
pub struct Setup {
    pub max_chars: Option<usize>,
    pub two_phase: bool,
    pub local: Option<Arc<dyn LocalSynthesizer>>,
}

/// Controller talking to `backend` and playing into `outputs`
pub fn controller(backend: &FakeBackend, outputs: &RecordingFactory, setup: Setup) -> SpeechController {
    let factory: Arc<dyn OutputFactory> = Arc::new(outputs.clone());
    let mut pipeline = SpeechPipeline::new(SynthesisClient::new(&backend.url), factory)
        .two_phase(setup.two_phase);
    if let Some(local) = setup.local {
        pipeline = pipeline.with_local(local);
    }
    SpeechController::new(TextPreprocessor::new(setup.max_chars.unwrap_or(1000)), pipeline)
}

/// Wait (bounded) for the next `Started` event
pub async fn wait_started(events: &mut tokio::sync::broadcast::Receiver<SpeechEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SpeechEvent::Started { .. } = events.recv().await.unwrap() {
                return;
            }
        }
    })
    .await
    .expect("speech never started");
}

/// Wait (bounded) for a `FallingBack` event naming `level`
pub async fn wait_falling_back(
    events: &mut tokio::sync::broadcast::Receiver<SpeechEvent>,
    level: FallbackLevel,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SpeechEvent::FallingBack { level: seen, .. } = events.recv().await.unwrap() {
                if seen == level {
                    return;
                }
            }
        }
    })
    .await
    .expect("never fell back");
}

/// Only the `FallingBack` levels, in order
pub fn fallback_levels(events: &[SpeechEvent]) -> Vec<FallbackLevel> {
    events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::FallingBack { level, .. } => Some(*level),
            _ => None,
        })
        .collect()
}

/// Drain every event already broadcast
pub fn drain_events(events: &mut tokio::sync::broadcast::Receiver<SpeechEvent>) -> Vec<SpeechEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
