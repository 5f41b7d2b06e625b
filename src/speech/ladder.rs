//! Fallback ladder: framed or raw streaming, whole-response blob, local synthesis
//!
//! Each level owns its output and cancellation token outright and releases
//! both before the next level starts.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::decode::{AudioDecoder, ContainerDecoder};
use super::engine::{ScheduleEngine, UnitOutcome, decode_cancellable};
use super::frame::{Demuxer, Framing};
use super::local::LocalSynthesizer;
use super::negotiate::{ByteStream, SpeechRequest, SynthesisClient};
use super::output::{AudioOutput, OutputFactory};
use super::session::{FallbackLevel, OutputRelease, Phase, PlaybackPath, PlaybackSession};
use crate::text::PreparedText;
use crate::{Error, Result};

/// Exclusive hold on one output for the duration of a ladder level
///
/// Dropping the lease closes the output and clears it from the pause slot.
struct OutputLease {
    output: Arc<dyn AudioOutput>,
    release: OutputRelease,
}

impl OutputLease {
    fn open(outputs: &dyn OutputFactory, session: &PlaybackSession) -> Result<Self> {
        let output = outputs.open()?;
        if !session.attach_output(&output) {
            output.close();
            return Err(Error::Cancelled);
        }
        Ok(Self {
            output,
            release: session.output_release(),
        })
    }

    fn output(&self) -> Arc<dyn AudioOutput> {
        Arc::clone(&self.output)
    }
}

impl Drop for OutputLease {
    fn drop(&mut self) {
        self.release.release(&self.output);
        self.output.close();
    }
}

/// Bytes read before the first unit resolved, plus the unread body
struct BlobSource {
    framing: Framing,
    replay: BytesMut,
    rest: Option<ByteStream>,
}

impl BlobSource {
    /// The audio payload of the complete body, with any frame prefixes removed
    fn payload(framing: Framing, wire: BytesMut) -> (BytesMut, usize) {
        if framing == Framing::Raw {
            return (wire, 0);
        }
        let mut demux = Demuxer::new(framing);
        let mut payload = BytesMut::with_capacity(wire.len());
        for unit in demux.push(wire.freeze()) {
            payload.extend_from_slice(&unit);
        }
        (payload, demux.finish())
    }
}

/// Drives one session down the fallback ladder
pub struct SpeechPipeline {
    client: SynthesisClient,
    decoder: Arc<dyn AudioDecoder>,
    outputs: Arc<dyn OutputFactory>,
    local: Option<Arc<dyn LocalSynthesizer>>,
    two_phase: bool,
    stream: bool,
}

impl std::fmt::Debug for SpeechPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechPipeline")
            .field("url", &self.client.url())
            .field("local", &self.local.as_ref().map(|l| l.name().to_string()))
            .field("two_phase", &self.two_phase)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl SpeechPipeline {
    /// Create a pipeline with the default container decoder, streaming on,
    /// and no local fallback
    #[must_use]
    pub fn new(client: SynthesisClient, outputs: Arc<dyn OutputFactory>) -> Self {
        Self {
            client,
            decoder: Arc::new(ContainerDecoder),
            outputs,
            local: None,
            two_phase: false,
            stream: true,
        }
    }

    /// Replace the unit decoder
    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<dyn AudioDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Enable the local synthesis level
    #[must_use]
    pub fn with_local(mut self, local: Arc<dyn LocalSynthesizer>) -> Self {
        self.local = Some(local);
        self
    }

    /// Request display text before audio
    #[must_use]
    pub const fn two_phase(mut self, enabled: bool) -> Self {
        self.two_phase = enabled;
        self
    }

    /// Ask the backend for a streamed body
    #[must_use]
    pub const fn stream(mut self, enabled: bool) -> Self {
        self.stream = enabled;
        self
    }

    /// Whether the local synthesis level is enabled
    #[must_use]
    pub const fn has_local_fallback(&self) -> bool {
        self.local.is_some()
    }

    /// Play `text`, descending the ladder until a level succeeds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the session was stopped, the network
    /// error when local fallback is disabled, [`Error::StreamInterrupted`] if
    /// the body failed after audio started, or [`Error::Exhausted`] if local
    /// synthesis failed as well
    pub async fn run(&self, session: &mut PlaybackSession, text: &PreparedText) -> Result<PlaybackPath> {
        let network_err = match self.network(session, text).await {
            Ok(path) => return Ok(path),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => e,
        };

        // A stopped session can fail on its closed output before it sees the token
        if session.cancel_token().is_cancelled() {
            tracing::debug!(session = %session.id(), error = %network_err, "ignoring error after cancellation");
            return Err(Error::Cancelled);
        }

        // Anything already audible would be repeated by local speech
        if session.has_started() {
            return Err(network_err);
        }

        let Some(local) = &self.local else {
            return Err(network_err);
        };
        if session.fallback().local_attempted {
            return Err(network_err);
        }

        session.falling_back(FallbackLevel::Local, &network_err.user_message());
        match self.local(session, local.as_ref(), &text.original).await {
            Ok(()) => Ok(PlaybackPath::Local),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                tracing::error!(
                    session = %session.id(),
                    synthesizer = local.name(),
                    error = %e,
                    "local synthesis failed"
                );
                Err(Error::Exhausted(Box::new(network_err)))
            }
        }
    }

    /// Levels 1-3: streaming decode, then blob on first-unit failure
    async fn network(&self, session: &mut PlaybackSession, text: &PreparedText) -> Result<PlaybackPath> {
        let cancel = session.cancel_token().child_token();
        let request = SpeechRequest {
            text: text.text.clone(),
            two_phase: self.two_phase,
            wants_stream: self.stream,
        };

        session.set_phase(Phase::Negotiating);
        let response = self.client.request_audio(&request, &cancel).await?;
        if let Some(display) = &response.display_text {
            session.set_display_text(display);
        }

        session.set_phase(Phase::Streaming);
        let framing = response.framing;
        tracing::info!(session = %session.id(), %framing, "streaming speech");

        match self.stream_level(session, response.body, framing, &cancel).await? {
            Streamed::Done => Ok(PlaybackPath::Streamed { framing }),
            Streamed::NeedsBlob { source, reason } => {
                self.blob(session, source, &reason, &cancel).await?;
                Ok(PlaybackPath::Blob)
            }
        }
    }

    /// Levels 1-2: demultiplex and schedule units as they arrive
    async fn stream_level(
        &self,
        session: &mut PlaybackSession,
        mut body: ByteStream,
        framing: Framing,
        cancel: &CancellationToken,
    ) -> Result<Streamed> {
        let lease = OutputLease::open(self.outputs.as_ref(), session)?;
        let mut engine = ScheduleEngine::new(Arc::clone(&self.decoder), lease.output());
        let mut demux = Demuxer::new(framing);
        let mut replay = Some(BytesMut::new());

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = body.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) if engine.started() => {
                    tracing::warn!(session = %session.id(), error = %e, "speech stream failed mid-playback");
                    engine.drain(cancel).await?;
                    return Err(Error::StreamInterrupted(e.to_string()));
                }
                Some(Err(e)) => return Err(e),
            };

            if let Some(buf) = replay.as_mut() {
                buf.extend_from_slice(&chunk);
            }

            for unit in demux.push(chunk) {
                match engine.feed(unit, cancel).await {
                    Ok(UnitOutcome::Scheduled { first: true, .. }) => {
                        replay = None;
                        session.started();
                    }
                    Ok(_) => {}
                    Err(Error::FirstUnitDecode(reason)) => {
                        return Ok(Streamed::NeedsBlob {
                            source: BlobSource {
                                framing,
                                replay: replay.take().unwrap_or_default(),
                                rest: Some(body),
                            },
                            reason,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let discarded = demux.finish();
        if discarded > 0 {
            tracing::debug!(session = %session.id(), bytes = discarded, "discarding incomplete trailing frame");
        }

        if engine.units_seen() == 0 {
            let replay = replay.take().unwrap_or_default();
            if replay.is_empty() {
                return Err(Error::Decode("empty audio response".to_string()));
            }
            return Ok(Streamed::NeedsBlob {
                source: BlobSource {
                    framing,
                    replay,
                    rest: None,
                },
                reason: "no complete unit in response".to_string(),
            });
        }

        engine.drain(cancel).await?;
        tracing::info!(
            session = %session.id(),
            units = engine.units_seen(),
            dropped = engine.units_dropped(),
            "speech stream finished"
        );
        Ok(Streamed::Done)
    }

    /// Level 3: decode the complete response once and play it
    async fn blob(
        &self,
        session: &mut PlaybackSession,
        source: BlobSource,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        session.falling_back(FallbackLevel::Blob, reason);

        let mut whole = source.replay;
        if let Some(mut rest) = source.rest {
            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    next = rest.next() => next,
                };
                match next {
                    Some(chunk) => whole.extend_from_slice(&chunk?),
                    None => break,
                }
            }
        }

        let (payload, discarded) = BlobSource::payload(source.framing, whole);
        if discarded > 0 {
            tracing::debug!(session = %session.id(), bytes = discarded, "discarding incomplete trailing frame");
        }
        tracing::debug!(session = %session.id(), bytes = payload.len(), "decoding whole response");
        let audio = decode_cancellable(Arc::clone(&self.decoder), payload.freeze(), cancel).await?;

        let lease = OutputLease::open(self.outputs.as_ref(), session)?;
        let output = lease.output();
        let start = output.now();
        let end = start + audio.duration();
        output.schedule(audio, start)?;
        session.started();

        output.wait_until(end, cancel).await
    }

    /// Level 4: speak the untruncated text on-device
    async fn local(
        &self,
        session: &mut PlaybackSession,
        local: &dyn LocalSynthesizer,
        text: &str,
    ) -> Result<()> {
        let cancel = session.cancel_token().child_token();
        tracing::info!(session = %session.id(), synthesizer = local.name(), "speaking locally");
        session.started();
        local.speak(text, &cancel).await
    }
}

enum Streamed {
    Done,
    NeedsBlob { source: BlobSource, reason: String },
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::post;

    use super::*;
    use crate::speech::frame::encode_frame;
    use crate::speech::output::RecordingFactory;
    use crate::speech::session::{Reporter, SessionId, SpeechEvent};

    /// Output factory that stops the session and then fails, like a retired output
    struct ClosingFactory(CancellationToken);

    impl OutputFactory for ClosingFactory {
        fn open(&self) -> Result<Arc<dyn AudioOutput>> {
            self.0.cancel();
            Err(Error::Audio("output closed".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingSynth(AtomicUsize);

    #[async_trait]
    impl LocalSynthesizer for CountingSynth {
        async fn speak(&self, _text: &str, _cancel: &CancellationToken) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    async fn serve_bytes(body: &'static [u8]) -> String {
        let app = axum::Router::new().route("/tts", post(move || async move { Body::from(body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/tts")
    }

    #[test]
    fn blob_payload_strips_frame_prefixes() {
        let mut wire = BytesMut::new();
        encode_frame(b"RIFF", &mut wire);
        encode_frame(b"WAVE", &mut wire);
        wire.extend_from_slice(&[0, 0, 0, 9, 1]);

        let (payload, discarded) = BlobSource::payload(Framing::LengthPrefixed, wire);
        assert_eq!(&payload[..], b"RIFFWAVE");
        assert_eq!(discarded, 5);

        let raw = BytesMut::from(&b"\0\0\0\x04RIFF"[..]);
        let (payload, discarded) = BlobSource::payload(Framing::Raw, raw.clone());
        assert_eq!(payload, raw);
        assert_eq!(discarded, 0);
    }

    #[tokio::test]
    async fn error_after_stop_does_not_reach_local_level() {
        let url = serve_bytes(b"audio").await;
        let reporter = Arc::new(Reporter::new());
        let id = SessionId::new();
        reporter.activate(id);
        let mut events = reporter.subscribe_events();

        let cancel = CancellationToken::new();
        let synth = Arc::new(CountingSynth::default());
        let pipeline = SpeechPipeline::new(
            SynthesisClient::new(&url),
            Arc::new(ClosingFactory(cancel.clone())),
        )
        .with_local(Arc::clone(&synth) as Arc<dyn LocalSynthesizer>);

        let mut session = PlaybackSession::new(id, cancel, Arc::clone(&reporter));
        let text = PreparedText {
            text: "hello".to_string(),
            original: "hello".to_string(),
            truncated: false,
        };

        let err = pipeline.run(&mut session, &text).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(synth.0.load(Ordering::SeqCst), 0);
        assert!(!session.fallback().local_attempted);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SpeechEvent::FallingBack { .. }));
        }
    }

    #[test]
    fn lease_is_refused_for_inactive_session() {
        let reporter = Arc::new(Reporter::new());
        let session = PlaybackSession::new(
            SessionId::new(),
            CancellationToken::new(),
            reporter,
        );
        let factory = RecordingFactory::new();

        let err = OutputLease::open(&factory, &session).err().unwrap();
        assert!(err.is_cancellation());
        assert!(factory.opened()[0].is_closed());
    }

    #[test]
    fn dropped_lease_closes_output() {
        let reporter = Arc::new(Reporter::new());
        let id = SessionId::new();
        reporter.activate(id);
        let session = PlaybackSession::new(id, CancellationToken::new(), Arc::clone(&reporter));
        let factory = RecordingFactory::new();

        let lease = OutputLease::open(&factory, &session).unwrap();
        assert_eq!(reporter.toggle_pause(), Some(true));
        drop(lease);

        assert!(factory.opened()[0].is_closed());
        assert_eq!(reporter.toggle_pause(), None);
        assert!(!reporter.status().is_paused);
    }
}
