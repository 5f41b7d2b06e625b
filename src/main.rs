use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use holly_speech::speech::{
    AudioOutput, CpalFactory, CpalOutput, DecodedAudio, OutputFactory, RecordingFactory,
    SessionOutcome, SpeechEvent, encode_wav,
};
use holly_speech::{Config, SpeechController};

/// Holly - streaming speech playback for the Holly voice chat client
#[derive(Parser)]
#[command(name = "holly", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Synthesis endpoint (overrides config)
    #[arg(long, global = true)]
    tts_url: Option<String>,

    /// Fetch display text before audio
    #[arg(long, global = true)]
    two_phase: bool,

    /// Fall back to the local synthesizer when the backend fails
    #[arg(long, global = true)]
    local_fallback: bool,

    /// Summarize text via the LLM before speaking
    #[arg(long, global = true)]
    summarize: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Speak text through the synthesis backend
    Say {
        /// Text to speak
        text: String,
        /// Play into a virtual output instead of the speakers
        #[arg(long)]
        dry_run: bool,
        /// Write the played audio to a WAV file (implies --dry-run)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,holly_speech=info",
        1 => "info,holly_speech=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = cli.tts_url {
        config.speech.tts_url = url;
    }
    config.speech.two_phase |= cli.two_phase;
    config.speech.local_fallback |= cli.local_fallback;
    config.speech.summarize |= cli.summarize;

    match cli.command {
        Command::Say { text, dry_run, out } => say(&config, &text, dry_run, out).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Speak one piece of text, stopping cleanly on Ctrl-C
async fn say(config: &Config, text: &str, dry_run: bool, out: Option<PathBuf>) -> anyhow::Result<()> {
    let recorder = (dry_run || out.is_some()).then(RecordingFactory::new);
    let outputs: Arc<dyn OutputFactory> = match &recorder {
        Some(recorder) => Arc::new(recorder.clone()),
        None => Arc::new(CpalFactory),
    };

    let controller = SpeechController::from_config(config, outputs)?;

    let mut events = controller.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SpeechEvent::FallingBack { level, reason, .. } => {
                    eprintln!("falling back to {level}: {reason}");
                }
                SpeechEvent::Error { message, .. } => eprintln!("error: {message}"),
                SpeechEvent::Started { .. } | SpeechEvent::Finished { .. } => {}
            }
        }
    });

    let Some(handle) = controller.speak(text).await else {
        anyhow::bail!("nothing to speak");
    };

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            controller.stop().await;
            SessionOutcome::Cancelled
        }
    };

    if let Some(display) = controller.status().display_text {
        println!("{display}");
    }
    drop(controller);
    printer.abort();

    match outcome {
        SessionOutcome::Completed { path } => {
            tracing::debug!(?path, "done");
            if let (Some(recorder), Some(out)) = (&recorder, &out) {
                write_recording(recorder, out)?;
            }
            Ok(())
        }
        SessionOutcome::Cancelled => Ok(()),
        SessionOutcome::Failed { message } => anyhow::bail!(message),
    }
}

/// Write the last recorded output's mix to `path`
fn write_recording(recorder: &RecordingFactory, path: &Path) -> anyhow::Result<()> {
    let mix = recorder
        .opened()
        .iter()
        .rev()
        .find_map(|output| output.mixdown())
        .ok_or_else(|| anyhow::anyhow!("no audio was played"))?;

    std::fs::write(path, encode_wav(&mix.samples, mix.sample_rate)?)?;
    println!(
        "Wrote {:.2}s of audio to {}",
        mix.duration().as_secs_f64(),
        path.display()
    );
    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let output = CpalOutput::open()?;

    // 2 seconds of 440Hz at 24kHz
    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    let tone = DecodedAudio {
        samples,
        sample_rate,
    };
    let start = output.now();
    let end = start + tone.duration() + Duration::from_millis(100);
    output.schedule(tone, start)?;
    output.wait_until(end, &CancellationToken::new()).await?;
    output.close();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}
