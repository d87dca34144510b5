use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use relay_media_stream::capture::HttpStreamCapturer;
use relay_media_stream::config::PipelineConfig;
use relay_media_stream::http::HttpBackend;
use relay_media_stream::playback::{PlaybackEngine, ProgressiveSink};
use relay_media_stream::record::Recorder;
use relay_media_stream::resume::FileResumeStore;
use relay_media_stream::serve::run_backend;
use relay_media_stream::sinks::{FileMonolithicSink, FileProgressiveSink};
use relay_media_stream::upload::{UploadEvent, UploadQueue};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Record a live stream as ordered segments, upload them resumably, and play recordings back in order"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a live stream and upload its segments
    Record {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Live stream URL (overrides recorder.source_url)
        #[arg(short, long)]
        url: Option<String>,

        /// Seconds to record; records until Ctrl-C when omitted
        #[arg(short, long)]
        duration: Option<u64>,

        /// Live session the recording belongs to
        #[arg(short, long, default_value = "local")]
        session: String,
    },
    /// Flush and finalize an interrupted recording
    Resume {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Recording to resume (defaults to the pending resume marker)
        recording_id: Option<String>,

        /// Live session to finalize under (defaults to the one stored with
        /// the pending resume marker)
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Play a finalized recording into a file
    Play {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Manifest URL returned by finalize
        manifest_url: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Skip progressive append and download the whole stream
        #[arg(long)]
        fallback: bool,
    },
    /// Run the in-memory development backend
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Bearer token required on API requests
        #[arg(long)]
        auth_token: Option<String>,
    },
}

fn build_queue(backend: &Arc<HttpBackend>, config: &PipelineConfig) -> UploadQueue {
    UploadQueue::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        config.upload.clone(),
    )
}

fn build_recorder(
    backend: &Arc<HttpBackend>,
    queue: UploadQueue,
    config: &PipelineConfig,
) -> Result<Recorder, Box<dyn std::error::Error>> {
    let resume_store = Arc::new(FileResumeStore::new(&config.state_dir)?);
    Ok(Recorder::new(
        backend.clone(),
        backend.clone(),
        queue,
        resume_store,
        config.recorder.clone(),
    ))
}

/// Log permanent failures and progress as the queue reports them
fn spawn_progress_logger(mut events: broadcast::Receiver<UploadEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UploadEvent::Uploaded {
                    seq, checkpoint, ..
                }) => info!("Segment {} uploaded (checkpoint {})", seq, checkpoint),
                Ok(UploadEvent::Failed { seq, error, .. }) => {
                    warn!("Segment {} could not be uploaded: {}", seq, error)
                }
                Ok(UploadEvent::Retrying { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Progress log skipped {} event(s)", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn record(
    config_path: PathBuf,
    url: Option<String>,
    duration: Option<u64>,
    session: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(&config_path)?;
    let source_url = url
        .or_else(|| config.recorder.source_url.clone())
        .ok_or("No live stream URL: pass --url or set recorder.source_url")?;

    let backend = Arc::new(HttpBackend::new(
        &config.backend_url,
        config.auth_token.clone(),
        config.upload.attempt_timeout(),
    )?);
    let queue = build_queue(&backend, &config);
    spawn_progress_logger(queue.subscribe());
    let mut recorder = build_recorder(&backend, queue, &config)?;

    if let Some(pending) = recorder.pending_recording() {
        println!(
            "Recording {} was interrupted; run `resume` to finalize it",
            pending
        );
    }

    let client = reqwest::Client::builder()
        .connect_timeout(config.upload.attempt_timeout())
        .build()?;
    let capturer = HttpStreamCapturer::connect(&client, &source_url).await?;
    let recording = recorder.start(Box::new(capturer), &session).await?;
    println!("Recording {} ({})", recording.id, recording.mime_type);

    match duration {
        Some(secs) => {
            println!("Recording for {} seconds...", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => println!("Interrupted, stopping"),
            }
        }
        None => {
            println!("Recording until Ctrl-C...");
            tokio::signal::ctrl_c().await?;
        }
    }

    println!(
        "Stopping after {} segment(s), waiting for uploads...",
        recorder.segments_captured()
    );
    let finalized = recorder.stop().await?;
    println!("Manifest: {}", finalized.manifest_url);
    Ok(())
}

async fn resume(
    config_path: PathBuf,
    recording_id: Option<String>,
    session: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(&config_path)?;
    let backend = Arc::new(HttpBackend::new(
        &config.backend_url,
        config.auth_token.clone(),
        config.upload.attempt_timeout(),
    )?);
    let queue = build_queue(&backend, &config);
    spawn_progress_logger(queue.subscribe());
    let mut recorder = build_recorder(&backend, queue, &config)?;

    let recording_id = recording_id
        .or_else(|| recorder.pending_recording())
        .ok_or("No recording id given and no pending recording found")?;
    let recording = recorder
        .resume(&recording_id, session.as_deref())
        .await?;
    println!(
        "Resumed {} (checkpoint {:?})",
        recording.id, recording.last_seq_uploaded
    );
    let finalized = recorder.stop().await?;
    println!("Manifest: {}", finalized.manifest_url);
    Ok(())
}

async fn play(
    config_path: PathBuf,
    manifest_url: String,
    output: PathBuf,
    force_fallback: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(&config_path)?;
    let backend = Arc::new(HttpBackend::new(
        &config.backend_url,
        config.auth_token.clone(),
        config.playback.attempt_timeout(),
    )?);
    let (mut engine, handle) = PlaybackEngine::new(backend, config.playback.clone());

    let cancel = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut fallback = FileMonolithicSink::new(&output);
    let mut progressive = if force_fallback {
        None
    } else {
        let nominal_ms = config.recorder.segment_duration().as_millis() as u64;
        Some(FileProgressiveSink::create(&output, nominal_ms).await?)
    };
    let outcome = engine
        .play(
            &manifest_url,
            progressive.as_mut().map(|s| s as &mut dyn ProgressiveSink),
            &mut fallback,
        )
        .await?;
    println!("Wrote {} via {:?} playback", output.display(), outcome);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Record {
            config,
            url,
            duration,
            session,
        } => record(config, url, duration, session).await,
        Command::Resume {
            config,
            recording_id,
            session,
        } => resume(config, recording_id, session).await,
        Command::Play {
            config,
            manifest_url,
            output,
            fallback,
        } => play(config, manifest_url, output, fallback).await,
        Command::Serve { port, auth_token } => run_backend(port, auth_token).await,
    }
}
