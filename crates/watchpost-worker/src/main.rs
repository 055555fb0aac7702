//! `watchpost` command line: run an analysis session against a file, a
//! camera or a network stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use watchpost_firestore::{FirestoreClient, IncidentRepository, INCIDENTS_COLLECTION};
use watchpost_media::{check_ffmpeg, check_ffprobe, FfmpegFileSource, FfmpegLiveSource, FrameSource};
use watchpost_ml_client::GeminiVisionClient;
use watchpost_models::{AnalysisMode, SessionEvent};
use watchpost_worker::config::interval;
use watchpost_worker::{
    FirestoreIncidentStore, Notifier, PersistThenNotify, SessionManager, WatchpostConfig,
    WebhookNotifier,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sample video frames and report deduplicated incidents")]
struct Args {
    /// Print session events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyse a recorded video file
    Upload {
        file: PathBuf,
        /// Seconds between sampled frames
        #[arg(long)]
        interval: Option<f64>,
    },
    /// Analyse the local camera until Ctrl-C
    Live {
        #[arg(long, env = "WATCHPOST_CAMERA_DEVICE", default_value = default_camera())]
        device: String,
        /// Seconds between captures
        #[arg(long)]
        interval: Option<f64>,
    },
    /// Analyse a network stream until Ctrl-C
    External {
        url: String,
        /// Seconds between captures
        #[arg(long)]
        interval: Option<f64>,
    },
    /// Check that ffmpeg and required settings are available
    Selfcheck,
}

const fn default_camera() -> &'static str {
    if cfg!(target_os = "macos") {
        "0"
    } else if cfg!(target_os = "windows") {
        "video=Integrated Camera"
    } else {
        "/dev/video0"
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("watchpost=info".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = WatchpostConfig::from_env().context("invalid watchpost configuration")?;

    let (mode, source, interval_override) = match args.command {
        Command::Selfcheck => return selfcheck(),
        Command::Upload { file, interval: secs } => {
            if !file.exists() {
                bail!("video file not found: {}", file.display());
            }
            let source = FfmpegFileSource::new(&file)
                .with_metadata_timeout(config.metadata_timeout.as_secs().max(1));
            (AnalysisMode::Upload, FrameSource::seekable(source), secs)
        }
        Command::Live { device, interval: secs } => (
            AnalysisMode::Live,
            FrameSource::live(FfmpegLiveSource::camera(device)),
            secs,
        ),
        Command::External { url, interval: secs } => (
            AnalysisMode::External,
            FrameSource::live(FfmpegLiveSource::stream(url)),
            secs,
        ),
    };
    let interval_override: Option<Duration> = interval_override
        .map(|secs| interval("--interval", secs))
        .transpose()?;

    info!(mode = %mode, source = %source.describe(), "Starting watchpost");

    let manager = build_manager(config)?;
    let mut handle = manager
        .start_session(mode, source, interval_override)
        .await
        .context("failed to start session")?;

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                print_event(&event, args.json);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                manager.stop_session(mode).await;
            }
        }
    }

    match handle.wait().await {
        Some(summary) => {
            info!(
                frames = summary.frames_processed,
                incidents = summary.incidents_accepted,
                outcome = ?summary.outcome,
                "{}",
                summary.headline()
            );
            if let watchpost_models::SessionOutcome::Failed { message } = summary.outcome {
                bail!("analysis failed: {}", message);
            }
        }
        None => warn!("Session ended without a summary"),
    }
    Ok(())
}

fn build_manager(config: WatchpostConfig) -> Result<SessionManager> {
    let classifier =
        GeminiVisionClient::from_env().context("failed to create Gemini client")?;
    let firestore = FirestoreClient::from_env().context("failed to create Firestore client")?;
    let collection = std::env::var("FIRESTORE_INCIDENTS_COLLECTION")
        .unwrap_or_else(|_| INCIDENTS_COLLECTION.to_string());
    let store = FirestoreIncidentStore::new(IncidentRepository::with_collection(firestore, collection));

    let notifier: Option<Arc<dyn Notifier>> = match &config.notify_webhook_url {
        Some(url) => Some(Arc::new(WebhookNotifier::new(url.clone())?)),
        None => {
            warn!("WATCHPOST_NOTIFY_WEBHOOK_URL not set, incident notifications are disabled");
            None
        }
    };
    let reporter = PersistThenNotify::new(Arc::new(store), notifier);

    Ok(SessionManager::new(config, Arc::new(classifier), Arc::new(reporter)))
}

fn print_event(event: &SessionEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize event: {}", e),
        }
        return;
    }

    match event {
        SessionEvent::Progress { value } => info!("Progress: {}%", value),
        SessionEvent::IncidentsReported { video_timestamp, count } => {
            info!("{} new incident(s) at {:.1}s", count, video_timestamp)
        }
        SessionEvent::IncidentSaved { incident_id, incident_type } => {
            info!("Saved {} ({})", incident_type, incident_id)
        }
        SessionEvent::FrameSkipped { video_timestamp } => {
            debug!("Frame at {:.1}s skipped, analysis is busy", video_timestamp)
        }
        SessionEvent::LargeFrameWarning { bytes } => {
            warn!("Evidence frame is {} bytes, close to the document size limit", bytes)
        }
        SessionEvent::Completed { summary } => info!("{}", summary.headline()),
        SessionEvent::Stopped => info!("Analysis stopped"),
        other if other.is_error() => warn!("{:?}", other),
        other => info!("{:?}", other),
    }
}

fn selfcheck() -> Result<()> {
    let mut ok = true;
    for (name, found) in [("ffmpeg", check_ffmpeg()), ("ffprobe", check_ffprobe())] {
        match found {
            Ok(path) => info!("{} found at {}", name, path.display()),
            Err(e) => {
                error!("{}", e);
                ok = false;
            }
        }
    }
    let is_set = |var: &str| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false);
    if !is_set("GEMINI_API_KEY") {
        warn!("GEMINI_API_KEY is not set");
        ok = false;
    }
    if !is_set("GCP_PROJECT_ID") && !is_set("FIREBASE_PROJECT_ID") {
        warn!("GCP_PROJECT_ID or FIREBASE_PROJECT_ID is not set");
        ok = false;
    }
    if !ok {
        bail!("self check failed");
    }
    info!("Self check passed");
    Ok(())
}
