use anyhow::{Context, Result};
use clap::Parser;
use muster_attendance::{
    spawn_engine, AlertNotifier, AttendanceLedger, CommandSpeaker, Config, DailyExport, Directory, DisplaySink,
    EngineHandle, NullSink, OverlayRenderer, RecognitionLoop, RecognitionSettings, SilentSpeaker, SnapshotSink,
    Speaker, SqliteRemoteStore, StatusBus, StatusEvent,
};
use muster_core::{CentroidClassifier, OnnxFaceAnalyzer};
use muster_hw::Camera;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Write the preview snapshot every this many frames.
const SNAPSHOT_EVERY: u64 = 10;

#[derive(Parser)]
#[command(name = "musterd", about = "Muster live attendance daemon")]
struct Args {
    /// Config file (JSON, or TOML by extension)
    #[arg(short, long, env = "MUSTER_CONFIG", default_value = muster_attendance::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!("musterd starting");

    let config = Config::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    let status = StatusBus::new();
    tokio::spawn(print_status(status.subscribe()));

    let recognition = build_recognition(&config, status.clone())?;
    let remote = SqliteRemoteStore::open(&config.remote_db_path)
        .with_context(|| format!("opening remote store {}", config.remote_db_path.display()))?;

    let (handle, join) = spawn_engine(recognition, Box::new(remote))?;
    tracing::info!("musterd ready; commands: push, status, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !run_command(&handle, line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        if !handle.is_running() {
            break;
        }
    }

    tracing::info!("musterd shutting down");
    handle.stop();
    tokio::task::spawn_blocking(move || join.join())
        .await?
        .map_err(|_| anyhow::anyhow!("engine thread panicked"))?;
    Ok(())
}

/// Assemble camera, models, directory and ledger. Any failure here is fatal.
fn build_recognition(config: &Config, status: StatusBus) -> Result<RecognitionLoop> {
    let camera = Camera::open(&config.camera_device)?;

    let detector_path = config.detector_model_path();
    let analyzer = OnnxFaceAnalyzer::load(&detector_path, &config.embedder_model_path())?;
    tracing::info!(path = %detector_path.display(), "face models loaded");

    let classifier = CentroidClassifier::load(&config.recognizer_path, &config.le_path)?;
    tracing::info!(classes = classifier.labels().len(), "classifier loaded");

    let directory = Directory::open(&config.db_path)?;

    let speaker: Box<dyn Speaker> = match CommandSpeaker::from_command_line(&config.speech_command) {
        Some(speaker) => Box::new(speaker),
        None => Box::new(SilentSpeaker),
    };
    let alerts = AlertNotifier::new(speaker, config.alert_phrase.clone(), status.clone());
    let ledger = AttendanceLedger::open(&config.attendance_path)
        .with_alerts(alerts)
        .with_export(DailyExport::new(config.daily_export_dir()));

    let display: Box<dyn DisplaySink + Send> = match &config.snapshot_path {
        Some(path) => Box::new(SnapshotSink::new(path, SNAPSHOT_EVERY)),
        None => Box::new(NullSink),
    };

    Ok(RecognitionLoop::new(
        Box::new(camera),
        Box::new(analyzer),
        Box::new(classifier),
        Box::new(directory),
        ledger,
        status,
    )
    .with_display(display)
    .with_overlay(OverlayRenderer::new(config.font_path.as_deref()))
    .with_settings(RecognitionSettings::from_config(config)))
}

/// Returns false when the operator asked to quit.
async fn run_command(handle: &EngineHandle, command: &str) -> bool {
    match command {
        "" => {}
        "push" => match handle.push_today().await {
            Ok(n) => println!("pushed {n} new record(s)"),
            Err(e) => eprintln!("push failed: {e}"),
        },
        "status" => match handle.snapshot().await {
            Ok(snapshot) => {
                let mode = snapshot.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".into());
                println!("mode: {mode}, present: {}, frames: {}", snapshot.records.len(), snapshot.frames);
                for record in &snapshot.records {
                    println!("  {}  {}  {}", record.id, record.name, record.timestamp.format("%H:%M:%S"));
                }
            }
            Err(e) => eprintln!("status unavailable: {e}"),
        },
        "quit" | "exit" => return false,
        other => eprintln!("unknown command '{other}' (push, status, quit)"),
    }
    true
}

async fn print_status(mut rx: broadcast::Receiver<StatusEvent>) {
    loop {
        match rx.recv().await {
            Ok(StatusEvent::Info(msg)) => println!("{msg}"),
            Ok(StatusEvent::Error(msg)) => eprintln!("error: {msg}"),
            Ok(StatusEvent::Alert(msg)) => println!("!! {msg}"),
            Ok(StatusEvent::AlertCleared) => {}
            Ok(StatusEvent::Stopped) => {
                println!("recognition stopped");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "status output lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
