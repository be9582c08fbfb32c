use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use muster_attendance::{
    enroll, push_today, AttendanceLedger, CaptureOptions, Config, Directory, EnrollOutcome, SqliteRemoteStore,
};
use muster_core::{training, CentroidClassifier, EncodingSet, OnnxFaceAnalyzer};
use muster_hw::Camera;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "muster", about = "Muster attendance CLI")]
struct Cli {
    /// Config file (JSON, or TOML by extension)
    #[arg(short, long, global = true, env = "MUSTER_CONFIG", default_value = muster_attendance::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face crops for a new person and add them to the directory
    Enroll {
        /// Numeric person id
        #[arg(short, long)]
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
    },
    /// Compute face encodings for every image in the dataset
    Encode,
    /// Fit the identity classifier from the saved encodings
    Train,
    /// Push today's local attendance to the remote store
    Push,
    /// List enrolled people
    List,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let load_config = || Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()));

    match cli.command {
        Commands::Enroll { ref id, ref name } => run_enroll(load_config()?, id.clone(), name.clone()).await?,
        Commands::Encode => run_encode(&load_config()?)?,
        Commands::Train => run_train(&load_config()?)?,
        Commands::Push => {
            let config = load_config()?;
            let today = Local::now().date_naive();
            let inserted = run_push(&config.attendance_path, &config.remote_db_path, today)?;
            println!("Pushed {inserted} new record(s) for {today}");
        }
        Commands::List => {
            let directory = Directory::open(&load_config()?.db_path)?;
            let entries = directory.entries();
            if entries.is_empty() {
                println!("Nobody enrolled");
            }
            for e in entries {
                println!("{:>8}  {}  [{}]", e.id, e.name, e.status);
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

async fn run_enroll(config: Config, id: String, name: String) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nStopping enrollment...");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let outcome = tokio::task::spawn_blocking(move || -> Result<EnrollOutcome> {
        let mut directory = Directory::open(&config.db_path)?;
        let mut camera = Camera::open(&config.camera_device)?;
        let mut analyzer = OnnxFaceAnalyzer::load(&config.detector_model_path(), &config.embedder_model_path())?;
        let options = CaptureOptions {
            out_dir: config.enrollment_dir(id.trim()),
            face_count: config.face_count,
            stop: &stop,
        };
        let outcome = enroll(&mut directory, &id, &name, &mut camera, &mut analyzer, &options, |saved, total| {
            println!("captured {saved}/{total} ({}%)", saved * 100 / total);
        })?;
        Ok(outcome)
    })
    .await??;

    match outcome {
        EnrollOutcome::Completed { saved } => println!("Enrollment completed ({saved} faces). Run `muster encode` and `muster train` next."),
        EnrollOutcome::Stopped { saved } => println!("Enrollment stopped after {saved} faces; nothing registered"),
    }
    Ok(())
}

fn run_encode(config: &Config) -> Result<()> {
    let mut analyzer = OnnxFaceAnalyzer::load(&config.detector_model_path(), &config.embedder_model_path())?;
    let (set, report) = training::encode_dataset(&config.dataset_path, &mut analyzer, |done, total| {
        println!("processing image {done}/{total}");
    })?;
    set.save(&config.encodings_path)?;
    println!(
        "Encoded {} face(s) from {} image(s), {} skipped -> {}",
        report.encodings,
        report.images,
        report.skipped,
        config.encodings_path.display()
    );
    Ok(())
}

fn run_train(config: &Config) -> Result<()> {
    let set = EncodingSet::load(&config.encodings_path)?;
    let classifier: CentroidClassifier = training::train(&set)?;
    classifier.save(&config.recognizer_path, &config.le_path)?;
    println!(
        "Trained on {} encoding(s) for {} identities -> {}",
        set.len(),
        classifier.labels().len(),
        config.recognizer_path.display()
    );
    Ok(())
}

/// Push the local sheet's records for `today`; works while the daemon is down.
fn run_push(attendance_path: &Path, remote_path: &Path, today: NaiveDate) -> Result<usize> {
    if !attendance_path.exists() {
        bail!("no attendance file at {}", attendance_path.display());
    }
    let ledger = AttendanceLedger::open(attendance_path);
    let remote = SqliteRemoteStore::open(remote_path)?;
    Ok(push_today(&ledger, &remote, today)?)
}
