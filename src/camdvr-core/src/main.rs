//! camdvr - single-camera DVR
//!
//! Streams one camera, records it in time-based segments and keeps the
//! recordings directory within its retention window.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use camdvr_capture::ConnectionConfig;
use camdvr_core::{AppConfig, Supervisor, SupervisorStats};
use camdvr_db::{Database, MemorySettings, SettingsStore};
use camdvr_processing::RecordingConfig;

/// How often `run` looks for settings saved by another process
const SETTINGS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "camdvr")]
#[command(about = "Single-camera recorder with segment rotation and retention")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream and record until Ctrl+C
    Run,

    /// Show or change the camera
    Camera {
        #[command(subcommand)]
        action: CameraAction,
    },

    /// Show or change recording settings
    Recording {
        #[command(subcommand)]
        action: RecordingAction,
    },

    /// Delete expired recordings now
    Sweep {
        /// Directory to sweep (defaults to the recording destination)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Age in days (defaults to the configured retention age)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Save one frame from the camera as an image
    Snapshot {
        /// Output image path (format from the extension)
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,

        /// Seconds to wait for a frame
        #[arg(long, default_value = "15")]
        timeout: u64,
    },

    /// Check dependencies (FFmpeg, etc.)
    Check,

    /// Show settings and recordings on disk
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CameraAction {
    Show,
    Set(CameraArgs),
}

#[derive(Args)]
struct CameraArgs {
    /// Local capture device index
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    index: Option<u32>,

    /// Network camera URL, or a bare IP for the default RTSP path
    #[arg(long)]
    url: Option<String>,

    #[arg(long, requires = "url")]
    username: Option<String>,

    #[arg(long, requires = "url")]
    password: Option<String>,

    /// Flip the image horizontally
    #[arg(long, default_value_t = false)]
    mirror: bool,
}

#[derive(Subcommand)]
enum RecordingAction {
    Show,
    Set(RecordingArgs),
}

#[derive(Args)]
struct RecordingArgs {
    /// Directory for segment files
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Segment length in minutes
    #[arg(long)]
    segment_minutes: Option<u64>,

    /// Record frames to disk
    #[arg(long)]
    enable: Option<bool>,

    /// Delete old segments automatically
    #[arg(long)]
    auto_delete: Option<bool>,

    /// Age in days at which segments are deleted
    #[arg(long)]
    retention_days: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Codec fourcc (XVID, MJPG, H264, ...)
    #[arg(long)]
    fourcc: Option<String>,

    /// strftime pattern for file names
    #[arg(long)]
    pattern: Option<String>,

    /// File extension
    #[arg(long)]
    container: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let app = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => cmd_run(&app)?,
        Commands::Camera { action } => cmd_camera(&app, action)?,
        Commands::Recording { action } => cmd_recording(&app, action)?,
        Commands::Sweep { dir, days } => cmd_sweep(&app, dir, days)?,
        Commands::Snapshot { output, timeout } => cmd_snapshot(&app, output, timeout)?,
        Commands::Check => cmd_check()?,
        Commands::Status { json } => cmd_status(&app, json)?,
    }

    Ok(())
}

fn open_database(app: &AppConfig) -> Result<Database> {
    let defaults = RecordingConfig {
        destination: app.default_recordings_dir(),
        ..RecordingConfig::default()
    };
    let db = Database::open(app.database_path())
        .context("failed to open settings database")?
        .with_recording_defaults(defaults);
    Ok(db)
}

fn build_supervisor(app: &AppConfig, settings: Arc<dyn SettingsStore>) -> Supervisor {
    Supervisor::new(Arc::new(app.opener()), Arc::new(app.encoder()), settings)
        .with_policy(app.reconnect_policy())
        .with_recorder_settings(app.recorder_settings())
}

fn cmd_run(app: &AppConfig) -> Result<()> {
    if !camdvr_processing::encoder::check_ffmpeg() {
        error!("ffmpeg not found in PATH - please install FFmpeg");
        return Err(anyhow::anyhow!("FFmpeg not found"));
    }

    let db = Arc::new(open_database(app)?);
    let camera = db.connection_config_or_default()?;

    // Setup signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    let supervisor = build_supervisor(app, db.clone());
    info!("starting camdvr on {}", camera);
    supervisor.start(camera.clone())?;

    let mut active_camera = camera;
    let mut last_poll = Instant::now();
    let mut last_stats = Instant::now();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));

        if last_poll.elapsed() >= SETTINGS_POLL_INTERVAL {
            last_poll = Instant::now();
            if let Err(e) = poll_settings(db.as_ref(), &supervisor, &mut active_camera) {
                warn!("failed to reload settings: {:#}", e);
            }
        }

        if last_stats.elapsed() >= STATS_LOG_INTERVAL {
            last_stats = Instant::now();
            log_stats(&supervisor);
        }
    }

    info!("stopping...");
    supervisor.disconnect();
    log_stats(&supervisor);
    Ok(())
}

/// Apply settings saved by `camdvr camera set` / `camdvr recording set`
fn poll_settings(
    db: &Database,
    supervisor: &Supervisor,
    active_camera: &mut ConnectionConfig,
) -> Result<()> {
    let recording = db.get_recording_config()?;
    if recording != supervisor.recording_config() {
        supervisor.apply_recording_config(recording)?;
    }

    if let Some(camera) = db.get_connection_config()? {
        if camera != *active_camera {
            *active_camera = camera.clone();
            supervisor.apply_connection_config(camera)?;
        }
    }
    Ok(())
}

fn log_stats(supervisor: &Supervisor) {
    let SupervisorStats {
        frames_captured,
        frames_recorded,
        frames_dropped,
        reconnects,
        segments_opened,
    } = supervisor.stats();
    info!(
        "{}: {} frames captured, {} recorded, {} dropped, {} segments, {} reconnects",
        supervisor.state(),
        frames_captured,
        frames_recorded,
        frames_dropped,
        segments_opened,
        reconnects
    );
}

fn cmd_camera(app: &AppConfig, action: CameraAction) -> Result<()> {
    let db = open_database(app)?;

    match action {
        CameraAction::Show => match db.get_connection_config()? {
            Some(camera) => {
                println!("camera: {}", camera);
                println!("mirror: {}", camera.mirror);
            }
            None => println!("camera: not configured"),
        },
        CameraAction::Set(args) => {
            let camera = match (args.index, args.url) {
                (Some(index), _) => ConnectionConfig::local(index),
                (None, Some(url)) => {
                    let mut camera = ConnectionConfig::network(url);
                    if let (Some(user), Some(pass)) = (args.username, args.password) {
                        camera = camera.with_credentials(user, pass);
                    }
                    camera
                }
                (None, None) => return Err(anyhow::anyhow!("either --index or --url is required")),
            }
            .with_mirror(args.mirror);

            db.save_connection_config(&camera)?;
            println!("camera set to {}", camera);
        }
    }
    Ok(())
}

fn cmd_recording(app: &AppConfig, action: RecordingAction) -> Result<()> {
    let db = open_database(app)?;
    let mut recording = db.get_recording_config()?;

    match action {
        RecordingAction::Show => print_recording(&recording),
        RecordingAction::Set(args) => {
            if let Some(destination) = args.destination {
                recording.destination = destination;
            }
            if let Some(minutes) = args.segment_minutes {
                recording.segment_duration_secs = minutes.saturating_mul(60);
            }
            if let Some(enable) = args.enable {
                recording.enable_record = enable;
            }
            if let Some(auto_delete) = args.auto_delete {
                recording.retention_enabled = auto_delete;
            }
            if let Some(days) = args.retention_days {
                recording.retention_age_days = days;
            }
            if let Some(fps) = args.fps {
                recording.fps = fps;
            }
            if let Some(fourcc) = args.fourcc {
                recording.fourcc = fourcc;
            }
            if let Some(pattern) = args.pattern {
                recording.filename_pattern = pattern;
            }
            if let Some(container) = args.container {
                recording.container = container;
            }

            recording.validate()?;
            db.save_recording_config(&recording)?;
            println!("recording settings saved\n");
            print_recording(&recording);
        }
    }
    Ok(())
}

fn print_recording(recording: &RecordingConfig) {
    println!("recording:   {}", if recording.enable_record { "enabled" } else { "disabled" });
    println!("destination: {:?}", recording.destination);
    println!("segment:     {} min", recording.segment_duration_secs / 60);
    println!(
        "retention:   {}",
        if recording.retention_enabled {
            format!("delete after {} days", recording.retention_age_days)
        } else {
            "keep forever".to_string()
        }
    );
    println!(
        "format:      {} @ {} fps, {}.{}",
        recording.fourcc, recording.fps, recording.filename_pattern, recording.container
    );
}

fn cmd_sweep(app: &AppConfig, dir: Option<PathBuf>, days: Option<u32>) -> Result<()> {
    let recording = open_database(app)?.get_recording_config()?;
    let dir = dir.unwrap_or(recording.destination);
    let days = days.unwrap_or(recording.retention_age_days);

    info!("sweeping {:?} (older than {} days)", dir, days);
    let summary = camdvr_processing::sweep(&dir, days)?;

    println!(
        "deleted {} file(s), freed {:.1} MB, kept {}, errors {}",
        summary.deleted,
        summary.bytes_freed as f64 / (1024.0 * 1024.0),
        summary.kept,
        summary.errors
    );
    Ok(())
}

#[tokio::main]
async fn cmd_snapshot(app: &AppConfig, output: PathBuf, timeout: u64) -> Result<()> {
    let camera = open_database(app)?.connection_config_or_default()?;

    // Never record or persist anything while grabbing a still
    let settings = Arc::new(MemorySettings::new(RecordingConfig::default()));
    let supervisor = build_supervisor(app, settings);
    let mut preview = supervisor.subscribe_preview();

    info!("connecting to {}", camera);
    supervisor.connect(camera)?;

    let frame = tokio::time::timeout(Duration::from_secs(timeout), preview.next()).await;
    supervisor.disconnect();

    let frame = match frame {
        Ok(Some(frame)) => frame,
        Ok(None) => return Err(anyhow::anyhow!("camera stopped before sending a frame")),
        Err(_) => return Err(anyhow::anyhow!("no frame within {} seconds", timeout)),
    };

    frame
        .save_image(&output)
        .with_context(|| format!("failed to save {:?}", output))?;
    println!("saved {}x{} frame to {:?}", frame.width(), frame.height(), output);
    Ok(())
}

fn cmd_check() -> Result<()> {
    println!("checking dependencies...\n");

    let ffmpeg_ok = camdvr_processing::encoder::check_ffmpeg();
    println!("  ffmpeg:  {}", if ffmpeg_ok { "OK" } else { "NOT FOUND" });

    let ffprobe_ok = camdvr_capture::ffmpeg::check_ffprobe();
    println!("  ffprobe: {}", if ffprobe_ok { "OK" } else { "NOT FOUND" });

    println!();

    if !ffmpeg_ok || !ffprobe_ok {
        println!("WARNING: FFmpeg (ffmpeg and ffprobe) is required for capture and encoding.");
        println!("Please install FFmpeg and ensure it's in your PATH.");
        println!("Download: https://ffmpeg.org/download.html");
    } else {
        println!("all checks passed!");
    }

    Ok(())
}

#[derive(Serialize)]
struct Status {
    database: PathBuf,
    camera: Option<String>,
    recording: RecordingConfig,
    segments: usize,
    total_bytes: u64,
    latest_segment: Option<PathBuf>,
}

fn cmd_status(app: &AppConfig, json: bool) -> Result<()> {
    let db_path = app.database_path();

    if !db_path.exists() {
        println!("status: not initialized");
        println!("database: not found");
        return Ok(());
    }

    let db = open_database(app)?;
    let recording = db.get_recording_config()?;
    let (segments, total_bytes, latest_segment) = scan_recordings(&recording.destination);

    let status = Status {
        database: db_path,
        camera: db.get_connection_config()?.map(|c| c.to_string()),
        recording,
        segments,
        total_bytes,
        latest_segment,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("status: ready");
    println!("database: {:?}", status.database);
    println!("camera: {}", status.camera.as_deref().unwrap_or("not configured"));
    print_recording(&status.recording);
    println!(
        "recordings: {} file(s), {:.1} MB",
        status.segments,
        status.total_bytes as f64 / (1024.0 * 1024.0)
    );
    if let Some(latest) = &status.latest_segment {
        println!("latest segment: {:?}", latest);
    }

    Ok(())
}

/// File count, total size and newest file directly under `dir`
fn scan_recordings(dir: &Path) -> (usize, u64, Option<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("cannot read {:?}: {}", dir, e);
            return (0, 0, None);
        }
    };

    let mut count = 0;
    let mut total = 0;
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;

    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        count += 1;
        total += meta.len();
        if let Ok(modified) = meta.modified() {
            if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
                latest = Some((modified, entry.path()));
            }
        }
    }

    (count, total, latest.map(|(_, path)| path))
}
