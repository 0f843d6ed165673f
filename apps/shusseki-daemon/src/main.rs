//! Shusseki Daemon - headless attendance engine
//!
//! Picks the best camera, matches faces against the roster, records attendance
//! and optionally keeps a snapshot of the latest annotated frame on disk.
//!
//! ## Usage
//!
//! ```bash
//! # Real camera via ffmpeg/V4L2, roster and attendance log on disk
//! SHUSSEKI_ROSTER_PATH=/var/lib/shusseki/roster.json \
//! SHUSSEKI_ATTENDANCE_PATH=/var/lib/shusseki/attendance.jsonl \
//! shusseki-daemon
//!
//! # Synthetic cameras (development)
//! SHUSSEKI_CAMERA_BACKEND=synthetic shusseki-daemon
//!
//! # Write the latest annotated frame for a dashboard to poll
//! SHUSSEKI_SNAPSHOT_PATH=/tmp/shusseki.jpg shusseki-daemon
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use shusseki::attendance::{JsonlAttendanceStore, MemoryAttendanceStore};
use shusseki::capture::FfmpegCameraBackend;
use shusseki::recognition::{HttpFaceEmbedder, JsonRosterProvider, StaticRosterProvider};
use shusseki::{
    AttendanceStore, CameraBackend, DetectionCadence, EngineConfig, RosterProvider,
    SessionController, Subscription,
};

/// Daemon configuration from environment
struct Config {
    camera_backend: String,
    ffmpeg_path: PathBuf,
    ffprobe_path: Option<PathBuf>,
    roster_path: Option<PathBuf>,
    attendance_path: Option<PathBuf>,
    embedder_url: String,
    snapshot_path: Option<PathBuf>,
    engine: EngineConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    fn from_env() -> Self {
        let camera_backend = std::env::var("SHUSSEKI_CAMERA_BACKEND")
            .unwrap_or_else(|_| "ffmpeg".to_string());

        let ffmpeg_path = std::env::var("SHUSSEKI_FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ffmpeg"));

        // Defaults to ffprobe next to ffmpeg
        let ffprobe_path = std::env::var("SHUSSEKI_FFPROBE_PATH").map(PathBuf::from).ok();

        let roster_path = std::env::var("SHUSSEKI_ROSTER_PATH").map(PathBuf::from).ok();
        let attendance_path = std::env::var("SHUSSEKI_ATTENDANCE_PATH").map(PathBuf::from).ok();
        let snapshot_path = std::env::var("SHUSSEKI_SNAPSHOT_PATH").map(PathBuf::from).ok();

        let embedder_url = std::env::var("SHUSSEKI_EMBEDDER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8089".to_string());

        let mut engine = EngineConfig::default();

        if let Some(threshold) = env_parse::<f32>("SHUSSEKI_MATCH_THRESHOLD") {
            engine.detection.match_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("SHUSSEKI_COOLDOWN_SECS") {
            engine.recorder.cooldown = Duration::from_secs(secs);
        }
        // Every Nth frame wins over a time interval when both are set
        if let Some(ms) = env_parse::<u64>("SHUSSEKI_DETECTION_INTERVAL_MS") {
            engine.detection.cadence = DetectionCadence::Interval(Duration::from_millis(ms));
        }
        if let Some(n) = env_parse::<u64>("SHUSSEKI_DETECT_EVERY_N_FRAMES") {
            engine.detection.cadence = DetectionCadence::EveryNthFrame(n);
        }
        if let Some(fps) = env_parse::<u64>("SHUSSEKI_PUBLISH_FPS").filter(|fps| *fps > 0) {
            engine.publisher.interval = Duration::from_millis(1000 / fps);
        }
        if let Some(quality) = env_parse::<u8>("SHUSSEKI_JPEG_QUALITY") {
            engine.publisher.jpeg_quality = quality;
        }
        if let Some(width) = env_parse::<u32>("SHUSSEKI_WIDTH") {
            engine.capture.width = width;
        }
        if let Some(height) = env_parse::<u32>("SHUSSEKI_HEIGHT") {
            engine.capture.height = height;
        }
        if let Some(fps) = env_parse::<u32>("SHUSSEKI_FPS") {
            engine.capture.fps = fps;
        }
        engine.detection_enabled = std::env::var("SHUSSEKI_DETECTION")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        Self {
            camera_backend,
            ffmpeg_path,
            ffprobe_path,
            roster_path,
            attendance_path,
            embedder_url,
            snapshot_path,
            engine,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Shusseki daemon starting");
    info!("  Camera backend: {}", config.camera_backend);
    info!(
        "  Capture: {}x{} @ {}fps",
        config.engine.capture.width, config.engine.capture.height, config.engine.capture.fps
    );
    info!("  Embedder: {}", config.embedder_url);
    info!("  Match threshold: {}", config.engine.detection.match_threshold);
    info!("  Cooldown: {:?}", config.engine.recorder.cooldown);

    let backend = camera_backend(&config)?;

    let embedder = Arc::new(
        HttpFaceEmbedder::new(&config.embedder_url).context("Failed to build embedder client")?,
    );
    if !embedder.health_check().await {
        warn!("Face embedder not reachable yet, detection cycles will fail until it is");
    }

    let roster: Arc<dyn RosterProvider> = match &config.roster_path {
        Some(path) => {
            info!("  Roster: {}", path.display());
            Arc::new(JsonRosterProvider::new(path))
        }
        None => {
            warn!("SHUSSEKI_ROSTER_PATH not set, every face will be unknown");
            Arc::new(StaticRosterProvider::default())
        }
    };

    let store: Arc<dyn AttendanceStore> = match &config.attendance_path {
        Some(path) => {
            info!("  Attendance log: {}", path.display());
            Arc::new(
                JsonlAttendanceStore::open(path)
                    .await
                    .with_context(|| format!("Failed to open attendance log {}", path.display()))?,
            )
        }
        None => {
            warn!("SHUSSEKI_ATTENDANCE_PATH not set, attendance is kept in memory only");
            Arc::new(MemoryAttendanceStore::new())
        }
    };

    let controller = SessionController::new(config.engine.clone(), backend, embedder, roster, store)
        .context("Invalid engine configuration")?;

    let outcome = controller.reload_roster().await;
    if outcome.ok {
        info!("{}", outcome.message);
    } else {
        warn!("{}", outcome.message);
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(log_events(controller.subscribe_events(), cancel.clone()));
    if let Some(path) = config.snapshot_path.clone() {
        info!("  Snapshot: {}", path.display());
        tracker.spawn(write_snapshots(controller.subscribe(), path, cancel.clone()));
    }
    tracker.close();

    let outcome = controller.start().await;
    anyhow::ensure!(outcome.ok, "Failed to start session: {}", outcome.message);
    info!("{}", outcome.message);

    run_headless(controller, cancel, tracker).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shusseki=info".parse().unwrap())
                .add_directive("shusseki_daemon=info".parse().unwrap()),
        )
        .init();
}

fn camera_backend(config: &Config) -> Result<Arc<dyn CameraBackend>> {
    match config.camera_backend.as_str() {
        "ffmpeg" => {
            let mut backend = FfmpegCameraBackend::new(&config.ffmpeg_path);
            if let Some(ffprobe) = &config.ffprobe_path {
                backend = backend.with_ffprobe(ffprobe);
            }
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "test-source")]
        "synthetic" => {
            use shusseki::capture::{SyntheticCamera, SyntheticCameraBackend};
            Ok(Arc::new(
                SyntheticCameraBackend::new()
                    .with_camera(SyntheticCamera::new(0, "Integrated Camera").with_resolution(640, 480))
                    .with_camera(SyntheticCamera::new(1, "USB Webcam").with_resolution(1280, 720)),
            ))
        }
        other => anyhow::bail!("Unknown SHUSSEKI_CAMERA_BACKEND: {other}"),
    }
}

/// Headless mode: log stats periodically, stop the session on Ctrl-C
async fn run_headless(
    controller: SessionController,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, stopping session...");
                break;
            }
            _ = stats_interval.tick() => {
                let status = controller.status();
                let stats = controller.stats();
                info!(
                    "Stats: {:?}, {} frames captured, {} detection cycles, {} recorded, {} duplicates, {} viewers",
                    status.state,
                    stats.frames_captured,
                    stats.detection_cycles,
                    stats.attendance_recorded,
                    stats.duplicates_suppressed,
                    status.subscribers,
                );
                if let Some(err) = status.last_error {
                    warn!("Last error: {}", err);
                }
            }
        }
    }

    let outcome = controller.stop().await;
    info!("{}", outcome.message);
    cancel.cancel();

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s, some tasks may not have finished");
    } else {
        info!("All tasks shut down cleanly");
    }
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<shusseki::AttendanceEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => info!(
                    identity = %event.identity_id,
                    confidence = event.confidence,
                    "Attendance: {} at {}",
                    event.display_name,
                    event.recorded_at.format("%H:%M:%S"),
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged, {} events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Keep the latest annotated frame on disk, replacing it atomically
async fn write_snapshots(viewer: Subscription, path: PathBuf, cancel: CancellationToken) {
    let tmp = path.with_extension("jpg.tmp");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = viewer.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = async {
            tokio::fs::write(&tmp, &frame.jpeg).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        match written {
            Ok(()) => debug!(seq = frame.seq, faces = frame.faces, "Snapshot written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write snapshot"),
        }
    }
}
