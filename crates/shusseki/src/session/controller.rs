//! Session controller: lifecycle and command surface
//!
//! Owns the state machine `Idle -> Starting -> Running -> Stopping -> Idle`,
//! with `Error` reachable from a running session when capture fails for good.
//! Only `stop()` leaves `Error`, returning the controller to `Idle`.
//!
//! A running session consists of the frame source (capture thread) plus three
//! tasks on a `TaskTracker`: the detection worker, the publish pump and a
//! supervisor watching capture health. Stopping cancels them, waits up to
//! `shutdown_timeout`, and releases the camera.
//!
//! Commands never return `Err`; they return a `CommandOutcome` so surrounding
//! layers (dashboard, CLI) can show the message directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::stats::{EngineCounters, EngineStats};
use crate::attendance::{AttendanceEvent, AttendanceRecorder, AttendanceStore};
use crate::capture::{CameraBackend, CameraDescriptor, CaptureHealth, DeviceScanner, FrameSource};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::mailbox::LatestSlot;
use crate::publish::{FramePublisher, PublishPump, Subscription};
use crate::recognition::{DetectionWorker, FaceEmbedder, IdentityMatcher, RosterProvider};

/// Lifecycle state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

/// What the dashboard should say about the camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "link", rename_all = "snake_case")]
pub enum CameraLink {
    /// No session has opened a camera yet
    NeverConnected,
    Connected,
    /// Capture failed during a session
    Disconnected { reason: String },
    /// Released by an explicit stop
    Released,
}

/// Status snapshot for surrounding layers
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_running: bool,
    pub detection_enabled: bool,
    pub camera_connected: bool,
    pub camera_link: CameraLink,
    pub camera: Option<CameraDescriptor>,
    pub known_identity_count: usize,
    pub roster_loaded: bool,
    pub last_frame_seq: u64,
    pub subscribers: usize,
    pub last_error: Option<String>,
}

/// Result of a controller command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub message: String,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

struct StatusCell {
    state: SessionState,
    camera_link: CameraLink,
    camera: Option<CameraDescriptor>,
    last_error: Option<String>,
}

/// Resources of a running session
struct ActiveSession {
    source: FrameSource,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct ControllerInner {
    config: EngineConfig,
    backend: Arc<dyn CameraBackend>,
    embedder: Arc<dyn FaceEmbedder>,
    roster: Arc<dyn RosterProvider>,
    matcher: Arc<IdentityMatcher>,
    recorder: Arc<AttendanceRecorder>,
    publisher: FramePublisher,
    counters: Arc<EngineCounters>,
    detection: watch::Sender<bool>,
    /// Serializes start/stop; holds the running session
    lifecycle: tokio::sync::Mutex<Option<ActiveSession>>,
    status: Mutex<StatusCell>,
    /// Lets `stop()` abort a start that is still scanning for cameras
    pending_start: Mutex<Option<CancellationToken>>,
    roster_loaded: AtomicBool,
}

impl ControllerInner {
    fn status_cell(&self) -> MutexGuard<'_, StatusCell> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_start(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.pending_start.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> SessionState {
        self.status_cell().state
    }

    fn set_state(&self, state: SessionState) {
        let mut cell = self.status_cell();
        if cell.state != state {
            info!("Session state: {:?} -> {:?}", cell.state, state);
            cell.state = state;
        }
    }

    /// Move a running session to `Error` after capture gave up
    fn capture_failed(&self, reason: String) {
        let mut cell = self.status_cell();
        if !matches!(cell.state, SessionState::Running | SessionState::Starting) {
            return;
        }
        error!("Camera lost: {}", reason);
        info!("Session state: {:?} -> {:?}", cell.state, SessionState::Error);
        cell.state = SessionState::Error;
        cell.camera_link = CameraLink::Disconnected {
            reason: reason.clone(),
        };
        cell.last_error = Some(Error::CameraUnavailable(reason).to_string());
    }
}

/// Orchestrates capture, detection, recording and publishing for one camera.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    /// Build a controller. The configuration is validated here.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn CameraBackend>,
        embedder: Arc<dyn FaceEmbedder>,
        roster: Arc<dyn RosterProvider>,
        store: Arc<dyn AttendanceStore>,
    ) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(EngineCounters::new());
        let matcher = Arc::new(IdentityMatcher::new(config.detection.match_threshold));
        let recorder = Arc::new(AttendanceRecorder::new(
            store,
            config.recorder.cooldown,
            counters.clone(),
        ));
        let publisher = FramePublisher::new(&config.publisher, counters.clone());
        let (detection, _) = watch::channel(config.detection_enabled);

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                backend,
                embedder,
                roster,
                matcher,
                recorder,
                publisher,
                counters,
                detection,
                lifecycle: tokio::sync::Mutex::new(None),
                status: Mutex::new(StatusCell {
                    state: SessionState::Idle,
                    camera_link: CameraLink::NeverConnected,
                    camera: None,
                    last_error: None,
                }),
                pending_start: Mutex::new(None),
                roster_loaded: AtomicBool::new(false),
            }),
        })
    }

    /// Select a camera, open it and start the session's tasks.
    ///
    /// Succeeds without side effects if a session is already running.
    pub async fn start(&self) -> CommandOutcome {
        let inner = &self.inner;
        let mut active = inner.lifecycle.lock().await;

        match inner.state() {
            SessionState::Running => return CommandOutcome::ok("Session already running"),
            SessionState::Error => {
                return CommandOutcome::fail("Session is in error state; stop it to reset")
            }
            _ => {}
        }

        let cancel_start = CancellationToken::new();
        *inner.pending_start() = Some(cancel_start.clone());
        inner.set_state(SessionState::Starting);
        inner.counters.last_frame_seq.store(0, Ordering::Relaxed);

        let scanner = DeviceScanner::new(
            inner.backend.clone(),
            inner.config.scan.clone(),
            &inner.config.capture,
        );
        let capture = inner.config.capture.clone();
        let counters = inner.counters.clone();
        // Scanning and opening block on device I/O
        let opening = tokio::task::spawn_blocking(move || -> Result<FrameSource> {
            let (descriptor, device) = scanner.select_best()?;
            FrameSource::start(device, descriptor, &capture, counters)
        });

        // A cancelled start drops the join handle; a source opened after that
        // is dropped with the task result, which stops its capture thread.
        let opened = tokio::select! {
            _ = cancel_start.cancelled() => None,
            joined = opening => Some(joined),
        };
        inner.pending_start().take();

        let source = match opened {
            None => {
                inner.set_state(SessionState::Idle);
                info!("Start cancelled by stop");
                return CommandOutcome::fail("Start cancelled by stop");
            }
            Some(Ok(Ok(source))) => source,
            Some(Ok(Err(e))) => return self.start_failed(e.to_string()),
            Some(Err(e)) => return self.start_failed(format!("camera open task failed: {e}")),
        };

        let descriptor = source.descriptor().clone();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let reports = Arc::new(LatestSlot::new());

        let worker = DetectionWorker::new(
            source.slot(),
            inner.embedder.clone(),
            inner.matcher.clone(),
            inner.recorder.clone(),
            reports.clone(),
            inner.config.detection.clone(),
            inner.counters.clone(),
        );
        tracker.spawn(worker.run(inner.detection.subscribe(), cancel.clone()));

        let pump = PublishPump::new(
            inner.publisher.clone(),
            source.slot(),
            reports,
            &inner.config.publisher,
            inner.config.detection.report_ttl,
        );
        tracker.spawn(pump.run(cancel.clone()));

        tracker.spawn(supervise(
            Arc::downgrade(inner),
            source.health_watch(),
            cancel.clone(),
        ));
        tracker.close();

        // The supervisor may already have moved a camera that died at once to
        // `Error`; only a session still `Starting` becomes `Running`.
        let lost = {
            let mut cell = inner.status_cell();
            cell.camera = Some(descriptor.clone());
            if cell.state == SessionState::Starting {
                info!("Session state: {:?} -> {:?}", cell.state, SessionState::Running);
                cell.state = SessionState::Running;
                cell.camera_link = CameraLink::Connected;
                cell.last_error = None;
                None
            } else {
                Some(cell.last_error.clone().unwrap_or_default())
            }
        };

        // Kept even when lost so `stop()` can reset it
        *active = Some(ActiveSession {
            source,
            cancel,
            tracker,
        });

        if let Some(reason) = lost {
            warn!(camera = descriptor.index, "Camera failed while the session was starting");
            return CommandOutcome::fail(reason);
        }

        CommandOutcome::ok(format!(
            "Session started on camera {} ({})",
            descriptor.index, descriptor.display_name
        ))
    }

    fn start_failed(&self, message: String) -> CommandOutcome {
        warn!("Failed to start session: {}", message);
        {
            let mut cell = self.inner.status_cell();
            cell.last_error = Some(message.clone());
        }
        self.inner.set_state(SessionState::Idle);
        CommandOutcome::fail(message)
    }

    /// Stop the session and release the camera.
    ///
    /// Cancels a start still in progress, resets from `Error`, and is a benign
    /// no-op when already idle. Returns within `shutdown_timeout` of the session
    /// lock becoming available.
    pub async fn stop(&self) -> CommandOutcome {
        let inner = &self.inner;

        if let Some(token) = inner.pending_start().take() {
            token.cancel();
        }

        let mut active = inner.lifecycle.lock().await;
        let Some(session) = active.take() else {
            return match inner.state() {
                SessionState::Error => {
                    inner.set_state(SessionState::Idle);
                    CommandOutcome::ok("Session reset")
                }
                _ => CommandOutcome::ok("Session already stopped"),
            };
        };

        let was_error = inner.state() == SessionState::Error;
        inner.set_state(SessionState::Stopping);
        session.cancel.cancel();

        let deadline = tokio::time::Instant::now() + inner.config.shutdown_timeout;
        if tokio::time::timeout_at(deadline, session.tracker.wait()).await.is_err() {
            warn!("Session tasks did not exit before the shutdown deadline, abandoning them");
        }
        let released = session.source.close(deadline).await;

        inner.status_cell().camera_link = CameraLink::Released;
        inner.set_state(SessionState::Idle);

        let message = match (was_error, released) {
            (true, _) => "Session reset after camera failure",
            (false, true) => "Session stopped",
            (false, false) => "Session stopped; capture thread did not exit in time",
        };
        CommandOutcome::ok(message)
    }

    pub fn enable_detection(&self) -> CommandOutcome {
        self.set_detection(true)
    }

    pub fn disable_detection(&self) -> CommandOutcome {
        self.set_detection(false)
    }

    fn set_detection(&self, on: bool) -> CommandOutcome {
        if self.inner.state() == SessionState::Error {
            return CommandOutcome::fail("Session is in error state; stop it to reset");
        }
        let changed = self.inner.detection.send_if_modified(|enabled| {
            let changed = *enabled != on;
            *enabled = on;
            changed
        });
        let word = if on { "enabled" } else { "disabled" };
        if changed {
            info!("Detection {}", word);
            CommandOutcome::ok(format!("Detection {word}"))
        } else {
            CommandOutcome::ok(format!("Detection already {word}"))
        }
    }

    /// Load the roster from the provider and swap it in atomically.
    ///
    /// On failure the previous roster stays in place.
    pub async fn reload_roster(&self) -> CommandOutcome {
        match self.inner.roster.load_all().await {
            Ok(identities) => {
                let roster = self.inner.matcher.replace_roster(identities);
                self.inner.roster_loaded.store(true, Ordering::Relaxed);
                info!(
                    generation = roster.generation(),
                    "Roster loaded: {} known identities",
                    roster.len()
                );
                CommandOutcome::ok(format!("Loaded {} known identities", roster.len()))
            }
            Err(e) => {
                let err = Error::Roster(e);
                warn!("Roster reload failed: {}", err);
                self.inner.status_cell().last_error = Some(err.to_string());
                CommandOutcome::fail(err.to_string())
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let inner = &self.inner;
        let cell = inner.status_cell();
        SessionStatus {
            state: cell.state,
            is_running: cell.state == SessionState::Running,
            detection_enabled: *inner.detection.borrow(),
            camera_connected: cell.camera_link == CameraLink::Connected,
            camera_link: cell.camera_link.clone(),
            camera: cell.camera.clone(),
            known_identity_count: inner.matcher.known_count(),
            roster_loaded: inner.roster_loaded.load(Ordering::Relaxed),
            last_frame_seq: inner.counters.last_frame_seq.load(Ordering::Relaxed),
            subscribers: inner.publisher.subscriber_count(),
            last_error: cell.last_error.clone(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    /// Live annotated frames for a viewer
    pub fn subscribe(&self) -> Subscription {
        self.inner.publisher.subscribe()
    }

    /// Attendance events as they are recorded
    pub fn subscribe_events(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.inner.recorder.subscribe()
    }
}

/// Watch capture health; on a terminal failure move the session to `Error`
/// and stop its other tasks.
async fn supervise(
    inner: Weak<ControllerInner>,
    mut health: watch::Receiver<CaptureHealth>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = async { health.wait_for(|h| !h.is_running()).await.map(|h| (*h).clone()) } => outcome,
    };

    let reason = match outcome {
        Ok(CaptureHealth::Failed(reason)) => reason,
        Ok(_) => return,
        Err(_) => "capture thread exited unexpectedly".to_string(),
    };

    if let Some(inner) = inner.upgrade() {
        inner.capture_failed(reason);
    }
    cancel.cancel();
}
