//! V4L2 camera backend driven by an ffmpeg subprocess
//!
//! Device names come from sysfs (`/sys/class/video4linux/videoN/name`). Opening
//! a device first asks ffprobe which size and rate the driver negotiates for
//! the requested format, then spawns ffmpeg reading `/dev/videoN` at that size
//! and writing raw RGB24 frames to stdout, so every frame has a fixed length
//! and the scanner sees what the camera really delivers. Without ffprobe the
//! requested format is assumed. A reader thread cuts stdout into frames;
//! `read_frame` waits on it with a timeout. Dropping the device kills ffmpeg,
//! which releases the camera.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::device::{CameraBackend, CameraDevice, DeviceFormat};
use crate::frame::{rgb_len, RawFrame};

/// Camera backend for Linux V4L2 devices
#[derive(Debug, Clone)]
pub struct FfmpegCameraBackend {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for FfmpegCameraBackend {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            sysfs_root: PathBuf::from("/sys/class/video4linux"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl FfmpegCameraBackend {
    /// Use the given ffmpeg binary; ffprobe is looked up next to it
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        let ffmpeg_path = ffmpeg_path.into();
        Self {
            ffprobe_path: ffmpeg_path.with_file_name("ffprobe"),
            ffmpeg_path,
            ..Default::default()
        }
    }

    pub fn with_ffprobe(mut self, ffprobe_path: impl Into<PathBuf>) -> Self {
        self.ffprobe_path = ffprobe_path.into();
        self
    }

    /// Override where device names and nodes are looked up
    pub fn with_roots(mut self, sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self.dev_root = dev_root.into();
        self
    }

    fn device_path(&self, index: u32) -> PathBuf {
        self.dev_root.join(format!("video{index}"))
    }

    /// Format the driver settles on for `requested`.
    ///
    /// `Ok(None)` when ffprobe is not installed; an error when the device
    /// could not be opened or reported nothing usable.
    fn negotiate(&self, device: &Path, requested: &DeviceFormat) -> Result<Option<DeviceFormat>> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-f", "v4l2", "-framerate"])
            .arg(requested.fps.to_string())
            .arg("-video_size")
            .arg(format!("{}x{}", requested.width, requested.height))
            .args([
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,avg_frame_rate",
                "-of",
                "csv=p=0",
            ])
            .arg(device)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to run {:?}", self.ffprobe_path)),
        };
        if !output.status.success() {
            bail!(
                "{} did not report a format: {}",
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_probe_output(&stdout, requested)
            .map(Some)
            .with_context(|| format!("Unexpected ffprobe output for {}: {:?}", device.display(), stdout.trim()))
    }
}

/// Parse `width,height,num/den` as printed by ffprobe's csv writer
fn parse_probe_output(text: &str, requested: &DeviceFormat) -> Option<DeviceFormat> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split(',');
    let width: u32 = fields.next()?.trim().parse().ok()?;
    let height: u32 = fields.next()?.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    let fps = fields
        .next()
        .and_then(|rate| {
            let (num, den) = rate.trim().split_once('/')?;
            let (num, den): (f64, f64) = (num.parse().ok()?, den.parse().ok()?);
            (num > 0.0 && den > 0.0).then(|| (num / den).round() as u32)
        })
        .filter(|fps| *fps > 0)
        .unwrap_or(requested.fps);
    Some(DeviceFormat::new(width, height, fps))
}

impl CameraBackend for FfmpegCameraBackend {
    fn display_name(&self, index: u32) -> Option<String> {
        let name_file = self.sysfs_root.join(format!("video{index}")).join("name");
        match std::fs::read_to_string(&name_file) {
            Ok(name) => Some(name.trim().to_string()),
            Err(_) if self.device_path(index).exists() => Some(format!("Video device {index}")),
            Err(_) => None,
        }
    }

    fn open(&self, index: u32, requested: &DeviceFormat) -> Result<Box<dyn CameraDevice>> {
        let device = self.device_path(index);
        let format = match self.negotiate(&device, requested)? {
            Some(format) => format,
            None => {
                warn!(camera = index, "ffprobe not found, assuming the requested format");
                *requested
            }
        };
        let size = format!("{}x{}", format.width, format.height);

        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "v4l2".to_string(),
            "-framerate".to_string(),
            format.fps.to_string(),
            "-video_size".to_string(),
            size.clone(),
            "-i".to_string(),
            device.to_string_lossy().into_owned(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-s".to_string(),
            size.clone(),
            "-".to_string(), // Output to stdout
        ];

        debug!(camera = index, "ffmpeg args: {:?}", args);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}. Is ffmpeg installed?", self.ffmpeg_path))?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture stdout from ffmpeg")?;

        let frame_len = rgb_len(format.width, format.height);
        let (tx, rx) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name(format!("ffmpeg-reader-{index}"))
            .spawn(move || read_frames(stdout, frame_len, tx))
            .context("Failed to spawn ffmpeg reader thread")?;

        info!(camera = index, "Opened {:?} at {}@{}fps", device, size, format.fps);

        Ok(Box::new(FfmpegDevice {
            index,
            child: Some(child),
            frames: rx,
            format,
        }))
    }
}

/// Cut the raw stdout stream into fixed-size frames
fn read_frames(mut stdout: ChildStdout, frame_len: usize, tx: SyncSender<std::io::Result<Bytes>>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {
                if tx.send(Ok(Bytes::from(buf))).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

struct FfmpegDevice {
    index: u32,
    child: Option<Child>,
    frames: Receiver<std::io::Result<Bytes>>,
    format: DeviceFormat,
}

impl CameraDevice for FfmpegDevice {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(Ok(pixels)) => Ok(Some(RawFrame::new(self.format.width, self.format.height, pixels))),
            Ok(Err(e)) => Err(e).with_context(|| format!("ffmpeg stream for camera {} ended", self.index)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("ffmpeg reader for camera {} exited", self.index),
        }
    }

    fn format(&self) -> DeviceFormat {
        self.format
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!(camera = self.index, "Stopping ffmpeg");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
