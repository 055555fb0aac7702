//! Push-only sources: local camera devices and network streams.
//!
//! One FFmpeg process re-encodes the input as MJPEG on stdout. A reader task
//! keeps only the most recent image; a stderr task watches for access
//! refusals. Captures read whatever image is current.

use async_trait::async_trait;
use image::io::Reader as ImageReader;
use image::ImageFormat;
use regex::Regex;
use std::io::Cursor;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::mjpeg::JpegSplitter;
use crate::source::{LiveSource, PresentedFrame, Readiness, SourceMetadata};

/// What to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveInput {
    /// Local capture device, e.g. `/dev/video0` or `0`
    Camera { device: String },
    /// Network stream URL (RTSP, HLS, HTTP MJPEG, ...)
    Stream { url: String },
}

impl LiveInput {
    fn command(&self, fps: u32) -> FfmpegCommand {
        match self {
            LiveInput::Camera { device } => {
                FfmpegCommand::new(device_input(device)).input_format(camera_format())
            }
            LiveInput::Stream { url } => {
                let cmd = FfmpegCommand::new(url.as_str());
                if url.starts_with("rtsp://") {
                    cmd.input_arg("-rtsp_transport").input_arg("tcp")
                } else {
                    cmd
                }
            }
        }
        .input_arg("-nostats")
        .log_level("warning")
        .mjpeg_stream(fps)
    }
}

#[cfg(target_os = "linux")]
fn camera_format() -> &'static str {
    "v4l2"
}

#[cfg(target_os = "macos")]
fn camera_format() -> &'static str {
    "avfoundation"
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn camera_format() -> &'static str {
    "dshow"
}

fn device_input(device: &str) -> String {
    if cfg!(not(any(target_os = "linux", target_os = "macos"))) && !device.starts_with("video=") {
        format!("video={}", device)
    } else {
        device.to_string()
    }
}

/// Configuration for live sources.
#[derive(Debug, Clone)]
pub struct LiveSourceConfig {
    /// Rate at which FFmpeg refreshes the latest image
    pub fps: u32,
    /// How long to wait for the first image
    pub metadata_timeout: Duration,
}

impl Default for LiveSourceConfig {
    fn default() -> Self {
        Self {
            fps: 2,
            metadata_timeout: Duration::from_secs(30),
        }
    }
}

/// Latest state published by the background tasks.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveFeed {
    pub frame: Option<LatestImage>,
    pub ended: bool,
    pub denied: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct LatestImage {
    pub jpeg: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl LiveFeed {
    fn readiness(&self) -> Readiness {
        if let Some(reason) = &self.denied {
            return Readiness::Denied(reason.clone());
        }
        if self.ended {
            return Readiness::NotReady("stream ended".to_string());
        }
        match &self.frame {
            None => Readiness::NotReady("no frame received yet".to_string()),
            Some(f) if f.width == 0 || f.height == 0 => {
                Readiness::NotReady("frame has zero dimensions".to_string())
            }
            Some(_) => Readiness::Ready,
        }
    }
}

static ACCESS_REFUSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:server returned|http error) 40[13]\b|\b401 unauthori[sz]ed\b|\b403 forbidden\b|permission denied",
    )
    .unwrap()
});

/// Longest stderr record kept before it is flushed unterminated.
const MAX_STDERR_RECORD: usize = 4096;

/// Map an FFmpeg stderr record to an access refusal, if it is one.
pub(crate) fn access_denied_reason(line: &str) -> Option<String> {
    ACCESS_REFUSED
        .is_match(line)
        .then(|| line.trim().to_string())
}

/// Splits FFmpeg stderr into records on `\n` or `\r`.
///
/// Progress output rewrites one terminal line with `\r`, so treating only
/// `\n` as a terminator would glue every update together.
#[derive(Debug, Default)]
pub(crate) struct StderrRecords {
    pending: Vec<u8>,
}

impl StderrRecords {
    /// Append a chunk and return every non-blank record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut records);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_STDERR_RECORD {
                    self.flush_into(&mut records);
                }
            }
        }
        records
    }

    /// Whatever is left once the stream closes.
    pub fn finish(&mut self) -> Option<String> {
        let mut records = Vec::new();
        self.flush_into(&mut records);
        records.pop()
    }

    fn flush_into(&mut self, records: &mut Vec<String>) {
        let record = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !record.is_empty() {
            records.push(record);
        }
    }
}

fn jpeg_dimensions(jpeg: &[u8]) -> Option<(u32, u32)> {
    ImageReader::with_format(Cursor::new(jpeg), ImageFormat::Jpeg)
        .into_dimensions()
        .ok()
}

/// Camera or stream source driven by a background FFmpeg process.
pub struct FfmpegLiveSource {
    input: LiveInput,
    config: LiveSourceConfig,
    child: Option<Child>,
    feed_rx: Option<watch::Receiver<LiveFeed>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FfmpegLiveSource {
    pub fn new(input: LiveInput, config: LiveSourceConfig) -> Self {
        Self {
            input,
            config,
            child: None,
            feed_rx: None,
            tasks: Vec::new(),
        }
    }

    pub fn camera(device: impl Into<String>) -> Self {
        Self::new(
            LiveInput::Camera {
                device: device.into(),
            },
            LiveSourceConfig::default(),
        )
    }

    pub fn stream(url: impl Into<String>) -> Self {
        Self::new(LiveInput::Stream { url: url.into() }, LiveSourceConfig::default())
    }

    pub fn with_config(mut self, config: LiveSourceConfig) -> Self {
        self.config = config;
        self
    }

    fn start(&mut self) -> MediaResult<watch::Receiver<LiveFeed>> {
        if let Some(rx) = &self.feed_rx {
            return Ok(rx.clone());
        }

        let cmd = self.input.command(self.config.fps);
        let mut child = FfmpegRunner::new().spawn(&cmd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::source("ffmpeg stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::source("ffmpeg stderr not captured"))?;

        let (tx, rx) = watch::channel(LiveFeed::default());
        let tx = Arc::new(tx);

        let frame_tx = Arc::clone(&tx);
        let reader = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut splitter = JpegSplitter::new();
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        // Only the newest completed image matters
                        if let Some(jpeg) = splitter.push(&chunk[..n]).pop() {
                            let (width, height) = jpeg_dimensions(&jpeg).unwrap_or((0, 0));
                            frame_tx.send_modify(|feed| {
                                feed.frame = Some(LatestImage {
                                    jpeg: jpeg.into(),
                                    width,
                                    height,
                                })
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Live source read failed: {}", e);
                        break;
                    }
                }
            }
            frame_tx.send_modify(|feed| feed.ended = true);
        });

        let err_tx = Arc::clone(&tx);
        let stderr_watch = tokio::spawn(async move {
            let mut stderr = stderr;
            let mut records = StderrRecords::default();
            let mut chunk = vec![0u8; 4096];
            let report = |line: String| {
                if let Some(reason) = access_denied_reason(&line) {
                    warn!("Live source refused access: {}", reason);
                    err_tx.send_modify(|feed| {
                        feed.denied.get_or_insert(reason);
                    });
                } else {
                    debug!("ffmpeg: {}", line);
                }
            };
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => records.push(&chunk[..n]).into_iter().for_each(&report),
                }
            }
            records.finish().into_iter().for_each(&report);
        });

        info!("Started live source {}", self.describe());
        self.child = Some(child);
        self.tasks = vec![reader, stderr_watch];
        self.feed_rx = Some(rx.clone());
        Ok(rx)
    }

    fn current(&self) -> LiveFeed {
        self.feed_rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LiveSource for FfmpegLiveSource {
    async fn load_metadata(&mut self) -> MediaResult<SourceMetadata> {
        let mut rx = self.start()?;
        let secs = self.config.metadata_timeout.as_secs();

        let feed = tokio::time::timeout(
            self.config.metadata_timeout,
            rx.wait_for(|f| f.frame.is_some() || f.ended || f.denied.is_some()),
        )
        .await
        .map_err(|_| MediaError::source(format!("no frame from {} within {}s", self.describe(), secs)))?
        .map_err(|_| MediaError::source("live source closed"))?
        .clone();

        if let Some(reason) = feed.denied {
            return Err(MediaError::access_denied(reason));
        }
        match feed.frame {
            Some(frame) => Ok(SourceMetadata {
                duration: None,
                width: frame.width,
                height: frame.height,
            }),
            None => Err(MediaError::source(format!(
                "{} ended before presenting a frame",
                self.describe()
            ))),
        }
    }

    fn readiness(&self) -> Readiness {
        self.current().readiness()
    }

    fn snapshot_now(&mut self) -> MediaResult<PresentedFrame> {
        let feed = self.current();
        if let Some(reason) = feed.denied {
            return Err(MediaError::access_denied(reason));
        }
        let frame = feed
            .frame
            .ok_or_else(|| MediaError::capture("no frame is being presented"))?;
        let raster = image::load_from_memory_with_format(&frame.jpeg, ImageFormat::Jpeg)
            .map_err(|e| MediaError::capture(format!("decode presented frame: {}", e)))?
            .into_rgb8();

        Ok(PresentedFrame {
            raster,
            current_time: 0.0,
        })
    }

    async fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("Live source already exited: {}", e);
            }
            info!("Released live source {}", self.describe());
        }
        self.feed_rx = None;
    }

    fn describe(&self) -> String {
        match &self.input {
            LiveInput::Camera { device } => format!("camera:{}", device),
            LiveInput::Stream { url } => format!("stream:{}", url),
        }
    }
}

impl Drop for FfmpegLiveSource {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}
