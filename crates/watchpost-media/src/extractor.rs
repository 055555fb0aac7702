//! Frame extraction.
//!
//! Drives a [`FrameSource`] through a sequence of captures and reports
//! frames, progress and errors over an [`ExtractionEvents`] channel.
//!
//! - Seekable sources are sampled at `0, interval, 2*interval, ...` plus one
//!   final capture at exactly `duration`, then the run completes.
//! - Live sources are captured on a timer, first tick immediately, until
//!   cancelled. Ticks on a source that is not ready are skipped.
//!
//! The source is released on every exit path.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use watchpost_models::Frame;

use crate::capture::{encode_frame, DEFAULT_JPEG_QUALITY};
use crate::error::{MediaError, MediaResult};
use crate::source::{FrameSource, LiveSource, Readiness, SeekableSource};

/// Extraction settings.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Time between captures
    pub interval: Duration,
    /// JPEG quality for captured frames (1-100)
    pub jpeg_quality: u8,
    /// How long a source may take to report metadata
    pub metadata_timeout: Duration,
    /// Stop a live run on the first access refusal instead of skipping ticks
    pub stop_on_security_fault: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            metadata_timeout: Duration::from_secs(30),
            stop_on_security_fault: false,
        }
    }
}

impl ExtractionConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn stop_on_security_fault(mut self, stop: bool) -> Self {
        self.stop_on_security_fault = stop;
        self
    }
}

/// Something the extractor reports while running.
#[derive(Debug, Clone)]
pub enum ExtractionEvent {
    Frame(Frame),
    /// Progress (0-100), bounded runs only
    Progress(u8),
    Error { message: String, security: bool },
}

/// Sending half of the extraction event channel.
///
/// Progress values are clamped to [0, 100] and never decrease.
#[derive(Debug)]
pub struct ExtractionEvents {
    tx: mpsc::UnboundedSender<ExtractionEvent>,
    last_progress: Option<u8>,
}

impl ExtractionEvents {
    pub fn new(tx: mpsc::UnboundedSender<ExtractionEvent>) -> Self {
        Self {
            tx,
            last_progress: None,
        }
    }

    /// Create a connected pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExtractionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn last_progress(&self) -> Option<u8> {
        self.last_progress
    }

    fn frame(&self, frame: Frame) {
        // A dropped receiver means nobody is listening any more
        let _ = self.tx.send(ExtractionEvent::Frame(frame));
    }

    fn progress(&mut self, percent: f64) {
        let value = percent.clamp(0.0, 100.0).floor() as u8;
        if self.last_progress.is_some_and(|last| value <= last) {
            return;
        }
        self.last_progress = Some(value);
        let _ = self.tx.send(ExtractionEvent::Progress(value));
    }

    fn error(&self, err: &MediaError) {
        let _ = self.tx.send(ExtractionEvent::Error {
            message: err.to_string(),
            security: err.is_security_fault(),
        });
    }
}

/// Why a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionEnd {
    /// Every target of a bounded source was captured
    Completed,
    /// Zero duration or zero dimensions: nothing to sample
    EmptySource,
    /// Cancelled through the stop signal
    Stopped,
    /// A live source refused access and the run was configured to stop
    SecurityStop { message: String },
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutcome {
    pub frames_emitted: u64,
    pub end: ExtractionEnd,
}

impl ExtractionOutcome {
    fn new(frames_emitted: u64, end: ExtractionEnd) -> Self {
        Self { frames_emitted, end }
    }
}

/// Resolve once `cancel` becomes true. Never resolves if the sender is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Samples frames from a source.
#[derive(Debug, Clone, Default)]
pub struct FrameExtractor {
    config: ExtractionConfig,
}

impl FrameExtractor {
    pub fn new(config: ExtractionConfig) -> MediaResult<Self> {
        if config.interval.is_zero() {
            return Err(MediaError::source("extraction interval must be positive"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Run extraction until the source is exhausted, fails or is cancelled.
    ///
    /// Fatal errors are also reported on `events` before being returned.
    pub async fn run(
        &self,
        source: &mut FrameSource,
        events: &mut ExtractionEvents,
        mut cancel: watch::Receiver<bool>,
    ) -> MediaResult<ExtractionOutcome> {
        info!(
            source = %source.describe(),
            interval_secs = self.config.interval.as_secs_f64(),
            "Starting frame extraction"
        );

        let result = match source {
            FrameSource::Seekable(s) => self.run_bounded(s.as_mut(), events, &mut cancel).await,
            FrameSource::Live(s) => self.run_timed(s.as_mut(), events, &mut cancel).await,
        };

        source.release().await;

        match &result {
            Ok(outcome) => info!(
                frames = outcome.frames_emitted,
                end = ?outcome.end,
                "Frame extraction finished"
            ),
            Err(e) => {
                warn!("Frame extraction failed: {}", e);
                events.error(e);
            }
        }
        result
    }

    async fn run_bounded(
        &self,
        source: &mut dyn SeekableSource,
        events: &mut ExtractionEvents,
        cancel: &mut watch::Receiver<bool>,
    ) -> MediaResult<ExtractionOutcome> {
        if *cancel.borrow() {
            return Ok(ExtractionOutcome::new(0, ExtractionEnd::Stopped));
        }

        let metadata = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => return Ok(ExtractionOutcome::new(0, ExtractionEnd::Stopped)),
            loaded = tokio::time::timeout(self.config.metadata_timeout, source.load_metadata()) => {
                loaded.map_err(|_| {
                    MediaError::source(format!(
                        "metadata did not load within {}s",
                        self.config.metadata_timeout.as_secs()
                    ))
                })??
            }
        };

        if metadata.is_empty() {
            warn!(
                duration = ?metadata.duration,
                width = metadata.width,
                height = metadata.height,
                "Source has zero duration or dimensions, nothing to extract"
            );
            events.error(&MediaError::source(
                "video seems to have no duration or dimensions, nothing to sample",
            ));
            events.progress(100.0);
            return Ok(ExtractionOutcome::new(0, ExtractionEnd::EmptySource));
        }

        let duration = metadata.duration.unwrap_or_default();
        let interval = self.config.interval.as_secs_f64();
        let estimated = ((duration / interval).floor() as u64).max(1);

        let mut step: u64 = 0;
        let mut emitted: u64 = 0;
        let mut current_time = 0.0;
        let mut final_seek = false;

        loop {
            let target = step as f64 * interval;
            let seek_target = if target <= duration {
                target
            } else if !final_seek && current_time < duration {
                final_seek = true;
                duration
            } else {
                break;
            };

            debug!(target_secs = seek_target, "Seeking");
            let presented = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => {
                    return Ok(ExtractionOutcome::new(emitted, ExtractionEnd::Stopped));
                }
                presented = source.seek_to(seek_target) => presented?,
            };

            current_time = presented.current_time;
            let image = encode_frame(&presented.raster, self.config.jpeg_quality)?;
            events.frame(Frame::new(image, current_time));

            emitted += 1;
            events.progress(emitted as f64 / estimated as f64 * 100.0);
            step += 1;
        }

        events.progress(100.0);
        Ok(ExtractionOutcome::new(emitted, ExtractionEnd::Completed))
    }

    async fn run_timed(
        &self,
        source: &mut dyn LiveSource,
        events: &mut ExtractionEvents,
        cancel: &mut watch::Receiver<bool>,
    ) -> MediaResult<ExtractionOutcome> {
        if *cancel.borrow() {
            return Ok(ExtractionOutcome::new(0, ExtractionEnd::Stopped));
        }

        tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => return Ok(ExtractionOutcome::new(0, ExtractionEnd::Stopped)),
            loaded = tokio::time::timeout(self.config.metadata_timeout, source.load_metadata()) => {
                let metadata = loaded.map_err(|_| {
                    MediaError::source(format!(
                        "source did not start within {}s",
                        self.config.metadata_timeout.as_secs()
                    ))
                })??;
                debug!(width = metadata.width, height = metadata.height, "Live source ready");
            }
        }

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut emitted: u64 = 0;
        let mut denial_reported = false;

        loop {
            tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => {
                    return Ok(ExtractionOutcome::new(emitted, ExtractionEnd::Stopped));
                }
                _ = ticker.tick() => {}
            }

            let video_timestamp = started.elapsed().as_secs_f64();

            let fault = match source.readiness() {
                Readiness::Ready => {
                    match source
                        .snapshot_now()
                        .and_then(|presented| encode_frame(&presented.raster, self.config.jpeg_quality))
                    {
                        Ok(image) => {
                            events.frame(Frame::new(image, video_timestamp));
                            emitted += 1;
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                Readiness::NotReady(reason) => {
                    warn!(video_ts = video_timestamp, "Skipping capture: {}", reason);
                    continue;
                }
                Readiness::Denied(reason) => MediaError::access_denied(reason),
            };

            if fault.is_security_fault() {
                if self.config.stop_on_security_fault {
                    warn!("Stopping capture after access refusal: {}", fault);
                    events.error(&fault);
                    return Ok(ExtractionOutcome::new(
                        emitted,
                        ExtractionEnd::SecurityStop {
                            message: fault.to_string(),
                        },
                    ));
                }
                if denial_reported {
                    continue;
                }
                denial_reported = true;
            }

            warn!(video_ts = video_timestamp, "Capture skipped: {}", fault);
            events.error(&fault);
        }
    }
}
