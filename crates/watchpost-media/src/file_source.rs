//! Seekable source backed by a video file.

use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_video, VideoInfo};
use crate::source::{PresentedFrame, SeekableSource, SourceMetadata};

/// Decodes single frames from a file with one FFmpeg invocation per seek.
#[derive(Debug)]
pub struct FfmpegFileSource {
    path: PathBuf,
    info: Option<VideoInfo>,
    metadata_timeout_secs: u64,
    seek_timeout_secs: u64,
}

impl FfmpegFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            info: None,
            metadata_timeout_secs: 30,
            seek_timeout_secs: 30,
        }
    }

    pub fn with_metadata_timeout(mut self, secs: u64) -> Self {
        self.metadata_timeout_secs = secs;
        self
    }

    pub fn with_seek_timeout(mut self, secs: u64) -> Self {
        self.seek_timeout_secs = secs;
        self
    }

    fn info(&self) -> MediaResult<&VideoInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| MediaError::source("metadata not loaded"))
    }
}

/// Position to decode for a requested seek target.
///
/// FFmpeg yields nothing when asked for a frame at or past the last one, so
/// a seek to the very end decodes the final frame instead.
fn decode_position(target: f64, info: &VideoInfo) -> f64 {
    let last_frame = (info.duration - 1.0 / info.fps.max(1.0)).max(0.0);
    target.clamp(0.0, last_frame)
}

#[async_trait]
impl SeekableSource for FfmpegFileSource {
    async fn load_metadata(&mut self) -> MediaResult<SourceMetadata> {
        let info = probe_video(&self.path, self.metadata_timeout_secs)
            .await
            .map_err(|e| match e {
                MediaError::FileNotFound(_) | MediaError::Timeout(_) | MediaError::FfprobeFailed { .. } => {
                    MediaError::source(format!("could not load metadata for {}: {}", self.path.display(), e))
                }
                other => other,
            })?;

        let metadata = SourceMetadata {
            duration: Some(info.duration),
            width: info.width,
            height: info.height,
        };
        self.info = Some(info);
        Ok(metadata)
    }

    async fn seek_to(&mut self, t: f64) -> MediaResult<PresentedFrame> {
        let info = self.info()?;
        let (width, height) = (info.width, info.height);
        let position = decode_position(t, info);
        debug!(target_secs = t, position, "Seeking {}", self.path.display());

        let cmd = FfmpegCommand::new(self.path.to_string_lossy())
            .seek(position)
            .no_autorotate()
            .single_frame()
            .raw_rgb();
        let pixels = FfmpegRunner::new()
            .with_timeout(self.seek_timeout_secs)
            .capture_stdout(&cmd)
            .await
            .map_err(|e| MediaError::source(format!("decode at {:.3}s failed: {}", t, e)))?;

        if pixels.is_empty() {
            return Err(MediaError::source(format!("no frame decoded at {:.3}s", t)));
        }

        let expected = width as usize * height as usize * 3;
        let pixels = if pixels.len() > expected {
            pixels[..expected].to_vec()
        } else {
            pixels
        };
        let raster = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
            MediaError::source(format!(
                "decoded frame at {:.3}s does not match {}x{}",
                t, width, height
            ))
        })?;

        Ok(PresentedFrame {
            raster,
            current_time: t,
        })
    }

    async fn release(&mut self) {
        // Every decode is a short-lived process; only cached state remains
        self.info = None;
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
