//! Frame source abstraction.
//!
//! A source either supports seeking to an arbitrary position (files) or only
//! exposes whatever frame it is currently presenting (camera devices and
//! network streams). The extractor picks its scheduling strategy from the
//! [`FrameSource`] variant.

use async_trait::async_trait;
use image::RgbImage;

use crate::error::MediaResult;

/// Metadata reported once a source has loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceMetadata {
    /// Total length in seconds; `None` for live sources
    pub duration: Option<f64>,
    /// Width in pixels (0 until known)
    pub width: u32,
    /// Height in pixels (0 until known)
    pub height: u32,
}

impl SourceMetadata {
    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Whether a bounded source has nothing to sample.
    pub fn is_empty(&self) -> bool {
        !self.has_dimensions() || !matches!(self.duration, Some(d) if d > 0.0 && d.is_finite())
    }
}

/// A decoded frame as presented by the source.
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub raster: RgbImage,
    /// Source position of the presented frame, in seconds
    pub current_time: f64,
}

/// Whether a push-only source can be captured right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Transient condition; the capture is skipped
    NotReady(String),
    /// The source refused access; continuing is pointless
    Denied(String),
}

/// A source that can present the frame at any position.
#[async_trait]
pub trait SeekableSource: Send {
    /// Load duration and dimensions.
    async fn load_metadata(&mut self) -> MediaResult<SourceMetadata>;

    /// Resolve once the frame at `t` seconds has been presented.
    async fn seek_to(&mut self, t: f64) -> MediaResult<PresentedFrame>;

    /// Release any handle held by the source. Must be idempotent.
    async fn release(&mut self);

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// A push-only source that presents frames on its own schedule.
#[async_trait]
pub trait LiveSource: Send {
    /// Start the source and wait for its first frame.
    async fn load_metadata(&mut self) -> MediaResult<SourceMetadata>;

    fn readiness(&self) -> Readiness;

    /// Capture whatever frame is being presented right now.
    fn snapshot_now(&mut self) -> MediaResult<PresentedFrame>;

    /// Release any handle held by the source. Must be idempotent.
    async fn release(&mut self);

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// A frame source tagged by capability.
pub enum FrameSource {
    Seekable(Box<dyn SeekableSource>),
    Live(Box<dyn LiveSource>),
}

impl FrameSource {
    pub fn seekable(source: impl SeekableSource + 'static) -> Self {
        FrameSource::Seekable(Box::new(source))
    }

    pub fn live(source: impl LiveSource + 'static) -> Self {
        FrameSource::Live(Box::new(source))
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, FrameSource::Seekable(_))
    }

    pub async fn release(&mut self) {
        match self {
            FrameSource::Seekable(source) => source.release().await,
            FrameSource::Live(source) => source.release().await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FrameSource::Seekable(source) => source.describe(),
            FrameSource::Live(source) => source.describe(),
        }
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSource::Seekable(_) => write!(f, "FrameSource::Seekable({})", self.describe()),
            FrameSource::Live(_) => write!(f, "FrameSource::Live({})", self.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_emptiness() {
        let meta = SourceMetadata {
            duration: Some(12.0),
            width: 640,
            height: 480,
        };
        assert!(!meta.is_empty());
        assert!(SourceMetadata { duration: Some(0.0), ..meta }.is_empty());
        assert!(SourceMetadata { width: 0, ..meta }.is_empty());
        assert!(SourceMetadata { duration: Some(f64::INFINITY), ..meta }.is_empty());
    }
}
