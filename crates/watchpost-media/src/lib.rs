//! Frame sources and frame extraction.
//!
//! This crate provides:
//! - A uniform [`FrameSource`] over seekable files and push-only live inputs
//! - FFmpeg-backed adapters for files, camera devices and network streams
//! - The [`FrameExtractor`], which samples a source at a fixed interval
//!   with seek-driven or timer-driven scheduling
//! - Cancellation via a tokio `watch` channel

pub mod capture;
pub mod command;
pub mod error;
pub mod extractor;
pub mod file_source;
pub mod live_source;
pub mod mjpeg;
pub mod probe;
pub mod source;

pub use capture::{encode_frame, DEFAULT_JPEG_QUALITY};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use extractor::{
    ExtractionConfig, ExtractionEnd, ExtractionEvent, ExtractionEvents, ExtractionOutcome,
    FrameExtractor,
};
pub use file_source::FfmpegFileSource;
pub use live_source::{FfmpegLiveSource, LiveInput, LiveSourceConfig};
pub use probe::{probe_video, VideoInfo};
pub use source::{FrameSource, LiveSource, PresentedFrame, Readiness, SeekableSource, SourceMetadata};
