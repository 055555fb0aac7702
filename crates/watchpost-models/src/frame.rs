//! Captured frame types.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::fmt;
use std::sync::Arc;

/// MIME type of every encoded frame.
pub const FRAME_MIME_TYPE: &str = "image/jpeg";

/// A lossy-compressed still image captured from a source.
///
/// The encoded bytes are shared, so cloning a frame image for concurrent
/// classification and reporting does not copy the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameImage {
    jpeg: Arc<[u8]>,
    width: u32,
    height: u32,
}

impl FrameImage {
    /// Wrap already-encoded JPEG bytes.
    pub fn from_jpeg(jpeg: impl Into<Arc<[u8]>>, width: u32, height: u32) -> Self {
        Self {
            jpeg: jpeg.into(),
            width,
            height,
        }
    }

    /// Encoded JPEG bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.jpeg
    }

    /// Size of the encoded payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mime_type(&self) -> &'static str {
        FRAME_MIME_TYPE
    }

    /// Base64 of the encoded bytes, without a data URI prefix.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.jpeg)
    }

    /// Render as a `data:image/jpeg;base64,...` URI.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", FRAME_MIME_TYPE, self.to_base64())
    }
}

impl fmt::Debug for FrameImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameImage")
            .field("bytes", &self.jpeg.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// A frame emitted by the extractor.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded still image
    pub image: FrameImage,
    /// Position in the source, in seconds. For live sources this is the
    /// elapsed time since capture started.
    pub video_timestamp: f64,
}

impl Frame {
    pub fn new(image: FrameImage, video_timestamp: f64) -> Self {
        Self {
            image,
            video_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri() {
        let image = FrameImage::from_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9], 2, 2);
        assert_eq!(image.to_data_uri(), "data:image/jpeg;base64,/9j/2Q==");
        assert_eq!(image.byte_len(), 4);
    }

    #[test]
    fn test_clone_shares_payload() {
        let image = FrameImage::from_jpeg(vec![1u8; 1024], 32, 32);
        let copy = image.clone();
        assert!(std::ptr::eq(image.bytes().as_ptr(), copy.bytes().as_ptr()));
    }
}
