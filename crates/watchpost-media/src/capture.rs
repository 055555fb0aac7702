//! Encoding presented rasters into frame images.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use watchpost_models::FrameImage;

use crate::error::{MediaError, MediaResult};

/// Default JPEG quality for captured frames.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Encode a raster as JPEG.
pub fn encode_frame(raster: &RgbImage, quality: u8) -> MediaResult<FrameImage> {
    let (width, height) = raster.dimensions();
    if width == 0 || height == 0 {
        return Err(MediaError::capture("cannot capture a frame with zero dimensions"));
    }

    let mut jpeg = Vec::with_capacity(raster.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(raster.as_raw(), width, height, ColorType::Rgb8)
        .map_err(|e| MediaError::capture(format!("JPEG encode failed: {}", e)))?;

    Ok(FrameImage::from_jpeg(jpeg, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_encode_produces_jpeg() {
        let raster = RgbImage::from_pixel(16, 8, Rgb([200, 10, 10]));
        let image = encode_frame(&raster, 90).unwrap();
        assert_eq!((image.width(), image.height()), (16, 8));
        assert_eq!(&image.bytes()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_zero_dimensions_is_capture_error() {
        let raster = RgbImage::new(0, 0);
        assert!(encode_frame(&raster, 80).unwrap_err().is_capture_failure());
    }
}
