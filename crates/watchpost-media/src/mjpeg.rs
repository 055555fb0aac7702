//! Splitting a concatenated MJPEG byte stream into individual JPEG images.

/// Largest single JPEG accepted before the buffer is discarded.
pub const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

/// Incremental splitter: feed arbitrary chunks, take out complete images.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buffer: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Append a chunk and return every JPEG completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
            frames.push(self.buffer[start..end].to_vec());
            self.buffer.drain(..end);
        }

        if self.buffer.len() > MAX_JPEG_BYTES {
            // Keep a trailing 0xFF in case it starts the next marker
            let keep = 1.min(self.buffer.len());
            let drain_len = self.buffer.len() - keep;
            self.buffer.drain(..drain_len);
        }

        frames
    }

    /// Bytes held waiting for the rest of an image.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Locate the first SOI..EOI span.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
