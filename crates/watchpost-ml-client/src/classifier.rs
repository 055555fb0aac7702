//! The frame classification seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use watchpost_models::{DetectedIncident, FrameImage};

use crate::error::MlResult;

/// Detects incidents in a single frame.
///
/// Implementations must tolerate concurrent calls for different frames.
#[async_trait]
pub trait FrameClassifier: Send + Sync {
    async fn classify(
        &self,
        image: &FrameImage,
        video_timestamp: f64,
        wall_clock: DateTime<Utc>,
    ) -> MlResult<Vec<DetectedIncident>>;
}
