//! End-to-end session tests with in-memory sources, classifier and reporter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use watchpost_media::{
    FrameSource, LiveSource, MediaResult, PresentedFrame, Readiness, SeekableSource,
    SourceMetadata,
};
use watchpost_ml_client::{FrameClassifier, MlError, MlResult};
use watchpost_models::{
    AnalysisMode, DetectedIncident, FrameImage, IncidentRecord, SessionEvent, SessionOutcome,
    SessionSummary,
};
use watchpost_worker::{
    IncidentReporter, NotificationOutcome, ReportOutcome, SessionHandle, SessionManager,
    WatchpostConfig, WorkerError, WorkerResult,
};

struct FakeFile {
    duration: f64,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl SeekableSource for FakeFile {
    async fn load_metadata(&mut self) -> MediaResult<SourceMetadata> {
        Ok(SourceMetadata {
            duration: Some(self.duration),
            width: 8,
            height: 8,
        })
    }

    async fn seek_to(&mut self, t: f64) -> MediaResult<PresentedFrame> {
        Ok(PresentedFrame {
            raster: RgbImage::from_pixel(8, 8, Rgb([40, 40, 40])),
            current_time: t,
        })
    }

    async fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "fake-file".into()
    }
}

struct FakeCamera {
    released: Arc<AtomicBool>,
}

#[async_trait]
impl LiveSource for FakeCamera {
    async fn load_metadata(&mut self) -> MediaResult<SourceMetadata> {
        Ok(SourceMetadata {
            duration: None,
            width: 4,
            height: 4,
        })
    }

    fn readiness(&self) -> Readiness {
        Readiness::Ready
    }

    fn snapshot_now(&mut self) -> MediaResult<PresentedFrame> {
        Ok(PresentedFrame {
            raster: RgbImage::from_pixel(4, 4, Rgb([200, 10, 10])),
            current_time: 0.0,
        })
    }

    async fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "fake-camera".into()
    }
}

type Script = dyn Fn(f64, DateTime<Utc>) -> MlResult<Vec<DetectedIncident>> + Send + Sync;

struct ScriptedClassifier(Box<Script>);

#[async_trait]
impl FrameClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        _image: &FrameImage,
        video_timestamp: f64,
        wall_clock: DateTime<Utc>,
    ) -> MlResult<Vec<DetectedIncident>> {
        (self.0)(video_timestamp, wall_clock)
    }
}

/// Classifier that takes `delay` per frame and records when each call began.
struct SlowClassifier {
    delay: Duration,
    calls: Mutex<Vec<(f64, tokio::time::Instant)>>,
}

impl SlowClassifier {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(f64, tokio::time::Instant)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FrameClassifier for SlowClassifier {
    async fn classify(
        &self,
        _image: &FrameImage,
        video_timestamp: f64,
        _wall_clock: DateTime<Utc>,
    ) -> MlResult<Vec<DetectedIncident>> {
        self.calls
            .lock()
            .unwrap()
            .push((video_timestamp, tokio::time::Instant::now()));
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingReporter {
    records: Mutex<Vec<IncidentRecord>>,
    notification_fails: bool,
}

impl RecordingReporter {
    fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl IncidentReporter for RecordingReporter {
    async fn report(&self, record: &IncidentRecord) -> WorkerResult<ReportOutcome> {
        self.records.lock().unwrap().push(record.clone());
        let notification = if self.notification_fails {
            NotificationOutcome::Failed {
                error: "smtp down".into(),
            }
        } else {
            NotificationOutcome::Sent {
                message_id: Some("msg-1".into()),
            }
        };
        Ok(ReportOutcome {
            incident_id: record.id.clone(),
            notification,
            frame_size_warning: None,
        })
    }
}

fn loitering(_ts: f64, now: DateTime<Utc>) -> MlResult<Vec<DetectedIncident>> {
    Ok(vec![DetectedIncident::new(
        "Suspicious Activity",
        format!(
            "Observed at {}: person loitering",
            now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        ),
        "North Gate",
    )])
}

fn manager(classifier: Box<Script>, reporter: Arc<RecordingReporter>) -> SessionManager {
    SessionManager::new(
        WatchpostConfig::default(),
        Arc::new(ScriptedClassifier(classifier)),
        reporter,
    )
}

fn file(duration: f64) -> (FrameSource, Arc<AtomicBool>) {
    let released = Arc::new(AtomicBool::new(false));
    let source = FrameSource::seekable(FakeFile {
        duration,
        released: released.clone(),
    });
    (source, released)
}

fn camera() -> (FrameSource, Arc<AtomicBool>) {
    let released = Arc::new(AtomicBool::new(false));
    let source = FrameSource::live(FakeCamera {
        released: released.clone(),
    });
    (source, released)
}

async fn collect(handle: &mut SessionHandle) -> (Vec<SessionEvent>, SessionSummary) {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    let summary = handle.wait().await.expect("session should publish a summary");
    (events, summary)
}

#[tokio::test]
async fn test_upload_reports_each_incident_once_per_session() {
    let reporter = Arc::new(RecordingReporter::default());
    let manager = manager(Box::new(loitering), reporter.clone());

    let (source, released) = file(12.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    let (events, summary) = collect(&mut handle).await;

    assert_eq!(summary.frames_processed, 4);
    assert_eq!(summary.incidents_accepted, 1);
    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(
        summary.headline(),
        "1 new unique incident(s) identified across 4 frames"
    );
    assert_eq!(reporter.count(), 1);
    assert!(released.load(Ordering::SeqCst));

    assert!(matches!(events.first(), Some(SessionEvent::Started { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress { value } => Some(*value),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));

    // A fresh start clears the seen set, so the same incident is reported again
    let (source, _) = file(12.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    let (_, summary) = collect(&mut handle).await;
    assert_eq!(summary.incidents_accepted, 1);
    assert_eq!(reporter.count(), 2);
}

#[tokio::test]
async fn test_classification_failure_does_not_abort_run() {
    let reporter = Arc::new(RecordingReporter::default());
    let classifier = |ts: f64, _now: DateTime<Utc>| -> MlResult<Vec<DetectedIncident>> {
        if ts == 5.0 {
            return Err(MlError::Http {
                status: 500,
                body: "model overloaded".into(),
            });
        }
        Ok(vec![DetectedIncident::new(
            "Theft",
            format!("bag taken at {}", ts),
            "Platform 1",
        )])
    };
    let manager = manager(Box::new(classifier), reporter.clone());

    let (source, _) = file(20.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    let (events, summary) = collect(&mut handle).await;

    assert_eq!(summary.frames_processed, 5);
    assert_eq!(summary.incidents_accepted, 4);
    assert_eq!(reporter.count(), 4);

    let failures: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ClassificationFailed { video_timestamp, .. } => Some(*video_timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![5.0]);

    let mut reported: Vec<f64> = reporter
        .records
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.video_timestamp)
        .collect();
    reported.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(reported, vec![0.0, 10.0, 15.0, 20.0]);
}

#[tokio::test]
async fn test_notification_failure_is_reported_separately() {
    let reporter = Arc::new(RecordingReporter {
        notification_fails: true,
        ..Default::default()
    });
    let manager = manager(Box::new(loitering), reporter.clone());

    let (source, _) = file(3.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    let (events, summary) = collect(&mut handle).await;

    assert_eq!(summary.incidents_accepted, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::IncidentSaved { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::NotificationFailed { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::ReportingFailed { .. })));
}

#[tokio::test]
async fn test_empty_source_completes_without_frames() {
    let reporter = Arc::new(RecordingReporter::default());
    let manager = manager(Box::new(loitering), reporter.clone());

    let (source, released) = file(0.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    let (events, summary) = collect(&mut handle).await;

    assert_eq!(summary.outcome, SessionOutcome::EmptySource);
    assert_eq!(summary.headline(), "No frames processed");
    let notice = events
        .iter()
        .position(|e| match e {
            SessionEvent::ExtractionError { message } => message.contains("no duration or dimensions"),
            _ => false,
        })
        .expect("the operator is told why nothing was sampled");
    let done = events
        .iter()
        .position(|e| *e == SessionEvent::Progress { value: 100 })
        .expect("progress is forced to 100");
    assert!(notice < done);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(reporter.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_external_access_refusal_forces_stop() {
    let reporter = Arc::new(RecordingReporter::default());
    let classifier = |_ts: f64, _now: DateTime<Utc>| -> MlResult<Vec<DetectedIncident>> {
        Err(MlError::Http {
            status: 403,
            body: "forbidden".into(),
        })
    };
    let manager = manager(Box::new(classifier), reporter.clone());

    let (source, released) = camera();
    let mut handle = manager
        .start_session(AnalysisMode::External, source, None)
        .await
        .unwrap();
    let (events, summary) = tokio::time::timeout(Duration::from_secs(120), collect(&mut handle))
        .await
        .expect("session should stop on its own");

    assert_eq!(summary.outcome, SessionOutcome::Stopped);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::SecurityStop { .. })));
    assert_eq!(events.last(), Some(&SessionEvent::Stopped));
    assert!(released.load(Ordering::SeqCst));
    assert!(!manager.is_running(AnalysisMode::External).await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_keeps_seen_set_until_next_start() {
    let reporter = Arc::new(RecordingReporter::default());
    let manager = manager(Box::new(loitering), reporter.clone());

    let (source, released) = camera();
    let mut handle = manager
        .start_session(AnalysisMode::Live, source, Some(Duration::from_secs(2)))
        .await
        .unwrap();

    loop {
        match handle.next_event().await {
            Some(SessionEvent::IncidentSaved { .. }) => break,
            Some(_) => {}
            None => panic!("session ended before reporting"),
        }
    }
    // Let a few more ticks through; the same incident must not be reported again
    tokio::time::sleep(Duration::from_secs(7)).await;

    let summary = manager
        .stop_session(AnalysisMode::Live)
        .await
        .expect("live session was running");
    assert_eq!(summary.outcome, SessionOutcome::Stopped);
    assert!(summary.frames_processed >= 2);
    assert_eq!(summary.incidents_accepted, 1);
    assert_eq!(reporter.count(), 1);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(manager.seen_count(AnalysisMode::Live).await, 1);

    // Stopping again is a no-op
    assert!(manager.stop_session(AnalysisMode::Live).await.is_none());

    let (source, _) = camera();
    let _handle = manager
        .start_session(AnalysisMode::Live, source, None)
        .await
        .unwrap();
    assert_eq!(manager.seen_count(AnalysisMode::Live).await, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_modes_do_not_share_seen_sets() {
    let reporter = Arc::new(RecordingReporter::default());
    let manager = manager(Box::new(loitering), reporter.clone());

    let (source, _) = file(4.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    collect(&mut handle).await;

    assert_eq!(manager.seen_count(AnalysisMode::Upload).await, 1);
    assert_eq!(manager.seen_count(AnalysisMode::Live).await, 0);
    assert_eq!(manager.seen_count(AnalysisMode::External).await, 0);
}

#[tokio::test]
async fn test_source_must_match_mode() {
    let manager = manager(Box::new(loitering), Arc::new(RecordingReporter::default()));

    let (source, released) = camera();
    let err = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .err()
        .expect("a live source cannot back an upload session");
    assert!(matches!(err, WorkerError::ConfigError(_)));
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_live_analysis_keeps_up_with_slow_classifier() {
    let classifier = Arc::new(SlowClassifier::new(Duration::from_secs(20)));
    let reporter = Arc::new(RecordingReporter::default());
    let config = WatchpostConfig {
        max_in_flight: 4,
        ..Default::default()
    };
    let manager = SessionManager::new(config, classifier.clone(), reporter);

    let (source, released) = camera();
    let started = tokio::time::Instant::now();
    let mut handle = manager
        .start_session(AnalysisMode::Live, source, Some(Duration::from_secs(1)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    let summary = manager
        .stop_session(AnalysisMode::Live)
        .await
        .expect("live session was running");

    let calls = classifier.calls();
    assert!(!calls.is_empty());
    // Each analysed frame is classified as soon as it is captured, never from a backlog
    for (video_timestamp, at) in &calls {
        let lag = (*at - started).as_secs_f64() - video_timestamp;
        assert!(lag < 1.0, "frame at {video_timestamp}s classified {lag}s late");
    }
    // Four slots, 20s per frame, 120s of capture
    assert!(calls.len() <= 4 * 7, "{} classify calls", calls.len());
    assert_eq!(summary.frames_processed, calls.len() as u64);

    let mut skipped = 0;
    while let Some(event) = handle.try_next_event() {
        if matches!(event, SessionEvent::FrameSkipped { .. }) {
            skipped += 1;
        }
    }
    assert!(skipped > 60, "{skipped} frames skipped");
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_upload_waits_for_analysis_slots() {
    let classifier = Arc::new(SlowClassifier::new(Duration::from_secs(10)));
    let config = WatchpostConfig {
        max_in_flight: 1,
        ..Default::default()
    };
    let manager = SessionManager::new(
        config,
        classifier.clone(),
        Arc::new(RecordingReporter::default()),
    );

    let (source, _) = file(12.0);
    let mut handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();
    let (events, summary) = collect(&mut handle).await;

    // Bounded runs queue instead of skipping, so every target is analysed
    assert_eq!(summary.frames_processed, 4);
    let mut analysed: Vec<f64> = classifier.calls().iter().map(|(ts, _)| *ts).collect();
    analysed.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(analysed, vec![0.0, 5.0, 10.0, 12.0]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::FrameSkipped { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_frames_waiting_for_a_slot_are_dropped_on_stop() {
    let classifier = Arc::new(SlowClassifier::new(Duration::from_secs(30)));
    let config = WatchpostConfig {
        max_in_flight: 1,
        ..Default::default()
    };
    let manager = SessionManager::new(
        config,
        classifier.clone(),
        Arc::new(RecordingReporter::default()),
    );

    let (source, released) = file(60.0);
    let _handle = manager
        .start_session(AnalysisMode::Upload, source, None)
        .await
        .unwrap();

    // The first frame holds the only slot; the next one is waiting for it
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(classifier.calls().len(), 1);

    let summary = manager
        .stop_session(AnalysisMode::Upload)
        .await
        .expect("upload session was running");

    assert_eq!(classifier.calls().len(), 1);
    assert_eq!(summary.frames_processed, 1);
    assert!(released.load(Ordering::SeqCst));
}
