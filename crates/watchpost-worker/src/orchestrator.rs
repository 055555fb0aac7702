//! Per-frame analysis: classify, dedup, report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use watchpost_ml_client::FrameClassifier;
use watchpost_models::{
    AnalysisMode, Frame, IncidentRecord, SessionEvent, SessionId, SessionOutcome, SessionSummary,
};

use crate::dedup::{dedup_frame, SessionSeenSet};
use crate::reporter::{IncidentReporter, NotificationOutcome};

/// Runs the analysis pipeline for the frames of one session.
///
/// Cheap to clone; clones share counters, the seen set and the event sink, so
/// several frames may be in flight at once.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    classifier: Arc<dyn FrameClassifier>,
    reporter: Arc<dyn IncidentReporter>,
    seen: Arc<SessionSeenSet>,
    mode: AnalysisMode,
    session_id: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    stop: Arc<watch::Sender<bool>>,
    frames_processed: Arc<AtomicU64>,
    incidents_accepted: Arc<AtomicU64>,
}

impl AnalysisOrchestrator {
    pub fn new(
        classifier: Arc<dyn FrameClassifier>,
        reporter: Arc<dyn IncidentReporter>,
        seen: Arc<SessionSeenSet>,
        mode: AnalysisMode,
        session_id: SessionId,
        events: mpsc::UnboundedSender<SessionEvent>,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            classifier,
            reporter,
            seen,
            mode,
            session_id,
            events,
            stop,
            frames_processed: Arc::new(AtomicU64::new(0)),
            incidents_accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Analyse one frame. Failures are reported as events and never abort the session.
    ///
    /// Returns the number of incidents accepted from this frame.
    pub async fn analyze_frame(&self, frame: Frame) -> u32 {
        self.frames_processed.fetch_add(1, Ordering::SeqCst);
        let ts = frame.video_timestamp;

        let incidents = match self
            .classifier
            .classify(&frame.image, ts, Utc::now())
            .await
        {
            Ok(incidents) => incidents,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    video_timestamp = ts,
                    "Classification failed: {}",
                    e
                );
                self.emit(SessionEvent::ClassificationFailed {
                    video_timestamp: ts,
                    message: e.to_string(),
                });
                if e.is_security_fault() && self.mode == AnalysisMode::External {
                    self.emit(SessionEvent::SecurityStop {
                        message: format!("Analysis stopped, the stream is not accessible: {}", e),
                    });
                    self.stop.send_replace(true);
                }
                return 0;
            }
        };

        // Check and insert happen in one call, before any reporting runs
        let accepted: Vec<IncidentRecord> = dedup_frame(incidents)
            .into_iter()
            .filter(|(key, _)| self.seen.try_accept(key))
            .map(|(_, incident)| {
                IncidentRecord::accept(incident, &frame, self.mode, self.session_id.clone())
            })
            .collect();

        let count = accepted.len() as u32;
        debug!(video_timestamp = ts, accepted = count, "Frame analysed");
        if count == 0 {
            return 0;
        }

        self.incidents_accepted
            .fetch_add(u64::from(count), Ordering::SeqCst);
        self.emit(SessionEvent::IncidentsReported {
            video_timestamp: ts,
            count,
        });

        for record in &accepted {
            self.report(record).await;
        }
        count
    }

    async fn report(&self, record: &IncidentRecord) {
        match self.reporter.report(record).await {
            Ok(outcome) => {
                self.emit(SessionEvent::IncidentSaved {
                    incident_id: outcome.incident_id.clone(),
                    incident_type: record.incident_type.clone(),
                });
                if let Some(bytes) = outcome.frame_size_warning {
                    self.emit(SessionEvent::LargeFrameWarning { bytes });
                }
                match outcome.notification {
                    NotificationOutcome::Sent { message_id } => {
                        self.emit(SessionEvent::NotificationSent {
                            incident_id: outcome.incident_id,
                            message_id,
                        })
                    }
                    NotificationOutcome::Failed { error } => {
                        self.emit(SessionEvent::NotificationFailed {
                            incident_id: outcome.incident_id,
                            message: error,
                        })
                    }
                    NotificationOutcome::Skipped => {}
                }
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    incident_type = %record.incident_type,
                    "Failed to report incident: {}",
                    e
                );
                self.emit(SessionEvent::ReportingFailed {
                    message: format!("Failed to report {}: {}", record.incident_type, e),
                });
            }
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::SeqCst)
    }

    pub fn incidents_accepted(&self) -> u64 {
        self.incidents_accepted.load(Ordering::SeqCst)
    }

    pub fn summary(&self, outcome: SessionOutcome) -> SessionSummary {
        SessionSummary {
            frames_processed: self.frames_processed(),
            incidents_accepted: self.incidents_accepted(),
            outcome,
        }
    }
}
