//! Session control: one analysis context per mode.
//!
//! A session couples a frame source, an extractor and an orchestrator. Each
//! mode owns its seen set, which is cleared when a session starts and left
//! untouched when one stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{warn, Instrument};
use watchpost_media::{
    ExtractionConfig, ExtractionEnd, ExtractionEvent, ExtractionEvents, ExtractionOutcome,
    FrameExtractor, FrameSource, MediaResult,
};
use watchpost_ml_client::FrameClassifier;
use watchpost_models::{AnalysisMode, SessionEvent, SessionId, SessionOutcome, SessionSummary};

use crate::config::WatchpostConfig;
use crate::dedup::SessionSeenSet;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::SessionLogger;
use crate::orchestrator::AnalysisOrchestrator;
use crate::reporter::IncidentReporter;

/// A session that has been spawned and not yet reaped.
struct RunningSession {
    session_id: SessionId,
    stop: Arc<watch::Sender<bool>>,
    summary: watch::Receiver<Option<SessionSummary>>,
    task: JoinHandle<()>,
}

impl RunningSession {
    async fn stop(self) -> Option<SessionSummary> {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(session_id = %self.session_id, "Session task failed: {}", e);
        }
        let summary = self.summary.borrow().clone();
        summary
    }
}

#[derive(Default)]
struct SessionContext {
    seen: Arc<SessionSeenSet>,
    run: Option<RunningSession>,
}

/// Caller's view of a started session.
pub struct SessionHandle {
    session_id: SessionId,
    mode: AnalysisMode,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    summary: watch::Receiver<Option<SessionSummary>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    /// Next session event. `None` once the session has finished and every
    /// event has been delivered.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the terminal summary.
    pub async fn wait(&mut self) -> Option<SessionSummary> {
        if let Ok(summary) = self.summary.wait_for(Option::is_some).await {
            return summary.clone();
        }
        self.summary.borrow().clone()
    }

    /// Terminal summary, if the session has finished.
    pub fn summary(&self) -> Option<SessionSummary> {
        self.summary.borrow().clone()
    }
}

/// Starts and stops analysis sessions, one per mode at a time.
pub struct SessionManager {
    config: WatchpostConfig,
    classifier: Arc<dyn FrameClassifier>,
    reporter: Arc<dyn IncidentReporter>,
    upload: Mutex<SessionContext>,
    live: Mutex<SessionContext>,
    external: Mutex<SessionContext>,
}

impl SessionManager {
    pub fn new(
        config: WatchpostConfig,
        classifier: Arc<dyn FrameClassifier>,
        reporter: Arc<dyn IncidentReporter>,
    ) -> Self {
        Self {
            config,
            classifier,
            reporter,
            upload: Mutex::default(),
            live: Mutex::default(),
            external: Mutex::default(),
        }
    }

    pub fn config(&self) -> &WatchpostConfig {
        &self.config
    }

    fn context(&self, mode: AnalysisMode) -> &Mutex<SessionContext> {
        match mode {
            AnalysisMode::Upload => &self.upload,
            AnalysisMode::Live => &self.live,
            AnalysisMode::External => &self.external,
        }
    }

    /// Start a session for `mode`, replacing any session already running in it.
    ///
    /// The mode's seen set is cleared before extraction begins. `interval`
    /// overrides the configured interval for this mode.
    pub async fn start_session(
        &self,
        mode: AnalysisMode,
        mut source: FrameSource,
        interval: Option<Duration>,
    ) -> WorkerResult<SessionHandle> {
        if source.is_bounded() != mode.is_bounded() {
            let message = format!(
                "{} sessions need a {} source, got {}",
                mode,
                if mode.is_bounded() { "seekable" } else { "live" },
                source.describe()
            );
            source.release().await;
            return Err(WorkerError::config_error(message));
        }

        let extraction_config = ExtractionConfig {
            interval: interval.unwrap_or_else(|| self.config.interval_for(mode)),
            jpeg_quality: self.config.jpeg_quality,
            metadata_timeout: self.config.metadata_timeout,
            stop_on_security_fault: mode == AnalysisMode::External,
        };
        let extractor = match FrameExtractor::new(extraction_config) {
            Ok(extractor) => extractor,
            Err(e) => {
                source.release().await;
                return Err(e.into());
            }
        };

        let mut ctx = self.context(mode).lock().await;
        if let Some(previous) = ctx.run.take() {
            previous.stop().await;
        }
        ctx.seen.clear();

        let session_id = SessionId::new();
        let logger = SessionLogger::new(&session_id, mode);
        logger.log_start(&source.describe());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (summary_tx, summary_rx) = watch::channel(None);

        let _ = events_tx.send(SessionEvent::started(session_id.clone(), mode));

        let orchestrator = AnalysisOrchestrator::new(
            Arc::clone(&self.classifier),
            Arc::clone(&self.reporter),
            Arc::clone(&ctx.seen),
            mode,
            session_id.clone(),
            events_tx.clone(),
            Arc::clone(&stop_tx),
        );

        let run = SessionRun {
            mode,
            extractor,
            orchestrator,
            stop: Arc::clone(&stop_tx),
            events: events_tx,
            max_in_flight: self.config.max_in_flight.max(1),
            logger: logger.clone(),
        };
        let task = tokio::spawn(
            async move {
                let summary = run.execute(source).await;
                summary_tx.send_replace(Some(summary));
            }
            .instrument(logger.create_span()),
        );

        ctx.run = Some(RunningSession {
            session_id: session_id.clone(),
            stop: stop_tx,
            summary: summary_rx.clone(),
            task,
        });

        Ok(SessionHandle {
            session_id,
            mode,
            events: events_rx,
            summary: summary_rx,
        })
    }

    /// Stop the session running in `mode` and wait for its resources to be
    /// released. The mode's seen set is kept.
    ///
    /// Returns the session's summary, or `None` if no session was started.
    pub async fn stop_session(&self, mode: AnalysisMode) -> Option<SessionSummary> {
        let run = self.context(mode).lock().await.run.take()?;
        run.stop().await
    }

    pub async fn is_running(&self, mode: AnalysisMode) -> bool {
        self.context(mode)
            .lock()
            .await
            .run
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Number of incident keys accepted in the mode's current or last session.
    pub async fn seen_count(&self, mode: AnalysisMode) -> usize {
        self.context(mode).lock().await.seen.len()
    }

    /// Stop every running session.
    pub async fn shutdown(&self) {
        for mode in AnalysisMode::ALL {
            self.stop_session(mode).await;
        }
    }
}

enum Admission {
    Run(OwnedSemaphorePermit),
    Skip,
    Closed,
}

/// Everything the spawned session task owns.
struct SessionRun {
    mode: AnalysisMode,
    extractor: FrameExtractor,
    orchestrator: AnalysisOrchestrator,
    stop: Arc<watch::Sender<bool>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    max_in_flight: usize,
    logger: SessionLogger,
}

impl SessionRun {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Claim an analysis slot for a frame.
    ///
    /// Bounded runs wait for a slot. Live runs never queue: a frame that
    /// arrives while every slot is busy is dropped, so analysis keeps up
    /// with the newest captures.
    async fn admit(&self, limiter: &Arc<Semaphore>, video_timestamp: f64) -> Admission {
        if self.mode.is_bounded() {
            return match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => Admission::Run(permit),
                Err(_) => Admission::Closed,
            };
        }
        match Arc::clone(limiter).try_acquire_owned() {
            Ok(permit) => Admission::Run(permit),
            Err(TryAcquireError::NoPermits) => {
                self.logger.log_warning(&format!(
                    "Skipping frame at {:.1}s, {} analyses still running",
                    video_timestamp, self.max_in_flight
                ));
                self.emit(SessionEvent::FrameSkipped { video_timestamp });
                Admission::Skip
            }
            Err(TryAcquireError::Closed) => Admission::Closed,
        }
    }

    async fn execute(self, mut source: FrameSource) -> SessionSummary {
        let (mut extraction_events, mut frames) = ExtractionEvents::channel();
        let cancel = self.stop.subscribe();
        let extractor = self.extractor.clone();
        let extraction: JoinHandle<MediaResult<ExtractionOutcome>> = tokio::spawn(
            async move {
                extractor
                    .run(&mut source, &mut extraction_events, cancel)
                    .await
            }
            .in_current_span(),
        );

        let limiter = Arc::new(Semaphore::new(self.max_in_flight));
        let mut pipelines = JoinSet::new();

        while let Some(event) = frames.recv().await {
            match event {
                ExtractionEvent::Frame(frame) => {
                    if *self.stop.borrow() {
                        continue;
                    }
                    let permit = match self.admit(&limiter, frame.video_timestamp).await {
                        Admission::Run(permit) => permit,
                        Admission::Skip => continue,
                        Admission::Closed => break,
                    };
                    // A stop may have arrived while waiting for a slot
                    if *self.stop.borrow() {
                        continue;
                    }
                    let orchestrator = self.orchestrator.clone();
                    pipelines.spawn(
                        async move {
                            let _permit = permit;
                            orchestrator.analyze_frame(frame).await;
                        }
                        .in_current_span(),
                    );
                }
                ExtractionEvent::Progress(value) => self.emit(SessionEvent::progress(value)),
                ExtractionEvent::Error { message, security } => {
                    if security {
                        self.logger.log_error(&message);
                    } else {
                        self.logger.log_warning(&message);
                    }
                    self.emit(SessionEvent::ExtractionError { message });
                }
            }

            while let Some(finished) = pipelines.try_join_next() {
                if let Err(e) = finished {
                    self.logger.log_error(&format!("Frame analysis task failed: {}", e));
                }
            }
        }

        let extraction = extraction.await;
        while let Some(finished) = pipelines.join_next().await {
            if let Err(e) = finished {
                self.logger.log_error(&format!("Frame analysis task failed: {}", e));
            }
        }

        let outcome = match extraction {
            Ok(Ok(outcome)) => match outcome.end {
                ExtractionEnd::Completed => SessionOutcome::Completed,
                ExtractionEnd::EmptySource => SessionOutcome::EmptySource,
                ExtractionEnd::Stopped => SessionOutcome::Stopped,
                ExtractionEnd::SecurityStop { message } => {
                    self.emit(SessionEvent::SecurityStop { message });
                    SessionOutcome::Stopped
                }
            },
            Ok(Err(e)) => SessionOutcome::Failed {
                message: e.to_string(),
            },
            Err(e) => SessionOutcome::Failed {
                message: format!("extraction task failed: {}", e),
            },
        };

        let summary = self.orchestrator.summary(outcome);
        match &summary.outcome {
            SessionOutcome::Stopped => {
                self.logger.log_completion(&format!("stopped, {}", summary.headline()));
                self.emit(SessionEvent::Stopped);
            }
            SessionOutcome::Failed { message } => {
                self.logger.log_error(message);
                self.emit(SessionEvent::Completed {
                    summary: summary.clone(),
                });
            }
            _ => {
                self.logger.log_completion(&summary.headline());
                self.emit(SessionEvent::Completed {
                    summary: summary.clone(),
                });
            }
        }
        summary
    }
}
