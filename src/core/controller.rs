//! Capture-and-match controller.
//!
//! Phases:
//! - `Offline`: no extractor loaded; every capture request is refused
//! - `Idle → Capturing`: on `begin_enroll` / `begin_verify` when preconditions hold
//! - `Capturing → Accepted | Rejected`: when the capture attempt resolves
//! - `Accepted | Rejected → Idle`: after the cooldown
//!
//! At most one capture is in flight. Requests arriving while the phase is not
//! `Idle` are ignored, not queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::camera::FrameSource;
use crate::common::{Config, FaceGateError, Result};
use crate::core::descriptor::Descriptor;
use crate::core::extractor::DescriptorExtractor;
use crate::core::matcher::{self, DEFAULT_THRESHOLD};
use crate::core::session::{AttemptId, CaptureAttempt, CaptureFailure, CaptureMode, CaptureSession};
use crate::storage::EnrollmentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Offline,
    Idle,
    Capturing,
    Accepted,
    Rejected,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Accepted | Phase::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Enrolled,
    Verified,
    /// Verify completed with the distance at or above the threshold.
    Mismatch,
    TargetLost,
    SensorUnavailable,
    NoEnrollment,
    ModelsUnavailable,
    StorageFailure,
    /// The stored descriptor has a different length than the extractor produces.
    IncompatibleEnrollment,
}

/// Snapshot of the controller published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub phase: Phase,
    pub mode: Option<CaptureMode>,
    pub reason: Option<Reason>,
    pub distance: Option<f32>,
    pub attempt: Option<AttemptId>,
    pub enrolled: bool,
}

impl Status {
    fn offline(enrolled: bool) -> Self {
        Self {
            phase: Phase::Offline,
            mode: None,
            reason: None,
            distance: None,
            attempt: None,
            enrolled,
        }
    }

    fn clear_transient(&mut self, phase: Phase) {
        self.phase = phase;
        self.mode = None;
        self.reason = None;
        self.distance = None;
        self.attempt = None;
    }
}

/// Final decision of one completed capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    pub attempt: AttemptId,
    pub phase: Phase,
    pub reason: Reason,
    pub distance: Option<f32>,
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        self.phase == Phase::Accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestOutcome {
    /// The attempt reached `Accepted` or `Rejected`.
    Completed(Verdict),
    /// Preconditions failed; the phase did not change.
    Refused(Reason),
    /// Another capture or decision was in progress.
    Ignored,
    /// The attempt was superseded while in flight; its result was discarded.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub threshold: f32,
    pub dwell: Duration,
    pub cooldown: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.matching.threshold,
            dwell: config.capture.dwell(),
            cooldown: config.capture.cooldown(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dwell: Duration::from_millis(2200),
            cooldown: Duration::from_millis(7000),
        }
    }
}

struct Shared {
    frames: Arc<dyn FrameSource>,
    store: Arc<dyn EnrollmentStore>,
    extractor: RwLock<Option<Arc<dyn DescriptorExtractor>>>,
    settings: ControllerSettings,
    state: Mutex<Status>,
    next_attempt: AtomicU64,
    status_tx: watch::Sender<Status>,
}

/// Cheap to clone; clones drive the same state machine.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

enum Start {
    Run(CaptureSession, Arc<dyn DescriptorExtractor>),
    Done(RequestOutcome),
}

impl Controller {
    /// Starts `Offline` until an extractor is installed.
    pub fn new(
        frames: Arc<dyn FrameSource>,
        store: Arc<dyn EnrollmentStore>,
        settings: ControllerSettings,
    ) -> Self {
        let enrolled = match store.contains() {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!("Could not read enrollment store: {}", e);
                false
            }
        };

        let initial = Status::offline(enrolled);
        let (status_tx, _) = watch::channel(initial.clone());

        Self {
            shared: Arc::new(Shared {
                frames,
                store,
                extractor: RwLock::new(None),
                settings,
                state: Mutex::new(initial),
                next_attempt: AtomicU64::new(0),
                status_tx,
            }),
        }
    }

    pub fn with_extractor(
        frames: Arc<dyn FrameSource>,
        store: Arc<dyn EnrollmentStore>,
        extractor: Arc<dyn DescriptorExtractor>,
        settings: ControllerSettings,
    ) -> Self {
        let controller = Self::new(frames, store, settings);
        controller.install_extractor(extractor);
        controller
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.shared.settings
    }

    pub fn status(&self) -> Status {
        self.lock_state().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.shared.status_tx.subscribe()
    }

    /// Asks the frame source for its stream.
    pub fn acquire_sensor(&self) -> Result<()> {
        self.shared.frames.acquire().map_err(|e| match e {
            FaceGateError::SensorUnavailable(_) => e,
            other => FaceGateError::SensorUnavailable(other.to_string()),
        })?;
        tracing::info!("Sensor acquired");
        Ok(())
    }

    /// Makes the controller operational.
    pub fn install_extractor(&self, extractor: Arc<dyn DescriptorExtractor>) {
        *self.shared.extractor.write().unwrap_or_else(PoisonError::into_inner) = Some(extractor);

        let mut state = self.lock_state();
        if state.phase == Phase::Offline {
            state.clear_transient(Phase::Idle);
            tracing::info!("Extractor ready, controller idle");
            self.publish(&state);
        }
    }

    /// Records a failed model load. The controller stays `Offline` and the
    /// enrollment store is not touched.
    pub fn report_model_failure(&self, err: &FaceGateError) {
        tracing::error!("Face models failed to load: {}", err);
        let mut state = self.lock_state();
        if state.phase == Phase::Offline {
            state.reason = Some(Reason::ModelsUnavailable);
            self.publish(&state);
        }
    }

    pub async fn begin_enroll(&self) -> RequestOutcome {
        self.begin(CaptureMode::Enroll).await
    }

    pub async fn begin_verify(&self) -> RequestOutcome {
        self.begin(CaptureMode::Verify).await
    }

    /// Abandons the in-flight capture, if any, and returns to `Idle`.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock_state();
        if state.phase != Phase::Capturing {
            return false;
        }

        tracing::info!("Capture {} cancelled", display_attempt(state.attempt));
        state.clear_transient(Phase::Idle);
        self.publish(&state);
        true
    }

    /// Deletes the enrollment. Returns `Ok(false)` when a capture or decision
    /// is in progress.
    pub fn clear_enrollment(&self) -> Result<bool> {
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Idle | Phase::Offline) {
            tracing::debug!("Clear ignored in phase {:?}", state.phase);
            return Ok(false);
        }

        self.shared.store.clear()?;
        state.enrolled = false;
        tracing::info!("Enrollment cleared");
        self.publish(&state);
        Ok(true)
    }

    async fn begin(&self, mode: CaptureMode) -> RequestOutcome {
        let (session, extractor) = match self.start(mode) {
            Start::Run(session, extractor) => (session, extractor),
            Start::Done(outcome) => return outcome,
        };

        let attempt = session.run(extractor.as_ref(), self.shared.settings.dwell).await;
        self.resolve(attempt)
    }

    fn start(&self, mode: CaptureMode) -> Start {
        let mut state = self.lock_state();

        match state.phase {
            Phase::Idle => {}
            Phase::Offline => return Start::Done(RequestOutcome::Refused(Reason::ModelsUnavailable)),
            phase => {
                tracing::debug!("{:?} request ignored in phase {:?}", mode, phase);
                return Start::Done(RequestOutcome::Ignored);
            }
        }

        let Some(extractor) = self.extractor() else {
            return Start::Done(RequestOutcome::Refused(Reason::ModelsUnavailable));
        };

        if mode == CaptureMode::Verify {
            match self.shared.store.contains() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("Verify refused: nothing enrolled");
                    return Start::Done(RequestOutcome::Refused(Reason::NoEnrollment));
                }
                Err(e) => {
                    tracing::warn!("Verify refused: enrollment store unreadable: {}", e);
                    return Start::Done(RequestOutcome::Refused(Reason::StorageFailure));
                }
            }
        }

        if !self.shared.frames.is_ready() {
            tracing::info!("{:?} refused: sensor not ready", mode);
            return Start::Done(RequestOutcome::Refused(Reason::SensorUnavailable));
        }

        let attempt = AttemptId(self.shared.next_attempt.fetch_add(1, Ordering::SeqCst) + 1);
        state.phase = Phase::Capturing;
        state.mode = Some(mode);
        state.reason = None;
        state.distance = None;
        state.attempt = Some(attempt);
        tracing::info!("Capture {} started ({:?})", attempt, mode);
        self.publish(&state);

        match CaptureSession::freeze(attempt, mode, self.shared.frames.as_ref()) {
            Ok(session) => Start::Run(session, extractor),
            Err(failure) => {
                let verdict = self.finish(&mut state, attempt, Err(failure_reason(failure)), None);
                Start::Done(RequestOutcome::Completed(verdict))
            }
        }
    }

    fn resolve(&self, attempt: CaptureAttempt) -> RequestOutcome {
        let mut state = self.lock_state();

        // Only the current attempt may apply its result
        if state.phase != Phase::Capturing || state.attempt != Some(attempt.attempt) {
            tracing::info!("Discarding stale result of capture {}", attempt.attempt);
            return RequestOutcome::Superseded;
        }

        let verdict = match attempt.outcome {
            Err(failure) => self.finish(&mut state, attempt.attempt, Err(failure_reason(failure)), None),
            Ok(descriptor) => match attempt.mode {
                CaptureMode::Enroll => self.apply_enroll(&mut state, attempt.attempt, &descriptor),
                CaptureMode::Verify => self.apply_verify(&mut state, attempt.attempt, &descriptor),
            },
        };

        RequestOutcome::Completed(verdict)
    }

    fn apply_enroll(&self, state: &mut Status, attempt: AttemptId, descriptor: &Descriptor) -> Verdict {
        match self.shared.store.put(descriptor) {
            Ok(()) => {
                state.enrolled = true;
                tracing::info!("Enrolled descriptor {}", descriptor.fingerprint());
                self.finish(state, attempt, Ok(Reason::Enrolled), None)
            }
            Err(e) => {
                tracing::warn!("Failed to store enrollment: {}", e);
                self.finish(state, attempt, Err(Reason::StorageFailure), None)
            }
        }
    }

    fn apply_verify(&self, state: &mut Status, attempt: AttemptId, candidate: &Descriptor) -> Verdict {
        let stored = match self.shared.store.get() {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                state.enrolled = false;
                return self.finish(state, attempt, Err(Reason::NoEnrollment), None);
            }
            Err(e) => {
                tracing::warn!("Failed to read enrollment: {}", e);
                return self.finish(state, attempt, Err(Reason::StorageFailure), None);
            }
        };

        match matcher::evaluate(&stored, candidate, self.shared.settings.threshold) {
            Ok(result) if result.accepted => {
                self.finish(state, attempt, Ok(Reason::Verified), Some(result.distance))
            }
            Ok(result) => self.finish(state, attempt, Err(Reason::Mismatch), Some(result.distance)),
            Err(e) => {
                tracing::warn!("Enrollment cannot be compared: {}", e);
                self.finish(state, attempt, Err(Reason::IncompatibleEnrollment), None)
            }
        }
    }

    /// Enters the terminal phase and arms the cooldown for `attempt`.
    fn finish(
        &self,
        state: &mut Status,
        attempt: AttemptId,
        decision: std::result::Result<Reason, Reason>,
        distance: Option<f32>,
    ) -> Verdict {
        let (phase, reason) = match decision {
            Ok(reason) => (Phase::Accepted, reason),
            Err(reason) => (Phase::Rejected, reason),
        };

        state.phase = phase;
        state.reason = Some(reason);
        state.distance = distance;
        match distance {
            Some(d) => tracing::info!("Capture {} {:?}: {:?} (distance {:.4})", attempt, phase, reason, d),
            None => tracing::info!("Capture {} {:?}: {:?}", attempt, phase, reason),
        }
        self.publish(state);
        self.schedule_cooldown(attempt);

        Verdict { attempt, phase, reason, distance }
    }

    fn schedule_cooldown(&self, attempt: AttemptId) {
        let controller = self.clone();
        let cooldown = self.shared.settings.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            controller.end_cooldown(attempt);
        });
    }

    fn end_cooldown(&self, attempt: AttemptId) {
        let mut state = self.lock_state();
        if state.phase.is_terminal() && state.attempt == Some(attempt) {
            state.clear_transient(Phase::Idle);
            tracing::debug!("Cooldown of capture {} elapsed, controller idle", attempt);
            self.publish(&state);
        }
    }

    fn extractor(&self) -> Option<Arc<dyn DescriptorExtractor>> {
        self.shared
            .extractor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, Status> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &Status) {
        self.shared.status_tx.send_replace(state.clone());
    }
}

fn failure_reason(failure: CaptureFailure) -> Reason {
    match failure {
        CaptureFailure::TargetLost => Reason::TargetLost,
        CaptureFailure::SensorUnavailable => Reason::SensorUnavailable,
    }
}

fn display_attempt(attempt: Option<AttemptId>) -> String {
    attempt.map(|a| a.to_string()).unwrap_or_else(|| "-".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::StillFrameSource;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use image::DynamicImage;

    struct FixedExtractor(Option<Vec<f32>>);

    #[async_trait]
    impl DescriptorExtractor for FixedExtractor {
        async fn extract(&self, _image: &DynamicImage) -> Result<Option<Descriptor>> {
            Ok(self.0.clone().map(|v| Descriptor::new(v).unwrap()))
        }
    }

    fn quick_settings() -> ControllerSettings {
        ControllerSettings {
            threshold: DEFAULT_THRESHOLD,
            dwell: Duration::ZERO,
            cooldown: Duration::from_secs(7),
        }
    }

    fn frames() -> Arc<StillFrameSource> {
        Arc::new(StillFrameSource::from_image(DynamicImage::new_luma8(4, 4)))
    }

    #[tokio::test]
    async fn new_controller_is_offline_and_refuses_captures() {
        let controller = Controller::new(frames(), Arc::new(MemoryStore::new()), quick_settings());
        assert_eq!(controller.status().phase, Phase::Offline);
        assert_eq!(
            controller.begin_enroll().await,
            RequestOutcome::Refused(Reason::ModelsUnavailable)
        );
        assert_eq!(controller.status().phase, Phase::Offline);
    }

    #[tokio::test]
    async fn model_failure_keeps_store_intact() {
        let store = Arc::new(MemoryStore::with_descriptor(Descriptor::new(vec![0.1]).unwrap()));
        let controller = Controller::new(frames(), store.clone(), quick_settings());

        controller.report_model_failure(&FaceGateError::Model("missing weights".into()));
        let status = controller.status();
        assert_eq!(status.phase, Phase::Offline);
        assert_eq!(status.reason, Some(Reason::ModelsUnavailable));
        assert!(status.enrolled);
        assert!(store.contains().unwrap());

        controller.install_extractor(Arc::new(FixedExtractor(None)));
        let status = controller.status();
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.reason, None);
    }

    #[tokio::test]
    async fn length_mismatch_is_not_reported_as_mismatch() {
        let store = Arc::new(MemoryStore::with_descriptor(Descriptor::new(vec![0.1, 0.2, 0.3]).unwrap()));
        let controller = Controller::with_extractor(
            frames(),
            store,
            Arc::new(FixedExtractor(Some(vec![0.1, 0.2]))),
            quick_settings(),
        );

        match controller.begin_verify().await {
            RequestOutcome::Completed(verdict) => {
                assert_eq!(verdict.phase, Phase::Rejected);
                assert_eq!(verdict.reason, Reason::IncompatibleEnrollment);
                assert_eq!(verdict.distance, None);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_outside_capture_is_a_no_op() {
        let controller = Controller::with_extractor(
            frames(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedExtractor(None)),
            quick_settings(),
        );
        assert!(!controller.cancel());
        assert_eq!(controller.status().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn clear_enrollment_only_when_idle() {
        let store = Arc::new(MemoryStore::new());
        let controller = Controller::with_extractor(
            frames(),
            store.clone(),
            Arc::new(FixedExtractor(Some(vec![0.4, 0.4]))),
            quick_settings(),
        );

        assert!(matches!(controller.begin_enroll().await, RequestOutcome::Completed(_)));
        assert!(controller.status().enrolled);

        // Still showing the decision
        assert!(!controller.clear_enrollment().unwrap());
        assert!(store.contains().unwrap());

        controller.end_cooldown(AttemptId(1));
        assert!(controller.clear_enrollment().unwrap());
        assert!(!store.contains().unwrap());
        assert!(!controller.status().enrolled);
    }

    #[tokio::test]
    async fn old_cooldown_never_clears_newer_decision() {
        let controller = Controller::with_extractor(
            frames(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedExtractor(Some(vec![0.4, 0.4]))),
            quick_settings(),
        );

        let first = match controller.begin_enroll().await {
            RequestOutcome::Completed(verdict) => verdict.attempt,
            other => panic!("unexpected outcome: {:?}", other),
        };
        controller.end_cooldown(first);

        assert!(matches!(controller.begin_enroll().await, RequestOutcome::Completed(_)));
        controller.end_cooldown(first);

        let status = controller.status();
        assert_eq!(status.phase, Phase::Accepted);
        assert_eq!(status.attempt, Some(AttemptId(2)));
    }

    #[tokio::test]
    async fn clear_enrollment_works_without_models() {
        let store = Arc::new(MemoryStore::with_descriptor(Descriptor::new(vec![0.2]).unwrap()));
        let controller = Controller::new(
            Arc::new(StillFrameSource::disconnected()),
            store.clone(),
            quick_settings(),
        );
        assert!(controller.status().enrolled);

        assert!(controller.clear_enrollment().unwrap());
        assert!(!store.contains().unwrap());
        assert!(!controller.status().enrolled);
        assert_eq!(controller.status().phase, Phase::Offline);
    }
}
