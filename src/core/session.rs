use std::fmt;
use std::time::Duration;

use image::DynamicImage;
use serde::Serialize;

use crate::camera::FrameSource;
use crate::core::descriptor::Descriptor;
use crate::core::extractor::DescriptorExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Enroll,
    Verify,
}

/// Monotonic per-controller identifier of a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailure {
    /// The extractor found no face in the frozen frame.
    TargetLost,
    /// No frame could be frozen.
    SensorUnavailable,
}

/// One frame frozen for one extractor call.
pub struct CaptureSession {
    attempt: AttemptId,
    mode: CaptureMode,
    frame: DynamicImage,
}

/// The consumed result of a `CaptureSession`.
pub struct CaptureAttempt {
    pub attempt: AttemptId,
    pub mode: CaptureMode,
    pub frame: DynamicImage,
    pub outcome: Result<Descriptor, CaptureFailure>,
}

impl CaptureSession {
    /// Freezes the current frame. Fails when the source has nothing to give.
    pub fn freeze(
        attempt: AttemptId,
        mode: CaptureMode,
        frames: &dyn FrameSource,
    ) -> Result<Self, CaptureFailure> {
        match frames.current_frame() {
            Ok(frame) => Ok(Self { attempt, mode, frame }),
            Err(e) => {
                tracing::warn!("Capture {} could not freeze a frame: {}", attempt, e);
                Err(CaptureFailure::SensorUnavailable)
            }
        }
    }

    /// Waits out the dwell delay, then calls the extractor exactly once.
    pub async fn run(self, extractor: &dyn DescriptorExtractor, dwell: Duration) -> CaptureAttempt {
        if !dwell.is_zero() {
            tokio::time::sleep(dwell).await;
        }

        let outcome = match extractor.extract(&self.frame).await {
            Ok(Some(descriptor)) => {
                tracing::debug!(
                    "Capture {} produced descriptor {} ({} values)",
                    self.attempt,
                    descriptor.fingerprint(),
                    descriptor.len()
                );
                Ok(descriptor)
            }
            Ok(None) => Err(CaptureFailure::TargetLost),
            Err(e) => {
                tracing::warn!("Extractor failed during capture {}: {}", self.attempt, e);
                Err(CaptureFailure::TargetLost)
            }
        };

        CaptureAttempt {
            attempt: self.attempt,
            mode: self.mode,
            frame: self.frame,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::StillFrameSource;
    use crate::common::{FaceGateError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExtractor {
        calls: AtomicUsize,
        result: fn() -> Result<Option<Descriptor>>,
    }

    #[async_trait]
    impl DescriptorExtractor for CountingExtractor {
        async fn extract(&self, _image: &DynamicImage) -> Result<Option<Descriptor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn extractor(result: fn() -> Result<Option<Descriptor>>) -> CountingExtractor {
        CountingExtractor { calls: AtomicUsize::new(0), result }
    }

    #[test]
    fn freeze_fails_without_a_frame() {
        let source = StillFrameSource::disconnected();
        let err = CaptureSession::freeze(AttemptId(1), CaptureMode::Enroll, &source).err();
        assert_eq!(err, Some(CaptureFailure::SensorUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_for_dwell_then_extracts_once() {
        let source = StillFrameSource::from_image(DynamicImage::new_luma8(3, 3));
        let extractor = extractor(|| Ok(Some(Descriptor::new(vec![0.5, 0.5]).unwrap())));

        let session = CaptureSession::freeze(AttemptId(7), CaptureMode::Verify, &source).unwrap();
        let started = tokio::time::Instant::now();
        let attempt = session.run(&extractor, Duration::from_millis(2200)).await;

        assert!(started.elapsed() >= Duration::from_millis(2200));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(attempt.attempt, AttemptId(7));
        assert_eq!(attempt.mode, CaptureMode::Verify);
        assert_eq!(attempt.frame.width(), 3);
        assert_eq!(attempt.outcome, Ok(Descriptor::new(vec![0.5, 0.5]).unwrap()));
    }

    #[tokio::test]
    async fn no_face_is_target_lost() {
        let source = StillFrameSource::from_image(DynamicImage::new_luma8(3, 3));
        let extractor = extractor(|| Ok(None));

        let session = CaptureSession::freeze(AttemptId(1), CaptureMode::Enroll, &source).unwrap();
        let attempt = session.run(&extractor, Duration::ZERO).await;
        assert_eq!(attempt.outcome, Err(CaptureFailure::TargetLost));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extractor_error_is_not_retried() {
        let source = StillFrameSource::from_image(DynamicImage::new_luma8(3, 3));
        let extractor = extractor(|| Err(FaceGateError::Model("inference failed".into())));

        let session = CaptureSession::freeze(AttemptId(2), CaptureMode::Enroll, &source).unwrap();
        let attempt = session.run(&extractor, Duration::ZERO).await;
        assert_eq!(attempt.outcome, Err(CaptureFailure::TargetLost));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attempt_ids_order_and_display() {
        assert!(AttemptId(2) > AttemptId(1));
        assert_eq!(AttemptId(42).to_string(), "#42");
    }
}
