use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;

use crate::common::{Config, FaceGateError, Result};
use crate::core::descriptor::Descriptor;
use crate::core::detector::FaceDetector;
use crate::core::recognizer::FaceRecognizer;

/// Face detection plus descriptor extraction, loaded once and shared.
///
/// Contract:
/// - `Ok(Some(_))`: one face was found and described. When several faces are
///   visible, implementations return the highest-confidence detection.
/// - `Ok(None)`: no face in the image.
/// - `Err(_)`: the extractor itself failed (inference error).
///
/// Calling `extract` twice on the same still image must yield descriptors
/// within negligible numeric tolerance of each other.
#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    async fn extract(&self, image: &DynamicImage) -> Result<Option<Descriptor>>;
}

/// ONNX-backed extractor: a detector model followed by a descriptor model.
pub struct OnnxExtractor {
    models: Arc<FaceModels>,
}

struct FaceModels {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Loads both models. Failure here leaves the gate non-operational.
    pub fn load(config: &Config) -> Result<Self> {
        tracing::info!(
            "Loading face models: detector={}, recognizer={}",
            config.models.detector_path.display(),
            config.models.recognizer_path.display()
        );

        let detector = FaceDetector::new(config)?;
        let recognizer = FaceRecognizer::new(config)?;

        tracing::info!("Face models loaded");
        Ok(Self {
            models: Arc::new(FaceModels { detector, recognizer }),
        })
    }
}

impl FaceModels {
    fn describe(&self, image: &DynamicImage) -> Result<Option<Descriptor>> {
        let faces = self.detector.detect(image)?;

        let Some(face) = faces.first() else {
            tracing::debug!("No face found in {}x{} frame", image.width(), image.height());
            return Ok(None);
        };

        if faces.len() > 1 {
            tracing::debug!(
                "{} faces in frame, using highest confidence {:.3}",
                faces.len(),
                face.confidence
            );
        }

        let descriptor = self.recognizer.get_descriptor(image, face)?;
        Ok(Some(descriptor))
    }
}

#[async_trait]
impl DescriptorExtractor for OnnxExtractor {
    async fn extract(&self, image: &DynamicImage) -> Result<Option<Descriptor>> {
        let models = Arc::clone(&self.models);
        let frame = image.clone();
        run_blocking(move || models.describe(&frame)).await
    }
}

/// Runs inference on the blocking pool so timers and status watchers keep
/// running meanwhile.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FaceGateError::Model(format!("Inference task failed: {}", e)))?
}
