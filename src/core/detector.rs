use crate::common::{Config, FaceGateError, Result};
use crate::common::config::DetectorConfig;
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// YOLO-style single-class face detector.
pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: DetectorConfig,
}

impl FaceDetector {
    pub fn new(config: &Config) -> Result<Self> {
        let model_path = &config.models.detector_path;
        if !model_path.exists() {
            return Err(FaceGateError::Model(
                format!("Detector model not found at: {:?}", model_path)
            ));
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?
        );

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)
            .map_err(|e| FaceGateError::Model(format!("Failed to load detector {:?}: {}", model_path, e)))?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.detector.clone(),
        })
    }

    /// Detected faces in original image coordinates, highest confidence first.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let img_array = if image.width() == self.config.input_width
            && image.height() == self.config.input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(
                self.config.input_width,
                self.config.input_height,
                FilterType::Nearest
            );
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        // Scale back to the frame the caller handed in
        let scale_x = orig_width / self.config.input_width as f32;
        let scale_y = orig_height / self.config.input_height as f32;

        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in gray.enumerate_pixels() {
            let value = pixel[0] as f32 * norm_factor;
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = value;
            array[[0, 1, y, x]] = value;
            array[[0, 2, y, x]] = value;
        }

        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>> {
        let Some(first) = outputs.first() else {
            return Ok(Vec::new());
        };

        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let values = output
            .as_slice()
            .ok_or_else(|| FaceGateError::Model("Detector output is not contiguous".into()))?;

        // [1, N, 5] or the transposed [1, 5, N]
        let (num_predictions, prediction_length, is_transposed) = match shape.as_slice() {
            [_, a, b] if b > a && *a <= 10 => (*b, *a, true),
            [_, a, b] => (*a, *b, false),
            [a, b] => (*a, *b, false),
            other => {
                tracing::warn!("Unexpected detector output shape: {:?}", other);
                return Ok(Vec::new());
            }
        };
        if prediction_length < 4 {
            tracing::warn!("Detector prediction length {} too short", prediction_length);
            return Ok(Vec::new());
        }

        let at = |i: usize, field: usize| -> f32 {
            if field >= prediction_length {
                return 0.0;
            }
            if is_transposed {
                values[field * num_predictions + i]
            } else {
                values[i * prediction_length + field]
            }
        };

        let input_w = self.config.input_width as f32;
        let input_h = self.config.input_height as f32;
        let mut faces = Vec::new();

        for i in 0..num_predictions {
            let (cx, cy, w, h, confidence) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3), at(i, 4));
            if confidence <= 0.001 {
                continue;
            }

            // Normalized coordinates come back in [0, 1]
            let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 { 1.0 } else { input_w };
            let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

            let x1 = (cx - w / 2.0).max(0.0);
            let y1 = (cy - h / 2.0).max(0.0);
            let x2 = (cx + w / 2.0).min(input_w);
            let y2 = (cy + h / 2.0).min(input_h);

            if x2 - x1 > 10.0 && y2 - y1 > 10.0 {
                faces.push(FaceBox { x1, y1, x2, y2, confidence });
            }
        }

        let mut faces = apply_nms(faces, self.config.nms_iou);
        faces.retain(|face| face.confidence >= self.config.confidence);
        faces.truncate(5);

        Ok(faces)
    }
}

/// Greedy non-maximum suppression. Output is sorted by confidence, highest first.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| calculate_iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

pub fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = box1.area() + box2.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
