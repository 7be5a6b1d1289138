use crate::common::{Config, FaceGateError, Result};
use crate::common::config::RecognizerConfig;
use crate::core::descriptor::Descriptor;
use crate::core::detector::FaceBox;
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

pub struct FaceRecognizer {
    session: Session,
    _environment: Arc<Environment>,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    pub fn new(config: &Config) -> Result<Self> {
        let model_path = &config.models.recognizer_path;
        if !model_path.exists() {
            return Err(FaceGateError::Model(
                format!("Recognition model not found at: {:?}", model_path)
            ));
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name("face_recognizer")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?
        );

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)
            .map_err(|e| FaceGateError::Model(format!("Failed to load recognizer {:?}: {}", model_path, e)))?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.recognizer.clone(),
        })
    }

    pub fn get_descriptor(&self, image: &DynamicImage, face: &FaceBox) -> Result<Descriptor> {
        let face_img = crop_face(image, face);

        let resized = face_img.resize_exact(
            self.config.input_size,
            self.config.input_size,
            FilterType::Triangle
        );

        let input_array = self.preprocess_face(&resized);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;

        let outputs = self.session.run(vec![input_tensor])?;
        let first = outputs
            .first()
            .ok_or_else(|| FaceGateError::Model("Recognizer produced no output".into()))?;
        let mut values = first.try_extract::<f32>()?.view().iter().copied().collect::<Vec<f32>>();

        if self.config.l2_normalize {
            l2_normalize(&mut values);
        }

        Descriptor::new(values)
    }

    fn preprocess_face(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let size = self.config.input_size as usize;
        let norm_val = self.config.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));

        for (x, y, pixel) in gray.enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm_val) / norm_val;
        }

        array
    }
}

/// Crops `face` out of `image`, clamped to the image bounds.
pub fn crop_face(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
    let x = (face.x1.max(0.0) as u32).min(image.width().saturating_sub(1));
    let y = (face.y1.max(0.0) as u32).min(image.height().saturating_sub(1));
    let width = ((face.x2 - face.x1).max(1.0) as u32).min(image.width() - x).max(1);
    let height = ((face.y2 - face.y1).max(1.0) as u32).min(image.height() - y).max(1);

    image.crop_imm(x, y, width, height)
}

pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in values.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let mut values = vec![3.0, 4.0];
        l2_normalize(&mut values);
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector_alone() {
        let mut values = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut values);
        assert_eq!(values, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn crop_is_clamped_to_image() {
        let image = DynamicImage::new_luma8(100, 80);
        let face = FaceBox { x1: 90.0, y1: 70.0, x2: 140.0, y2: 120.0, confidence: 0.9 };
        let cropped = crop_face(&image, &face);
        assert_eq!(cropped.width(), 10);
        assert_eq!(cropped.height(), 10);
    }
}
