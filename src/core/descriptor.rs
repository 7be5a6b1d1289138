use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::{FaceGateError, Result};

/// Fixed-length identity vector produced by a descriptor extractor.
///
/// Serializes as a bare JSON array of numbers. Construction rejects empty
/// vectors and non-finite values, so every `Descriptor` in the system is
/// comparable by Euclidean distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(FaceGateError::InvalidDescriptor("descriptor is empty".into()));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(FaceGateError::InvalidDescriptor(format!(
                "value at index {} is not finite", index
            )));
        }
        Ok(Self(values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Short hex digest used in logs in place of the raw values.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for value in &self.0 {
            hasher.update(value.to_le_bytes());
        }
        hasher.finalize()[..6]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = FaceGateError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.0
    }
}

/// Euclidean distance over the common prefix of `a` and `b`.
///
/// Callers are responsible for checking lengths first.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_non_finite_values() {
        assert!(matches!(
            Descriptor::new(vec![]),
            Err(FaceGateError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            Descriptor::new(vec![0.1, f32::NAN]),
            Err(FaceGateError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            Descriptor::new(vec![f32::INFINITY]),
            Err(FaceGateError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn serializes_as_plain_json_array() {
        let descriptor = Descriptor::new(vec![0.5, -0.25, 1.0]).unwrap();
        let json = serde_json::to_string(&descriptor).unwrap();
        assert_eq!(json, "[0.5,-0.25,1.0]");

        let parsed: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn deserializing_empty_array_fails() {
        assert!(serde_json::from_str::<Descriptor>("[]").is_err());
    }

    #[test]
    fn distance_of_three_four_five_triangle() {
        let d = euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn fingerprint_is_stable_and_value_sensitive() {
        let a = Descriptor::new(vec![0.1, 0.2, 0.3]).unwrap();
        let b = Descriptor::new(vec![0.1, 0.2, 0.31]).unwrap();

        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_eq!(a.fingerprint().len(), 12);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
