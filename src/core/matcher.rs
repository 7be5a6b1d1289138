use serde::Serialize;

use crate::common::{FaceGateError, Result};
use crate::core::descriptor::{euclidean_distance, Descriptor};

/// Distance below which two descriptors are treated as the same identity.
pub const DEFAULT_THRESHOLD: f32 = 0.55;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub distance: f32,
    pub accepted: bool,
}

/// Compares a candidate against the enrolled descriptor.
///
/// Accepted iff the Euclidean distance is strictly below `threshold`.
/// Descriptors of different length are never compared: that is reported as
/// `LengthMismatch` rather than a distance.
pub fn evaluate(stored: &Descriptor, candidate: &Descriptor, threshold: f32) -> Result<MatchResult> {
    if stored.len() != candidate.len() {
        return Err(FaceGateError::LengthMismatch {
            stored: stored.len(),
            candidate: candidate.len(),
        });
    }

    let distance = euclidean_distance(stored.as_slice(), candidate.as_slice());
    Ok(MatchResult {
        distance,
        accepted: distance < threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    #[test]
    fn self_match_has_zero_distance() {
        let d = descriptor(&[0.12, -0.4, 0.33, 0.9]);
        for threshold in [1e-6, 0.1, DEFAULT_THRESHOLD, 10.0] {
            let result = evaluate(&d, &d, threshold).unwrap();
            assert_eq!(result.distance, 0.0);
            assert!(result.accepted);
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let a = descriptor(&[0.1, 0.7, -0.3]);
        let b = descriptor(&[-0.2, 0.4, 0.5]);
        let ab = evaluate(&a, &b, DEFAULT_THRESHOLD).unwrap();
        let ba = evaluate(&b, &a, DEFAULT_THRESHOLD).unwrap();
        assert_eq!(ab.distance, ba.distance);
        assert_eq!(ab.accepted, ba.accepted);
    }

    #[test]
    fn accepts_close_and_rejects_far_candidates() {
        let stored = descriptor(&[0.0, 0.0, 0.0]);

        let close = evaluate(&stored, &descriptor(&[0.2, 0.0, 0.0]), DEFAULT_THRESHOLD).unwrap();
        assert!((close.distance - 0.2).abs() < 1e-6);
        assert!(close.accepted);

        let far = evaluate(&stored, &descriptor(&[0.8, 0.0, 0.0]), DEFAULT_THRESHOLD).unwrap();
        assert!((far.distance - 0.8).abs() < 1e-6);
        assert!(!far.accepted);
    }

    #[test]
    fn distance_equal_to_threshold_is_rejected() {
        let stored = descriptor(&[0.0, 0.0]);
        let candidate = descriptor(&[3.0, 4.0]);
        let result = evaluate(&stored, &candidate, 5.0).unwrap();
        assert_eq!(result.distance, 5.0);
        assert!(!result.accepted);
    }

    #[test]
    fn mismatched_lengths_are_a_contract_violation() {
        let stored = descriptor(&[0.1, 0.2, 0.3]);
        let candidate = descriptor(&[0.1, 0.2]);
        match evaluate(&stored, &candidate, DEFAULT_THRESHOLD) {
            Err(FaceGateError::LengthMismatch { stored, candidate }) => {
                assert_eq!(stored, 3);
                assert_eq!(candidate, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
