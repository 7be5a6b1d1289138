pub mod controller;
pub mod descriptor;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod session;

pub use controller::{Controller, ControllerSettings, Phase, Reason, RequestOutcome, Status, Verdict};
pub use descriptor::{euclidean_distance, Descriptor};
pub use detector::{FaceBox, FaceDetector};
pub use extractor::{DescriptorExtractor, OnnxExtractor};
pub use matcher::{evaluate, MatchResult, DEFAULT_THRESHOLD};
pub use recognizer::FaceRecognizer;
pub use session::{AttemptId, CaptureAttempt, CaptureFailure, CaptureMode, CaptureSession};
