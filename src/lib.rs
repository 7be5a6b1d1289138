// Core modules
pub mod core;
pub mod camera;
pub mod storage;
pub mod common;

// Re-export commonly used types
pub use crate::common::{Config, DevMode, FaceGateError, Result};
pub use crate::core::{
    evaluate, AttemptId, CaptureMode, Controller, ControllerSettings, Descriptor,
    DescriptorExtractor, MatchResult, OnnxExtractor, Phase, Reason, RequestOutcome, Status,
    Verdict, DEFAULT_THRESHOLD,
};
pub use crate::camera::{FrameSource, StillFrameSource, V4l2FrameSource};
pub use crate::storage::{EnrollmentStore, JsonFileStore, MemoryStore};
