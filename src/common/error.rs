use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceGateError {
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Sensor not ready")]
    NotReady,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Descriptor length mismatch: stored {stored} values, candidate {candidate} values")]
    LengthMismatch { stored: usize, candidate: usize },

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FaceGateError>;
