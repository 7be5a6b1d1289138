use std::path::PathBuf;

use directories::ProjectDirs;

use crate::common::error::{FaceGateError, Result};

pub fn local_config_file() -> PathBuf {
    PathBuf::from("configs/facegate.toml")
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/facegate/facegate.toml")
}

pub fn system_models_dir() -> PathBuf {
    PathBuf::from("/usr/share/facegate/models")
}

/// Per-user location of the enrollment document.
pub fn default_store_file() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "facegate", "FaceGate")
        .ok_or_else(|| FaceGateError::Storage("Failed to get project dirs".into()))?;

    Ok(dirs.data_dir().join("enrollment.json"))
}
