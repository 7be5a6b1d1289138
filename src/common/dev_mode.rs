use std::fs;
use std::path::PathBuf;

use crate::common::error::Result;

/// Development mode keeps every artifact under `./dev_data` so a test run
/// never touches the real enrollment.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            fs::create_dir_all(base_dir.join("store"))?;
            fs::create_dir_all(base_dir.join("captures"))?;

            tracing::info!(
                "Development mode enabled - data will be saved to: {}",
                base_dir.display()
            );
        }

        Ok(Self { enabled, base_dir })
    }

    /// Store file override, only set in dev mode.
    pub fn store_file(&self) -> Option<PathBuf> {
        self.enabled
            .then(|| self.base_dir.join("store").join("enrollment.json"))
    }

    pub fn get_capture_path(&self, prefix: &str) -> PathBuf {
        if self.enabled {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            self.base_dir
                .join("captures")
                .join(format!("{}_{}.png", prefix, timestamp))
        } else {
            PathBuf::from(format!("{}.png", prefix))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mode_has_no_store_override() {
        let dir = tempfile::tempdir().unwrap();
        let dev = DevMode::with_base_dir(false, dir.path().join("dev")).unwrap();
        assert!(dev.store_file().is_none());
        assert!(!dir.path().join("dev").exists());
        assert_eq!(dev.get_capture_path("frame"), PathBuf::from("frame.png"));
    }

    #[test]
    fn enabled_mode_keeps_artifacts_under_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dev");
        let dev = DevMode::with_base_dir(true, base.clone()).unwrap();

        assert_eq!(
            dev.store_file(),
            Some(base.join("store").join("enrollment.json"))
        );
        let capture = dev.get_capture_path("frame");
        assert!(capture.starts_with(base.join("captures")));
        assert!(base.join("captures").is_dir());
    }
}
