pub mod v4l2;

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use image::DynamicImage;

use crate::common::{FaceGateError, Result};

pub use v4l2::{list_cameras, CameraInfo, V4l2FrameSource};

/// Live frame supply for capture sessions.
pub trait FrameSource: Send + Sync {
    /// Obtains the stream. Only the first successful call does any work.
    fn acquire(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    /// Most recent frame. Never waits for a new one; fails with `NotReady`
    /// before the first frame has arrived.
    fn current_frame(&self) -> Result<DynamicImage>;
}

/// A single still frame, either loaded from disk on `acquire` or supplied
/// directly. Replacing the frame models the scene changing in front of the
/// sensor.
pub struct StillFrameSource {
    path: Option<PathBuf>,
    frame: RwLock<Option<DynamicImage>>,
}

impl StillFrameSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            frame: RwLock::new(None),
        }
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self {
            path: None,
            frame: RwLock::new(Some(image)),
        }
    }

    /// A source that never produces a frame.
    pub fn disconnected() -> Self {
        Self {
            path: None,
            frame: RwLock::new(None),
        }
    }

    pub fn replace(&self, image: DynamicImage) {
        *self.frame.write().unwrap_or_else(PoisonError::into_inner) = Some(image);
    }

    pub fn disconnect(&self) {
        *self.frame.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl FrameSource for StillFrameSource {
    fn acquire(&self) -> Result<()> {
        let mut frame = self.frame.write().unwrap_or_else(PoisonError::into_inner);
        if frame.is_some() {
            return Ok(());
        }

        let path = self.path.as_ref().ok_or_else(|| {
            FaceGateError::SensorUnavailable("no image source configured".into())
        })?;

        let image = image::open(path).map_err(|e| {
            FaceGateError::SensorUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;
        tracing::debug!("Loaded still frame {} ({}x{})", path.display(), image.width(), image.height());

        *frame = Some(image);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.frame.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn current_frame(&self) -> Result<DynamicImage> {
        self.frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(FaceGateError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_frame_is_ready_immediately() {
        let source = StillFrameSource::from_image(DynamicImage::new_luma8(4, 3));
        assert!(source.is_ready());
        source.acquire().unwrap();

        let frame = source.current_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));
    }

    #[test]
    fn disconnected_source_is_not_ready() {
        let source = StillFrameSource::disconnected();
        assert!(!source.is_ready());
        assert!(matches!(source.current_frame(), Err(FaceGateError::NotReady)));
        assert!(matches!(source.acquire(), Err(FaceGateError::SensorUnavailable(_))));
    }

    #[test]
    fn acquire_loads_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        DynamicImage::new_luma8(8, 8).save(&path).unwrap();

        let source = StillFrameSource::from_path(&path);
        assert!(!source.is_ready());
        source.acquire().unwrap();
        assert!(source.is_ready());

        // The file is no longer consulted after the first acquire
        std::fs::remove_file(&path).unwrap();
        source.acquire().unwrap();
        assert_eq!(source.current_frame().unwrap().width(), 8);
    }

    #[test]
    fn acquire_of_missing_file_is_sensor_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = StillFrameSource::from_path(dir.path().join("missing.png"));
        assert!(matches!(source.acquire(), Err(FaceGateError::SensorUnavailable(_))));
        assert!(!source.is_ready());
    }

    #[test]
    fn replace_and_disconnect_swap_the_frame() {
        let source = StillFrameSource::from_image(DynamicImage::new_luma8(2, 2));
        source.replace(DynamicImage::new_luma8(6, 6));
        assert_eq!(source.current_frame().unwrap().width(), 6);

        source.disconnect();
        assert!(!source.is_ready());
    }
}
