use crate::camera::FrameSource;
use crate::common::{FaceGateError, Result};
use crate::common::config::CameraConfig;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
}

/// Negotiated stream format.
#[derive(Debug, Clone, Copy)]
struct StreamFormat {
    width: u32,
    height: u32,
    fourcc: [u8; 4],
}

type CaptureStreamHandle = v4l::io::mmap::Stream<'static>;

struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CaptureWorker {
    /// False once the loop was asked to stop or has exited on its own.
    fn is_alive(&self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.handle.is_finished()
    }
}

/// V4L2 camera with a background reader that keeps only the newest frame.
pub struct V4l2FrameSource {
    config: CameraConfig,
    latest: Arc<Mutex<Option<DynamicImage>>>,
    worker: Mutex<Option<CaptureWorker>>,
}

impl V4l2FrameSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            latest: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    fn open_device(&self) -> Result<(Device, StreamFormat)> {
        let index = self.config.device_index;
        tracing::info!("Opening camera device {}...", index);

        let device = Device::new(index as usize)
            .map_err(|e| FaceGateError::SensorUnavailable(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device.query_caps()
            .map_err(|e| FaceGateError::SensorUnavailable(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} ({}) may not support standard video capture", index, caps.card);
        }

        let mut fmt = device.format()
            .map_err(|e| FaceGateError::SensorUnavailable(format!("Failed to get format: {}", e)))?;

        fmt.width = self.config.width;
        fmt.height = self.config.height;
        // IR sensors stream GREY; everything else is asked for MJPG
        if fmt.fourcc.repr != *b"GREY" {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let actual = device.format()
            .map_err(|e| FaceGateError::SensorUnavailable(format!("Failed to get final format: {}", e)))?;

        if actual.width != self.config.width || actual.height != self.config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width, actual.height, self.config.width, self.config.height
            );
        }

        let format = StreamFormat {
            width: actual.width,
            height: actual.height,
            fourcc: actual.fourcc.repr,
        };
        Ok((device, format))
    }
}

impl FrameSource for V4l2FrameSource {
    fn acquire(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match worker.as_ref() {
            Some(current) if current.is_alive() => return Ok(()),
            Some(_) => tracing::info!("Capture stream stopped, reopening camera"),
            None => {}
        }
        *worker = None;

        let (device, format) = self.open_device()?;
        let mut stream: CaptureStreamHandle =
            v4l::io::mmap::Stream::with_buffers(&device, Type::VideoCapture, 4).map_err(|e| {
                FaceGateError::SensorUnavailable(format!("Failed to create capture stream: {}", e))
            })?;

        // The stream has to deliver at least once before it counts as acquired
        stream.next().map_err(|e| {
            FaceGateError::SensorUnavailable(format!("Camera delivered no frame: {}", e))
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let handle = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn({
                let running = Arc::clone(&running);
                let latest = Arc::clone(&self.latest);
                let config = self.config.clone();
                move || capture_loop(device, stream, format, config, running, latest)
            })?;

        *worker = Some(CaptureWorker { running, handle });
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn current_frame(&self) -> Result<DynamicImage> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(FaceGateError::NotReady)
    }
}

impl Drop for V4l2FrameSource {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            worker.running.store(false, Ordering::Relaxed);
        }
    }
}

fn capture_loop(
    _device: Device,
    mut stream: CaptureStreamHandle,
    format: StreamFormat,
    config: CameraConfig,
    running: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<DynamicImage>>>,
) {

    // Warmup frames for auto exposure / IR emitter
    for _ in 0..config.warmup_frames {
        if let Err(e) = stream.next() {
            tracing::warn!("Failed to capture warmup frame: {}", e);
        }
        std::thread::sleep(Duration::from_millis(config.warmup_delay_ms));
    }
    tracing::info!("Camera ready ({}x{})", format.width, format.height);

    while running.load(Ordering::Relaxed) {
        match stream.next() {
            Ok((buf, _meta)) => match decode_frame(buf, format) {
                Ok(frame) => {
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                }
                Err(e) => tracing::debug!("Dropping undecodable frame: {}", e),
            },
            Err(e) => {
                tracing::error!("Camera stream failed: {}", e);
                break;
            }
        }
    }

    // A dead stream must not keep serving its last frame; the next acquire reopens
    *latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
    running.store(false, Ordering::Relaxed);
}

fn decode_frame(data: &[u8], format: StreamFormat) -> Result<DynamicImage> {
    let pixels = (format.width * format.height) as usize;

    match &format.fourcc {
        b"GREY" => {
            let raw = data.get(..pixels).ok_or_else(|| short_buffer(data.len(), pixels))?;
            luma_image(format.width, format.height, raw.to_vec())
        }
        b"YUYV" => {
            // Y0 U Y1 V: keep luminance only
            let raw = data.get(..pixels * 2).ok_or_else(|| short_buffer(data.len(), pixels * 2))?;
            let luma = raw.iter().step_by(2).copied().collect();
            luma_image(format.width, format.height, luma)
        }
        b"MJPG" => Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?),
        other => Err(FaceGateError::SensorUnavailable(format!(
            "Unsupported pixel format {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn luma_image(width: u32, height: u32, data: Vec<u8>) -> Result<DynamicImage> {
    let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data)
        .ok_or_else(|| FaceGateError::SensorUnavailable("Failed to create grayscale image buffer".into()))?;
    Ok(DynamicImage::ImageLuma8(buffer))
}

fn short_buffer(got: usize, expected: usize) -> FaceGateError {
    FaceGateError::SensorUnavailable(format!("Frame buffer too short: {} < {} bytes", got, expected))
}

/// All `/dev/video*` nodes that answer a capability query.
pub fn list_cameras() -> Result<Vec<CameraInfo>> {
    let mut cameras = Vec::new();

    for entry in fs::read_dir("/dev")? {
        let path = entry?.path();
        let Some(index) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let Ok(device) = Device::new(index as usize) else { continue };
        let Ok(caps) = device.query_caps() else { continue };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }

        let formats = device
            .enum_formats()
            .unwrap_or_default()
            .iter()
            .map(|fmt| String::from_utf8_lossy(&fmt.fourcc.repr).trim().to_string())
            .collect();

        cameras.push(CameraInfo { index, name: caps.card.clone(), formats });
    }

    cameras.sort_by_key(|c| c.index);
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_grey_frames() {
        let format = StreamFormat { width: 2, height: 2, fourcc: *b"GREY" };
        let frame = decode_frame(&[1, 2, 3, 4, 99], format).unwrap();
        assert_eq!(frame.to_luma8().into_raw(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn decodes_yuyv_luminance() {
        let format = StreamFormat { width: 2, height: 1, fourcc: *b"YUYV" };
        let frame = decode_frame(&[10, 128, 20, 128], format).unwrap();
        assert_eq!(frame.to_luma8().into_raw(), vec![10, 20]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let format = StreamFormat { width: 4, height: 4, fourcc: *b"GREY" };
        assert!(decode_frame(&[0; 3], format).is_err());
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let format = StreamFormat { width: 1, height: 1, fourcc: *b"RGB3" };
        assert!(matches!(
            decode_frame(&[0, 0, 0], format),
            Err(FaceGateError::SensorUnavailable(_))
        ));
    }

    #[test]
    fn stopped_worker_is_not_alive() {
        let running = Arc::new(AtomicBool::new(true));
        let worker = CaptureWorker {
            running: Arc::clone(&running),
            handle: std::thread::spawn(|| std::thread::sleep(Duration::from_millis(200))),
        };
        assert!(worker.is_alive());

        running.store(false, Ordering::Relaxed);
        assert!(!worker.is_alive());
    }

    #[test]
    fn exited_worker_is_not_alive() {
        let worker = CaptureWorker {
            running: Arc::new(AtomicBool::new(true)),
            handle: std::thread::spawn(|| {}),
        };
        while !worker.handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!worker.is_alive());
    }

    #[test]
    fn missing_device_fails_every_acquire() {
        let source = V4l2FrameSource::new(CameraConfig {
            device_index: 250,
            ..CameraConfig::default()
        });

        for _ in 0..2 {
            assert!(matches!(source.acquire(), Err(FaceGateError::SensorUnavailable(_))));
        }
        assert!(!source.is_ready());
    }

    #[test]
    fn unacquired_camera_is_not_ready() {
        let source = V4l2FrameSource::new(CameraConfig::default());
        assert!(!source.is_ready());
        assert!(matches!(source.current_frame(), Err(FaceGateError::NotReady)));
    }
}
