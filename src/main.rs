use facegate::{
    camera::{self, FrameSource, StillFrameSource, V4l2FrameSource},
    common::{paths, Config, DevMode},
    storage::{EnrollmentStore, JsonFileStore},
    Controller, ControllerSettings, OnnxExtractor, RequestOutcome, Status,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Single-identity face enrollment and verification gate")]
struct Cli {
    /// Enable development mode (keeps the enrollment under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Configuration file (default: configs/facegate.toml, then /etc/facegate/facegate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a face and store it as the enrolled identity
    Enroll {
        /// Use a still image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Capture a face and compare it against the enrolled identity
    Verify {
        /// Use a still image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Show whether an identity is enrolled
    Status,
    /// Remove the enrolled identity
    Clear,
    /// Grab one frame from the camera and save it
    TestCamera,
    /// List video capture devices
    Cameras,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { image } => {
            println!("Enrolling - hold still...");
            let controller = build_controller(&config, &dev_mode, image).await?;
            let outcome = controller.begin_enroll().await;
            Ok(report(outcome))
        }
        Commands::Verify { image } => {
            println!("Verifying - hold still...");
            let controller = build_controller(&config, &dev_mode, image).await?;
            let outcome = controller.begin_verify().await;
            Ok(report(outcome))
        }
        Commands::Status => {
            let store = open_store(&config, &dev_mode)?;
            match store.get()? {
                Some(descriptor) => println!(
                    "Enrolled: yes ({} values, fingerprint {}) in {}",
                    descriptor.len(),
                    descriptor.fingerprint(),
                    store.path().display()
                ),
                None => println!("Enrolled: no ({})", store.path().display()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Clear => {
            let store = Arc::new(open_store(&config, &dev_mode)?);
            let location = store.path().display().to_string();

            // No capture runs here, so the controller needs neither camera nor models
            let controller = Controller::new(
                Arc::new(StillFrameSource::disconnected()),
                store,
                ControllerSettings::from_config(&config),
            );
            if controller.clear_enrollment()? {
                println!("Enrollment removed from {}", location);
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Enrollment not removed: a capture is in progress");
                Ok(ExitCode::from(1))
            }
        }
        Commands::TestCamera => {
            let source = V4l2FrameSource::new(config.camera.clone());
            source.acquire()?;

            let frame = wait_for_frame(&source).await?;
            let save_path = dev_mode.get_capture_path("test_capture");
            frame.save(&save_path)?;
            println!("Saved {}x{} frame to {}", frame.width(), frame.height(), save_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cameras => {
            let cameras = camera::list_cameras()?;
            if cameras.is_empty() {
                println!("No cameras found. Check that /dev/video* exists and is readable.");
            }
            for cam in cameras {
                println!("/dev/video{}: {} [{}]", cam.index, cam.name, cam.formats.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(config: &Config, dev_mode: &DevMode) -> Result<JsonFileStore> {
    let path = match (dev_mode.store_file(), &config.storage.path) {
        (Some(dev_path), _) => dev_path,
        (None, Some(path)) => path.clone(),
        (None, None) => paths::default_store_file()?,
    };
    Ok(JsonFileStore::new(path, config.storage.key.clone()))
}

async fn build_controller(
    config: &Config,
    dev_mode: &DevMode,
    image: Option<PathBuf>,
) -> Result<Controller> {
    let frames: Arc<dyn FrameSource> = match image {
        Some(path) => Arc::new(StillFrameSource::from_path(path)),
        None => Arc::new(V4l2FrameSource::new(config.camera.clone())),
    };
    let store = Arc::new(open_store(config, dev_mode)?);
    let controller = Controller::new(frames.clone(), store, ControllerSettings::from_config(config));
    spawn_status_printer(controller.subscribe());

    match OnnxExtractor::load(config) {
        Ok(extractor) => controller.install_extractor(Arc::new(extractor)),
        Err(e) => controller.report_model_failure(&e),
    }

    match controller.acquire_sensor() {
        // A live camera delivers its first frame shortly after the stream opens
        Ok(()) => {
            if let Err(e) = wait_for_frame(frames.as_ref()).await {
                tracing::warn!("{}", e);
            }
        }
        Err(e) => tracing::warn!("{}", e),
    }

    Ok(controller)
}

async fn wait_for_frame(source: &dyn FrameSource) -> Result<image::DynamicImage> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(frame) = source.current_frame() {
            return Ok(frame);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("camera produced no frame within 5s");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn spawn_status_printer(mut rx: tokio::sync::watch::Receiver<Status>) {
    tokio::spawn(async move {
        let mut last = rx.borrow().phase;
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            if status.phase != last {
                println!("[{:?}] -> [{:?}]", last, status.phase);
                last = status.phase;
            }
        }
    });
}

fn report(outcome: RequestOutcome) -> ExitCode {
    match outcome {
        RequestOutcome::Completed(verdict) => {
            let distance = verdict
                .distance
                .map(|d| format!(" (distance {:.4})", d))
                .unwrap_or_default();
            if verdict.accepted() {
                println!("ACCEPTED: {:?}{}", verdict.reason, distance);
                ExitCode::SUCCESS
            } else {
                println!("REJECTED: {:?}{}", verdict.reason, distance);
                ExitCode::from(1)
            }
        }
        RequestOutcome::Refused(reason) => {
            println!("REFUSED: {:?}", reason);
            ExitCode::from(1)
        }
        RequestOutcome::Ignored | RequestOutcome::Superseded => {
            println!("No decision: another capture was in progress");
            ExitCode::from(1)
        }
    }
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
