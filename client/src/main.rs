//! Shutter Command-Line Driver
//!
//! Thin glue around the capture core.
//!
//! ## Usage
//!
//! ```bash
//! # List cameras and their NV12 formats as JSON
//! shutter list
//!
//! # Preview the configured format for SHUTTER_PREVIEW_SECS, then dispose
//! SHUTTER_FORMAT=1280x720@30 shutter preview
//!
//! # Run against the synthetic test pattern camera (no hardware)
//! SHUTTER_TAKE_PHOTO=1 shutter preview --test-source
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use shutter_client::capture::{
    photo_path, save_jpeg, CaptureDevice, CaptureSession, DeviceInfo, SyntheticCamera,
};
use shutter_client::config::Config;
use shutter_client::display::DisplayContext;
use shutter_common::FormatDescriptor;
use tracing::{info, warn};

/// How long `preview` waits for the first frame before giving up on a still.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    List,
    Preview,
}

/// Command-line arguments.
struct Args {
    command: Command,
    /// Use the synthetic camera instead of real hardware
    test_source: bool,
    /// Emit JSON logs
    json_logs: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");
        let json_logs = args.iter().any(|arg| arg == "--json-logs");

        let command = match args.iter().find(|arg| !arg.starts_with("--")).map(String::as_str) {
            None | Some("preview") => Command::Preview,
            Some("list") => Command::List,
            Some(other) => bail!("unknown command {other:?}, expected `list` or `preview`"),
        };

        Ok(Self {
            command,
            test_source,
            json_logs,
        })
    }
}

#[derive(Serialize)]
struct DeviceListing {
    device: DeviceInfo,
    formats: Vec<FormatListing>,
}

#[derive(Serialize)]
struct FormatListing {
    label: String,
    #[serde(flatten)]
    format: FormatDescriptor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    shutter_client::init_tracing(args.json_logs);

    let config = Config::from_env()?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Shutter");

    match args.command {
        Command::List => list(&config, args.test_source).await,
        Command::Preview => preview(&config, args.test_source).await,
    }
}

async fn list(config: &Config, test_source: bool) -> Result<()> {
    let mut listing = Vec::new();

    for device in devices(test_source)? {
        let info = device.info();
        let display = DisplayContext::spawn();
        let opened =
            CaptureSession::open(device, display.handle(), config.reader_config()).await;
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!(device = %info.id, error = %e, "Skipping device");
                display.shutdown().await;
                continue;
            }
        };

        let formats = session
            .list_formats(&config.subtype)
            .into_iter()
            .map(|format| FormatListing {
                label: format.to_string(),
                format,
            })
            .collect();
        session.dispose().await;
        display.shutdown().await;

        listing.push(DeviceListing {
            device: info,
            formats,
        });
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&listing).context("Failed to serialize device list")?
    );
    Ok(())
}

async fn preview(config: &Config, test_source: bool) -> Result<()> {
    let device = devices(test_source)?
        .into_iter()
        .nth(config.device_index as usize)
        .with_context(|| format!("No camera at index {}", config.device_index))?;

    let display = DisplayContext::spawn();
    let session = CaptureSession::open(device, display.handle(), config.reader_config())
        .await
        .context("Failed to open camera")?;

    session
        .request_preview(&config.format)
        .await
        .with_context(|| format!("Failed to start preview at {}", config.format))?;
    info!(format = %config.format, device = %session.info().name, "Preview running");

    if config.take_photo {
        snap(config, &session).await;
    }

    tokio::select! {
        () = tokio::time::sleep(config.preview_duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let counters = session.frame_counters();
    let surface = display.handle().status();
    info!(
        delivered = counters.delivered,
        dropped = counters.dropped,
        paints = surface.paints,
        width = surface.width,
        height = surface.height,
        "Preview finished"
    );

    session.dispose().await;
    display.shutdown().await;
    Ok(())
}

/// Wait for the first frame, take a still and write it under the pictures
/// directory. Failures are logged; the preview keeps running.
async fn snap(config: &Config, session: &CaptureSession) {
    let waited = tokio::time::timeout(FIRST_FRAME_TIMEOUT, async {
        while session.frame_dimensions().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if waited.is_err() {
        warn!("No preview frame arrived, skipping photo");
        return;
    }

    let Some(photo) = session.capture_photo().await else {
        warn!("Photo capture returned nothing");
        return;
    };

    let path = photo_path(&config.pictures_dir, &chrono::Local::now());
    let saved = tokio::task::spawn_blocking(move || {
        save_jpeg(&path, &photo.data, photo.width, photo.height).map(|()| path)
    })
    .await;

    match saved {
        Ok(Ok(path)) => info!(path = %path.display(), "Photo written"),
        Ok(Err(e)) => warn!(error = %e, "Failed to write photo"),
        Err(e) => warn!(error = %e, "Photo write task failed"),
    }
}

fn devices(test_source: bool) -> Result<Vec<Arc<dyn CaptureDevice>>> {
    if test_source {
        return Ok(vec![Arc::new(SyntheticCamera::test_pattern())]);
    }
    native_devices()
}

#[cfg(feature = "native")]
fn native_devices() -> Result<Vec<Arc<dyn CaptureDevice>>> {
    use shutter_client::capture::native::{enumerate_devices, NativeCamera};

    let devices = enumerate_devices().context("Failed to enumerate cameras")?;
    Ok(devices
        .into_iter()
        .map(|info| Arc::new(NativeCamera::new(info)) as Arc<dyn CaptureDevice>)
        .collect())
}

#[cfg(not(feature = "native"))]
fn native_devices() -> Result<Vec<Arc<dyn CaptureDevice>>> {
    bail!("built without the `native` feature, pass --test-source to use the synthetic camera")
}
