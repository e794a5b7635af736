//! Driver Configuration
//!
//! Loads configuration from `SHUTTER_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use shutter_common::{FormatDescriptor, SUBTYPE_NV12};

use crate::capture::ReaderConfig;

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pause between reader teardown and the next start (default: 50 ms)
    pub settle_delay: Duration,

    /// Extra teardown attempts when a frame callback holds the reader (default: 5)
    pub teardown_retries: u32,

    /// Pause between contended teardown attempts (default: 10 ms)
    pub teardown_retry_interval: Duration,

    /// Pixel subtype to negotiate (default: NV12)
    pub subtype: String,

    /// Index of the camera to open (default: 0)
    pub device_index: u32,

    /// Preview format, `SHUTTER_FORMAT` as `WxH@FPS` (default: 640x480@30)
    pub format: FormatDescriptor,

    /// Root directory for stills (default: `$HOME/Pictures`)
    pub pictures_dir: PathBuf,

    /// How long `shutter preview` runs (default: 5 s)
    pub preview_duration: Duration,

    /// Take a still during `shutter preview` (default: false)
    pub take_photo: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let subtype = var("SHUTTER_SUBTYPE").unwrap_or_else(|| SUBTYPE_NV12.into());

        let format_spec = var("SHUTTER_FORMAT").unwrap_or_else(|| "640x480@30".into());
        let format = FormatDescriptor::parse(&format_spec, &subtype).with_context(|| {
            format!("SHUTTER_FORMAT must look like 640x480@30, got {format_spec:?}")
        })?;

        let pictures_dir = var("SHUTTER_PICTURES_DIR").map_or_else(
            || {
                var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_default()
                    .join("Pictures")
            },
            PathBuf::from,
        );

        Ok(Self {
            settle_delay: Duration::from_millis(
                var("SHUTTER_SETTLE_DELAY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(50),
            ),
            teardown_retries: var("SHUTTER_TEARDOWN_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            teardown_retry_interval: Duration::from_millis(
                var("SHUTTER_TEARDOWN_RETRY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            device_index: var("SHUTTER_DEVICE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            preview_duration: Duration::from_secs(
                var("SHUTTER_PREVIEW_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            take_photo: var("SHUTTER_TAKE_PHOTO").is_some_and(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes"
                )
            }),
            subtype,
            format,
            pictures_dir,
        })
    }

    /// Timing knobs for the frame reader controller.
    #[must_use]
    pub const fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            settle_delay: self.settle_delay,
            teardown_retries: self.teardown_retries,
            teardown_retry_interval: self.teardown_retry_interval,
        }
    }

    /// Create a default configuration for testing.
    ///
    /// Short delays so restart tests finish quickly; stills go to the system
    /// temp directory.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            settle_delay: Duration::from_millis(1),
            teardown_retries: 5,
            teardown_retry_interval: Duration::from_millis(1),
            subtype: SUBTYPE_NV12.into(),
            device_index: 0,
            format: FormatDescriptor::nv12(640, 480, 30),
            pictures_dir: env::temp_dir().join("shutter-test"),
            preview_duration: Duration::from_millis(100),
            take_photo: false,
        }
    }
}
