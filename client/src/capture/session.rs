//! Capture Session
//!
//! One opened camera: format listing, preview control, stills and disposal.

use std::sync::Arc;

use shutter_common::{FormatDescriptor, SessionState};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::catalog;
use super::device::{CaptureDevice, DeviceInfo, OpenSettings};
use super::photo::{Photo, PhotoCapture};
use super::reader::{FrameCounters, FrameReaderController, PreviewDimensions, ReaderConfig};
use super::CaptureError;
use crate::display::DisplayHandle;

/// An exclusively opened camera and its preview pipeline.
///
/// Dropping a session without [`dispose`](Self::dispose) still closes the
/// device, but a running reader is only released by `dispose`.
pub struct CaptureSession {
    device: Arc<dyn CaptureDevice>,
    controller: FrameReaderController,
    photo: PhotoCapture,
    dimensions: Arc<PreviewDimensions>,
}

impl CaptureSession {
    /// Open `device` with exclusive control, CPU memory and video-only
    /// streaming.
    pub async fn open(
        device: Arc<dyn CaptureDevice>,
        display: DisplayHandle,
        config: ReaderConfig,
    ) -> Result<Self, CaptureError> {
        let info = device.info();
        let opener = Arc::clone(&device);
        tokio::task::spawn_blocking(move || opener.open(&OpenSettings::exclusive_cpu_video()))
            .await
            .map_err(|e| CaptureError::Backend(format!("device open task failed: {e}")))?
            .inspect_err(|e| {
                warn!(device = %info.id, error = %e, "Failed to open capture device");
            })?;

        info!(device = %info.id, name = %info.name, "Capture session opened");

        let dimensions = Arc::new(PreviewDimensions::default());
        Ok(Self {
            controller: FrameReaderController::new(
                Arc::clone(&device),
                display,
                Arc::clone(&dimensions),
                config,
            ),
            photo: PhotoCapture::new(Arc::clone(&device), Arc::clone(&dimensions)),
            dimensions,
            device,
        })
    }

    pub fn info(&self) -> DeviceInfo {
        self.device.info()
    }

    /// Colour formats of the held device with the given subtype.
    pub fn list_formats(&self, subtype: &str) -> Vec<FormatDescriptor> {
        catalog::list_formats(self.device.as_ref(), subtype)
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.controller.subscribe()
    }

    /// Start (or restart) the preview with `format`.
    pub async fn request_preview(&self, format: &FormatDescriptor) -> Result<(), CaptureError> {
        self.controller.request_preview(format).await
    }

    pub async fn stop_preview(&self) -> Result<(), CaptureError> {
        self.controller.stop_preview().await
    }

    /// Size of the preview stream, `None` until its first frame arrives.
    pub fn frame_dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions.get()
    }

    pub fn active_format(&self) -> Option<FormatDescriptor> {
        self.controller.active_format()
    }

    pub fn frame_counters(&self) -> FrameCounters {
        self.controller.frame_counters()
    }

    /// Take a still without interrupting the preview.
    pub async fn capture_photo(&self) -> Option<Photo> {
        if self.state().is_terminal() {
            return None;
        }
        self.photo.capture().await
    }

    /// Release the reader and the device. Idempotent.
    pub async fn dispose(&self) {
        if !self.controller.dispose().await {
            return;
        }

        let device = Arc::clone(&self.device);
        if let Err(e) = tokio::task::spawn_blocking(move || device.close()).await {
            error!(error = %e, "Device close task failed");
        }
        info!(device = %self.device.info().id, "Capture session disposed");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            self.device.close();
        }
    }
}
