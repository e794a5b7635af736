//! Still Photo Capture
//!
//! One-shot high-resolution stills taken through the device's low-latency
//! photo path. Independent of the preview reader: a still never pauses or
//! reconfigures the preview stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};

use shutter_common::PHOTO_CHANNELS;

use super::device::{CaptureDevice, LowLagPhotoCapture, PhotoRequest};
use super::reader::PreviewDimensions;
use super::CaptureError;

/// A captured still.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub width: u32,
    pub height: u32,
    /// Tightly packed BGRA8 pixels, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

impl Photo {
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Takes stills from a session's device.
pub struct PhotoCapture {
    device: Arc<dyn CaptureDevice>,
    dimensions: Arc<PreviewDimensions>,
}

impl PhotoCapture {
    pub(crate) fn new(device: Arc<dyn CaptureDevice>, dimensions: Arc<PreviewDimensions>) -> Self {
        Self { device, dimensions }
    }

    /// Take one still.
    ///
    /// Returns `None` straight away if no preview frame has arrived yet, and
    /// `None` if the device fails; failures are logged.
    pub async fn capture(&self) -> Option<Photo> {
        if self.dimensions.get().is_none() {
            debug!(error = %CaptureError::PhotoPreconditionFailed, "Photo skipped");
            return None;
        }

        let device = Arc::clone(&self.device);
        let result = tokio::task::spawn_blocking(move || take_still(device.as_ref())).await;

        match result {
            Ok(Ok(photo)) => {
                info!(width = photo.width, height = photo.height, "Photo captured");
                Some(photo)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Photo capture failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "Photo task panicked");
                None
            }
        }
    }
}

fn take_still(device: &dyn CaptureDevice) -> Result<Photo, CaptureError> {
    let mut prepared = device.prepare_low_lag_photo(&PhotoRequest::uncompressed_bgra8())?;
    let still = prepared.capture();
    finish(prepared);
    let still = still?;

    let mut data = vec![0u8; still.capacity()];
    still.copy_to_buffer(&mut data)?;
    Ok(Photo {
        width: still.width,
        height: still.height,
        data,
    })
}

fn finish(prepared: Box<dyn LowLagPhotoCapture>) {
    if let Err(e) = prepared.finish() {
        warn!(error = %e, "Failed to release prepared photo capture");
    }
}

/// Errors writing a still to disk.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Pixel buffer is {actual} bytes, {width}x{height} BGRA needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("Failed to create {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Path of a still taken at `taken`: `<root>/<MM>/<ddHHmmss>.jpg`.
pub fn photo_path<Tz>(root: &Path, taken: &DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    root.join(taken.format("%m").to_string())
        .join(format!("{}.jpg", taken.format("%d%H%M%S")))
}

/// Write a BGRA8 still as JPEG, creating the parent directory.
pub fn save_jpeg(path: &Path, bgra: &[u8], width: u32, height: u32) -> Result<(), SaveError> {
    let expected = width as usize * height as usize * PHOTO_CHANNELS;
    if bgra.len() != expected {
        return Err(SaveError::BufferSize {
            width,
            height,
            expected,
            actual: bgra.len(),
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SaveError::CreateDir(parent.to_path_buf(), e))?;
    }

    let rgb: Vec<u8> = bgra
        .chunks_exact(PHOTO_CHANNELS)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    let image = RgbImage::from_raw(width, height, rgb).ok_or(SaveError::BufferSize {
        width,
        height,
        expected,
        actual: bgra.len(),
    })?;
    image.save_with_format(path, ImageFormat::Jpeg)?;

    info!(path = %path.display(), width, height, "Photo saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Local, Utc};

    use super::*;
    use crate::capture::device::OpenSettings;
    use crate::capture::synthetic::SyntheticCamera;

    fn camera() -> Arc<SyntheticCamera> {
        let camera = Arc::new(SyntheticCamera::new("cam", "Camera").with_still_size(8, 4));
        camera.open(&OpenSettings::exclusive_cpu_video()).unwrap();
        camera
    }

    fn photo_capture(camera: &Arc<SyntheticCamera>, preview: Option<(u32, u32)>) -> PhotoCapture {
        let dimensions = Arc::new(PreviewDimensions::default());
        if let Some((width, height)) = preview {
            dimensions.set(width, height);
        }
        let device: Arc<dyn CaptureDevice> = camera.clone();
        PhotoCapture::new(device, dimensions)
    }

    #[tokio::test]
    async fn no_photo_before_first_frame() {
        let camera = camera();
        let photo = photo_capture(&camera, None);
        assert!(photo.capture().await.is_none());
        assert_eq!(camera.stats().photos_finished, 0);
    }

    #[tokio::test]
    async fn photo_is_read_out_at_capacity() {
        let camera = camera();
        let photo = photo_capture(&camera, Some((640, 480)))
            .capture()
            .await
            .unwrap();

        assert_eq!((photo.width, photo.height), (8, 4));
        assert_eq!(photo.clone().into_bytes().len(), 8 * 4 * 4);
        assert_eq!(camera.stats().photos_finished, 1);
    }

    #[tokio::test]
    async fn device_failure_maps_to_none() {
        let camera = camera();
        camera.set_fail_photos(true);
        assert!(photo_capture(&camera, Some((640, 480)))
            .capture()
            .await
            .is_none());
    }

    #[test]
    fn closed_device_is_an_error() {
        let camera = camera();
        camera.close();
        assert!(matches!(
            take_still(camera.as_ref()),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn path_is_month_dir_and_day_time_name() {
        let taken = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        let path = photo_path(Path::new("/pics"), &taken);
        assert_eq!(path, Path::new("/pics/03/07090502.jpg"));

        let local = Local::now();
        assert!(photo_path(Path::new("/pics"), &local)
            .extension()
            .is_some_and(|ext| ext == "jpg"));
    }

    #[test]
    fn save_jpeg_creates_month_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("11").join("01120000.jpg");
        let bgra = vec![200u8; 16 * 8 * 4];

        save_jpeg(&path, &bgra, 16, 8).unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn save_jpeg_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.jpg");
        assert!(matches!(
            save_jpeg(&path, &[0u8; 10], 4, 4),
            Err(SaveError::BufferSize { .. })
        ));
        assert!(!path.exists());
    }
}
