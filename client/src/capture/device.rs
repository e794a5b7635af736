//! Device Abstraction
//!
//! The seam between the capture core and a camera backend. A device exposes
//! frame sources; a source advertises formats and creates frame readers; a
//! reader delivers frames to a callback on the backend's own thread until it
//! is stopped.
//!
//! All methods may block on the backend. The core only calls them from
//! `spawn_blocking` tasks or from the device's own threads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shutter_common::{FormatDescriptor, RawFrameBuffer, PHOTO_CHANNELS, SUBTYPE_BGRA8};

use super::CaptureError;

/// Callback invoked for every frame a reader delivers.
///
/// Runs on the backend's arrival thread, concurrently with the controller.
pub type FrameCallback = Arc<dyn Fn(&RawFrameBuffer<'_>) + Send + Sync>;

/// A camera device available for capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Backend-specific identifier (used for opening).
    pub id: String,
    /// Human-readable device name.
    pub name: String,
    /// Device description (driver info).
    pub description: String,
}

/// Kind of data a frame source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Color,
    Depth,
    Infrared,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    ExclusiveControl,
    SharedReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPreference {
    Auto,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    Video,
    AudioAndVideo,
}

/// Settings used when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSettings {
    pub sharing: SharingMode,
    pub memory: MemoryPreference,
    pub streaming: StreamingMode,
}

impl OpenSettings {
    /// Exclusive control, frames in CPU memory, video only.
    pub const fn exclusive_cpu_video() -> Self {
        Self {
            sharing: SharingMode::ExclusiveControl,
            memory: MemoryPreference::Cpu,
            streaming: StreamingMode::Video,
        }
    }
}

/// Result of starting a frame reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStartStatus {
    Success,
    DeviceNotAvailable,
    OutputFormatNotSupported,
    ExclusiveControlNotAvailable,
    UnknownFailure,
}

impl ReaderStartStatus {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A live subscription delivering frames from one source.
///
/// Dropping a reader releases it. Implementations must tolerate being
/// dropped without a prior `stop`.
pub trait FrameReader: Send {
    /// Start delivering frames to the reader's callback.
    fn start(&mut self) -> ReaderStartStatus;

    /// Stop delivering frames. Blocks until no callback is running on the
    /// reader's thread, unless called from that thread.
    fn stop(&mut self);
}

/// One stream of a device (colour, depth, ...).
pub trait FrameSource: Send + Sync {
    /// Stable identifier, used for logging.
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Formats this source can be configured for, in backend order.
    fn supported_formats(&self) -> Vec<FormatDescriptor>;

    /// Configure the source for `format`, which must be one of
    /// [`supported_formats`](Self::supported_formats).
    fn set_format(&self, format: &FormatDescriptor) -> Result<(), CaptureError>;

    /// Create a stopped reader delivering `subtype` frames to `callback`.
    fn create_reader(
        &self,
        subtype: &str,
        callback: FrameCallback,
    ) -> Result<Box<dyn FrameReader>, CaptureError>;
}

/// Request for a one-shot still capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRequest {
    /// Pixel subtype of the delivered still.
    pub subtype: String,
    /// Whether the still is delivered uncompressed.
    pub uncompressed: bool,
}

impl PhotoRequest {
    /// Uncompressed 4-channel BGRA8 still.
    pub fn uncompressed_bgra8() -> Self {
        Self {
            subtype: SUBTYPE_BGRA8.to_string(),
            uncompressed: true,
        }
    }
}

/// A still frame as returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillFrame {
    pub width: u32,
    pub height: u32,
    /// BGRA8 pixels. May be padded beyond `capacity()` by the backend.
    pub data: Vec<u8>,
}

impl StillFrame {
    /// Pixel capacity of the frame in bytes.
    pub const fn capacity(&self) -> usize {
        self.width as usize * self.height as usize * PHOTO_CHANNELS
    }

    /// Copy the frame's pixels into `buf`, which must be `capacity()` long.
    pub fn copy_to_buffer(&self, buf: &mut [u8]) -> Result<(), CaptureError> {
        let capacity = self.capacity();
        if buf.len() != capacity || self.data.len() < capacity {
            return Err(CaptureError::PhotoCaptureFailed(format!(
                "still readout size mismatch: frame {} bytes, buffer {} bytes, expected {capacity}",
                self.data.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&self.data[..capacity]);
        Ok(())
    }
}

/// A prepared low-latency photo capture.
pub trait LowLagPhotoCapture: Send {
    /// Take one still.
    fn capture(&mut self) -> Result<StillFrame, CaptureError>;

    /// Release the prepared capture.
    fn finish(self: Box<Self>) -> Result<(), CaptureError>;
}

/// A camera device.
pub trait CaptureDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Acquire the device. Fails with `DeviceUnavailable` if the device is
    /// gone or held exclusively by someone else.
    fn open(&self, settings: &OpenSettings) -> Result<(), CaptureError>;

    /// Release the device. Idempotent.
    fn close(&self);

    /// Frame sources in enumeration order.
    fn sources(&self) -> Vec<Arc<dyn FrameSource>>;

    /// Prepare a still capture that does not disturb running readers.
    fn prepare_low_lag_photo(
        &self,
        request: &PhotoRequest,
    ) -> Result<Box<dyn LowLagPhotoCapture>, CaptureError>;
}
