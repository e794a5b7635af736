//! Capture Module
//!
//! Camera sessions, NV12 format negotiation, frame reader lifecycle, colour
//! space conversion to BGR24 and the still photo path. Device access goes
//! through the [`device`] traits; [`synthetic`] provides an in-memory camera
//! and `native` (feature `native`) wraps `nokhwa`.

pub mod catalog;
pub mod convert;
pub mod device;
#[cfg(feature = "native")]
pub mod native;
pub mod photo;
pub mod reader;
pub mod session;
pub mod synthetic;

use thiserror::Error;

pub use catalog::list_formats;
pub use convert::Nv12ToBgrConverter;
pub use device::{CaptureDevice, DeviceInfo, FrameReader, FrameSource, SourceKind};
pub use photo::{photo_path, save_jpeg, Photo, PhotoCapture, SaveError};
pub use reader::{FrameCounters, FrameReaderController, ReaderConfig, TeardownOutcome};
pub use session::CaptureSession;
pub use synthetic::{SyntheticCamera, SyntheticSource, SyntheticStats};

/// Capture-related errors.
///
/// None of these are fatal: callers get them back as `Err` (or `None` on the
/// photo path) and the session stays usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("No source supports format {0}")]
    FormatUnsupported(String),
    #[error("Frame reader failed to start for format {0}")]
    ReaderStartFailed(String),
    #[error("A preview restart is already in progress")]
    RestartRejected,
    #[error("Frame callback still publishing, teardown deferred")]
    TeardownContended,
    #[error("Preview dimensions unknown, no frame has arrived yet")]
    PhotoPreconditionFailed,
    #[error("Photo capture failed: {0}")]
    PhotoCaptureFailed(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Capture session disposed")]
    Disposed,
    #[error("Capture backend error: {0}")]
    Backend(String),
}
