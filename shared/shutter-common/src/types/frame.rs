//! Frame Buffer Types

use serde::{Deserialize, Serialize};

/// Bytes per pixel of the interleaved preview layout (BGR24).
pub const PREVIEW_CHANNELS: usize = 3;

/// Bytes per pixel of a still capture (BGRA8).
pub const PHOTO_CHANNELS: usize = 4;

/// Number of bytes an NV12 frame of the given size occupies.
///
/// Full-resolution luma plane followed by an interleaved chroma plane at
/// half resolution in both directions (rounded up for odd sizes).
pub const fn nv12_len(width: u32, height: u32) -> usize {
    let w = width as usize;
    let h = height as usize;
    let chroma_rows = h.div_ceil(2);
    let chroma_row_bytes = w.div_ceil(2) * 2;
    w * h + chroma_rows * chroma_row_bytes
}

/// A raw frame as delivered by a frame reader.
///
/// Borrowed from the backend for the duration of the arrival callback.
#[derive(Debug, Clone, Copy)]
pub struct RawFrameBuffer<'a> {
    /// Frame bytes in the layout named by `subtype`.
    pub data: &'a [u8],
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Encoding subtype, e.g. `NV12`.
    pub subtype: &'a str,
}

/// An interleaved BGR24 frame ready for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedFrame {
    /// Pixel data, `width * height * 3` bytes, row-major BGR.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl ConvertedFrame {
    /// Allocate a zeroed frame of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * PREVIEW_CHANNELS],
            width,
            height,
        }
    }

    /// Row stride in bytes.
    pub const fn stride(&self) -> usize {
        self.width as usize * PREVIEW_CHANNELS
    }

    /// Whether the frame has the given dimensions.
    pub const fn has_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}
