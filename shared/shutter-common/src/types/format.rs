//! Capture Format Types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Planar 4:2:0 luma/chroma subtype negotiated for preview.
pub const SUBTYPE_NV12: &str = "NV12";

/// Uncompressed 4-channel subtype used for still captures.
pub const SUBTYPE_BGRA8: &str = "BGRA8";

/// A capture format advertised by a frame source.
///
/// Two descriptors are equal when width, height and frame rate match exactly
/// and the subtypes match ignoring ASCII case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame rate numerator (frames per second for integral rates).
    pub frame_rate_numerator: u32,
    /// Encoding subtype, e.g. `NV12`.
    pub subtype: String,
}

impl FormatDescriptor {
    /// Create a new descriptor.
    pub fn new(
        width: u32,
        height: u32,
        frame_rate_numerator: u32,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            width,
            height,
            frame_rate_numerator,
            subtype: subtype.into(),
        }
    }

    /// Shorthand for an NV12 descriptor.
    pub fn nv12(width: u32, height: u32, fps: u32) -> Self {
        Self::new(width, height, fps, SUBTYPE_NV12)
    }

    /// Whether this descriptor carries the given subtype (case-insensitive).
    pub fn has_subtype(&self, subtype: &str) -> bool {
        self.subtype.eq_ignore_ascii_case(subtype)
    }

    /// Parse a `WIDTHxHEIGHT@FPS` string, e.g. `640x480@30`.
    ///
    /// The subtype is supplied separately since the picker only ever offers
    /// formats of one subtype.
    pub fn parse(spec: &str, subtype: &str) -> Option<Self> {
        let (size, fps) = spec.trim().split_once('@')?;
        let (width, height) = size.split_once(['x', 'X'])?;
        let width = width.trim().parse().ok()?;
        let height = height.trim().parse().ok()?;
        let fps = fps.trim().parse().ok()?;
        if width == 0 || height == 0 || fps == 0 {
            return None;
        }
        Some(Self::new(width, height, fps, subtype))
    }
}

impl PartialEq for FormatDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.frame_rate_numerator == other.frame_rate_numerator
            && self.has_subtype(&other.subtype)
    }
}

impl Eq for FormatDescriptor {}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}  FPS:{}",
            self.width, self.height, self.frame_rate_numerator
        )
    }
}
