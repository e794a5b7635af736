//! Color Space Conversion
//!
//! NV12 (YUV 4:2:0, interleaved chroma plane) → BGR24 using BT.601
//! limited-range coefficients. Reuses its buffers across frames of the same
//! size to avoid per-frame allocation.

use shutter_common::{nv12_len, ConvertedFrame, RawFrameBuffer, PREVIEW_CHANNELS, SUBTYPE_NV12};
use tracing::debug;

use super::CaptureError;

/// Reusable NV12 → BGR24 converter.
///
/// The planar source buffer and the destination frame are allocated on the
/// first frame and again only when the frame size changes.
#[derive(Debug, Default)]
pub struct Nv12ToBgrConverter {
    /// Copy of the incoming frame: `height * 3 / 2` rows of `width` bytes.
    planar: Vec<u8>,
    output: ConvertedFrame,
    dimensions: Option<(u32, u32)>,
    reallocations: u64,
}

impl Nv12ToBgrConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dimensions of the cached buffers, if any.
    pub const fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    /// Number of times the buffers have been (re)allocated.
    pub const fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// Drop both buffers and forget the cached size.
    pub fn reset(&mut self) {
        self.planar = Vec::new();
        self.output = ConvertedFrame::default();
        self.dimensions = None;
    }

    /// Convert an NV12 frame, overwriting the previous output in place.
    pub fn convert(&mut self, raw: &RawFrameBuffer<'_>) -> Result<&ConvertedFrame, CaptureError> {
        if !raw.subtype.eq_ignore_ascii_case(SUBTYPE_NV12) {
            return Err(CaptureError::InvalidFrame(format!(
                "expected {SUBTYPE_NV12}, got {}",
                raw.subtype
            )));
        }
        if raw.width == 0 || raw.height == 0 {
            return Err(CaptureError::InvalidFrame("zero-sized frame".into()));
        }

        let needed = nv12_len(raw.width, raw.height);
        if raw.data.len() < needed {
            return Err(CaptureError::InvalidFrame(format!(
                "{}x{} NV12 needs {needed} bytes, got {}",
                raw.width,
                raw.height,
                raw.data.len()
            )));
        }

        if self.dimensions != Some((raw.width, raw.height)) {
            self.allocate(raw.width, raw.height, needed);
        }

        // Backends may pad the buffer past the NV12 layout
        self.planar.copy_from_slice(&raw.data[..needed]);

        let w = raw.width as usize;
        let h = raw.height as usize;
        let luma_len = w * h;
        let chroma_stride = w.div_ceil(2) * 2;

        for (row, out_row) in self
            .output
            .data
            .chunks_exact_mut(w * PREVIEW_CHANNELS)
            .enumerate()
        {
            let luma = &self.planar[row * w..(row + 1) * w];
            let chroma_start = luma_len + (row / 2) * chroma_stride;
            let chroma = &self.planar[chroma_start..chroma_start + chroma_stride];

            for (col, (px, &y)) in out_row
                .chunks_exact_mut(PREVIEW_CHANNELS)
                .zip(luma)
                .enumerate()
            {
                let uv = col & !1;
                px.copy_from_slice(&yuv_to_bgr(y, chroma[uv], chroma[uv + 1]));
            }
        }

        debug_assert_eq!(self.output.data.len(), w * h * PREVIEW_CHANNELS);
        Ok(&self.output)
    }

    fn allocate(&mut self, width: u32, height: u32, planar_len: usize) {
        debug!(
            width,
            height,
            previous = ?self.dimensions,
            "Allocating NV12 conversion buffers"
        );
        self.planar = vec![0u8; planar_len];
        self.output = ConvertedFrame::new(width, height);
        self.dimensions = Some((width, height));
        self.reallocations += 1;
    }
}

/// Convert one BT.601 limited-range YUV sample to `[b, g, r]`.
///
/// Fixed-point inverse of the RGB → YUV matrix (`66/129/25`, `-38/-74/112`,
/// `112/-94/-18`) scaled by 256.
#[inline]
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (i32::from(y) - 16);
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let r = (c + 409 * e + 128) >> 8;
    let g = (c - 100 * d - 208 * e + 128) >> 8;
    let b = (c + 516 * d + 128) >> 8;

    [
        b.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        r.clamp(0, 255) as u8,
    ]
}
