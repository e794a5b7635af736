//! Display Module
//!
//! The preview surface and the single-threaded display context that owns it.
//! Frames reach the surface only through [`DisplayHandle`], never inline on
//! the frame arrival thread.

mod context;

pub use context::{DisplayContext, DisplayHandle};

use serde::{Deserialize, Serialize};
use shutter_common::{ConvertedFrame, PREVIEW_CHANNELS};
use tracing::debug;

/// A BGR24 pixel surface the preview is painted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Surface {
    /// Allocate a black surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * PREVIEW_CHANNELS],
        }
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major BGR pixels.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn fits(&self, frame: &ConvertedFrame) -> bool {
        frame.has_size(self.width, self.height) && frame.data.len() == self.pixels.len()
    }
}

/// What a render call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// A new surface was allocated for the frame's size; nothing was painted.
    Resized,
    /// The frame was copied into the existing surface.
    Painted,
}

/// Snapshot of the surface published after every display update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceStatus {
    /// Surface width, 0 when there is no surface.
    pub width: u32,
    /// Surface height, 0 when there is no surface.
    pub height: u32,
    /// Frames painted since the renderer was created.
    pub paints: u64,
    /// Surfaces allocated since the renderer was created.
    pub resizes: u64,
}

impl SurfaceStatus {
    pub const fn has_surface(&self) -> bool {
        self.width != 0 && self.height != 0
    }
}

/// Paints converted frames into a surface, replacing the surface when the
/// frame size changes.
#[derive(Debug, Default)]
pub struct FrameRenderer {
    surface: Option<Surface>,
    paints: u64,
    resizes: u64,
}

impl FrameRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render one frame.
    ///
    /// If there is no surface, or it has a different size, a surface sized to
    /// `frame` is allocated and the frame is dropped. Otherwise the surface
    /// pixels are overwritten in place.
    pub fn render(&mut self, frame: &ConvertedFrame) -> RenderOutcome {
        match self.surface.as_mut() {
            Some(surface) if surface.fits(frame) => {
                surface.pixels.copy_from_slice(&frame.data);
                self.paints += 1;
                RenderOutcome::Painted
            }
            _ => {
                debug!(
                    width = frame.width,
                    height = frame.height,
                    "Allocating preview surface"
                );
                self.surface = Some(Surface::new(frame.width, frame.height));
                self.resizes += 1;
                RenderOutcome::Resized
            }
        }
    }

    /// Drop the surface.
    pub fn clear(&mut self) {
        self.surface = None;
    }

    pub const fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    pub fn status(&self) -> SurfaceStatus {
        let (width, height) = self
            .surface
            .as_ref()
            .map(|s| (s.width, s.height))
            .unwrap_or_default();
        SurfaceStatus {
            width,
            height,
            paints: self.paints,
            resizes: self.resizes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, fill: u8) -> ConvertedFrame {
        let mut frame = ConvertedFrame::new(width, height);
        frame.data.fill(fill);
        frame
    }

    #[test]
    fn first_frame_allocates_without_painting() {
        let mut renderer = FrameRenderer::new();
        assert_eq!(renderer.render(&frame(640, 480, 130)), RenderOutcome::Resized);

        let surface = renderer.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (640, 480));
        assert!(surface.pixels().iter().all(|&p| p == 0));
        assert_eq!(renderer.status().paints, 0);
    }

    #[test]
    fn matching_frame_paints_in_place() {
        let mut renderer = FrameRenderer::new();
        renderer.render(&frame(4, 2, 1));
        let before = renderer.surface().unwrap().pixels().as_ptr();

        assert_eq!(renderer.render(&frame(4, 2, 200)), RenderOutcome::Painted);
        let surface = renderer.surface().unwrap();
        assert_eq!(surface.pixels().as_ptr(), before);
        assert!(surface.pixels().iter().all(|&p| p == 200));
    }

    #[test]
    fn size_change_replaces_surface_and_skips_paint() {
        let mut renderer = FrameRenderer::new();
        renderer.render(&frame(4, 2, 1));
        renderer.render(&frame(4, 2, 1));

        assert_eq!(renderer.render(&frame(8, 4, 9)), RenderOutcome::Resized);
        let status = renderer.status();
        assert_eq!((status.width, status.height), (8, 4));
        assert_eq!(status.paints, 1);
        assert_eq!(status.resizes, 2);
        assert!(renderer.surface().unwrap().pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn clear_drops_surface() {
        let mut renderer = FrameRenderer::new();
        renderer.render(&frame(4, 2, 1));
        renderer.clear();
        assert!(renderer.surface().is_none());
        assert!(!renderer.status().has_surface());
        assert_eq!(renderer.render(&frame(4, 2, 1)), RenderOutcome::Resized);
    }
}
