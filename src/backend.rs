//! The three "external collaborator" seams named in §1/§6: generic image
//! decoding, the pixel blit, and the host's placeholder-cell grid.
//!
//! None of these touch a real window system or terminal grid — a host
//! embeds [`crate::host::GraphicsHost`] by implementing them over its own
//! state.

use std::path::Path;

use crate::error::DecodeError;
use crate::pixel::PixelBuffer;

/// Output of a generic-format decode (§4.D, format 100/0).
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Row-major, 4 bytes per pixel, R,G,B,A.
    pub rgba: Vec<u8>,
}

/// Decodes arbitrary image files (PNG/JPEG/GIF/WebP/...) the way the
/// imlib-backed original used a process-wide decode context for.
pub trait DecodeBackend {
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError>;
}

/// Default backend: wraps the `image` crate.
pub struct ImageCrateBackend;

impl DecodeBackend for ImageCrateBackend {
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        let img = image::open(path).map_err(|err| DecodeError::Backend(err.to_string()))?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(DecodedImage {
            width,
            height,
            rgba: rgba.into_raw(),
        })
    }
}

/// A rectangle to blit, in the host's pixel space, plus the reverse-color
/// modifier carried by `ImageRect.reverse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRect {
    pub x_pix: i32,
    pub y_pix: i32,
    pub width: u32,
    pub height: u32,
    pub reverse: bool,
}

/// Blits a scaled pixel buffer rectangle onto whatever drawable the host
/// gave this backend at construction time.
pub trait DrawBackend {
    fn blit(&mut self, rect: BlitRect, pixels: &PixelBuffer);
}

/// Enumerates the grid's placeholder cells (`for_each_image_cell`, §6).
/// `visit` receives `(image_id, placement_id, col, row, is_classic)` and
/// returns `true` to request the cell be erased.
pub trait CellEraser {
    fn for_each_image_cell(&mut self, visit: &mut dyn FnMut(u32, u32, u32, u32, bool) -> bool);
}

#[cfg(any(test, feature = "test-utils"))]
pub struct StubDecodeBackend {
    pub result: Result<DecodedImage, String>,
}

#[cfg(any(test, feature = "test-utils"))]
impl StubDecodeBackend {
    #[must_use]
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut buf = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..(width * height) {
            buf.extend_from_slice(&rgba);
        }
        Self {
            result: Ok(DecodedImage {
                width,
                height,
                rgba: buf,
            }),
        }
    }

    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl DecodeBackend for StubDecodeBackend {
    fn decode(&self, _path: &Path) -> Result<DecodedImage, DecodeError> {
        match &self.result {
            Ok(img) => Ok(DecodedImage {
                width: img.width,
                height: img.height,
                rgba: img.rgba.clone(),
            }),
            Err(message) => Err(DecodeError::Backend(message.clone())),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct NullDrawBackend {
    pub calls: Vec<BlitRect>,
}

#[cfg(any(test, feature = "test-utils"))]
impl DrawBackend for NullDrawBackend {
    fn blit(&mut self, rect: BlitRect, _pixels: &PixelBuffer) {
        self.calls.push(rect);
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct FakeGrid {
    /// `(image_id, placement_id, col, row, is_classic)`.
    pub cells: Vec<(u32, u32, u32, u32, bool)>,
    pub erased: Vec<(u32, u32)>,
}

#[cfg(any(test, feature = "test-utils"))]
impl CellEraser for FakeGrid {
    fn for_each_image_cell(&mut self, visit: &mut dyn FnMut(u32, u32, u32, u32, bool) -> bool) {
        for &(image_id, placement_id, col, row, is_classic) in &self.cells {
            if visit(image_id, placement_id, col, row, is_classic) {
                self.erased.push((col, row));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_returns_canned_image() {
        let backend = StubDecodeBackend::solid(2, 2, [1, 2, 3, 4]);
        let decoded = backend.decode(Path::new("/does/not/exist")).unwrap();
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.height, 2);
        assert_eq!(decoded.rgba.len(), 16);
    }

    #[test]
    fn fake_grid_reports_erased_cells_matched_by_visitor() {
        let mut grid = FakeGrid {
            cells: vec![(1, 1, 0, 0, true), (2, 1, 1, 0, true)],
            erased: Vec::new(),
        };
        grid.for_each_image_cell(&mut |image_id, _pl, _col, _row, _classic| image_id == 1);
        assert_eq!(grid.erased, vec![(0, 0)]);
    }
}
