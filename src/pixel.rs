//! §4.B — decoding raw (optionally zlib-compressed) RGB/RGBA streams into
//! the canonical 32-bit-per-pixel buffer the loader and draw backend use.

use std::io::{self, Read};

use flate2::read::ZlibDecoder;

use crate::error::DecodeError;

/// Pixel layout of an uncompressed upload (`f=24` or `f=32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    Rgb,
    Rgba,
}

impl RawFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            RawFormat::Rgb => 3,
            RawFormat::Rgba => 4,
        }
    }
}

/// A decoded image in canonical form: one `u32` per pixel, alpha in the
/// top byte and blue in the low byte (`0xAARRGGBB`).
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl PixelBuffer {
    #[must_use]
    pub fn ram_size(&self) -> u64 {
        (self.width as u64) * (self.height as u64) * 4
    }
}

fn pack_argb(r: u8, g: u8, b: u8, a: u8) -> u32 {
    ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
}

/// Decodes `width * height` pixels out of `reader`, which carries either a
/// raw RGB/RGBA byte stream or (if `compressed`) a zlib stream of the
/// same. Extra bytes beyond `width * height` pixels are discarded; a
/// short stream simply yields fewer pixels than requested (the loader
/// decides whether that is fatal).
pub fn decode_raw<R: Read>(
    reader: R,
    width: u32,
    height: u32,
    format: RawFormat,
    compressed: bool,
    ram_budget: u64,
) -> Result<PixelBuffer, DecodeError> {
    let total_pixels = u64::from(width) * u64::from(height);
    let needed_ram = total_pixels.saturating_mul(4);
    if needed_ram > ram_budget {
        return Err(DecodeError::OverBudget);
    }

    let bpp = format.bytes_per_pixel();
    let mut pixels = Vec::with_capacity(total_pixels as usize);

    if compressed {
        let mut inflater = ZlibDecoder::new(reader);
        read_pixels(&mut inflater, total_pixels, bpp, &mut pixels)
            .map_err(|err| DecodeError::Inflate(err.to_string()))?;
    } else {
        let mut reader = reader;
        read_pixels(&mut reader, total_pixels, bpp, &mut pixels)?;
    }

    Ok(PixelBuffer {
        width,
        height,
        pixels,
    })
}

fn read_pixels<R: Read>(
    reader: &mut R,
    total_pixels: u64,
    bpp: usize,
    out: &mut Vec<u32>,
) -> io::Result<()> {
    let mut chunk = vec![0u8; bpp * 4096];
    let mut leftover: Vec<u8> = Vec::new();

    loop {
        if (out.len() as u64) >= total_pixels {
            break;
        }
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            // Reader made no progress: either true EOF or (for the
            // compressed path) the inflater has nothing left to flush.
            break;
        }
        leftover.extend_from_slice(&chunk[..read]);

        let mut consumed = 0usize;
        while leftover.len() - consumed >= bpp && (out.len() as u64) < total_pixels {
            let px = &leftover[consumed..consumed + bpp];
            let (r, g, b, a) = if bpp == 4 {
                (px[0], px[1], px[2], px[3])
            } else {
                (px[0], px[1], px[2], 0xFF)
            };
            out.push(pack_argb(r, g, b, a));
            consumed += bpp;
        }
        leftover.drain(0..consumed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn decodes_uncompressed_rgba() {
        // 2x1 image: opaque red, then translucent blue.
        let raw = [255u8, 0, 0, 255, 0, 0, 255, 128];
        let buf = decode_raw(&raw[..], 2, 1, RawFormat::Rgba, false, u64::MAX).unwrap();
        assert_eq!(buf.width, 2);
        assert_eq!(buf.height, 1);
        assert_eq!(buf.pixels, vec![pack_argb(255, 0, 0, 255), pack_argb(0, 0, 255, 128)]);
    }

    #[test]
    fn decodes_uncompressed_rgb_as_opaque() {
        let raw = [10u8, 20, 30];
        let buf = decode_raw(&raw[..], 1, 1, RawFormat::Rgb, false, u64::MAX).unwrap();
        assert_eq!(buf.pixels, vec![pack_argb(10, 20, 30, 0xFF)]);
    }

    #[test]
    fn discards_extra_bytes_past_declared_size() {
        let mut raw = vec![1u8, 2, 3, 4, 5, 6];
        raw.extend_from_slice(&[9, 9, 9]); // extra, should be ignored
        let buf = decode_raw(&raw[..], 2, 1, RawFormat::Rgb, false, u64::MAX).unwrap();
        assert_eq!(buf.pixels.len(), 2);
    }

    #[test]
    fn over_budget_is_rejected_before_allocation() {
        let err = decode_raw(&[][..], 1 << 16, 1 << 16, RawFormat::Rgba, false, 1024)
            .unwrap_err();
        assert!(matches!(err, DecodeError::OverBudget));
    }

    #[test]
    fn decodes_zlib_compressed_stream() {
        let raw = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        let buf = decode_raw(&compressed[..], 1, 3, RawFormat::Rgba, true, u64::MAX).unwrap();
        assert_eq!(
            buf.pixels,
            vec![
                pack_argb(1, 2, 3, 4),
                pack_argb(5, 6, 7, 8),
                pack_argb(9, 10, 11, 12),
            ]
        );
    }

    #[test]
    fn short_stream_yields_fewer_pixels() {
        let raw = [1u8, 2, 3, 4]; // only one RGBA pixel, two declared
        let buf = decode_raw(&raw[..], 2, 1, RawFormat::Rgba, false, u64::MAX).unwrap();
        assert_eq!(buf.pixels.len(), 1);
    }
}
