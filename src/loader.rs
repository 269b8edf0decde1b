//! §4.D — moving an image from disk into RAM, and building a placement's
//! scaled buffer from it (§4.D.1 sizing, §4.D.2 scaling).

use std::time::Instant;

use log::{debug, warn};

use crate::backend::{BlitRect, DecodeBackend, DrawBackend};
use crate::pixel::{self, PixelBuffer, RawFormat};
use crate::store::{Compression, Format, ImageStatus, ScaleMode, Store};
use crate::tiles::ImageRect;

fn pack_rgba_bytes(width: u32, height: u32, rgba: &[u8]) -> PixelBuffer {
    let mut pixels = Vec::with_capacity((width as usize) * (height as usize));
    for px in rgba.chunks_exact(4) {
        pixels.push(((px[3] as u32) << 24) | ((px[0] as u32) << 16) | ((px[1] as u32) << 8) | (px[2] as u32));
    }
    PixelBuffer {
        width,
        height,
        pixels,
    }
}

fn mark_ram_error(store: &mut Store, image_id: u32) {
    if let Some(image) = store.image_mut(image_id) {
        image.status = ImageStatus::RamLoadingError;
    }
}

/// `load_image` (§4.D). No-op (returns the cached result) if a RAM buffer
/// is already present or a prior decode attempt hard-failed.
pub fn load_image(store: &mut Store, backend: &dyn DecodeBackend, image_id: u32) -> bool {
    let Some((status, format, compression, path, mut pix_width, mut pix_height)) =
        store.image(image_id).map(|image| {
            (
                image.status,
                image.format,
                image.compression,
                image.disk_path.clone(),
                image.pix_width,
                image.pix_height,
            )
        })
    else {
        return false;
    };

    match status {
        ImageStatus::RamLoadingSuccess => return true,
        ImageStatus::RamLoadingError => return false,
        ImageStatus::UploadingSuccess => {}
        _ => return false,
    }

    let Some(path) = path else {
        warn!("image {image_id}: no cached file to load");
        mark_ram_error(store, image_id);
        return false;
    };

    let try_generic = matches!(format, Format::Imlib | Format::Auto);
    let mut buffer = None;

    if try_generic {
        match backend.decode(&path) {
            Ok(decoded) => {
                pix_width = decoded.width;
                pix_height = decoded.height;
                buffer = Some(pack_rgba_bytes(decoded.width, decoded.height, &decoded.rgba));
            }
            Err(err) => {
                if format == Format::Imlib {
                    warn!("image {image_id}: generic decode failed: {err}");
                    mark_ram_error(store, image_id);
                    return false;
                }
                debug!("image {image_id}: generic decode failed, trying raw fallback: {err}");
            }
        }
    }

    if buffer.is_none() {
        if pix_width == 0 || pix_height == 0 {
            warn!("image {image_id}: raw decode needs known pixel dimensions");
            mark_ram_error(store, image_id);
            return false;
        }
        let raw_format = if format == Format::Rgb {
            RawFormat::Rgb
        } else {
            RawFormat::Rgba
        };
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!("image {image_id}: cannot open cached file: {err}");
                mark_ram_error(store, image_id);
                return false;
            }
        };
        match pixel::decode_raw(
            file,
            pix_width,
            pix_height,
            raw_format,
            matches!(compression, Compression::Zlib),
            store.config.max_image_ram_size,
        ) {
            Ok(buf) => buffer = Some(buf),
            Err(err) => {
                warn!("image {image_id}: raw decode failed: {err}");
                mark_ram_error(store, image_id);
                return false;
            }
        }
    }

    let Some(buffer) = buffer else {
        mark_ram_error(store, image_id);
        return false;
    };

    let new_size = buffer.ram_size();
    let old_size = store.image(image_id).map_or(0, crate::store::Image::ram_size);

    if let Some(image) = store.image_mut(image_id) {
        image.pix_width = pix_width;
        image.pix_height = pix_height;
        image.ram = Some(buffer);
        image.status = ImageStatus::RamLoadingSuccess;
    }
    store.images_ram_total = store.images_ram_total.saturating_sub(old_size) + new_size;
    true
}

fn unload_placement_ram(store: &mut Store, image_id: u32, placement_id: u32) {
    if let Some(placement) = store.placement_mut(image_id, placement_id) {
        if let Some(buf) = placement.scaled.take() {
            store.images_ram_total = store.images_ram_total.saturating_sub(buf.ram_size());
        }
    }
}

/// §4.D.1: fills in `cols`/`rows` when either or both are zero.
#[must_use]
pub fn infer_size(
    src_width: u32,
    src_height: u32,
    cols: u32,
    rows: u32,
    cw: u32,
    ch: u32,
    scale_mode: ScaleMode,
) -> (u32, u32) {
    if cols == 0 && rows == 0 {
        if cw == 0 || ch == 0 {
            return (1, 1);
        }
        return (src_width.div_ceil(cw).max(1), src_height.div_ceil(ch).max(1));
    }

    if cols == 0 && scale_mode == ScaleMode::Contain {
        if src_height == 0 || ch == 0 || cw == 0 {
            return (1, rows);
        }
        let box_h = (rows * ch) as f64;
        let c = (box_h * (src_width as f64) / (src_height as f64) / (cw as f64))
            .ceil()
            .max(1.0) as u32;
        return (c, rows);
    }

    if rows == 0 && scale_mode == ScaleMode::Contain {
        if src_width == 0 || cw == 0 || ch == 0 {
            return (cols, 1);
        }
        let box_w = (cols * cw) as f64;
        let r = (box_w * (src_height as f64) / (src_width as f64) / (ch as f64))
            .ceil()
            .max(1.0) as u32;
        return (cols, r);
    }

    let c = if cols == 0 {
        src_width.div_ceil(cw.max(1)).max(1)
    } else {
        cols
    };
    let r = if rows == 0 {
        src_height.div_ceil(ch.max(1)).max(1)
    } else {
        rows
    };
    (c, r)
}

fn sample_subrect(src: &PixelBuffer, x: u32, y: u32, w: u32, h: u32) -> PixelBuffer {
    let mut pixels = Vec::with_capacity((w as usize) * (h as usize));
    for row in 0..h {
        let sy = (y + row).min(src.height.saturating_sub(1));
        for col in 0..w {
            let sx = (x + col).min(src.width.saturating_sub(1));
            pixels.push(src.pixels[(sy * src.width + sx) as usize]);
        }
    }
    PixelBuffer {
        width: w,
        height: h,
        pixels,
    }
}

fn resize_nearest(src: &PixelBuffer, dst_w: u32, dst_h: u32) -> PixelBuffer {
    let mut pixels = vec![0u32; (dst_w as usize) * (dst_h as usize)];
    if src.width > 0 && src.height > 0 && dst_w > 0 && dst_h > 0 {
        for y in 0..dst_h {
            let sy = (u64::from(y) * u64::from(src.height) / u64::from(dst_h)) as u32;
            for x in 0..dst_w {
                let sx = (u64::from(x) * u64::from(src.width) / u64::from(dst_w)) as u32;
                pixels[(y * dst_w + x) as usize] = src.pixels[(sy * src.width + sx) as usize];
            }
        }
    }
    PixelBuffer {
        width: dst_w,
        height: dst_h,
        pixels,
    }
}

fn blit_into(dest: &mut PixelBuffer, src: &PixelBuffer, ox: i32, oy: i32) {
    for y in 0..src.height {
        let dy = oy + y as i32;
        if dy < 0 || dy as u32 >= dest.height {
            continue;
        }
        for x in 0..src.width {
            let dx = ox + x as i32;
            if dx < 0 || dx as u32 >= dest.width {
                continue;
            }
            dest.pixels[(dy as u32 * dest.width + dx as u32) as usize] =
                src.pixels[(y * src.width + x) as usize];
        }
    }
}

/// §4.D.2: builds the `cols*cw x rows*ch` destination buffer for a
/// placement, blending the source sub-rectangle per `scale_mode`.
#[must_use]
pub fn build_scaled(
    src: &PixelBuffer,
    src_x: u32,
    src_y: u32,
    src_w: u32,
    src_h: u32,
    cols: u32,
    rows: u32,
    cw: u32,
    ch: u32,
    scale_mode: ScaleMode,
) -> PixelBuffer {
    let box_w = cols * cw;
    let box_h = rows * ch;
    let mut dest = PixelBuffer {
        width: box_w,
        height: box_h,
        pixels: vec![0u32; (box_w as usize) * (box_h as usize)],
    };
    if src_w == 0 || src_h == 0 {
        return dest;
    }
    let sub = sample_subrect(src, src_x, src_y, src_w, src_h);

    let effective_mode = match scale_mode {
        ScaleMode::NoneOrContain => {
            if box_w >= src_w && box_h >= src_h {
                ScaleMode::None
            } else {
                ScaleMode::Contain
            }
        }
        other => other,
    };

    match effective_mode {
        ScaleMode::Fill => {
            let scaled = resize_nearest(&sub, box_w, box_h);
            blit_into(&mut dest, &scaled, 0, 0);
        }
        ScaleMode::None => {
            blit_into(&mut dest, &sub, 0, 0);
        }
        ScaleMode::Contain | ScaleMode::NoneOrContain => {
            let scale = (f64::from(box_w) / f64::from(src_w)).min(f64::from(box_h) / f64::from(src_h));
            let new_w = ((f64::from(src_w) * scale).round().max(1.0) as u32).min(box_w);
            let new_h = ((f64::from(src_h) * scale).round().max(1.0) as u32).min(box_h);
            let scaled = resize_nearest(&sub, new_w, new_h);
            let ox = (box_w as i32 - scaled.width as i32) / 2;
            let oy = (box_h as i32 - scaled.height as i32) / 2;
            blit_into(&mut dest, &scaled, ox, oy);
        }
    }
    dest
}

/// `load_placement` (§4.D).
pub fn load_placement(
    store: &mut Store,
    backend: &dyn DecodeBackend,
    image_id: u32,
    placement_id: u32,
    cw: u32,
    ch: u32,
    now: Instant,
) -> bool {
    store.touch_placement(image_id, placement_id, now);

    if let Some(placement) = store.placement(image_id, placement_id) {
        if placement.scaled.is_some() && placement.scaled_cw == cw && placement.scaled_ch == ch {
            return true;
        }
    } else {
        return false;
    }

    unload_placement_ram(store, image_id, placement_id);

    if !load_image(store, backend, image_id) {
        return false;
    }

    let Some((src_x, src_y, src_w, src_h, mut cols, mut rows, scale_mode)) =
        store.placement(image_id, placement_id).and_then(|placement| {
            store.image(image_id).map(|image| {
                let sx = placement.src_x.min(image.pix_width);
                let sy = placement.src_y.min(image.pix_height);
                let sw = if placement.src_width == 0 {
                    image.pix_width.saturating_sub(sx)
                } else {
                    placement.src_width.min(image.pix_width.saturating_sub(sx))
                };
                let sh = if placement.src_height == 0 {
                    image.pix_height.saturating_sub(sy)
                } else {
                    placement.src_height.min(image.pix_height.saturating_sub(sy))
                };
                (sx, sy, sw, sh, placement.cols, placement.rows, placement.scale_mode)
            })
        })
    else {
        return false;
    };

    if cols == 0 || rows == 0 {
        let (c, r) = infer_size(src_w, src_h, cols, rows, cw, ch, scale_mode);
        cols = c;
        rows = r;
    }

    let needed = u64::from(cols) * u64::from(cw) * u64::from(rows) * u64::from(ch) * 4;
    if needed > store.config.max_image_ram_size {
        warn!("placement {placement_id} of image {image_id}: scaled buffer exceeds RAM ceiling");
        return false;
    }

    let Some(scaled) = store
        .image(image_id)
        .and_then(|image| image.ram.as_ref())
        .map(|src| build_scaled(src, src_x, src_y, src_w, src_h, cols, rows, cw, ch, scale_mode))
    else {
        return false;
    };

    let size = scaled.ram_size();
    if let Some(placement) = store.placement_mut(image_id, placement_id) {
        placement.protected = true;
        placement.cols = cols;
        placement.rows = rows;
        placement.scaled_cw = cw;
        placement.scaled_ch = ch;
        placement.scaled = Some(scaled);
    }
    store.images_ram_total += size;

    store.check_limits();

    if let Some(placement) = store.placement_mut(image_id, placement_id) {
        placement.protected = false;
    }
    true
}

/// §2's "E invokes D → D invokes backend blit": slices the pixels a
/// pending tile rect covers out of its placement's already-scaled buffer
/// and hands them to the drawing backend. A no-op if the placement or its
/// scaled buffer is gone by the time the rect is flushed (e.g. evicted
/// since it was enqueued) — nothing left to draw.
pub fn draw_rect(store: &Store, backend: &mut dyn DrawBackend, rect: &ImageRect) {
    let Some(scaled) = store
        .placement(rect.image_id, rect.placement_id)
        .and_then(|placement| placement.scaled.as_ref())
    else {
        return;
    };

    let x0 = rect.start_col * rect.cw;
    let y0 = rect.start_row * rect.ch;
    if x0 >= scaled.width || y0 >= scaled.height {
        return;
    }
    let width = ((rect.end_col - rect.start_col) * rect.cw).min(scaled.width - x0);
    let height = (rect.rows() * rect.ch).min(scaled.height - y0);
    if width == 0 || height == 0 {
        return;
    }

    let slice = sample_subrect(scaled, x0, y0, width, height);
    backend.blit(
        BlitRect {
            x_pix: rect.x_pix,
            y_pix: rect.y_pix,
            width,
            height,
            reverse: rect.reverse,
        },
        &slice,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubDecodeBackend;
    use crate::store::{Image, Placement};
    use crate::config::Config;

    fn setup(format: Format) -> (Store, u32, u32) {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut store = Store::new(Config::default(), dir);
        let now = Instant::now();
        let image_id = 0x1234_5600;
        let image: &mut Image = store.create_image(image_id, now);
        image.format = format;
        image.status = ImageStatus::UploadingSuccess;
        image.disk_path = Some(std::path::PathBuf::from("/nonexistent/path"));
        let placement_id = 0x00AB_CDEF;
        store.insert_placement(Placement::new(placement_id, image_id, now));
        (store, image_id, placement_id)
    }

    #[test]
    fn load_image_uses_generic_backend_for_auto_format() {
        let (mut store, image_id, _) = setup(Format::Auto);
        let backend = StubDecodeBackend::solid(4, 2, [10, 20, 30, 255]);
        assert!(load_image(&mut store, &backend, image_id));
        let image = store.image(image_id).unwrap();
        assert_eq!(image.pix_width, 4);
        assert_eq!(image.pix_height, 2);
        assert!(image.ram.is_some());
    }

    #[test]
    fn load_image_is_idempotent_once_loaded() {
        let (mut store, image_id, _) = setup(Format::Auto);
        let backend = StubDecodeBackend::solid(1, 1, [1, 1, 1, 1]);
        assert!(load_image(&mut store, &backend, image_id));
        let ram_total_after_first = store.images_ram_total;
        assert!(load_image(&mut store, &backend, image_id));
        assert_eq!(store.images_ram_total, ram_total_after_first);
    }

    #[test]
    fn load_placement_infers_cols_rows_from_source_rect() {
        let (mut store, image_id, placement_id) = setup(Format::Auto);
        let backend = StubDecodeBackend::solid(20, 40, [5, 5, 5, 255]);
        if let Some(placement) = store.placement_mut(image_id, placement_id) {
            placement.src_width = 0;
            placement.src_height = 0;
            placement.cols = 0;
            placement.rows = 0;
        }
        assert!(load_placement(&mut store, &backend, image_id, placement_id, 10, 20, Instant::now()));
        let placement = store.placement(image_id, placement_id).unwrap();
        assert_eq!(placement.cols, 2);
        assert_eq!(placement.rows, 2);
        assert!(placement.scaled.is_some());
    }

    #[test]
    fn fill_stretches_to_exact_box() {
        let src = PixelBuffer {
            width: 2,
            height: 2,
            pixels: vec![1, 2, 3, 4],
        };
        let dest = build_scaled(&src, 0, 0, 2, 2, 2, 2, 4, 4, ScaleMode::Fill);
        assert_eq!(dest.width, 8);
        assert_eq!(dest.height, 8);
    }

    #[test]
    fn draw_rect_blits_the_strip_the_rect_covers() {
        let (mut store, image_id, placement_id) = setup(Format::Auto);
        let backend = StubDecodeBackend::solid(4, 2, [9, 9, 9, 255]);
        if let Some(placement) = store.placement_mut(image_id, placement_id) {
            placement.cols = 4;
            placement.rows = 2;
        }
        assert!(load_placement(&mut store, &backend, image_id, placement_id, 8, 16, Instant::now()));

        let mut draw_backend = crate::backend::NullDrawBackend::default();
        draw_rect(
            &store,
            &mut draw_backend,
            &ImageRect {
                image_id,
                placement_id,
                start_col: 0,
                end_col: 2,
                start_row: 0,
                end_row: 1,
                x_pix: 3,
                y_pix: 5,
                cw: 8,
                ch: 16,
                reverse: false,
            },
        );

        assert_eq!(draw_backend.calls.len(), 1);
        let call = draw_backend.calls[0];
        assert_eq!(call.x_pix, 3);
        assert_eq!(call.y_pix, 5);
        assert_eq!(call.width, 16);
        assert_eq!(call.height, 16);
    }

    #[test]
    fn draw_rect_is_a_no_op_without_a_scaled_buffer() {
        let (store, image_id, placement_id) = setup(Format::Auto);
        let mut draw_backend = crate::backend::NullDrawBackend::default();
        draw_rect(
            &store,
            &mut draw_backend,
            &ImageRect {
                image_id,
                placement_id,
                start_col: 0,
                end_col: 1,
                start_row: 0,
                end_row: 1,
                x_pix: 0,
                y_pix: 0,
                cw: 8,
                ch: 16,
                reverse: false,
            },
        );
        assert!(draw_backend.calls.is_empty());
    }

    #[test]
    fn contain_centers_and_pads_transparent() {
        let src = PixelBuffer {
            width: 4,
            height: 2,
            pixels: vec![0xFFFF_FFFF; 8],
        };
        let dest = build_scaled(&src, 0, 0, 4, 2, 2, 2, 4, 4, ScaleMode::Contain);
        // box is 8x8, source aspect 2:1 -> scaled to 8x4, padded top+bottom
        assert_eq!(dest.pixels[0], 0); // top-left corner stays transparent
    }
}
