//! §4.E — the deferred tile list: a small bounded set of pending
//! rectangles, coalesced vertically and force-flushed on overflow.

use log::debug;

use crate::backend::DrawBackend;
use crate::loader;
use crate::store::Store;

/// One ephemeral pending rectangle (§3). Cells are zero-based, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRect {
    pub image_id: u32,
    pub placement_id: u32,
    pub start_col: u32,
    pub end_col: u32,
    pub start_row: u32,
    pub end_row: u32,
    pub x_pix: i32,
    pub y_pix: i32,
    pub cw: u32,
    pub ch: u32,
    pub reverse: bool,
}

impl ImageRect {
    #[must_use]
    pub fn rows(&self) -> u32 {
        self.end_row.saturating_sub(self.start_row)
    }

    #[must_use]
    pub fn is_empty_area(&self) -> bool {
        self.start_col >= self.end_col || self.start_row >= self.end_row
    }

    /// The pixel y coordinate of the rect's bottom edge; eviction picks
    /// the rect with the largest value (lowest on screen) first.
    #[must_use]
    pub fn bottom_y(&self) -> i64 {
        i64::from(self.y_pix) + i64::from(self.rows()) * i64::from(self.ch)
    }
}

/// Implementation detail: the original used a fixed array of 20. A `Vec`
/// of `Option` preserves the "stable slot, free-slot scan" structure
/// without hardcoding the capacity into the type.
pub struct TileList {
    slots: Vec<Option<ImageRect>>,
    pub debug_mode: bool,
    cw: u32,
    ch: u32,
    flushed_count: u64,
    evicted_count: u64,
}

impl Default for TileList {
    fn default() -> Self {
        Self::new(20)
    }
}

impl TileList {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            debug_mode: false,
            cw: 0,
            ch: 0,
            flushed_count: 0,
            evicted_count: 0,
        }
    }

    /// Records the current cell metrics for the debug HUD (§4.E).
    pub fn start_drawing(&mut self, cw: u32, ch: u32) {
        self.cw = cw;
        self.ch = ch;
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// `append_imagerect` (§4.E). `store`/`backend` are only consulted if
    /// this call forces an eviction — an overflowing append draws through
    /// the loader (§2's "E invokes D → D invokes backend blit") before
    /// reusing the slot.
    pub fn append_imagerect(&mut self, new: ImageRect, store: &Store, backend: &mut dyn DrawBackend) {
        if new.is_empty_area() || new.image_id == 0 {
            return;
        }

        for slot in self.slots.iter_mut().flatten() {
            if slot.image_id == new.image_id
                && slot.placement_id == new.placement_id
                && slot.cw == new.cw
                && slot.ch == new.ch
                && slot.reverse == new.reverse
                && slot.start_col == new.start_col
                && slot.end_col == new.end_col
                && slot.bottom_y() == i64::from(new.y_pix)
                && slot.end_row == new.start_row
            {
                slot.end_row = new.end_row;
                return;
            }
        }

        if let Some(free) = self.slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(new);
            return;
        }

        let evict_idx = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|rect| (i, rect.bottom_y())))
            .max_by_key(|&(_, y)| y)
            .map(|(i, _)| i);

        if let Some(idx) = evict_idx {
            if let Some(rect) = self.slots[idx].take() {
                loader::draw_rect(store, backend, &rect);
                self.evicted_count += 1;
            }
            self.slots[idx] = Some(new);
        }
    }

    /// `finish_drawing` (§4.E): flushes everything still pending.
    pub fn finish_drawing(&mut self, store: &Store, backend: &mut dyn DrawBackend) {
        for slot in &mut self.slots {
            if let Some(rect) = slot.take() {
                loader::draw_rect(store, backend, &rect);
                self.flushed_count += 1;
            }
        }
        if self.debug_mode {
            debug!(
                "finish_drawing: cw={} ch={} flushed={} evicted_since_start={}",
                self.cw, self.ch, self.flushed_count, self.evicted_count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullDrawBackend;
    use crate::config::Config;
    use crate::store::Placement;
    use std::time::Instant;

    fn rect(start_row: u32, end_row: u32, y_pix: i32) -> ImageRect {
        ImageRect {
            image_id: 1,
            placement_id: 1,
            start_col: 0,
            end_col: 4,
            start_row,
            end_row,
            x_pix: 0,
            y_pix,
            cw: 8,
            ch: 16,
            reverse: false,
        }
    }

    /// A store with a drawable placement `(1, placement_id)` per
    /// `placement_id` in `ids`, scaled wide/tall enough to cover every
    /// rect the tests in this module enqueue against it.
    fn store_with_drawable_placements(ids: &[u32]) -> Store {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut store = Store::new(Config::default(), dir);
        let now = Instant::now();
        store.create_image(1, now);
        for &placement_id in ids {
            let mut placement = Placement::new(placement_id, 1, now);
            placement.scaled = Some(crate::pixel::PixelBuffer {
                width: 32,
                height: 32,
                pixels: vec![0; 32 * 32],
            });
            placement.scaled_cw = 8;
            placement.scaled_ch = 16;
            store.insert_placement(placement);
        }
        store
    }

    #[test]
    fn drops_zero_area_rects() {
        let mut list = TileList::new(4);
        let store = store_with_drawable_placements(&[1]);
        let mut backend = NullDrawBackend::default();
        list.append_imagerect(rect(3, 3, 0), &store, &mut backend);
        assert_eq!(list.pending_count(), 0);
    }

    #[test]
    fn coalesces_vertically_adjacent_strip() {
        let mut list = TileList::new(4);
        let store = store_with_drawable_placements(&[1]);
        let mut backend = NullDrawBackend::default();
        list.append_imagerect(rect(0, 1, 0), &store, &mut backend);
        list.append_imagerect(rect(1, 2, 16), &store, &mut backend);
        assert_eq!(list.pending_count(), 1, "adjacent strip must merge, not add a slot");
        list.finish_drawing(&store, &mut backend);
        assert_eq!(backend.calls.len(), 1, "the merged strip is a single draw call");
    }

    #[test]
    fn distinct_column_ranges_do_not_merge() {
        let mut list = TileList::new(4);
        let store = store_with_drawable_placements(&[1]);
        let mut backend = NullDrawBackend::default();
        let mut other = rect(1, 2, 16);
        other.end_col = 2;
        list.append_imagerect(rect(0, 1, 0), &store, &mut backend);
        list.append_imagerect(other, &store, &mut backend);
        assert_eq!(list.pending_count(), 2);
    }

    #[test]
    fn evicts_lowest_rect_on_overflow_and_draws_it_first() {
        let mut list = TileList::new(2);
        let store = store_with_drawable_placements(&[1, 2]);
        let mut backend = NullDrawBackend::default();
        list.append_imagerect(rect(0, 1, 0), &store, &mut backend); // bottom 16
        list.append_imagerect(rect(0, 1, 100), &store, &mut backend); // bottom 116, lowest
        assert!(backend.calls.is_empty());

        let mut third = rect(0, 1, 50);
        third.placement_id = 2;
        list.append_imagerect(third, &store, &mut backend);

        assert_eq!(backend.calls.len(), 1);
        assert_eq!(backend.calls[0].y_pix, 100, "the lowest rect should be evicted first");
        assert_eq!(list.pending_count(), 2);
    }

    #[test]
    fn finish_drawing_flushes_everything() {
        let mut list = TileList::new(4);
        let store = store_with_drawable_placements(&[1, 2]);
        let mut backend = NullDrawBackend::default();
        list.append_imagerect(rect(0, 1, 0), &store, &mut backend);
        let mut other = rect(0, 1, 100);
        other.placement_id = 2;
        list.append_imagerect(other, &store, &mut backend);
        list.finish_drawing(&store, &mut backend);
        assert_eq!(backend.calls.len(), 2);
        assert_eq!(list.pending_count(), 0);
    }

    #[test]
    fn finish_drawing_is_a_no_op_for_rects_whose_placement_is_gone() {
        let mut list = TileList::new(4);
        let store = Store::new(Config::default(), tempfile::tempdir().unwrap().into_path());
        let mut backend = NullDrawBackend::default();
        list.append_imagerect(rect(0, 1, 0), &store, &mut backend);
        list.finish_drawing(&store, &mut backend);
        assert!(backend.calls.is_empty(), "no placement to source pixels from means nothing to blit");
    }
}
