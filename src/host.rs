//! §6 — `GraphicsHost`: the single entry point an embedding terminal
//! talks to. Owns the store, the decode backend, and the deferred tile
//! list; every other module in this crate is a detail of how it answers
//! one of these calls.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::backend::{CellEraser, DecodeBackend, DrawBackend, ImageCrateBackend};
use crate::config::Config;
use crate::dispatcher::{self, CommandResult};
use crate::error::GraphicsError;
use crate::parser::{self, ParsedCommand};
use crate::pixel::PixelBuffer;
use crate::response::{error_message, format_response, ResponseFields};
use crate::store::{self, ImageStatus, Store, UploadingFailure};
use crate::tiles::{ImageRect, TileList};

/// §5: no chunk of a direct upload may go silent for more than this long;
/// past it the upload is declared dead rather than left to linger forever.
const UPLOAD_STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// A point-in-time summary of store occupancy (`dump_state`, §6 / §9
/// "audited by the state-dump routine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDump {
    pub image_count: usize,
    pub placement_count: usize,
    pub tracked_disk_total: u64,
    pub tracked_ram_total: u64,
    pub audited_disk_total: u64,
    pub audited_ram_total: u64,
}

pub struct GraphicsHost {
    store: Store,
    backend: Box<dyn DecodeBackend>,
    tiles: TileList,
    pub debug_mode: bool,
    cw: u32,
    ch: u32,
}

impl GraphicsHost {
    /// `init` (§6): creates the on-disk cache directory. Per §7, this is
    /// the one call allowed to fail fatally — everything past it degrades
    /// to a response frame instead.
    pub fn init(config: Config) -> Result<Self, GraphicsError> {
        Self::init_with_backend(config, Box::new(ImageCrateBackend))
    }

    pub fn init_with_backend(config: Config, backend: Box<dyn DecodeBackend>) -> Result<Self, GraphicsError> {
        let cache_dir = store::create_cache_dir(&config.cache_dir_template)?;
        Ok(Self {
            store: Store::new(config, cache_dir),
            backend,
            tiles: TileList::default(),
            debug_mode: false,
            cw: 0,
            ch: 0,
        })
    }

    /// `deinit` (§6, §5): drops every image/placement and removes the
    /// cache directory.
    pub fn deinit(&mut self) {
        self.store.clear_all();
    }

    fn timeout_stalled_upload(&mut self, now: Instant) {
        let Some(image_id) = self.store.current_direct_upload else {
            return;
        };
        let Some(last_chunk) = self.store.last_chunk_time else {
            return;
        };
        if now.duration_since(last_chunk) <= UPLOAD_STALL_TIMEOUT {
            return;
        }
        warn!("direct upload of image {image_id} stalled for over {UPLOAD_STALL_TIMEOUT:?}, abandoning it");
        if let Some(image) = self.store.image_mut(image_id) {
            image.status = ImageStatus::UploadingError;
            image.uploading_failure = UploadingFailure::TimedOut;
        }
        self.store.current_direct_upload = None;
    }

    /// `parse_command` (§6): validates the leading `G` sentinel of the wire
    /// protocol, then parses the remaining command body and dispatches it.
    /// Never returns `Result` — §6 documents this entry point as returning
    /// 0/1; a buffer not starting with `G` is the 0 case and yields an
    /// all-default `CommandResult` with no side effects, exactly as if
    /// nothing had been processed. A malformed-but-`G`-prefixed body still
    /// yields a `CommandResult` whose `error` flag and `response` frame
    /// carry the failure (§7), which is the 1 case.
    pub fn parse_command(&mut self, buf: &[u8], grid: &mut dyn CellEraser) -> CommandResult {
        let Some((&b'G', body)) = buf.split_first() else {
            return CommandResult::default();
        };

        let now = Instant::now();
        self.timeout_stalled_upload(now);

        let cmd: ParsedCommand = parser::parse(body);
        let mut result = dispatcher::dispatch(&mut self.store, self.backend.as_ref(), grid, &cmd, self.cw, self.ch, now);

        // A syntax error (unknown key, malformed integer) always wins over
        // whatever the dispatcher made of the rest of the command, and is
        // reported regardless of `q=` — only the all-zero-id discard rule
        // in `format_response` can still swallow it.
        if cmd.had_error {
            result.error = true;
            let fields = ResponseFields {
                image_id: cmd.image_id.unwrap_or(0).max(0) as u32,
                image_number: cmd.image_number.unwrap_or(0).max(0) as u32,
                placement_id: cmd.placement_id.unwrap_or(0).max(0) as u32,
            };
            if let Some(frame) = format_response(fields, &error_message("EINVAL", "malformed command")) {
                result.response = Some(frame);
            }
        }
        result
    }

    /// `start_drawing` (§4.E, §6): records the current cell metrics a
    /// frame's worth of `append_imagerect` calls will use.
    pub fn start_drawing(&mut self, cw: u32, ch: u32) {
        self.cw = cw;
        self.ch = ch;
        self.tiles.start_drawing(cw, ch);
    }

    /// `append_imagerect` (§4.E, §6). `backend` is only invoked if this
    /// append forces an eviction, via the loader (§2's "E invokes D → D
    /// invokes backend blit").
    pub fn append_imagerect(&mut self, rect: ImageRect, backend: &mut dyn DrawBackend) {
        self.tiles.append_imagerect(rect, &self.store, backend);
    }

    /// `finish_drawing` (§4.E, §6): flushes every rect still pending,
    /// pulling each one's pixels through the loader before blitting them.
    pub fn finish_drawing(&mut self, backend: &mut dyn DrawBackend) {
        self.tiles.debug_mode = self.debug_mode;
        self.tiles.finish_drawing(&self.store, backend);
    }

    /// `unload_images_to_reduce_ram` (§6): drops every unprotected RAM
    /// buffer, e.g. in response to the host's own memory pressure.
    pub fn unload_images_to_reduce_ram(&mut self) {
        self.store.unload_all_ram();
    }

    /// `preview_image` (§6): the decoded RAM buffer for an image, for a
    /// host-side preview/thumbnail surface. `None` if the image isn't
    /// loaded (or doesn't exist).
    #[must_use]
    pub fn preview_image(&self, image_id: u32) -> Option<&PixelBuffer> {
        self.store.image(image_id).and_then(|image| image.ram.as_ref())
    }

    /// `dump_state` (§6, §9): a diagnostic snapshot, including the
    /// from-scratch audit that property 2 checks against the tracked
    /// counters.
    #[must_use]
    pub fn dump_state(&self) -> StateDump {
        let (audited_disk_total, audited_ram_total) = self.store.audit();
        let dump = StateDump {
            image_count: self.store.image_count(),
            placement_count: self.store.placement_count(),
            tracked_disk_total: self.store.images_disk_total,
            tracked_ram_total: self.store.images_ram_total,
            audited_disk_total,
            audited_ram_total,
        };
        debug!(
            "dump_state: images={} placements={} disk={}/{} ram={}/{}",
            dump.image_count,
            dump.placement_count,
            dump.tracked_disk_total,
            dump.audited_disk_total,
            dump.tracked_ram_total,
            dump.audited_ram_total
        );
        dump
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeGrid, StubDecodeBackend};

    fn host_with_stub() -> GraphicsHost {
        GraphicsHost::init_with_backend(Config::default(), Box::new(StubDecodeBackend::solid(2, 2, [9, 9, 9, 255])))
            .unwrap()
    }

    #[test]
    fn init_creates_a_usable_cache_directory() {
        let host = host_with_stub();
        assert!(host.store().cache_dir.exists());
    }

    #[test]
    fn malformed_command_is_downgraded_to_an_error_response() {
        let mut host = host_with_stub();
        let mut grid = FakeGrid::default();
        let result = host.parse_command(b"Ga=p,Z=9,i=1\0", &mut grid);
        assert!(result.error);
        assert!(result.response.unwrap().contains("EINVAL"));
    }

    #[test]
    fn buffer_not_starting_with_g_is_rejected_without_side_effects() {
        let mut host = host_with_stub();
        let mut grid = FakeGrid::default();
        let result = host.parse_command(b"a=p,i=1\0", &mut grid);
        assert_eq!(result, CommandResult::default());
        assert_eq!(host.store().image_count(), 0);
    }

    #[test]
    fn deinit_removes_the_cache_directory() {
        let mut host = host_with_stub();
        let cache_dir = host.store().cache_dir.clone();
        host.deinit();
        assert!(!cache_dir.exists());
    }

    #[test]
    fn stalled_direct_upload_is_abandoned_after_timeout() {
        let mut host = host_with_stub();
        let mut grid = FakeGrid::default();
        host.parse_command(b"Ga=t,f=0,s=1,v=1,i=1,S=999,m=1;AAAA\0", &mut grid);
        assert_eq!(host.store().current_direct_upload, Some(1));

        host.store.last_chunk_time = Some(Instant::now() - Duration::from_secs(2));
        host.timeout_stalled_upload(Instant::now());

        assert!(host.store().current_direct_upload.is_none());
        assert_eq!(host.store().image(1).unwrap().uploading_failure, UploadingFailure::TimedOut);
    }

    #[test]
    fn finish_drawing_pulls_pixels_through_the_loader_into_the_backend() {
        let mut host = host_with_stub();
        host.start_drawing(8, 16);

        let now = Instant::now();
        host.store.create_image(1, now);
        let mut placement = crate::store::Placement::new(1, 1, now);
        placement.scaled = Some(PixelBuffer {
            width: 8,
            height: 16,
            pixels: vec![0xFFFF_FFFF; 8 * 16],
        });
        placement.scaled_cw = 8;
        placement.scaled_ch = 16;
        host.store.insert_placement(placement);

        let mut backend = crate::backend::NullDrawBackend::default();
        host.append_imagerect(
            ImageRect {
                image_id: 1,
                placement_id: 1,
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
            &mut backend,
        );
        host.finish_drawing(&mut backend);
        assert_eq!(backend.calls.len(), 1);
        assert_eq!(backend.calls[0].width, 8);
        assert_eq!(backend.calls[0].height, 16);
    }
}
