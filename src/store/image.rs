//! The `Image` record (§3).

use std::path::PathBuf;
use std::time::Instant;

use crate::pixel::PixelBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Uninitialized,
    Uploading,
    UploadingError,
    UploadingSuccess,
    RamLoadingError,
    RamLoadingSuccess,
}

impl ImageStatus {
    #[must_use]
    pub fn is_loaded(self) -> bool {
        matches!(self, ImageStatus::RamLoadingSuccess)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadingFailure {
    None,
    OverSizeLimit,
    CannotOpenCachedFile,
    UnexpectedSize,
    CannotCopyFile,
    /// No chunk arrived for over a second (§5's heuristic timeout); not
    /// one of the original failure codes, added so a stalled upload
    /// gets a distinct response instead of reusing an unrelated one.
    TimedOut,
}

/// `f=` value (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Auto,
    Rgb,
    Rgba,
    Imlib,
}

impl Format {
    #[must_use]
    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            0 => Some(Format::Auto),
            24 => Some(Format::Rgb),
            32 => Some(Format::Rgba),
            100 => Some(Format::Imlib),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

/// One uploaded image (§3). Placements are stored separately in
/// [`crate::store::Store`], keyed by `(image_id, placement_id)`; `placement_ids`
/// here is just the insertion-ordered index used for iteration.
pub struct Image {
    pub image_id: u32,
    pub image_number: Option<u32>,
    pub query_id: Option<u32>,
    pub atime: Instant,
    pub global_index: u64,
    pub status: ImageStatus,
    pub uploading_failure: UploadingFailure,
    pub quiet: u8,
    pub format: Format,
    pub compression: Compression,
    pub pix_width: u32,
    pub pix_height: u32,
    pub expected_size: Option<u64>,
    pub disk_size: u64,
    pub disk_path: Option<PathBuf>,
    pub ram: Option<PixelBuffer>,
    pub placement_ids: Vec<u32>,
    pub default_placement: u32,
    pub initial_placement_id: u32,
}

impl Image {
    pub fn new(image_id: u32, global_index: u64, now: Instant) -> Self {
        Self {
            image_id,
            image_number: None,
            query_id: None,
            atime: now,
            global_index,
            status: ImageStatus::Uninitialized,
            uploading_failure: UploadingFailure::None,
            quiet: 0,
            format: Format::Auto,
            compression: Compression::None,
            pix_width: 0,
            pix_height: 0,
            expected_size: None,
            disk_size: 0,
            disk_path: None,
            ram: None,
            placement_ids: Vec::new(),
            default_placement: 0,
            initial_placement_id: 0,
        }
    }

    #[must_use]
    pub fn ram_size(&self) -> u64 {
        self.ram.as_ref().map_or(0, PixelBuffer::ram_size)
    }
}
