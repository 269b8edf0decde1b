//! §4.C — the two-tier image/placement store: id generation, touch,
//! eviction (`check_limits`), and destruction.

pub mod image;
pub mod placement;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, warn};
use rand::Rng;

use crate::config::Config;
use crate::error::StoreError;

pub use image::{Compression, Format, Image, ImageStatus, UploadingFailure};
pub use placement::{Placement, ScaleMode};

/// Image ids in `0..=255` or with bits 8-23 clear collide with the
/// legacy single-byte image-id transport; the store never hands those out.
fn is_reserved_image_id(id: u32) -> bool {
    id == 0 || (id & 0xFFFF_FF00) == 0 || (id & 0x00FF_FF00) == 0
}

/// Placement ids are 24-bit; the analogous reserved shapes within that space.
fn is_reserved_placement_id(id: u32) -> bool {
    id == 0 || (id & 0x00FF_F000) == 0 || (id & 0x0000_FF00) == 0
}

pub struct Store {
    images: HashMap<u32, Image>,
    placements: HashMap<(u32, u32), Placement>,
    pub images_disk_total: u64,
    pub images_ram_total: u64,
    next_global_index: u64,
    /// The single in-progress direct-transmission upload, if any (§4.G.1, §9).
    pub current_direct_upload: Option<u32>,
    pub last_chunk_time: Option<Instant>,
    pub config: Config,
    pub cache_dir: PathBuf,
}

impl Store {
    pub fn new(config: Config, cache_dir: PathBuf) -> Self {
        Self {
            images: HashMap::new(),
            placements: HashMap::new(),
            images_disk_total: 0,
            images_ram_total: 0,
            next_global_index: 0,
            current_direct_upload: None,
            last_chunk_time: None,
            config,
            cache_dir,
        }
    }

    pub fn cached_path(&self, image_id: u32) -> PathBuf {
        self.cache_dir.join(format!("img-{image_id}"))
    }

    fn next_index(&mut self) -> u64 {
        self.next_global_index += 1;
        self.next_global_index
    }

    /// Generates a non-colliding, non-reserved 32-bit image id (§4.C).
    pub fn generate_image_id(&self) -> Result<u32, StoreError> {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let candidate: u32 = rng.gen();
            if !is_reserved_image_id(candidate) && !self.images.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(StoreError::IdExhausted)
    }

    /// Generates a non-colliding, non-reserved 24-bit placement id for `image_id`.
    pub fn generate_placement_id(&self, image_id: u32) -> Result<u32, StoreError> {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let candidate: u32 = rng.gen_range(1..=0x00FF_FFFF);
            if !is_reserved_placement_id(candidate)
                && !self.placements.contains_key(&(image_id, candidate))
            {
                return Ok(candidate);
            }
        }
        Err(StoreError::IdExhausted)
    }

    /// Creates (replacing any existing record with the same id, per the
    /// lifecycle rule in §3) a fresh `Image` and inserts it.
    pub fn create_image(&mut self, image_id: u32, now: Instant) -> &mut Image {
        if self.images.contains_key(&image_id) {
            self.delete_image(image_id);
        }
        let index = self.next_index();
        let image = Image::new(image_id, index, now);
        self.images.entry(image_id).or_insert(image)
    }

    #[must_use]
    pub fn image(&self, id: u32) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn image_mut(&mut self, id: u32) -> Option<&mut Image> {
        self.images.get_mut(&id)
    }

    /// Finds the live image carrying `number`, per §3 "most recently
    /// created wins" (highest `global_index`).
    #[must_use]
    pub fn image_by_number(&self, number: u32) -> Option<&Image> {
        self.images
            .values()
            .filter(|img| img.image_number == Some(number))
            .max_by_key(|img| img.global_index)
    }

    #[must_use]
    pub fn placement(&self, image_id: u32, placement_id: u32) -> Option<&Placement> {
        self.placements.get(&(image_id, placement_id))
    }

    pub fn placement_mut(&mut self, image_id: u32, placement_id: u32) -> Option<&mut Placement> {
        self.placements.get_mut(&(image_id, placement_id))
    }

    pub fn insert_placement(&mut self, placement: Placement) {
        let key = (placement.image_id, placement.placement_id);
        if let Some(image) = self.images.get_mut(&placement.image_id) {
            if !image.placement_ids.contains(&placement.placement_id) {
                image.placement_ids.push(placement.placement_id);
            }
            if image.default_placement == 0 {
                image.default_placement = placement.placement_id;
            }
        }
        self.placements.insert(key, placement);
    }

    pub fn touch_image(&mut self, image_id: u32, now: Instant) {
        if let Some(image) = self.images.get_mut(&image_id) {
            image.atime = now;
        }
    }

    /// Touches a placement and (invariant 6) its parent image.
    pub fn touch_placement(&mut self, image_id: u32, placement_id: u32, now: Instant) {
        if let Some(placement) = self.placements.get_mut(&(image_id, placement_id)) {
            placement.atime = now;
        }
        if let Some(image) = self.images.get_mut(&image_id) {
            if image.atime < now {
                image.atime = now;
            }
        }
    }

    /// Removes the on-disk artifact and RAM buffer, drops every placement,
    /// and erases the image record.
    pub fn delete_image(&mut self, image_id: u32) {
        let Some(image) = self.images.remove(&image_id) else {
            return;
        };
        if let Some(path) = &image.disk_path {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!("failed to remove cached image file {}: {err}", path.display());
                }
            }
        }
        self.images_disk_total = self.images_disk_total.saturating_sub(image.disk_size);
        self.images_ram_total = self.images_ram_total.saturating_sub(image.ram_size());
        for placement_id in &image.placement_ids {
            if let Some(placement) = self.placements.remove(&(image_id, *placement_id)) {
                self.images_ram_total = self.images_ram_total.saturating_sub(placement.ram_size());
            }
        }
        if self.current_direct_upload == Some(image_id) {
            self.current_direct_upload = None;
        }
    }

    /// Frees a placement's scaled buffer and erases it.
    pub fn delete_placement(&mut self, image_id: u32, placement_id: u32) {
        let Some(placement) = self.placements.remove(&(image_id, placement_id)) else {
            return;
        };
        self.images_ram_total = self.images_ram_total.saturating_sub(placement.ram_size());
        if let Some(image) = self.images.get_mut(&image_id) {
            image.placement_ids.retain(|id| *id != placement_id);
            if image.default_placement == placement_id {
                image.default_placement = image.placement_ids.first().copied().unwrap_or(0);
            }
            if image.initial_placement_id == placement_id {
                image.initial_placement_id = 0;
            }
        }
    }

    pub fn placements_of(&self, image_id: u32) -> impl Iterator<Item = &Placement> {
        self.images
            .get(&image_id)
            .into_iter()
            .flat_map(|image| image.placement_ids.iter())
            .filter_map(move |id| self.placements.get(&(image_id, *id)))
    }

    /// §4.C eviction, run after any growth in counters. Each of the five
    /// passes stops as soon as its own ceiling is satisfied.
    pub fn check_limits(&mut self) {
        self.evict_excess_images();
        self.evict_excess_placements();
        self.evict_excess_disk();
        self.evict_excess_ram_images();
        self.evict_excess_ram_placements();
    }

    fn evict_excess_images(&mut self) {
        while self.images.len() > self.config.max_total_images {
            let Some(oldest) = self
                .images
                .values()
                .min_by_key(|img| img.atime)
                .map(|img| img.image_id)
            else {
                break;
            };
            debug!("check_limits: evicting image {oldest} (too many images)");
            self.delete_image(oldest);
        }
    }

    fn evict_excess_placements(&mut self) {
        while self.placements.len() > self.config.max_total_placements {
            let Some((key, _)) = self
                .placements
                .iter()
                .filter(|(_, pl)| !pl.protected)
                .min_by_key(|(_, pl)| pl.atime)
                .map(|(key, _)| (*key, ()))
            else {
                break;
            };
            debug!("check_limits: evicting placement {key:?} (too many placements)");
            self.delete_placement(key.0, key.1);
        }
    }

    fn evict_excess_disk(&mut self) {
        let ceiling = self.config.with_tolerance(self.config.max_total_disk_size);
        while self.images_disk_total > ceiling {
            let Some(oldest) = self
                .images
                .values()
                .filter(|img| img.disk_size > 0)
                .min_by_key(|img| img.atime)
                .map(|img| img.image_id)
            else {
                break;
            };
            debug!("check_limits: unloading disk artifact for image {oldest}");
            self.unload_disk(oldest);
        }
    }

    fn unload_disk(&mut self, image_id: u32) {
        let Some(image) = self.images.get_mut(&image_id) else {
            return;
        };
        if let Some(path) = image.disk_path.take() {
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }
        self.images_disk_total = self.images_disk_total.saturating_sub(image.disk_size);
        image.disk_size = 0;
    }

    fn evict_excess_ram_images(&mut self) {
        let ceiling = self.config.with_tolerance(self.config.max_total_ram_size);
        while self.images_ram_total > ceiling {
            let Some(oldest) = self
                .images
                .values()
                .filter(|img| img.ram.is_some())
                .min_by_key(|img| img.atime)
                .map(|img| img.image_id)
            else {
                break;
            };
            debug!("check_limits: unloading RAM buffer for image {oldest}");
            self.unload_image_ram(oldest);
        }
    }

    fn unload_image_ram(&mut self, image_id: u32) {
        let Some(image) = self.images.get_mut(&image_id) else {
            return;
        };
        if let Some(buf) = image.ram.take() {
            self.images_ram_total = self.images_ram_total.saturating_sub(buf.ram_size());
        }
    }

    fn evict_excess_ram_placements(&mut self) {
        let ceiling = self.config.with_tolerance(self.config.max_total_ram_size);
        while self.images_ram_total > ceiling {
            let Some(key) = self
                .placements
                .iter()
                .filter(|(_, pl)| !pl.protected && pl.scaled.is_some())
                .min_by_key(|(_, pl)| pl.atime)
                .map(|(key, _)| *key)
            else {
                break;
            };
            debug!("check_limits: unloading scaled buffer for placement {key:?}");
            self.unload_placement_ram(key.0, key.1);
        }
    }

    fn unload_placement_ram(&mut self, image_id: u32, placement_id: u32) {
        let Some(placement) = self.placements.get_mut(&(image_id, placement_id)) else {
            return;
        };
        if let Some(buf) = placement.scaled.take() {
            self.images_ram_total = self.images_ram_total.saturating_sub(buf.ram_size());
        }
    }

    /// Drops every unprotected RAM buffer (`unload_images_to_reduce_ram`, §6).
    pub fn unload_all_ram(&mut self) {
        let image_ids: Vec<u32> = self.images.keys().copied().collect();
        for id in image_ids {
            self.unload_image_ram(id);
        }
        let placement_keys: Vec<(u32, u32)> = self
            .placements
            .iter()
            .filter(|(_, pl)| !pl.protected)
            .map(|(key, _)| *key)
            .collect();
        for (image_id, placement_id) in placement_keys {
            self.unload_placement_ram(image_id, placement_id);
        }
    }

    /// Removes every image and the cache directory itself (`deinit`, §5).
    pub fn clear_all(&mut self) {
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            self.delete_image(id);
        }
        if self.cache_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.cache_dir);
        }
    }

    /// Property 2 / §9 "audited by the state-dump routine": recomputes
    /// both totals from scratch and compares with the tracked counters.
    #[must_use]
    pub fn audit(&self) -> (u64, u64) {
        let disk: u64 = self.images.values().map(|img| img.disk_size).sum();
        let ram: u64 = self.images.values().map(Image::ram_size).sum::<u64>()
            + self.placements.values().map(Placement::ram_size).sum::<u64>();
        (disk, ram)
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn placement_count(&self) -> usize {
        self.placements.len()
    }
}

/// Creates the `mkdtemp`-style cache directory (§5, §6) from a template
/// like `st-images-XXXXXX`; the trailing `X`s are just a human hint, the
/// actual randomization is delegated to `tempfile`.
pub fn create_cache_dir(template: &str) -> std::io::Result<PathBuf> {
    let prefix = template.trim_end_matches('X');
    let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
    Ok(dir.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap().into_path();
        Store::new(Config::default(), dir)
    }

    #[test]
    fn generated_image_ids_avoid_reserved_shapes() {
        let store = test_store();
        for _ in 0..50 {
            let id = store.generate_image_id().unwrap();
            assert!(!is_reserved_image_id(id), "id {id:#x} should not be reserved");
        }
    }

    #[test]
    fn touch_placement_bumps_parent_image_atime() {
        let mut store = test_store();
        let t0 = Instant::now();
        let image = store.create_image(1, t0);
        image.status = ImageStatus::RamLoadingSuccess;
        store.insert_placement(Placement::new(1, 1, t0));

        sleep(Duration::from_millis(2));
        let t1 = Instant::now();
        store.touch_placement(1, 1, t1);

        assert_eq!(store.placement(1, 1).unwrap().atime, t1);
        assert_eq!(store.image(1).unwrap().atime, t1);
    }

    #[test]
    fn delete_image_drops_its_placements() {
        let mut store = test_store();
        let now = Instant::now();
        store.create_image(1, now);
        store.insert_placement(Placement::new(7, 1, now));
        assert!(store.placement(1, 7).is_some());

        store.delete_image(1);
        assert!(store.image(1).is_none());
        assert!(store.placement(1, 7).is_none());
    }

    #[test]
    fn evicts_oldest_unprotected_placement_first() {
        let mut store = test_store();
        store.config.max_total_placements = 1;
        let now = Instant::now();
        store.create_image(1, now);

        let mut older = Placement::new(1, 1, now);
        older.protected = false;
        store.insert_placement(older);

        sleep(Duration::from_millis(2));
        let newer_time = Instant::now();
        let mut newer = Placement::new(2, 1, newer_time);
        newer.protected = false;
        store.insert_placement(newer);

        store.check_limits();
        assert!(store.placement(1, 1).is_none());
        assert!(store.placement(1, 2).is_some());
    }

    #[test]
    fn protected_placements_survive_eviction() {
        let mut store = test_store();
        store.config.max_total_placements = 1;
        let now = Instant::now();
        store.create_image(1, now);

        let mut protected = Placement::new(1, 1, now);
        protected.protected = true;
        store.insert_placement(protected);

        sleep(Duration::from_millis(2));
        store.insert_placement(Placement::new(2, 1, Instant::now()));

        store.check_limits();
        assert!(store.placement(1, 1).is_some(), "protected placement must survive");
    }

    #[test]
    fn audit_matches_tracked_counters() {
        let mut store = test_store();
        let now = Instant::now();
        let image = store.create_image(1, now);
        image.disk_size = 123;
        store.images_disk_total = 123;

        let (disk, ram) = store.audit();
        assert_eq!(disk, 123);
        assert_eq!(ram, 0);
    }
}
