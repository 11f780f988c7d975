//! Versioned plant/pack store on a flash-like filesystem.
//!
//! ```text
//! <root>/
//!   counter.bin          u32 LE change counter
//!   manifest.bin         index of installed packs
//!   plants/p_XXXX.bin    one enveloped plant per file
//!   packs/k_XXXX.bin     one enveloped pack per file
//! ```
//!
//! Every operation, reads included, runs under a single mutex so listings
//! are consistent with concurrent installs and deletes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;
use sysinfo::Disks;
use tracing::{debug, info, warn};

use super::atomic;
use super::catalog::Catalog;
use super::codec::{self, Envelope};
use super::record::{
    PackRecord, PackSummary, PlantListEntry, PlantRecord, PlantSource, BUILTIN_PACK_ID,
    INVALID_ID,
};
use crate::error::{PackResult, StoreError};

const PLANTS_DIR: &str = "plants";
const PACKS_DIR: &str = "packs";
const COUNTER_FILE: &str = "counter.bin";
const MANIFEST_FILE: &str = "manifest.bin";

const PLANT_PREFIX: &str = "p_";
const PACK_PREFIX: &str = "k_";
const BLOB_SUFFIX: &str = ".bin";

pub const MANIFEST_ENTRY_SIZE: usize = 8;
const MANIFEST_KIND_PACK: u8 = 1;

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// Informational outcome of a version-gated install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    /// Written; any older version was replaced.
    Updated,
    /// The stored version is the same or newer; nothing written.
    AlreadyCurrent,
}

impl InstallOutcome {
    pub fn result_code(self) -> PackResult {
        match self {
            Self::Updated => PackResult::Updated,
            Self::AlreadyCurrent => PackResult::AlreadyCurrent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteSummary {
    pub plants_removed: usize,
    pub pack_removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StorageStatus {
    Ok = 0,
    NotMounted = 1,
    Error = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub plant_count: u16,
    /// Plants that belong to a pack.
    pub custom_plant_count: u16,
    /// Packs on flash, not counting the virtual built-in pack.
    pub pack_count: u16,
    pub builtin_count: u16,
    pub change_counter: u32,
    pub status: StorageStatus,
}

/// One row of `manifest.bin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: u16,
    pub version: u16,
    pub kind: u8,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Inner {
    change_counter: u32,
}

pub struct PackStore {
    root: PathBuf,
    catalog: Catalog,
    partition_bytes: Option<u64>,
    inner: Mutex<Inner>,
}

impl PackStore {
    /// Open (and initialise) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, catalog: Catalog) -> Result<Self, StoreError> {
        let store = Self {
            root: root.into(),
            catalog,
            partition_bytes: None,
            inner: Mutex::new(Inner { change_counter: 0 }),
        };
        store.init()?;
        Ok(store)
    }

    /// Report this capacity in stats instead of probing the mounted disk.
    pub fn with_partition_bytes(mut self, bytes: Option<u64>) -> Self {
        self.partition_bytes = bytes;
        self
    }

    /// Ensure the directory layout, sweep stale temp files and load the
    /// change counter. Safe to call repeatedly.
    pub fn init(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for dir in [self.root.clone(), self.plants_dir(), self.packs_dir()] {
            fs::create_dir_all(&dir)?;
            atomic::sweep_tmp(&dir)?;
        }
        inner.change_counter = retry_io(|| self.load_counter())?;
        info!(
            root = %self.root.display(),
            change_counter = inner.change_counter,
            builtin = self.catalog.len(),
            "store: mounted"
        );
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_ready(&self) -> bool {
        self.plants_dir().is_dir() && self.packs_dir().is_dir()
    }

    pub fn change_counter(&self) -> u32 {
        self.lock().change_counter
    }

    // -- Plants -------------------------------------------------------------

    pub fn get_plant(&self, plant_id: u16) -> Result<PlantRecord, StoreError> {
        if plant_id == INVALID_ID {
            return Err(StoreError::invalid("plant_id 0xFFFF is reserved"));
        }
        let _guard = self.lock();
        retry_io(|| self.read_plant(plant_id))
    }

    /// Version-gated install of a client-supplied plant.
    pub fn install_plant(&self, record: &PlantRecord) -> Result<InstallOutcome, StoreError> {
        self.validate_plant(record)?;
        let mut inner = self.lock();
        let outcome = self.write_plant_locked(record)?;
        if outcome == InstallOutcome::Updated {
            self.bump(&mut inner);
            info!(
                plant_id = record.plant_id,
                pack_id = record.pack_id,
                version = record.version,
                "store: plant installed"
            );
        }
        Ok(outcome)
    }

    /// Install a ROM projection without the built-in range check.
    pub(crate) fn mirror_builtin(&self, record: &PlantRecord) -> Result<InstallOutcome, StoreError> {
        let mut inner = self.lock();
        if self.plant_path(record.plant_id).exists() {
            return Ok(InstallOutcome::AlreadyCurrent);
        }
        atomic::write_record(&self.plant_path(record.plant_id), record)?;
        self.bump(&mut inner);
        Ok(InstallOutcome::Updated)
    }

    pub fn delete_plant(&self, plant_id: u16) -> Result<(), StoreError> {
        if plant_id == INVALID_ID {
            return Err(StoreError::invalid("plant_id 0xFFFF is reserved"));
        }
        let mut inner = self.lock();
        if !atomic::remove_if_exists(&self.plant_path(plant_id))? {
            return Err(StoreError::NotFound);
        }
        self.bump(&mut inner);
        info!(plant_id, "store: plant deleted");
        Ok(())
    }

    /// Up to `max` plants starting at `offset`, in ascending id order.
    pub fn list_plants(&self, offset: usize, max: usize) -> Result<Vec<PlantListEntry>, StoreError> {
        self.list_plants_where(offset, max, |_| true)
    }

    /// Like [`list_plants`](Self::list_plants), but `offset` and `max` count
    /// only entries accepted by `keep`.
    pub fn list_plants_where(
        &self,
        offset: usize,
        max: usize,
        keep: impl Fn(&PlantListEntry) -> bool,
    ) -> Result<Vec<PlantListEntry>, StoreError> {
        if max == 0 {
            return Err(StoreError::invalid("list max must be at least 1"));
        }
        let _guard = self.lock();
        let ids = retry_io(|| scan_ids(&self.plants_dir(), PLANT_PREFIX).map_err(Into::into))?;

        let mut out = Vec::with_capacity(max.min(ids.len()));
        let mut skipped = 0;
        for id in ids {
            let Some(entry) = self.list_entry(id) else {
                continue;
            };
            if !keep(&entry) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(entry);
            if out.len() == max {
                break;
            }
        }
        Ok(out)
    }

    /// Number of readable plants accepted by `keep`.
    pub fn count_plants_where(
        &self,
        keep: impl Fn(&PlantListEntry) -> bool,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock();
        let ids = retry_io(|| scan_ids(&self.plants_dir(), PLANT_PREFIX).map_err(Into::into))?;
        Ok(ids
            .into_iter()
            .filter_map(|id| self.list_entry(id))
            .filter(|e| keep(e))
            .count())
    }

    /// Number of plant files on flash (the ROM table is not counted).
    pub fn get_plant_count(&self) -> u16 {
        let _guard = self.lock();
        match scan_ids(&self.plants_dir(), PLANT_PREFIX) {
            Ok(ids) => clamp_u16(ids.len()),
            Err(e) => {
                warn!("store: plant scan failed: {e}");
                0
            }
        }
    }

    // -- Packs --------------------------------------------------------------

    pub fn get_pack(&self, pack_id: u16) -> Result<PackRecord, StoreError> {
        if pack_id == BUILTIN_PACK_ID {
            return Ok(self.catalog.pack());
        }
        if pack_id == INVALID_ID {
            return Err(StoreError::invalid("pack_id 0xFFFF is reserved"));
        }
        let _guard = self.lock();
        retry_io(|| read_blob::<PackRecord>(&self.pack_path(pack_id)))
    }

    /// Install `plants`, then write the pack file, both version-gated.
    ///
    /// Not transactional: a failing plant aborts the call but earlier plants
    /// stay installed. The pack file is written last, so its presence means
    /// every listed plant made it.
    pub fn install_pack(
        &self,
        pack: &PackRecord,
        plants: &[PlantRecord],
    ) -> Result<InstallOutcome, StoreError> {
        pack.check_bounds().map_err(StoreError::InvalidData)?;

        let mut inner = self.lock();
        let mut changed = false;
        let result = self.install_pack_locked(pack, plants, &mut changed);
        if changed {
            self.bump(&mut inner);
        }
        let pack_outcome = result?;

        info!(
            pack_id = pack.pack_id,
            version = pack.version,
            plants = plants.len(),
            outcome = ?pack_outcome,
            "store: pack installed"
        );
        Ok(if changed {
            InstallOutcome::Updated
        } else {
            InstallOutcome::AlreadyCurrent
        })
    }

    fn install_pack_locked(
        &self,
        pack: &PackRecord,
        plants: &[PlantRecord],
        changed: &mut bool,
    ) -> Result<InstallOutcome, StoreError> {
        for plant in plants {
            if plant.pack_id != pack.pack_id {
                return Err(StoreError::invalid(format!(
                    "plant {} belongs to pack {}, not {}",
                    plant.plant_id, plant.pack_id, pack.pack_id
                )));
            }
            self.validate_plant(plant)?;
            if self.write_plant_locked(plant)? == InstallOutcome::Updated {
                *changed = true;
            }
        }

        let path = self.pack_path(pack.pack_id);
        match read_blob::<PackRecord>(&path) {
            Ok(existing) if existing.version >= pack.version => {
                return Ok(InstallOutcome::AlreadyCurrent);
            }
            Err(e) if e.is_io() => return Err(e),
            _ => {}
        }
        atomic::write_record(&path, pack)?;
        *changed = true;
        self.write_manifest()?;
        Ok(InstallOutcome::Updated)
    }

    /// Remove a pack file and, optionally, every plant that belongs to it.
    pub fn delete_pack(
        &self,
        pack_id: u16,
        delete_plants: bool,
    ) -> Result<DeleteSummary, StoreError> {
        if pack_id == BUILTIN_PACK_ID || pack_id == INVALID_ID {
            return Err(StoreError::invalid(format!("pack_id {pack_id} cannot be deleted")));
        }
        let mut inner = self.lock();
        let mut summary = DeleteSummary::default();

        if delete_plants {
            for id in scan_ids(&self.plants_dir(), PLANT_PREFIX)? {
                let belongs = matches!(self.read_plant(id), Ok(p) if p.pack_id == pack_id);
                if belongs && atomic::remove_if_exists(&self.plant_path(id))? {
                    summary.plants_removed += 1;
                }
            }
        }
        summary.pack_removed = atomic::remove_if_exists(&self.pack_path(pack_id))?;

        if summary.plants_removed == 0 && !summary.pack_removed {
            return Err(StoreError::NotFound);
        }
        self.bump(&mut inner);
        self.write_manifest()?;
        info!(
            pack_id,
            plants_removed = summary.plants_removed,
            pack_removed = summary.pack_removed,
            "store: pack deleted"
        );
        Ok(summary)
    }

    /// Pack summaries with the virtual built-in pack at position 0.
    pub fn list_packs(&self, offset: usize, max: usize) -> Result<Vec<PackSummary>, StoreError> {
        let builtin = PackSummary::from(&self.catalog.pack());
        let _guard = self.lock();
        let flash = retry_io(|| scan_ids(&self.packs_dir(), PACK_PREFIX).map_err(Into::into))?
            .into_iter()
            .filter_map(|id| match read_blob::<PackRecord>(&self.pack_path(id)) {
                Ok(p) => Some(PackSummary::from(&p)),
                Err(e) => {
                    warn!(pack_id = id, "store: skipping unreadable pack: {e}");
                    None
                }
            });

        Ok(std::iter::once(builtin)
            .chain(flash)
            .skip(offset)
            .take(max)
            .collect())
    }

    /// Number of pack files on flash.
    pub fn get_pack_count(&self) -> u16 {
        let _guard = self.lock();
        match scan_ids(&self.packs_dir(), PACK_PREFIX) {
            Ok(ids) => clamp_u16(ids.len()),
            Err(e) => {
                warn!("store: pack scan failed: {e}");
                0
            }
        }
    }

    /// Decode `manifest.bin`. Missing file means no packs.
    pub fn manifest(&self) -> Result<Vec<ManifestEntry>, StoreError> {
        let _guard = self.lock();
        let bytes = match fs::read(self.root.join(MANIFEST_FILE)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 {
            return Err(StoreError::Truncated(bytes.len()));
        }
        let count = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        let body = &bytes[4..];
        if body.len() != count * MANIFEST_ENTRY_SIZE {
            return Err(StoreError::SizeMismatch {
                declared: body.len() as u32,
                expected: (count * MANIFEST_ENTRY_SIZE) as u32,
            });
        }
        Ok(body
            .chunks_exact(MANIFEST_ENTRY_SIZE)
            .map(|c| ManifestEntry {
                id: u16::from_le_bytes([c[0], c[1]]),
                version: u16::from_le_bytes([c[2], c[3]]),
                kind: c[4],
            })
            .collect())
    }

    // -- Stats & agronomy ---------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let builtin_count = self.catalog.len();
        if !self.root.is_dir() {
            return Ok(StoreStats {
                total_bytes: 0,
                used_bytes: 0,
                free_bytes: 0,
                plant_count: 0,
                custom_plant_count: 0,
                pack_count: 0,
                builtin_count,
                change_counter: self.change_counter(),
                status: StorageStatus::NotMounted,
            });
        }

        let inner = self.lock();
        let plant_ids = scan_ids(&self.plants_dir(), PLANT_PREFIX)?;
        let pack_ids = scan_ids(&self.packs_dir(), PACK_PREFIX)?;
        let custom = plant_ids
            .iter()
            .filter(|&&id| matches!(self.read_plant(id), Ok(p) if p.pack_id != BUILTIN_PACK_ID))
            .count();
        let (total_bytes, free_bytes) = self.partition_usage()?;

        Ok(StoreStats {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            free_bytes,
            plant_count: clamp_u16(plant_ids.len()),
            custom_plant_count: clamp_u16(custom),
            pack_count: clamp_u16(pack_ids.len()),
            builtin_count,
            change_counter: inner.change_counter,
            status: StorageStatus::Ok,
        })
    }

    /// Plant from flash, falling back to the ROM table for built-in ids.
    pub fn resolve_plant(&self, plant_id: u16) -> Result<PlantRecord, StoreError> {
        match self.get_plant(plant_id) {
            Err(StoreError::NotFound) => self.catalog.plant(plant_id).ok_or(StoreError::NotFound),
            other => other,
        }
    }

    /// Crop coefficient ×1000 for `plant_id`, `days` after planting.
    pub fn crop_coefficient(&self, plant_id: u16, days: u32) -> Result<u16, StoreError> {
        Ok(self.resolve_plant(plant_id)?.kc_x1000_at(days))
    }

    /// Effective root depth in mm for `plant_id`, `days` after planting.
    pub fn root_depth(&self, plant_id: u16, days: u32) -> Result<u16, StoreError> {
        Ok(self.resolve_plant(plant_id)?.root_depth_mm_at(days))
    }

    // -- Internals ----------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block every store operation until the guard drops.
    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> impl Sized + '_ {
        self.lock()
    }

    fn plants_dir(&self) -> PathBuf {
        self.root.join(PLANTS_DIR)
    }

    fn packs_dir(&self) -> PathBuf {
        self.root.join(PACKS_DIR)
    }

    fn plant_path(&self, plant_id: u16) -> PathBuf {
        self.plants_dir()
            .join(format!("{PLANT_PREFIX}{plant_id:04X}{BLOB_SUFFIX}"))
    }

    fn pack_path(&self, pack_id: u16) -> PathBuf {
        self.packs_dir()
            .join(format!("{PACK_PREFIX}{pack_id:04X}{BLOB_SUFFIX}"))
    }

    fn validate_plant(&self, record: &PlantRecord) -> Result<(), StoreError> {
        record.check_bounds().map_err(StoreError::InvalidData)?;
        if record.pack_id == BUILTIN_PACK_ID && self.catalog.contains_id(record.plant_id) {
            return Err(StoreError::invalid(format!(
                "plant_id {} is reserved for the built-in catalog",
                record.plant_id
            )));
        }
        Ok(())
    }

    fn read_plant(&self, plant_id: u16) -> Result<PlantRecord, StoreError> {
        read_blob(&self.plant_path(plant_id))
    }

    fn list_entry(&self, plant_id: u16) -> Option<PlantListEntry> {
        match self.read_plant(plant_id) {
            Ok(p) => Some(PlantListEntry {
                plant_id: p.plant_id,
                pack_id: p.pack_id,
                version: p.version,
                source: PlantSource::classify(p.plant_id, p.pack_id, self.catalog.len()),
                name: p.common_name.narrow(),
            }),
            Err(e) => {
                warn!(plant_id, "store: skipping unreadable plant: {e}");
                None
            }
        }
    }

    fn write_plant_locked(&self, record: &PlantRecord) -> Result<InstallOutcome, StoreError> {
        match self.read_plant(record.plant_id) {
            Ok(existing) if existing.version >= record.version => {
                debug!(
                    plant_id = record.plant_id,
                    stored = existing.version,
                    offered = record.version,
                    "store: plant already current"
                );
                return Ok(InstallOutcome::AlreadyCurrent);
            }
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(e) if e.is_io() => return Err(e),
            Err(e) => warn!(
                plant_id = record.plant_id,
                "store: overwriting damaged plant file: {e}"
            ),
        }
        atomic::write_record(&self.plant_path(record.plant_id), record)?;
        Ok(InstallOutcome::Updated)
    }

    /// Increment and persist the change counter. A failed persist only
    /// loses the increment across a reboot.
    fn bump(&self, inner: &mut Inner) {
        inner.change_counter = inner.change_counter.wrapping_add(1);
        let path = self.root.join(COUNTER_FILE);
        if let Err(e) = atomic::write_bytes(&path, &inner.change_counter.to_le_bytes()) {
            warn!(
                change_counter = inner.change_counter,
                "store: failed to persist change counter: {e}"
            );
        }
    }

    fn load_counter(&self) -> Result<u32, StoreError> {
        match fs::read(self.root.join(COUNTER_FILE)) {
            Ok(b) if b.len() == 4 => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            Ok(b) => {
                warn!(len = b.len(), "store: malformed counter file, starting at 0");
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_manifest(&self) -> Result<(), StoreError> {
        let packs: Vec<PackRecord> = scan_ids(&self.packs_dir(), PACK_PREFIX)?
            .into_iter()
            .filter_map(|id| read_blob::<PackRecord>(&self.pack_path(id)).ok())
            .collect();

        let mut buf = Vec::with_capacity(4 + packs.len() * MANIFEST_ENTRY_SIZE);
        buf.write_u16::<LittleEndian>(clamp_u16(packs.len()))?;
        buf.write_u16::<LittleEndian>(0)?;
        for p in &packs {
            buf.write_u16::<LittleEndian>(p.pack_id)?;
            buf.write_u16::<LittleEndian>(p.version)?;
            buf.push(MANIFEST_KIND_PACK);
            buf.extend_from_slice(&[0u8; 3]);
        }
        atomic::write_bytes(&self.root.join(MANIFEST_FILE), &buf)?;
        Ok(())
    }

    /// (total, free) bytes of the partition holding the store.
    fn partition_usage(&self) -> Result<(u64, u64), StoreError> {
        if let Some(total) = self.partition_bytes {
            let used = dir_size(&self.root)?;
            return Ok((total, total.saturating_sub(used)));
        }

        let root = self.root.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());
        match disk {
            Some(d) => Ok((d.total_space(), d.available_space())),
            None => {
                let used = dir_size(&self.root)?;
                Ok((used, 0))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run an idempotent read, retrying once on a filesystem error.
fn retry_io<T>(op: impl Fn() -> Result<T, StoreError>) -> Result<T, StoreError> {
    match op() {
        Err(e) if e.is_io() => {
            warn!("store: io error, retrying once: {e}");
            op()
        }
        other => other,
    }
}

fn read_blob<T: Envelope>(path: &Path) -> Result<T, StoreError> {
    match fs::read(path) {
        Ok(bytes) => codec::decode(&bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Ids of `<prefix>XXXX.bin` files in `dir`, ascending.
fn scan_ids(dir: &Path, prefix: &str) -> io::Result<Vec<u16>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = parse_id(name, prefix) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn parse_id(name: &str, prefix: &str) -> Option<u16> {
    let hex = name.strip_prefix(prefix)?.strip_suffix(BLOB_SUFFIX)?;
    if hex.len() != 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

fn clamp_u16(n: usize) -> u16 {
    n.min(usize::from(u16::MAX)) as u16
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::record::tests::tomato;
    use crate::pack::record::FixedStr;
    use tempfile::{tempdir, TempDir};

    fn open_store(builtin: usize) -> (TempDir, PackStore) {
        let dir = tempdir().unwrap();
        let store = PackStore::open(dir.path(), Catalog::take(builtin))
            .unwrap()
            .with_partition_bytes(Some(1 << 20));
        (dir, store)
    }

    fn pack(pack_id: u16, version: u16, ids: &[u16]) -> PackRecord {
        PackRecord {
            pack_id,
            version,
            name: FixedStr::new("Herbs"),
            plant_ids: ids.to_vec(),
        }
    }

    // -- Init ---------------------------------------------------------------

    #[test]
    fn init_creates_layout_and_sweeps_tmp() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("plants")).unwrap();
        fs::write(dir.path().join("plants/p_0001.bin.tmp"), b"partial").unwrap();

        let store = PackStore::open(dir.path(), Catalog::take(0)).unwrap();
        assert!(store.is_ready());
        assert!(!dir.path().join("plants/p_0001.bin.tmp").exists());
        assert_eq!(store.change_counter(), 0);
        store.init().unwrap();
    }

    #[test]
    fn counter_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = PackStore::open(dir.path(), Catalog::take(0)).unwrap();
            store.install_plant(&tomato(42, 0, 1)).unwrap();
            store.install_plant(&tomato(43, 0, 1)).unwrap();
            assert_eq!(store.change_counter(), 2);
        }
        let store = PackStore::open(dir.path(), Catalog::take(0)).unwrap();
        assert_eq!(store.change_counter(), 2);
    }

    // -- Plant install / get ------------------------------------------------

    #[test]
    fn install_then_get_round_trips() {
        let (dir, store) = open_store(30);
        let p = tomato(42, 0, 3);

        assert_eq!(store.install_plant(&p).unwrap(), InstallOutcome::Updated);
        assert_eq!(store.get_plant(42).unwrap(), p);
        assert_eq!(store.change_counter(), 1);
        assert!(dir.path().join("plants/p_002A.bin").exists());
    }

    #[test]
    fn version_gating() {
        let (_dir, store) = open_store(30);
        assert_eq!(
            store.install_plant(&tomato(5, 3, 2)).unwrap(),
            InstallOutcome::Updated
        );
        assert_eq!(
            store.install_plant(&tomato(5, 3, 2)).unwrap(),
            InstallOutcome::AlreadyCurrent
        );
        assert_eq!(
            store.install_plant(&tomato(5, 3, 1)).unwrap(),
            InstallOutcome::AlreadyCurrent
        );
        assert_eq!(store.change_counter(), 1);
        assert_eq!(
            store.install_plant(&tomato(5, 3, 3)).unwrap(),
            InstallOutcome::Updated
        );
        assert_eq!(store.get_plant(5).unwrap().version, 3);
        assert_eq!(store.change_counter(), 2);
    }

    #[test]
    fn reserved_id_rejected_without_write() {
        let (_dir, store) = open_store(0);
        let err = store.install_plant(&tomato(INVALID_ID, 0, 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        assert_eq!(store.get_plant_count(), 0);
        assert_eq!(store.change_counter(), 0);
        assert!(matches!(
            store.get_plant(INVALID_ID),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn standalone_plant_cannot_shadow_builtin() {
        let (_dir, store) = open_store(30);
        let err = store.install_plant(&tomato(12, 0, 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        // The same id inside a pack is fine.
        store.install_plant(&tomato(12, 9, 1)).unwrap();
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = open_store(0);
        assert!(matches!(store.get_plant(7), Err(StoreError::NotFound)));
    }

    #[test]
    fn damaged_file_reported_then_overwritten() {
        let (dir, store) = open_store(0);
        store.install_plant(&tomato(50, 0, 1)).unwrap();
        let path = dir.path().join("plants/p_0032.bin");
        let mut bytes = fs::read(&path).unwrap();
        bytes[40] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.get_plant(50),
            Err(StoreError::CrcMismatch { .. })
        ));
        assert!(store.list_plants(0, 10).unwrap().is_empty());

        assert_eq!(
            store.install_plant(&tomato(50, 0, 1)).unwrap(),
            InstallOutcome::Updated
        );
        assert_eq!(store.get_plant(50).unwrap().version, 1);
    }

    // -- Delete -------------------------------------------------------------

    #[test]
    fn delete_plant_bumps_counter() {
        let (_dir, store) = open_store(0);
        store.install_plant(&tomato(42, 0, 1)).unwrap();
        store.delete_plant(42).unwrap();
        assert_eq!(store.change_counter(), 2);
        assert!(matches!(store.delete_plant(42), Err(StoreError::NotFound)));
        assert_eq!(store.change_counter(), 2);
    }

    // -- Listing ------------------------------------------------------------

    #[test]
    fn list_is_ordered_and_paginated() {
        let (_dir, store) = open_store(0);
        for id in [300u16, 100, 200, 400] {
            store.install_plant(&tomato(id, 0, 1)).unwrap();
        }
        let first = store.list_plants(0, 2).unwrap();
        assert_eq!(
            first.iter().map(|e| e.plant_id).collect::<Vec<_>>(),
            vec![100, 200]
        );
        let rest = store.list_plants(2, 10).unwrap();
        assert_eq!(
            rest.iter().map(|e| e.plant_id).collect::<Vec<_>>(),
            vec![300, 400]
        );
        assert!(store.list_plants(4, 10).unwrap().is_empty());
        assert!(store.list_plants(0, 0).is_err());
    }

    #[test]
    fn list_entries_carry_source_and_short_name() {
        let (_dir, store) = open_store(30);
        store.install_plant(&tomato(42, 0, 1)).unwrap();
        store.install_plant(&tomato(43, 7, 1)).unwrap();

        let entries = store.list_plants(0, 10).unwrap();
        assert_eq!(entries[0].source, PlantSource::Custom);
        assert_eq!(entries[1].source, PlantSource::Pack);
        assert_eq!(entries[0].name.as_str(), "Tomato");
    }

    #[test]
    fn list_skips_foreign_and_corrupt_files() {
        let (dir, store) = open_store(0);
        store.install_plant(&tomato(42, 0, 1)).unwrap();
        fs::write(dir.path().join("plants/p_0099.bin"), b"garbage").unwrap();
        fs::write(dir.path().join("plants/readme.txt"), b"hello").unwrap();

        let entries = store.list_plants(0, 10).unwrap();
        assert_eq!(entries.len(), 1);
        // The file count still sees the corrupt blob.
        assert_eq!(store.get_plant_count(), 2);
    }

    #[test]
    fn filtered_listing_counts_only_matches() {
        let (_dir, store) = open_store(0);
        for id in 100..110u16 {
            let pack_id = if id % 2 == 0 { 7 } else { 0 };
            store.install_plant(&tomato(id, pack_id, 1)).unwrap();
        }
        let in_pack = |e: &PlantListEntry| e.pack_id == 7;
        assert_eq!(store.count_plants_where(in_pack).unwrap(), 5);
        let page = store.list_plants_where(1, 2, in_pack).unwrap();
        assert_eq!(
            page.iter().map(|e| e.plant_id).collect::<Vec<_>>(),
            vec![102, 104]
        );
    }

    // -- Packs --------------------------------------------------------------

    #[test]
    fn install_pack_writes_plants_then_pack() {
        let (dir, store) = open_store(0);
        let plants = vec![tomato(100, 7, 1), tomato(101, 7, 1)];

        let outcome = store
            .install_pack(&pack(7, 1, &[100, 101]), &plants)
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Updated);
        assert!(dir.path().join("packs/k_0007.bin").exists());
        assert_eq!(store.get_pack(7).unwrap().plant_ids, vec![100, 101]);
        assert_eq!(store.get_plant_count(), 2);
        // One bump for the whole pack.
        assert_eq!(store.change_counter(), 1);

        assert_eq!(
            store.manifest().unwrap(),
            vec![ManifestEntry {
                id: 7,
                version: 1,
                kind: MANIFEST_KIND_PACK
            }]
        );
    }

    #[test]
    fn install_pack_is_version_gated() {
        let (_dir, store) = open_store(0);
        store.install_pack(&pack(7, 2, &[]), &[]).unwrap();
        assert_eq!(
            store.install_pack(&pack(7, 2, &[]), &[]).unwrap(),
            InstallOutcome::AlreadyCurrent
        );
        assert_eq!(store.change_counter(), 1);
    }

    #[test]
    fn install_pack_keeps_earlier_plants_on_failure() {
        let (dir, store) = open_store(0);
        let mut bad = tomato(102, 7, 1);
        bad.kc_ini_x1000 = 5000;
        let plants = vec![tomato(100, 7, 1), tomato(101, 7, 1), bad];

        assert!(store
            .install_pack(&pack(7, 1, &[100, 101, 102]), &plants)
            .is_err());
        assert_eq!(store.get_plant_count(), 2);
        assert!(!dir.path().join("packs/k_0007.bin").exists());
        assert_eq!(store.change_counter(), 1);
    }

    #[test]
    fn install_pack_rejects_foreign_plants() {
        let (_dir, store) = open_store(0);
        let err = store
            .install_pack(&pack(7, 1, &[100]), &[tomato(100, 8, 1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[test]
    fn delete_pack_with_plants() {
        let (_dir, store) = open_store(0);
        store
            .install_pack(
                &pack(7, 1, &[100, 101]),
                &[tomato(100, 7, 1), tomato(101, 7, 1)],
            )
            .unwrap();
        store.install_plant(&tomato(200, 0, 1)).unwrap();

        let summary = store.delete_pack(7, true).unwrap();
        assert_eq!(
            summary,
            DeleteSummary {
                plants_removed: 2,
                pack_removed: true
            }
        );
        assert_eq!(store.get_plant_count(), 1);
        assert!(matches!(store.get_pack(7), Err(StoreError::NotFound)));
        assert!(store.manifest().unwrap().is_empty());
        assert!(matches!(store.delete_pack(7, true), Err(StoreError::NotFound)));
        assert!(store.delete_pack(0, false).is_err());
    }

    #[test]
    fn builtin_pack_is_synthesized_first() {
        let (_dir, store) = open_store(15);
        store.install_pack(&pack(3, 1, &[]), &[]).unwrap();
        store.install_pack(&pack(9, 1, &[]), &[]).unwrap();

        let all = store.list_packs(0, 10).unwrap();
        assert_eq!(
            all.iter().map(|p| p.pack_id).collect::<Vec<_>>(),
            vec![0, 3, 9]
        );
        assert_eq!(all[0].plant_count, 15);
        assert_eq!(all[0].name.as_str(), "Built-in Database");

        let tail = store.list_packs(1, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].pack_id, 3);

        let builtin = store.get_pack(0).unwrap();
        assert_eq!(builtin.version, 1);
        assert_eq!(builtin.plant_ids.len(), 15);
        assert_eq!(store.get_pack_count(), 2);
    }

    // -- Stats & agronomy ---------------------------------------------------

    #[test]
    fn stats_reflect_contents() {
        let (_dir, store) = open_store(30);
        store.install_plant(&tomato(42, 0, 1)).unwrap();
        store
            .install_pack(&pack(7, 1, &[100]), &[tomato(100, 7, 1)])
            .unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.plant_count, 2);
        assert_eq!(stats.custom_plant_count, 1);
        assert_eq!(stats.pack_count, 1);
        assert_eq!(stats.builtin_count, 30);
        assert_eq!(stats.change_counter, 2);
        assert_eq!(stats.total_bytes, 1 << 20);
        assert!(stats.used_bytes > 0);
        assert_eq!(stats.used_bytes + stats.free_bytes, stats.total_bytes);
        assert_eq!(stats.status, StorageStatus::Ok);
    }

    #[test]
    fn agronomy_falls_back_to_rom() {
        let (_dir, store) = open_store(30);
        // Not provisioned: id 1 comes from the catalog.
        assert_eq!(store.crop_coefficient(1, 0).unwrap(), 600);
        assert_eq!(store.root_depth(1, 10_000).unwrap(), 1500);

        store.install_plant(&tomato(42, 0, 1)).unwrap();
        assert_eq!(store.crop_coefficient(42, 80).unwrap(), 1150);
        assert!(matches!(
            store.crop_coefficient(99, 0),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn parse_id_accepts_only_canonical_names() {
        assert_eq!(parse_id("p_002A.bin", PLANT_PREFIX), Some(42));
        assert_eq!(parse_id("p_2A.bin", PLANT_PREFIX), None);
        assert_eq!(parse_id("k_0007.bin", PLANT_PREFIX), None);
        assert_eq!(parse_id("p_0007.bin.tmp", PLANT_PREFIX), None);
    }
}
