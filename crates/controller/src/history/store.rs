//! History store: the three per-granularity logs plus update metadata.
//!
//! Two back-ends share one contract. The small-KV back-end keeps every ring
//! in RAM and snapshots it into a [`KvStore`] on [`HistoryStore::save`]; the
//! flash-log back-end writes through to one [`FlashLog`] file per
//! granularity. Both keep the update stamps under [`KEY_META`].

use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bucket::{Granularity, DAY_SECS, MONTH_SECS};
use super::entry::{DailyEntry, HistoryRecord, HourlyEntry, MonthlyEntry};
use super::flash_log::FlashLog;
use super::kv::{FileKv, KvStore, KEY_DAILY, KEY_HOURLY, KEY_META, KEY_MONTHLY};
use super::ring::{EntryLog, Ring};
use crate::config::{HistoryBackend, HistoryConfig};
use crate::error::HistoryError;

pub const META_LEN: usize = 24;

/// Utilisation at which `cleanup_old_entries` starts trimming.
pub const CLEANUP_THRESHOLD_PCT: u8 = 90;
/// Utilisation each ring is trimmed towards.
pub const CLEANUP_TARGET_PCT: u8 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    pub hourly: u16,
    pub daily: u16,
    pub monthly: u16,
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            hourly: 168,
            daily: 90,
            monthly: 36,
        }
    }
}

impl From<&HistoryConfig> for Capacities {
    fn from(cfg: &HistoryConfig) -> Self {
        let cap = |v: u32| u16::try_from(v).unwrap_or(u16::MAX).max(1);
        Self {
            hourly: cap(cfg.hourly_capacity),
            daily: cap(cfg.daily_capacity),
            monthly: cap(cfg.monthly_capacity),
        }
    }
}

/// When each granularity last advanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateStamps {
    pub last_hourly: u32,
    pub last_daily: u32,
    pub last_monthly: u32,
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// One record of any granularity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "granularity", content = "record", rename_all = "lowercase")]
pub enum Record {
    Hourly(HourlyEntry),
    Daily(DailyEntry),
    Monthly(MonthlyEntry),
}

impl Record {
    pub fn timestamp(&self) -> u32 {
        match self {
            Self::Hourly(e) => e.timestamp,
            Self::Daily(e) => e.timestamp,
            Self::Monthly(e) => e.timestamp,
        }
    }
}

/// Result of a range query, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "granularity", content = "records", rename_all = "lowercase")]
pub enum RecordSet {
    Hourly(Vec<HourlyEntry>),
    Daily(Vec<DailyEntry>),
    Monthly(Vec<MonthlyEntry>),
}

impl RecordSet {
    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Hourly(_) => Granularity::Hourly,
            Self::Daily(_) => Granularity::Daily,
            Self::Monthly(_) => Granularity::Monthly,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Hourly(v) => v.len(),
            Self::Daily(v) => v.len(),
            Self::Monthly(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_size(&self) -> usize {
        record_size(self.granularity())
    }

    /// Packed records back to back.
    pub fn encode(&self) -> Vec<u8> {
        fn pack<T: HistoryRecord>(items: &[T]) -> Vec<u8> {
            let mut out = vec![0u8; items.len() * T::SIZE];
            for (chunk, item) in out.chunks_exact_mut(T::SIZE).zip(items) {
                item.encode(chunk);
            }
            out
        }
        match self {
            Self::Hourly(v) => pack(v),
            Self::Daily(v) => pack(v),
            Self::Monthly(v) => pack(v),
        }
    }
}

pub fn record_size(g: Granularity) -> usize {
    match g {
        Granularity::Hourly => HourlyEntry::SIZE,
        Granularity::Daily => DailyEntry::SIZE,
        Granularity::Monthly => MonthlyEntry::SIZE,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub hourly_count: u16,
    pub daily_count: u16,
    pub monthly_count: u16,
    pub oldest_hourly: u32,
    pub oldest_daily: u32,
    pub oldest_monthly: u32,
    pub total_bytes: u32,
    pub utilization_pct: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub corrupt: Vec<Granularity>,
    pub repaired: bool,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub utilization_before: u8,
    pub hourly_removed: u16,
    pub daily_removed: u16,
    pub monthly_removed: u16,
}

impl CleanupReport {
    pub fn total_removed(&self) -> u32 {
        u32::from(self.hourly_removed)
            + u32::from(self.daily_removed)
            + u32::from(self.monthly_removed)
    }
}

// ---------------------------------------------------------------------------
// Back-ends
// ---------------------------------------------------------------------------

enum Backend {
    Kv {
        hourly: Ring<HourlyEntry>,
        daily: Ring<DailyEntry>,
        monthly: Ring<MonthlyEntry>,
    },
    FlashLog {
        hourly: FlashLog<HourlyEntry>,
        daily: FlashLog<DailyEntry>,
        monthly: FlashLog<MonthlyEntry>,
    },
}

impl Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Kv { .. } => "kv",
            Self::FlashLog { .. } => "flash_log",
        }
    }

    fn hourly(&self) -> &dyn EntryLog<HourlyEntry> {
        match self {
            Self::Kv { hourly, .. } => hourly,
            Self::FlashLog { hourly, .. } => hourly,
        }
    }

    fn hourly_mut(&mut self) -> &mut dyn EntryLog<HourlyEntry> {
        match self {
            Self::Kv { hourly, .. } => hourly,
            Self::FlashLog { hourly, .. } => hourly,
        }
    }

    fn daily(&self) -> &dyn EntryLog<DailyEntry> {
        match self {
            Self::Kv { daily, .. } => daily,
            Self::FlashLog { daily, .. } => daily,
        }
    }

    fn daily_mut(&mut self) -> &mut dyn EntryLog<DailyEntry> {
        match self {
            Self::Kv { daily, .. } => daily,
            Self::FlashLog { daily, .. } => daily,
        }
    }

    fn monthly(&self) -> &dyn EntryLog<MonthlyEntry> {
        match self {
            Self::Kv { monthly, .. } => monthly,
            Self::FlashLog { monthly, .. } => monthly,
        }
    }

    fn monthly_mut(&mut self) -> &mut dyn EntryLog<MonthlyEntry> {
        match self {
            Self::Kv { monthly, .. } => monthly,
            Self::FlashLog { monthly, .. } => monthly,
        }
    }

    /// `(head, count, capacity)` per granularity.
    fn positions(&self, g: Granularity) -> (u16, u16, u16) {
        fn pos<T>(log: &dyn EntryLog<T>) -> (u16, u16, u16) {
            (log.head(), log.len(), log.capacity())
        }
        match g {
            Granularity::Hourly => pos(self.hourly()),
            Granularity::Daily => pos(self.daily()),
            Granularity::Monthly => pos(self.monthly()),
        }
    }

    fn clear(&mut self, g: Granularity) -> Result<(), HistoryError> {
        match g {
            Granularity::Hourly => self.hourly_mut().clear(),
            Granularity::Daily => self.daily_mut().clear(),
            Granularity::Monthly => self.monthly_mut().clear(),
        }
    }

    fn trim_oldest(&mut self, g: Granularity, n: u16) -> Result<u16, HistoryError> {
        match g {
            Granularity::Hourly => self.hourly_mut().trim_oldest(n),
            Granularity::Daily => self.daily_mut().trim_oldest(n),
            Granularity::Monthly => self.monthly_mut().trim_oldest(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata blob
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Meta {
    /// `(head, count)` for hourly, daily, monthly.
    rings: [(u16, u16); 3],
    stamps: UpdateStamps,
}

impl Meta {
    fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        for (i, (head, count)) in self.rings.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[i * 4..i * 4 + 2], *head);
            LittleEndian::write_u16(&mut buf[i * 4 + 2..i * 4 + 4], *count);
        }
        LittleEndian::write_u32(&mut buf[12..16], self.stamps.last_hourly);
        LittleEndian::write_u32(&mut buf[16..20], self.stamps.last_daily);
        LittleEndian::write_u32(&mut buf[20..24], self.stamps.last_monthly);
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != META_LEN {
            return None;
        }
        let mut rings = [(0u16, 0u16); 3];
        for (i, ring) in rings.iter_mut().enumerate() {
            *ring = (
                LittleEndian::read_u16(&buf[i * 4..i * 4 + 2]),
                LittleEndian::read_u16(&buf[i * 4 + 2..i * 4 + 4]),
            );
        }
        Some(Self {
            rings,
            stamps: UpdateStamps {
                last_hourly: LittleEndian::read_u32(&buf[12..16]),
                last_daily: LittleEndian::read_u32(&buf[16..20]),
                last_monthly: LittleEndian::read_u32(&buf[20..24]),
            },
        })
    }
}

fn load_meta(kv: &dyn KvStore) -> Result<Meta, HistoryError> {
    match kv.read(KEY_META)? {
        None => Ok(Meta::default()),
        Some(bytes) => Meta::decode(&bytes).map_or_else(
            || {
                warn!(len = bytes.len(), "history: metadata blob corrupt, starting empty");
                Ok(Meta::default())
            },
            Ok,
        ),
    }
}

fn load_ring<T: HistoryRecord>(
    kv: &dyn KvStore,
    key: u16,
    (head, count): (u16, u16),
    capacity: u16,
) -> Result<Ring<T>, HistoryError> {
    let Some(blob) = kv.read(key)? else {
        if count > 0 {
            warn!(key, count, "history: ring blob missing, starting empty");
        }
        return Ok(Ring::new(capacity));
    };
    if blob.len() != usize::from(capacity) * T::SIZE {
        warn!(
            key,
            len = blob.len(),
            expected = usize::from(capacity) * T::SIZE,
            "history: ring blob size mismatch, starting empty"
        );
        return Ok(Ring::new(capacity));
    }
    let slots = blob.chunks_exact(T::SIZE).map(T::decode).collect();
    Ok(Ring::from_slots(slots, head, count, capacity))
}

fn ring_blob<T: HistoryRecord>(ring: &Ring<T>) -> Vec<u8> {
    let mut out = vec![0u8; ring.slots().len() * T::SIZE];
    for (chunk, slot) in out.chunks_exact_mut(T::SIZE).zip(ring.slots()) {
        slot.encode(chunk);
    }
    out
}

fn collect_range<T: HistoryRecord>(
    log: &dyn EntryLog<T>,
    start: u32,
    end: u32,
    max: usize,
) -> Result<Vec<T>, HistoryError> {
    let mut out = Vec::new();
    for i in 0..log.len() {
        if out.len() >= max {
            break;
        }
        if let Some(entry) = log.get(i)? {
            if (start..=end).contains(&entry.timestamp()) {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

fn latest_of<T: HistoryRecord>(log: &dyn EntryLog<T>) -> Result<Option<T>, HistoryError> {
    match log.len() {
        0 => Ok(None),
        n => log.get(n - 1),
    }
}

fn oldest_of<T: HistoryRecord>(log: &dyn EntryLog<T>) -> Result<Option<T>, HistoryError> {
    log.get(0)
}

/// Timestamps must be bucket-aligned and non-decreasing oldest to newest.
fn ring_consistent<T: HistoryRecord>(log: &dyn EntryLog<T>) -> Result<bool, HistoryError> {
    if log.head() >= log.capacity() || log.len() > log.capacity() {
        return Ok(false);
    }
    let mut prev = 0u32;
    for i in 0..log.len() {
        let Some(entry) = log.get(i)? else {
            return Ok(false);
        };
        let ts = entry.timestamp();
        if !T::GRANULARITY.is_aligned(ts) || ts < prev {
            return Ok(false);
        }
        prev = ts;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct HistoryStore {
    backend: Backend,
    kv: Arc<dyn KvStore>,
    stamps: UpdateStamps,
    dirty: bool,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("backend", &self.backend.name())
            .field("stamps", &self.stamps)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl HistoryStore {
    pub fn open(cfg: &HistoryConfig) -> Result<Self, HistoryError> {
        let caps = Capacities::from(cfg);
        match cfg.backend {
            HistoryBackend::Kv => Self::with_kv(Arc::new(FileKv::open(&cfg.dir)?), caps),
            HistoryBackend::FlashLog => Self::with_flash_log(&cfg.dir, caps),
        }
    }

    /// RAM rings restored from, and saved to, `kv`.
    pub fn with_kv(kv: Arc<dyn KvStore>, caps: Capacities) -> Result<Self, HistoryError> {
        let meta = load_meta(kv.as_ref())?;
        let backend = Backend::Kv {
            hourly: load_ring(kv.as_ref(), KEY_HOURLY, meta.rings[0], caps.hourly)?,
            daily: load_ring(kv.as_ref(), KEY_DAILY, meta.rings[1], caps.daily)?,
            monthly: load_ring(kv.as_ref(), KEY_MONTHLY, meta.rings[2], caps.monthly)?,
        };
        Ok(Self::assemble(backend, kv, meta.stamps))
    }

    /// Write-through log files in `dir`; stamps kept in a [`FileKv`] there.
    pub fn with_flash_log(dir: &Path, caps: Capacities) -> Result<Self, HistoryError> {
        let kv: Arc<dyn KvStore> = Arc::new(FileKv::open(dir)?);
        let meta = load_meta(kv.as_ref())?;
        let backend = Backend::FlashLog {
            hourly: FlashLog::open(dir, caps.hourly)?,
            daily: FlashLog::open(dir, caps.daily)?,
            monthly: FlashLog::open(dir, caps.monthly)?,
        };
        Ok(Self::assemble(backend, kv, meta.stamps))
    }

    fn assemble(backend: Backend, kv: Arc<dyn KvStore>, stamps: UpdateStamps) -> Self {
        let store = Self {
            backend,
            kv,
            stamps,
            dirty: false,
        };
        info!(
            backend = store.backend.name(),
            hourly = store.count(Granularity::Hourly),
            daily = store.count(Granularity::Daily),
            monthly = store.count(Granularity::Monthly),
            "history: store opened"
        );
        store
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Key-value store shared with the reset logs.
    pub fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // -- Append -------------------------------------------------------------

    fn check_aligned(g: Granularity, ts: u32) -> Result<(), HistoryError> {
        if g.is_aligned(ts) {
            Ok(())
        } else {
            Err(HistoryError::InvalidParam(format!(
                "{g} timestamp {ts} is not bucket-aligned"
            )))
        }
    }

    pub fn add_hourly(&mut self, entry: HourlyEntry) -> Result<(), HistoryError> {
        Self::check_aligned(Granularity::Hourly, entry.timestamp)?;
        let ts = entry.timestamp;
        self.backend.hourly_mut().push(entry)?;
        self.stamps.last_hourly = ts;
        self.dirty = true;
        debug!(ts, "history: hourly entry added");
        Ok(())
    }

    pub fn add_daily(&mut self, entry: DailyEntry) -> Result<(), HistoryError> {
        Self::check_aligned(Granularity::Daily, entry.timestamp)?;
        let ts = entry.timestamp;
        self.backend.daily_mut().push(entry)?;
        self.dirty = true;
        debug!(ts, "history: daily entry added");
        Ok(())
    }

    pub fn add_monthly(&mut self, entry: MonthlyEntry) -> Result<(), HistoryError> {
        Self::check_aligned(Granularity::Monthly, entry.timestamp)?;
        let ts = entry.timestamp;
        self.backend.monthly_mut().push(entry)?;
        self.dirty = true;
        debug!(ts, "history: monthly entry added");
        Ok(())
    }

    // -- Queries ------------------------------------------------------------

    /// Entries with `start <= timestamp <= end`, oldest first, at most `max`.
    pub fn get_range(
        &self,
        g: Granularity,
        start: u32,
        end: u32,
        max: usize,
    ) -> Result<RecordSet, HistoryError> {
        if start > end {
            return Err(HistoryError::InvalidParam(format!(
                "range start {start} after end {end}"
            )));
        }
        Ok(match g {
            Granularity::Hourly => {
                RecordSet::Hourly(collect_range(self.backend.hourly(), start, end, max)?)
            }
            Granularity::Daily => {
                RecordSet::Daily(collect_range(self.backend.daily(), start, end, max)?)
            }
            Granularity::Monthly => {
                RecordSet::Monthly(collect_range(self.backend.monthly(), start, end, max)?)
            }
        })
    }

    pub fn hourly_range(&self, start: u32, end: u32) -> Result<Vec<HourlyEntry>, HistoryError> {
        collect_range(self.backend.hourly(), start, end, usize::MAX)
    }

    pub fn daily_range(&self, start: u32, end: u32) -> Result<Vec<DailyEntry>, HistoryError> {
        collect_range(self.backend.daily(), start, end, usize::MAX)
    }

    pub fn latest_hourly(&self) -> Result<Option<HourlyEntry>, HistoryError> {
        latest_of(self.backend.hourly())
    }

    pub fn latest_daily(&self) -> Result<Option<DailyEntry>, HistoryError> {
        latest_of(self.backend.daily())
    }

    pub fn latest_monthly(&self) -> Result<Option<MonthlyEntry>, HistoryError> {
        latest_of(self.backend.monthly())
    }

    pub fn latest(&self, g: Granularity) -> Result<Record, HistoryError> {
        let record = match g {
            Granularity::Hourly => self.latest_hourly()?.map(Record::Hourly),
            Granularity::Daily => self.latest_daily()?.map(Record::Daily),
            Granularity::Monthly => self.latest_monthly()?.map(Record::Monthly),
        };
        record.ok_or(HistoryError::Empty)
    }

    pub fn oldest(&self, g: Granularity) -> Result<Record, HistoryError> {
        let record = match g {
            Granularity::Hourly => oldest_of(self.backend.hourly())?.map(Record::Hourly),
            Granularity::Daily => oldest_of(self.backend.daily())?.map(Record::Daily),
            Granularity::Monthly => oldest_of(self.backend.monthly())?.map(Record::Monthly),
        };
        record.ok_or(HistoryError::Empty)
    }

    pub fn head(&self, g: Granularity) -> u16 {
        self.backend.positions(g).0
    }

    pub fn count(&self, g: Granularity) -> u16 {
        self.backend.positions(g).1
    }

    pub fn capacity(&self, g: Granularity) -> u16 {
        self.backend.positions(g).2
    }

    pub fn stamps(&self) -> UpdateStamps {
        self.stamps
    }

    pub fn set_last_daily_update(&mut self, t: u32) {
        self.stamps.last_daily = t;
        self.dirty = true;
    }

    pub fn set_last_monthly_update(&mut self, t: u32) {
        self.stamps.last_monthly = t;
        self.dirty = true;
    }

    /// Used over capacity across all three rings, in percent.
    pub fn utilization(&self) -> u8 {
        let (used, cap) = Granularity::ALL.iter().fold((0u32, 0u32), |(u, c), g| {
            let (_, count, capacity) = self.backend.positions(*g);
            (u + u32::from(count), c + u32::from(capacity))
        });
        if cap == 0 {
            0
        } else {
            (used * 100 / cap) as u8
        }
    }

    pub fn stats(&self) -> HistoryStats {
        let oldest = |g| self.oldest(g).map(|r| r.timestamp()).unwrap_or(0);
        let hourly_count = self.count(Granularity::Hourly);
        let daily_count = self.count(Granularity::Daily);
        let monthly_count = self.count(Granularity::Monthly);
        let total_bytes = u32::from(hourly_count) * HourlyEntry::SIZE as u32
            + u32::from(daily_count) * DailyEntry::SIZE as u32
            + u32::from(monthly_count) * MonthlyEntry::SIZE as u32;
        HistoryStats {
            hourly_count,
            daily_count,
            monthly_count,
            oldest_hourly: oldest(Granularity::Hourly),
            oldest_daily: oldest(Granularity::Daily),
            oldest_monthly: oldest(Granularity::Monthly),
            total_bytes,
            utilization_pct: self.utilization(),
        }
    }

    // -- Maintenance --------------------------------------------------------

    /// Clear all rings and stamps, and persist the empty state.
    pub fn reset_all(&mut self) -> Result<(), HistoryError> {
        for g in Granularity::ALL {
            self.backend.clear(g)?;
        }
        self.stamps = UpdateStamps::default();
        self.dirty = true;
        self.save()?;
        info!(backend = self.backend.name(), "history: all rings reset");
        Ok(())
    }

    /// Check every ring; with `repair`, clear the ones that fail.
    pub fn validate(&mut self, repair: bool) -> Result<ValidationReport, HistoryError> {
        let mut report = ValidationReport::default();
        for g in Granularity::ALL {
            let ok = match g {
                Granularity::Hourly => ring_consistent(self.backend.hourly())?,
                Granularity::Daily => ring_consistent(self.backend.daily())?,
                Granularity::Monthly => ring_consistent(self.backend.monthly())?,
            };
            if ok {
                continue;
            }
            warn!(granularity = %g, repair, "history: ring failed validation");
            report.corrupt.push(g);
            if repair {
                self.backend.clear(g)?;
                self.dirty = true;
                report.repaired = true;
            }
        }

        let s = self.stamps;
        if s.last_hourly > s.last_daily.saturating_add(DAY_SECS)
            || s.last_daily > s.last_monthly.saturating_add(MONTH_SECS)
        {
            warn!(
                last_hourly = s.last_hourly,
                last_daily = s.last_daily,
                last_monthly = s.last_monthly,
                "history: update stamps inconsistent"
            );
        }
        if report.repaired {
            self.save()?;
        }
        Ok(report)
    }

    /// Trim every ring proportionally once total utilisation reaches the
    /// cleanup threshold.
    pub fn cleanup_old_entries(&mut self) -> Result<CleanupReport, HistoryError> {
        let util = self.utilization();
        let mut report = CleanupReport {
            utilization_before: util,
            ..Default::default()
        };
        if util < CLEANUP_THRESHOLD_PCT {
            return Ok(report);
        }
        let excess = u32::from(util - CLEANUP_TARGET_PCT);
        for g in Granularity::ALL {
            let count = u32::from(self.count(g));
            let n = (count * excess / 100) as u16;
            let removed = self.backend.trim_oldest(g, n)?;
            match g {
                Granularity::Hourly => report.hourly_removed = removed,
                Granularity::Daily => report.daily_removed = removed,
                Granularity::Monthly => report.monthly_removed = removed,
            }
        }
        self.dirty = true;
        info!(
            utilization = util,
            removed = report.total_removed(),
            "history: cleanup trimmed oldest entries"
        );
        Ok(report)
    }

    /// Persist rings (KV back-end) and metadata.
    pub fn save(&mut self) -> Result<(), HistoryError> {
        if let Backend::Kv {
            hourly,
            daily,
            monthly,
        } = &self.backend
        {
            self.kv.write(KEY_HOURLY, &ring_blob(hourly))?;
            self.kv.write(KEY_DAILY, &ring_blob(daily))?;
            self.kv.write(KEY_MONTHLY, &ring_blob(monthly))?;
        }
        let pos = |g| {
            let (head, count, _) = self.backend.positions(g);
            (head, count)
        };
        let meta = Meta {
            rings: [
                pos(Granularity::Hourly),
                pos(Granularity::Daily),
                pos(Granularity::Monthly),
            ],
            stamps: self.stamps,
        };
        self.kv.write(KEY_META, &meta.encode())?;
        self.dirty = false;
        debug!(backend = self.backend.name(), "history: saved");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
