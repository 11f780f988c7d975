//! Roll-up of raw samples into hourly entries, hourly into daily, daily into
//! monthly. Each stage looks only at the bucket that just closed.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::bucket::{day_bucket, hour_bucket, month_bucket, Granularity, HOUR_SECS};
use super::entry::{DailyEntry, EnvSample, EnvStats, HourlyEntry, MonthlyEntry, Stat};
use super::sources::{Clock, EnvSensor, RainSource, WateringHistory, WateringMode};
use super::store::{HistoryStore, UpdateStamps};
use crate::error::HistoryError;

// ---------------------------------------------------------------------------
// Statistics accumulator
// ---------------------------------------------------------------------------

/// Running min/max/weighted mean of one dimension. Empty until the first
/// sample, so there is no sentinel to leak into a result.
#[derive(Debug, Default, Clone, Copy)]
struct StatAcc {
    min: Option<f32>,
    max: Option<f32>,
    sum: f64,
    weight: f64,
}

impl StatAcc {
    fn add(&mut self, value: f32) {
        self.add_span(value, value, value, 1);
    }

    fn add_stat(&mut self, stat: Stat, weight: u16) {
        self.add_span(stat.min, stat.max, stat.avg, weight.max(1));
    }

    fn add_span(&mut self, min: f32, max: f32, avg: f32, weight: u16) {
        self.min = Some(self.min.map_or(min, |m| m.min(min)));
        self.max = Some(self.max.map_or(max, |m| m.max(max)));
        self.sum += f64::from(avg) * f64::from(weight);
        self.weight += f64::from(weight);
    }

    fn finish(&self) -> Option<Stat> {
        Some(Stat {
            min: self.min?,
            max: self.max?,
            avg: (self.sum / self.weight) as f32,
        })
    }
}

#[derive(Debug, Default)]
struct EnvAcc {
    temperature: StatAcc,
    humidity: StatAcc,
    pressure: StatAcc,
}

impl EnvAcc {
    fn add_sample(&mut self, s: &EnvSample) {
        self.temperature.add(s.temperature_c);
        self.humidity.add(s.humidity_pct);
        self.pressure.add(s.pressure_hpa);
    }

    fn add_stats(&mut self, stats: &EnvStats, weight: u16) {
        if let Some(t) = stats.temperature {
            self.temperature.add_stat(t, weight);
        }
        if let Some(h) = stats.humidity {
            self.humidity.add_stat(h, weight);
        }
        if let Some(p) = stats.pressure {
            self.pressure.add_stat(p, weight);
        }
    }

    fn finish(&self) -> EnvStats {
        EnvStats {
            temperature: self.temperature.finish(),
            humidity: self.humidity.finish(),
            pressure: self.pressure.finish(),
        }
    }
}

fn rain_x100(mm: f32) -> u32 {
    (f64::from(mm) * 100.0).round().clamp(0.0, f64::from(u32::MAX)) as u32
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pending {
    pub hourly: bool,
    pub daily: bool,
    pub monthly: bool,
}

impl Pending {
    pub fn any(&self) -> bool {
        self.hourly || self.daily || self.monthly
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub now: u32,
    pub hourly_added: u32,
    pub daily_added: bool,
    pub monthly_added: bool,
    pub saved: bool,
}

impl TickReport {
    pub fn added_any(&self) -> bool {
        self.hourly_added > 0 || self.daily_added || self.monthly_added
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregationStatus {
    pub stamps: UpdateStamps,
    pub pending: Pending,
    pub error_count: u32,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct Aggregator {
    clock: Arc<dyn Clock>,
    env: Arc<dyn EnvSensor>,
    rain: Arc<dyn RainSource>,
    watering: Arc<dyn WateringHistory>,
    channels: u8,
    errors: u32,
}

impl Aggregator {
    pub fn new(
        clock: Arc<dyn Clock>,
        env: Arc<dyn EnvSensor>,
        rain: Arc<dyn RainSource>,
        watering: Arc<dyn WateringHistory>,
        channels: u8,
    ) -> Self {
        Self {
            clock,
            env,
            rain,
            watering,
            channels: channels.clamp(1, 16),
            errors: 0,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn now(&self) -> u32 {
        self.clock.now_epoch_utc()
    }

    fn record_error(&mut self, stage: &str, err: &HistoryError) {
        self.errors = self.errors.saturating_add(1);
        warn!(stage, errors = self.errors, "aggregator: {err}");
    }

    /// Next hour bucket that still needs an entry, if the store has any
    /// notion of where it left off.
    fn resume_hour(store: &HistoryStore) -> Result<Option<u32>, HistoryError> {
        let last = match store.latest_hourly()? {
            Some(e) => Some(e.timestamp),
            None => Some(store.stamps().last_hourly).filter(|t| *t != 0),
        };
        Ok(last.map(|t| hour_bucket(t) + 1))
    }

    /// Emit one hourly entry for every closed hour since the latest stored
    /// entry, at most one ring's worth, and persist if anything was added.
    /// Returns the number appended.
    pub fn aggregate_hourly(
        &mut self,
        now: u32,
        store: &mut HistoryStore,
    ) -> Result<u32, HistoryError> {
        let appended = self.hourly_pass(now, store)?;
        if appended > 0 {
            if let Err(e) = store.save() {
                self.record_error("hourly save", &e);
            }
        }
        Ok(appended)
    }

    fn hourly_pass(&mut self, now: u32, store: &mut HistoryStore) -> Result<u32, HistoryError> {
        let current = hour_bucket(now);
        if current == 0 {
            return Ok(0);
        }
        let target = current - 1;
        let mut start = Self::resume_hour(store)?.unwrap_or(target);
        if start > target {
            return Ok(0);
        }
        let capacity = u32::from(store.capacity(Granularity::Hourly));
        if target - start + 1 > capacity {
            warn!(
                missed = target - start + 1,
                capacity, "aggregator: hourly gap exceeds ring, skipping oldest hours"
            );
            start = target + 1 - capacity;
        }

        let snapshot = match self.env.current() {
            Ok(reading) => reading.into_sample(),
            Err(e) => {
                debug!("aggregator: env sensor skipped: {e}");
                None
            }
        };
        let mut last_env = store.latest_hourly()?.and_then(|e| e.env);

        let mut appended = 0;
        for hour in start..=target {
            let entry = self.build_hourly(hour, snapshot.or(last_env));
            let env = entry.env;
            match store.add_hourly(entry) {
                Ok(()) => {
                    appended += 1;
                    last_env = env;
                }
                Err(e) => self.record_error("hourly", &e),
            }
        }

        if appended > 0 {
            debug!(appended, target_hour = target, "aggregator: hourly caught up");
        }
        Ok(appended)
    }

    fn build_hourly(&self, hour: u32, env: Option<EnvSample>) -> HourlyEntry {
        let start = hour * HOUR_SECS;
        let end = start + HOUR_SECS;

        let rainfall_mm_x100 = match self.rain.rainfall_for_window(start, end) {
            Ok(mm) => rain_x100(mm).min(u32::from(u16::MAX)) as u16,
            Err(e) => {
                debug!(hour, "aggregator: rainfall skipped: {e}");
                0
            }
        };

        let mut events = 0u8;
        let mut volume = 0u32;
        let mut mask = 0u16;
        for channel in 0..self.channels {
            let list = match self.watering.events_in_range(channel, start, end) {
                Ok(list) => list,
                Err(e) => {
                    debug!(hour, channel, "aggregator: watering history skipped: {e}");
                    continue;
                }
            };
            for event in list.iter().filter(|e| e.actual_value > 0) {
                events = events.saturating_add(1);
                if event.mode == WateringMode::ByVolume {
                    volume = volume.saturating_add(event.actual_value);
                }
                mask |= 1 << channel;
            }
        }

        HourlyEntry {
            timestamp: start,
            env,
            rainfall_mm_x100,
            watering_events: events,
            total_volume_ml: volume,
            active_channels: mask,
        }
    }

    /// Roll the previous day's hourly entries into one daily entry.
    pub fn aggregate_daily(
        &mut self,
        now: u32,
        store: &mut HistoryStore,
    ) -> Result<bool, HistoryError> {
        let today = day_bucket(now);
        if today <= day_bucket(store.stamps().last_daily) {
            return Ok(false);
        }
        let window_start = Granularity::Daily.bucket_start(today - 1);
        let window_end = Granularity::Daily.bucket_start(today) - 1;

        let already = store
            .latest_daily()?
            .is_some_and(|d| d.timestamp >= window_start);
        let hours = store.hourly_range(window_start, window_end)?;
        store.set_last_daily_update(now);
        if already || hours.is_empty() {
            return Ok(false);
        }

        let mut env = EnvAcc::default();
        let mut entry = DailyEntry {
            timestamp: window_start,
            ..Default::default()
        };
        for h in &hours {
            if let Some(sample) = &h.env {
                env.add_sample(sample);
                entry.sample_count += 1;
            }
            entry.rainfall_mm_x100 += u32::from(h.rainfall_mm_x100);
            entry.watering_events = entry
                .watering_events
                .saturating_add(u16::from(h.watering_events));
            entry.total_volume_ml = entry.total_volume_ml.saturating_add(h.total_volume_ml);
            entry.active_channels |= h.active_channels;
        }
        entry.stats = env.finish();

        match store.add_daily(entry) {
            Ok(()) => {
                info!(
                    day = today - 1,
                    hours = hours.len(),
                    "aggregator: daily entry emitted"
                );
                Ok(true)
            }
            Err(e) => {
                self.record_error("daily", &e);
                Ok(false)
            }
        }
    }

    /// Roll the previous month's daily entries into one monthly entry.
    pub fn aggregate_monthly(
        &mut self,
        now: u32,
        store: &mut HistoryStore,
    ) -> Result<bool, HistoryError> {
        let month = month_bucket(now);
        if month <= month_bucket(store.stamps().last_monthly) {
            return Ok(false);
        }
        let window_start = Granularity::Monthly.bucket_start(month - 1);
        let window_end = Granularity::Monthly.bucket_start(month) - 1;

        let already = store
            .latest_monthly()?
            .is_some_and(|m| m.timestamp >= window_start);
        let days = store.daily_range(window_start, window_end)?;
        store.set_last_monthly_update(now);
        if already || days.is_empty() {
            return Ok(false);
        }

        let mut env = EnvAcc::default();
        let mut entry = MonthlyEntry {
            timestamp: window_start,
            ..Default::default()
        };
        for d in &days {
            env.add_stats(&d.stats, d.sample_count);
            entry.rainfall_mm_x100 = entry.rainfall_mm_x100.saturating_add(d.rainfall_mm_x100);
            entry.watering_events += u32::from(d.watering_events);
            entry.total_volume_ml += u64::from(d.total_volume_ml);
            if d.watering_events > 0 {
                entry.days_active = entry.days_active.saturating_add(1);
            }
            entry.active_channels |= d.active_channels;
        }
        entry.stats = env.finish();

        match store.add_monthly(entry) {
            Ok(()) => {
                info!(
                    month = month - 1,
                    days = days.len(),
                    "aggregator: monthly entry emitted"
                );
                Ok(true)
            }
            Err(e) => {
                self.record_error("monthly", &e);
                Ok(false)
            }
        }
    }

    /// One periodic pass: hourly, then daily, then monthly, then persist
    /// whatever changed.
    pub fn tick(&mut self, store: &mut HistoryStore) -> Result<TickReport, HistoryError> {
        let now = self.now();
        if now == 0 {
            return Err(HistoryError::ClockUnset);
        }
        let mut report = TickReport {
            now,
            ..Default::default()
        };

        match self.hourly_pass(now, store) {
            Ok(n) => report.hourly_added = n,
            Err(e) => self.record_error("hourly", &e),
        }
        match self.aggregate_daily(now, store) {
            Ok(added) => report.daily_added = added,
            Err(e) => self.record_error("daily", &e),
        }
        match self.aggregate_monthly(now, store) {
            Ok(added) => report.monthly_added = added,
            Err(e) => self.record_error("monthly", &e),
        }

        if store.is_dirty() {
            match store.save() {
                Ok(()) => report.saved = true,
                Err(e) => self.record_error("save", &e),
            }
        }
        Ok(report)
    }

    pub fn check_aggregation_needed(
        &self,
        now: u32,
        store: &HistoryStore,
    ) -> Result<Pending, HistoryError> {
        let stamps = store.stamps();
        let current = hour_bucket(now);
        let hourly = current > 0 && Self::resume_hour(store)?.map_or(true, |next| next < current);
        Ok(Pending {
            hourly,
            daily: day_bucket(now) > day_bucket(stamps.last_daily),
            monthly: month_bucket(now) > month_bucket(stamps.last_monthly),
        })
    }

    pub fn status(&self, now: u32, store: &HistoryStore) -> Result<AggregationStatus, HistoryError> {
        Ok(AggregationStatus {
            stamps: store.stamps(),
            pending: self.check_aggregation_needed(now, store)?,
            error_count: self.errors,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::bucket::{DAY_SECS, MONTH_SECS};
    use crate::history::kv::MemKv;
    use crate::history::sources::{
        EnvReading, ManualClock, RainLog, StaticEnv, WateringEvent, WateringLog,
    };
    use crate::history::store::Capacities;

    struct Rig {
        clock: Arc<ManualClock>,
        env: Arc<StaticEnv>,
        rain: Arc<RainLog>,
        watering: Arc<WateringLog>,
        agg: Aggregator,
        store: HistoryStore,
    }

    fn env(t: f32) -> EnvSample {
        EnvSample {
            temperature_c: t,
            humidity_pct: 50.0,
            pressure_hpa: 1000.0,
        }
    }

    fn rig(caps: Capacities) -> Rig {
        let clock = Arc::new(ManualClock::new(0));
        let env_src = Arc::new(StaticEnv::new(Some(EnvReading::from_sample(env(20.0)))));
        let rain = Arc::new(RainLog::new());
        let watering = Arc::new(WateringLog::new());
        let agg = Aggregator::new(
            clock.clone(),
            env_src.clone(),
            rain.clone(),
            watering.clone(),
            8,
        );
        let store = HistoryStore::with_kv(Arc::new(MemKv::new()), caps).unwrap();
        Rig {
            clock,
            env: env_src,
            rain,
            watering,
            agg,
            store,
        }
    }

    fn hourly_at(ts: u32, temp: Option<f32>, events: u8, ml: u32) -> HourlyEntry {
        HourlyEntry {
            timestamp: ts,
            env: temp.map(env),
            rainfall_mm_x100: 10,
            watering_events: events,
            total_volume_ml: ml,
            active_channels: if events > 0 { 1 } else { 0 },
        }
    }

    // -- Hourly -------------------------------------------------------------

    #[test]
    fn hourly_entry_from_watering_events() {
        let mut r = rig(Capacities::default());
        r.watering.record_volume(3, 3700, 300);
        r.watering.record_volume(3, 5000, 200);
        r.rain.record(4000, 1.25);

        let added = r.agg.aggregate_hourly(7200, &mut r.store).unwrap();
        assert_eq!(added, 1);
        let entry = r.store.latest_hourly().unwrap().unwrap();
        assert_eq!(entry.timestamp, 3600);
        assert_eq!(entry.watering_events, 2);
        assert_eq!(entry.total_volume_ml, 500);
        assert_eq!(entry.active_channels, 0b0000_1000);
        assert_eq!(entry.rainfall_mm_x100, 125);
        assert_eq!(entry.env, Some(env(20.0)));

        // same hour again is a no-op
        assert_eq!(r.agg.aggregate_hourly(7250, &mut r.store).unwrap(), 0);
    }

    #[test]
    fn duration_events_count_without_volume() {
        let mut r = rig(Capacities::default());
        r.watering.record(
            1,
            WateringEvent {
                timestamp: 3600,
                actual_value: 90,
                mode: WateringMode::ByDuration,
            },
        );
        r.watering.record_volume(2, 3601, 0);
        r.agg.aggregate_hourly(7200, &mut r.store).unwrap();
        let entry = r.store.latest_hourly().unwrap().unwrap();
        assert_eq!(entry.watering_events, 1);
        assert_eq!(entry.total_volume_ml, 0);
        assert_eq!(entry.active_channels, 0b10);
    }

    #[test]
    fn hour_zero_emits_nothing() {
        let mut r = rig(Capacities::default());
        assert_eq!(r.agg.aggregate_hourly(3599, &mut r.store).unwrap(), 0);
        assert_eq!(r.store.count(Granularity::Hourly), 0);
    }

    #[test]
    fn catch_up_fills_gap_and_reuses_last_env() {
        let mut r = rig(Capacities::default());
        r.agg.aggregate_hourly(2 * 3600, &mut r.store).unwrap();
        r.env.set(None);
        let added = r.agg.aggregate_hourly(5 * 3600 + 10, &mut r.store).unwrap();
        assert_eq!(added, 3);
        let all = r.store.hourly_range(0, u32::MAX).unwrap();
        let ts: Vec<u32> = all.iter().map(|e| e.timestamp).collect();
        assert_eq!(ts, vec![3600, 2 * 3600, 3 * 3600, 4 * 3600]);
        assert!(all.iter().all(|e| e.env == Some(env(20.0))));
    }

    #[test]
    fn catch_up_is_capped_at_ring_capacity() {
        let mut r = rig(Capacities {
            hourly: 5,
            ..Default::default()
        });
        r.agg.aggregate_hourly(2 * 3600, &mut r.store).unwrap();
        let added = r.agg.aggregate_hourly(100 * 3600, &mut r.store).unwrap();
        assert_eq!(added, 5);
        assert_eq!(r.store.oldest(Granularity::Hourly).unwrap().timestamp(), 95 * 3600);
    }

    #[test]
    fn missing_env_is_marked_invalid() {
        let mut r = rig(Capacities::default());
        r.env.set(None);
        r.agg.aggregate_hourly(7200, &mut r.store).unwrap();
        assert_eq!(r.store.latest_hourly().unwrap().unwrap().env, None);
        assert_eq!(r.agg.error_count(), 0);
    }

    // -- Daily and monthly --------------------------------------------------

    #[test]
    fn daily_rolls_up_previous_day() {
        let mut r = rig(Capacities::default());
        r.store.add_hourly(hourly_at(DAY_SECS, Some(10.0), 1, 100)).unwrap();
        r.store.add_hourly(hourly_at(DAY_SECS + 3600, None, 0, 0)).unwrap();
        r.store.add_hourly(hourly_at(DAY_SECS + 7200, Some(30.0), 2, 50)).unwrap();
        // next day's hour must not leak in
        r.store.add_hourly(hourly_at(2 * DAY_SECS, Some(99.0), 9, 9)).unwrap();
        r.store.set_last_daily_update(DAY_SECS + 10);

        let now = 2 * DAY_SECS + 60;
        assert!(r.agg.aggregate_daily(now, &mut r.store).unwrap());
        let d = r.store.latest_daily().unwrap().unwrap();
        assert_eq!(d.timestamp, DAY_SECS);
        assert_eq!(d.sample_count, 2);
        assert_eq!(d.watering_events, 3);
        assert_eq!(d.total_volume_ml, 150);
        assert_eq!(d.rainfall_mm_x100, 30);
        assert_eq!(d.active_channels, 1);
        let t = d.stats.temperature.unwrap();
        assert_eq!((t.min, t.max, t.avg), (10.0, 30.0, 20.0));
        assert_eq!(r.store.stamps().last_daily, now);

        // second call within the same day does nothing
        assert!(!r.agg.aggregate_daily(now + 60, &mut r.store).unwrap());
        assert_eq!(r.store.count(Granularity::Daily), 1);
    }

    #[test]
    fn empty_day_advances_stamp_without_entry() {
        let mut r = rig(Capacities::default());
        let now = 3 * DAY_SECS;
        assert!(!r.agg.aggregate_daily(now, &mut r.store).unwrap());
        assert_eq!(r.store.count(Granularity::Daily), 0);
        assert_eq!(r.store.stamps().last_daily, now);
    }

    #[test]
    fn daily_without_env_has_no_stats() {
        let mut r = rig(Capacities::default());
        r.store.add_hourly(hourly_at(DAY_SECS, None, 1, 10)).unwrap();
        assert!(r.agg.aggregate_daily(2 * DAY_SECS, &mut r.store).unwrap());
        let d = r.store.latest_daily().unwrap().unwrap();
        assert!(d.stats.is_empty());
        assert_eq!(d.sample_count, 0);
    }

    #[test]
    fn monthly_weights_daily_averages() {
        let mut r = rig(Capacities::default());
        let day = |n: u32, temp: f32, samples: u16, events: u16| DailyEntry {
            timestamp: MONTH_SECS + n * DAY_SECS,
            stats: EnvStats {
                temperature: Some(Stat {
                    min: temp - 5.0,
                    max: temp + 5.0,
                    avg: temp,
                }),
                ..Default::default()
            },
            rainfall_mm_x100: 100,
            watering_events: events,
            total_volume_ml: 1000,
            sample_count: samples,
            active_channels: 0b100,
        };
        r.store.add_daily(day(0, 10.0, 3, 0)).unwrap();
        r.store.add_daily(day(1, 30.0, 1, 4)).unwrap();
        r.store.add_daily(day(2, 20.0, 0, 1)).unwrap();

        let now = 2 * MONTH_SECS + 5;
        assert!(r.agg.aggregate_monthly(now, &mut r.store).unwrap());
        let m = r.store.latest_monthly().unwrap().unwrap();
        assert_eq!(m.timestamp, MONTH_SECS);
        assert_eq!(m.days_active, 2);
        assert_eq!(m.watering_events, 5);
        assert_eq!(m.total_volume_ml, 3000);
        assert_eq!(m.rainfall_mm_x100, 300);
        let t = m.stats.temperature.unwrap();
        assert_eq!((t.min, t.max), (5.0, 35.0));
        // (10*3 + 30*1 + 20*1) / 5
        assert_eq!(t.avg, 16.0);
        assert!(m.stats.humidity.is_none());
    }

    // -- Tick and status ----------------------------------------------------

    #[test]
    fn tick_requires_clock() {
        let mut r = rig(Capacities::default());
        assert!(matches!(
            r.agg.tick(&mut r.store),
            Err(HistoryError::ClockUnset)
        ));
    }

    #[test]
    fn tick_runs_all_stages_and_saves() {
        let mut r = rig(Capacities::default());
        r.clock.set(DAY_SECS - 1);
        let first = r.agg.tick(&mut r.store).unwrap();
        assert_eq!(first.hourly_added, 1);
        assert!(first.saved);

        r.watering.record_volume(0, DAY_SECS - 600, 40);
        r.clock.set(DAY_SECS + 30);
        let report = r.agg.tick(&mut r.store).unwrap();
        assert_eq!(report.hourly_added, 1);
        assert!(report.daily_added);
        assert!(!report.monthly_added);
        assert!(!r.store.is_dirty());

        let d = r.store.latest_daily().unwrap().unwrap();
        assert_eq!(d.timestamp, 0);
        assert_eq!(d.total_volume_ml, 40);
        assert_eq!(d.sample_count, 2);
    }

    #[test]
    fn pending_flags_follow_stamps() {
        let mut r = rig(Capacities::default());
        let pending = r.agg.check_aggregation_needed(7200, &r.store).unwrap();
        assert!(pending.hourly);
        assert!(!pending.daily);

        r.agg.aggregate_hourly(7200, &mut r.store).unwrap();
        let pending = r.agg.check_aggregation_needed(7300, &r.store).unwrap();
        assert!(!pending.any());

        let status = r.agg.status(DAY_SECS, &r.store).unwrap();
        assert!(status.pending.hourly);
        assert!(status.pending.daily);
        assert_eq!(status.stamps.last_hourly, 3600);
        assert_eq!(status.error_count, 0);
    }
}
