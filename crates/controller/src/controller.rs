//! Top-level owner: opens both stores, wires the attribute server, and runs
//! the periodic aggregation loop until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::endpoints::AttributeServer;
use crate::error::HistoryError;
use crate::history::aggregator::TickReport;
use crate::history::reset_log::ResetLog;
use crate::history::sources::{Clock, EnvSensor, RainSource, WateringHistory};
use crate::history::{Aggregator, HistoryStore};
use crate::pack::{Catalog, PackStore};
use crate::state::SharedState;
use crate::transport::Notifier;

/// How often a stalled transfer is checked for expiry.
const TRANSFER_POLL: Duration = Duration::from_secs(1);

/// External collaborators the aggregator samples.
pub struct Sources {
    pub clock: Arc<dyn Clock>,
    pub env: Arc<dyn EnvSensor>,
    pub rain: Arc<dyn RainSource>,
    pub watering: Arc<dyn WateringHistory>,
}

pub struct Controller {
    store: Arc<PackStore>,
    history: Arc<Mutex<HistoryStore>>,
    reset_log: Arc<Mutex<ResetLog>>,
    aggregator: Aggregator,
    server: Arc<AttributeServer>,
    state: SharedState,
    tick_every: Duration,
    maintain_every: u32,
    ticks: u32,
}

impl Controller {
    /// Open storage, provision the catalog mirror and check the history.
    pub async fn build(
        cfg: &Config,
        sources: Sources,
        notifier: Arc<dyn Notifier>,
        state: SharedState,
    ) -> Result<Self> {
        let store = PackStore::open(&cfg.storage.root, Catalog::builtin())
            .with_context(|| format!("failed to open pack store at {}", cfg.storage.root.display()))?
            .with_partition_bytes(cfg.storage.partition_bytes);
        let store = Arc::new(store);

        if cfg.storage.provision_on_boot {
            let ran = store
                .ensure_provisioned()
                .await
                .context("failed to provision built-in plants")?;
            if ran {
                state
                    .write()
                    .await
                    .record_store("built-in catalog provisioned".to_string());
            }
        }

        let mut history = HistoryStore::open(&cfg.history)
            .with_context(|| format!("failed to open history at {}", cfg.history.dir.display()))?;
        let report = history.validate(true).context("history validation failed")?;
        if !report.is_clean() {
            warn!(corrupt = ?report.corrupt, "controller: history rings were reset");
            state
                .write()
                .await
                .record_error(format!("history rings reset: {:?}", report.corrupt));
        }

        let channels = cfg.aggregation.channels;
        let reset_log = Arc::new(Mutex::new(ResetLog::new(history.kv(), channels)));
        let history = Arc::new(Mutex::new(history));

        let aggregator = Aggregator::new(
            Arc::clone(&sources.clock),
            sources.env,
            sources.rain,
            sources.watering,
            channels,
        );

        let server = Arc::new(AttributeServer::new(
            Arc::clone(&store),
            notifier,
            Arc::clone(&history),
            Arc::clone(&reset_log),
            sources.clock,
            Arc::clone(&state),
            cfg.stream.clone(),
            &cfg.transfer,
        ));
        server.describe();

        {
            let mut st = state.write().await;
            st.store = store.get_stats().ok();
            st.history = Some(history.lock().await.stats());
            st.record_system("controller started".to_string());
        }

        Ok(Self {
            store,
            history,
            reset_log,
            aggregator,
            server,
            state,
            tick_every: Duration::from_secs(cfg.aggregation.tick_secs),
            maintain_every: cfg.aggregation.save_every_ticks.max(1),
            ticks: 0,
        })
    }

    pub fn server(&self) -> Arc<AttributeServer> {
        Arc::clone(&self.server)
    }

    pub fn history(&self) -> Arc<Mutex<HistoryStore>> {
        Arc::clone(&self.history)
    }

    pub fn reset_log(&self) -> Arc<Mutex<ResetLog>> {
        Arc::clone(&self.reset_log)
    }

    pub fn store(&self) -> Arc<PackStore> {
        Arc::clone(&self.store)
    }

    /// One aggregation pass. An unset clock skips the pass.
    pub async fn tick(&mut self) -> Result<Option<TickReport>> {
        let mut history = self.history.lock().await;
        let report = match self.aggregator.tick(&mut history) {
            Ok(r) => r,
            Err(HistoryError::ClockUnset) => {
                debug!("controller: clock not set, skipping aggregation");
                return Ok(None);
            }
            Err(e) => return Err(e).context("aggregation tick failed"),
        };
        let stats = history.stats();
        let status = self.aggregator.status(report.now, &history)?;
        drop(history);

        self.state.write().await.record_tick(&report, stats, status);
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % self.maintain_every == 0 {
            self.maintain().await?;
        }
        Ok(Some(report))
    }

    /// Trim full rings, persist, and refresh the store snapshot.
    pub async fn maintain(&mut self) -> Result<()> {
        let mut history = self.history.lock().await;
        let cleanup = history
            .cleanup_old_entries()
            .context("history cleanup failed")?;
        history.save().context("history save failed")?;
        let stats = history.stats();
        drop(history);

        let store = Arc::clone(&self.store);
        let store_stats = match tokio::task::spawn_blocking(move || store.get_stats()).await {
            Ok(stats) => stats.ok(),
            Err(e) => {
                warn!("controller: store stats task failed: {e}");
                None
            }
        };
        let mut st = self.state.write().await;
        if cleanup.total_removed() > 0 {
            st.record_history(format!(
                "cleanup at {}%: removed {} entries",
                cleanup.utilization_before,
                cleanup.total_removed()
            ));
        }
        st.history = Some(stats);
        if store_stats.is_some() {
            st.store = store_stats;
        }
        Ok(())
    }

    /// Drive ticks and transfer expiry until `shutdown` resolves, then save.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut ticker = interval(self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transfer_poll = interval(TRANSFER_POLL);
        transfer_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(tick_secs = self.tick_every.as_secs(), "controller: running");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("controller: {e:#}");
                        self.state.write().await.record_error(format!("{e:#}"));
                    }
                }
                _ = transfer_poll.tick() => {
                    self.server.poll_transfer_timeout(Instant::now()).await;
                }
            }
        }

        self.server.cancel_stream();
        self.history
            .lock()
            .await
            .save()
            .context("final history save failed")?;
        info!("controller: stopped");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::bucket::HOUR_SECS;
    use crate::history::entry::EnvSample;
    use crate::history::sources::{
        EnvReading, ManualClock, RainLog, StaticEnv, WateringLog,
    };
    use crate::history::Granularity;
    use crate::state;
    use crate::transport::LoopbackNotifier;
    use tempfile::TempDir;

    const T0: u32 = 1_700_000_000 - 1_700_000_000 % HOUR_SECS;

    fn config(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = dir.path().join("lfs");
        cfg.storage.partition_bytes = Some(1 << 20);
        cfg.history.dir = dir.path().join("history");
        cfg.aggregation.channels = 2;
        cfg.aggregation.save_every_ticks = 2;
        cfg
    }

    fn sources(clock: Arc<ManualClock>) -> Sources {
        let env = StaticEnv::new(Some(EnvReading::from_sample(EnvSample {
            temperature_c: 21.0,
            humidity_pct: 50.0,
            pressure_hpa: 1010.0,
        })));
        Sources {
            clock,
            env: Arc::new(env),
            rain: Arc::new(RainLog::new()),
            watering: Arc::new(WateringLog::new()),
        }
    }

    async fn build(dir: &TempDir, clock: Arc<ManualClock>) -> Controller {
        Controller::build(
            &config(dir),
            sources(clock),
            Arc::new(LoopbackNotifier::new()),
            state::shared(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn build_provisions_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = build(&dir, Arc::new(ManualClock::new(T0))).await;
        let catalog_len = ctl.store().catalog().len();
        assert!(catalog_len > 0);
        assert_eq!(ctl.store().get_plant_count(), catalog_len);

        let st = ctl.state.read().await;
        assert!(st.store.is_some());
        assert!(st.events.iter().any(|e| e.detail.contains("provisioned")));
    }

    #[tokio::test]
    async fn tick_aggregates_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0 + 10));
        {
            let mut ctl = build(&dir, clock.clone()).await;
            let report = ctl.tick().await.unwrap().unwrap();
            assert_eq!(report.hourly_added, 1);
            clock.advance(HOUR_SECS);
            let report = ctl.tick().await.unwrap().unwrap();
            assert_eq!(report.hourly_added, 1);
            assert!(report.saved);
        }

        let ctl = build(&dir, clock).await;
        let history = ctl.history();
        let h = history.lock().await;
        assert_eq!(h.count(Granularity::Hourly), 2);
        assert_eq!(h.latest_hourly().unwrap().unwrap().timestamp, T0);
    }

    #[tokio::test]
    async fn unset_clock_skips_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = build(&dir, Arc::new(ManualClock::new(0))).await;
        assert!(ctl.tick().await.unwrap().is_none());
        assert_eq!(ctl.history().lock().await.count(Granularity::Hourly), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = build(&dir, Arc::new(ManualClock::new(T0 + 10))).await;
        let history = ctl.history();
        let state = Arc::clone(&ctl.state);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(ctl.run(async {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(history.lock().await.count(Granularity::Hourly), 1);
        assert!(state.read().await.aggregation.is_some());
    }
}
