use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use irrigation_controller::config;
use irrigation_controller::controller::{Controller, Sources};
use irrigation_controller::history::sources::{Clock, SystemClock};
use irrigation_controller::state;
use irrigation_controller::transport::LogNotifier;
use irrigation_controller::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load_or_default(&config_path)?;

    if let Ok(dir) = env::var("DATA_DIR") {
        let dir = PathBuf::from(dir);
        cfg.storage.root = dir.join("lfs");
        cfg.history.dir = dir.join("history");
    }
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }
    cfg.validate()?;

    // ── Collaborators ───────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sources = build_sources(clock, cfg.aggregation.channels);

    // ── Controller ──────────────────────────────────────────────────
    let shared = state::shared();
    let controller = Controller::build(&cfg, sources, Arc::new(LogNotifier), Arc::clone(&shared)).await?;

    // ── Web server ──────────────────────────────────────────────────
    if cfg.web.enabled {
        let app = AppState {
            shared: Arc::clone(&shared),
            history: controller.history(),
        };
        let port = cfg.web.port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(app, port).await {
                error!("web: {e:#}");
            }
        });
    }

    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
}

#[cfg(feature = "sim")]
fn build_sources(clock: Arc<dyn Clock>, channels: u8) -> Sources {
    use irrigation_controller::sim::{EnvSim, RainSim, Scenario, WateringSim};

    let scenario =
        Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_else(|_| "temperate".to_string()));
    info!(%scenario, "simulated environment");
    Sources {
        env: Arc::new(EnvSim::new(scenario, Arc::clone(&clock))),
        rain: Arc::new(RainSim::new(scenario)),
        watering: Arc::new(WateringSim::new(scenario, channels)),
        clock,
    }
}

#[cfg(not(feature = "sim"))]
fn build_sources(clock: Arc<dyn Clock>, _channels: u8) -> Sources {
    use irrigation_controller::history::sources::{RainLog, StaticEnv, WateringLog};

    info!("no simulator: environment sources start empty");
    Sources {
        clock,
        env: Arc::new(StaticEnv::new(None)),
        rain: Arc::new(RainLog::new()),
        watering: Arc::new(WateringLog::new()),
    }
}
