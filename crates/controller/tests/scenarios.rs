//! End-to-end scenarios driven through the public library API.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex;

use irrigation_controller::config::{StreamConfig, TransferConfig};
use irrigation_controller::endpoints::{AttributeServer, EndpointError};
use irrigation_controller::error::PackResult;
use irrigation_controller::history::kv::MemKv;
use irrigation_controller::history::reset_log::ResetLog;
use irrigation_controller::history::sources::{
    EnvReading, ManualClock, RainLog, StaticEnv, WateringLog,
};
use irrigation_controller::history::store::Capacities;
use irrigation_controller::history::{Aggregator, EnvSample, HistoryStore};
use irrigation_controller::pack::codec::crc32;
use irrigation_controller::pack::streamer::{ListFilter, PlantStreamer};
use irrigation_controller::pack::transfer::{StartRequest, TransferError, TransferState};
use irrigation_controller::pack::{Catalog, FixedStr, InstallOutcome, PackStore, PlantRecord};
use irrigation_controller::state;
use irrigation_controller::transport::{Endpoint, LoopbackNotifier, NotifyError};
use irrigation_controller::wire::{
    decode_list_frame, decode_transfer_status, TransferCommand, STREAM_COMPLETE, STREAM_STARTING,
};

// -- Helpers ----------------------------------------------------------------

fn plant(plant_id: u16, pack_id: u16, version: u16, name: &str) -> PlantRecord {
    PlantRecord {
        plant_id,
        pack_id,
        version,
        common_name: FixedStr::new(name),
        scientific_name: FixedStr::new("Solanum lycopersicum"),
        kc_ini_x1000: 600,
        kc_dev_x1000: 900,
        kc_mid_x1000: 1150,
        kc_end_x1000: 800,
        root_depth_min_mm: 300,
        root_depth_max_mm: 700,
        stage_days_ini: 20,
        stage_days_dev: 40,
        stage_days_mid: 60,
        stage_days_end: 25,
        ..Default::default()
    }
}

fn open_store(dir: &TempDir, catalog: Catalog) -> Arc<PackStore> {
    Arc::new(
        PackStore::open(dir.path().join("lfs"), catalog)
            .unwrap()
            .with_partition_bytes(Some(1 << 20)),
    )
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn server(store: Arc<PackStore>, notifier: Arc<LoopbackNotifier>) -> AttributeServer {
    let kv = Arc::new(MemKv::new());
    let history = HistoryStore::with_kv(kv.clone(), Capacities::default()).unwrap();
    AttributeServer::new(
        store,
        notifier,
        Arc::new(Mutex::new(history)),
        Arc::new(Mutex::new(ResetLog::new(kv, 4))),
        Arc::new(ManualClock::new(1_000_000)),
        state::shared(),
        StreamConfig::default(),
        &TransferConfig::default(),
    )
}

fn herbs_payload() -> Vec<u8> {
    [
        plant(201, 7, 1, "Basil"),
        plant(202, 7, 1, "Parsley"),
        plant(203, 7, 1, "Thyme"),
    ]
    .iter()
    .flat_map(PlantRecord::to_bytes)
    .collect()
}

async fn send_chunks(server: &AttributeServer, payload: &[u8]) {
    for (i, chunk) in payload.chunks(156).enumerate() {
        let frame = TransferCommand::Data {
            offset: (i * 156) as u32,
            length: chunk.len() as u16,
            payload: chunk,
        }
        .encode();
        server.write_transfer(&frame).await.unwrap();
    }
}

// -- S1 ---------------------------------------------------------------------

#[test]
fn s1_install_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, Catalog::builtin());
    let before = store.change_counter();

    let p = plant(42, 0, 3, "Tomato");
    assert_eq!(store.install_plant(&p).unwrap(), InstallOutcome::Updated);
    assert_eq!(store.get_plant(42).unwrap(), p);
    assert_eq!(store.change_counter(), before + 1);
    assert_eq!(
        files_in(&dir.path().join("lfs/plants")),
        vec!["p_002A.bin".to_string()]
    );
    assert_eq!(store.get_stats().unwrap().plant_count, 1);
}

// -- S2 ---------------------------------------------------------------------

#[test]
fn s2_version_gating() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, Catalog::builtin());

    let p1 = plant(5000, 3, 2, "Chard");
    assert_eq!(store.install_plant(&p1).unwrap(), InstallOutcome::Updated);
    assert_eq!(store.install_plant(&p1.clone()).unwrap(), InstallOutcome::AlreadyCurrent);
    let p3 = PlantRecord { version: 3, ..p1 };
    assert_eq!(store.install_plant(&p3).unwrap(), InstallOutcome::Updated);
    assert_eq!(store.get_plant(5000).unwrap().version, 3);
}

// -- S3 ---------------------------------------------------------------------

#[tokio::test]
async fn s3_transfer_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, Catalog::take(0));
    let notifier = Arc::new(LoopbackNotifier::new());
    let server = server(Arc::clone(&store), Arc::clone(&notifier));

    let payload = herbs_payload();
    assert_eq!(payload.len(), 468);
    let start = StartRequest::for_payload(7, 1, "Herbs", &payload);
    server
        .write_transfer(&TransferCommand::Start(start).encode())
        .await
        .unwrap();
    send_chunks(&server, &payload).await;
    server
        .write_transfer(&TransferCommand::Commit.encode())
        .await
        .unwrap();

    let sent = notifier.delivered(Endpoint::Transfer);
    assert_eq!(sent.len(), 4);
    let progress: Vec<u8> = sent
        .iter()
        .map(|f| decode_transfer_status(f).unwrap().progress_pct)
        .collect();
    assert_eq!(progress, vec![33, 66, 100, 100]);
    let last = decode_transfer_status(&sent[3]).unwrap();
    assert_eq!(last.state, TransferState::Complete);

    for id in [201, 202, 203] {
        assert_eq!(store.get_plant(id).unwrap().pack_id, 7);
    }
    assert_eq!(
        files_in(&dir.path().join("lfs/packs")),
        vec!["k_0007.bin".to_string()]
    );
    assert_eq!(store.get_pack(7).unwrap().plant_ids, vec![201, 202, 203]);
}

// -- S4 ---------------------------------------------------------------------

#[tokio::test]
async fn s4_crc_failure_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, Catalog::take(0));
    let notifier = Arc::new(LoopbackNotifier::new());
    let server = server(Arc::clone(&store), Arc::clone(&notifier));

    let payload = herbs_payload();
    let mut start = StartRequest::for_payload(7, 1, "Herbs", &payload);
    assert_eq!(start.crc32, crc32(&payload));
    start.crc32 ^= 1;
    server
        .write_transfer(&TransferCommand::Start(start).encode())
        .await
        .unwrap();
    send_chunks(&server, &payload).await;

    let err = server
        .write_transfer(&TransferCommand::Commit.encode())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Transfer(TransferError::CrcMismatch { .. })
    ));
    assert_eq!(err.result_code(), PackResult::CrcMismatch);

    let status = decode_transfer_status(&server.read_transfer()).unwrap();
    assert_eq!(status.state, TransferState::Error);
    assert_eq!(status.last_error, PackResult::CrcMismatch);
    assert!(files_in(&dir.path().join("lfs/plants")).is_empty());
    assert!(files_in(&dir.path().join("lfs/packs")).is_empty());

    server
        .write_transfer(&TransferCommand::Abort.encode())
        .await
        .unwrap();
    let status = decode_transfer_status(&server.read_transfer()).unwrap();
    assert_eq!(status.state, TransferState::Idle);
    assert_eq!(status.bytes_received, 0);
}

// -- S5 ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn s5_streaming_with_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, Catalog::take(15));
    let notifier = Arc::new(LoopbackNotifier::new());
    notifier.fail_attempt(Endpoint::Plant, 2, NotifyError::BufferBusy);

    let streamer = PlantStreamer::new(store, notifier.clone(), StreamConfig::default());
    let report = streamer.start(ListFilter::All).await.unwrap();
    assert_eq!(report.builtin_sent, 15);
    assert_eq!(report.custom_sent, 0);
    assert_eq!(report.retries, 1);
    assert!(!report.errored);

    let attempts = notifier.attempts(Endpoint::Plant);
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[1].payload, attempts[2].payload);
    assert!(attempts[2].at - attempts[1].at >= std::time::Duration::from_millis(10));

    let frames: Vec<_> = notifier
        .delivered(Endpoint::Plant)
        .iter()
        .map(|f| decode_list_frame(f).unwrap())
        .collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].flags, STREAM_STARTING);
    assert_eq!(frames[0].entries.len(), 10);
    assert_eq!(frames[1].flags, STREAM_COMPLETE);
    assert_eq!(frames[1].entries.len(), 5);
    assert!(frames.iter().all(|f| f.total == 15));
}

// -- S6 ---------------------------------------------------------------------

#[test]
fn s6_hourly_aggregation_bucket() {
    let clock = Arc::new(ManualClock::new(7200));
    let env = StaticEnv::new(Some(EnvReading::from_sample(EnvSample {
        temperature_c: 22.5,
        humidity_pct: 55.0,
        pressure_hpa: 1012.0,
    })));
    let watering = WateringLog::new();
    watering.record_volume(3, 3700, 300);
    watering.record_volume(3, 5000, 200);

    let mut aggregator = Aggregator::new(
        clock,
        Arc::new(env),
        Arc::new(RainLog::new()),
        Arc::new(watering),
        8,
    );
    let mut store = HistoryStore::with_kv(Arc::new(MemKv::new()), Capacities::default()).unwrap();
    let added = aggregator.aggregate_hourly(7200, &mut store).unwrap();
    assert_eq!(added, 1);

    let entry = store.latest_hourly().unwrap().unwrap();
    assert_eq!(entry.timestamp, 3600);
    assert_eq!(entry.watering_events, 2);
    assert_eq!(entry.total_volume_ml, 500);
    assert_eq!(entry.active_channels, 0b0000_1000);
    assert!(entry.env.is_some());
}
