use crate::exporter::{prune_old_log_files, ExportState};
use chrono::{TimeZone, Utc};
use ofstats_core::{
    DeviceId, DeviceRegistry, PortCounters, QueryService, RateConfig, RateEngine, RawPortStats, ReplyBody,
    SpeedResolver, SpeedUnit, StatsKey, StatsPipeline, StatsReply, StoreConfig, TimeSeriesStore,
};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

fn make_temp_dir(name: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let uniq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch")
        .as_nanos();
    path.push(format!("ofstats-tests-{name}-{uniq}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

#[test]
fn prune_removes_only_old_log_files() {
    // Arrange
    let dir = make_temp_dir("old-vs-fresh");
    let old_log = dir.join("summaries-2025-11-16.jsonl");
    let fresh_log = dir.join("summaries-2026-02-15.jsonl");
    let unrelated = dir.join("notes.txt");
    let latest = dir.join("latest.json");
    fs::write(&old_log, "old").expect("write old log");
    fs::write(&fresh_log, "fresh").expect("write fresh log");
    fs::write(&unrelated, "keep").expect("write unrelated");
    fs::write(&latest, "{}").expect("write latest");

    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 2, 15, 0, 0, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    let removed = prune_old_log_files(&dir, 90, now).expect("prune");

    // Assert
    assert_eq!(removed, 1);
    assert!(!old_log.exists(), "old log should be pruned");
    assert!(fresh_log.exists(), "fresh log should be kept");
    assert!(unrelated.exists(), "non-log file should never be pruned");
    assert!(latest.exists(), "latest snapshot should never be pruned");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn prune_keeps_boundary_day_and_undated_names() {
    // Arrange
    let dir = make_temp_dir("boundary");
    let boundary_log = dir.join("summaries-2025-11-17.jsonl");
    let undated = dir.join("summaries-latest.jsonl");
    let store_dir = dir.join("ports");
    fs::write(&boundary_log, "boundary").expect("write boundary log");
    fs::write(&undated, "undated").expect("write undated log");
    fs::create_dir_all(&store_dir).expect("create store dir");
    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 2, 15, 12, 30, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    let removed = prune_old_log_files(&dir, 90, now).expect("prune");

    // Assert
    assert_eq!(removed, 0);
    assert!(boundary_log.exists(), "log on the retention boundary is kept");
    assert!(undated.exists(), "names without a date are left alone");
    assert!(store_dir.exists(), "store directories are never touched");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn flush_writes_store_latest_and_summary_line() {
    // Arrange
    let dir = make_temp_dir("flush");
    let resolver = Arc::new(SpeedResolver::new(SpeedUnit::Gbps));
    let registry = Arc::new(DeviceRegistry::new());
    let store = Arc::new(TimeSeriesStore::new(StoreConfig::default()).expect("store"));
    let engine = RateEngine::new(Arc::clone(&resolver), RateConfig::default());
    let pipeline = StatsPipeline::new(Arc::clone(&registry), engine, Arc::clone(&store));
    let query = QueryService::new(registry, Arc::clone(&store), resolver);

    let reply = |secs: i64, rx_bytes: u64| StatsReply {
        device: DeviceId::new("s1"),
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp"),
        body: ReplyBody::Ports(vec![RawPortStats {
            port_no: 1,
            name: Some("eth1".into()),
            hw_addr: None,
            speed: Some(1_000),
            counters: PortCounters {
                rx_bytes,
                ..PortCounters::default()
            },
        }]),
    };
    pipeline.handle_reply(&reply(0, 0));
    pipeline.handle_reply(&reply(10, 500));

    let mut state = ExportState::new(dir.clone(), 30).expect("export state");
    let now = Utc::now();

    // Act
    let written = state.flush(&store, &query, now).expect("flush");

    // Assert
    assert_eq!(written, store.series_count());
    let reloaded = TimeSeriesStore::load(&dir, StoreConfig::default()).expect("reload");
    assert!(reloaded.contains(&StatsKey::port("s1", 1)));

    let latest: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.join("latest.json")).expect("read latest")).expect("json");
    assert_eq!(latest["devices"][0]["device"]["id"], "s1");
    assert_eq!(latest["devices"][0]["ports"][0]["rates"]["rx_bytes"], 50.0);

    let log = dir.join(format!("summaries-{}.jsonl", now.format("%Y-%m-%d")));
    let lines = fs::read_to_string(log).expect("read summaries");
    assert_eq!(lines.lines().count(), 1);

    let _ = fs::remove_dir_all(dir);
}
