use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use ofstats_core::{QueryService, TimeSeriesStore};
use serde_json::{json, Value};
use tracing::{debug, warn};

const LOG_PREFIX: &str = "summaries-";
const LOG_SUFFIX: &str = ".jsonl";

/// Periodic writer for the store files, `latest.json` and the daily
/// summaries log under one data directory.
pub struct ExportState {
    data_dir: PathBuf,
    retention_days: u64,
    current_day: String,
    writer: BufWriter<File>,
    last_prune: Option<Instant>,
}

impl ExportState {
    pub fn new(data_dir: PathBuf, retention_days: u64) -> Result<Self> {
        fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let writer = Self::open_writer(&data_dir, &day)?;

        Ok(Self {
            data_dir,
            retention_days,
            current_day: day,
            writer,
            last_prune: None,
        })
    }

    fn open_writer(data_dir: &Path, day: &str) -> Result<BufWriter<File>> {
        let path = data_dir.join(format!("{LOG_PREFIX}{day}{LOG_SUFFIX}"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn rotate_if_needed(&mut self, ts: DateTime<Utc>) -> Result<()> {
        let day = ts.format("%Y-%m-%d").to_string();
        if day != self.current_day {
            self.writer.flush()?;
            self.writer = Self::open_writer(&self.data_dir, &day)?;
            self.current_day = day;
        }
        Ok(())
    }

    /// Persist every series, then record what the devices look like right now.
    pub fn flush(&mut self, store: &TimeSeriesStore, query: &QueryService, now: DateTime<Utc>) -> Result<usize> {
        let written = store.save(&self.data_dir)?;
        let exported = report(query, store, now);

        self.rotate_if_needed(now)?;
        serde_json::to_writer(&mut self.writer, &exported)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let latest = self.data_dir.join("latest.json");
        let tmp = self.data_dir.join("latest.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&exported)?)?;
        fs::rename(&tmp, &latest)?;

        self.maybe_prune();
        debug!(series = written, dir = %self.data_dir.display(), "store flushed");
        Ok(written)
    }

    fn maybe_prune(&mut self) {
        if self
            .last_prune
            .is_some_and(|at| at.elapsed() < Duration::from_secs(1800))
        {
            return;
        }
        self.last_prune = Some(Instant::now());

        if let Err(err) = prune_old_log_files(&self.data_dir, self.retention_days, SystemTime::now()) {
            warn!(error = %err, "pruning summaries failed");
        }
    }
}

/// Every device with its port and flow summaries, as exported and printed.
pub fn report(query: &QueryService, store: &TimeSeriesStore, now: DateTime<Utc>) -> Value {
    let devices: Vec<Value> = query
        .devices()
        .into_iter()
        .map(|device| {
            let ports = query.port_summaries(&device.id).unwrap_or_default();
            let flows = query.flow_summaries(&device.id).unwrap_or_default();
            json!({
                "device": device,
                "ports": ports,
                "flows": flows,
            })
        })
        .collect();

    json!({
        "ts": now,
        "unix_ms": now.timestamp_millis(),
        "series": store.series_count(),
        "devices": devices,
    })
}

fn log_date(path: &Path) -> Option<NaiveDate> {
    let file_name = path.file_name()?.to_str()?;
    let date_part = file_name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub(crate) fn prune_old_log_files(data_dir: &Path, retention_days: u64, now: SystemTime) -> Result<usize> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    let mut removed = 0;
    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();
        let Some(file_date) = log_date(&path) else {
            continue;
        };

        if file_date < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}
