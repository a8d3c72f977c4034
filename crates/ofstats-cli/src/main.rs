use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ofstats_core::{
    ChannelTransport, DeviceId, DeviceRegistry, Metric, PollingScheduler, QueryService, RangeRequest, RangeResult,
    RateConfig, RateEngine, ResetPolicy, SchedulerConfig, SpeedResolver, SpeedUnit, StatsConfig, StatsKey,
    StatsPipeline, StoreConfig, TierConfig, TimeSeriesStore,
};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::exporter::ExportState;
use crate::fabric::{FabricLayout, SimulatedFabric};
use crate::overrides::OverrideWatcher;

mod exporter;
mod fabric;
mod overrides;
mod viewer;
#[cfg(test)]
mod exporter_tests;

#[derive(Debug, Parser)]
#[command(name = "ofstatsd")]
#[command(about = "Per-switch port and flow statistics collector")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    #[arg(long, default_value = "./data/ofstats")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 10_000)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    reply_timeout_ms: u64,

    #[arg(long, default_value_t = 300)]
    retire_after_secs: u64,

    /// Storage tier as spacing:capacity[:avg|max]; repeat from finest to coarsest.
    #[arg(long = "tier")]
    tiers: Vec<TierConfig>,

    #[arg(long, value_enum, default_value = "gbps")]
    speed_unit: UnitArg,

    #[arg(long, value_enum, default_value = "assume-zero")]
    reset_policy: ResetArg,

    /// JSON speed override document, re-read when it changes.
    #[arg(long)]
    overrides: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run {
        #[command(flatten)]
        fabric: FabricArgs,
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
        #[arg(long, default_value_t = 10)]
        print_secs: u64,
        #[arg(long, default_value_t = 60)]
        flush_secs: u64,
        #[arg(long, default_value_t = 30)]
        retention_days: u64,
        /// Disconnect the last simulated switch after this many seconds.
        #[arg(long)]
        disconnect_after_secs: Option<u64>,
    },
    View {
        #[command(flatten)]
        fabric: FabricArgs,
        /// Defaults to the first simulated switch.
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 1)]
        port: u32,
        #[arg(long, default_value_t = 180.0)]
        window_sec: f64,
    },
    Query {
        #[command(flatten)]
        target: Target,
        metric: Metric,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Window ending at --to (or now) when --from is not given.
        #[arg(long, default_value_t = 3600)]
        last_secs: u64,
        #[arg(long, conflicts_with = "points")]
        resolution_secs: Option<u64>,
        #[arg(long)]
        points: Option<u32>,
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Instant {
        #[command(flatten)]
        target: Target,
        metric: Metric,
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Ports {
        device: String,
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Flows {
        device: String,
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Devices {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    CheckOverrides {
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, Args)]
struct FabricArgs {
    #[arg(long, default_value_t = 2)]
    devices: usize,
    #[arg(long, default_value_t = 4)]
    ports: u32,
    #[arg(long, default_value_t = 4)]
    flows: usize,
    /// Zero a switch's counters every N polls.
    #[arg(long)]
    restart_every: Option<u64>,
}

#[derive(Debug, Args)]
struct Target {
    device: String,
    #[arg(long, conflicts_with = "flow", required_unless_present = "flow")]
    port: Option<u32>,
    #[arg(long)]
    flow: Option<String>,
}

impl Target {
    fn key(&self) -> Result<StatsKey> {
        match (self.port, &self.flow) {
            (Some(port), _) => Ok(StatsKey::port(self.device.as_str(), port)),
            (None, Some(flow)) => Ok(StatsKey::flow(self.device.as_str(), flow.as_str())),
            (None, None) => bail!("one of --port or --flow is required"),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UnitArg {
    Gbps,
    Mbps,
    Bps,
    BytesPerSec,
}

impl From<UnitArg> for SpeedUnit {
    fn from(value: UnitArg) -> Self {
        match value {
            UnitArg::Gbps => SpeedUnit::Gbps,
            UnitArg::Mbps => SpeedUnit::Mbps,
            UnitArg::Bps => SpeedUnit::Bps,
            UnitArg::BytesPerSec => SpeedUnit::BytesPerSec,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResetArg {
    AssumeZero,
    Discard,
}

impl From<ResetArg> for ResetPolicy {
    fn from(value: ResetArg) -> Self {
        match value {
            ResetArg::AssumeZero => ResetPolicy::AssumeZero,
            ResetArg::Discard => ResetPolicy::Discard,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let global = &cli.global;
    let config = stats_config(global)?;

    match cli.command {
        Command::Run {
            fabric,
            format,
            print_secs,
            flush_secs,
            retention_days,
            disconnect_after_secs,
        } => {
            let collector = Collector::start(global, config, fabric)?;
            let mut export = ExportState::new(global.data_dir.clone(), retention_days)?;
            let settings = RunSettings {
                format,
                print_every: Duration::from_secs(print_secs.max(1)),
                flush_every: Duration::from_secs(flush_secs.max(1)),
                disconnect_after: disconnect_after_secs.map(Duration::from_secs),
            };
            let result = run_collector(&collector, &mut export, settings).await;
            collector.stop();
            export.flush(&collector.store, &collector.query, Utc::now())?;
            result?;
        }
        Command::View {
            fabric,
            device,
            port,
            window_sec,
        } => {
            let device = device.map(DeviceId::new).unwrap_or_else(|| crate::fabric::dpid(0));
            let collector = Collector::start(global, config, fabric)?;
            let result = viewer::run_viewer(&collector.query, StatsKey::port(device, port), window_sec).await;
            collector.stop();
            result?;
        }
        Command::Query {
            target,
            metric,
            from,
            to,
            last_secs,
            resolution_secs,
            points,
            format,
        } => {
            let query = offline_query(global, config)?;
            let to = to.unwrap_or_else(Utc::now);
            let from = from.unwrap_or_else(|| to - chrono::Duration::seconds(last_secs as i64));
            let mut request = RangeRequest::new(from, to);
            if let Some(secs) = resolution_secs {
                request = request.resolution(Duration::from_secs(secs));
            }
            if let Some(points) = points {
                request = request.with_points(points);
            }
            let result = query.get_range(&target.key()?, metric, request)?;
            print_range(&result, format)?;
        }
        Command::Instant { target, metric, format } => {
            let query = offline_query(global, config)?;
            let key = target.key()?;
            match query.get_instant(&key, metric)? {
                Some(value) => match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
                    OutputFormat::Ndjson => println!("{}", serde_json::to_string(&value)?),
                    OutputFormat::Human => println!(
                        "{} {} {} = {} (interval {:.1}s{})",
                        value.timestamp.to_rfc3339(),
                        key,
                        metric,
                        format_value(metric, value.value),
                        value.interval_secs,
                        if value.reset { ", after counter reset" } else { "" }
                    ),
                },
                None => println!("{key} {metric}: no sample yet"),
            }
        }
        Command::Ports { device, format } => {
            let query = offline_query(global, config)?;
            let ports = query.port_summaries(&DeviceId::new(device))?;
            match format {
                OutputFormat::Human => {
                    for port in &ports {
                        print_port_line(port);
                    }
                }
                _ => print_json(&ports, format)?,
            }
        }
        Command::Flows { device, format } => {
            let query = offline_query(global, config)?;
            let flows = query.flow_summaries(&DeviceId::new(device))?;
            match format {
                OutputFormat::Human => {
                    for flow in &flows {
                        print_flow_line(flow);
                    }
                }
                _ => print_json(&flows, format)?,
            }
        }
        Command::Devices { format } => {
            let query = offline_query(global, config)?;
            let devices = query.devices();
            match format {
                OutputFormat::Human => {
                    for device in &devices {
                        println!(
                            "{:<24} {:<14} ports={} flows={}",
                            device.id,
                            device.state.map_or("stored", |state| state.as_str()),
                            device.ports,
                            device.flows
                        );
                    }
                }
                _ => print_json(&devices, format)?,
            }
        }
        Command::CheckOverrides { file } => {
            let tree = overrides::read_tree(&file, config.speed_unit)?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
    }

    Ok(())
}

fn stats_config(cli: &GlobalArgs) -> Result<StatsConfig> {
    let store = if cli.tiers.is_empty() {
        StoreConfig::default()
    } else {
        StoreConfig::new(cli.tiers.clone())?
    };

    Ok(StatsConfig {
        scheduler: SchedulerConfig {
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            reply_timeout: Duration::from_millis(cli.reply_timeout_ms),
            retire_after: Duration::from_secs(cli.retire_after_secs),
            ..SchedulerConfig::default()
        },
        store,
        rate: RateConfig {
            reset_policy: cli.reset_policy.into(),
        },
        speed_unit: cli.speed_unit.into(),
    })
}

fn resolver(cli: &GlobalArgs, unit: SpeedUnit) -> Result<Arc<SpeedResolver>> {
    let resolver = match &cli.overrides {
        Some(path) => SpeedResolver::with_tree(overrides::read_tree(path, unit)?, unit),
        None => SpeedResolver::new(unit),
    };
    Ok(Arc::new(resolver))
}

/// Query service over the persisted store, with nothing connected.
fn offline_query(cli: &GlobalArgs, config: StatsConfig) -> Result<QueryService> {
    let resolver = resolver(cli, config.speed_unit)?;
    let store = Arc::new(TimeSeriesStore::load(&cli.data_dir, config.store)?);
    Ok(QueryService::new(Arc::new(DeviceRegistry::new()), store, resolver))
}

struct Collector {
    scheduler: Arc<PollingScheduler<ChannelTransport>>,
    query: QueryService,
    store: Arc<TimeSeriesStore>,
    devices: Vec<DeviceId>,
    tasks: Vec<JoinHandle<()>>,
}

impl Collector {
    /// Resume the persisted store, connect every simulated switch and start polling.
    fn start(cli: &GlobalArgs, config: StatsConfig, layout: FabricArgs) -> Result<Self> {
        let resolver = resolver(cli, config.speed_unit)?;
        let store = Arc::new(TimeSeriesStore::load(&cli.data_dir, config.store)?);
        let registry = Arc::new(DeviceRegistry::new());
        let engine = RateEngine::new(Arc::clone(&resolver), config.rate);
        let pipeline = Arc::new(StatsPipeline::new(Arc::clone(&registry), engine, Arc::clone(&store)));

        let (transport, requests) = ChannelTransport::new();
        let scheduler = Arc::new(PollingScheduler::new(config.scheduler, Arc::new(transport), pipeline));

        let fabric = SimulatedFabric::new(
            FabricLayout {
                devices: layout.devices,
                ports: layout.ports,
                flows: layout.flows,
                restart_every: layout.restart_every,
            },
            Utc::now(),
        );
        let devices = fabric.device_ids();
        let mut tasks = vec![tokio::spawn(crate::fabric::serve(fabric, requests, Arc::clone(&scheduler)))];
        if let Some(path) = &cli.overrides {
            let watcher = OverrideWatcher::new(path.clone(), Arc::clone(&resolver));
            tasks.push(tokio::spawn(overrides::watch(watcher, Duration::from_secs(2))));
        }

        for id in &devices {
            scheduler.on_device_connected(id.clone());
        }
        info!(devices = devices.len(), series = store.series_count(), "collector started");

        Ok(Self {
            query: QueryService::new(registry, Arc::clone(&store), resolver),
            scheduler,
            store,
            devices,
            tasks,
        })
    }

    fn stop(&self) {
        self.scheduler.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct RunSettings {
    format: OutputFormat,
    print_every: Duration,
    flush_every: Duration,
    disconnect_after: Option<Duration>,
}

async fn run_collector(collector: &Collector, export: &mut ExportState, settings: RunSettings) -> Result<()> {
    let mut print_tick = interval_at(Instant::now() + settings.print_every, settings.print_every);
    let mut flush_tick = interval_at(Instant::now() + settings.flush_every, settings.flush_every);
    let mut sweep_tick = interval(Duration::from_secs(30));
    let disconnect = async {
        match settings.disconnect_after {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(disconnect);
    let mut disconnected = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = print_tick.tick() => {
                print_report(&collector.query, &collector.store, settings.format)?;
            }
            _ = flush_tick.tick() => {
                match export.flush(&collector.store, &collector.query, Utc::now()) {
                    Ok(series) => info!(series, "flushed"),
                    Err(err) => warn!(error = %format!("{err:#}"), "flush failed"),
                }
            }
            _ = sweep_tick.tick() => {
                collector.scheduler.retire_expired(Utc::now());
            }
            _ = &mut disconnect, if !disconnected => {
                disconnected = true;
                if let Some(id) = collector.devices.last() {
                    collector.scheduler.on_device_disconnected(id);
                    info!(device = %id.short(), "simulated switch disconnected");
                }
            }
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Ndjson => println!("{}", serde_json::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_report(query: &QueryService, store: &TimeSeriesStore, format: OutputFormat) -> Result<()> {
    let now = Utc::now();
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => print_json(&exporter::report(query, store, now), format)?,
        OutputFormat::Human => {
            println!("=== OpenFlow Stats {} ===", now.to_rfc3339());
            for device in query.devices() {
                println!(
                    "Device:     {} state={} ports={} flows={}",
                    device.id,
                    device.state.map_or("stored", |state| state.as_str()),
                    device.ports,
                    device.flows
                );
                for port in query.port_summaries(&device.id).unwrap_or_default() {
                    print!("  ");
                    print_port_line(&port);
                }
                for flow in query.flow_summaries(&device.id).unwrap_or_default() {
                    print!("  ");
                    print_flow_line(&flow);
                }
            }
        }
    }
    Ok(())
}

fn print_port_line(port: &ofstats_core::PortSummary) {
    let rate = |metric: Metric| format_value(metric, port.rates.get(&metric).copied());
    println!(
        "port {:<4} {:<8} rx={:<12} tx={:<12} rx_util={:<8} tx_util={:<8} speed={}{}",
        port.port_no,
        port.name.as_deref().unwrap_or("-"),
        rate(Metric::RxBytes),
        rate(Metric::TxBytes),
        format_value(Metric::RxUtilization, port.rx_util),
        format_value(Metric::TxUtilization, port.tx_util),
        port.speed
            .map_or_else(|| "unknown".to_string(), |speed| format_value(Metric::RxBytes, Some(speed))),
        if port.reset { " (reset)" } else { "" }
    );
}

fn print_flow_line(flow: &ofstats_core::FlowSummary) {
    let matches = flow
        .match_fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "flow {} [{}] {} {}",
        flow.flow_id,
        matches,
        format_value(Metric::ByteCount, flow.bytes_per_sec),
        format_value(Metric::PacketCount, flow.packets_per_sec)
    );
}

fn print_range(result: &RangeResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => print_json(result, format)?,
        OutputFormat::Human => match result {
            RangeResult::Empty => println!("no data in range"),
            RangeResult::Points(points) => {
                for point in points {
                    println!("{}  {:.3}", point.timestamp.to_rfc3339(), point.value);
                }
            }
        },
    }
    Ok(())
}

fn format_value(metric: Metric, value: Option<f64>) -> String {
    let Some(value) = value else {
        return "n/a".to_string();
    };
    if metric.is_utilization() {
        return format!("{:.2}%", value * 100.0);
    }
    let (scaled, prefix) = match value.abs() {
        v if v >= 1e9 => (value / 1e9, "G"),
        v if v >= 1e6 => (value / 1e6, "M"),
        v if v >= 1e3 => (value / 1e3, "k"),
        _ => (value, ""),
    };
    format!("{scaled:.2} {prefix}{}", metric.unit())
}
