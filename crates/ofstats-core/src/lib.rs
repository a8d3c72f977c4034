pub mod config;
pub mod key;
pub mod pipeline;
pub mod poller;
pub mod query;
pub mod rate;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod speed;
pub mod store;
pub mod transport;

pub use config::{
    Consolidation, LayoutError, RateConfig, ResetPolicy, SchedulerConfig, SpeedUnit, StatsConfig, StoreConfig,
    TierConfig,
};
pub use key::{DeviceId, FlowId, ItemKey, Metric, StatsKey, StatsKind};
pub use pipeline::{ReplyOutcome, StatsPipeline};
pub use poller::DevicePoller;
pub use query::{
    DeviceSummary, FlowSummary, InstantValue, PortSummary, QueryError, QueryService, RangeRequest, RangeResult,
};
pub use rate::{compute_rates, RateEngine, RateError};
pub use registry::{Device, DeviceRegistry, DeviceState};
pub use scheduler::{PollingScheduler, SchedulerError};
pub use snapshot::{
    Counters, FlowCounters, PortCounters, RateSample, RawFlowStats, RawPortStats, ReplyBody, Snapshot, StatsReply,
};
pub use speed::{OverrideError, OverrideTree, ResolvedSpeed, SpeedResolver, SpeedSource};
pub use store::{Point, StoreError, TimeSeriesStore};
pub use transport::{ChannelTransport, OutboundRequest, StatsTransport, TransportError};
