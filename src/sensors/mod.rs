pub mod aggregator;
pub mod snapshot;
pub mod source;

pub use aggregator::{parse_numeric, percentile, SensorAggregator, Statistic, HISTORY_TIMEOUT};
pub use snapshot::SensorSnapshot;
pub use source::{HistorySample, HistorySource, InMemorySensors, SensorError, StateSource};
