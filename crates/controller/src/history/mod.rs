//! Multi-resolution environmental history: hourly, daily and monthly rings
//! fed by the aggregator from sensor, rain and watering sources.

pub mod aggregator;
pub mod bucket;
pub mod entry;
pub mod flash_log;
pub mod kv;
pub mod reset_log;
pub mod ring;
pub mod sources;
pub mod store;

pub use aggregator::Aggregator;
pub use bucket::Granularity;
pub use entry::{DailyEntry, EnvSample, HourlyEntry, MonthlyEntry, Stat};
pub use store::HistoryStore;
