pub mod aggregator;
pub mod history;

pub use aggregator::{LiveChatStats, TenMinuteWindow, TimeBucketAggregator};
pub use history::{ChannelHistory, ChannelStatistics, HistoryError, HistoryService};
