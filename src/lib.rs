pub mod analytics;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod feed;
pub mod io;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod scheduler;

use thiserror::Error;

// Re-export the main error types for convenience
pub use analytics::HistoryError;
pub use api::ApiError;
pub use config::ConfigError;
pub use feed::{FeedError, PoolError};
pub use io::StoreError;

// Re-export the pipeline components
pub use analytics::{ChannelHistory, ChannelStatistics, HistoryService, TimeBucketAggregator};
pub use api::{HelixClient, IdentityResolver};
pub use feed::{ConnectionPool, PoolStatus};
pub use io::{JsonFileStore, PersistenceSink};
pub use models::{ChannelSnapshot, IdentityRecord, LivenessRecord, MessageEvent, MinuteBucket};
pub use monitor::Monitor;
pub use scheduler::{DecadeScheduler, SchedulerState, TickSummary};

/// クレート共通のエラー
#[derive(Error, Debug)]
pub enum ViewboiError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type ViewboiResult<T> = Result<T, ViewboiError>;
