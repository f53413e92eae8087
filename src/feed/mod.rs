//! チャットフィード
//!
//! `FeedClient`が接続（グループ）ごとの購読を作り、`FeedHandle`でチャンネルを
//! JOINする。受信イベントは購読ごとのストリームで届く。

pub mod irc;
pub mod pool;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::models::MessageEvent;

pub use irc::TwitchIrcFeed;
pub use pool::{ConnectionPool, GroupStatus, PoolError, PoolStatus};

/// フィード操作のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected to the chat server")]
    NotConnected,

    #[error("Failed to send command: {0}")]
    Send(String),

    #[error("Feed connection is closed")]
    Closed,
}

/// 購読ストリームに流れるイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Message(MessageEvent),
    Connected,
    Disconnected { reason: String },
    Error { message: String },
}

/// 1接続への操作
#[async_trait]
pub trait FeedHandle: Send + Sync {
    /// チャンネルをJOINする（同じ接続で複数回呼べる）
    async fn join(&self, channels: &[String]) -> Result<(), FeedError>;

    /// 接続を閉じる。以後イベントは届かない。
    async fn close(&self);
}

/// 購読：接続ハンドルとイベントストリーム
pub struct FeedSubscription {
    pub handle: Arc<dyn FeedHandle>,
    pub events: UnboundedReceiverStream<FeedEvent>,
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription").finish_non_exhaustive()
    }
}

/// フィード接続の作成元
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn subscribe(&self, group_id: usize) -> Result<FeedSubscription, FeedError>;
}
