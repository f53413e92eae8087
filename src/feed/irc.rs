//! Twitch IRC（WebSocket）フィード
//!
//! 匿名ログイン（`justinfan<乱数>`）で接続し、PRIVMSGをメッセージイベントに変換する。
//! 切断やサーバーからのRECONNECTでは指数バックオフで再接続し、
//! それまでにJOINしたチャンネルをバッチに分けて再JOINする。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{FeedClient, FeedError, FeedEvent, FeedHandle, FeedSubscription};
use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::models::MessageEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 再接続の待機時間（指数バックオフ）
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub backoff_multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            backoff_multiplier: 2,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectPolicy {
    /// `attempt`回目（0始まり）の待機時間
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier).saturating_pow(attempt);
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// 受信行の分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcLine {
    Ping(String),
    Reconnect,
    Privmsg { channel: String, user: String },
    Other,
}

fn privmsg_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:@\S+ )?:(?P<user>[^!\s]+)![^\s]+ PRIVMSG #(?P<channel>[^\s]+) :")
            .expect("PRIVMSG pattern is valid")
    })
}

/// IRCの1行を解析する（IRCv3タグ付きでも可）
pub fn parse_line(line: &str) -> IrcLine {
    let line = line.trim_end_matches(['\r', '\n']);

    let mut rest = line;
    if rest.starts_with('@') {
        rest = rest.split_once(' ').map_or("", |(_, r)| r);
    }
    if rest.starts_with(':') {
        rest = rest.split_once(' ').map_or("", |(_, r)| r);
    }
    let (command, params) = rest.split_once(' ').unwrap_or((rest, ""));

    match command {
        "PING" => IrcLine::Ping(params.to_string()),
        "RECONNECT" => IrcLine::Reconnect,
        "PRIVMSG" => match privmsg_pattern().captures(line) {
            Some(caps) => IrcLine::Privmsg {
                channel: caps["channel"].to_string(),
                user: caps["user"].to_string(),
            },
            None => IrcLine::Other,
        },
        _ => IrcLine::Other,
    }
}

/// JOINコマンド行
pub fn join_line(channels: &[String]) -> String {
    let targets: Vec<String> = channels.iter().map(|c| format!("#{c}")).collect();
    format!("JOIN {}", targets.join(","))
}

#[derive(Debug, Clone)]
struct FeedSettings {
    url: String,
    rejoin_batch_size: usize,
    rejoin_delay: Duration,
    reconnect: ReconnectPolicy,
}

/// Twitch IRCの`FeedClient`実装
#[derive(Debug, Clone)]
pub struct TwitchIrcFeed {
    settings: Arc<FeedSettings>,
    clock: Arc<dyn Clock>,
}

impl TwitchIrcFeed {
    pub fn new(config: &PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings: Arc::new(FeedSettings {
                url: config.feed_url.clone(),
                rejoin_batch_size: config.join_batch_size.max(1),
                rejoin_delay: config.join_batch_delay(),
                reconnect: ReconnectPolicy::default(),
            }),
            clock,
        }
    }
}

#[async_trait]
impl FeedClient for TwitchIrcFeed {
    async fn subscribe(&self, group_id: usize) -> Result<FeedSubscription, FeedError> {
        let socket = connect(&self.settings.url).await?;
        tracing::info!(group = group_id, "🔗 Connected to {}", self.settings.url);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(FeedEvent::Connected);

        let session = IrcSession {
            group_id,
            settings: Arc::clone(&self.settings),
            clock: Arc::clone(&self.clock),
            events: event_tx,
            commands: command_rx,
            joined: Vec::new(),
        };
        tokio::spawn(session.run(socket));

        Ok(FeedSubscription {
            handle: Arc::new(IrcHandle {
                commands: command_tx,
            }),
            events: UnboundedReceiverStream::new(event_rx),
        })
    }
}

enum Command {
    Join {
        channels: Vec<String>,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Close,
}

struct IrcHandle {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl FeedHandle for IrcHandle {
    async fn join(&self, channels: &[String]) -> Result<(), FeedError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Join {
                channels: channels.to_vec(),
                reply,
            })
            .map_err(|_| FeedError::Closed)?;
        response.await.map_err(|_| FeedError::Closed)?
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

enum Outcome {
    Closed,
    Lost(String),
}

/// 1接続分のバックグラウンドタスク
struct IrcSession {
    group_id: usize,
    settings: Arc<FeedSettings>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<FeedEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    joined: Vec<String>,
}

impl IrcSession {
    async fn run(mut self, mut socket: WsStream) {
        loop {
            match self.drive(&mut socket).await {
                Outcome::Closed => {
                    let _ = socket.close(None).await;
                    tracing::info!(group = self.group_id, "🔌 Connection closed");
                    return;
                }
                Outcome::Lost(reason) => {
                    tracing::warn!(group = self.group_id, "⚠️ Disconnected: {}", reason);
                    let _ = self.events.send(FeedEvent::Disconnected { reason });

                    socket = match self.reconnect().await {
                        Some(socket) => socket,
                        None => return,
                    };
                    tracing::info!(group = self.group_id, "✅ Reconnected");
                    let _ = self.events.send(FeedEvent::Connected);

                    if let Err(e) = self.rejoin(&mut socket).await {
                        let _ = self.events.send(FeedEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn drive(&mut self, socket: &mut WsStream) -> Outcome {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Join { channels, reply }) => {
                        self.remember(&channels);
                        let result = send_raw(socket, &join_line(&channels)).await;
                        let _ = reply.send(result.clone());
                        if let Err(e) = result {
                            return Outcome::Lost(e.to_string());
                        }
                    }
                    Some(Command::Close) | None => return Outcome::Closed,
                },
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(outcome) = self.handle_text(socket, &text).await {
                            return outcome;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Outcome::Lost("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = self.events.send(FeedEvent::Error {
                            message: e.to_string(),
                        });
                        return Outcome::Lost(e.to_string());
                    }
                    None => return Outcome::Lost("stream ended".to_string()),
                },
            }
        }
    }

    async fn handle_text(&mut self, socket: &mut WsStream, text: &str) -> Option<Outcome> {
        for line in text.lines().filter(|l| !l.is_empty()) {
            match parse_line(line) {
                IrcLine::Ping(payload) => {
                    if let Err(e) = send_raw(socket, &format!("PONG {payload}")).await {
                        return Some(Outcome::Lost(e.to_string()));
                    }
                }
                IrcLine::Reconnect => {
                    return Some(Outcome::Lost("server requested reconnect".to_string()));
                }
                IrcLine::Privmsg { channel, user } => {
                    let event = MessageEvent::new(&channel, &user, self.clock.now());
                    let _ = self.events.send(FeedEvent::Message(event));
                }
                IrcLine::Other => tracing::trace!(group = self.group_id, "{}", line),
            }
        }
        None
    }

    fn remember(&mut self, channels: &[String]) {
        for channel in channels {
            if !self.joined.contains(channel) {
                self.joined.push(channel.clone());
            }
        }
    }

    /// 切断中の待機。閉じる指示を受けたら`false`。
    ///
    /// この間のJOINは失敗を返すが、チャンネルは記録して再接続時にJOINする。
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Join { channels, reply }) => {
                        self.remember(&channels);
                        let _ = reply.send(Err(FeedError::NotConnected));
                    }
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut attempt = 0;
        loop {
            let delay = self.settings.reconnect.delay(attempt);
            tracing::info!(
                group = self.group_id,
                "🔄 Reconnecting in {:?} (attempt {})",
                delay,
                attempt + 1
            );
            if !self.wait_disconnected(delay).await {
                return None;
            }

            match connect(&self.settings.url).await {
                Ok(socket) => return Some(socket),
                Err(e) => {
                    tracing::warn!(group = self.group_id, "❌ Reconnect failed: {}", e);
                    let _ = self.events.send(FeedEvent::Error {
                        message: e.to_string(),
                    });
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// 再接続後に送るJOIN行（バッチ単位）
    fn rejoin_lines(&self) -> Vec<String> {
        self.joined
            .chunks(self.settings.rejoin_batch_size)
            .map(join_line)
            .collect()
    }

    async fn rejoin(&mut self, socket: &mut WsStream) -> Result<(), FeedError> {
        for (index, line) in self.rejoin_lines().iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.rejoin_delay).await;
            }
            send_raw(socket, line).await?;
            tracing::debug!(group = self.group_id, "📥 Rejoin sent: {}", line);
        }
        Ok(())
    }
}

async fn send_raw(socket: &mut WsStream, line: &str) -> Result<(), FeedError> {
    socket
        .send(Message::Text(line.to_string()))
        .await
        .map_err(|e| FeedError::Send(e.to_string()))
}

async fn connect(url: &str) -> Result<WsStream, FeedError> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| FeedError::Connect(e.to_string()))?;

    let nick = format!("justinfan{}", rand::thread_rng().gen_range(10_000..100_000));
    for line in [
        "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
        "PASS SCHMOOPIIE".to_string(),
        format!("NICK {nick}"),
    ] {
        send_raw(&mut socket, &line).await?;
    }

    Ok(socket)
}
