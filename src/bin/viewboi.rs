use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use viewboi::{
    config::{AppConfig, ConfigManager},
    HistoryError, Monitor,
};

const LIVE_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Twitchチャンネルの視聴者数とチャット活動を10分ごとに記録する
#[derive(Parser, Debug)]
#[command(name = "viewboi", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor chat and record a snapshot on every boundary (default)
    Run,
    /// Run a single tick immediately and print its summary
    Poll,
    /// Print aggregate statistics for every channel
    Stats,
    /// Print the recorded history of one channel
    History {
        /// Channel login
        login: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.load_config()?;

    // tokio-consoleの初期化（プロファイリング用）
    #[cfg(feature = "debug-tokio")]
    console_subscriber::init();

    #[cfg(not(feature = "debug-tokio"))]
    let _guard = viewboi::logging::init_logging(&config.log, &config.log_dir())?;

    tracing::info!("🎬 Starting viewboi - Twitch viewer & chat recorder");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Poll => poll(config).await,
        Command::Stats => stats(config).await,
        Command::History { login } => history(config, &login).await,
        Command::Config => print_config(&config),
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let monitor = Monitor::from_config(config)
        .await
        .context("Failed to set up monitor")?;

    let status = monitor.start().await.context("Failed to start monitor")?;
    tracing::info!(
        "📡 Chat pool: enabled={}, groups={:?}",
        status.enabled,
        status.channel_counts()
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut live_report = tokio::time::interval(LIVE_REPORT_INTERVAL);
    live_report.tick().await;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = live_report.tick() => log_live_chat(&monitor),
        }
    }

    monitor.shutdown().await;
    tracing::info!("👋 viewboi stopped");
    Ok(())
}

/// 集計前のチャット状況をチャンネルごとに出力する
fn log_live_chat(monitor: &Monitor) {
    for (channel, stats) in monitor.live_chat_stats() {
        tracing::info!(
            channel = %channel,
            messages = stats.total_messages,
            unique_users = stats.unique_users,
            last_message_at = %stats.last_message_at,
            "💬 Live chat"
        );
    }
}

async fn poll(config: AppConfig) -> Result<()> {
    let monitor = Monitor::from_config(config)
        .await
        .context("Failed to set up monitor")?;
    let summary = monitor.poll_once().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn stats(config: AppConfig) -> Result<()> {
    let monitor = Monitor::from_config(config)
        .await
        .context("Failed to set up monitor")?;
    let statistics = monitor
        .history()
        .all_statistics()
        .await
        .context("Failed to compute statistics")?;
    println!("{}", serde_json::to_string_pretty(&statistics)?);
    Ok(())
}

async fn history(config: AppConfig, login: &str) -> Result<()> {
    let monitor = Monitor::from_config(config)
        .await
        .context("Failed to set up monitor")?;
    match monitor.history().channel_history(login).await {
        Ok(history) => {
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        Err(e @ HistoryError::NotFound { .. }) => {
            tracing::warn!("⚠️ {}", e);
            Err(e.into())
        }
        Err(e) => Err(e).context("Failed to read history"),
    }
}

fn print_config(config: &AppConfig) -> Result<()> {
    let mut shown = config.clone();
    if !shown.twitch.client_secret.is_empty() {
        shown.twitch.client_secret = "<redacted>".to_string();
    }
    println!(
        "{}",
        toml::to_string_pretty(&shown).context("Failed to serialize config")?
    );
    Ok(())
}

/// Ctrl+CまたはSIGTERMを待つ
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("🛑 Received Ctrl+C"),
        _ = terminate => tracing::info!("🛑 Received SIGTERM"),
    }
}
