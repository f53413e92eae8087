//! ログ初期化
//!
//! 標準出力へのcompact出力に加え、設定に応じて日次ローテーションのファイル出力を行う。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

fn log_file_name(prefix: &str) -> String {
    format!("{prefix}_app.log")
}

/// ログを初期化する
///
/// ファイル出力が有効な場合は`WorkerGuard`を返す。プログラム終了まで保持すること。
pub fn init_logging(config: &LogConfig, log_dir: &Path) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to build log filter")?;

    let (file_layer, guard) = if config.enable_file_logging {
        std::fs::create_dir_all(log_dir).with_context(|| {
            format!("Failed to create log directory: {}", log_dir.display())
        })?;

        if config.auto_cleanup_enabled {
            match cleanup_old_logs(log_dir, &config.log_file_prefix, config.max_log_files) {
                Ok(0) => {}
                Ok(removed) => eprintln!("🧹 Removed {removed} old log files"),
                Err(e) => eprintln!("⚠️ Log cleanup failed: {e}"),
            }
        }

        let appender =
            tracing_appender::rolling::daily(log_dir, log_file_name(&config.log_file_prefix));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .with(file_layer)
        .try_init()?;

    if config.enable_file_logging {
        tracing::info!("📝 File logging enabled: {}", log_dir.display());
    }

    Ok(guard)
}

/// 古いログファイルを削除し、新しい順に`max_files`件だけ残す
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, max_files: u32) -> Result<usize> {
    let pattern = log_dir.join(format!("{prefix}_*.log*"));
    let pattern = pattern.to_string_lossy();

    let mut files: Vec<(PathBuf, SystemTime)> = glob::glob(&pattern)
        .with_context(|| format!("Invalid log file pattern: {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let modified = path.metadata().and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .collect();

    if files.len() <= max_files as usize {
        return Ok(0);
    }

    files.sort_by(|a, b| b.1.cmp(&a.1));
    let mut removed = 0;
    for (path, _) in files.into_iter().skip(max_files as usize) {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove log file: {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}
