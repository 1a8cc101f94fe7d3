//! Logging setup for the demo binary: `fern` dispatch plus a
//! `tracing-appender` rolling file. The `dobbin` library never configures a
//! subscriber itself — it only emits `log` facade calls — so this is
//! entirely the demo's concern.

use std::str::FromStr;

use anyhow::Result;
use log::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Initializes stderr + rolling-file logging at `level`. The returned guard
/// must be kept alive for the duration of the process; dropping it flushes
/// and closes the background writer thread.
pub fn init_logging(log_dir: &str, level: &str) -> Result<WorkerGuard> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "dobbin-cli.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .chain(Box::new(non_blocking) as Box<dyn std::io::Write + Send>)
        .apply()?;

    Ok(guard)
}
