use anyhow::Result;
use clap::Parser;
use log::info;

use dobbin_demo::cli::Cli;
use dobbin_demo::config::ConfigLoad;
use dobbin_demo::logging;

fn main() -> Result<()> {
    let mut cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => ConfigLoad::load_from(path).unwrap_or_default(),
        None => ConfigLoad::load().unwrap_or_default(),
    };
    let log_level = cfg.log_level.as_deref().unwrap_or(&cli.log_level);

    let log_dir = format!("{}/.dobbin-cli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guard = logging::init_logging(&log_dir, log_level)?;

    if cli.db.is_none() {
        cli.db = cfg.db_path.clone();
    }
    info!("dobbin-cli starting with args: {cli:?}");

    dobbin_demo::execute(cli)
}
