//! Argument parsing for `dobbin-cli`. One subcommand per short-lived
//! transaction against the root `PersistentDict`'s mapping-variant API:
//! `set`/`get`/`del`/`list`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "dobbin-cli", author, version, about = "Demo CLI for the dobbin object database")]
pub struct Cli {
    /// Path to the dobbin transaction log file. Falls back to the config
    /// file's `db_path`, then to `dobbin.db`, when not given on the command
    /// line.
    #[arg(short = 'f', long)]
    pub db: Option<PathBuf>,

    /// Path to a TOML config file overriding defaults (db path, log level).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Set a key on the root document.
    Set { key: String, value: String },
    /// Read a key from the root document.
    Get { key: String },
    /// Delete a key from the root document.
    Del { key: String },
    /// List every key/value pair on the root document.
    List,
}
