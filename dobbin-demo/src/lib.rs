//! `dobbin-cli` is a tiny example binary for the `dobbin` object database.
//! It exercises the library end to end — open, set/get/delete keys on the
//! root document, commit, reopen — using a small CLI/config/logging stack
//! scaled down to what a single-process demo needs. It is illustration, not
//! a product surface: `dobbin` itself has no CLI, config file, or logging
//! setup of its own.

pub mod cli;
pub mod config;
pub mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use dobbin::database::{Database, DatabaseOptions};
use dobbin::object::PersistentDict;
use dobbin::value::Value;
use log::info;

use crate::cli::{Cli, Command};

fn open_root_dict(db: &Database) -> Result<PersistentDict> {
    match db.get_root()? {
        Some(entity) => Ok(PersistentDict::from_entity(entity)),
        None => {
            let dict = PersistentDict::new();
            let tx = db.begin();
            db.set_root(dict.entity())?;
            db.commit(&tx)?;
            Ok(dict)
        }
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => format!("{other:?}"),
    }
}

/// Runs one CLI invocation against the database at `cli.db` (or, if unset,
/// `dobbin.db` in the current directory). Each subcommand is its own
/// short-lived transaction: open, mutate, commit.
pub fn execute(cli: Cli) -> Result<()> {
    let db_path = cli.db.clone().unwrap_or_else(|| PathBuf::from("dobbin.db"));
    let db = Database::open(DatabaseOptions::new(&db_path)).with_context(|| format!("opening database at {db_path:?}"))?;
    info!("dobbin-cli operating on {db_path:?}");

    match cli.command {
        Command::Set { key, value } => {
            let dict = open_root_dict(&db)?;
            let tx = db.begin();
            dict.set(key.clone(), Value::Str(value))?;
            db.save(dict.entity())?;
            db.commit(&tx)?;
            println!("{} {key}", "set".green());
        }
        Command::Get { key } => {
            let dict = open_root_dict(&db)?;
            match dict.get(&key)? {
                Some(value) => println!("{}", format_value(&value)),
                None => println!("{}", "(no such key)".yellow()),
            }
        }
        Command::Del { key } => {
            let dict = open_root_dict(&db)?;
            let tx = db.begin();
            let existed = dict.contains_key(&key)?;
            dict.delete(&key)?;
            db.save(dict.entity())?;
            db.commit(&tx)?;
            if existed {
                println!("{} {key}", "deleted".red());
            } else {
                println!("{}", "(no such key)".yellow());
            }
        }
        Command::List => {
            let dict = open_root_dict(&db)?;
            for key in dict.keys()? {
                if let Some(value) = dict.get(&key)? {
                    println!("{key} = {}", format_value(&value));
                }
            }
        }
    }
    Ok(())
}
