//! Command line interface

pub mod format;
pub mod get;
pub mod run;

use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::Result;

/// Test driver for Kubernetes controllers
#[derive(Parser, Debug)]
#[command(name = crate::PROGNAME)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a set of test documents
    Run(run::RunArgs),

    /// Get cluster objects managed by the test driver
    Get(get::GetArgs),
}

impl Cli {
    /// Run the CLI command, returning the process exit code.
    pub async fn run(self) -> Result<u8> {
        match self.command {
            Commands::Run(args) => run::run(args).await,
            Commands::Get(args) => get::run(args).await,
        }
    }
}

/// Apply a function to a path that may be a file or a directory. In
/// either case, recurse and visit every file found; hidden files
/// (dotfiles) are ignored.
pub(crate) fn walk_files(
    path: &Path,
    apply: &mut dyn FnMut(&Path) -> Result<()>,
) -> Result<()> {
    let metadata = std::fs::metadata(path)?;

    if !metadata.is_dir() {
        return apply(path);
    }

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;

        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        walk_files(&entry.path(), apply)?;
    }

    Ok(())
}

/// Parse a duration like `30s`, `500ms`, `1m30s`, or `2h`. A bare number
/// is read as seconds.
pub(crate) fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(seconds) = input.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }

        let mut unit = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        number.clear();

        let seconds = match unit.as_str() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(format!("unknown duration unit {unit:?} in {input:?}")),
        };

        total += Duration::from_secs_f64(seconds);
    }

    if !number.is_empty() {
        return Err(format!("missing unit in duration {input:?}"));
    }

    Ok(total)
}
