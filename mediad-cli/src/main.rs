//! mediad: media server host process.
//!
//! # Usage
//!
//! ```text
//! mediad [-f|--conf-file <PATH>]
//! ```
//!
//! Runs in the foreground until SIGINT or SIGTERM. The parent process gets a
//! `SIGCONT` once the request server is listening.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

use mediad_core::config::DEFAULT_CONFIG_FILE;
use mediad_daemon::ExitStatus;

#[derive(Parser, Debug)]
#[command(
    name = "mediad",
    version,
    about = "Media server host: configuration, crash diagnostics and request serving",
    long_about = None,
)]
struct Cli {
    /// Configuration file; created with defaults when missing.
    #[arg(short = 'f', long = "conf-file", value_name = "PATH")]
    conf_file: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<ExitStatus> {
    let path = cli
        .conf_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    mediad_daemon::start_blocking(&path)
        .with_context(|| format!("failed to run mediad with {}", path.display()))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(cli) {
        Ok(status) => ExitCode::from(status.code() as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
