// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `dqtool`: inspects disk-buffer files without modifying them.
//!
//! ```bash
//! dqtool info /var/lib/logqueue/syslog-ng-00000.qf
//! dqtool cat /var/lib/logqueue/syslog-ng-00000.qf > messages.log
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod commands;

use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dqtool")]
#[command(version, about = "Inspect logqueue disk-buffer files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the header and the number of messages of each file to stderr.
    Info {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print every message of each file to stdout, oldest first.
    Cat {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("LOGQUEUE_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    let mut failed = false;
    match cli.command {
        Commands::Info { files } => {
            let mut stderr = io::stderr().lock();
            for file in &files {
                if let Err(e) = commands::info(file, &mut stderr) {
                    error!("{e:#}");
                    failed = true;
                }
            }
        }
        Commands::Cat { files } => {
            let mut stdout = io::stdout().lock();
            for file in &files {
                if let Err(e) = commands::cat(file, &mut stdout) {
                    error!("{e:#}");
                    failed = true;
                }
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
