// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Argument parsing and logging setup.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Arguments shared by the coordinator and worker binaries.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct RunArgs {
    /// Path to the `KEY=value` config file.
    #[arg(long)]
    pub config: PathBuf,

    /// Scan to process.  Defaults to the newest scan on the scanner.
    #[arg(long)]
    pub project: Option<String>,

    /// Debug-level logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Arguments of the coordinator binary.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct CoordinatorArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Print this pre-sliced 3MF instead of running the pipeline.
    #[arg(long, conflicts_with = "project")]
    pub threemf: Option<PathBuf>,
}

/// Arguments of the watcher binary.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct WatchArgs {
    /// Path to the `KEY=value` config file.
    #[arg(long)]
    pub config: PathBuf,

    /// Debug-level logging, also passed on to launched runs.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Default filter directive for the given verbosity.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Log to stderr so the worker's stdout carries only its output and the
/// handoff lines.  `RUST_LOG` overrides the verbosity flag.
pub fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose))),
        )
        .init();
}
