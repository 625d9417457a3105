// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Coordinator: run the worker remotely, then simplify, slice and print.
// With `--threemf`, print a pre-sliced job directly.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use printline_app::cli::{CoordinatorArgs, init_tracing};
use printline_app::services::roles::{self, COORDINATOR};
use printline_core::error::Result;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CoordinatorArgs::parse();
    init_tracing(args.run.verbose);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "printline failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CoordinatorArgs) -> Result<ExitCode> {
    let config = roles::load_config(&args.run.config)?;
    let guard = roles::claim(COORDINATOR, &config).await?;

    let coordinator = roles::coordinator(Arc::clone(&config), args.run.verbose);
    let run = match &args.threemf {
        Some(job) => coordinator.print_file(job).await,
        None => coordinator.run(args.run.project.as_deref()).await,
    };

    drop(guard);
    Ok(roles::report(COORDINATOR, &run))
}
