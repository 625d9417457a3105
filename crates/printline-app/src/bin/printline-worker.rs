// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker: discover the scanner, fetch a scan and reconstruct it.  The result
// path is handed back on stdout; logs go to stderr.

use std::process::ExitCode;

use clap::Parser;

use printline_app::cli::{RunArgs, init_tracing};
use printline_app::services::roles::{self, WORKER};
use printline_core::error::Result;

#[tokio::main]
async fn main() -> ExitCode {
    let args = RunArgs::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "printline-worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = roles::load_config(&args.config)?;
    let guard = roles::claim(WORKER, &config).await?;

    let worker = roles::worker(config)?;
    let mut stdout = std::io::stdout();
    let run = worker.run(args.project.as_deref(), &mut stdout).await;

    drop(guard);
    Ok(roles::report(WORKER, &run))
}
