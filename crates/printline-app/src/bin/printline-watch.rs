// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Watcher: poll the scanner and launch a coordinator run per new scan.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use printline_app::cli::{WatchArgs, init_tracing};
use printline_app::services::roles::{self, WATCHER};
use printline_core::error::Result;

#[tokio::main]
async fn main() -> ExitCode {
    let args = WatchArgs::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "printline-watch failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: WatchArgs) -> Result<()> {
    let config = roles::load_config(&args.config)?;
    let _guard = roles::claim(WATCHER, &config).await?;

    let watcher = roles::watcher(config, args.verbose)?;
    tokio::select! {
        result = watcher.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping watcher");
            Ok(())
        }
    }
}
