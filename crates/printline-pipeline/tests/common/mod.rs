// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared fakes for the pipeline integration tests.

pub mod fakes;

#[allow(unused_imports)]
pub use fakes::*;

use std::path::Path;

use printline_core::PipelineConfig;

/// Config rooted in a temporary directory.
#[allow(dead_code)]
pub fn config_in(root: &Path, extra: &str) -> PipelineConfig {
    let text = format!(
        "OPENSCAN_HOST=scanner.local\n\
         SCANDATA_DIR={root}/scandata\n\
         LAPTOP_PIPELINE_DIR={root}/laptop\n\
         PI_HOST=worker.lan\n\
         PI_USER=pi\n\
         OSC_TOKEN=test-token\n\
         CLOUD_POLL_INTERVAL=0\n\
         CLOUD_MAX_WAIT=30\n\
         BAMBU_SERIAL=00M09A350100001\n\
         BAMBU_ACCESS_CODE=12345678\n\
         TELEGRAM_TARGET=42\n\
         {extra}",
        root = root.display()
    );
    PipelineConfig::from_str_with_source(&text, &root.join(".env")).unwrap()
}
