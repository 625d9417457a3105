// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scan watcher: poll the image source and start a coordinator run for every
// scan that was not there on the previous poll.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tracing::{debug, info, warn};

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};
use printline_core::types::Located;

use crate::image_source::ImageSource;
use crate::notify::Notifier;
use crate::probe::ApplianceProbe;

/// Starts a pipeline run for one scan.
pub trait Launcher: Send + Sync {
    fn launch(&self, project: &str) -> Result<()>;
}

/// Spawns the coordinator binary as a separate process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub bin: PathBuf,
    pub config_path: PathBuf,
    pub verbose: bool,
}

impl Launcher for ProcessLauncher {
    fn launch(&self, project: &str) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("--config").arg(&self.config_path);
        if self.verbose {
            cmd.arg("-v");
        }
        cmd.arg("--project").arg(project).stdin(Stdio::null());
        let child = cmd.spawn().map_err(|e| {
            PrintlineError::Transport(format!("cannot start {}: {e}", self.bin.display()))
        })?;
        info!(pid = child.id(), project, "pipeline launched");
        // Reaped in the background by tokio once it exits.
        drop(child);
        Ok(())
    }
}

pub struct Watcher {
    config: Arc<PipelineConfig>,
    probe: Arc<dyn ApplianceProbe>,
    source: Arc<dyn ImageSource>,
    launcher: Arc<dyn Launcher>,
    notifier: Arc<dyn Notifier>,
    known: Option<BTreeSet<String>>,
}

impl Watcher {
    pub fn new(
        config: Arc<PipelineConfig>,
        probe: Arc<dyn ApplianceProbe>,
        source: Arc<dyn ImageSource>,
        launcher: Arc<dyn Launcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            probe,
            source,
            launcher,
            notifier,
            known: None,
        }
    }

    /// Current listing, or `None` when the source is unreachable.
    async fn listing(&self) -> Option<BTreeSet<String>> {
        let Located::Found(ip) = self.probe.locate(&self.config.scanner_host).await else {
            debug!("scanner unreachable, skipping poll");
            return None;
        };
        match self.source.list_scans(ip).await {
            Ok(entries) => Some(entries.into_iter().map(|e| e.name).collect()),
            Err(e) => {
                debug!(error = %e, "listing failed, skipping poll");
                None
            }
        }
    }

    /// One poll.  The first successful listing only sets the baseline.
    /// Returns the scans a run was launched for.
    pub async fn poll_once(&mut self) -> Vec<String> {
        let Some(current) = self.listing().await else {
            return Vec::new();
        };
        let Some(known) = self.known.replace(current.clone()) else {
            info!(count = current.len(), scans = ?current, "initial scans");
            return Vec::new();
        };

        let fresh: Vec<String> = current.difference(&known).cloned().collect();
        for scan in &fresh {
            info!(scan = %scan, "new scan detected");
            self.notifier
                .info(&format!("New scan detected: {scan}, starting pipeline"))
                .await;
            if let Err(e) = self.launcher.launch(scan) {
                warn!(scan = %scan, error = %e, "launch failed");
                self.notifier
                    .error(&format!("Could not start pipeline for {scan}: {e}"))
                    .await;
            }
        }
        fresh
    }

    /// Poll forever at the configured interval.
    pub async fn run(mut self) -> Result<()> {
        self.poll_once().await;
        if self.known.is_none() {
            info!("scanner not reachable, will retry");
        }
        self.notifier
            .info("Watcher started, monitoring for new scans")
            .await;
        loop {
            tokio::time::sleep(self.config.watch_interval).await;
            self.poll_once().await;
        }
    }
}
