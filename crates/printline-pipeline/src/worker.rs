// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker role: the half of the pipeline that runs next to the scanner.
//
// Stages: discover scanner -> fetch scan -> reconstruction.  The result is
// handed back to the coordinator as `PROJECT=<label>` and
// `RESULT_PATH=<path>` lines on stdout.

use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::info;

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};
use printline_core::types::{Located, PipelineRun};

use crate::image_source::{FetchedScan, ImageSource, latest};
use crate::notify::Notifier;
use crate::probe::ApplianceProbe;
use crate::reconstruction::{ReconstructionApi, ReconstructionSettings, reconstruct};
use crate::sentinel::{PROJECT, RESULT_PATH, sentinel_line};
use crate::stage::StageRunner;

pub struct Worker {
    config: Arc<PipelineConfig>,
    probe: Arc<dyn ApplianceProbe>,
    source: Arc<dyn ImageSource>,
    cloud: Arc<dyn ReconstructionApi>,
    notifier: Arc<dyn Notifier>,
}

impl Worker {
    pub fn new(
        config: Arc<PipelineConfig>,
        probe: Arc<dyn ApplianceProbe>,
        source: Arc<dyn ImageSource>,
        cloud: Arc<dyn ReconstructionApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            probe,
            source,
            cloud,
            notifier,
        }
    }

    /// Run every worker stage.  Handoff lines go to `handoff` only on success.
    pub async fn run(&self, project: Option<&str>, handoff: &mut (dyn Write + Send)) -> PipelineRun {
        let run = PipelineRun::new(project.map(str::to_owned));
        let mut runner = StageRunner::new(run, self.notifier.as_ref());
        match self.stages(&mut runner, handoff).await {
            Ok(()) => runner.finish(),
            Err(e) => runner.abort(&e),
        }
    }

    async fn stages(&self, runner: &mut StageRunner<'_>, handoff: &mut (dyn Write + Send)) -> Result<()> {
        let scanner = runner.stage("Discover scanner", self.discover()).await?;

        let requested = runner.label().map(str::to_owned);
        let scan = runner
            .stage("Fetch scan", self.fetch(scanner, requested.as_deref()))
            .await?;
        runner.set_label(scan.label.clone());

        self.notifier
            .info(&format!("Uploading scan '{}' to reconstruction service...", scan.label))
            .await;
        let settings = ReconstructionSettings::from_config(&self.config);
        let result = runner
            .stage(
                "Reconstruction",
                reconstruct(self.cloud.as_ref(), &scan.images, Some(&scan.label), &settings),
            )
            .await?;
        self.notifier
            .info(&format!("Reconstruction complete for '{}'", scan.label))
            .await;

        writeln!(handoff, "{}", sentinel_line(PROJECT, &scan.label))?;
        writeln!(handoff, "{}", sentinel_line(RESULT_PATH, &result.to_string_lossy()))?;
        handoff.flush()?;
        Ok(())
    }

    async fn discover(&self) -> Result<IpAddr> {
        let host = &self.config.scanner_host;
        let Located::Found(ip) = self.probe.locate(host).await else {
            return Err(PrintlineError::Discovery(format!("scanner not found at {host}")));
        };
        if !self.probe.verify_control_port(ip).await {
            return Err(PrintlineError::Discovery(format!("file share not accessible on {ip}")));
        }
        Ok(ip)
    }

    async fn fetch(&self, scanner: IpAddr, requested: Option<&str>) -> Result<FetchedScan> {
        let label = match requested {
            Some(label) => label.to_owned(),
            None => {
                let scans = self.source.list_scans(scanner).await?;
                let newest = latest(&scans)
                    .ok_or_else(|| PrintlineError::ImageSource("no scans found on scanner".into()))?;
                info!(scan = %newest.name, "auto-detected latest scan");
                newest.name.clone()
            }
        };
        self.source
            .fetch(scanner, &label, &self.config.scandata_dir.join("scans"))
            .await
    }
}
