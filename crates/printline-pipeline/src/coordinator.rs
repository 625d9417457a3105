// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Coordinator role: drives the whole run from the machine with the mesh
// tools and the printer on its network.
//
// Stages, in fixed order:
//   1. worker           remote exec of the worker, result via RESULT_PATH
//   2. pull             copy the artifact across the host boundary
//   3. simplification   Blender decimation
//   4. slice            OrcaSlicer
//   5. print            deposit + start on the printer
//
// A pre-sliced 3MF skips straight to the print stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};
use printline_core::types::{PipelineRun, PrintOutcome, ResultArtifact};

use crate::mesh::{MeshTools, extract_model, is_model};
use crate::notify::Notifier;
use crate::printer::PrintStation;
use crate::sentinel::{Handoff, PROJECT, RESULT_PATH, SentinelScanner};
use crate::stage::{StageOutput, StageRunner};
use crate::transport::{Transport, shell_quote};

const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Slack on top of the reconstruction wait for the worker's other stages.
const WORKER_SLACK: Duration = Duration::from_secs(1800);

/// What the worker stage hands on.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub artifact: ResultArtifact,
    pub label: Option<String>,
}

impl StageOutput for WorkerResult {
    fn describe(&self) -> Option<String> {
        Some(self.artifact.to_string())
    }
}

pub struct Coordinator {
    config: Arc<PipelineConfig>,
    worker: Arc<dyn Transport>,
    mesh: MeshTools,
    printer: Arc<dyn PrintStation>,
    notifier: Arc<dyn Notifier>,
    verbose: bool,
}

impl Coordinator {
    pub fn new(
        config: Arc<PipelineConfig>,
        worker: Arc<dyn Transport>,
        mesh: MeshTools,
        printer: Arc<dyn PrintStation>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            worker,
            mesh,
            printer,
            notifier,
            verbose: false,
        }
    }

    /// Pass `-v` on to the worker.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Shell command that runs the worker on its host.
    pub fn worker_command(&self, project: Option<&str>) -> String {
        let dir = &self.config.worker_dir;
        let mut cmd = format!(
            "cd {} && {} --config {}",
            shell_quote(dir),
            shell_quote(&self.config.worker_bin),
            shell_quote(&format!("{dir}/.env"))
        );
        if self.verbose {
            cmd.push_str(" -v");
        }
        if let Some(project) = project {
            cmd.push_str(&format!(" --project {}", shell_quote(project)));
        }
        cmd
    }

    pub async fn run(&self, project: Option<&str>) -> PipelineRun {
        let run = PipelineRun::new(project.map(str::to_owned));
        let mut runner = StageRunner::new(run, self.notifier.as_ref());

        let starting = match runner.label() {
            Some(p) => format!("Pipeline starting for project: {p}..."),
            None => "Pipeline starting...".to_owned(),
        };
        self.notifier.info(&starting).await;

        let result = self.stages(&mut runner).await;
        let minutes = runner.run().elapsed().as_secs_f64() / 60.0;
        match result {
            Ok(()) => {
                let label = runner.label().unwrap_or("scan").to_owned();
                self.notifier
                    .info(&format!("✅ Pipeline complete for '{label}' in {minutes:.1} minutes!"))
                    .await;
                runner.finish()
            }
            Err(e) => {
                self.notifier
                    .error(&format!("Pipeline failed after {minutes:.1} minutes: {e}"))
                    .await;
                runner.abort(&e)
            }
        }
    }

    /// Print an already sliced job.  No worker, mesh or slicer stage runs.
    pub async fn print_file(&self, job: &Path) -> PipelineRun {
        let label = job
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_owned());
        let run = PipelineRun::new(Some(label.clone()));
        let mut runner = StageRunner::new(run, self.notifier.as_ref());
        self.notifier
            .info(&format!("Printing pre-sliced job: {label}..."))
            .await;

        match runner.stage("Print", self.deliver_file(job)).await {
            Ok(outcome) => {
                self.notifier.info(&print_message(&outcome)).await;
                runner.finish()
            }
            Err(e) => runner.abort(&e),
        }
    }

    async fn deliver_file(&self, job: &Path) -> Result<PrintOutcome> {
        if !tokio::fs::try_exists(job).await? {
            return Err(PrintlineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file not found: {}", job.display()),
            )));
        }
        self.printer.deliver(job).await
    }

    async fn stages(&self, runner: &mut StageRunner<'_>) -> Result<()> {
        let requested = runner.label().map(str::to_owned);
        let handed = runner
            .stage("Worker (discover → reconstruct)", self.remote_worker(requested.as_deref()))
            .await?;
        if requested.is_none() {
            if let Some(label) = &handed.label {
                runner.set_label(label.clone());
            }
        }
        let label = match runner.label() {
            Some(label) => label.to_owned(),
            None => handed
                .artifact
                .file_name()
                .map(|n| n.split('.').next().unwrap_or("scan").to_owned())
                .unwrap_or_else(|| "scan".to_owned()),
        };

        let model = runner.stage("Pull from worker", self.pull(&handed.artifact)).await?;

        let stl = runner
            .stage("Mesh simplification", self.mesh.simplify(&model, &label))
            .await?;
        self.notifier
            .info(&format!(
                "Mesh decimated: {label} (ratio={})",
                self.config.decimate_ratio
            ))
            .await;

        self.notifier.info("Starting slice and print...").await;
        let job = runner.stage("Slice", self.mesh.slice(&stl, &label)).await?;

        let outcome = runner.stage("Print", self.printer.deliver(&job)).await?;
        self.notifier.info(&print_message(&outcome)).await;
        Ok(())
    }

    /// Run the worker remotely and wait for it to exit, echoing its output
    /// and picking out the handoff lines.
    #[instrument(skip(self))]
    async fn remote_worker(&self, project: Option<&str>) -> Result<WorkerResult> {
        let timeout = self.config.cloud_max_wait + WORKER_SLACK;
        let mut session = self.worker.exec(&self.worker_command(project), timeout).await?;

        let mut scanner = SentinelScanner::new(RESULT_PATH).with_optional(PROJECT);
        while let Some(line) = session.next_line().await {
            if !scanner.observe(&line) {
                info!(target: "worker", "[worker] {line}");
            }
        }
        let code = session.wait().await?;
        let Handoff { value, extras } = scanner.finish(code)?;

        Ok(WorkerResult {
            artifact: ResultArtifact::Remote {
                host: self.config.worker_host.clone(),
                user: self.config.worker_user.clone(),
                path: value,
            },
            label: extras.get(PROJECT).cloned(),
        })
    }

    /// Copy the artifact into the local models directory and unpack it.
    #[instrument(skip(self), fields(artifact = %artifact))]
    async fn pull(&self, artifact: &ResultArtifact) -> Result<PathBuf> {
        let models = self.config.models_dir();
        let name = artifact.file_name().ok_or_else(|| {
            PrintlineError::Protocol(format!("result path has no file name: {artifact}"))
        })?;
        let local = models.join(&name);
        self.worker.copy(artifact, &local, PULL_TIMEOUT).await?;
        let size = tokio::fs::metadata(&local).await?.len();
        info!(local = %local.display(), bytes = size, "artifact pulled");

        if has_extension(&local, "zip") {
            let into = models.clone();
            return tokio::task::spawn_blocking(move || extract_model(&local, &into))
                .await
                .map_err(|e| PrintlineError::Protocol(format!("extraction task failed: {e}")))?;
        }
        if !is_model(&local) {
            return Err(PrintlineError::Protocol(format!(
                "unsupported result format: {name}"
            )));
        }
        Ok(local)
    }
}

fn print_message(outcome: &PrintOutcome) -> String {
    match outcome {
        PrintOutcome::Started(p) => {
            format!("✅ Print started! ETA: {} minutes", p.remaining_minutes)
        }
        other => other.summary(),
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}
