// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Uniform stage wrapper.
//
// Every stage is timed and logged, and its completion is relayed.  On
// failure the error is flattened into a single line naming the stage and the
// elapsed seconds, sent to the notification relay, recorded as the run's
// outcome and returned.  Stages are never retried.

use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{Level, debug, error, info};

use printline_core::error::{PrintlineError, Result};
use printline_core::types::{PipelineRun, PrintOutcome, ResultArtifact, RunOutcome, StageRecord};

use crate::notify::Notifier;

/// What a stage hands on, as far as bookkeeping is concerned.
pub trait StageOutput {
    /// Human-readable rendering for the stage record.
    fn describe(&self) -> Option<String>;

    /// Local file to fingerprint in debug logs.
    fn local_file(&self) -> Option<&Path> {
        None
    }
}

impl StageOutput for PathBuf {
    fn describe(&self) -> Option<String> {
        Some(self.display().to_string())
    }

    fn local_file(&self) -> Option<&Path> {
        Some(self)
    }
}

impl StageOutput for IpAddr {
    fn describe(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl StageOutput for ResultArtifact {
    fn describe(&self) -> Option<String> {
        Some(self.to_string())
    }

    fn local_file(&self) -> Option<&Path> {
        self.local_path().map(PathBuf::as_path)
    }
}

impl StageOutput for PrintOutcome {
    fn describe(&self) -> Option<String> {
        Some(self.summary())
    }
}

/// Flatten `message` to one line.
pub fn single_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sequences the stages of one run.
pub struct StageRunner<'a> {
    run: PipelineRun,
    notifier: &'a dyn Notifier,
}

impl<'a> StageRunner<'a> {
    pub fn new(run: PipelineRun, notifier: &'a dyn Notifier) -> Self {
        Self { run, notifier }
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    pub fn label(&self) -> Option<&str> {
        self.run.label.as_deref()
    }

    /// Fix the project label once a stage has chosen one.
    pub fn set_label(&mut self, label: impl Into<String>) {
        let label = label.into();
        if !label.is_empty() {
            self.run.label = Some(label);
        }
    }

    pub fn notifier(&self) -> &'a dyn Notifier {
        self.notifier
    }

    /// Run one stage under the wrapper.
    pub async fn stage<T, Fut>(&mut self, name: &str, work: Fut) -> Result<T>
    where
        T: StageOutput,
        Fut: Future<Output = Result<T>>,
    {
        info!(run = %self.run.id, stage = name, "STEP: {name}");
        let started = Instant::now();

        match work.await {
            Ok(output) => {
                let elapsed = started.elapsed();
                let line = format!("✓ {name} completed in {}s", elapsed.as_secs());
                info!(stage = name, secs = elapsed.as_secs(), "{line}");
                if let Some(path) = output.local_file() {
                    fingerprint(name, path);
                }
                self.notifier.info(&line).await;
                self.run.record(StageRecord {
                    name: name.to_owned(),
                    elapsed,
                    artifact: output.describe(),
                });
                Ok(output)
            }
            Err(e) => {
                let failure = PrintlineError::Stage {
                    stage: name.to_owned(),
                    elapsed_secs: started.elapsed().as_secs(),
                    message: single_line(&e.to_string()),
                };
                let line = failure.to_string();
                error!(stage = name, "✗ {line}");
                self.notifier.error(&line).await;
                self.run.finish(RunOutcome::FailedAt {
                    stage: name.to_owned(),
                    message: line,
                });
                Err(failure)
            }
        }
    }

    /// Close the run.  A run that already failed keeps its outcome.
    pub fn finish(mut self) -> PipelineRun {
        if self.run.outcome.is_none() {
            self.run.finish(RunOutcome::Succeeded);
        }
        self.run
    }

    /// Close the run after an error raised outside any stage.
    pub fn abort(mut self, err: &PrintlineError) -> PipelineRun {
        if self.run.outcome.is_none() {
            self.run.finish(RunOutcome::FailedAt {
                stage: "setup".to_owned(),
                message: single_line(&err.to_string()),
            });
        }
        self.run
    }
}

fn fingerprint(stage: &str, path: &Path) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    match printline_security::hash_file(path) {
        Ok(sha256) => debug!(stage, artifact = %path.display(), %sha256, "artifact fingerprint"),
        Err(e) => debug!(stage, artifact = %path.display(), error = %e, "cannot fingerprint"),
    }
}
