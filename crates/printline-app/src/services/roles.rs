// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Role wiring.
//
// The coordinator reaches the worker host over ssh and sends notifications
// through the relay installed there.  The worker runs next to the scanner and
// the relay, so it uses the local transport for both.  The watcher launches
// the coordinator binary installed alongside itself.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use printline_core::PipelineConfig;
use printline_core::error::Result;
use printline_core::types::{PipelineRun, RunOutcome};
use printline_pipeline::singleton::{self, DEFAULT_SETTLE};
use printline_pipeline::{
    CloudClient, CommandNotifier, Coordinator, LocalTransport, MeshTools, NetworkPrinter,
    NetworkProbe, Notifier, ProcessLauncher, SingletonGuard, SmbImageSource, SshTransport,
    SystemProcesses, Transport, Watcher, Worker,
};

/// A process role: marker name plus the executable name other instances of
/// it run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Role {
    pub name: &'static str,
    pub signature: &'static str,
}

pub const COORDINATOR: Role = Role {
    name: "coordinator",
    signature: "printline",
};

pub const WORKER: Role = Role {
    name: "worker",
    signature: "printline-worker",
};

pub const WATCHER: Role = Role {
    name: "watcher",
    signature: "printline-watch",
};

pub fn load_config(path: &Path) -> Result<Arc<PipelineConfig>> {
    let config = PipelineConfig::from_file(path)?;
    info!(config = %path.display(), state_dir = %config.state_dir.display(), "config loaded");
    Ok(Arc::new(config))
}

/// Terminate older instances of `role` and write this process's marker.
pub async fn claim(role: Role, config: &PipelineConfig) -> Result<SingletonGuard> {
    singleton::acquire(
        role.name,
        role.signature,
        &config.state_dir,
        &SystemProcesses,
        DEFAULT_SETTLE,
    )
    .await
}

pub fn coordinator(config: Arc<PipelineConfig>, verbose: bool) -> Coordinator {
    let worker: Arc<dyn Transport> = Arc::new(SshTransport::new(
        config.worker_host.clone(),
        config.worker_user.clone(),
    ));
    let notifier = notifier(Arc::clone(&worker), &config);
    let mesh = MeshTools::new(Arc::new(LocalTransport), &config);
    let printer = Arc::new(NetworkPrinter::new(Arc::clone(&config)));
    Coordinator::new(config, worker, mesh, printer, notifier).verbose(verbose)
}

pub fn worker(config: Arc<PipelineConfig>) -> Result<Worker> {
    let local: Arc<dyn Transport> = Arc::new(LocalTransport);
    let cloud = Arc::new(CloudClient::new(&config)?);
    let source = Arc::new(SmbImageSource::new(Arc::clone(&local), &config));
    let notifier = notifier(local, &config);
    Ok(Worker::new(
        config,
        Arc::new(NetworkProbe::default()),
        source,
        cloud,
        notifier,
    ))
}

pub fn watcher(config: Arc<PipelineConfig>, verbose: bool) -> Result<Watcher> {
    let exe = std::env::current_exe()?;
    let config_path = std::fs::canonicalize(&config.source_path)
        .unwrap_or_else(|_| config.source_path.clone());
    let launcher = ProcessLauncher {
        bin: sibling_bin(&exe, COORDINATOR.signature),
        config_path,
        verbose,
    };
    info!(bin = %launcher.bin.display(), "runs will be launched with");

    let local: Arc<dyn Transport> = Arc::new(LocalTransport);
    let source = Arc::new(SmbImageSource::new(Arc::clone(&local), &config));
    let notifier = notifier(local, &config);
    Ok(Watcher::new(
        config,
        Arc::new(NetworkProbe::default()),
        source,
        Arc::new(launcher),
        notifier,
    ))
}

fn notifier(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Arc<dyn Notifier> {
    Arc::new(CommandNotifier::new(
        transport,
        config.notify_bin.clone(),
        config.notify_target.clone(),
    ))
}

/// `name` in the same directory as `exe`.
pub fn sibling_bin(exe: &Path, name: &str) -> PathBuf {
    match exe.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(name),
        _ => PathBuf::from(name),
    }
}

/// Log the run's outcome and map it to the process exit status.
pub fn report(role: Role, run: &PipelineRun) -> ExitCode {
    let stages = run.stages.len();
    match &run.outcome {
        Some(RunOutcome::Succeeded) => {
            info!(role = role.name, run = %run.id, label = ?run.label, stages, "run succeeded");
            ExitCode::SUCCESS
        }
        Some(RunOutcome::FailedAt { stage, message }) => {
            error!(role = role.name, run = %run.id, stage = %stage, "run failed: {message}");
            ExitCode::FAILURE
        }
        None => {
            error!(role = role.name, run = %run.id, "run ended without an outcome");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_use_distinct_markers_and_signatures() {
        let roles = [COORDINATOR, WORKER, WATCHER];
        for (i, a) in roles.iter().enumerate() {
            for b in &roles[i + 1..] {
                assert_ne!(a.name, b.name);
                assert_ne!(a.signature, b.signature);
            }
        }
    }

    #[test]
    fn coordinator_is_found_next_to_the_watcher() {
        assert_eq!(
            sibling_bin(Path::new("/opt/printline/bin/printline-watch"), "printline"),
            PathBuf::from("/opt/printline/bin/printline")
        );
        assert_eq!(
            sibling_bin(Path::new("printline-watch"), "printline"),
            PathBuf::from("printline")
        );
    }

    #[test]
    fn only_success_exits_zero() {
        let mut run = PipelineRun::new(Some("A".into()));
        run.finish(RunOutcome::Succeeded);
        assert_eq!(report(COORDINATOR, &run), ExitCode::SUCCESS);

        let mut failed = PipelineRun::new(None);
        failed.finish(RunOutcome::FailedAt {
            stage: "Slice".into(),
            message: "orca-slicer exited 1".into(),
        });
        assert_eq!(report(WORKER, &failed), ExitCode::FAILURE);
        assert_eq!(report(WORKER, &PipelineRun::new(None)), ExitCode::FAILURE);
    }

    #[test]
    fn worker_needs_a_cloud_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "OSC_TOKEN=\n").unwrap();
        let config = load_config(&path).unwrap();
        assert!(worker(config).is_err());
    }

    #[test]
    fn coordinator_passes_verbosity_to_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "PI_PIPELINE_DIR=/srv/p\n").unwrap();
        let config = load_config(&path).unwrap();
        assert!(coordinator(config, true).worker_command(None).ends_with(" -v"));
    }
}
