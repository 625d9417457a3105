// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One live process per role.
//
// Policy is "last writer wins": a new coordinator (or worker, or watcher)
// kills every other process running under the same role, waits briefly, and
// records itself in `<state_dir>/.printline-<role>.pid`.  The marker is
// advisory.  Races between listing and killing are tolerated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tracing::{debug, info, warn};

use printline_core::error::{PrintlineError, Result};

/// Pause after killing stale processes.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Access to the host's process table.
pub trait ProcessRegistry: Send + Sync {
    /// Identity of the calling process.
    fn current(&self) -> u32;

    /// Identity of the calling process's parent, if known.
    fn parent(&self) -> Option<u32>;

    /// Live processes whose executable matches `signature`.
    fn find(&self, signature: &str) -> Vec<u32>;

    /// Hard-kill `pid`.  Returns `false` when it could not be signalled.
    fn kill(&self, pid: u32) -> bool;
}

/// The real process table, via `sysinfo`.
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl SystemProcesses {
    fn snapshot() -> System {
        let mut sys = System::new();
        sys.refresh_processes();
        sys
    }
}

/// Whether `argv0` names the executable `signature`.  The kernel truncates
/// process names, so the full first argument is compared by file name.
pub fn matches_signature(argv0: &str, signature: &str) -> bool {
    Path::new(argv0)
        .file_name()
        .is_some_and(|name| name == signature)
}

impl ProcessRegistry for SystemProcesses {
    fn current(&self) -> u32 {
        std::process::id()
    }

    fn parent(&self) -> Option<u32> {
        let sys = Self::snapshot();
        sys.process(Pid::from_u32(self.current()))
            .and_then(|p| p.parent())
            .map(|p| p.as_u32())
    }

    fn find(&self, signature: &str) -> Vec<u32> {
        Self::snapshot()
            .processes()
            .iter()
            .filter(|(_, p)| {
                p.cmd()
                    .first()
                    .is_some_and(|argv0| matches_signature(argv0, signature))
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn kill(&self, pid: u32) -> bool {
        Self::snapshot()
            .process(Pid::from_u32(pid))
            .is_some_and(|p| p.kill())
    }
}

/// Marker file for `role`.
pub fn marker_path(state_dir: &Path, role: &str) -> PathBuf {
    state_dir.join(format!(".printline-{role}.pid"))
}

/// Holds the role until dropped.  Dropping removes the marker only if it
/// still names this process.
#[derive(Debug)]
pub struct SingletonGuard {
    path: PathBuf,
    pid: u32,
}

impl SingletonGuard {
    pub fn marker(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner.trim() == self.pid.to_string() => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    debug!(marker = %self.path.display(), error = %e, "cannot remove marker");
                }
            }
            Ok(owner) => {
                debug!(owner = owner.trim(), "marker taken over, leaving it");
            }
            Err(_) => {}
        }
    }
}

/// Claim `role`: kill every other process matching `signature` (sparing this
/// process and its parent), pause for `settle`, then write the marker.
pub async fn acquire(
    role: &str,
    signature: &str,
    state_dir: &Path,
    registry: &dyn ProcessRegistry,
    settle: Duration,
) -> Result<SingletonGuard> {
    let me = registry.current();
    let parent = registry.parent();

    let mut killed = 0usize;
    for pid in registry.find(signature) {
        if pid == me || Some(pid) == parent {
            continue;
        }
        warn!(role, pid, "killing previous instance");
        if registry.kill(pid) {
            killed += 1;
        } else {
            debug!(pid, "kill failed (already gone or not permitted)");
        }
    }
    if killed > 0 {
        tokio::time::sleep(settle).await;
    }

    let path = marker_path(state_dir, role);
    std::fs::create_dir_all(state_dir).map_err(|e| {
        PrintlineError::Singleton(format!("cannot create {}: {e}", state_dir.display()))
    })?;
    std::fs::write(&path, me.to_string()).map_err(|e| {
        PrintlineError::Singleton(format!("cannot write {}: {e}", path.display()))
    })?;
    info!(role, pid = me, killed, "singleton enforced");

    Ok(SingletonGuard { path, pid: me })
}
