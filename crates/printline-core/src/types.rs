// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printline pipeline.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a discovery attempt.  Absence is a normal answer, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Located {
    Found(IpAddr),
    NotFound,
}

impl Located {
    pub fn address(&self) -> Option<IpAddr> {
        match self {
            Self::Found(ip) => Some(*ip),
            Self::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

impl From<Option<IpAddr>> for Located {
    fn from(value: Option<IpAddr>) -> Self {
        value.map_or(Self::NotFound, Self::Found)
    }
}

/// Process-local identity of a pipeline run.  Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

impl RunId {
    /// Allocate the next identity.  Strictly increasing within a process.
    pub fn next() -> Self {
        Self(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// The single value handed from one stage to the next.
///
/// Ownership moves completely at each stage boundary: intermediate files of
/// the producer may be gone once the consumer has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultArtifact {
    /// A path on the host running this process.
    Local(PathBuf),
    /// A path on another host.
    Remote { host: String, user: String, path: String },
}

impl ResultArtifact {
    pub fn local_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Local(path) => Some(path),
            Self::Remote { .. } => None,
        }
    }

    /// Final path component, whichever host it lives on.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Local(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            Self::Remote { path, .. } => path
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .map(str::to_owned),
        }
    }
}

impl fmt::Display for ResultArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote { host, user, path } => write!(f, "{user}@{host}:{path}"),
        }
    }
}

/// One completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub elapsed: Duration,
    /// Human-readable rendering of what the stage handed on.
    pub artifact: Option<String>,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Succeeded,
    FailedAt { stage: String, message: String },
}

/// One execution attempt of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    /// User-supplied, or filled in by the fetch stage.
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
    /// `None` while the run is in flight.
    pub outcome: Option<RunOutcome>,
}

impl PipelineRun {
    pub fn new(label: Option<String>) -> Self {
        Self {
            id: RunId::next(),
            label: label.filter(|l| !l.is_empty()),
            started_at: Utc::now(),
            stages: Vec::new(),
            outcome: None,
        }
    }

    pub fn record(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(RunOutcome::Succeeded))
    }
}

/// Job lifecycle as reported by the printer.  The vocabulary is owned by the
/// device firmware; unknown values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterJobState {
    Idle,
    Prepare,
    Running,
    Pause,
    Finish,
    Failed,
    Other(String),
}

impl PrinterJobState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Self::Idle,
            "PREPARE" | "PREPARING" => Self::Prepare,
            "RUNNING" => Self::Running,
            "PAUSE" | "PAUSED" => Self::Pause,
            "FINISH" | "FINISHED" => Self::Finish,
            "FAILED" => Self::Failed,
            _ => Self::Other(raw.trim().to_owned()),
        }
    }

    /// Whether the device has taken the job on.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Prepare | Self::Running)
    }
}

impl fmt::Display for PrinterJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Prepare => "PREPARE",
            Self::Running => "RUNNING",
            Self::Pause => "PAUSE",
            Self::Finish => "FINISH",
            Self::Failed => "FAILED",
            Self::Other(raw) => raw,
        };
        f.write_str(s)
    }
}

/// Progress fields pulled from a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub state: PrinterJobState,
    pub percent: u32,
    pub remaining_minutes: u32,
}

/// How the deposit+start interaction with the printer ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintOutcome {
    /// The device reported an accepted/running state.
    Started(JobProgress),
    /// Firmware demands signed control messages; the file is on the device
    /// and waits for a manual start.
    DepositedOnly { file: String },
    /// The observation window closed without an accepted state.
    Unconfirmed { last: Option<JobProgress> },
}

impl PrintOutcome {
    /// One-line summary suitable for a notification.
    pub fn summary(&self) -> String {
        match self {
            Self::Started(p) => format!(
                "Print started ({}), ETA: {} minutes",
                p.state, p.remaining_minutes
            ),
            Self::DepositedOnly { file } => format!(
                "File {file} deposited on printer; firmware requires signed commands, start it from the touchscreen"
            ),
            Self::Unconfirmed { last: Some(p) } => {
                format!("Print command sent, last status: {}", p.state)
            }
            Self::Unconfirmed { last: None } => {
                "Print command sent, status unknown".to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_increase() {
        let a = RunId::next();
        let b = RunId::next();
        assert!(b > a);
    }

    #[test]
    fn empty_label_is_none() {
        let run = PipelineRun::new(Some(String::new()));
        assert_eq!(run.label, None);
        assert!(run.outcome.is_none());
    }

    #[test]
    fn job_state_parsing_is_case_insensitive() {
        assert_eq!(PrinterJobState::parse("running"), PrinterJobState::Running);
        assert_eq!(PrinterJobState::parse("PREPARE"), PrinterJobState::Prepare);
        assert!(PrinterJobState::parse("Prepare").is_accepted());
        assert!(!PrinterJobState::parse("IDLE").is_accepted());
        assert_eq!(
            PrinterJobState::parse("SLICING"),
            PrinterJobState::Other("SLICING".into())
        );
    }

    #[test]
    fn remote_artifact_file_name() {
        let art = ResultArtifact::Remote {
            host: "pi".into(),
            user: "me".into(),
            path: "/data/results/x_result.zip".into(),
        };
        assert_eq!(art.file_name().as_deref(), Some("x_result.zip"));
        assert_eq!(art.to_string(), "me@pi:/data/results/x_result.zip");
    }

    #[test]
    fn located_from_option() {
        assert_eq!(Located::from(None), Located::NotFound);
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(Located::from(Some(ip)).address(), Some(ip));
    }
}
