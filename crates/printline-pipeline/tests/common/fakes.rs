// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Deterministic stand-ins for every collaborator the pipeline talks to.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use printline_core::error::{PrintlineError, Result};
use printline_core::types::{JobProgress, Located, PrintOutcome, PrinterJobState, ResultArtifact};
use printline_pipeline::image_source::{FetchedScan, ImageSource, ScanEntry, collect_images};
use printline_pipeline::notify::{Notifier, Severity};
use printline_pipeline::printer::PrintStation;
use printline_pipeline::probe::ApplianceProbe;
use printline_pipeline::reconstruction::{ProjectInfo, ReconstructionApi, TokenInfo};
use printline_pipeline::singleton::ProcessRegistry;
use printline_pipeline::transport::{ExecSession, Transport};
use printline_pipeline::watcher::Launcher;

// -- Process table -----------------------------------------------------------

/// A shared fake process table.  Each handle acts as one process in it.
#[derive(Clone)]
pub struct FakeRegistry {
    live: Arc<Mutex<BTreeSet<u32>>>,
    me: u32,
    parent: Option<u32>,
    pub kills: Arc<Mutex<Vec<u32>>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            live: Arc::default(),
            me: 0,
            parent: None,
            kills: Arc::default(),
        }
    }

    /// A handle for process `pid` (started with `parent`), now live.
    pub fn process(&self, pid: u32, parent: Option<u32>) -> Self {
        self.live.lock().unwrap().insert(pid);
        Self {
            me: pid,
            parent,
            ..self.clone()
        }
    }

    pub fn live(&self) -> BTreeSet<u32> {
        self.live.lock().unwrap().clone()
    }
}

impl ProcessRegistry for FakeRegistry {
    fn current(&self) -> u32 {
        self.me
    }

    fn parent(&self) -> Option<u32> {
        self.parent
    }

    fn find(&self, _signature: &str) -> Vec<u32> {
        self.live.lock().unwrap().iter().copied().collect()
    }

    fn kill(&self, pid: u32) -> bool {
        self.kills.lock().unwrap().push(pid);
        self.live.lock().unwrap().remove(&pid)
    }
}

// -- Notifications -----------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == Severity::Error)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, severity: Severity, message: &str) {
        self.sent.lock().unwrap().push((severity, message.to_owned()));
    }
}

// -- Appliance probe ---------------------------------------------------------

pub struct FakeProbe {
    pub located: Located,
    pub port_open: bool,
    pub lookups: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn found(ip: &str) -> Self {
        Self {
            located: Located::Found(ip.parse().unwrap()),
            port_open: true,
            lookups: Mutex::default(),
        }
    }

    pub fn absent() -> Self {
        Self {
            located: Located::NotFound,
            port_open: false,
            lookups: Mutex::default(),
        }
    }
}

#[async_trait]
impl ApplianceProbe for FakeProbe {
    async fn locate(&self, hostname: &str) -> Located {
        self.lookups.lock().unwrap().push(hostname.to_owned());
        self.located
    }

    async fn verify_control_port(&self, _address: IpAddr) -> bool {
        self.port_open
    }
}

// -- Image source ------------------------------------------------------------

/// Lists fixed scans; fetching writes two small images.
pub struct FakeImageSource {
    pub scans: Mutex<Vec<ScanEntry>>,
    pub fetched: Mutex<Vec<String>>,
    pub fail_listing: bool,
}

impl FakeImageSource {
    /// Scans named `names`, each one minute newer than the previous.
    pub fn with_scans(names: &[&str]) -> Self {
        Self {
            scans: Mutex::new(names.iter().enumerate().map(|(i, n)| scan(n, i as u32)).collect()),
            fetched: Mutex::default(),
            fail_listing: false,
        }
    }

    pub fn add(&self, name: &str) {
        let mut scans = self.scans.lock().unwrap();
        let minute = scans.len() as u32;
        scans.push(scan(name, minute));
    }
}

fn scan(name: &str, minute: u32) -> ScanEntry {
    ScanEntry {
        name: name.to_owned(),
        is_dir: true,
        modified: chrono::NaiveDate::from_ymd_opt(2024, 1, 9)
            .and_then(|d| d.and_hms_opt(10, minute, 0)),
    }
}

#[async_trait]
impl ImageSource for FakeImageSource {
    async fn list_scans(&self, _host: IpAddr) -> Result<Vec<ScanEntry>> {
        if self.fail_listing {
            return Err(PrintlineError::ImageSource("smbclient exited with code 1".into()));
        }
        Ok(self.scans.lock().unwrap().clone())
    }

    async fn fetch(&self, _host: IpAddr, label: &str, scans_dir: &Path) -> Result<FetchedScan> {
        self.fetched.lock().unwrap().push(label.to_owned());
        let image_dir = scans_dir.join(label);
        std::fs::create_dir_all(&image_dir)?;
        for name in ["IMG_0001.jpg", "IMG_0002.jpg"] {
            std::fs::write(image_dir.join(name), format!("{label}/{name}"))?;
        }
        Ok(FetchedScan {
            label: label.to_owned(),
            images: collect_images(&image_dir)?,
            image_dir,
        })
    }
}

// -- Reconstruction service --------------------------------------------------

/// Reports `processing` until `done_after` status polls, then `done`.
pub struct FakeCloud {
    pub done_after: usize,
    pub polls: AtomicUsize,
    pub projects: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<PathBuf>>,
    pub links: usize,
}

impl FakeCloud {
    pub fn done_after(polls: usize) -> Self {
        Self {
            done_after: polls,
            polls: AtomicUsize::new(0),
            projects: Mutex::default(),
            uploads: Mutex::default(),
            links: 1,
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReconstructionApi for FakeCloud {
    async fn token_info(&self) -> Result<TokenInfo> {
        Ok(serde_json::from_value(serde_json::json!({ "credit": 10 }))?)
    }

    async fn create_project(&self, project: &str, _photos: usize, _parts: usize, _filesize: u64) -> Result<Vec<String>> {
        self.projects.lock().unwrap().push(project.to_owned());
        Ok((0..self.links).map(|i| format!("http://cloud.test/upload/{i}")).collect())
    }

    async fn upload_part(&self, _link: &str, part: &Path) -> Result<()> {
        self.uploads.lock().unwrap().push(part.to_path_buf());
        Ok(())
    }

    async fn start_project(&self, project: &str) -> Result<()> {
        self.projects.lock().unwrap().push(project.to_owned());
        Ok(())
    }

    async fn project_info(&self, project: &str) -> Result<ProjectInfo> {
        self.projects.lock().unwrap().push(project.to_owned());
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(if n >= self.done_after {
            ProjectInfo {
                status: "done".into(),
                dlink: "http://cloud.test/dl/abc/result.zip".into(),
            }
        } else {
            ProjectInfo {
                status: "processing".into(),
                dlink: String::new(),
            }
        })
    }

    async fn queue_estimate(&self) -> Option<Value> {
        None
    }

    async fn download(&self, _link: &str, dest: &Path) -> Result<u64> {
        let mut zip = zip::ZipWriter::new(std::fs::File::create(dest)?);
        let opts = zip::write::SimpleFileOptions::default();
        zip.start_file("texture.jpg", opts)
            .map_err(|e| PrintlineError::Reconstruction(e.to_string()))?;
        zip.write_all(b"jpg")?;
        zip.start_file("model.obj", opts)
            .map_err(|e| PrintlineError::Reconstruction(e.to_string()))?;
        zip.write_all(b"v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n")?;
        zip.finish()
            .map_err(|e| PrintlineError::Reconstruction(e.to_string()))?;
        Ok(std::fs::metadata(dest)?.len())
    }
}

// -- Transports --------------------------------------------------------------

/// Replays fixed output for every command; copies read the remote path from
/// the local filesystem.
pub struct ReplayTransport {
    pub lines: Vec<String>,
    pub exit_code: i32,
    pub commands: Mutex<Vec<String>>,
    pub copies: Mutex<Vec<String>>,
}

impl ReplayTransport {
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = S>, exit_code: i32) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            exit_code,
            commands: Mutex::default(),
            copies: Mutex::default(),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecSession> {
        self.commands.lock().unwrap().push(command.to_owned());
        Ok(ExecSession::scripted(self.lines.clone(), self.exit_code))
    }

    async fn copy(&self, src: &ResultArtifact, dst: &Path, _timeout: Duration) -> Result<()> {
        self.copies.lock().unwrap().push(src.to_string());
        let path = match src {
            ResultArtifact::Local(p) => p.clone(),
            ResultArtifact::Remote { path, .. } => PathBuf::from(path),
        };
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&path, dst)
            .map_err(|e| PrintlineError::Transport(format!("scp {src}: {e}")))?;
        Ok(())
    }
}

/// Stands in for docker and the slicer: records each command and creates
/// the output file it names.
pub struct ToolTransport {
    pub local_dir: PathBuf,
    pub commands: Mutex<Vec<String>>,
}

impl ToolTransport {
    pub fn new(local_dir: &Path) -> Self {
        Self {
            local_dir: local_dir.to_path_buf(),
            commands: Mutex::default(),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn output_of(&self, command: &str) -> Option<PathBuf> {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        let after = |flag: &str| {
            tokens
                .iter()
                .position(|t| *t == flag)
                .and_then(|i| tokens.get(i + 1))
                .map(|t| t.trim_matches('\''))
        };
        if let Some(inside) = after("--outm") {
            return inside
                .strip_prefix("/data/")
                .map(|rel| self.local_dir.join(rel));
        }
        after("--export-3mf").map(PathBuf::from)
    }
}

#[async_trait]
impl Transport for ToolTransport {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecSession> {
        self.commands.lock().unwrap().push(command.to_owned());
        if let Some(out) = self.output_of(command) {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, b"solid fake\nendsolid fake\n")?;
        }
        Ok(ExecSession::scripted(["Done"], 0))
    }

    async fn copy(&self, _src: &ResultArtifact, _dst: &Path, _timeout: Duration) -> Result<()> {
        Err(PrintlineError::Transport("tool transport does not copy".into()))
    }
}

// -- Printer -----------------------------------------------------------------

#[derive(Default)]
pub struct FakePrinter {
    pub jobs: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl PrintStation for FakePrinter {
    async fn deliver(&self, job: &Path) -> Result<PrintOutcome> {
        self.jobs.lock().unwrap().push(job.to_path_buf());
        Ok(PrintOutcome::Started(JobProgress {
            state: PrinterJobState::Running,
            percent: 0,
            remaining_minutes: 95,
        }))
    }
}

// -- Launcher ----------------------------------------------------------------

#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<String>>,
}

impl Launcher for RecordingLauncher {
    fn launch(&self, project: &str) -> Result<()> {
        self.launched.lock().unwrap().push(project.to_owned());
        Ok(())
    }
}
