// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printline Pipeline: the staged job runner.  One process per role
// (coordinator, worker, watcher), stages run strictly in order, cross-host
// results come back as sentinel lines, and every failure is terminal.

pub mod coordinator;
pub mod image_source;
pub mod mesh;
pub mod notify;
pub mod printer;
pub mod probe;
pub mod reconstruction;
pub mod sentinel;
pub mod singleton;
pub mod stage;
pub mod transport;
pub mod watcher;
pub mod worker;

pub use coordinator::Coordinator;
pub use image_source::{ImageSource, ScanEntry, SmbImageSource};
pub use mesh::MeshTools;
pub use notify::{CommandNotifier, Notifier, Severity};
pub use printer::{NetworkPrinter, PrintStation};
pub use probe::{ApplianceProbe, NetworkProbe};
pub use reconstruction::{CloudClient, ReconstructionApi};
pub use sentinel::{Handoff, SentinelScanner};
pub use singleton::{ProcessRegistry, SingletonGuard, SystemProcesses};
pub use stage::StageRunner;
pub use transport::{ExecSession, LocalTransport, SshTransport, Transport};
pub use watcher::{Launcher, ProcessLauncher, Watcher};
pub use worker::Worker;
