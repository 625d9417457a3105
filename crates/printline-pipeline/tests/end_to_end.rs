// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Both halves of a run, wired together the way the coordinator sees the
// worker: the worker's stdout is replayed through the coordinator's
// transport.

mod common;

use std::sync::Arc;

use common::{
    FakeCloud, FakeImageSource, FakePrinter, FakeProbe, RecordingNotifier, ReplayTransport,
    ToolTransport, config_in,
};
use printline_pipeline::{Coordinator, MeshTools, Worker};

#[tokio::test]
async fn newest_scan_label_flows_to_the_printer() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_in(dir.path(), ""));

    // Worker half.
    let source = Arc::new(FakeImageSource::with_scans(&["A", "B"]));
    let cloud = Arc::new(FakeCloud::done_after(2));
    let worker_notes = Arc::new(RecordingNotifier::default());
    let worker = Worker::new(
        Arc::clone(&config),
        Arc::new(FakeProbe::found("192.168.1.50")),
        source.clone(),
        cloud.clone(),
        worker_notes.clone(),
    );

    let mut stdout = Vec::<u8>::new();
    let worker_run = worker.run(None, &mut stdout).await;
    assert!(worker_run.succeeded(), "{:?}", worker_run.outcome);
    assert_eq!(worker_run.label.as_deref(), Some("B"));
    assert_eq!(*source.fetched.lock().unwrap(), vec!["B"]);
    assert!(
        cloud
            .projects
            .lock()
            .unwrap()
            .iter()
            .all(|p| p.ends_with("-B-OSC.zip"))
    );

    let stdout = String::from_utf8(stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "PROJECT=B");
    assert!(lines[1].starts_with("RESULT_PATH="));
    assert!(lines[1].ends_with("-B-OSC_result.zip"));

    // Coordinator half, with worker output interleaved with noise.
    let mut replay = vec!["Fetching scan B...".to_owned()];
    replay.extend(lines.iter().map(|l| l.to_string()));
    replay.push("done".to_owned());
    let transport = Arc::new(ReplayTransport::new(replay, 0));
    let tools = Arc::new(ToolTransport::new(&config.local_dir));
    let printer = Arc::new(FakePrinter::default());
    let notes = Arc::new(RecordingNotifier::default());

    let run = Coordinator::new(
        Arc::clone(&config),
        transport.clone(),
        MeshTools::new(tools.clone(), &config),
        printer.clone(),
        notes.clone(),
    )
    .run(None)
    .await;

    assert!(run.succeeded(), "{:?}", run.outcome);
    assert_eq!(run.label.as_deref(), Some("B"));
    assert_eq!(
        run.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        [
            "Worker (discover → reconstruct)",
            "Pull from worker",
            "Mesh simplification",
            "Slice",
            "Print",
        ]
    );
    assert!(!transport.commands()[0].contains("--project"));

    let commands = tools.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].contains("--inm /data/models/model.obj"));
    assert!(commands[0].contains("--outm /data/models/B_decimated.stl"));
    assert!(commands[1].contains("B_decimated.stl --export-3mf"));

    let jobs = printer.jobs.lock().unwrap().clone();
    assert_eq!(jobs, vec![config.models_dir().join("B.3mf")]);

    let messages = notes.messages();
    assert_eq!(messages.first().map(String::as_str), Some("Pipeline starting..."));
    assert!(messages.iter().any(|m| m == "✅ Print started! ETA: 95 minutes"));
    let completed: Vec<&String> = messages.iter().filter(|m| m.starts_with("✓ ")).collect();
    assert_eq!(completed.len(), 5);
    assert!(completed[3].starts_with("✓ Slice completed in "));
    assert!(
        messages
            .last()
            .is_some_and(|m| m.starts_with("✅ Pipeline complete for 'B' in "))
    );
    assert!(notes.errors().is_empty());
}

#[tokio::test]
async fn requested_label_wins_over_newest() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_in(dir.path(), ""));
    let source = Arc::new(FakeImageSource::with_scans(&["A", "B"]));
    let worker = Worker::new(
        Arc::clone(&config),
        Arc::new(FakeProbe::found("192.168.1.50")),
        source.clone(),
        Arc::new(FakeCloud::done_after(1)),
        Arc::new(RecordingNotifier::default()),
    );

    let mut stdout = Vec::<u8>::new();
    let run = worker.run(Some("A"), &mut stdout).await;
    assert!(run.succeeded(), "{:?}", run.outcome);
    assert_eq!(*source.fetched.lock().unwrap(), vec!["A"]);
    assert!(String::from_utf8(stdout).unwrap().starts_with("PROJECT=A\n"));
}

#[tokio::test]
async fn missing_scanner_fails_discovery_without_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_in(dir.path(), ""));
    let notes = Arc::new(RecordingNotifier::default());
    let worker = Worker::new(
        config,
        Arc::new(FakeProbe::absent()),
        Arc::new(FakeImageSource::with_scans(&["A"])),
        Arc::new(FakeCloud::done_after(1)),
        notes.clone(),
    );

    let mut stdout = Vec::<u8>::new();
    let run = worker.run(None, &mut stdout).await;
    assert!(!run.succeeded());
    assert!(stdout.is_empty());
    assert_eq!(notes.errors().len(), 1);
    assert!(notes.errors()[0].starts_with("Discover scanner failed after "));
}

#[tokio::test]
async fn empty_scanner_is_an_image_source_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_in(dir.path(), ""));
    let notes = Arc::new(RecordingNotifier::default());
    let worker = Worker::new(
        config,
        Arc::new(FakeProbe::found("10.0.0.2")),
        Arc::new(FakeImageSource::with_scans(&[])),
        Arc::new(FakeCloud::done_after(1)),
        notes.clone(),
    );

    let run = worker.run(None, &mut Vec::<u8>::new()).await;
    assert!(!run.succeeded());
    assert!(notes.errors()[0].contains("no scans found"));
}

#[tokio::test]
async fn pre_sliced_job_goes_straight_to_the_printer() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_in(dir.path(), ""));
    let job = dir.path().join("benchy.3mf");
    std::fs::write(&job, b"PK fake 3mf").unwrap();

    let worker = Arc::new(ReplayTransport::new(Vec::<String>::new(), 0));
    let tools = Arc::new(ToolTransport::new(&config.local_dir));
    let printer = Arc::new(FakePrinter::default());
    let notes = Arc::new(RecordingNotifier::default());

    let run = Coordinator::new(
        Arc::clone(&config),
        worker.clone(),
        MeshTools::new(tools.clone(), &config),
        printer.clone(),
        notes.clone(),
    )
    .print_file(&job)
    .await;

    assert!(run.succeeded(), "{:?}", run.outcome);
    assert_eq!(run.label.as_deref(), Some("benchy"));
    assert_eq!(
        run.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        ["Print"]
    );
    assert!(worker.commands().is_empty());
    assert!(tools.commands().is_empty());
    assert_eq!(*printer.jobs.lock().unwrap(), vec![job]);
    assert_eq!(
        notes.messages().last().map(String::as_str),
        Some("✅ Print started! ETA: 95 minutes")
    );
}

#[tokio::test]
async fn missing_pre_sliced_job_fails_the_print_stage() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_in(dir.path(), ""));
    let tools = Arc::new(ToolTransport::new(&config.local_dir));
    let printer = Arc::new(FakePrinter::default());
    let notes = Arc::new(RecordingNotifier::default());

    let run = Coordinator::new(
        Arc::clone(&config),
        Arc::new(ReplayTransport::new(Vec::<String>::new(), 0)),
        MeshTools::new(tools, &config),
        printer.clone(),
        notes.clone(),
    )
    .print_file(&dir.path().join("absent.3mf"))
    .await;

    assert!(!run.succeeded());
    assert!(printer.jobs.lock().unwrap().is_empty());
    assert_eq!(notes.errors().len(), 1);
    assert!(notes.errors()[0].starts_with("Print failed after "));
    assert!(notes.errors()[0].contains("file not found"));
}
