// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transport adapter: run a command on a (possibly remote) host with its
// output streamed line by line, and copy a file between hosts.
//
// Remote hosts are reached with the system `ssh`/`scp` in batch mode, so key
// authentication must already be set up.  Every call carries an explicit
// timeout; a command that overruns it is killed and reported as a transport
// failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use printline_core::error::{PrintlineError, Result};
use printline_core::types::ResultArtifact;

/// Lines buffered between the process and the consumer.
const LINE_BUFFER: usize = 256;

/// A running command.  Lines from stdout and stderr arrive interleaved in the
/// order they were read; the exit status becomes available once the process
/// has ended.
pub struct ExecSession {
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Result<i32>>,
}

impl ExecSession {
    /// Next output line, or `None` once the process has closed its output.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for the exit code.  Output not yet consumed is read and dropped
    /// meanwhile, so a full line buffer cannot stall the process.
    pub async fn wait(self) -> Result<i32> {
        let Self { mut lines, mut exit } = self;
        let mut open = true;
        let status = loop {
            tokio::select! {
                status = &mut exit => break status,
                line = lines.recv(), if open => open = line.is_some(),
            }
        };
        status.map_err(|_| {
            PrintlineError::Transport("process supervisor ended without an exit status".into())
        })?
    }

    /// A session that replays `lines` and exits with `code`.  Used by fakes.
    pub fn scripted<I, S>(lines: I, code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // Capacity covers every line.
            let _ = tx.try_send(line);
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = exit_tx.send(Ok(code));
        Self {
            lines: rx,
            exit: exit_rx,
        }
    }
}

/// How stages reach a host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start `command` under a shell on the target host.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecSession>;

    /// Copy `src` to the local path `dst`.  Fails on any non-zero outcome; a
    /// partial `dst` may be left behind.
    async fn copy(&self, src: &ResultArtifact, dst: &Path, timeout: Duration) -> Result<()>;
}

/// Run `command` to completion, collecting its output.  For short commands
/// where streaming does not matter.
pub async fn run_collect(
    transport: &dyn Transport,
    command: &str,
    timeout: Duration,
) -> Result<(i32, Vec<String>)> {
    let mut session = transport.exec(command, timeout).await?;
    let mut lines = Vec::new();
    while let Some(line) = session.next_line().await {
        lines.push(line);
    }
    Ok((session.wait().await?, lines))
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+:=,@".contains(&b))
    {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Spawn `cmd` with piped output and supervise it for at most `timeout`.
fn spawn_session(mut cmd: Command, label: &str, timeout: Duration) -> Result<ExecSession> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| PrintlineError::Transport(format!("failed to spawn {label}: {e}")))?;

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, tx));
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let label = label.to_owned();
    tokio::spawn(async move {
        let result = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(status.code().unwrap_or(-1)),
            Ok(Err(e)) => Err(PrintlineError::Transport(format!("waiting for {label}: {e}"))),
            Err(_) => {
                warn!(command = %label, secs = timeout.as_secs(), "timed out, killing");
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "kill after timeout failed");
                }
                Err(PrintlineError::Transport(format!(
                    "{label} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };
        let _ = exit_tx.send(result);
    });

    Ok(ExecSession {
        lines: rx,
        exit: exit_rx,
    })
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "output stream ended with error");
                return;
            }
        }
    }
}

/// Copy with `scp` in batch mode.
async fn scp(src: &str, dst: &Path, timeout: Duration) -> Result<()> {
    let mut cmd = Command::new("scp");
    cmd.args(["-q", "-o", "BatchMode=yes", src])
        .arg(dst)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            PrintlineError::Transport(format!("scp {src} timed out after {}s", timeout.as_secs()))
        })?
        .map_err(|e| PrintlineError::Transport(format!("failed to run scp: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PrintlineError::Transport(format!(
            "scp {src} exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )))
    }
}

async fn copy_artifact(src: &ResultArtifact, dst: &Path, timeout: Duration) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match src {
        ResultArtifact::Local(path) => {
            tokio::fs::copy(path, dst).await.map_err(|e| {
                PrintlineError::Transport(format!("copy {} -> {}: {e}", path.display(), dst.display()))
            })?;
            Ok(())
        }
        remote @ ResultArtifact::Remote { .. } => scp(&remote.to_string(), dst, timeout).await,
    }
}

/// Runs commands on another host over `ssh`.
#[derive(Debug, Clone)]
pub struct SshTransport {
    pub host: String,
    pub user: String,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self), fields(host = %self.host))]
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecSession> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"])
            .arg(self.destination())
            .arg(command);
        spawn_session(cmd, &format!("ssh {}", self.destination()), timeout)
    }

    async fn copy(&self, src: &ResultArtifact, dst: &Path, timeout: Duration) -> Result<()> {
        copy_artifact(src, dst, timeout).await
    }
}

/// Runs commands on this host under `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecSession> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let label = command.split_whitespace().next().unwrap_or("sh").to_owned();
        spawn_session(cmd, &label, timeout)
    }

    async fn copy(&self, src: &ResultArtifact, dst: &Path, timeout: Duration) -> Result<()> {
        copy_artifact(src, dst, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_session_replays_lines_then_exit() {
        let mut session = ExecSession::scripted(["a", "b"], 3);
        assert_eq!(session.next_line().await.as_deref(), Some("a"));
        assert_eq!(session.next_line().await.as_deref(), Some("b"));
        assert_eq!(session.next_line().await, None);
        assert_eq!(session.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn local_exec_streams_stdout_and_stderr() {
        let (code, lines) = run_collect(
            &LocalTransport,
            "echo one; echo two 1>&2; exit 4",
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(code, 4);
        assert!(lines.contains(&"one".to_string()));
        assert!(lines.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn wait_without_reading_does_not_stall() {
        let session = LocalTransport
            .exec("seq 1 5000", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(session.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_exec_times_out() {
        let session = LocalTransport
            .exec("sleep 5", Duration::from_millis(100))
            .await
            .unwrap();
        let err = session.wait().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn local_copy_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("mesh.obj");
        std::fs::write(&src, b"v 0 0 0\n").unwrap();
        let dst = dir.path().join("models/nested/mesh.obj");

        LocalTransport
            .copy(&ResultArtifact::Local(src), &dst, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"v 0 0 0\n");
    }

    #[tokio::test]
    async fn missing_local_source_fails_hard() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalTransport
            .copy(
                &ResultArtifact::Local(dir.path().join("absent")),
                &dir.path().join("out"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PrintlineError::Transport(_)));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/home/pi/.env"), "/home/pi/.env");
        assert_eq!(shell_quote("my scan"), "'my scan'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
