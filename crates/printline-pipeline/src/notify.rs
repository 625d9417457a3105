// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Notification relay.  Best-effort: failures are logged and swallowed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::transport::{Transport, run_collect, shell_quote};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Render a relay message.
pub fn format_message(severity: Severity, message: &str) -> String {
    let prefix = match severity {
        Severity::Info => "ℹ️",
        Severity::Error => "❌",
    };
    format!("{prefix} 3d-printline: {message}")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, severity: Severity, message: &str);

    async fn info(&self, message: &str) {
        self.send(Severity::Info, message).await;
    }

    async fn error(&self, message: &str) {
        self.send(Severity::Error, message).await;
    }
}

/// Sends through the `openclaw` CLI on whichever host `transport` reaches.
pub struct CommandNotifier {
    transport: Arc<dyn Transport>,
    bin: String,
    target: String,
}

impl CommandNotifier {
    /// An empty `target` disables the relay; messages are still logged.
    pub fn new(transport: Arc<dyn Transport>, bin: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            transport,
            bin: bin.into(),
            target: target.into(),
        }
    }

    pub fn command(&self, text: &str) -> String {
        format!(
            "{} message send --channel telegram --target {} --message {}",
            shell_quote(&self.bin),
            shell_quote(&self.target),
            shell_quote(text)
        )
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn send(&self, severity: Severity, message: &str) {
        let text = format_message(severity, message);
        match severity {
            Severity::Info => info!(notification = %text),
            Severity::Error => error!(notification = %text),
        }
        if self.target.is_empty() {
            debug!("notify skipped: no target configured");
            return;
        }

        match run_collect(self.transport.as_ref(), &self.command(&text), SEND_TIMEOUT).await {
            Ok((0, _)) => debug!("notification delivered"),
            Ok((code, output)) => {
                debug!(code, output = %output.join(" | "), "notification relay failed");
            }
            Err(e) => debug!(error = %e, "notification relay unavailable"),
        }
    }
}
