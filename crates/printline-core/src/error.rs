// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printline.
//
// Absence of a device is not an error (see `Located`), and neither is a
// printer that refuses unsigned control messages (see `PrintOutcome`).
// Everything in here aborts the current stage.

use thiserror::Error;

/// Top-level error type for all Printline operations.
#[derive(Debug, Error)]
pub enum PrintlineError {
    // -- Setup --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("singleton enforcement failed: {0}")]
    Singleton(String),

    // -- Network / discovery --
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Non-zero exit, refused connection, or timeout while crossing a host
    /// boundary.
    #[error("transport failed: {0}")]
    Transport(String),

    /// A collaborator answered, but not in the shape the contract demands.
    #[error("protocol violation: {0}")]
    Protocol(String),

    // -- Device --
    #[error("device bulk transfer failed: {0}")]
    BulkTransfer(String),

    #[error("device control failed: {0}")]
    Control(String),

    // -- External services and tools --
    #[error("reconstruction service error: {0}")]
    Reconstruction(String),

    #[error("image source error: {0}")]
    ImageSource(String),

    #[error("{tool} failed: {detail}")]
    Tool { tool: String, detail: String },

    // -- Stage boundary --
    #[error("{stage} failed after {elapsed_secs}s: {message}")]
    Stage {
        stage: String,
        elapsed_secs: u64,
        message: String,
    },

    // -- Storage / persistence --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PrintlineError {
    /// Name of the stage that failed, when this error crossed a stage boundary.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintlineError>;
