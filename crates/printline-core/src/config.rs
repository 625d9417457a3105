// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pipeline configuration.
//
// Loaded once from a flat `KEY=value` file and then passed by reference into
// every component.  Unknown keys are ignored; missing keys fall back to the
// defaults below.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PrintlineError, Result};

/// Immutable settings for one pipeline invocation.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Path of the file this config was read from (forwarded to the worker).
    pub source_path: PathBuf,
    /// Directory holding the singleton marker files.
    pub state_dir: PathBuf,

    // -- Image source (scanner appliance) --
    pub scanner_host: String,
    pub smb_user: String,
    pub smb_pass: String,
    pub smb_share: String,
    pub scan_path: String,
    pub scandata_dir: PathBuf,

    // -- Reconstruction service --
    pub cloud_server: String,
    pub cloud_token: String,
    pub cloud_user: String,
    pub cloud_pass: String,
    pub cloud_poll_interval: Duration,
    pub cloud_max_wait: Duration,

    // -- Cross-host boundary --
    pub worker_host: String,
    pub worker_user: String,
    pub worker_dir: String,
    pub worker_bin: String,
    pub local_dir: PathBuf,

    // -- Mesh tools --
    pub decimate_ratio: f64,
    pub decimate_faces: Option<u64>,
    pub blender_image: String,
    pub slicer_bin: String,

    // -- Printer --
    pub printer_serial: String,
    pub printer_access_code: String,
    pub printer_ip: Option<String>,
    pub printer_subnet: String,

    // -- Notification relay --
    pub notify_target: String,
    pub notify_bin: String,

    // -- Watcher --
    pub watch_interval: Duration,
}

impl PipelineConfig {
    /// Read and parse a `KEY=value` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PrintlineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_str_with_source(&text, path)
    }

    /// Parse config text as if it had been read from `source`.
    pub fn from_str_with_source(text: &str, source: &Path) -> Result<Self> {
        let values = parse_env(text);
        let get = |key: &str, default: &str| -> String {
            values
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_owned())
        };
        let opt = |key: &str| -> Option<String> {
            values.get(key).filter(|v| !v.is_empty()).cloned()
        };

        let worker_user = get("PI_USER", "sanchobot");
        let state_dir = match opt("STATE_DIR") {
            Some(dir) => expand_home(&dir),
            None => source
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        Ok(Self {
            source_path: source.to_path_buf(),
            state_dir,

            scanner_host: get("OPENSCAN_HOST", "openscan.local"),
            smb_user: get("OPENSCAN_SMB_USER", "pi"),
            smb_pass: get("OPENSCAN_SMB_PASS", "raspberry"),
            smb_share: get("OPENSCAN_SMB_SHARE", "PiShare"),
            scan_path: get("OPENSCAN_SCAN_PATH", "OpenScan/scans"),
            scandata_dir: expand_home(&get("SCANDATA_DIR", "/mnt/scandata")),

            cloud_server: get("OSC_SERVER", "http://openscanfeedback.dnsuser.de:1334/"),
            cloud_token: get("OSC_TOKEN", ""),
            cloud_user: get("OSC_USER", "openscan"),
            cloud_pass: get("OSC_PASS", "free"),
            cloud_poll_interval: Duration::from_secs(parse_num(&values, "CLOUD_POLL_INTERVAL", 60)?),
            cloud_max_wait: Duration::from_secs(parse_num(&values, "CLOUD_MAX_WAIT", 3600)?),

            worker_host: get("PI_HOST", "192.168.1.134"),
            worker_dir: get(
                "PI_PIPELINE_DIR",
                &format!("/home/{worker_user}/3d-printline/pipeline"),
            ),
            worker_bin: get("WORKER_BIN", "printline-worker"),
            local_dir: expand_home(&get("LAPTOP_PIPELINE_DIR", "~/3d-pipeline")),

            decimate_ratio: parse_num(&values, "DECIMATE_RATIO", 0.5)?,
            decimate_faces: match opt("DECIMATE_FACES") {
                Some(_) => Some(parse_num(&values, "DECIMATE_FACES", 0)?),
                None => None,
            },
            blender_image: get("BLENDER_IMAGE", "nytimes/blender:latest"),
            slicer_bin: get("SLICER_BIN", "orca-slicer"),

            printer_serial: get("BAMBU_SERIAL", ""),
            printer_access_code: get("BAMBU_ACCESS_CODE", ""),
            printer_ip: opt("BAMBU_IP"),
            printer_subnet: get("BAMBU_SUBNET", "192.168.1")
                .trim_end_matches('.')
                .to_owned(),

            notify_target: get("TELEGRAM_TARGET", ""),
            notify_bin: get(
                "OPENCLAW_BIN",
                &format!("/home/{worker_user}/.npm-global/bin/openclaw"),
            ),

            watch_interval: Duration::from_secs(parse_num(&values, "WATCH_INTERVAL", 60)?),

            worker_user,
        })
    }

    /// Directory on the local host where pulled and derived models live.
    pub fn models_dir(&self) -> PathBuf {
        self.local_dir.join("models")
    }

    /// Directory holding flattened slicer profiles.
    pub fn profiles_dir(&self) -> PathBuf {
        self.local_dir.join("profiles")
    }

    /// Error unless both printer credentials are present.
    pub fn require_printer_credentials(&self) -> Result<()> {
        if self.printer_serial.is_empty() || self.printer_access_code.is_empty() {
            return Err(PrintlineError::Config(
                "BAMBU_SERIAL and BAMBU_ACCESS_CODE are required".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("source_path", &self.source_path)
            .field("scanner_host", &self.scanner_host)
            .field("smb_user", &self.smb_user)
            .field("cloud_server", &self.cloud_server)
            .field("cloud_token", &redact(&self.cloud_token))
            .field("worker", &format!("{}@{}:{}", self.worker_user, self.worker_host, self.worker_dir))
            .field("local_dir", &self.local_dir)
            .field("decimate_ratio", &self.decimate_ratio)
            .field("printer_serial", &self.printer_serial)
            .field("printer_access_code", &redact(&self.printer_access_code))
            .field("printer_ip", &self.printer_ip)
            .field("notify_target", &self.notify_target)
            .finish_non_exhaustive()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "(not set)" } else { "***" }
}

/// Parse `KEY=value` lines into a map.  Blank lines and `#` comments are
/// skipped; the first `=` splits key from value.
pub fn parse_env(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect()
}

fn parse_num<T: FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match values.get(key) {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| PrintlineError::Config(format!("{key} is not a valid number: {raw:?}"))),
        _ => Ok(default),
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|_| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
