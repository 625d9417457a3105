// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device control client: deposit a sliced job on the printer and start it.
//
// Control session states:
//
//   Connecting -> Authenticated -> ProbingCapability
//       -> SigningRequired                          (file deposited, manual start)
//       -> CommandSent -> AwaitingStatus -> Accepted | TimedOut
//
// Every terminal state maps onto a `PrintOutcome`; none of them is an error.
// Errors are reserved for the channel itself failing.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use printline_core::error::Result;
use printline_core::types::{JobProgress, PrintOutcome, PrinterJobState};
use printline_security::{TlsVersions, insecure_client_config};

use crate::discovery::CONTROL_PORT;
use crate::ftps_client;
use crate::mqtt::MqttSession;

/// Username for both the MQTT and FTPS logins.
pub const DEVICE_USER: &str = "bblp";

/// Full status push request, used as the capability probe.
pub const PUSHALL: &str = r#"{"pushing":{"sequence_id":"0","command":"pushall"}}"#;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe channel to the device.  `MqttSession` is the real one;
/// tests script their own.
pub trait ControlChannel {
    fn subscribe(&mut self, topic: &str) -> Result<()>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
    /// Next message, or `None` when `timeout` passes without one.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>>;
    fn disconnect(&mut self);
}

/// The firmware's `print.fun` bitmask.
///
/// Only one bit has a known meaning; the rest are kept but not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareCapabilities(pub u64);

impl FirmwareCapabilities {
    /// Set when the firmware only accepts signed control messages.
    pub const SIGNED_COMMANDS_REQUIRED: u64 = 0x2000_0000;

    /// Parse the hex string the device reports, with or without `0x`.  Only
    /// the low 64 bits are kept.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let digits = raw
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let low = &digits[digits.len().saturating_sub(16)..];
        u64::from_str_radix(low, 16).ok().map(Self)
    }

    /// The reported field as capabilities.  A value that cannot be read
    /// counts as requiring signed commands.
    pub fn from_report(raw: &str) -> Self {
        Self::from_hex(raw).unwrap_or_else(|| {
            warn!(fun = raw, "unreadable capability field, assuming signed commands");
            Self(Self::SIGNED_COMMANDS_REQUIRED)
        })
    }

    pub fn requires_signing(self) -> bool {
        self.0 & Self::SIGNED_COMMANDS_REQUIRED != 0
    }
}

#[derive(Debug, Deserialize)]
struct Report {
    print: Option<PrintSection>,
}

#[derive(Debug, Deserialize)]
struct PrintSection {
    fun: Option<String>,
    gcode_state: Option<String>,
    mc_percent: Option<Value>,
    mc_remaining_time: Option<Value>,
}

/// What one status report told us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub capabilities: Option<FirmwareCapabilities>,
    pub progress: Option<JobProgress>,
}

fn number(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Pull the fields we track out of a report payload.  Payloads that are not
/// JSON or have no `print` object yield an empty report.
pub fn parse_report(payload: &[u8]) -> StatusReport {
    let Ok(report) = serde_json::from_slice::<Report>(payload) else {
        debug!(bytes = payload.len(), "ignoring non-JSON report");
        return StatusReport::default();
    };
    let Some(print) = report.print else {
        return StatusReport::default();
    };

    StatusReport {
        capabilities: print.fun.as_deref().map(FirmwareCapabilities::from_report),
        progress: print
            .gcode_state
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|state| JobProgress {
                state: PrinterJobState::parse(state),
                percent: number(print.mc_percent.as_ref()),
                remaining_minutes: number(print.mc_remaining_time.as_ref()),
            }),
    }
}

/// The `project_file` command that starts plate 1 of a deposited 3MF.
pub fn start_command(file: &str) -> Value {
    let subtask = file.strip_suffix(".3mf").unwrap_or(file);
    json!({
        "print": {
            "sequence_id": 0,
            "command": "project_file",
            "param": "Metadata/plate_1.gcode",
            "project_id": "0",
            "profile_id": "0",
            "task_id": "0",
            "subtask_id": "0",
            "subtask_name": subtask,
            "file": "",
            "url": format!("file:///sdcard{}/{file}", ftps_client::UPLOAD_DIR),
            "timelapse": false,
            "bed_type": "auto",
            "bed_leveling": true,
            "flow_cali": true,
            "vibration_cali": true,
            "layer_inspect": true,
            "ams_mapping": [0],
            "use_ams": false
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    ProbingCapability,
    SigningRequired,
    CommandSent,
    AwaitingStatus,
    Accepted,
    TimedOut,
}

/// Observation windows for the control session.
#[derive(Debug, Clone, Copy)]
pub struct ControlTiming {
    pub connect_timeout: Duration,
    pub probe_window: Duration,
    pub status_window: Duration,
}

impl Default for ControlTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            probe_window: Duration::from_secs(5),
            status_window: Duration::from_secs(30),
        }
    }
}

/// State for one device-control interaction.  Dropped when the print stage
/// ends.
pub struct DeviceSession {
    pub address: IpAddr,
    pub serial: String,
    access_code: String,
    pub capabilities: Option<FirmwareCapabilities>,
    pub last_progress: Option<JobProgress>,
    state: SessionState,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("serial", &self.serial)
            .field("capabilities", &self.capabilities)
            .field("last_progress", &self.last_progress)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(address: IpAddr, serial: impl Into<String>, access_code: impl Into<String>) -> Self {
        Self {
            address,
            serial: serial.into(),
            access_code: access_code.into(),
            capabilities: None,
            last_progress: None,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request_topic(&self) -> String {
        format!("device/{}/request", self.serial)
    }

    pub fn report_topic(&self) -> String {
        format!("device/{}/report", self.serial)
    }

    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "control session");
        self.state = next;
    }

    /// Mark the channel as connected and logged in.
    pub fn authenticated(&mut self) {
        self.advance(SessionState::Authenticated);
    }

    /// Probe capabilities, then either stop at "deposited only" or send the
    /// start command and watch for acceptance.
    #[instrument(skip(self, channel, timing), fields(device = %self.address))]
    pub fn drive<C: ControlChannel>(
        &mut self,
        channel: &mut C,
        file: &str,
        timing: &ControlTiming,
    ) -> Result<PrintOutcome> {
        channel.subscribe(&self.report_topic())?;

        self.advance(SessionState::ProbingCapability);
        channel.publish(&self.request_topic(), PUSHALL.as_bytes())?;
        self.capabilities = self.probe(channel, timing.probe_window)?;

        if self.capabilities.is_some_and(FirmwareCapabilities::requires_signing) {
            self.advance(SessionState::SigningRequired);
            info!(file, "firmware requires signed commands, leaving file for manual start");
            return Ok(PrintOutcome::DepositedOnly {
                file: file.to_owned(),
            });
        }
        if self.capabilities.is_none() {
            warn!("no capability report, assuming unsigned control is allowed");
        }

        let command = serde_json::to_vec(&start_command(file))?;
        channel.publish(&self.request_topic(), &command)?;
        self.advance(SessionState::CommandSent);
        info!(file, "start command sent");

        self.advance(SessionState::AwaitingStatus);
        self.last_progress = None;
        let deadline = Instant::now() + timing.status_window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(msg) = channel.recv(remaining)? else {
                break;
            };
            if let Some(progress) = parse_report(&msg.payload).progress {
                debug!(state = %progress.state, percent = progress.percent, "status report");
                let accepted = progress.state.is_accepted();
                self.last_progress = Some(progress.clone());
                if accepted {
                    self.advance(SessionState::Accepted);
                    info!(state = %progress.state, eta_min = progress.remaining_minutes, "print accepted");
                    return Ok(PrintOutcome::Started(progress));
                }
            }
        }

        self.advance(SessionState::TimedOut);
        match &self.last_progress {
            Some(p) => warn!(state = %p.state, "status window closed before the job was accepted"),
            None => warn!("no status received, print may not have started"),
        }
        Ok(PrintOutcome::Unconfirmed {
            last: self.last_progress.clone(),
        })
    }

    fn probe<C: ControlChannel>(
        &mut self,
        channel: &mut C,
        window: Duration,
    ) -> Result<Option<FirmwareCapabilities>> {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(msg) = channel.recv(remaining)? else {
                return Ok(None);
            };
            let report = parse_report(&msg.payload);
            if let Some(progress) = report.progress {
                self.last_progress = Some(progress);
            }
            if let Some(caps) = report.capabilities {
                debug!(fun = %format!("{:#x}", caps.0), "firmware capabilities");
                return Ok(Some(caps));
            }
        }
    }
}

/// Deposits files over implicit FTPS and drives the MQTT control channel.
pub struct DeviceControlClient {
    bulk_tls: Arc<ClientConfig>,
    control_tls: Arc<ClientConfig>,
    timing: ControlTiming,
}

impl DeviceControlClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            // TLS 1.2 so the data channel can resume the control session.
            bulk_tls: insecure_client_config(TlsVersions::Tls12Only)?,
            control_tls: insecure_client_config(TlsVersions::Any)?,
            timing: ControlTiming::default(),
        })
    }

    pub fn with_timing(mut self, timing: ControlTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Upload `job` to the device's upload directory; returns the remote name.
    #[instrument(skip(self, access_code))]
    pub fn deposit(&self, address: IpAddr, access_code: &str, job: &Path) -> Result<String> {
        ftps_client::upload(address, access_code, job, Arc::clone(&self.bulk_tls))
    }

    /// Open a control session and start `file`, which must already be on the
    /// device.
    pub fn start(&self, session: &mut DeviceSession, file: &str) -> Result<PrintOutcome> {
        let client_id = format!("printline-{}", std::process::id());
        let mut channel = MqttSession::connect(
            session.address,
            CONTROL_PORT,
            &client_id,
            DEVICE_USER,
            &session.access_code,
            Arc::clone(&self.control_tls),
            self.timing.connect_timeout,
        )?;
        session.authenticated();

        let outcome = session.drive(&mut channel, file, &self.timing);
        channel.disconnect();
        outcome
    }

    /// Deposit then start.
    pub fn deposit_and_start(
        &self,
        address: IpAddr,
        serial: &str,
        access_code: &str,
        job: &Path,
    ) -> Result<PrintOutcome> {
        let file = self.deposit(address, access_code, job)?;
        let mut session = DeviceSession::new(address, serial, access_code);
        self.start(&mut session, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays queued reports and records everything published.
    #[derive(Default)]
    struct ScriptedChannel {
        inbox: VecDeque<Vec<u8>>,
        published: Vec<(String, Value)>,
        subscribed: Vec<String>,
    }

    impl ScriptedChannel {
        fn with_reports(reports: &[Value]) -> Self {
            Self {
                inbox: reports
                    .iter()
                    .map(|r| serde_json::to_vec(r).unwrap())
                    .collect(),
                ..Default::default()
            }
        }

        fn start_commands(&self) -> usize {
            self.published
                .iter()
                .filter(|(_, v)| v["print"]["command"] == "project_file")
                .count()
        }
    }

    impl ControlChannel for ScriptedChannel {
        fn subscribe(&mut self, topic: &str) -> Result<()> {
            self.subscribed.push(topic.to_owned());
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
            self.published
                .push((topic.to_owned(), serde_json::from_slice(payload).unwrap()));
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<Message>> {
            Ok(self.inbox.pop_front().map(|payload| Message {
                topic: "device/00M1/report".into(),
                payload,
            }))
        }

        fn disconnect(&mut self) {}
    }

    fn session() -> DeviceSession {
        DeviceSession::new("192.168.1.42".parse().unwrap(), "00M1", "12345678")
    }

    fn timing() -> ControlTiming {
        ControlTiming {
            connect_timeout: Duration::from_secs(1),
            probe_window: Duration::from_secs(1),
            status_window: Duration::from_secs(1),
        }
    }

    #[test]
    fn signing_bit_blocks_start_command() {
        let mut channel = ScriptedChannel::with_reports(&[
            json!({"print": {"fun": "3EC1AFFF9CFF", "gcode_state": "IDLE"}}),
            json!({"print": {"gcode_state": "RUNNING"}}),
        ]);
        let mut s = session();

        let outcome = s.drive(&mut channel, "part.3mf", &timing()).unwrap();

        assert_eq!(
            outcome,
            PrintOutcome::DepositedOnly {
                file: "part.3mf".into()
            }
        );
        assert_eq!(channel.start_commands(), 0);
        assert_eq!(s.state(), SessionState::SigningRequired);
        // Only the probe went out.
        assert_eq!(channel.published.len(), 1);
        assert_eq!(channel.published[0].0, "device/00M1/request");
        assert_eq!(channel.published[0].1["pushing"]["command"], "pushall");
    }

    #[test]
    fn clear_bit_sends_exactly_one_start_command() {
        let mut channel = ScriptedChannel::with_reports(&[
            json!({"print": {"fun": "0x1C18FFF9CFF", "gcode_state": "IDLE"}}),
            json!({"print": {"gcode_state": "PREPARE", "mc_percent": 0, "mc_remaining_time": 95}}),
            json!({"print": {"gcode_state": "RUNNING"}}),
        ]);
        let mut s = session();

        let outcome = s.drive(&mut channel, "part.3mf", &timing()).unwrap();

        assert_eq!(channel.start_commands(), 1);
        assert_eq!(channel.subscribed, vec!["device/00M1/report".to_string()]);
        match outcome {
            PrintOutcome::Started(p) => {
                assert_eq!(p.state, PrinterJobState::Prepare);
                assert_eq!(p.remaining_minutes, 95);
            }
            other => panic!("expected Started, got {other:?}"),
        }
        assert_eq!(s.state(), SessionState::Accepted);
    }

    #[test]
    fn silence_after_command_is_unconfirmed_not_error() {
        let mut channel =
            ScriptedChannel::with_reports(&[json!({"print": {"fun": "0", "gcode_state": "IDLE"}})]);
        let outcome = session().drive(&mut channel, "a.3mf", &timing()).unwrap();
        assert_eq!(outcome, PrintOutcome::Unconfirmed { last: None });
        assert_eq!(channel.start_commands(), 1);
    }

    #[test]
    fn last_observed_state_is_reported() {
        let mut channel = ScriptedChannel::with_reports(&[
            json!({"print": {"fun": "0"}}),
            json!({"print": {"gcode_state": "FAILED", "mc_percent": "3"}}),
        ]);
        let outcome = session().drive(&mut channel, "a.3mf", &timing()).unwrap();
        let PrintOutcome::Unconfirmed { last: Some(p) } = outcome else {
            panic!("expected Unconfirmed with a state");
        };
        assert_eq!(p.state, PrinterJobState::Failed);
        assert_eq!(p.percent, 3);
    }

    #[test]
    fn missing_probe_reply_assumes_unsigned() {
        let mut channel = ScriptedChannel::default();
        let mut s = session();
        let outcome = s.drive(&mut channel, "a.3mf", &timing()).unwrap();
        assert!(matches!(outcome, PrintOutcome::Unconfirmed { .. }));
        assert_eq!(s.capabilities, None);
        assert_eq!(channel.start_commands(), 1);
    }

    #[test]
    fn capability_hex_parsing() {
        assert!(FirmwareCapabilities::from_hex("20000000").unwrap().requires_signing());
        assert!(!FirmwareCapabilities::from_hex("0x1FFFFFFF").unwrap().requires_signing());
        assert_eq!(FirmwareCapabilities::from_hex("zz"), None);
        assert_eq!(FirmwareCapabilities::from_hex(""), None);
    }

    #[test]
    fn wide_capability_field_keeps_low_bits() {
        let set = FirmwareCapabilities::from_hex("7F0000000020000000").unwrap();
        assert!(set.requires_signing());
        let clear = FirmwareCapabilities::from_hex("0xFFFF00000000000000").unwrap();
        assert!(!clear.requires_signing());
    }

    #[test]
    fn unreadable_capability_field_blocks_start_command() {
        let mut channel = ScriptedChannel::with_reports(&[
            json!({"print": {"fun": "not-hex", "gcode_state": "IDLE"}}),
            json!({"print": {"gcode_state": "RUNNING"}}),
        ]);
        let mut s = session();

        let outcome = s.drive(&mut channel, "part.3mf", &timing()).unwrap();

        assert!(matches!(outcome, PrintOutcome::DepositedOnly { .. }));
        assert_eq!(channel.start_commands(), 0);
    }

    #[test]
    fn start_command_points_at_upload_dir() {
        let cmd = start_command("benchy_decimated.3mf");
        assert_eq!(cmd["print"]["url"], "file:///sdcard/cache/benchy_decimated.3mf");
        assert_eq!(cmd["print"]["subtask_name"], "benchy_decimated");
        assert_eq!(cmd["print"]["param"], "Metadata/plate_1.gcode");
    }

    #[test]
    fn garbage_reports_are_empty() {
        assert_eq!(parse_report(b"not json"), StatusReport::default());
        assert_eq!(parse_report(br#"{"info":{}}"#), StatusReport::default());
    }

    #[test]
    fn debug_hides_access_code() {
        let dump = format!("{:?}", session());
        assert!(!dump.contains("12345678"));
    }
}
