// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Implicit FTPS client for depositing job files on the printer.
//
// Implicit means TLS starts on the first byte of the control connection
// (port 990); there is no `AUTH TLS` upgrade.  The device's vsftpd rejects
// a protected data connection that does not resume the control connection's
// TLS session, so both connections are built from the same `ClientConfig`
// (shared session store) and the same server name.  The exchange itself is
// generic over the streams, which lets tests script the server.
//
// Exchange:
//   1. connect + TLS, read 220 greeting
//   2. USER bblp / PASS <access code>
//   3. PBSZ 0, PROT P, TYPE I
//   4. CWD /cache (MKD on failure; a second refusal aborts the upload)
//   5. PASV, connect a TLS data socket to the control host on the given port
//   6. STOR <name>, stream the file, close_notify
//   7. 226, QUIT

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tracing::{debug, info, instrument};

use printline_core::error::{PrintlineError, Result};

use crate::wire::{TlsStream, Wire, connect_tls};

/// Implicit FTPS port.
pub const FTPS_PORT: u16 = 990;

/// Login name the printer expects; the password is the access code.
pub const FTPS_USER: &str = "bblp";

/// Upload directory the printer will start jobs from.
pub const UPLOAD_DIR: &str = "/cache";

/// Socket timeout for control and data connections.
const FTPS_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the data connection for a transfer once the server has named a
/// passive port.
pub trait DataConnector {
    type Stream: Wire;

    fn open(&self, port: u16) -> Result<Self::Stream>;
}

/// Protected data connections to the control host.  They share the control
/// connection's `ClientConfig` and server name, so rustls offers the cached
/// session for resumption.
pub struct TlsData {
    host: IpAddr,
    tls: Arc<ClientConfig>,
}

impl DataConnector for TlsData {
    type Stream = TlsStream;

    fn open(&self, port: u16) -> Result<TlsStream> {
        let addr = SocketAddr::new(self.host, port);
        connect_tls(addr, Arc::clone(&self.tls), FTPS_TIMEOUT)
            .map_err(|e| PrintlineError::BulkTransfer(format!("data connection to {addr}: {e}")))
    }
}

/// One server reply: the code and every text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

/// Parse the code of a reply line and whether it ends the reply.
///
/// `"230-Welcome"` continues a multi-line reply, `"230 Login ok"` ends it.
/// Lines without a leading code (the middle of a multi-line reply) yield
/// `None`.
pub fn reply_line(line: &str) -> Option<(u16, bool)> {
    let code: u16 = line.get(..3)?.parse().ok()?;
    match line.as_bytes().get(3) {
        Some(b' ') | None => Some((code, true)),
        Some(b'-') => Some((code, false)),
        _ => None,
    }
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
///
/// The host part is ignored; devices behind NAT report addresses that are not
/// reachable, so the data connection always goes to the control host.
pub fn passive_port(text: &str) -> Option<u16> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let fields: Vec<u16> = text[open + 1..close]
        .split(',')
        .map(|f| f.trim().parse().ok())
        .collect::<Option<_>>()?;
    let &[_, _, _, _, p1, p2] = fields.as_slice() else {
        return None;
    };
    if p1 > 255 || p2 > 255 {
        return None;
    }
    Some(p1 * 256 + p2)
}

/// An authenticated implicit-FTPS control connection.
pub struct FtpsClient<S: Wire = TlsStream, D: DataConnector = TlsData> {
    control: BufReader<S>,
    data: D,
}

impl FtpsClient {
    /// Connect to `host:port`, complete TLS and log in.
    #[instrument(skip(access_code, tls))]
    pub fn login(host: IpAddr, port: u16, access_code: &str, tls: Arc<ClientConfig>) -> Result<Self> {
        let addr = SocketAddr::new(host, port);
        let control = connect_tls(addr, Arc::clone(&tls), FTPS_TIMEOUT)
            .map_err(|e| PrintlineError::BulkTransfer(format!("connect to {addr}: {e}")))?;
        let client = Self::over(control, TlsData { host, tls }, access_code)?;
        info!(%addr, "FTPS session authenticated");
        Ok(client)
    }
}

impl<S: Wire, D: DataConnector> FtpsClient<S, D> {
    /// Read the greeting on an open control stream, log in and switch to
    /// protected binary transfers.
    pub fn over(control: S, data: D, access_code: &str) -> Result<Self> {
        let mut client = Self {
            control: BufReader::new(control),
            data,
        };

        client.expect(&[220])?;
        let user = client.command(&format!("USER {FTPS_USER}"))?;
        if user.code == 331 {
            client.command_expect(&format!("PASS {access_code}"), &[230], "PASS ***")?;
        } else if user.code != 230 {
            return Err(PrintlineError::BulkTransfer(format!(
                "login refused: {} {}",
                user.code, user.text
            )));
        }

        client.command_expect("PBSZ 0", &[200], "PBSZ")?;
        client.command_expect("PROT P", &[200], "PROT")?;
        client.command_expect("TYPE I", &[200], "TYPE")?;
        Ok(client)
    }

    /// Change to `dir`, creating it when the server says it does not exist.
    pub fn enter_dir(&mut self, dir: &str) -> Result<()> {
        if self.command(&format!("CWD {dir}"))?.is_positive() {
            return Ok(());
        }
        let mkd = self.command(&format!("MKD {dir}"))?;
        if !mkd.is_positive() {
            // Often just "already exists"; the CWD below decides.
            debug!(code = mkd.code, text = %mkd.text, "MKD refused");
        }
        let cwd = self.command(&format!("CWD {dir}"))?;
        if !cwd.is_positive() {
            return Err(PrintlineError::BulkTransfer(format!(
                "cannot enter {dir}: {} {}",
                cwd.code, cwd.text
            )));
        }
        Ok(())
    }

    /// Upload `local` under `remote_name` into the current directory.
    #[instrument(skip(self, local), fields(local = %local.as_ref().display()))]
    pub fn store(&mut self, local: impl AsRef<Path>, remote_name: &str) -> Result<u64> {
        let mut file = std::fs::File::open(local.as_ref())?;

        let pasv = self.command("PASV")?;
        if pasv.code != 227 {
            return Err(PrintlineError::BulkTransfer(format!(
                "PASV refused: {} {}",
                pasv.code, pasv.text
            )));
        }
        let port = passive_port(&pasv.text).ok_or_else(|| {
            PrintlineError::Protocol(format!("unparseable PASV reply: {}", pasv.text))
        })?;
        let mut data = self.data.open(port)?;

        let stor = self.command(&format!("STOR {remote_name}"))?;
        if !matches!(stor.code, 125 | 150) {
            return Err(PrintlineError::BulkTransfer(format!(
                "STOR refused: {} {}",
                stor.code, stor.text
            )));
        }

        let sent = std::io::copy(&mut file, &mut data)
            .map_err(|e| PrintlineError::BulkTransfer(format!("data transfer: {e}")))?;
        data.close()
            .map_err(|e| PrintlineError::BulkTransfer(format!("data close: {e}")))?;
        drop(data);

        self.expect(&[226, 250])?;
        info!(bytes = sent, remote_name, "upload complete");
        Ok(sent)
    }

    /// Say goodbye.  Failures are logged; the file is already stored.
    pub fn quit(mut self) {
        if let Err(e) = self.command("QUIT") {
            debug!(error = %e, "QUIT failed");
        }
        let _ = self.control.get_mut().close();
    }

    fn command(&mut self, line: &str) -> Result<Reply> {
        let shown = if line.starts_with("PASS ") { "PASS ***" } else { line };
        debug!(command = shown, "FTPS >");
        let stream = self.control.get_mut();
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| PrintlineError::BulkTransfer(format!("send {shown}: {e}")))?;
        self.read_reply()
    }

    fn command_expect(&mut self, line: &str, codes: &[u16], shown: &str) -> Result<Reply> {
        let reply = self.command(line)?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(PrintlineError::BulkTransfer(format!(
                "{shown}: {} {}",
                reply.code, reply.text
            )))
        }
    }

    fn expect(&mut self, codes: &[u16]) -> Result<Reply> {
        let reply = self.read_reply()?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(PrintlineError::BulkTransfer(format!(
                "unexpected reply {} {}",
                reply.code, reply.text
            )))
        }
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = self
                .control
                .read_line(&mut line)
                .map_err(|e| PrintlineError::BulkTransfer(format!("read reply: {e}")))?;
            if n == 0 {
                return Err(PrintlineError::BulkTransfer(
                    "server closed the control connection".into(),
                ));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
            if let Some((code, true)) = reply_line(line) {
                debug!(code, "FTPS <");
                return Ok(Reply { code, text });
            }
        }
    }
}

/// Deposit `local` into the printer's upload directory.  Returns the remote
/// file name.
pub fn upload(host: IpAddr, access_code: &str, local: &Path, tls: Arc<ClientConfig>) -> Result<String> {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            PrintlineError::BulkTransfer(format!("{} has no file name", local.display()))
        })?;

    let mut client = FtpsClient::login(host, FTPS_PORT, access_code, tls)?;
    client.enter_dir(UPLOAD_DIR)?;
    client.store(local, &name)?;
    client.quit();
    Ok(name)
}
