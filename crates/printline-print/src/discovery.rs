// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device locator: find the printer's current address on an unmanaged LAN.
//
// Discovery degrades in three steps:
//
//   1. SSDP `M-SEARCH` to the vendor's multicast port.  The first reply that
//      looks like a printer wins and nothing else runs.
//   2. A sequential sweep of `<subnet>.1 ..= <subnet>.254` for the MQTT TLS
//      port.
//   3. For every host with the port open, a TLS handshake whose peer
//      certificate common name is compared with the expected serial.
//
// If no certificate matches, the first open host is returned anyway.  Only a
// sweep that finds nothing at all yields `Located::NotFound`.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConfig, ClientConnection};
use tracing::{debug, info, instrument, warn};

use printline_core::error::{PrintlineError, Result};
use printline_core::types::Located;
use printline_security::{common_name, server_name};

/// SSDP multicast group.
pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// The vendor answers SSDP on 2021, not the standard 1900.
pub const SSDP_PORT: u16 = 2021;

/// Search target sent in the `ST:` header.
pub const SSDP_SEARCH_TARGET: &str = "urn:bambulab-com:device:3dprinter:1";

/// MQTT over TLS; also the port swept during fallback.
pub const CONTROL_PORT: u16 = 8883;

/// Timing and addressing knobs for one locate call.
#[derive(Debug, Clone)]
pub struct LocatorSettings {
    /// First three octets of the /24 to sweep.
    pub subnet: [u8; 3],
    pub port: u16,
    pub announce_window: Duration,
    pub connect_timeout: Duration,
    pub identity_timeout: Duration,
}

/// Parse `"a.b.c"` (a trailing dot is allowed) into three octets.
pub fn parse_subnet(raw: &str) -> Result<[u8; 3]> {
    let invalid = || PrintlineError::Config(format!("BAMBU_SUBNET is not three octets: {raw:?}"));
    let parts: Vec<&str> = raw.trim().trim_end_matches('.').split('.').collect();
    let &[a, b, c] = parts.as_slice() else {
        return Err(invalid());
    };
    let octet = |part: &str| part.parse::<u8>().map_err(|_| invalid());
    Ok([octet(a)?, octet(b)?, octet(c)?])
}

impl LocatorSettings {
    pub fn for_subnet(subnet: &str) -> Result<Self> {
        Ok(Self {
            subnet: parse_subnet(subnet)?,
            port: CONTROL_PORT,
            announce_window: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(300),
            identity_timeout: Duration::from_secs(3),
        })
    }

    /// `a.b.c` as configured.
    pub fn subnet_prefix(&self) -> String {
        let [a, b, c] = self.subnet;
        format!("{a}.{b}.{c}")
    }

    /// Every address in the sweep, in ascending order.
    pub fn sweep_addresses(&self) -> Vec<IpAddr> {
        let [a, b, c] = self.subnet;
        (1..=254)
            .map(|d| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
            .collect()
    }
}

/// The network primitives the locator needs.  Swapped for a fake in tests so
/// call ordering can be asserted without touching a real LAN.
pub trait DiscoveryNetwork: Send + Sync {
    /// Send the announcement query and feed each reply to `on_reply` until it
    /// breaks or `window` elapses.
    fn announce(
        &self,
        window: Duration,
        on_reply: &mut dyn FnMut(IpAddr, &str) -> ControlFlow<()>,
    ) -> Result<()>;

    /// Whether a TCP connect to `addr` succeeds within `timeout`.
    fn port_open(&self, addr: SocketAddr, timeout: Duration) -> bool;

    /// Common name of the certificate presented on `addr`, if a handshake
    /// completes within `timeout`.
    fn peer_identity(&self, addr: SocketAddr, timeout: Duration) -> Option<String>;
}

/// Whether an SSDP reply came from a printer of the expected class.
pub fn is_printer_reply(reply: &str) -> bool {
    let lower = reply.to_ascii_lowercase();
    lower.contains("bambu") || lower.contains("3dprinter")
}

/// Build the `M-SEARCH` datagram.
pub fn search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_GROUP}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {SSDP_SEARCH_TARGET}\r\n\
         \r\n"
    )
}

/// Finds the printer.  Generic over the network so tests can count calls.
pub struct DeviceLocator<N> {
    network: N,
    settings: LocatorSettings,
}

impl<N: DiscoveryNetwork> DeviceLocator<N> {
    pub fn new(network: N, settings: LocatorSettings) -> Self {
        Self { network, settings }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Locate the device whose certificate CN equals `expected_id`.
    ///
    /// Never fails: every error on the way is logged and treated as "no
    /// answer from there".
    #[instrument(skip(self), fields(subnet = %self.settings.subnet_prefix()))]
    pub fn locate(&self, expected_id: Option<&str>) -> Located {
        if let Some(ip) = self.announced() {
            info!(%ip, "printer answered announcement query");
            return Located::Found(ip);
        }

        info!("no announcement reply, sweeping subnet");
        let candidates = self.sweep();
        self.confirm(&candidates, expected_id).into()
    }

    fn announced(&self) -> Option<IpAddr> {
        let mut found = None;
        let outcome = self
            .network
            .announce(self.settings.announce_window, &mut |ip, reply| {
                if is_printer_reply(reply) {
                    found = Some(ip);
                    ControlFlow::Break(())
                } else {
                    debug!(%ip, "ignoring unrelated SSDP reply");
                    ControlFlow::Continue(())
                }
            });
        if let Err(e) = outcome {
            warn!(error = %e, "announcement query failed");
        }
        found
    }

    fn sweep(&self) -> Vec<IpAddr> {
        let port = self.settings.port;
        let open: Vec<IpAddr> = self
            .settings
            .sweep_addresses()
            .into_iter()
            .filter(|ip| {
                self.network
                    .port_open(SocketAddr::new(*ip, port), self.settings.connect_timeout)
            })
            .collect();
        debug!(count = open.len(), port, "sweep finished");
        open
    }

    fn confirm(&self, candidates: &[IpAddr], expected_id: Option<&str>) -> Option<IpAddr> {
        for ip in candidates {
            let addr = SocketAddr::new(*ip, self.settings.port);
            match self
                .network
                .peer_identity(addr, self.settings.identity_timeout)
            {
                Some(cn) if expected_id.is_none_or(|id| id == cn) => {
                    info!(%ip, serial = %cn, "confirmed printer identity");
                    return Some(*ip);
                }
                Some(cn) => debug!(%ip, serial = %cn, "identity does not match, skipping"),
                None => debug!(%ip, "no certificate identity"),
            }
        }

        let first = candidates.first().copied();
        if let Some(ip) = first {
            warn!(%ip, "no identity match, returning first candidate");
        }
        first
    }
}

/// The real LAN.
pub struct LanNetwork {
    tls: Arc<ClientConfig>,
}

impl LanNetwork {
    pub fn new(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }
}

impl DiscoveryNetwork for LanNetwork {
    fn announce(
        &self,
        window: Duration,
        on_reply: &mut dyn FnMut(IpAddr, &str) -> ControlFlow<()>,
    ) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(2)?;
        socket.send_to(search_request().as_bytes(), (SSDP_GROUP, SSDP_PORT))?;

        let deadline = Instant::now() + window;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            socket.set_read_timeout(Some(remaining))?;
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let reply = String::from_utf8_lossy(&buf[..n]);
                    if on_reply(from.ip(), &reply).is_break() {
                        return Ok(());
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(());
                }
                Err(e) => {
                    return Err(PrintlineError::Discovery(format!("SSDP receive: {e}")));
                }
            }
        }
    }

    fn port_open(&self, addr: SocketAddr, timeout: Duration) -> bool {
        TcpStream::connect_timeout(&addr, timeout).is_ok()
    }

    fn peer_identity(&self, addr: SocketAddr, timeout: Duration) -> Option<String> {
        let mut sock = TcpStream::connect_timeout(&addr, timeout).ok()?;
        sock.set_read_timeout(Some(timeout)).ok()?;
        sock.set_write_timeout(Some(timeout)).ok()?;

        let mut conn = ClientConnection::new(Arc::clone(&self.tls), server_name(addr.ip()))
            .map_err(|e| debug!(%addr, error = %e, "TLS client setup failed"))
            .ok()?;
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                debug!(%addr, error = %e, "TLS handshake failed");
                return None;
            }
        }

        let der = conn.peer_certificates()?.first()?;
        common_name(der.as_ref())
    }
}
