// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Capability probe for the scanner appliance.
//
// The scanner announces itself as `<name>.local`.  The system resolver
// usually handles that (nss-mdns); when it does not, an mDNS hostname query
// is sent directly.  Absence is reported as `Located::NotFound`, never as an
// error: the watcher polls an appliance that is switched off most of the day.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use printline_core::types::Located;

/// File-share port used as the appliance's liveness gate.
pub const SMB_PORT: u16 = 445;

/// Resolves the appliance and checks its control port.
#[async_trait]
pub trait ApplianceProbe: Send + Sync {
    /// Standard resolution, then an mDNS query.
    async fn locate(&self, hostname: &str) -> Located;

    /// Open and immediately close a TCP connection to the control port.
    async fn verify_control_port(&self, address: IpAddr) -> bool;
}

/// Probe backed by the host resolver, `mdns-sd` and plain TCP.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    pub mdns_window: Duration,
    pub port: u16,
    pub port_timeout: Duration,
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self {
            mdns_window: Duration::from_secs(3),
            port: SMB_PORT,
            port_timeout: Duration::from_secs(3),
        }
    }
}

/// `scanner.local` -> `scanner.local.` as mDNS expects.
pub fn mdns_hostname(hostname: &str) -> String {
    let trimmed = hostname.trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{trimmed}.")
    } else {
        format!("{trimmed}.local.")
    }
}

/// IPv4 first, like the scanner's own tooling.
fn prefer_v4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = addrs.into_iter().collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

impl NetworkProbe {
    async fn resolve_system(hostname: &str) -> Option<IpAddr> {
        // Port is irrelevant, lookup_host just needs one.
        match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => prefer_v4(addrs.map(|a| a.ip())),
            Err(e) => {
                debug!(hostname, error = %e, "system resolver failed");
                None
            }
        }
    }

    fn resolve_mdns(hostname: &str, window: Duration) -> Option<IpAddr> {
        let daemon = match ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "cannot start mDNS daemon");
                return None;
            }
        };
        let name = mdns_hostname(hostname);
        let found = match daemon.resolve_hostname(&name, Some(window.as_millis() as u64)) {
            Ok(receiver) => {
                let deadline = std::time::Instant::now() + window;
                let mut found = None;
                while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
                    match receiver.recv_timeout(left) {
                        Ok(HostnameResolutionEvent::AddressesFound(host, addrs)) => {
                            debug!(%host, count = addrs.len(), "mDNS answer");
                            found = prefer_v4(addrs);
                            if found.is_some() {
                                break;
                            }
                        }
                        Ok(HostnameResolutionEvent::SearchTimeout(_))
                        | Ok(HostnameResolutionEvent::SearchStopped(_)) => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                found
            }
            Err(e) => {
                debug!(hostname = %name, error = %e, "mDNS query failed");
                None
            }
        };
        let _ = daemon.shutdown();
        found
    }
}

#[async_trait]
impl ApplianceProbe for NetworkProbe {
    #[instrument(skip(self))]
    async fn locate(&self, hostname: &str) -> Located {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Located::Found(ip);
        }
        if let Some(ip) = Self::resolve_system(hostname).await {
            info!(%ip, "appliance resolved");
            return Located::Found(ip);
        }

        let host = hostname.to_owned();
        let window = self.mdns_window;
        let found = tokio::task::spawn_blocking(move || Self::resolve_mdns(&host, window))
            .await
            .ok()
            .flatten();
        match found {
            Some(ip) => {
                info!(%ip, "appliance resolved via mDNS");
                Located::Found(ip)
            }
            None => {
                info!("appliance not on the network");
                Located::NotFound
            }
        }
    }

    async fn verify_control_port(&self, address: IpAddr) -> bool {
        let addr = SocketAddr::new(address, self.port);
        let open = matches!(
            tokio::time::timeout(self.port_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        );
        debug!(%addr, open, "control port check");
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mdns_names_are_fully_qualified() {
        assert_eq!(mdns_hostname("openscan.local"), "openscan.local.");
        assert_eq!(mdns_hostname("openscan.local."), "openscan.local.");
        assert_eq!(mdns_hostname("openscan"), "openscan.local.");
    }

    #[test]
    fn ipv4_is_preferred() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = "192.168.1.50".parse().unwrap();
        assert_eq!(prefer_v4([v6, v4]), Some(v4));
        assert_eq!(prefer_v4([v6]), Some(v6));
        assert_eq!(prefer_v4([]), None);
    }

    #[tokio::test]
    async fn literal_addresses_skip_resolution() {
        let probe = NetworkProbe::default();
        let located = probe.locate("10.0.0.7").await;
        assert_eq!(located, Located::Found("10.0.0.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn port_check_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = NetworkProbe {
            port,
            ..NetworkProbe::default()
        };
        assert!(probe.verify_control_port("127.0.0.1".parse().unwrap()).await);
        drop(listener);
    }
}
