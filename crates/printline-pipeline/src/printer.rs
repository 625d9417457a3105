// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Final stage seam: hand a sliced job to the printer.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};
use printline_core::types::{Located, PrintOutcome};
use printline_print::{DeviceControlClient, DeviceLocator, LanNetwork, LocatorSettings};
use printline_security::{TlsVersions, insecure_client_config};

#[async_trait]
pub trait PrintStation: Send + Sync {
    /// Deposit `job` on the printer and try to start it.
    async fn deliver(&self, job: &Path) -> Result<PrintOutcome>;
}

/// The network printer named by the configuration.
pub struct NetworkPrinter {
    config: Arc<PipelineConfig>,
}

impl NetworkPrinter {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    fn address(config: &PipelineConfig) -> Result<IpAddr> {
        if let Some(ip) = &config.printer_ip {
            return ip
                .parse()
                .map_err(|_| PrintlineError::Config(format!("BAMBU_IP is not an address: {ip}")));
        }
        let settings = LocatorSettings::for_subnet(&config.printer_subnet)?;
        let network = LanNetwork::new(insecure_client_config(TlsVersions::Any)?);
        let locator = DeviceLocator::new(network, settings);
        match locator.locate(Some(&config.printer_serial)) {
            Located::Found(ip) => Ok(ip),
            Located::NotFound => Err(PrintlineError::Discovery(format!(
                "printer {} not found on {}.0/24",
                config.printer_serial, config.printer_subnet
            ))),
        }
    }

    fn deliver_blocking(config: &PipelineConfig, job: &Path) -> Result<PrintOutcome> {
        config.require_printer_credentials()?;
        let address = Self::address(config)?;
        info!(%address, job = %job.display(), "delivering job");
        DeviceControlClient::new()?.deposit_and_start(
            address,
            &config.printer_serial,
            &config.printer_access_code,
            job,
        )
    }
}

#[async_trait]
impl PrintStation for NetworkPrinter {
    async fn deliver(&self, job: &Path) -> Result<PrintOutcome> {
        let config = Arc::clone(&self.config);
        let job: PathBuf = job.to_path_buf();
        tokio::task::spawn_blocking(move || Self::deliver_blocking(&config, &job))
            .await
            .map_err(|e| PrintlineError::Control(format!("print task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_address_skips_discovery() {
        let cfg = PipelineConfig::from_str_with_source("BAMBU_IP=192.168.1.77", Path::new(".env"))
            .unwrap();
        assert_eq!(
            NetworkPrinter::address(&cfg).unwrap(),
            "192.168.1.77".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn bad_fixed_address_is_config_error() {
        let cfg = PipelineConfig::from_str_with_source("BAMBU_IP=printer", Path::new(".env"))
            .unwrap();
        assert!(matches!(
            NetworkPrinter::address(&cfg),
            Err(PrintlineError::Config(_))
        ));
    }

    #[test]
    fn malformed_subnet_is_rejected_before_sweeping() {
        let cfg = PipelineConfig::from_str_with_source("BAMBU_SUBNET=1.2.x.3", Path::new(".env"))
            .unwrap();
        assert!(matches!(
            NetworkPrinter::address(&cfg),
            Err(PrintlineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_network() {
        let cfg = PipelineConfig::from_str_with_source("", Path::new(".env")).unwrap();
        let err = NetworkPrinter::new(Arc::new(cfg))
            .deliver(Path::new("/tmp/x.3mf"))
            .await
            .unwrap_err();
        assert!(matches!(err, PrintlineError::Config(_)));
    }
}
