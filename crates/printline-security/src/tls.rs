// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TLS client configuration for LAN appliances.
//
// The printer presents a self-signed certificate, so chain validation is
// switched off; handshake signatures are still checked against the
// certificate the peer presented.  Identity is established separately by
// reading the certificate's common name (see `certificates`).
//
// Every connection built from the same `Arc<ClientConfig>` shares one
// in-memory session store.  The bulk-transfer client relies on that: its data
// connections must resume the control connection's session or the device
// drops them.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, Tls12Resumption};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use printline_core::error::{PrintlineError, Result};

/// Number of sessions kept for resumption per config.
const SESSION_CACHE_SIZE: usize = 32;

/// Which protocol versions a config may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersions {
    /// TLS 1.3 and 1.2.
    Any,
    /// TLS 1.2 only.  Session-ID resumption is available as soon as the
    /// handshake finishes, which is what FTP data channels need.
    Tls12Only,
}

/// Build a client config that accepts any server certificate.
pub fn insecure_client_config(versions: TlsVersions) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider));
    let builder = match versions {
        TlsVersions::Any => builder.with_safe_default_protocol_versions(),
        TlsVersions::Tls12Only => builder.with_protocol_versions(&[&rustls::version::TLS12]),
    }
    .map_err(|e| PrintlineError::Config(format!("TLS protocol versions: {e}")))?;

    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();

    config.resumption = Resumption::in_memory_sessions(SESSION_CACHE_SIZE)
        .tls12_resumption(Tls12Resumption::SessionIdOrTickets);

    debug!(?versions, "built TLS client config without chain validation");
    Ok(Arc::new(config))
}

/// The `ServerName` to present when connecting by bare IP address.
pub fn server_name(ip: IpAddr) -> ServerName<'static> {
    ServerName::IpAddress(ip.into())
}

/// Verifier that trusts every certificate but still checks handshake
/// signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
