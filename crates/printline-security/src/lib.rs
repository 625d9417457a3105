// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printline-security: TLS and identity primitives for talking to appliances
// that present self-signed certificates, plus SHA-256 fingerprints for the
// artifacts handed between pipeline stages.

pub mod certificates;
pub mod integrity;
pub mod tls;

pub use certificates::common_name;
pub use integrity::{hash_bytes, hash_file, verify_hash};
pub use tls::{TlsVersions, insecure_client_config, server_name};
