/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fetchpool, an HTTP request orchestration library.
 *
 * Fetchpool is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fetchpool is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fetchpool.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS client configuration for the built-in HTTP engine.
//!
//! Roots come from the platform store, with webpki-roots as a fallback.
//! A second configuration that accepts any certificate chain is built for
//! requests carrying the ignore-certificate-authority flag; it still checks
//! handshake signatures against the presented certificate.

use std::io;
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::engine::TlsPolicy;
use crate::error::NetError;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Build a root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            debug!("[tls] {} native roots loaded, {} ignored", added, ignored);
        }
        Err(e) => warn!("[tls] cannot load native roots: {}", e),
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

fn apply_policy(config: &mut ClientConfig, policy: &TlsPolicy) {
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    // Sending before the handshake completes is the closest rustls analogue of false start.
    config.enable_early_data = policy.false_start;
    // rustls only offers forward-secret key exchanges, so require_forward_secrecy needs no change.
}

/// The two client configurations an engine context hands to its requests.
#[derive(Clone)]
pub(crate) struct TlsConfigs {
    pub verified: Arc<ClientConfig>,
    pub any_authority: Arc<ClientConfig>,
}

impl TlsConfigs {
    pub fn new(policy: &TlsPolicy) -> Self {
        let mut verified = ClientConfig::builder()
            .with_root_certificates(build_root_store())
            .with_no_client_auth();
        apply_policy(&mut verified, policy);

        let algorithms = verified
            .crypto_provider()
            .signature_verification_algorithms;
        let mut any_authority = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        any_authority
            .dangerous()
            .set_certificate_verifier(Arc::new(AnyAuthority { algorithms }));
        apply_policy(&mut any_authority, policy);

        Self {
            verified: Arc::new(verified),
            any_authority: Arc::new(any_authority),
        }
    }

    /// Configuration for a request; `ignore_authority` is only honored in debug builds.
    pub fn select(&self, ignore_authority: bool) -> Arc<ClientConfig> {
        if cfg!(debug_assertions) && ignore_authority {
            self.any_authority.clone()
        } else {
            self.verified.clone()
        }
    }
}

/// Accepts any chain; signatures over the handshake are still verified.
#[derive(Debug)]
struct AnyAuthority {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AnyAuthority {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Server name for SNI and verification.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, NetError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|_| NetError::InvalidUrl)
}

/// Classify a TLS handshake failure.
pub(crate) fn handshake_error(err: &io::Error) -> NetError {
    let rustls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>());
    match rustls_error {
        Some(tokio_rustls::rustls::Error::InvalidCertificate(_)) => NetError::CertificateInvalid,
        Some(_) => NetError::Failed,
        None => NetError::from_io(err),
    }
}
