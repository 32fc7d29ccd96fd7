//! TLS client configuration for the streaming transport.
//!
//! Two trust policies are supported. [`TrustPolicy::Strict`] validates the
//! collector certificate against the platform roots and the configured host
//! name. [`TrustPolicy::AllowUntrusted`] accepts whatever certificate the
//! collector presents; the handshake and its signatures are still verified,
//! so traffic stays encrypted. Only meant for local or development collectors.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::DeliveryError;

/// How the collector certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    Strict,
    AllowUntrusted,
}

impl TrustPolicy {
    pub fn from_allow_untrusted(allow_untrusted_server: bool) -> Self {
        if allow_untrusted_server {
            TrustPolicy::AllowUntrusted
        } else {
            TrustPolicy::Strict
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a connector for the given policy.
pub fn connector(policy: TrustPolicy) -> Result<TlsConnector, DeliveryError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| DeliveryError::Handshake {
            host: String::new(),
            reason: e.to_string(),
        })?;

    let config = match policy {
        TrustPolicy::Strict => builder
            .with_root_certificates(native_roots())
            .with_no_client_auth(),
        TrustPolicy::AllowUntrusted => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve the name presented for SNI and certificate validation.
pub fn server_name(host: &str) -> Result<ServerName<'static>, DeliveryError> {
    ServerName::try_from(host.to_string()).map_err(|e| DeliveryError::Handshake {
        host: host.to_string(),
        reason: e.to_string(),
    })
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!(error = %err, "Failed to load a platform root certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added = added, ignored = ignored, "Loaded platform root certificates");
    roots
}

/// Accepts any server certificate, still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        debug!(server_name = ?server_name, "Accepting untrusted server certificate");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
