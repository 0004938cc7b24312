//! TLS client configuration from pairing credentials
//!
//! Trust on a lockdown connection comes from both ends holding the keys
//! exchanged at pairing time, not from a CA chain. The client presents the
//! host certificate and key from the pairing record and accepts whatever
//! certificate the device presents.

use crate::pairing::PairingRecord;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Invalid host certificate: {0}")]
    Certificate(String),

    #[error("Invalid host private key: {0}")]
    PrivateKey(String),

    #[error("TLS configuration failed: {0}")]
    Config(#[from] rustls::Error),
}

/// Crypto provider used for every lockwire TLS context
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a client config that authenticates with the pairing keypair.
///
/// The PEM held by the `PairingRecord` is wiped when the record drops. The
/// DER decoded from it is not: it lives on inside the returned config, and on
/// the error paths it is freed without being overwritten. No key material
/// touches the filesystem.
pub fn client_config(pairing: &PairingRecord) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = crypto_provider();

    let certs = parse_certificates(pairing.host_certificate())?;
    let key = parse_private_key(pairing.host_private_key())?;

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PairedDeviceVerifier::new(provider)))
        .with_client_auth_cert(certs, key)?;

    debug!("Built TLS client config for host {}", pairing.host_id());

    Ok(Arc::new(config))
}

/// Parse PEM-encoded certificates
fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificate: {e}")))?;

    if certs.is_empty() {
        return Err(TlsError::Certificate("no certificate found".into()));
    }
    Ok(certs)
}

/// Parse a PEM-encoded private key (PKCS#1, PKCS#8 or SEC1)
fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| TlsError::PrivateKey("no private key found".into()))
}

/// Accepts the device certificate without chain validation.
///
/// The device certificate is issued by the pairing root, not by any public
/// CA, and is not bound to a hostname.
#[derive(Debug)]
pub struct PairedDeviceVerifier {
    provider: Arc<CryptoProvider>,
}

impl PairedDeviceVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for PairedDeviceVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
