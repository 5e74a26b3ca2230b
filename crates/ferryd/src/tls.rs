//! TLS for receiver connections.
//!
//! Each receiver generates a throwaway self-signed certificate at startup.
//! Gateways trust each other out of band, so the certificate only buys
//! transport encryption; no peer identity is checked in either direction.

use std::sync::Arc;

use rcgen::CertifiedKey;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// Names baked into the generated certificate.
pub const CERT_NAMES: &[&str] = &["localhost", "ferry-gateway"];

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server-side TLS state shared by every socket worker of one receiver.
#[derive(Clone)]
pub struct ServerTls {
    acceptor: TlsAcceptor,
    certificate: CertificateDer<'static>,
}

impl ServerTls {
    pub fn self_signed() -> Result<Self, TlsError> {
        let names = CERT_NAMES.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)?;

        let certificate = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], key)?;
        // Senders never read. Unread tickets in their receive buffer turn
        // their close into a reset that discards payload still in flight.
        config.send_tls13_tickets = 0;

        tracing::debug!(names = ?CERT_NAMES, "generated self-signed certificate");

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            certificate,
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// DER of the generated certificate, for peers that want to pin it.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }
}

/// Client config for a sending gateway that pins a receiver's certificate.
pub fn pinned_client_config(
    certificate: &CertificateDer<'static>,
) -> Result<ClientConfig, TlsError> {
    let mut roots = RootCertStore::empty();
    roots.add(certificate.clone())?;
    Ok(ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
