//! TLS material for the bridge listener
//!
//! Certificates come either from PEM files or from a throwaway self-signed
//! certificate. Clients of a self-signed bridge pin the exact certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use burrow_core::TlsConfig;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no PKCS#8 private key found in {0}")]
    NoPrivateKey(String),

    #[error("certificate generation failed: {0}")]
    Generate(String),

    #[error("tls configuration rejected: {0}")]
    Config(#[from] rustls::Error),

    #[error("tls enabled without certificate and key paths")]
    MissingMaterial,
}

/// Certificate chain plus private key
pub struct Identity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|e| TlsError::Read {
        path: path.display().to_string(),
        source: e,
    })
}

/// Load a PEM certificate chain and PKCS#8 key
pub fn load_pem(cert_path: &Path, key_path: &Path) -> Result<Identity, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(cert_path)?).map_err(|e| TlsError::Read {
        path: cert_path.display().to_string(),
        source: e,
    })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.display().to_string()));
    }

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open(key_path)?).map_err(|e| {
        TlsError::Read {
            path: key_path.display().to_string(),
            source: e,
        }
    })?;
    if keys.is_empty() {
        return Err(TlsError::NoPrivateKey(key_path.display().to_string()));
    }

    debug!("Loaded {} certificate(s) from {:?}", certs.len(), cert_path);
    Ok(Identity {
        certs: certs.into_iter().map(CertificateDer::from).collect(),
        key: PrivatePkcs8KeyDer::from(keys.swap_remove(0)).into(),
    })
}

/// Generate a self-signed certificate for `names`
pub fn self_signed(names: &[&str]) -> Result<Identity, TlsError> {
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TlsError::Generate(e.to_string()))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| TlsError::Generate(e.to_string()))?;
    let key_der = cert.serialize_private_key_der();

    Ok(Identity {
        certs: vec![CertificateDer::from(cert_der)],
        key: PrivatePkcs8KeyDer::from(key_der).into(),
    })
}

/// Build a TLS acceptor for an identity
pub fn acceptor(identity: Identity) -> Result<TlsAcceptor, TlsError> {
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(identity.certs, identity.key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the acceptor described by the `[bridge.tls]` section
pub fn acceptor_from_config(config: &TlsConfig) -> Result<(TlsAcceptor, CertificateDer<'static>), TlsError> {
    let identity = if config.self_signed {
        info!("Generating self-signed bridge certificate");
        self_signed(&["localhost", "127.0.0.1"])?
    } else {
        match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => load_pem(cert, key)?,
            _ => return Err(TlsError::MissingMaterial),
        }
    };

    let leaf = identity.certs[0].clone();
    Ok((acceptor(identity)?, leaf))
}

/// Client connector that accepts exactly one certificate
pub fn pinned_connector(cert: CertificateDer<'static>) -> Result<TlsConnector, TlsError> {
    let provider = provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
            expected: cert,
            provider,
        }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts the pinned certificate, still checking handshake signatures
#[derive(Debug)]
struct PinnedCertVerifier {
    expected: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("certificate does not match pin".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
