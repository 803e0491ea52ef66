//! TLS material for the TCP relay
//!
//! The listening side terminates TLS when a PEM certificate/key pair is
//! configured. The upstream side originates TLS with certificate
//! verification against the native root store, or without verification when
//! explicitly requested.

use crate::config::{TargetTls, TlsIdentity};
use crate::target::Target;
use anyhow::{Context, Result};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Build a TLS acceptor from PEM certificate and key files
pub fn server_acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&identity.cert)
        .with_context(|| format!("Failed to open certificate file: {}", identity.cert.display()))?;
    let mut reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| {
            format!(
                "Failed to parse certificates from: {}",
                identity.cert.display()
            )
        })?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in: {}", identity.cert.display());
    }

    let key_file = std::fs::File::open(&identity.key)
        .with_context(|| format!("Failed to open key file: {}", identity.key.display()))?;
    let mut reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse key from: {}", identity.key.display()))?
        .with_context(|| format!("No private key found in: {}", identity.key.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| "Invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a TLS connector for upstream connections, or `None` when upstream
/// TLS is off
pub fn target_connector(mode: TargetTls) -> Result<Option<TlsConnector>> {
    let config = match mode {
        TargetTls::Off => return Ok(None),
        TargetTls::Verify => {
            let mut root_store = RootCertStore::empty();
            let native_certs = rustls_native_certs::load_native_certs();
            for cert in native_certs.certs {
                root_store.add(cert).ok();
            }
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
        TargetTls::Insecure => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    };

    Ok(Some(TlsConnector::from(Arc::new(config))))
}

/// Server name for SNI and verification, from the target's original hostname
pub fn server_name(target: &Target) -> Result<ServerName<'static>> {
    ServerName::try_from(target.host.clone())
        .with_context(|| format!("Invalid hostname for TLS: {}", target.host))
}

/// Certificate verifier that accepts all certificates (dangerous!)
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA512,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_target_connector_off() {
        assert!(target_connector(TargetTls::Off).unwrap().is_none());
    }

    #[test]
    fn test_target_connector_insecure() {
        assert!(target_connector(TargetTls::Insecure).unwrap().is_some());
    }

    #[test]
    fn test_target_connector_verify() {
        assert!(target_connector(TargetTls::Verify).unwrap().is_some());
    }

    #[test]
    fn test_server_name_from_hostname() {
        let target = Target {
            addr: "10.0.0.1:443".parse().unwrap(),
            host: "example.com".to_string(),
        };
        assert!(server_name(&target).is_ok());
    }

    #[test]
    fn test_server_name_from_ip() {
        let target = Target {
            addr: "10.0.0.1:443".parse().unwrap(),
            host: "10.0.0.1".to_string(),
        };
        assert!(server_name(&target).is_ok());
    }

    #[test]
    fn test_server_acceptor_missing_files() {
        let identity = TlsIdentity {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
        };
        assert!(server_acceptor(&identity).is_err());
    }

    #[test]
    fn test_server_acceptor_invalid_pem() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a certificate").unwrap();
        cert.flush().unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "not a key").unwrap();
        key.flush().unwrap();

        let identity = TlsIdentity {
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        };
        assert!(server_acceptor(&identity).is_err());
    }
}
