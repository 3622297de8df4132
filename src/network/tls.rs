//! TLS configuration for the peer transport
//!
//! Peers authenticate the routing domain at the protocol layer (domain tag
//! plus value comparison); TLS provides transport confidentiality. When no
//! x509 material is configured a self-signed certificate is generated at
//! startup.

use crate::error::{NetworkError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use std::path::Path;
use std::sync::Arc;

/// ALPN protocol identifier for the peer transport
pub const TRELLIS_ALPN: &[u8] = b"trellis/1";

/// x509 material for the peer transport
pub struct TlsMaterial {
    certificates: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Load DER-encoded certificate and key from disk
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_bytes = std::fs::read(cert_path)?;
        let key_bytes = std::fs::read(key_path)?;
        let private_key = PrivateKeyDer::try_from(key_bytes).map_err(|e| {
            NetworkError::TlsHandshakeFailed {
                reason: format!("unusable private key {}: {}", key_path.display(), e),
            }
        })?;
        Ok(Self {
            certificates: vec![CertificateDer::from(cert_bytes)],
            private_key,
        })
    }

    /// Generate a self-signed certificate for this node
    pub fn self_signed(node_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_name);
        dn.push(DnType::OrganizationName, "Trellis");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().map_err(|e| NetworkError::TlsHandshakeFailed {
            reason: format!("failed to generate key pair: {}", e),
        })?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| NetworkError::TlsHandshakeFailed {
                reason: format!("failed to self-sign certificate: {}", e),
            })?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| {
            NetworkError::TlsHandshakeFailed {
                reason: format!("failed to serialize private key: {}", e),
            }
        })?;

        Ok(Self {
            certificates: vec![cert_der],
            private_key: key_der,
        })
    }

    /// rustls client config for outgoing peer connections
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptPeerCert))
            .with_client_auth_cert(self.certificates.clone(), self.private_key.clone_key())
            .map_err(|e| NetworkError::TlsHandshakeFailed {
                reason: format!("failed to build client config: {}", e),
            })?;
        config.alpn_protocols = vec![TRELLIS_ALPN.to_vec()];
        Ok(Arc::new(config))
    }

    /// rustls server config for the peer listener
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certificates.clone(), self.private_key.clone_key())
            .map_err(|e| NetworkError::TlsHandshakeFailed {
                reason: format!("failed to build server config: {}", e),
            })?;
        config.alpn_protocols = vec![TRELLIS_ALPN.to_vec()];
        Ok(Arc::new(config))
    }
}

/// Server name placeholder used for peer connections
///
/// Peer certificates are self-signed per node; the name is not part of
/// trust establishment.
pub(crate) fn peer_server_name() -> ServerName<'static> {
    // a fixed, always-parseable DNS name
    ServerName::try_from("trellis-peer").unwrap_or(ServerName::IpAddress(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST).into(),
    ))
}

/// Certificate verifier accepting any peer certificate
///
/// Domain membership is enforced by the routing protocol itself; TLS here
/// is confidentiality, not identity.
#[derive(Debug)]
struct AcceptPeerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptPeerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_material() {
        let material = TlsMaterial::self_signed("node1").unwrap();
        assert_eq!(material.certificates.len(), 1);
        assert!(!material.certificates[0].is_empty());
    }

    #[test]
    fn test_client_config_has_alpn() {
        let material = TlsMaterial::self_signed("node1").unwrap();
        let config = material.client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![TRELLIS_ALPN.to_vec()]);
    }

    #[test]
    fn test_server_config_has_alpn() {
        let material = TlsMaterial::self_signed("node1").unwrap();
        let config = material.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![TRELLIS_ALPN.to_vec()]);
    }

    #[test]
    fn test_load_missing_files_fails() {
        let result = TlsMaterial::load(
            Path::new("/nonexistent/cert.der"),
            Path::new("/nonexistent/key.der"),
        );
        assert!(result.is_err());
    }
}
