//! QUIC crypto for the benchmark mesh.
//!
//! Every listener presents a fresh self-signed identity and clients accept
//! any certificate; membership is enforced by the seed's cluster token.

use crate::error::{BenchError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use std::time::Duration;

const ALPN: &[u8] = b"collbench/1";

/// Server name presented when dialing; certificates are not verified.
pub(crate) const SERVER_NAME: &str = "collbench-mesh";

/// Idle mesh links stay open between swept sizes.
const KEEP_ALIVE: Duration = Duration::from_secs(5);

fn tls_err(e: impl std::fmt::Display) -> BenchError {
    BenchError::Tls(e.to_string())
}

fn mesh_transport() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    Arc::new(transport)
}

/// Certificate and key of one mesh endpoint.
pub struct MeshIdentity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl MeshIdentity {
    pub fn generate() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
        let cert = rcgen::CertificateParams::new(vec![SERVER_NAME.into()])
            .map_err(tls_err)?
            .self_signed(&key_pair)
            .map_err(tls_err)?;
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(tls_err)?;
        Ok(Self {
            cert: CertificateDer::from(cert.der().to_vec()),
            key,
        })
    }

    pub fn server_config(self) -> Result<quinn::ServerConfig> {
        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert], self.key)
            .map_err(tls_err)?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls)).map_err(tls_err)?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(mesh_transport());
        Ok(config)
    }
}

/// Client side of a mesh link.
pub fn client_config() -> Result<quinn::ClientConfig> {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls)).map_err(tls_err)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(mesh_transport());
    Ok(config)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_builds_both_configs() {
        let identity = MeshIdentity::generate().unwrap();
        assert!(!identity.cert.is_empty());
        identity.server_config().unwrap();
        client_config().unwrap();
    }
}
