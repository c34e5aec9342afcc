use crate::error::ProxyError;
use log::debug;
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| ProxyError::Config(format!("Failed to open certificate file '{}': {}", path, e)))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate '{}': {}", path, e)))
}

/// Create TLS server configuration from PEM files. CA certificates, when given,
/// are served after the leaf certificate as part of the chain.
pub fn create_tls_config(
    private_key_path: &str,
    cert_path: &str,
    ca_path: Option<&str>,
) -> Result<ServerConfig, ProxyError> {
    let mut certs = load_certificates(cert_path)?;
    if certs.is_empty() {
        return Err(ProxyError::Config("No valid certificate found".to_string()));
    }

    if let Some(ca_path) = ca_path {
        let chain = load_certificates(ca_path)?;
        debug!("Appending {} CA certificate(s) from {}", chain.len(), ca_path);
        certs.extend(chain);
    }

    let mut key_reader = BufReader::new(
        File::open(private_key_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
    );
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create TLS config: {}", e)))
}

pub fn create_tls_acceptor(
    private_key_path: &str,
    cert_path: &str,
    ca_path: Option<&str>,
) -> Result<TlsAcceptor, ProxyError> {
    let config = create_tls_config(private_key_path, cert_path, ca_path)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
