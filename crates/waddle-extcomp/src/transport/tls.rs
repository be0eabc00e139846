//! TLS material for component connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::ExtCompError;

/// Acceptor and connector used for STARTTLS upgrades.
///
/// Either side may be missing; sessions then simply do not offer (or
/// request) TLS in that direction.
#[derive(Clone, Default)]
pub struct TlsContext {
    pub acceptor: Option<TlsAcceptor>,
    pub connector: Option<TlsConnector>,
}

impl TlsContext {
    pub fn new(acceptor: Option<TlsAcceptor>, connector: Option<TlsConnector>) -> Self {
        Self {
            acceptor,
            connector,
        }
    }

    /// Load from PEM paths. Missing paths leave that side disabled.
    pub fn from_paths(
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        ca_path: Option<&Path>,
    ) -> Result<Self, ExtCompError> {
        let acceptor = match (cert_path, key_path) {
            (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(ExtCompError::config(
                    "TLS certificate and key must be configured together",
                ))
            }
        };
        let connector = ca_path.map(load_tls_connector).transpose()?;

        info!(
            inbound_tls = acceptor.is_some(),
            outbound_tls = connector.is_some(),
            "TLS context loaded"
        );
        Ok(Self::new(acceptor, connector))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("acceptor", &self.acceptor.is_some())
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ExtCompError> {
    let file = File::open(path).map_err(|e| {
        ExtCompError::config(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let certs: Vec<_> = certs(&mut BufReader::new(file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(ExtCompError::config(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a server-side acceptor from PEM certificate and PKCS#8 key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ExtCompError> {
    let certs = read_certs(cert_path)?;

    let key_file = File::open(key_path).map_err(|e| {
        ExtCompError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;
    let key = pkcs8_private_keys(&mut BufReader::new(key_file))
        .filter_map(|r| r.ok())
        .next()
        .ok_or_else(|| ExtCompError::config("No private key found"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| ExtCompError::config(format!("TLS config error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Load a client-side connector trusting the CA certificates in `ca_path`.
pub fn load_tls_connector(ca_path: &Path) -> Result<TlsConnector, ExtCompError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_path)? {
        roots.add(cert)?;
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(client_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn install_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_generated_material() {
        install_crypto_provider();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = write_temp(&cert.cert.pem());
        let key_file = write_temp(&cert.key_pair.serialize_pem());

        let tls = TlsContext::from_paths(
            Some(cert_file.path()),
            Some(key_file.path()),
            Some(cert_file.path()),
        )
        .unwrap();
        assert!(tls.acceptor.is_some());
        assert!(tls.connector.is_some());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let cert_file = write_temp("");
        let err = TlsContext::from_paths(Some(cert_file.path()), None, None).unwrap_err();
        assert!(matches!(err, ExtCompError::Config(_)));
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        let empty = write_temp("not a certificate");
        assert!(load_tls_connector(empty.path()).is_err());
    }

    #[test]
    fn test_no_paths_disables_tls() {
        let tls = TlsContext::from_paths(None, None, None).unwrap();
        assert!(tls.acceptor.is_none());
        assert!(tls.connector.is_none());
    }
}
