//! Certificate manager collaborator and TLS server-config construction.
//!
//! The tunnel refetches the certificate on every terminated data stream so
//! rotations picked up by the manager take effect without a reconnect; the
//! manager is expected to cache.

use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// A certificate chain plus its private key, ready for a TLS handshake.
pub struct CertChain {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Produces certificate material per hostname. The first call for a
/// hostname may block (e.g. on an ACME order); later calls must be fast.
#[async_trait]
pub trait CertManager: Send + Sync {
    async fn obtain(&self, hostname: &str) -> anyhow::Result<CertChain>;
}

/// Build a TLS acceptor for one hostname's chain. No ALPN is offered: the
/// decrypted bytes are relayed to the backend as-is, whatever protocol the
/// client negotiated inside.
pub fn acceptor_for(chain: CertChain) -> anyhow::Result<TlsAcceptor> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain.certs, chain.key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Certificate manager reading `<dir>/<hostname>.crt` and
/// `<dir>/<hostname>.key` PEM files, e.g. as written by an external ACME
/// client.
pub struct DirCertManager {
    dir: PathBuf,
}

impl DirCertManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CertManager for DirCertManager {
    async fn obtain(&self, hostname: &str) -> anyhow::Result<CertChain> {
        // The hostname comes off the wire; never let it traverse directories.
        if hostname.contains(['/', '\\']) || hostname.contains("..") {
            anyhow::bail!("refusing suspicious hostname {hostname:?}");
        }

        let cert_path = self.dir.join(format!("{hostname}.crt"));
        let key_path = self.dir.join(format!("{hostname}.key"));

        let cert_pem = tokio::fs::read(&cert_path).await?;
        let key_pem = tokio::fs::read(&key_path).await?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
                .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found in {}", cert_path.display());
        }

        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))?
                .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

        debug!(hostname, cert = %cert_path.display(), "loaded certificate chain");
        Ok(CertChain { certs, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_manager_loads_pem_pair() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = std::env::temp_dir().join(format!("hq-edge-certs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["a.example".into()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        std::fs::write(dir.join("a.example.crt"), cert.pem()).unwrap();
        std::fs::write(dir.join("a.example.key"), key_pair.serialize_pem()).unwrap();

        let manager = DirCertManager::new(&dir);
        let chain = manager.obtain("a.example").await.unwrap();
        assert_eq!(chain.certs.len(), 1);
        acceptor_for(chain).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dir_manager_rejects_path_traversal() {
        let manager = DirCertManager::new("/nonexistent");
        assert!(manager.obtain("../etc/passwd").await.is_err());
        assert!(manager.obtain("a/b.example").await.is_err());
    }

    #[tokio::test]
    async fn missing_files_surface_as_errors() {
        let manager = DirCertManager::new("/nonexistent");
        assert!(manager.obtain("a.example").await.is_err());
    }
}
