//! Certificate authority used to terminate TLS inside CONNECT tunnels.
//!
//! Clients must trust the CA certificate (see [`CertificateAuthority::cert_pem`]);
//! each tunnelled host gets a leaf certificate signed by it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CaPaths;

const CA_COMMON_NAME: &str = "gcloud-auth-proxy CA";

#[derive(Debug, Error)]
pub enum MitmError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("tunnelled connection failed: {0}")]
    Serve(#[from] hyper::Error),

    #[error("CONNECT upgrade failed: {0}")]
    Upgrade(String),
}

pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    cert_pem: String,
    provider: Arc<CryptoProvider>,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Fresh CA that lives only as long as the process.
    pub fn generate() -> Result<Self, MitmError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        info!("Generated ephemeral MITM certificate authority");
        Ok(Self::assemble(cert, key, cert_pem))
    }

    /// CA from PEM-encoded certificate and PKCS#8 private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, MitmError> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        // Re-signing keeps the subject and key, which is all leaf issuance needs.
        let cert = params.self_signed(&key)?;
        Ok(Self::assemble(cert, key, cert_pem.to_string()))
    }

    pub fn load(paths: &CaPaths) -> Result<Self, MitmError> {
        let cert_pem = read(&paths.cert)?;
        let key_pem = read(&paths.key)?;
        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!(cert = %paths.cert.display(), "Loaded MITM certificate authority");
        Ok(ca)
    }

    fn assemble(cert: Certificate, key: KeyPair, cert_pem: String) -> Self {
        Self {
            cert,
            key,
            cert_pem,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            leaves: Mutex::new(HashMap::new()),
        }
    }

    /// The certificate clients must trust.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// TLS server configuration presenting a leaf certificate for `host`.
    /// Configurations are built once per host.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, MitmError> {
        let mut leaves = self.leaves.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(config) = leaves.get(host) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(self.issue(host)?);
        leaves.insert(host.to_string(), Arc::clone(&config));
        debug!(host, "Issued MITM leaf certificate");
        Ok(config)
    }

    fn issue(&self, host: &str) -> Result<ServerConfig, MitmError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let key = KeyPair::generate()?;
        let leaf = params.signed_by(&key, &self.cert, &self.key)?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone()], key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> usize {
        self.leaves.lock().map(|l| l.len()).unwrap_or_default()
    }
}

fn read(path: &Path) -> Result<String, MitmError> {
    std::fs::read_to_string(path).map_err(|source| MitmError::Read {
        path: path.to_path_buf(),
        source,
    })
}
