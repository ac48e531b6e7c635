//! Per-pool certificate material.

use std::collections::BTreeMap;
use std::path::PathBuf;

use hostpool_pki::{
    generate_leaf, CertificateAuthority, CertificatePaths, CertificateStore,
};
use tracing::info;

use crate::error::Result;

/// Directory on bootstrapped hosts that receives the certificates.
pub const REMOTE_CERT_DIR: &str = "/etc/hostpool/ssl";

/// Local PEM files one host needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCertificates {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Where [`HostCertificates`] end up on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCertPaths {
    pub ca_cert: String,
    pub cert: String,
    pub key: String,
}

impl Default for RemoteCertPaths {
    fn default() -> Self {
        Self {
            ca_cert: format!("{REMOTE_CERT_DIR}/ca.crt"),
            cert: format!("{REMOTE_CERT_DIR}/host.crt"),
            key: format!("{REMOTE_CERT_DIR}/host.key"),
        }
    }
}

/// A CA plus one leaf per host, generated once per pool.
///
/// Files live in a temporary directory that is removed with this value.
#[derive(Debug)]
pub struct PoolCertificates {
    store: CertificateStore,
    ca: CertificateAuthority,
    ca_paths: CertificatePaths,
    hosts: BTreeMap<String, HostCertificates>,
}

impl PoolCertificates {
    /// Generate the pool CA.
    pub fn new(common_name: &str) -> Result<Self> {
        let ca = CertificateAuthority::generate(common_name)?;
        let store = CertificateStore::new()?;
        let ca_paths = store.write_ca(&ca)?;
        Ok(Self {
            store,
            ca,
            ca_paths,
            hosts: BTreeMap::new(),
        })
    }

    /// Generate and write the leaf for a host. Calling again for the same
    /// host returns the existing files.
    pub fn add_host(&mut self, host_name: &str, names: &[&str]) -> Result<HostCertificates> {
        if let Some(existing) = self.hosts.get(host_name) {
            return Ok(existing.clone());
        }

        let pair = generate_leaf(names, host_name, Some(&self.ca))?;
        let paths = self.store.write_leaf(host_name, &pair)?;
        let certs = HostCertificates {
            ca_cert: self.ca_paths.cert.clone(),
            cert: paths.cert,
            key: paths.key,
        };

        info!(host = %host_name, names = ?names, "Issued host certificate");
        self.hosts.insert(host_name.to_string(), certs.clone());
        Ok(certs)
    }

    pub fn host(&self, host_name: &str) -> Option<&HostCertificates> {
        self.hosts.get(host_name)
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }

    pub fn dir(&self) -> &std::path::Path {
        self.store.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaves_share_the_ca() {
        let mut certs = PoolCertificates::new("pool-test").unwrap();
        let a = certs.add_host("broker-0", &["broker-0", "10.0.0.1"]).unwrap();
        let b = certs.add_host("manager-0", &["manager-0", "10.0.0.2"]).unwrap();

        assert_eq!(a.ca_cert, b.ca_cert);
        assert_ne!(a.cert, b.cert);
        assert!(a.key.exists());
        assert_eq!(certs.host("broker-0"), Some(&a));
    }

    #[test]
    fn test_add_host_is_idempotent() {
        let mut certs = PoolCertificates::new("pool-test").unwrap();
        let first = certs.add_host("db-0", &["db-0"]).unwrap();
        let pem = std::fs::read_to_string(&first.cert).unwrap();

        let second = certs.add_host("db-0", &["db-0"]).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second.cert).unwrap(), pem);
    }

    #[test]
    fn test_files_removed_on_drop() {
        let certs = PoolCertificates::new("pool-test").unwrap();
        let dir = certs.dir().to_path_buf();
        assert!(dir.exists());
        drop(certs);
        assert!(!dir.exists());
    }
}
