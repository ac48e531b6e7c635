//! Certificate material for pool hosts.
//!
//! A pool generates one CA and signs a leaf certificate per host so that
//! brokers, databases and managers can trust each other. PEM files are
//! written to a scoped temporary directory; distributing them to the hosts
//! is the caller's job.
//!
//! Every leaf carries `localhost` and `127.0.0.1` in addition to the names
//! the caller supplies.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

const CA_VALIDITY: Duration = Duration::days(3650);
const LEAF_VALIDITY: Duration = Duration::days(365);

/// Backdating of `not_before`, tolerating clock skew between the runner and
/// the hosts.
const CLOCK_SKEW: Duration = Duration::hours(1);

fn validity_window(lifetime: Duration) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (now - CLOCK_SKEW, now + lifetime)
}

/// PKI errors.
#[derive(Debug, Error)]
pub enum PkiError {
    /// A name that looks like an IP address did not parse as one.
    #[error("invalid IP address in subject names: {0}")]
    InvalidIpAddress(String),

    /// A name could not be encoded as a DNS SAN.
    #[error("invalid DNS name in subject names: {0:?}")]
    InvalidDnsName(String),

    /// Key or certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    /// Writing PEM files failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

/// A subject alternative name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectName {
    Dns(String),
    Ip(IpAddr),
}

impl SubjectName {
    fn to_san(&self) -> Result<SanType> {
        match self {
            SubjectName::Dns(name) => {
                let ia5 = name
                    .clone()
                    .try_into()
                    .map_err(|_| PkiError::InvalidDnsName(name.clone()))?;
                Ok(SanType::DnsName(ia5))
            }
            SubjectName::Ip(ip) => Ok(SanType::IpAddress(*ip)),
        }
    }
}

impl fmt::Display for SubjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectName::Dns(name) => write!(f, "DNS:{name}"),
            SubjectName::Ip(ip) => write!(f, "IP:{ip}"),
        }
    }
}

/// A name is treated as an IP address if it is dotted digits or contains a colon.
fn looks_like_ip(name: &str) -> bool {
    name.contains(':') || (name.contains('.') && name.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

/// Build the SAN set for a leaf certificate.
///
/// Caller names come first, followed by the loopback names. Duplicates are
/// dropped while preserving order.
pub fn subject_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<SubjectName>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(names.len() + 2);

    let loopback = [
        SubjectName::Dns("localhost".to_string()),
        SubjectName::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];

    for raw in names {
        let name = raw.as_ref().trim();
        if name.is_empty() {
            return Err(PkiError::InvalidDnsName(raw.as_ref().to_string()));
        }

        let subject = if looks_like_ip(name) {
            let ip = name
                .parse::<IpAddr>()
                .map_err(|_| PkiError::InvalidIpAddress(name.to_string()))?;
            SubjectName::Ip(ip)
        } else {
            SubjectName::Dns(name.to_string())
        };

        if seen.insert(subject.clone()) {
            out.push(subject);
        }
    }

    for subject in loopback {
        if seen.insert(subject.clone()) {
            out.push(subject);
        }
    }

    Ok(out)
}

/// A PEM-encoded certificate and its private key.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate authority shared by every host in a pool.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    /// PEM as distributed to hosts. For a loaded CA this is the caller's
    /// original certificate, not the re-encoded issuer.
    cert_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "hostpool");
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity_window(CA_VALIDITY);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();

        info!(common_name, "Generated pool CA certificate");

        Ok(Self {
            cert,
            key,
            cert_pem,
        })
    }

    /// Load a caller-supplied CA from PEM.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;

        debug!("Loaded caller-supplied CA");

        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate PEM for distribution.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key PEM.
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

/// Generate a leaf certificate for `names`.
///
/// Signed by `ca` when given. Without a CA the leaf is self-signed.
pub fn generate_leaf<S: AsRef<str>>(
    names: &[S],
    common_name: &str,
    ca: Option<&CertificateAuthority>,
) -> Result<CertKeyPair> {
    let sans = subject_names(names)?;

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "hostpool");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    params.subject_alt_names = sans
        .iter()
        .map(SubjectName::to_san)
        .collect::<Result<Vec<_>>>()?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    (params.not_before, params.not_after) = validity_window(LEAF_VALIDITY);

    let key = KeyPair::generate()?;
    let cert = match ca {
        Some(ca) => params.signed_by(&key, &ca.cert, &ca.key)?,
        None => {
            warn!(common_name, "No CA supplied, self-signing leaf certificate");
            params.self_signed(&key)?
        }
    };

    debug!(
        common_name,
        sans = %sans.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        "Generated leaf certificate"
    );

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Paths to a certificate and its key on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Scoped directory holding PEM files. Removed when dropped.
#[derive(Debug)]
pub struct CertificateStore {
    dir: tempfile::TempDir,
}

impl CertificateStore {
    /// Create a new store in the system temp directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("hostpool-certs-")
            .tempdir()?;
        Ok(Self { dir })
    }

    /// Directory holding the PEM files.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the CA certificate and key as `ca.crt` / `ca.key`.
    pub fn write_ca(&self, ca: &CertificateAuthority) -> Result<CertificatePaths> {
        self.write_pair("ca", ca.cert_pem(), &ca.key_pem())
    }

    /// Write a leaf as `<label>.crt` / `<label>.key`.
    pub fn write_leaf(&self, label: &str, pair: &CertKeyPair) -> Result<CertificatePaths> {
        self.write_pair(label, &pair.cert_pem, &pair.key_pem)
    }

    fn write_pair(&self, label: &str, cert_pem: &str, key_pem: &str) -> Result<CertificatePaths> {
        let cert = self.dir.path().join(format!("{label}.crt"));
        let key = self.dir.path().join(format!("{label}.key"));

        fs::write(&cert, cert_pem)?;
        write_private(&key, key_pem)?;

        Ok(CertificatePaths { cert, key })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn as_subject(san: &SanType) -> Option<SubjectName> {
        match san {
            SanType::DnsName(name) => Some(SubjectName::Dns(name.as_str().to_string())),
            SanType::IpAddress(ip) => Some(SubjectName::Ip(*ip)),
            _ => None,
        }
    }

    fn rendered(names: &[SubjectName]) -> HashSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_validity_window_starts_before_now() {
        let before = OffsetDateTime::now_utc();
        let (not_before, not_after) = validity_window(LEAF_VALIDITY);
        let after = OffsetDateTime::now_utc();

        assert!(not_before < before);
        assert!(not_before >= before - CLOCK_SKEW - Duration::seconds(1));
        assert!(not_after > after + Duration::days(364));
        assert!(not_after <= after + LEAF_VALIDITY);
    }

    #[test]
    fn test_subject_names_include_loopback() {
        let names = subject_names(&["host1", "10.0.0.5"]).unwrap();

        let expected: HashSet<String> = ["DNS:host1", "DNS:localhost", "IP:10.0.0.5", "IP:127.0.0.1"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(rendered(&names), expected);
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_subject_names_deduplicate() {
        let names = subject_names(&["localhost", "127.0.0.1", "host1", "host1"]).unwrap();
        assert_eq!(names.len(), 3);
    }

    #[rstest]
    #[case("10.0.0.256")]
    #[case("1.2.3")]
    #[case("fe80::zz")]
    fn test_invalid_ip_shaped_names_rejected(#[case] name: &str) {
        let err = subject_names(&[name]).unwrap_err();
        assert!(matches!(err, PkiError::InvalidIpAddress(_)));
    }

    #[test]
    fn test_ipv6_name_is_ip_san() {
        let names = subject_names(&["fd00::5"]).unwrap();
        assert_eq!(names[0], SubjectName::Ip("fd00::5".parse().unwrap()));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            subject_names(&[" "]),
            Err(PkiError::InvalidDnsName(_))
        ));
    }

    #[test]
    fn test_leaf_carries_expected_sans() {
        let ca = CertificateAuthority::generate("test-ca").unwrap();
        let leaf = generate_leaf(&["host1", "10.0.0.5"], "host1", Some(&ca)).unwrap();

        let parsed = CertificateParams::from_ca_cert_pem(&leaf.cert_pem).unwrap();
        let sans: Vec<SubjectName> = parsed
            .subject_alt_names
            .iter()
            .filter_map(as_subject)
            .collect();

        let expected: HashSet<String> = ["DNS:host1", "DNS:localhost", "IP:10.0.0.5", "IP:127.0.0.1"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(rendered(&sans), expected);
    }

    #[test]
    fn test_self_signed_fallback() {
        let leaf = generate_leaf(&["node"], "node", None).unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_ca_roundtrip_from_pem_signs_leaves() {
        let ca = CertificateAuthority::generate("supplied").unwrap();
        let loaded = CertificateAuthority::from_pem(ca.cert_pem(), &ca.key_pem()).unwrap();

        assert_eq!(loaded.cert_pem(), ca.cert_pem());
        let leaf = generate_leaf(&["db-0"], "db-0", Some(&loaded)).unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_store_writes_files_and_cleans_up() {
        let ca = CertificateAuthority::generate("store-ca").unwrap();
        let leaf = generate_leaf(&["manager-0"], "manager-0", Some(&ca)).unwrap();

        let store = CertificateStore::new().unwrap();
        let dir = store.path().to_path_buf();
        let ca_paths = store.write_ca(&ca).unwrap();
        let leaf_paths = store.write_leaf("manager-0", &leaf).unwrap();

        assert_eq!(ca_paths.cert, dir.join("ca.crt"));
        assert_eq!(
            fs::read_to_string(&leaf_paths.key).unwrap(),
            leaf.key_pem
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&leaf_paths.key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(store);
        assert!(!dir.exists());
    }
}
