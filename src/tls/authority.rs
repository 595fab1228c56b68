//! Certificate authority engine
//!
//! Owns the root CA (generated once, persisted to disk, reloaded on start)
//! and mints per-host leaf certificates for TLS interception. Leaves and
//! their server configs are cached per normalized hostname for the process
//! lifetime; the cache has no eviction.

use anyhow::{anyhow, Context};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

const ROOT_CERT_FILE: &str = "proxyscope-root-ca.pem";
const ROOT_KEY_FILE: &str = "proxyscope-root-ca.key";
const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 90;
/// Leaves are backdated to tolerate client clock skew.
const LEAF_BACKDATE_MINUTES: i64 = 5;

/// Root CA material: the self-signed certificate plus its private key.
pub struct RootCertificateMaterial {
    pub cert_pem: String,
    cert: Certificate,
    key: KeyPair,
}

impl RootCertificateMaterial {
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }
}

/// One root authority alive per process; first use is mutex-guarded so
/// concurrent callers converge on the same material.
pub struct CertificateAuthority {
    cert_dir: PathBuf,
    root: Mutex<Option<Arc<RootCertificateMaterial>>>,
    server_configs: DashMap<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            root: Mutex::new(None),
            server_configs: DashMap::new(),
        }
    }

    /// Fixed per-user directory for the persisted root artifacts.
    pub fn default_certificate_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("proxyscope")
            .join("certs")
    }

    /// Load the root from disk or generate and persist a fresh one. Corrupt
    /// files are deleted and replaced rather than failing hard.
    pub fn ensure_certificate_material(&self) -> anyhow::Result<Arc<RootCertificateMaterial>> {
        let mut guard = self
            .root
            .lock()
            .map_err(|_| anyhow!("certificate authority lock poisoned"))?;
        if let Some(material) = guard.as_ref() {
            return Ok(material.clone());
        }

        let cert_path = self.cert_dir.join(ROOT_CERT_FILE);
        let key_path = self.cert_dir.join(ROOT_KEY_FILE);

        let material = if cert_path.exists() && key_path.exists() {
            match load_root(&cert_path, &key_path) {
                Ok(material) => material,
                Err(err) => {
                    tracing::warn!(
                        "Stored root CA is unreadable ({err}); regenerating a fresh one"
                    );
                    let _ = fs::remove_file(&cert_path);
                    let _ = fs::remove_file(&key_path);
                    generate_and_persist(&self.cert_dir, &cert_path, &key_path)?
                }
            }
        } else {
            generate_and_persist(&self.cert_dir, &cert_path, &key_path)?
        };

        let material = Arc::new(material);
        *guard = Some(material.clone());
        Ok(material)
    }

    /// Root certificate PEM for client installation, creating the root on
    /// first use.
    pub fn read_root_certificate_pem(&self) -> anyhow::Result<String> {
        Ok(self.ensure_certificate_material()?.cert_pem.clone())
    }

    /// Root certificate PEM only if one already exists (cached or on disk);
    /// never triggers generation. `Ok(None)` means no root has been created
    /// yet; `Err` means one exists on disk but could not be read.
    pub fn root_certificate_pem_if_present(&self) -> anyhow::Result<Option<String>> {
        if let Ok(guard) = self.root.lock() {
            if let Some(material) = guard.as_ref() {
                return Ok(Some(material.cert_pem.clone()));
            }
        }
        let cert_path = self.cert_dir.join(ROOT_CERT_FILE);
        if !cert_path.exists() {
            return Ok(None);
        }
        let pem = fs::read_to_string(&cert_path)
            .with_context(|| format!("reading {}", cert_path.display()))?;
        Ok(Some(pem))
    }

    /// TLS server context for intercepting the given host, minting and
    /// caching a leaf certificate on first use. The entry API keeps
    /// concurrent first requests for one host from double-signing.
    pub fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let key = normalize_hostname(host);
        match self.server_configs.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let root = self.ensure_certificate_material()?;
                let (chain, private_key) = issue_leaf(&root, &key)?;
                let mut config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(chain, private_key)
                    .context("building TLS server config")?;
                config.alpn_protocols = vec![b"http/1.1".to_vec()];
                let config = Arc::new(config);
                entry.insert(config.clone());
                Ok(config)
            }
        }
    }

    #[cfg(test)]
    pub fn cached_host_count(&self) -> usize {
        self.server_configs.len()
    }
}

/// Lowercase and strip any trailing dot; used as the cache key and SAN value.
pub fn normalize_hostname(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn load_root(cert_path: &Path, key_path: &Path) -> anyhow::Result<RootCertificateMaterial> {
    let cert_pem = fs::read_to_string(cert_path).context("reading root CA certificate")?;
    let key_pem = fs::read_to_string(key_path).context("reading root CA key")?;

    let key = KeyPair::from_pem(&key_pem).context("parsing root CA key")?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem).context("parsing root CA PEM")?;
    let cert = params
        .self_signed(&key)
        .context("reconstructing root CA certificate")?;

    Ok(RootCertificateMaterial {
        cert_pem,
        cert,
        key,
    })
}

fn generate_and_persist(
    cert_dir: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<RootCertificateMaterial> {
    let (cert, key) = generate_root()?;
    let cert_pem = cert.pem();

    fs::create_dir_all(cert_dir).context("creating certificate directory")?;
    fs::write(cert_path, &cert_pem).context("writing root CA certificate")?;
    fs::write(key_path, key.serialize_pem()).context("writing root CA key")?;

    tracing::info!("Generated new root CA at {}", cert_path.display());

    Ok(RootCertificateMaterial {
        cert_pem,
        cert,
        key,
    })
}

fn generate_root() -> anyhow::Result<(Certificate, KeyPair)> {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let now = OffsetDateTime::now_utc();
    let date = format!("{:04}-{:02}-{:02}", now.year(), now.month() as u8, now.day());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("Proxyscope Root CA ({hostname}, {date})"));
    dn.push(DnType::OrganizationName, "Proxyscope");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
    params.not_after = now.checked_add(Duration::days(ROOT_VALIDITY_DAYS)).unwrap_or(now);

    let key = KeyPair::generate().context("generating root CA key")?;
    let cert = params
        .self_signed(&key)
        .context("self-signing root CA certificate")?;
    Ok((cert, key))
}

fn issue_leaf(
    root: &RootCertificateMaterial,
    host: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    params.subject_alt_names = if let Ok(ip) = IpAddr::from_str(host) {
        vec![SanType::IpAddress(ip)]
    } else {
        vec![SanType::DnsName(
            Ia5String::try_from(host).map_err(|_| anyhow!("hostname {host:?} is not a valid SAN"))?,
        )]
    };

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, "Proxyscope Intercepted");
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now
        .checked_sub(Duration::minutes(LEAF_BACKDATE_MINUTES))
        .unwrap_or(now);
    params.not_after = now
        .checked_add(Duration::days(LEAF_VALIDITY_DAYS))
        .unwrap_or(now);

    let key = KeyPair::generate().context("generating leaf key")?;
    let cert = params
        .signed_by(&key, &root.cert, &root.key)
        .context("signing leaf certificate")?;

    let chain = vec![cert.der().clone(), root.cert.der().clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    Ok((chain, private_key.clone_key()))
}
