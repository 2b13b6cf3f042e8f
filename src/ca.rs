//! Certificate authority store for TLS interception.
//!
//! The root certificate and key live on disk so the operator installs the
//! root once; per-host leaf certificates are issued on the fly and cached
//! for the lifetime of the process.

use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::{Error, Result};

const CA_CERT_FILE: &str = "ca.crt.pem";
const CA_KEY_FILE: &str = "ca.key.pem";
const CA_DER_FILE: &str = "ca.cer";
/// Leaf validity in days.
const LEAF_TTL_DAYS: i64 = 7;
/// Root validity in days.
const ROOT_TTL_DAYS: i64 = 3650;
/// Backdate for clock skew.
const NOT_BEFORE_BACKDATE: Duration = Duration::hours(1);

/// The certificate authority: a persisted root plus a cache of issued
/// per-host leaf certificates.
pub struct Store {
  dir: PathBuf,
  issuer: Issuer<'static, KeyPair>,
  root_cert_pem: String,
  root_cert_der: CertificateDer<'static>,
  leaves: Cache<String, Arc<LeafCert>>,
}

/// Issued per-host server certificate material.
///
/// Cache hits return the same `Arc`, so the material handed out for a host
/// is byte-identical for the lifetime of the store.
pub struct LeafCert {
  /// PEM-encoded leaf certificate.
  pub cert_pem: String,
  /// PEM-encoded PKCS#8 leaf private key.
  pub key_pem: String,
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
}

impl LeafCert {
  /// The leaf certificate in DER form.
  pub fn cert_der(&self) -> CertificateDer<'static> {
    self.cert_der.clone()
  }

  /// The leaf private key in DER form.
  pub fn key_der(&self) -> PrivateKeyDer<'static> {
    self.key_der.clone_key()
  }
}

impl Store {
  /// Load the root certificate and key from `dir`, generating and
  /// persisting a fresh self-signed root when the directory has none.
  ///
  /// The certificate is written world-readable (`ca.crt.pem`, 0644), the
  /// key is not (`ca.key.pem`, 0600).
  pub async fn load_or_create(dir: impl AsRef<Path>) -> Result<Store> {
    let dir = dir.as_ref().to_path_buf();
    if dir.as_os_str().is_empty() {
      return Err(Error::InvalidDir("empty CA directory".to_string()));
    }
    fs::create_dir_all(&dir)
      .await
      .map_err(|e| Error::InvalidDir(format!("{}: {}", dir.display(), e)))?;

    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    let (issuer, cert_pem) = if cert_path.exists() && key_path.exists() {
      Self::load_root(&cert_path, &key_path).await?
    } else {
      Self::generate_root(&cert_path, &key_path).await?
    };

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate found in root PEM"))?
      .map_err(|e| Error::certificate_error(format!("failed to parse root PEM: {}", e)))?;

    Ok(Store {
      dir,
      issuer,
      root_cert_pem: cert_pem,
      root_cert_der: cert_der,
      leaves: Cache::builder().build(),
    })
  }

  /// Load an existing root certificate and key.
  async fn load_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("failed to create issuer from CA cert: {}", e))
    })?;
    Ok((issuer, cert_pem))
  }

  /// Generate a new self-signed root and persist it.
  async fn generate_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "burpui Local CA");
    dn.push(DnType::OrganizationName, "burpui");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_BACKDATE;
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    write_file(cert_path, cert_pem.as_bytes(), 0o644).await?;
    write_file(key_path, key_pem.as_bytes(), 0o600).await?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to create issuer: {}", e)))?;
    Ok((issuer, cert_pem))
  }

  /// Get or issue a leaf certificate for `host`.
  ///
  /// The host is trimmed of a trailing dot and case-normalized before the
  /// cache lookup. Concurrent first requests for one host are coalesced;
  /// the cache never evicts while the store is alive.
  pub async fn leaf_cert(&self, host: &str) -> Result<Arc<LeafCert>> {
    let name = host
      .trim()
      .trim_end_matches('.')
      .to_ascii_lowercase();
    if name.is_empty() {
      return Err(Error::certificate_error("empty leaf host"));
    }
    self
      .leaves
      .try_get_with(name.clone(), async { self.issue_leaf(&name) })
      .await
      .map_err(|e: Arc<Error>| Error::Certificate(e.to_string()))
  }

  fn issue_leaf(&self, name: &str) -> Result<Arc<LeafCert>> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    params.subject_alt_names = if let Ok(ip) = name.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(name.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid leaf host name: {}", name))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_BACKDATE;
    params.not_after = now + Duration::days(LEAF_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf for {}: {}", name, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("failed to serialize leaf key"))?;

    Ok(Arc::new(LeafCert {
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
      cert_der,
      key_der,
    }))
  }

  /// The root certificate, PEM-encoded. Returns an owned copy.
  pub fn root_cert_pem(&self) -> String {
    self.root_cert_pem.clone()
  }

  /// The root certificate, DER-encoded. Returns an owned copy.
  pub fn root_cert_der(&self) -> Vec<u8> {
    self.root_cert_der.to_vec()
  }

  /// The root certificate in rustls DER form, for building server chains.
  pub fn root_cert(&self) -> CertificateDer<'static> {
    self.root_cert_der.clone()
  }

  /// Uppercase hex SHA-1 over the root DER, as trust-store tools print it.
  pub fn root_thumbprint_sha1(&self) -> String {
    let mut hasher = Sha1::new();
    hasher.update(self.root_cert_der.as_ref());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
      let _ = write!(out, "{:02X}", b);
    }
    out
  }

  /// Write a DER copy of the root (`ca.cer`, 0644) for OS trust-store
  /// tools and return its path.
  pub async fn export_root_der(&self) -> Result<PathBuf> {
    let path = self.dir.join(CA_DER_FILE);
    write_file(&path, self.root_cert_der.as_ref(), 0o644).await?;
    Ok(path)
  }

  /// The directory holding the persisted root.
  pub fn dir(&self) -> &Path {
    &self.dir
  }
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
  fs::write(path, contents).await?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
  }
  #[cfg(not(unix))]
  {
    let _ = mode;
  }
  Ok(())
}
