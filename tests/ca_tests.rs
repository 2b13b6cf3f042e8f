//! Tests for the certificate authority store.

use burpui::ca::Store;
use std::path::PathBuf;
use std::sync::Arc;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

fn temp_dir(tag: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("burpui-ca-{}-{}", tag, std::process::id()));
  let _ = std::fs::remove_dir_all(&dir);
  dir
}

#[tokio::test]
async fn creates_and_reloads_the_same_root() {
  let dir = temp_dir("reload");

  let first = Store::load_or_create(&dir).await.unwrap();
  let pem = first.root_cert_pem();
  assert!(pem.contains("BEGIN CERTIFICATE"));
  assert!(dir.join("ca.crt.pem").exists());
  assert!(dir.join("ca.key.pem").exists());
  drop(first);

  let second = Store::load_or_create(&dir).await.unwrap();
  assert_eq!(second.root_cert_pem(), pem);

  let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[tokio::test]
async fn key_file_is_private() {
  use std::os::unix::fs::PermissionsExt;
  let dir = temp_dir("modes");
  let _store = Store::load_or_create(&dir).await.unwrap();
  let cert_mode = std::fs::metadata(dir.join("ca.crt.pem"))
    .unwrap()
    .permissions()
    .mode();
  let key_mode = std::fs::metadata(dir.join("ca.key.pem"))
    .unwrap()
    .permissions()
    .mode();
  assert_eq!(cert_mode & 0o777, 0o644);
  assert_eq!(key_mode & 0o777, 0o600);
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn empty_dir_is_rejected() {
  assert!(Store::load_or_create("").await.is_err());
}

#[tokio::test]
async fn thumbprint_is_forty_uppercase_hex_chars() {
  let dir = temp_dir("thumb");
  let store = Store::load_or_create(&dir).await.unwrap();
  let thumb = store.root_thumbprint_sha1();
  assert_eq!(thumb.len(), 40);
  assert!(thumb
    .chars()
    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn root_is_a_constrained_ca() {
  let dir = temp_dir("root-shape");
  let store = Store::load_or_create(&dir).await.unwrap();
  let der = store.root_cert_der();
  let (_, cert) = parse_x509_certificate(&der).unwrap();
  let constraints = cert
    .basic_constraints()
    .expect("basic constraints parse")
    .expect("basic constraints present");
  assert!(constraints.value.ca);
  let cn = cert
    .subject()
    .iter_common_name()
    .next()
    .expect("subject commonName")
    .as_str()
    .expect("subject commonName as utf8");
  assert_eq!(cn, "burpui Local CA");
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn leaf_is_signed_by_root_with_dns_san() {
  let dir = temp_dir("leaf-dns");
  let store = Store::load_or_create(&dir).await.unwrap();
  let leaf = store.leaf_cert("example.com").await.unwrap();

  let root_der = store.root_cert_der();
  let (_, root) = parse_x509_certificate(&root_der).unwrap();
  let leaf_der = leaf.cert_der();
  let (_, cert) = parse_x509_certificate(leaf_der.as_ref()).unwrap();

  // signed by the current root
  assert_eq!(cert.issuer(), root.subject());
  cert
    .verify_signature(Some(root.public_key()))
    .expect("leaf signature must chain to the root");

  // SAN carries the DNS name
  let san = cert
    .subject_alternative_name()
    .expect("san extension parse")
    .expect("san extension present");
  assert!(san
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "example.com")));

  // server-auth EKU
  let eku = cert
    .extended_key_usage()
    .expect("eku extension parse")
    .expect("eku extension present");
  assert!(eku.value.server_auth);

  // validity stays under eight days
  let validity = cert.validity();
  let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
  assert!(lifetime <= 8 * 24 * 60 * 60, "lifetime: {}s", lifetime);

  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn ip_hosts_get_ip_sans() {
  let dir = temp_dir("leaf-ip");
  let store = Store::load_or_create(&dir).await.unwrap();
  let leaf = store.leaf_cert("127.0.0.1").await.unwrap();
  let leaf_der = leaf.cert_der();
  let (_, cert) = parse_x509_certificate(leaf_der.as_ref()).unwrap();
  let san = cert
    .subject_alternative_name()
    .expect("san extension parse")
    .expect("san extension present");
  let expected = [127u8, 0, 0, 1];
  assert!(san
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == expected)));
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn cache_hits_return_byte_identical_material() {
  let dir = temp_dir("cache");
  let store = Store::load_or_create(&dir).await.unwrap();
  let first = store.leaf_cert("cached.example").await.unwrap();
  let second = store.leaf_cert("cached.example").await.unwrap();
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(first.cert_pem, second.cert_pem);
  assert_eq!(first.key_pem, second.key_pem);

  // trailing dots and case differences share the cache slot
  let third = store.leaf_cert("Cached.Example.").await.unwrap();
  assert!(Arc::ptr_eq(&first, &third));

  // a different host gets different material
  let other = store.leaf_cert("other.example").await.unwrap();
  assert_ne!(first.cert_pem, other.cert_pem);

  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn issued_material_builds_a_rustls_server_config() {
  use tokio_rustls::rustls::ServerConfig;

  let dir = temp_dir("rustls");
  let store = Store::load_or_create(&dir).await.unwrap();
  let leaf = store.leaf_cert("tls.example").await.unwrap();

  let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
  let config = ServerConfig::builder_with_provider(provider)
    .with_protocol_versions(&[
      &tokio_rustls::rustls::version::TLS12,
      &tokio_rustls::rustls::version::TLS13,
    ])
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![leaf.cert_der(), store.root_cert()], leaf.key_der());
  assert!(config.is_ok(), "server config from issued material: {:?}", config.err());

  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn der_export_writes_ca_cer() {
  let dir = temp_dir("export");
  let store = Store::load_or_create(&dir).await.unwrap();
  let path = store.export_root_der().await.unwrap();
  assert_eq!(path, dir.join("ca.cer"));
  let exported = std::fs::read(&path).unwrap();
  assert_eq!(exported, store.root_cert_der());
  let _ = std::fs::remove_dir_all(&dir);
}
