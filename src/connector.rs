//! Upstream dialing and client-side TLS.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::socket::{Socket, StreamWrapper};

/// Builds a `Connector` for the upstream client.
#[derive(Clone)]
pub(crate) struct ConnectorBuilder {
  pub(crate) connect_timeout: Option<Duration>,
  pub(crate) write_timeout: Option<Duration>,
  pub(crate) nodelay: bool,
  pub(crate) root_certs: Vec<CertificateDer<'static>>,
  pub(crate) certs_verification: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      write_timeout: Some(Duration::from_secs(30)),
      nodelay: true,
      root_certs: Vec::new(),
      certs_verification: true,
    }
  }
}

impl ConnectorBuilder {
  pub(crate) fn build(self) -> Result<Connector> {
    let provider = CryptoProvider::get_default().cloned().unwrap_or_else(|| {
      Arc::new(rustls::crypto::ring::default_provider())
    });
    // TLS 1.2 is the floor for every upstream connection.
    let versions = [&rustls::version::TLS12, &rustls::version::TLS13];
    let config_builder = ClientConfig::builder_with_provider(provider)
      .with_protocol_versions(&versions)
      .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?;
    let config_builder = if !self.certs_verification {
      config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
      let mut root_cert_store = RootCertStore::empty();
      let certs = rustls_native_certs::load_native_certs().certs;
      for cert in certs {
        let _ = root_cert_store.add(cert);
      }
      for cert in self.root_certs {
        root_cert_store
          .add(cert)
          .map_err(|e| Error::tls_error(format!("invalid root certificate: {}", e)))?;
      }
      config_builder.with_root_certificates(root_cert_store)
    };
    let tls_config = config_builder.with_no_client_auth();
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      write_timeout: self.write_timeout,
      nodelay: self.nodelay,
      tls: TlsConnector::from(Arc::new(tls_config)),
    })
  }
}

/// Dials upstream hosts, upgrading to TLS for `https` targets.
pub(crate) struct Connector {
  connect_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to `host:port`, performing a TLS handshake when `tls` is set.
  pub(crate) async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Socket> {
    let stream = match self.connect_timeout {
      None => TcpStream::connect((host, port)).await,
      Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|e| new_io_error(std::io::ErrorKind::TimedOut, &e.to_string()))?,
    }
    .map_err(|e| Error::connection_error(format!("failed to connect to {}:{}: {}", host, port, e)))?;
    if self.nodelay {
      let _ = stream.set_nodelay(true);
    }
    if !tls {
      return Ok(Socket::new(StreamWrapper::Tcp(stream), self.write_timeout));
    }
    let server_name = ServerName::try_from(host.to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", host, e)))?;
    let tls_stream = match self.connect_timeout {
      None => self.tls.connect(server_name, stream).await,
      Some(timeout) => tokio::time::timeout(timeout, self.tls.connect(server_name, stream))
        .await
        .map_err(|e| new_io_error(std::io::ErrorKind::TimedOut, &e.to_string()))?,
    }
    .map_err(|e| Error::tls_error(format!("handshake with {} failed: {}", host, e)))?;
    Ok(Socket::new(
      StreamWrapper::Tls(Box::new(tls_stream)),
      self.write_timeout,
    ))
  }
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}
