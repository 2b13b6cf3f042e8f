//! Error types for the proxy engine.

use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `burpui::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying traffic, issuing certificates
/// or parsing raw requests.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),

  /// http::Error
  #[error(transparent)]
  Http(http::Error),

  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Certificate generation, parsing or signing error
  #[error("certificate error: {0}")]
  Certificate(String),

  /// The CA directory is unusable
  #[error("invalid CA directory: {0}")]
  InvalidDir(String),

  /// Malformed raw request or HTTP message
  #[error("parse error: {0}")]
  Parse(String),

  /// The request names no host at all
  #[error("missing host")]
  MissingHost,

  /// Proxy engine error
  #[error("proxy error: {0}")]
  Proxy(String),

  /// Upstream connection error
  #[error("connection error: {0}")]
  Connection(String),
}

impl Error {
  /// Create a certificate error and log it
  pub(crate) fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub(crate) fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a proxy error and log it
  pub(crate) fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub(crate) fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Parse failures are operator-visible and retried, so they only log at
  /// debug level
  pub(crate) fn parse_error(msg: impl Into<String>) -> Self {
    let error = Error::Parse(msg.into());
    tracing::debug!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}
