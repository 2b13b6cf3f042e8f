//! Shared upstream HTTP client.
//!
//! One `Client` is shared by every proxy handler and by the repeater. It
//! holds a small per-host pool of idle connections, so it is advised that
//! you create one and **reuse** it.

use http::header::CONNECTION;
use http::{HeaderMap, StatusCode, Uri, Version};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{new_io_error, Error, Result};
use crate::limit::LimitBuffer;
use crate::request::Request;
use crate::response::{read_response_head, FramedReader, Framing, Response};
use crate::socket::Socket;

const MAX_IDLE_PER_HOST: usize = 4;
const COPY_CHUNK: usize = 32 * 1024;

/// A `Client` to make upstream requests with.
///
/// The client is cheap to clone; clones share the same connection pool and
/// TLS configuration.
#[derive(Clone)]
pub struct Client {
  inner: Arc<ClientRef>,
}

struct ClientRef {
  connector: Connector,
  timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  keepalive: bool,
  pool: Mutex<HashMap<String, Vec<Socket>>>,
}

impl Default for Client {
  fn default() -> Self {
    Self::new()
  }
}

impl Client {
  /// Constructs a new `Client` with the default configuration.
  ///
  /// # Panics
  ///
  /// Panics if the TLS backend cannot be initialized. Use
  /// `Client::builder()` to handle the failure as an `Error` instead.
  pub fn new() -> Client {
    ClientBuilder::default().build().expect("Client::new()")
  }

  /// Creates a `ClientBuilder` to configure a `Client`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::default()
  }

  /// Executes a `Request`, buffering the whole response body.
  ///
  /// # Errors
  ///
  /// Fails when the target cannot be resolved from the request URI, the
  /// connection cannot be established, or the overall timeout elapses.
  pub async fn execute(&self, request: Request) -> Result<Response> {
    match self.inner.timeout {
      Some(t) => tokio::time::timeout(t, self.execute_inner(request))
        .await
        .map_err(|e| new_io_error(io::ErrorKind::TimedOut, &e.to_string()))?,
      None => self.execute_inner(request).await,
    }
  }

  async fn execute_inner(&self, request: Request) -> Result<Response> {
    let mut upstream = self.send(&request).await?;
    let mut body = Vec::new();
    upstream.read_to_end(&mut body).await?;
    let response = Response {
      version: upstream.version,
      status_code: upstream.status,
      headers: upstream.headers.clone(),
      body: body.into(),
    };
    upstream.finish().await;
    Ok(response)
  }

  /// Send a request whose body is already buffered, returning the response
  /// head with a streaming body.
  pub(crate) async fn send(&self, request: &Request) -> Result<UpstreamResponse> {
    let target = Target::from_uri(request.uri())?;
    let raw = request.to_raw();
    // idle sockets may have been closed by the peer; fall through to a
    // fresh dial once the pool is exhausted
    while let Some(socket) = self.checkout(&target.key()) {
      match self.roundtrip(socket, &raw, request, &target).await {
        Ok(upstream) => return Ok(upstream),
        Err(e) => {
          tracing::debug!("pooled connection to {} failed, retrying: {}", target.key(), e);
        }
      }
    }
    let socket = self
      .inner
      .connector
      .connect(&target.host, target.port, target.tls)
      .await?;
    self.roundtrip(socket, &raw, request, &target).await
  }

  /// Send a request whose body is streamed from `body`, teeing the bytes
  /// into `tee` as they pass through. Streamed sends always dial a fresh
  /// connection; the socket is still returned to the pool afterwards.
  pub(crate) async fn send_streamed<B: AsyncBufRead + Unpin>(
    &self,
    request: &Request,
    body: &mut FramedReader<B>,
    tee: &mut LimitBuffer,
  ) -> Result<UpstreamResponse> {
    let target = Target::from_uri(request.uri())?;
    let chunked = body.is_unbounded();
    let head = request.to_raw_head(chunked);
    let mut socket = self
      .inner
      .connector
      .connect(&target.host, target.port, target.tls)
      .await?;
    socket.write_all(&head).await?;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
      let n = body
        .read_chunk(&mut buf)
        .await
        .map_err(|e| Error::parse_error(format!("request body: {}", e)))?;
      if n == 0 {
        break;
      }
      tee.write(&buf[..n]);
      if chunked {
        socket.write_all(format!("{:x}\r\n", n).as_bytes()).await?;
        socket.write_all(&buf[..n]).await?;
        socket.write_all(b"\r\n").await?;
      } else {
        socket.write_all(&buf[..n]).await?;
      }
    }
    if chunked {
      socket.write_all(b"0\r\n\r\n").await?;
    }
    socket.flush().await?;
    self.read_head(socket, request, &target).await
  }

  async fn roundtrip(
    &self,
    mut socket: Socket,
    raw: &[u8],
    request: &Request,
    target: &Target,
  ) -> Result<UpstreamResponse> {
    socket.write_all(raw).await?;
    socket.flush().await?;
    self.read_head(socket, request, target).await
  }

  async fn read_head(
    &self,
    socket: Socket,
    request: &Request,
    target: &Target,
  ) -> Result<UpstreamResponse> {
    let mut reader = BufReader::new(socket);
    let head = match self.inner.read_timeout {
      Some(t) => tokio::time::timeout(t, read_response_head(&mut reader))
        .await
        .map_err(|e| new_io_error(io::ErrorKind::TimedOut, &e.to_string()))??,
      None => read_response_head(&mut reader).await?,
    };
    let framing = Framing::for_response(request.method(), head.status, &head.headers);
    let reusable = self.inner.keepalive
      && head.version == Version::HTTP_11
      && framing != Framing::Eof
      && !wants_close(&head.headers)
      && !wants_close(request.headers());
    Ok(UpstreamResponse {
      version: head.version,
      status: head.status,
      headers: head.headers,
      unbounded: framing.is_unbounded(),
      body: FramedReader::new(reader, framing),
      key: target.key(),
      reusable,
      read_timeout: self.inner.read_timeout,
      client: self.clone(),
    })
  }

  fn checkout(&self, key: &str) -> Option<Socket> {
    if !self.inner.keepalive {
      return None;
    }
    let Ok(mut pool) = self.inner.pool.lock() else {
      return None;
    };
    pool.get_mut(key).and_then(|idle| idle.pop())
  }

  fn checkin(&self, key: String, socket: Socket) {
    if !self.inner.keepalive {
      return;
    }
    let Ok(mut pool) = self.inner.pool.lock() else {
      return;
    };
    let idle = pool.entry(key).or_default();
    if idle.len() < MAX_IDLE_PER_HOST {
      idle.push(socket);
    }
  }
}

/// Response head plus a streaming, de-framed body.
pub(crate) struct UpstreamResponse {
  pub(crate) version: Version,
  pub(crate) status: StatusCode,
  pub(crate) headers: HeaderMap,
  body: FramedReader<BufReader<Socket>>,
  unbounded: bool,
  key: String,
  reusable: bool,
  read_timeout: Option<Duration>,
  client: Client,
}

impl UpstreamResponse {
  /// True when the body length was not announced in the head.
  pub(crate) fn is_unbounded(&self) -> bool {
    self.unbounded
  }

  /// Read the next run of decoded body bytes; zero means the body is done.
  pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self.read_timeout {
      Some(t) => tokio::time::timeout(t, self.body.read_chunk(buf))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, e))?,
      None => self.body.read_chunk(buf).await,
    }
  }

  /// Drain the remaining body into `out`.
  pub(crate) async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
      let n = self.read_chunk(&mut buf).await?;
      if n == 0 {
        return Ok(());
      }
      out.extend_from_slice(&buf[..n]);
    }
  }

  /// Release the connection: back to the pool when it is clean, shut down
  /// otherwise.
  pub(crate) async fn finish(self) {
    let done = self.body.is_done();
    let mut socket = self.body.into_inner().into_inner();
    if self.reusable && done {
      self.client.checkin(self.key, socket);
    } else {
      let _ = socket.shutdown().await;
    }
  }
}

struct Target {
  host: String,
  port: u16,
  tls: bool,
}

impl Target {
  fn from_uri(uri: &Uri) -> Result<Target> {
    let host = uri
      .host()
      .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
      .filter(|h| !h.is_empty())
      .ok_or(Error::MissingHost)?;
    let tls = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok(Target { host, port, tls })
  }

  fn key(&self) -> String {
    let scheme = if self.tls { "https" } else { "http" };
    format!("{}://{}:{}", scheme, self.host, self.port)
  }
}

fn wants_close(headers: &HeaderMap) -> bool {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case("close"))
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
#[derive(Clone)]
pub struct ClientBuilder {
  config: Config,
}

#[derive(Clone)]
struct Config {
  timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  keepalive: bool,
  nodelay: bool,
  root_certs: Vec<CertificateDer<'static>>,
  certs_verification: bool,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    ClientBuilder {
      config: Config {
        timeout: Some(Duration::from_secs(30)),
        connect_timeout: Some(Duration::from_secs(10)),
        read_timeout: Some(Duration::from_secs(30)),
        write_timeout: Some(Duration::from_secs(30)),
        keepalive: false,
        nodelay: true,
        root_certs: Vec::new(),
        certs_verification: true,
      },
    }
  }
}

impl ClientBuilder {
  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  pub fn build(self) -> Result<Client> {
    let config = self.config;
    let connector = ConnectorBuilder {
      connect_timeout: config.connect_timeout,
      write_timeout: config.write_timeout,
      nodelay: config.nodelay,
      root_certs: config.root_certs,
      certs_verification: config.certs_verification,
    }
    .build()?;
    Ok(Client {
      inner: Arc::new(ClientRef {
        connector,
        timeout: config.timeout,
        read_timeout: config.read_timeout,
        keepalive: config.keepalive,
        pool: Mutex::new(HashMap::new()),
      }),
    })
  }

  /// Set a timeout for the whole buffered round trip of `execute`.
  ///
  /// Default is 30 seconds. Pass `None` to disable the timeout.
  pub fn timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.timeout = timeout;
    self
  }

  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.connect_timeout = timeout;
    self
  }

  /// Set a timeout for individual read operations.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.read_timeout = timeout;
    self
  }

  /// Set a timeout for individual write operations.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.write_timeout = timeout;
    self
  }

  /// Enable or disable connection reuse across requests.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, keepalive: bool) -> ClientBuilder {
    self.config.keepalive = keepalive;
    self
  }

  /// Set whether sockets have `TCP_NODELAY` enabled.
  ///
  /// Default is `true`.
  pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
    self.config.nodelay = enabled;
    self
  }

  /// Add a custom root certificate (DER) to the upstream trust store.
  ///
  /// This allows connecting to a server with a self-signed certificate
  /// without disabling verification entirely. It **does not** replace the
  /// native trust store.
  pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> ClientBuilder {
    self.config.root_certs.push(cert);
    self
  }

  /// Controls the use of certificate validation.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// If invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use. This should only be used as a last resort.
  pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> ClientBuilder {
    self.config.certs_verification = !accept_invalid_certs;
    self
  }
}
