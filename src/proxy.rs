//! Proxy engine: accept loop, dispatch, interception and forwarding.

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::ca;
use crate::client::{Client, UpstreamResponse};
use crate::controller::Controller;
use crate::errors::{Error, Result};
use crate::flow::{Decision, Flow, FlowSnapshot};
use crate::httpraw;
use crate::limit::LimitBuffer;
use crate::request::Request;
use crate::response::{parser_headers, FramedReader, Framing};

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;
const COPY_CHUNK: usize = 32 * 1024;
const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNSTREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);
const DEFAULT_SNAPSHOT_CAPACITY: usize = 1024;

/// Hosts that answer the in-proxy CA download URL in MITM mode.
const CA_HOSTS: [&str; 2] = ["burpui.local", "burpui"];
const CA_PATHS: [&str; 2] = ["/ca", "/cacert"];

/// Configuration for the proxy engine.
#[derive(Debug, Clone)]
pub struct Config {
  /// Address the listener binds to.
  pub listen_addr: String,
  /// Cap on captured body bytes per direction; zero or less captures
  /// nothing but allows editing bodies of any size.
  pub max_body_bytes: i64,
  /// Terminate TLS for `CONNECT` requests using the local CA.
  pub mitm: bool,
  /// Directory holding the CA material when `mitm` is set.
  pub ca_dir: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
      max_body_bytes: 4 << 20,
      mitm: false,
      ca_dir: PathBuf::from("./ca"),
    }
  }
}

/// The proxy engine.
///
/// Accepts client connections, forwards or pauses requests according to
/// the [`Controller`], and publishes [`FlowSnapshot`]s on the channel
/// returned by [`ProxyServerBuilder::build`].
pub struct ProxyServer {
  shared: Arc<Shared>,
}

struct Shared {
  cfg: Config,
  controller: Arc<Controller>,
  client: Client,
  ca: Option<Arc<ca::Store>>,
  flow_tx: mpsc::Sender<FlowSnapshot>,
  next_flow_id: AtomicI64,
}

impl Shared {
  fn next_id(&self) -> i64 {
    self.next_flow_id.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// Non-blocking emission: a lagging consumer loses the newest snapshot
  /// rather than stalling the request.
  fn emit(&self, flow: &Flow) {
    let _ = self.flow_tx.try_send(flow.snapshot());
  }
}

/// Builder for [`ProxyServer`].
#[must_use]
pub struct ProxyServerBuilder {
  config: Config,
  controller: Option<Arc<Controller>>,
  client: Option<Client>,
  snapshot_capacity: usize,
}

impl Default for ProxyServerBuilder {
  fn default() -> Self {
    Self {
      config: Config::default(),
      controller: None,
      client: None,
      snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
    }
  }
}

impl ProxyServerBuilder {
  /// Set the engine configuration.
  pub fn config(mut self, config: Config) -> Self {
    self.config = config;
    self
  }

  /// Share a `Controller` with an operator surface.
  pub fn controller(mut self, controller: Arc<Controller>) -> Self {
    self.controller = Some(controller);
    self
  }

  /// Provide a fully constructed upstream `Client` to use.
  pub fn client(mut self, client: Client) -> Self {
    self.client = Some(client);
    self
  }

  /// Capacity of the snapshot channel. Default is 1024.
  pub fn snapshot_capacity(mut self, capacity: usize) -> Self {
    self.snapshot_capacity = capacity.max(1);
    self
  }

  /// Build the engine and the snapshot receiver.
  ///
  /// Loads or creates the CA store when MITM is enabled; a CA failure here
  /// is fatal, matching the initialization contract of the CLI.
  pub async fn build(self) -> Result<(ProxyServer, mpsc::Receiver<FlowSnapshot>)> {
    let controller = self.controller.unwrap_or_default();
    let client = match self.client {
      Some(client) => client,
      None => Client::builder().keepalive(true).build()?,
    };
    let ca = if self.config.mitm {
      Some(Arc::new(ca::Store::load_or_create(&self.config.ca_dir).await?))
    } else {
      None
    };
    let (flow_tx, flow_rx) = mpsc::channel(self.snapshot_capacity);
    let server = ProxyServer {
      shared: Arc::new(Shared {
        cfg: self.config,
        controller,
        client,
        ca,
        flow_tx,
        next_flow_id: AtomicI64::new(0),
      }),
    };
    Ok((server, flow_rx))
  }
}

impl ProxyServer {
  /// Creates a `ProxyServerBuilder` to configure an engine.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The interception controller shared with operator surfaces.
  pub fn controller(&self) -> Arc<Controller> {
    self.shared.controller.clone()
  }

  /// The shared upstream client; also used by the repeater.
  pub fn client(&self) -> Client {
    self.shared.client.clone()
  }

  /// The CA store, present when MITM is enabled.
  pub fn ca(&self) -> Option<Arc<ca::Store>> {
    self.shared.ca.clone()
  }

  /// Bind the configured address and accept connections until `shutdown`
  /// is signalled.
  pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(&self.shared.cfg.listen_addr)
      .await
      .map_err(|e| {
        Error::proxy_error(format!(
          "failed to bind {}: {}",
          self.shared.cfg.listen_addr, e
        ))
      })?;
    self.serve_with_listener(listener, shutdown).await
  }

  /// Accept connections from an existing listener until `shutdown` is
  /// signalled, then drain in-flight connections for at most two seconds.
  pub async fn serve_with_listener(
    &self,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
  ) -> Result<()> {
    if *shutdown.borrow() {
      return Ok(());
    }
    let mut tasks = JoinSet::new();
    loop {
      tokio::select! {
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let shared = self.shared.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
              if let Err(e) = handle_connection(shared, stream, shutdown).await {
                tracing::debug!("[proxy] connection from {} ended: {}", peer, e);
              }
            });
          }
          Err(e) => {
            tracing::error!("[proxy] failed to accept connection: {}", e);
          }
        },
        _ = shutdown.changed() => break,
        Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
      }
    }
    drop(listener);
    let drain = async {
      while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
      tasks.abort_all();
    }
    Ok(())
  }
}

/// Parsed request line and headers, read off the downstream stream.
#[derive(Debug)]
struct RequestHead {
  method: Method,
  target: String,
  headers: HeaderMap,
}

/// The CONNECT context of requests read from a MITM TLS stream.
struct MitmTarget<'a> {
  /// Authority as sent in the CONNECT line.
  authority: &'a str,
  /// Authority with the port stripped.
  hostname: &'a str,
}

async fn handle_connection(
  shared: Arc<Shared>,
  stream: TcpStream,
  shutdown: watch::Receiver<bool>,
) -> Result<()> {
  let mut reader = BufReader::new(stream);
  loop {
    let head = match read_request_head(&mut reader).await? {
      Some(head) => head,
      None => return Ok(()),
    };
    if head.method == Method::CONNECT {
      return handle_connect(shared, reader, head, shutdown).await;
    }
    if is_ca_download(&shared, &head) {
      serve_ca(&shared, &mut reader, &head).await?;
      continue;
    }
    let keep_alive = handle_flow(&shared, &mut reader, head, None, &shutdown).await?;
    if !keep_alive {
      return Ok(());
    }
  }
}

/// Read one request head; `None` on a clean end of stream.
async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<RequestHead>> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if line.len() > MAX_REQUEST_LINE {
    return Err(Error::parse_error("request line too long"));
  }
  let text = String::from_utf8_lossy(&line);
  let mut parts = text.split_whitespace();
  let method_text = parts
    .next()
    .ok_or_else(|| Error::parse_error("empty request line"))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::parse_error("invalid request line"))?
    .to_string();
  let version = parts
    .next()
    .ok_or_else(|| Error::parse_error("invalid request line"))?;
  if version != "HTTP/1.1" && version != "HTTP/1.0" {
    return Err(Error::parse_error(format!(
      "unsupported protocol version: {}",
      version
    )));
  }
  let method = Method::from_bytes(method_text.as_bytes())
    .map_err(|_| Error::parse_error(format!("invalid method: {}", method_text)))?;

  let mut headers = HeaderMap::new();
  let mut total = line.len();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let n = reader.read_until(b'\n', &mut header_line).await?;
    if n == 0 {
      return Err(Error::parse_error("connection closed inside headers"));
    }
    total += n;
    if total > MAX_HEADER_BYTES {
      return Err(Error::parse_error("headers too large"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
      headers.append(k, v);
    }
  }
  Ok(Some(RequestHead {
    method,
    target,
    headers,
  }))
}

fn is_ca_download(shared: &Shared, head: &RequestHead) -> bool {
  if !shared.cfg.mitm || !head.target.starts_with("http://") {
    return false;
  }
  let Ok(uri) = head.target.parse::<Uri>() else {
    return false;
  };
  let host_ok = uri.host().map(|h| CA_HOSTS.contains(&h)).unwrap_or(false);
  host_ok && CA_PATHS.contains(&uri.path())
}

async fn serve_ca<S>(shared: &Shared, reader: &mut BufReader<S>, head: &RequestHead) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // drain any request body so the next head parses cleanly
  let framing = Framing::for_request(&head.headers);
  {
    let mut body = FramedReader::new(&mut *reader, framing);
    let mut sink = Vec::new();
    let _ = body.read_to_end(&mut sink).await;
  }
  let stream = reader.get_mut();
  match &shared.ca {
    Some(store) => {
      let pem = store.root_cert_pem();
      let out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/x-pem-file\r\nContent-Disposition: attachment; filename=burpui-ca.pem\r\nContent-Length: {}\r\n\r\n{}",
        pem.len(),
        pem
      );
      write_all_timed(stream, out.as_bytes()).await?;
      flush_timed(stream).await?;
    }
    None => {
      write_simple_response(stream, StatusCode::NOT_FOUND, "not found\n").await?;
    }
  }
  Ok(())
}

/// Shared request handling for plain and MITM streams. Returns whether the
/// downstream connection can carry another request.
async fn handle_flow<S>(
  shared: &Arc<Shared>,
  reader: &mut BufReader<S>,
  head: RequestHead,
  mitm: Option<&MitmTarget<'_>>,
  shutdown: &watch::Receiver<bool>,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let (url, flow_host) = match resolve_target(&head, mitm) {
    Ok(resolved) => resolved,
    Err(Error::MissingHost) => {
      let _ = write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, "bad request\n").await;
      return Ok(false);
    }
    Err(e) => return Err(e),
  };
  let client_wants_close = wants_close(&head.headers);

  let mut flow = Flow::new(
    shared.next_id(),
    head.method.to_string(),
    url.clone(),
    flow_host.clone(),
    head.headers.clone(),
  );
  shared.emit(&flow);

  let body_framing = Framing::for_request(&head.headers);
  let want_intercept = shared.controller.intercept_enabled()
    || shared
      .controller
      .should_break(&flow.method, &flow.url, &flow.host);
  let can_edit = match body_framing {
    Framing::None => true,
    Framing::Length(n) => {
      shared.cfg.max_body_bytes <= 0 || (n as i64) <= shared.cfg.max_body_bytes
    }
    Framing::Chunked | Framing::Eof => false,
  };

  if want_intercept {
    flow.intercepted = true;
    flow.pending = true;
    let mut buffered_body: Option<Bytes> = None;
    if can_edit {
      match read_full_body(reader, body_framing).await {
        Ok(body) => {
          flow.request_body = body.to_vec();
          flow.req_truncated = false;
          flow.raw_request = httpraw::render_raw_request(
            &flow.method,
            &flow.url,
            &flow.host,
            &flow.request_headers,
            &flow.request_body,
          );
          buffered_body = Some(body);
        }
        Err(e) => {
          flow.error = e.to_string();
          flow.finish();
          shared.emit(&flow);
          let _ =
            write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, "bad request\n")
              .await;
          return Ok(false);
        }
      }
    }
    shared.emit(&flow);

    let mut shutdown = shutdown.clone();
    loop {
      let decision = if *shutdown.borrow() {
        None
      } else {
        tokio::select! {
          decision = flow.wait_decision() => Some(decision),
          _ = shutdown.changed() => None,
        }
      };
      // a shutdown unblocks the pending flow as a drop
      let decision = decision.unwrap_or(Decision::Drop);
      match decision {
        Decision::Drop => {
          flow.error = "dropped".to_string();
          flow.finish();
          shared.emit(&flow);
          let _ = write_simple_response(
            reader.get_mut(),
            StatusCode::IM_A_TEAPOT,
            "dropped\n",
          )
          .await;
          return Ok(false);
        }
        Decision::Forward => {
          flow.pending = false;
          shared.emit(&flow);
          if let Some(body) = buffered_body.take() {
            let request = prepared_request(&head.method, &flow.url, &head.headers, body)?;
            return send_prepared(shared, reader, request, &mut flow, mitm, client_wants_close)
              .await;
          }
          return stream_forward(
            shared,
            reader,
            &head,
            body_framing,
            &mut flow,
            mitm,
            client_wants_close,
          )
          .await;
        }
        Decision::ForwardRaw(raw) => {
          if !can_edit {
            flow.error = "edit not available for this request".to_string();
            shared.emit(&flow);
            continue;
          }
          let mut request = match httpraw::parse_request(&raw) {
            Ok(request) => request,
            Err(e) => {
              flow.error = format!("parse: {}", e);
              shared.emit(&flow);
              continue;
            }
          };
          if mitm.is_some() {
            force_https(&mut request)?;
          }
          flow.method = request.method().to_string();
          flow.host = match mitm {
            Some(target) => target.hostname.to_string(),
            None => request.host().to_string(),
          };
          flow.url = request.uri().to_string();
          flow.request_headers = request.headers().clone();
          flow.request_body = request.body().to_vec();
          flow.req_truncated = false;
          flow.raw_request = raw;
          flow.error.clear();
          flow.pending = false;
          shared.emit(&flow);

          let cleaned = clean_hop_by_hop(request.headers());
          *request.headers_mut() = cleaned;
          return send_prepared(shared, reader, request, &mut flow, mitm, client_wants_close)
            .await;
        }
      }
    }
  }

  stream_forward(
    shared,
    reader,
    &head,
    body_framing,
    &mut flow,
    mitm,
    client_wants_close,
  )
  .await
}

/// Resolve the absolute URL and the flow host for a request head.
fn resolve_target(head: &RequestHead, mitm: Option<&MitmTarget<'_>>) -> Result<(String, String)> {
  if let Some(target) = mitm {
    let url_host = strip_default_port(target.authority, 443);
    let url = if head.target.starts_with("http://") || head.target.starts_with("https://") {
      head.target.clone()
    } else {
      format!("https://{}{}", url_host, head.target)
    };
    return Ok((url, target.hostname.to_string()));
  }
  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    let uri: Uri = head
      .target
      .parse()
      .map_err(|e| Error::parse_error(format!("invalid request target: {}", e)))?;
    let host = uri
      .authority()
      .map(|a| a.as_str().to_string())
      .ok_or(Error::MissingHost)?;
    return Ok((uri.to_string(), host));
  }
  let host = head
    .headers
    .get(http::header::HOST)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .trim()
    .to_string();
  if host.is_empty() {
    return Err(Error::MissingHost);
  }
  Ok((format!("http://{}{}", host, head.target), host))
}

fn strip_default_port(authority: &str, default_port: u16) -> &str {
  let suffix = format!(":{}", default_port);
  authority.strip_suffix(suffix.as_str()).unwrap_or(authority)
}

fn force_https(request: &mut Request) -> Result<()> {
  let mut parts = request.uri().clone().into_parts();
  parts.scheme = Some(http::uri::Scheme::HTTPS);
  *request.uri_mut() =
    Uri::from_parts(parts).map_err(|e| Error::parse_error(format!("invalid request URI: {}", e)))?;
  Ok(())
}

/// Build the outgoing request for an edited or buffered forward.
fn prepared_request(
  method: &Method,
  url: &str,
  headers: &HeaderMap,
  body: Bytes,
) -> Result<Request> {
  let uri: Uri = url
    .parse()
    .map_err(|e| Error::parse_error(format!("invalid request URL: {}", e)))?;
  let mut request = Request::new(method.clone(), uri);
  *request.headers_mut() = clean_hop_by_hop(headers);
  request.set_body(body);
  Ok(request)
}

async fn read_full_body<R: AsyncBufRead + Unpin>(reader: &mut R, framing: Framing) -> Result<Bytes> {
  let mut body = FramedReader::new(reader, framing);
  let mut out = Vec::new();
  body.read_to_end(&mut out).await?;
  Ok(out.into())
}

async fn send_prepared<S>(
  shared: &Arc<Shared>,
  reader: &mut BufReader<S>,
  request: Request,
  flow: &mut Flow,
  mitm: Option<&MitmTarget<'_>>,
  client_wants_close: bool,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match shared.client.send(&request).await {
    Ok(upstream) => {
      write_response(shared, reader, upstream, flow, client_wants_close).await
    }
    Err(e) => {
      fail_upstream(shared, reader, flow, mitm, e).await;
      Ok(false)
    }
  }
}

async fn stream_forward<S>(
  shared: &Arc<Shared>,
  reader: &mut BufReader<S>,
  head: &RequestHead,
  body_framing: Framing,
  flow: &mut Flow,
  mitm: Option<&MitmTarget<'_>>,
  client_wants_close: bool,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let uri: Uri = flow
    .url
    .parse()
    .map_err(|e| Error::parse_error(format!("invalid request URL: {}", e)))?;
  let mut request = Request::new(head.method.clone(), uri);
  *request.headers_mut() = clean_hop_by_hop(&head.headers);

  let mut tee = LimitBuffer::new(shared.cfg.max_body_bytes);
  let sent = {
    let mut body = FramedReader::new(&mut *reader, body_framing);
    shared
      .client
      .send_streamed(&request, &mut body, &mut tee)
      .await
  };
  flow.req_truncated = tee.truncated();
  flow.request_body = tee.into_bytes();

  match sent {
    Ok(upstream) => write_response(shared, reader, upstream, flow, client_wants_close).await,
    Err(Error::Parse(msg)) => {
      flow.error = msg;
      flow.finish();
      shared.emit(flow);
      let _ =
        write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, "bad request\n").await;
      Ok(false)
    }
    Err(e) => {
      fail_upstream(shared, reader, flow, mitm, e).await;
      Ok(false)
    }
  }
}

/// Record an upstream failure on the flow; plain HTTP answers 502, MITM
/// streams close silently.
async fn fail_upstream<S>(
  shared: &Arc<Shared>,
  reader: &mut BufReader<S>,
  flow: &mut Flow,
  mitm: Option<&MitmTarget<'_>>,
  error: Error,
) where
  S: AsyncRead + AsyncWrite + Unpin,
{
  flow.error = error.to_string();
  flow.finish();
  shared.emit(flow);
  if mitm.is_none() {
    let _ =
      write_simple_response(reader.get_mut(), StatusCode::BAD_GATEWAY, "bad gateway\n").await;
  }
}

/// Stream the upstream response to the client in 32 KiB chunks, teeing the
/// body into the flow's capture buffer, then finalize and emit the flow.
async fn write_response<S>(
  shared: &Arc<Shared>,
  reader: &mut BufReader<S>,
  mut upstream: UpstreamResponse,
  flow: &mut Flow,
  client_wants_close: bool,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  flow.status_code = upstream.status.as_u16();
  flow.response_headers = upstream.headers.clone();

  let mut headers = clean_hop_by_hop(&upstream.headers);
  let chunked_out = upstream.is_unbounded();
  if chunked_out {
    // length unknown: re-chunk rather than forwarding the framing verbatim
    headers.remove(CONTENT_LENGTH);
    headers.insert(TRANSFER_ENCODING, http::HeaderValue::from_static("chunked"));
  }

  let stream = reader.get_mut();
  let mut downstream_ok = write_response_head(stream, upstream.status, &headers)
    .await
    .is_ok();

  let mut tee = LimitBuffer::new(shared.cfg.max_body_bytes);
  let mut buf = vec![0u8; COPY_CHUNK];
  let mut upstream_clean = true;
  loop {
    let n = match upstream.read_chunk(&mut buf).await {
      Ok(0) => break,
      Ok(n) => n,
      Err(e) => {
        flow.error = e.to_string();
        upstream_clean = false;
        break;
      }
    };
    tee.write(&buf[..n]);
    if downstream_ok {
      let written = if chunked_out {
        write_chunk(stream, &buf[..n]).await
      } else {
        write_all_timed(stream, &buf[..n]).await
      };
      if written.is_err() {
        // client went away or stopped reading; keep draining upstream for
        // the capture
        downstream_ok = false;
      }
    }
  }
  if chunked_out && downstream_ok && upstream_clean {
    downstream_ok = write_all_timed(stream, b"0\r\n\r\n").await.is_ok();
  }
  let _ = flush_timed(stream).await;

  flow.resp_truncated = tee.truncated();
  flow.response_body = tee.into_bytes();
  upstream.finish().await;
  flow.finish();
  shared.emit(flow);

  Ok(downstream_ok && upstream_clean && !client_wants_close)
}

/// Write bounded by the downstream write timeout, so a client that stops
/// reading cannot hang the connection task.
async fn write_all_timed<W: AsyncWrite + Unpin>(w: &mut W, buf: &[u8]) -> std::io::Result<()> {
  tokio::time::timeout(DOWNSTREAM_WRITE_TIMEOUT, w.write_all(buf)).await?
}

async fn flush_timed<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
  tokio::time::timeout(DOWNSTREAM_WRITE_TIMEOUT, w.flush()).await?
}

async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
  write_all_timed(w, format!("{:x}\r\n", data.len()).as_bytes()).await?;
  write_all_timed(w, data).await?;
  write_all_timed(w, b"\r\n").await
}

async fn write_response_head<W: AsyncWrite + Unpin>(
  w: &mut W,
  status: StatusCode,
  headers: &HeaderMap,
) -> std::io::Result<()> {
  let mut out = Vec::with_capacity(256);
  out.extend(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (k, v) in headers.iter() {
    out.extend(k.as_str().as_bytes());
    out.extend(b": ");
    out.extend(v.as_bytes());
    out.extend(b"\r\n");
  }
  out.extend(b"\r\n");
  write_all_timed(w, &out).await
}

async fn write_simple_response<W: AsyncWrite + Unpin>(
  w: &mut W,
  status: StatusCode,
  body: &str,
) -> std::io::Result<()> {
  let head = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown"),
    body.len()
  );
  write_all_timed(w, head.as_bytes()).await?;
  write_all_timed(w, body.as_bytes()).await?;
  flush_timed(w).await
}

/// Remove hop-by-hop headers: first everything named by `Connection`, then
/// the fixed set. The input map is cloned, never mutated in place.
fn clean_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
  let mut cleaned = headers.clone();
  let named: Vec<String> = cleaned
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_string())
    .filter(|t| !t.is_empty())
    .collect();
  for name in named {
    if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
      cleaned.remove(name);
    }
  }
  for name in [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
  ] {
    cleaned.remove(name);
  }
  cleaned
}

fn wants_close(headers: &HeaderMap) -> bool {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case("close"))
}

async fn handle_connect(
  shared: Arc<Shared>,
  reader: BufReader<TcpStream>,
  head: RequestHead,
  shutdown: watch::Receiver<bool>,
) -> Result<()> {
  if shared.cfg.mitm && shared.ca.is_some() {
    return handle_connect_mitm(shared, reader, head, shutdown).await;
  }
  handle_tunnel(reader, head).await
}

/// Opaque bidirectional relay for `CONNECT` without MITM. No flow is
/// created for tunnelled traffic.
async fn handle_tunnel(mut reader: BufReader<TcpStream>, head: RequestHead) -> Result<()> {
  let authority = head.target;
  let target = match tokio::time::timeout(
    CONNECT_DIAL_TIMEOUT,
    TcpStream::connect(authority.as_str()),
  )
  .await
  {
    Ok(Ok(stream)) => stream,
    Ok(Err(e)) => {
      tracing::debug!("[proxy] tunnel dial {} failed: {}", authority, e);
      let _ =
        write_simple_response(reader.get_mut(), StatusCode::BAD_GATEWAY, "bad gateway\n").await;
      return Ok(());
    }
    Err(_) => {
      tracing::debug!("[proxy] tunnel dial {} timed out", authority);
      let _ =
        write_simple_response(reader.get_mut(), StatusCode::BAD_GATEWAY, "bad gateway\n").await;
      return Ok(());
    }
  };

  let buffered = reader.buffer().to_vec();
  let mut client_stream = reader.into_inner();
  client_stream
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  client_stream.flush().await?;

  let mut target_stream = target;
  // bytes already read past the CONNECT head belong to the server-bound half
  if !buffered.is_empty() {
    target_stream.write_all(&buffered).await?;
  }

  let (mut client_read, mut client_write) = client_stream.split();
  let (mut target_read, mut target_write) = target_stream.split();
  let client_to_target = tokio::io::copy(&mut client_read, &mut target_write);
  let target_to_client = tokio::io::copy(&mut target_read, &mut client_write);
  tokio::select! {
    _ = client_to_target => {},
    _ = target_to_client => {},
  }
  Ok(())
}

/// Terminate TLS with a CA-issued leaf and proxy the requests inside.
async fn handle_connect_mitm(
  shared: Arc<Shared>,
  reader: BufReader<TcpStream>,
  head: RequestHead,
  shutdown: watch::Receiver<bool>,
) -> Result<()> {
  let Some(store) = shared.ca.clone() else {
    return Ok(());
  };
  let authority = head.target.clone();
  let (hostname, _port) = split_authority(&authority);

  let leaf = match store.leaf_cert(&hostname).await {
    Ok(leaf) => leaf,
    Err(e) => {
      tracing::error!("[mitm] leaf issuance for {} failed: {}", hostname, e);
      return Ok(());
    }
  };
  let tls_config = match create_tls_server_config(&leaf, store.root_cert()) {
    Ok(config) => config,
    Err(e) => {
      tracing::error!("[mitm] TLS config for {} failed: {}", hostname, e);
      return Ok(());
    }
  };

  let buffered = reader.buffer().to_vec();
  let mut tcp = reader.into_inner();
  tcp
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  tcp.flush().await?;

  let acceptor = TlsAcceptor::from(Arc::new(tls_config));
  let tls_stream = match acceptor.accept(PrefixedStream::new(buffered, tcp)).await {
    Ok(stream) => stream,
    Err(e) => {
      tracing::debug!("[mitm] handshake with client for {} failed: {}", hostname, e);
      return Ok(());
    }
  };

  let target = MitmTarget {
    authority: &authority,
    hostname: &hostname,
  };
  let mut tls_reader = BufReader::new(tls_stream);
  loop {
    let head = match read_request_head(&mut tls_reader).await {
      Ok(Some(head)) => head,
      Ok(None) | Err(_) => break,
    };
    let keep_alive = handle_flow(&shared, &mut tls_reader, head, Some(&target), &shutdown).await?;
    if !keep_alive {
      break;
    }
  }
  let mut tls_stream = tls_reader.into_inner();
  let _ = tls_stream.shutdown().await;
  Ok(())
}

fn create_tls_server_config(
  leaf: &ca::LeafCert,
  root: tokio_rustls::rustls::pki_types::CertificateDer<'static>,
) -> Result<ServerConfig> {
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let versions = [&rustls::version::TLS12, &rustls::version::TLS13];
  ServerConfig::builder_with_provider(provider)
    .with_protocol_versions(&versions)
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(vec![leaf.cert_der(), root], leaf.key_der())
    .map_err(|e| Error::tls_error(format!("failed to create TLS config: {}", e)))
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
fn split_authority(authority: &str) -> (String, Option<u16>) {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some((host, tail)) = rest.split_once(']') {
      let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
      return (host.to_string(), port);
    }
    return (authority.to_string(), None);
  }
  match authority.rsplit_once(':') {
    Some((host, port_text)) => match port_text.parse::<u16>() {
      Ok(port) => (host.to_string(), Some(port)),
      Err(_) => (authority.to_string(), None),
    },
    None => (authority.to_string(), None),
  }
}

/// A stream that replays bytes the head parser had already buffered before
/// handing the connection over (TLS records pipelined after CONNECT).
struct PrefixedStream<S> {
  prefix: Vec<u8>,
  pos: usize,
  inner: S,
}

impl<S> PrefixedStream<S> {
  fn new(prefix: Vec<u8>, inner: S) -> Self {
    PrefixedStream {
      prefix,
      pos: 0,
      inner,
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if self.pos < self.prefix.len() {
      let remaining = &self.prefix[self.pos..];
      let n = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..n]);
      self.pos += n;
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::HeaderValue;
  use tokio::io::AsyncReadExt;

  #[test]
  fn hop_by_hop_headers_are_removed() {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Strip"));
    headers.insert("x-strip", HeaderValue::from_static("gone"));
    headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
    headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
    headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
    headers.insert("upgrade", HeaderValue::from_static("websocket"));
    headers.insert("x-keep", HeaderValue::from_static("stays"));
    let cleaned = clean_hop_by_hop(&headers);
    for name in [
      "connection",
      "x-strip",
      "proxy-connection",
      "keep-alive",
      "transfer-encoding",
      "upgrade",
    ] {
      assert!(cleaned.get(name).is_none(), "{} should be removed", name);
    }
    assert_eq!(cleaned.get("x-keep").unwrap(), "stays");
    // the input map is untouched
    assert!(headers.get("x-strip").is_some());
  }

  #[test]
  fn authority_splitting() {
    assert_eq!(split_authority("example.test:443"), ("example.test".into(), Some(443)));
    assert_eq!(split_authority("example.test"), ("example.test".into(), None));
    assert_eq!(split_authority("[::1]:8443"), ("::1".into(), Some(8443)));
    assert_eq!(split_authority("127.0.0.1:80"), ("127.0.0.1".into(), Some(80)));
  }

  #[test]
  fn default_port_stripping() {
    assert_eq!(strip_default_port("example.test:443", 443), "example.test");
    assert_eq!(strip_default_port("example.test:8443", 443), "example.test:8443");
  }

  #[tokio::test]
  async fn prefixed_stream_replays_buffered_bytes() {
    let inner: &[u8] = b"world";
    let mut stream = PrefixedStream::new(b"hello ".to_vec(), inner);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello world");
  }
}
