//! In-flight request/response records and operator decisions.

use http::HeaderMap;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// What to do with a paused flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  /// Send the request upstream as captured.
  Forward,
  /// Reject the request without contacting the upstream.
  Drop,
  /// Replace the request with the given raw wire text, then forward it.
  ForwardRaw(String),
}

/// One request/response exchange tracked by the proxy.
///
/// A flow is owned and mutated by the connection task handling it; every
/// state of interest is published to consumers as a [`FlowSnapshot`] deep
/// copy.
#[derive(Debug)]
pub(crate) struct Flow {
  pub(crate) id: i64,
  pub(crate) started_at: OffsetDateTime,
  started: Instant,
  pub(crate) duration: std::time::Duration,
  pub(crate) method: String,
  pub(crate) url: String,
  pub(crate) host: String,
  pub(crate) request_headers: HeaderMap,
  pub(crate) request_body: Vec<u8>,
  pub(crate) req_truncated: bool,
  pub(crate) raw_request: String,
  pub(crate) status_code: u16,
  pub(crate) response_headers: HeaderMap,
  pub(crate) response_body: Vec<u8>,
  pub(crate) resp_truncated: bool,
  pub(crate) error: String,
  pub(crate) intercepted: bool,
  pub(crate) pending: bool,
  decision_tx: mpsc::Sender<Decision>,
  decision_rx: mpsc::Receiver<Decision>,
}

impl Flow {
  pub(crate) fn new(
    id: i64,
    method: String,
    url: String,
    host: String,
    request_headers: HeaderMap,
  ) -> Flow {
    // capacity 1: the first decision wins, extra sends are dropped
    let (decision_tx, decision_rx) = mpsc::channel(1);
    Flow {
      id,
      started_at: OffsetDateTime::now_utc(),
      started: Instant::now(),
      duration: std::time::Duration::ZERO,
      method,
      url,
      host,
      request_headers,
      request_body: Vec::new(),
      req_truncated: false,
      raw_request: String::new(),
      status_code: 0,
      response_headers: HeaderMap::new(),
      response_body: Vec::new(),
      resp_truncated: false,
      error: String::new(),
      intercepted: false,
      pending: true,
      decision_tx,
      decision_rx,
    }
  }

  /// Block until a decision arrives from the operator surface.
  pub(crate) async fn wait_decision(&mut self) -> Decision {
    match self.decision_rx.recv().await {
      Some(decision) => decision,
      // unreachable while the flow holds its own sender
      None => Decision::Drop,
    }
  }

  /// Mark the flow terminal: not pending, with a non-zero duration.
  pub(crate) fn finish(&mut self) {
    self.pending = false;
    self.duration = self
      .started
      .elapsed()
      .max(std::time::Duration::from_micros(1));
  }

  /// A deep copy of the flow for emission; consumers never share mutable
  /// memory with the live record.
  pub(crate) fn snapshot(&self) -> FlowSnapshot {
    FlowSnapshot {
      id: self.id,
      started_at: self.started_at,
      duration: self.duration,
      method: self.method.clone(),
      url: self.url.clone(),
      host: self.host.clone(),
      request_headers: self.request_headers.clone(),
      request_body: self.request_body.clone(),
      req_truncated: self.req_truncated,
      raw_request: self.raw_request.clone(),
      status_code: self.status_code,
      response_headers: self.response_headers.clone(),
      response_body: self.response_body.clone(),
      resp_truncated: self.resp_truncated,
      error: self.error.clone(),
      intercepted: self.intercepted,
      pending: self.pending,
      handle: FlowHandle {
        id: self.id,
        decision_tx: self.decision_tx.clone(),
      },
    }
  }
}

/// An immutable deep copy of a [`Flow`], emitted to consumers.
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
  /// Monotonic flow identifier.
  pub id: i64,
  /// When the request line was received.
  pub started_at: OffsetDateTime,
  /// Total handling time; zero until the flow is terminal.
  pub duration: std::time::Duration,
  /// Request method.
  pub method: String,
  /// Absolute request URL.
  pub url: String,
  /// Request authority.
  pub host: String,
  /// Request headers as received.
  pub request_headers: HeaderMap,
  /// Captured request body bytes, possibly truncated.
  pub request_body: Vec<u8>,
  /// Whether the request capture hit the body limit.
  pub req_truncated: bool,
  /// Editable raw wire form; only populated when the request is editable.
  pub raw_request: String,
  /// Response status code, zero before a response was seen.
  pub status_code: u16,
  /// Response headers as received from upstream.
  pub response_headers: HeaderMap,
  /// Captured response body bytes, possibly truncated.
  pub response_body: Vec<u8>,
  /// Whether the response capture hit the body limit.
  pub resp_truncated: bool,
  /// Error text for failed or dropped flows.
  pub error: String,
  /// Whether the flow was paused for a decision.
  pub intercepted: bool,
  /// Whether the flow is still waiting for a decision or a response.
  pub pending: bool,
  handle: FlowHandle,
}

impl FlowSnapshot {
  /// The decision handle for this flow.
  pub fn handle(&self) -> &FlowHandle {
    &self.handle
  }
}

/// Cheap handle through which a consumer delivers a [`Decision`] to a
/// pending flow.
#[derive(Debug, Clone)]
pub struct FlowHandle {
  id: i64,
  decision_tx: mpsc::Sender<Decision>,
}

impl FlowHandle {
  /// The id of the flow this handle decides.
  pub fn id(&self) -> i64 {
    self.id
  }

  /// Deposit a decision without blocking. The first decision wins; later
  /// sends are silently discarded.
  pub fn send_decision(&self, decision: Decision) {
    let _ = self.decision_tx.try_send(decision);
  }

  /// Shorthand for [`Decision::Forward`].
  pub fn forward(&self) {
    self.send_decision(Decision::Forward);
  }

  /// Shorthand for [`Decision::Drop`].
  pub fn drop_request(&self) {
    self.send_decision(Decision::Drop);
  }

  /// Shorthand for [`Decision::ForwardRaw`].
  pub fn forward_raw(&self, raw: impl Into<String>) {
    self.send_decision(Decision::ForwardRaw(raw.into()));
  }
}
