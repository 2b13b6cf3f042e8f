//! Replay raw requests through the shared upstream client.

use std::io;
use std::time::Duration;

use crate::client::Client;
use crate::errors::{new_io_error, Result};
use crate::httpraw;

/// Sends operator-edited raw requests on demand.
///
/// The repeater shares the proxy's upstream [`Client`], so replayed
/// requests reuse pooled connections and the same TLS configuration.
pub struct Repeater {
  client: Client,
}

impl Repeater {
  /// Create a repeater on top of an existing client.
  pub fn new(client: Client) -> Self {
    Repeater { client }
  }

  /// Parse `raw` as an HTTP/1.1 request, send it, and return the response
  /// status line (`"200 OK"`) and body text.
  pub async fn send_raw(&self, raw: &str, timeout: Duration) -> Result<(String, String)> {
    let request = httpraw::parse_request(raw)?;
    let response = tokio::time::timeout(timeout, self.client.execute(request))
      .await
      .map_err(|_| new_io_error(io::ErrorKind::TimedOut, "request timed out"))??;
    let status = format!(
      "{} {}",
      response.status_code().as_u16(),
      response.status_code().canonical_reason().unwrap_or("")
    );
    Ok((status, response.text()))
  }
}
