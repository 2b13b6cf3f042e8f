//! Structured outgoing request and its HTTP/1.1 wire form.

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Uri, Version};

use crate::{COLON_SPACE, CR_LF, SPACE};

/// A request which can be executed with `Client::execute()`.
///
/// The URI is always absolute by the time a request reaches the upstream
/// client; the wire form uses the origin-form request target and carries the
/// authority in the `Host` header.
#[derive(Debug, Default, Clone)]
pub struct Request {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl Request {
  /// Create a request for `method` and an absolute `uri`.
  pub fn new(method: Method, uri: Uri) -> Request {
    Request {
      method,
      uri,
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  /// Get the HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Get a mutable reference to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }

  /// Get the URI of this request.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// Get a mutable reference to the URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }

  /// The authority component of the URI, empty when the URI is relative.
  #[inline]
  pub fn host(&self) -> &str {
    self.uri.authority().map(|a| a.as_str()).unwrap_or("")
  }

  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Get the body bytes.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }

  /// Replace the body bytes.
  pub fn set_body<B: Into<Bytes>>(&mut self, body: B) {
    self.body = body.into();
  }

  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// Render the full wire form: request line in origin-form, `Host` first
  /// when the header map lacks one, `Content-Length` synced to the body.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut headers = self.headers.clone();
    if !self.body.is_empty() {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    } else if headers.contains_key(CONTENT_LENGTH) {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
    }
    let mut out = self.render_head(&headers);
    if !self.body.is_empty() {
      out.extend(self.body.as_ref());
    }
    Bytes::from(out)
  }

  /// Render only the head, for requests whose body is streamed separately.
  /// When `chunked` is set a `Transfer-Encoding: chunked` line is written and
  /// any stale `Content-Length` is dropped.
  pub(crate) fn to_raw_head(&self, chunked: bool) -> Bytes {
    let mut headers = self.headers.clone();
    if chunked {
      headers.remove(CONTENT_LENGTH);
      headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
    Bytes::from(self.render_head(&headers))
  }

  fn render_head(&self, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(self.method.as_str().as_bytes());
    out.extend(SPACE);
    let path = self.uri.path();
    out.extend(if path.is_empty() { "/" } else { path }.as_bytes());
    if let Some(q) = self.uri.query() {
      out.extend(b"?");
      out.extend(q.as_bytes());
    }
    out.extend(SPACE);
    out.extend(format!("{:?}", self.version).as_bytes());
    out.extend(CR_LF);
    if headers.get(HOST).is_none() {
      out.extend(HOST.as_str().as_bytes());
      out.extend(COLON_SPACE);
      if let Some(authority) = self.uri.authority() {
        out.extend(authority.as_str().as_bytes());
      }
      out.extend(CR_LF);
    }
    for (k, v) in headers.iter() {
      out.extend(k.as_str().as_bytes());
      out.extend(COLON_SPACE);
      out.extend(v.as_bytes());
      out.extend(CR_LF);
    }
    out.extend(CR_LF);
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wire_form_is_origin_form_with_host() {
    let mut req = Request::new(Method::GET, Uri::from_static("http://example.test/a/b?x=1"));
    req
      .headers_mut()
      .insert("x-custom", HeaderValue::from_static("1"));
    let raw = req.to_raw();
    let text = String::from_utf8(raw.to_vec()).unwrap();
    assert!(text.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
    assert!(text.contains("host: example.test\r\n") || text.contains("Host: example.test\r\n"));
    assert!(text.contains("x-custom: 1\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[test]
  fn content_length_tracks_body() {
    let mut req = Request::new(Method::POST, Uri::from_static("http://example.test/x"));
    req
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
    req.set_body("abc");
    let text = String::from_utf8(req.to_raw().to_vec()).unwrap();
    assert!(text.contains("content-length: 3\r\n"));
    assert!(text.ends_with("\r\n\r\nabc"));
  }

  #[test]
  fn host_header_wins_over_authority() {
    let mut req = Request::new(Method::GET, Uri::from_static("http://example.test/"));
    req
      .headers_mut()
      .insert(HOST, HeaderValue::from_static("other.test"));
    let text = String::from_utf8(req.to_raw().to_vec()).unwrap();
    assert_eq!(text.matches("ost:").count(), 1);
    assert!(text.contains("host: other.test\r\n"));
  }

  #[test]
  fn chunked_head_replaces_length() {
    let mut req = Request::new(Method::POST, Uri::from_static("http://example.test/up"));
    req
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
    let text = String::from_utf8(req.to_raw_head(true).to_vec()).unwrap();
    assert!(!text.contains("content-length"));
    assert!(text.contains("transfer-encoding: chunked\r\n"));
  }
}
