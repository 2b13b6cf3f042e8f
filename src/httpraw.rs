//! Raw request text codec used for editing and replay.
//!
//! Operators edit requests as plain HTTP/1.1 text. Parsing is forgiving
//! about line endings and a missing final blank line; rendering produces a
//! form that parses back to the same request.

use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method, Uri};

use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::parser_headers;

/// Parse an editable raw request into a structured [`Request`].
///
/// Line endings are normalized to LF and a blank line is appended, so text
/// without a terminating empty line still parses. An absolute request
/// target supplies scheme and host; otherwise the scheme defaults to
/// `http` and the host comes from the `Host` header. Fails with
/// [`Error::MissingHost`] when neither names a host.
///
/// The body is the text after the first blank line, truncated to
/// `Content-Length` when that header is present; without one the body is
/// empty.
pub fn parse_request(raw: &str) -> Result<Request> {
  let normalized = raw.replace("\r\n", "\n");
  let normalized = format!("{}\n\n", normalized.trim());

  let (head, body_text) = match normalized.find("\n\n") {
    Some(i) => (&normalized[..i], &normalized[i + 2..]),
    None => (normalized.as_str(), ""),
  };

  let mut lines = head.lines();
  let request_line = lines
    .next()
    .filter(|l| !l.trim().is_empty())
    .ok_or_else(|| Error::parse_error("empty request"))?;
  let mut parts = request_line.split_whitespace();
  let method_text = parts
    .next()
    .ok_or_else(|| Error::parse_error("invalid request line"))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::parse_error("invalid request line"))?;
  let version_text = parts
    .next()
    .ok_or_else(|| Error::parse_error("invalid request line"))?;
  if !version_text.starts_with("HTTP/") {
    return Err(Error::parse_error(format!(
      "invalid protocol version: {}",
      version_text
    )));
  }
  let method = Method::from_bytes(method_text.as_bytes())
    .map_err(|_| Error::parse_error(format!("invalid method: {}", method_text)))?;

  let mut headers = HeaderMap::new();
  for line in lines {
    if let Ok((Some(k), Some(v))) = parser_headers(line.as_bytes()) {
      headers.append(k, v);
    }
  }

  let uri = resolve_target(target, &headers)?;

  let mut body = body_text.as_bytes().to_vec();
  match headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.parse::<usize>().ok())
  {
    Some(len) => body.truncate(len),
    None => body.clear(),
  }

  let mut request = Request::new(method, uri);
  *request.headers_mut() = headers;
  request.set_body(body);
  Ok(request)
}

fn resolve_target(target: &str, headers: &HeaderMap) -> Result<Uri> {
  if target.starts_with("http://") || target.starts_with("https://") {
    let uri: Uri = target
      .parse()
      .map_err(|e| Error::parse_error(format!("invalid request target: {}", e)))?;
    if uri.host().is_none() {
      return Err(Error::MissingHost);
    }
    return Ok(uri);
  }
  let host = headers
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .trim();
  if host.is_empty() {
    return Err(Error::MissingHost);
  }
  let target = if target.is_empty() { "/" } else { target };
  if !target.starts_with('/') {
    return Err(Error::parse_error(format!(
      "invalid request target: {}",
      target
    )));
  }
  Uri::builder()
    .scheme("http")
    .authority(host)
    .path_and_query(target)
    .build()
    .map_err(|e| Error::parse_error(format!("invalid request target: {}", e)))
}

/// Render the editable raw form of a captured request.
///
/// Exactly one `Host:` line is written, sourced from `host`; any `Host`
/// entry in the header map is skipped. The URL defaults to `/` when empty.
pub fn render_raw_request(
  method: &str,
  url: &str,
  host: &str,
  headers: &HeaderMap,
  body: &[u8],
) -> String {
  let url = if url.is_empty() { "/" } else { url };
  let mut out = format!("{} {} HTTP/1.1\r\n", method, url);
  if !host.is_empty() {
    out.push_str("Host: ");
    out.push_str(host);
    out.push_str("\r\n");
  }
  for (k, v) in headers.iter() {
    if k == &HOST {
      continue;
    }
    out.push_str(k.as_str());
    out.push_str(": ");
    out.push_str(&String::from_utf8_lossy(v.as_bytes()));
    out.push_str("\r\n");
  }
  out.push_str("\r\n");
  out.push_str(&String::from_utf8_lossy(body));
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::header::HeaderValue;

  #[test]
  fn parses_origin_form_with_host_header() {
    let req = parse_request("GET /a?b=1 HTTP/1.1\r\nHost: example.test\r\nX-One: 1\r\n\r\n")
      .unwrap();
    assert_eq!(req.method(), Method::GET);
    assert_eq!(req.uri().to_string(), "http://example.test/a?b=1");
    assert_eq!(req.host(), "example.test");
    assert_eq!(req.headers().get("x-one").unwrap(), "1");
    assert!(req.body().is_empty());
  }

  #[test]
  fn parses_absolute_form() {
    let req = parse_request("GET https://example.test:8443/p HTTP/1.1\n\n").unwrap();
    assert_eq!(req.uri().scheme_str(), Some("https"));
    assert_eq!(req.host(), "example.test:8443");
  }

  #[test]
  fn tolerates_missing_terminator_and_bare_lf() {
    let req = parse_request("GET / HTTP/1.1\nHost: example.test").unwrap();
    assert_eq!(req.uri().to_string(), "http://example.test/");
  }

  #[test]
  fn missing_host_everywhere_fails() {
    let err = parse_request("GET / HTTP/1.1\r\n\r\n").unwrap_err();
    assert!(matches!(err, Error::MissingHost));
  }

  #[test]
  fn body_respects_content_length() {
    let req = parse_request(
      "POST /x HTTP/1.1\r\nHost: example.test\r\nContent-Length: 3\r\n\r\nabcdef",
    )
    .unwrap();
    assert_eq!(req.body().as_ref(), b"abc");
  }

  #[test]
  fn body_without_content_length_is_empty() {
    let req =
      parse_request("POST /x HTTP/1.1\r\nHost: example.test\r\n\r\nignored").unwrap();
    assert!(req.body().is_empty());
  }

  #[test]
  fn garbage_fails_to_parse() {
    assert!(parse_request("").is_err());
    assert!(parse_request("not a request").is_err());
    assert!(parse_request("GET /x\r\n\r\n").is_err());
  }

  #[test]
  fn render_emits_exactly_one_host_line() {
    let mut headers = HeaderMap::new();
    headers.insert(HOST, HeaderValue::from_static("stale.test"));
    headers.insert("x-a", HeaderValue::from_static("1"));
    let raw = render_raw_request("GET", "http://example.test/", "example.test", &headers, b"");
    assert_eq!(raw.to_lowercase().matches("host:").count(), 1);
    assert!(raw.contains("Host: example.test\r\n"));
  }

  #[test]
  fn render_defaults_url_to_slash() {
    let raw = render_raw_request("GET", "", "h.test", &HeaderMap::new(), b"");
    assert!(raw.starts_with("GET / HTTP/1.1\r\n"));
  }

  #[test]
  fn round_trip_preserves_request() {
    let mut headers = HeaderMap::new();
    headers.insert("content-length", HeaderValue::from_static("3"));
    headers.insert("x-custom", HeaderValue::from_static("yes"));
    headers.append("x-multi", HeaderValue::from_static("a"));
    headers.append("x-multi", HeaderValue::from_static("b"));
    let raw = render_raw_request(
      "POST",
      "http://example.test/p?q=1",
      "example.test",
      &headers,
      b"abc",
    );
    let req = parse_request(&raw).unwrap();
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.host(), "example.test");
    assert_eq!(req.uri().path(), "/p");
    assert_eq!(req.uri().query(), Some("q=1"));
    assert_eq!(req.body().as_ref(), b"abc");
    assert_eq!(req.headers().get("x-custom").unwrap(), "yes");
    let multi: Vec<_> = req.headers().get_all("x-multi").iter().collect();
    assert_eq!(multi.len(), 2);
  }
}
