//! Upstream response parsing and HTTP/1.1 body de-framing.

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{new_io_error, Error, Result};
use crate::{CR_LF, SPACE};

/// A buffered response to a submitted `Request`.
#[derive(Debug, Default, Clone)]
pub struct Response {
  /// The HTTP version of the response.
  pub version: Version,
  /// The status code of the response.
  pub status_code: StatusCode,
  /// The headers of the response.
  pub headers: HeaderMap<HeaderValue>,
  /// The body of the response.
  pub body: Bytes,
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }

  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get the body bytes.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }

  /// Get the content-length of the response, if the header is present.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }

  /// Get the response body decoded as text.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).to_string()
  }
}

/// Parsed status line and headers of an upstream response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
  pub(crate) version: Version,
  pub(crate) status: StatusCode,
  pub(crate) headers: HeaderMap<HeaderValue>,
}

/// Read a response head: status line followed by headers up to a blank line.
pub(crate) async fn read_response_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<ResponseHead> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(new_io_error(
      io::ErrorKind::UnexpectedEof,
      "connection closed before status line",
    ));
  }
  let (version, status) = parse_status_line(&line)?;
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let n = reader.read_until(b'\n', &mut header_line).await?;
    if n == 0 {
      return Err(new_io_error(
        io::ErrorKind::UnexpectedEof,
        "connection closed inside response headers",
      ));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
      headers.append(k, v);
    }
  }
  Ok(ResponseHead {
    version,
    status,
    headers,
  })
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let line = line.strip_suffix(CR_LF).unwrap_or(line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let mut version = None;
  let mut status = None;
  for (index, vc) in line.splitn(3, |b| b == &b' ').enumerate() {
    match index {
      0 => {
        version = Some(match vc {
          b"HTTP/0.9" => Version::HTTP_09,
          b"HTTP/1.0" => Version::HTTP_10,
          b"HTTP/1.1" => Version::HTTP_11,
          b"HTTP/2.0" => Version::HTTP_2,
          _ => {
            return Err(Error::parse_error("invalid http version in status line"));
          }
        });
      }
      1 => {
        status = Some(
          StatusCode::try_from(vc).map_err(|_| Error::parse_error("invalid status code"))?,
        );
      }
      _ => {}
    }
  }
  match (version, status) {
    (Some(v), Some(s)) => Ok((v, s)),
    _ => Err(Error::parse_error("invalid status line")),
  }
}

/// Split a `Name: value` header line into typed parts.
pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<HeaderName>, Option<HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.strip_prefix(SPACE).unwrap_or(h);
    match index {
      0 => match HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
  /// No body at all.
  None,
  /// Exactly this many bytes follow the head.
  Length(u64),
  /// Chunked transfer coding.
  Chunked,
  /// Body runs until the peer closes the connection.
  Eof,
}

impl Framing {
  /// Framing of a request body, derived from its headers. Requests never
  /// use EOF framing.
  pub(crate) fn for_request(headers: &HeaderMap) -> Framing {
    if is_chunked(headers) {
      return Framing::Chunked;
    }
    match headers
      .get(CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok()?.parse::<u64>().ok())
    {
      Some(0) | None => Framing::None,
      Some(n) => Framing::Length(n),
    }
  }

  /// Framing of a response body given the request method and status.
  pub(crate) fn for_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> Framing {
    if method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Framing::None;
    }
    if is_chunked(headers) {
      return Framing::Chunked;
    }
    match headers
      .get(CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok()?.parse::<u64>().ok())
    {
      Some(n) => Framing::Length(n),
      None => Framing::Eof,
    }
  }

  /// True when the total size is not known from the head.
  pub(crate) fn is_unbounded(&self) -> bool {
    matches!(self, Framing::Chunked | Framing::Eof)
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

/// Incremental reader that strips wire framing and yields plain body bytes.
///
/// Chunk sizes and trailers are consumed internally; `read_chunk` returning
/// zero means the body is complete (or absent).
pub(crate) struct FramedReader<R> {
  reader: R,
  framing: Framing,
  remaining: u64,
  first_chunk: bool,
  done: bool,
}

impl<R: AsyncBufRead + Unpin> FramedReader<R> {
  pub(crate) fn new(reader: R, framing: Framing) -> Self {
    let remaining = match framing {
      Framing::Length(n) => n,
      _ => 0,
    };
    let done = matches!(framing, Framing::None | Framing::Length(0));
    FramedReader {
      reader,
      framing,
      remaining,
      first_chunk: true,
      done,
    }
  }

  /// Read the next run of decoded body bytes into `buf`; zero means done.
  pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    if self.done || buf.is_empty() {
      return Ok(0);
    }
    match self.framing {
      Framing::None => {
        self.done = true;
        Ok(0)
      }
      Framing::Length(_) => {
        let want = buf.len().min(self.remaining as usize);
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside body",
          ));
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
          self.done = true;
        }
        Ok(n)
      }
      Framing::Eof => {
        let n = self.reader.read(buf).await?;
        if n == 0 {
          self.done = true;
        }
        Ok(n)
      }
      Framing::Chunked => self.read_chunked(buf).await,
    }
  }

  async fn read_chunked(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    loop {
      if self.remaining > 0 {
        let want = buf.len().min(self.remaining as usize);
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside chunk",
          ));
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
          // chunk data is followed by CRLF
          self.read_line().await?;
        }
        return Ok(n);
      }
      let line = self.read_line().await?;
      if self.first_chunk && line.is_empty() {
        return Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "connection closed before first chunk",
        ));
      }
      self.first_chunk = false;
      let size_text = line
        .split(|b| b == &b';')
        .next()
        .unwrap_or_default();
      let size_text = std::str::from_utf8(size_text)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?
        .trim();
      let size = u64::from_str_radix(size_text, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
      if size == 0 {
        // consume trailer section up to the blank line
        loop {
          let trailer = self.read_line().await?;
          if trailer.is_empty() {
            break;
          }
        }
        self.done = true;
        return Ok(0);
      }
      self.remaining = size;
    }
  }

  async fn read_line(&mut self) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    self.reader.read_until(b'\n', &mut line).await?;
    while line.ends_with(b"\n") || line.ends_with(b"\r") {
      line.pop();
    }
    Ok(line)
  }

  /// Drain the remaining body into `out`.
  pub(crate) async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
      let n = self.read_chunk(&mut buf).await?;
      if n == 0 {
        return Ok(());
      }
      out.extend_from_slice(&buf[..n]);
    }
  }

  /// Whether the body has been fully consumed.
  pub(crate) fn is_done(&self) -> bool {
    self.done
  }

  /// True when the total size is not known up front.
  pub(crate) fn is_unbounded(&self) -> bool {
    self.framing.is_unbounded()
  }

  pub(crate) fn into_inner(self) -> R {
    self.reader
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn reads_length_delimited_body() {
    let data: &[u8] = b"hello world tail";
    let mut fr = FramedReader::new(BufReader::new(data), Framing::Length(11));
    let mut out = Vec::new();
    fr.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello world");
    assert!(fr.is_done());
  }

  #[tokio::test]
  async fn reads_chunked_body_with_extensions() {
    let data: &[u8] = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nleftover";
    let mut fr = FramedReader::new(BufReader::new(data), Framing::Chunked);
    let mut out = Vec::new();
    fr.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"Wikipedia");
    assert!(fr.is_done());
  }

  #[tokio::test]
  async fn truncated_chunk_is_an_error() {
    let data: &[u8] = b"a\r\nshort";
    let mut fr = FramedReader::new(BufReader::new(data), Framing::Chunked);
    let mut out = Vec::new();
    let err = fr.read_to_end(&mut out).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
  }

  #[tokio::test]
  async fn parses_response_head() {
    let data: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nX-A: 1\r\nX-A: 2\r\n\r\n";
    let mut reader = BufReader::new(data);
    let head = read_response_head(&mut reader).await.unwrap();
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(head.status, StatusCode::NOT_FOUND);
    assert_eq!(head.headers.get_all("x-a").iter().count(), 2);
  }

  #[test]
  fn framing_rules() {
    let mut headers = HeaderMap::new();
    assert_eq!(Framing::for_request(&headers), Framing::None);
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
    assert_eq!(Framing::for_request(&headers), Framing::Length(5));
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    assert_eq!(Framing::for_request(&headers), Framing::Chunked);

    let ok = StatusCode::OK;
    assert_eq!(
      Framing::for_response(&Method::HEAD, ok, &headers),
      Framing::None
    );
    let empty = HeaderMap::new();
    assert_eq!(
      Framing::for_response(&Method::GET, ok, &empty),
      Framing::Eof
    );
    assert_eq!(
      Framing::for_response(&Method::GET, StatusCode::NO_CONTENT, &empty),
      Framing::None
    );
  }
}
