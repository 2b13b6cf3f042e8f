//! Capped byte sink used to capture request and response bodies.

/// A byte sink that stores at most `limit` bytes and flags truncation.
///
/// Writes always report the full input length as consumed, so the buffer
/// stays transparent when used as the capture side of a tee: the forwarding
/// half of the pipeline never stalls because the capture filled up.
///
/// A limit of zero or less keeps nothing; the first non-empty write latches
/// the truncation flag.
#[derive(Debug, Default)]
pub struct LimitBuffer {
  limit: i64,
  truncated: bool,
  buf: Vec<u8>,
}

impl LimitBuffer {
  /// Create a buffer that keeps at most `limit` bytes.
  pub fn new(limit: i64) -> Self {
    LimitBuffer {
      limit,
      truncated: false,
      buf: Vec::new(),
    }
  }

  /// Absorb `p`, keeping what fits under the limit.
  ///
  /// Returns `p.len()` regardless of how much was stored.
  pub fn write(&mut self, p: &[u8]) -> usize {
    if p.is_empty() {
      return 0;
    }
    if self.limit <= 0 {
      self.truncated = true;
      return p.len();
    }
    let remaining = (self.limit as usize).saturating_sub(self.buf.len());
    if remaining == 0 {
      self.truncated = true;
      return p.len();
    }
    if p.len() > remaining {
      self.buf.extend_from_slice(&p[..remaining]);
      self.truncated = true;
    } else {
      self.buf.extend_from_slice(p);
    }
    p.len()
  }

  /// The bytes captured so far.
  pub fn bytes(&self) -> &[u8] {
    &self.buf
  }

  /// Whether any write overflowed the limit.
  pub fn truncated(&self) -> bool {
    self.truncated
  }

  /// Consume the buffer, returning the captured bytes.
  pub fn into_bytes(self) -> Vec<u8> {
    self.buf
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stores_up_to_limit() {
    let mut lb = LimitBuffer::new(8);
    assert_eq!(lb.write(b"hello"), 5);
    assert_eq!(lb.write(b"world"), 5);
    assert_eq!(lb.bytes(), b"hellowor");
    assert!(lb.truncated());
  }

  #[test]
  fn exact_fill_is_not_truncated() {
    let mut lb = LimitBuffer::new(4);
    assert_eq!(lb.write(b"ab"), 2);
    assert_eq!(lb.write(b"cd"), 2);
    assert_eq!(lb.bytes(), b"abcd");
    assert!(!lb.truncated());
    // an empty write after an exact fill must not latch truncation
    assert_eq!(lb.write(b""), 0);
    assert!(!lb.truncated());
  }

  #[test]
  fn overflow_after_fill_latches() {
    let mut lb = LimitBuffer::new(4);
    lb.write(b"abcd");
    lb.write(b"e");
    assert_eq!(lb.bytes(), b"abcd");
    assert!(lb.truncated());
  }

  #[test]
  fn zero_limit_keeps_nothing() {
    let mut lb = LimitBuffer::new(0);
    assert_eq!(lb.write(b""), 0);
    assert!(!lb.truncated());
    assert_eq!(lb.write(b"x"), 1);
    assert!(lb.bytes().is_empty());
    assert!(lb.truncated());
  }

  #[test]
  fn negative_limit_keeps_nothing() {
    let mut lb = LimitBuffer::new(-1);
    assert_eq!(lb.write(b"abc"), 3);
    assert!(lb.bytes().is_empty());
    assert!(lb.truncated());
  }

  #[test]
  fn length_is_min_of_total_and_cap() {
    for (writes, cap, want_len, want_trunc) in [
      (vec![b"aa".as_ref(), b"bb", b"cc"], 10i64, 6usize, false),
      (vec![b"aa".as_ref(), b"bb", b"cc"], 5, 5, true),
      (vec![b"aaaaaa".as_ref()], 6, 6, false),
    ] {
      let mut lb = LimitBuffer::new(cap);
      for w in writes {
        lb.write(w);
      }
      assert_eq!(lb.bytes().len(), want_len);
      assert_eq!(lb.truncated(), want_trunc);
    }
  }
}
