//! Incremental decoder for the auxiliary telemetry channel.
//!
//! The channel carries a stream of JSON values separated by whitespace or
//! newlines. Bytes are pushed in as they arrive; decoded values are pulled
//! out lazily. A malformed value is reported once and skipped up to the next
//! newline so later values still decode.

use serde_json::Value;
use thiserror::Error;

/// Buffered bytes without a complete value after which the buffer is dropped
pub const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0}")]
    Syntax(String),

    #[error("pending telemetry exceeded {0} bytes without a complete value")]
    Overflow(usize),

    #[error("stream ended inside a value ({0} bytes left)")]
    Truncated(usize),
}

#[derive(Debug, Default)]
pub struct TraceDecoder {
    buffer: Vec<u8>,
    scan: ScanState,
    /// Buffer length at which an unfinished value is parsed again even
    /// without a new boundary, so malformed input that never closes is
    /// still reported
    retry_at: usize,
    #[cfg(test)]
    parses: usize,
}

/// Nesting state at the end of the buffer.
///
/// `boundary` is the buffer length right after the last byte that left the
/// scanner at top level outside a string. Without one, no new value can
/// have completed since the last parse attempt.
#[derive(Debug, Default)]
struct ScanState {
    depth: usize,
    in_string: bool,
    escaped: bool,
    boundary: Option<usize>,
}

impl ScanState {
    fn scan(&mut self, bytes: &[u8], offset: usize) {
        for (i, &b) in bytes.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
            }
            if self.depth == 0 && !self.in_string {
                self.boundary = Some(offset + i + 1);
            }
        }
    }

    /// Shift after `n` leading bytes holding complete values were removed
    fn consumed(&mut self, n: usize) {
        self.boundary = self
            .boundary
            .and_then(|b| b.checked_sub(n))
            .filter(|b| *b > 0);
    }
}

impl TraceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate the values it completes
    pub fn feed(&mut self, chunk: &[u8]) -> TraceRecords<'_> {
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        self.scan.scan(chunk, offset);
        TraceRecords {
            decoder: self,
            at_eof: false,
        }
    }

    /// Drain whatever is left once the channel has closed
    pub fn finish(&mut self) -> TraceRecords<'_> {
        TraceRecords {
            decoder: self,
            at_eof: true,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn skip_whitespace(&mut self) {
        let start = self
            .buffer
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..start);
        self.scan.consumed(start);
    }

    /// Forget the scan state and rebuild it from what is left in the buffer
    fn rescan(&mut self) {
        self.scan = ScanState::default();
        self.scan.scan(&self.buffer, 0);
        self.retry_at = 0;
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::default();
        self.retry_at = 0;
    }

    /// Drop the current line so decoding resumes at the next one
    fn resync(&mut self) {
        match self.buffer.iter().position(|b| *b == b'\n') {
            Some(newline) => {
                self.buffer.drain(..=newline);
            }
            None => self.buffer.clear(),
        }
        self.rescan();
    }

    fn next_value(&mut self, at_eof: bool) -> Option<Result<Value, DecodeError>> {
        self.skip_whitespace();
        if self.buffer.is_empty() {
            return None;
        }
        if !at_eof && self.scan.boundary.is_none() && self.buffer.len() < self.retry_at {
            return self.check_overflow();
        }

        #[cfg(test)]
        {
            self.parses += 1;
        }
        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
        match stream.next()? {
            Ok(value) => {
                let consumed = stream.byte_offset();
                // a number touching the end of the buffer may still grow
                if value.is_number() && consumed == self.buffer.len() && !at_eof {
                    self.scan.boundary = None;
                    return None;
                }
                self.buffer.drain(..consumed);
                self.scan.consumed(consumed);
                self.retry_at = 0;
                Some(Ok(value))
            }
            Err(e) if e.is_eof() => {
                if at_eof {
                    let left = self.buffer.len();
                    self.clear();
                    Some(Err(DecodeError::Truncated(left)))
                } else {
                    self.scan.boundary = None;
                    self.retry_at = self.buffer.len().saturating_mul(2);
                    self.check_overflow()
                }
            }
            Err(e) => {
                self.resync();
                Some(Err(DecodeError::Syntax(e.to_string())))
            }
        }
    }

    fn check_overflow(&mut self) -> Option<Result<Value, DecodeError>> {
        if self.buffer.len() > MAX_PENDING_BYTES {
            self.clear();
            return Some(Err(DecodeError::Overflow(MAX_PENDING_BYTES)));
        }
        None
    }
}

/// Lazy sequence of values completed by the bytes fed so far
pub struct TraceRecords<'a> {
    decoder: &'a mut TraceDecoder,
    at_eof: bool,
}

impl Iterator for TraceRecords<'_> {
    type Item = Result<Value, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_value(self.at_eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_split_across_chunks() {
        let mut decoder = TraceDecoder::new();
        assert_eq!(decoder.feed(br#"{"type":"hit"#).count(), 0);

        let values: Vec<_> = decoder
            .feed(br#"ch","ms":12}{"type":"tick"}"#)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, [json!({"type":"hitch","ms":12}), json!({"type":"tick"})]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_newline_delimited_values() {
        let mut decoder = TraceDecoder::new();
        let values: Vec<_> = decoder
            .feed(b"{\"a\":1}\n\n  [1,2]\n\"text\"\n")
            .map(Result::unwrap)
            .collect();
        assert_eq!(values, [json!({"a":1}), json!([1, 2]), json!("text")]);
    }

    #[test]
    fn test_trailing_number_waits_for_more_bytes() {
        let mut decoder = TraceDecoder::new();
        assert_eq!(decoder.feed(b"12").count(), 0);
        let values: Vec<_> = decoder.feed(b"34\n").map(Result::unwrap).collect();
        assert_eq!(values, [json!(1234)]);

        assert_eq!(decoder.feed(b"7").count(), 0);
        let values: Vec<_> = decoder.finish().map(Result::unwrap).collect();
        assert_eq!(values, [json!(7)]);
    }

    #[test]
    fn test_syntax_error_does_not_stall_stream() {
        let mut decoder = TraceDecoder::new();
        let results: Vec<_> = decoder
            .feed(b"{\"ok\":1}\n{not json}\n{\"ok\":2}\n")
            .collect();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Ok(json!({"ok":1})));
        assert!(matches!(results[1], Err(DecodeError::Syntax(_))));
        assert_eq!(results[2], Ok(json!({"ok":2})));
    }

    #[test]
    fn test_unfinished_value_is_not_reparsed_per_chunk() {
        let mut decoder = TraceDecoder::new();
        let frames = vec![r#"{"ms":1}"#; 4096].join(",");
        let payload = format!(r#"{{"frames":[{frames}],"note":"a \"}}\" b"}}"#);
        let (body, tail) = payload.as_bytes().split_at(payload.len() - 1);

        let chunks = body.chunks(512).count();
        for chunk in body.chunks(512) {
            assert_eq!(decoder.feed(chunk).count(), 0);
        }
        // retries back off geometrically with the buffer size
        let attempts = decoder.parses;
        assert!(chunks > 64);
        assert!(attempts <= 8, "{attempts} parses for {chunks} chunks");

        let values: Vec<_> = decoder.feed(tail).map(Result::unwrap).collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["frames"].as_array().unwrap().len(), 4096);
        assert_eq!(values[0]["note"], json!("a \"}\" b"));
        assert_eq!(decoder.parses, attempts + 1);
    }

    #[test]
    fn test_unclosed_malformed_value_does_not_stall() {
        let mut decoder = TraceDecoder::new();
        let results: Vec<_> = decoder.feed(b"{bad\n{\"ok\":1}\n").collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(DecodeError::Syntax(_))));
        assert_eq!(results[1], Ok(json!({"ok":1})));
    }

    #[test]
    fn test_oversized_value_is_dropped() {
        let mut decoder = TraceDecoder::new();
        assert_eq!(decoder.feed(b"[\"").count(), 0);
        let filler = vec![b'x'; MAX_PENDING_BYTES];
        let results: Vec<_> = decoder.feed(&filler).collect();
        assert_eq!(results, [Err(DecodeError::Overflow(MAX_PENDING_BYTES))]);
        assert_eq!(decoder.pending_bytes(), 0);

        let values: Vec<_> = decoder.feed(b"{\"ok\":true}\n").map(Result::unwrap).collect();
        assert_eq!(values, [json!({"ok": true})]);
    }

    #[test]
    fn test_truncated_value_at_end_of_stream() {
        let mut decoder = TraceDecoder::new();
        assert_eq!(decoder.feed(b"{\"partial\":").count(), 0);
        let results: Vec<_> = decoder.finish().collect();
        assert_eq!(results, [Err(DecodeError::Truncated(11))]);
        assert_eq!(decoder.pending_bytes(), 0);
    }
}
