//! `CONNECT` target-selection header.
//!
//! Wire format: a single ASCII line `CONNECT <host> <port>\n`, sent exactly once
//! by the client at the start of every stream, before any relayed bytes.

use crate::error::StreamFailureCause;
use std::fmt;

/// Keyword that opens every header line.
pub const CONNECT_KEYWORD: &str = "CONNECT";

/// Default cap on the header line, newline included.
pub const DEFAULT_HEADER_LIMIT: usize = 1024;

/// The target named by a stream's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectHeader {
    pub host: String,
    pub port: u16,
}

impl ConnectHeader {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Encode as `CONNECT <host> <port>\n`.
    pub fn encode(&self) -> Vec<u8> {
        format!("{CONNECT_KEYWORD} {} {}\n", self.host, self.port).into_bytes()
    }

    /// Parse one header line. A trailing `\n` (or `\r\n`) is accepted.
    ///
    /// The line must hold exactly three whitespace-separated tokens: the
    /// `CONNECT` keyword, a host, and a port in `1..=65535`.
    pub fn parse_line(line: &[u8]) -> Result<Self, StreamFailureCause> {
        let text = std::str::from_utf8(line).map_err(|_| {
            StreamFailureCause::MalformedHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        let text = text.trim();

        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() != 3 || tokens[0] != CONNECT_KEYWORD {
            return Err(StreamFailureCause::MalformedHeader(text.to_string()));
        }

        let port: u16 = tokens[2]
            .parse()
            .map_err(|_| StreamFailureCause::InvalidPort(tokens[2].to_string()))?;
        if port == 0 {
            return Err(StreamFailureCause::InvalidPort(tokens[2].to_string()));
        }

        Ok(Self::new(tokens[1], port))
    }
}

impl fmt::Display for ConnectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handshake state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Header not yet fully sent (client) or parsed (relay).
    AwaitingHeader,
    /// Raw passthrough in both directions.
    Relaying,
    Closed,
}

/// A parsed header plus whatever followed it in the same read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    pub header: ConnectHeader,
    /// Bytes after the newline. They belong to the relayed payload.
    pub remainder: Vec<u8>,
}

/// Incremental header decoder with a hard capacity cap.
///
/// Bytes accumulate until a newline shows up. The buffer is owned by the
/// decoder and freed when the decoder is dropped, so callers hold it in an
/// `Option` and `take()` it once the header is complete or the stream fails.
#[derive(Debug)]
pub struct HeaderDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_LIMIT)
    }
}

impl HeaderDecoder {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit.min(DEFAULT_HEADER_LIMIT)),
            limit,
        }
    }

    /// Feed the next chunk read from the stream.
    ///
    /// Returns `Ok(None)` while the line is still incomplete. Fails without
    /// parsing as soon as the line would exceed the cap.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<DecodedHeader>, StreamFailureCause> {
        let newline = data.iter().position(|&b| b == b'\n');

        let Some(idx) = newline else {
            if self.buffer.len() + data.len() > self.limit {
                return Err(StreamFailureCause::HeaderTooLong { limit: self.limit });
            }
            self.buffer.extend_from_slice(data);
            return Ok(None);
        };

        if self.buffer.len() + idx + 1 > self.limit {
            return Err(StreamFailureCause::HeaderTooLong { limit: self.limit });
        }
        self.buffer.extend_from_slice(&data[..=idx]);

        let header = ConnectHeader::parse_line(&self.buffer)?;
        self.buffer.clear();

        Ok(Some(DecodedHeader {
            header,
            remainder: data[idx + 1..].to_vec(),
        }))
    }

    /// Number of header bytes buffered so far.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Result<Option<DecodedHeader>, StreamFailureCause> {
        let mut decoder = HeaderDecoder::default();
        for chunk in chunks {
            if let Some(done) = decoder.feed(chunk)? {
                return Ok(Some(done));
            }
        }
        Ok(None)
    }

    fn decode_one(line: &[u8]) -> Result<Option<DecodedHeader>, StreamFailureCause> {
        decode_all(&[line])
    }

    #[test]
    fn encode_format() {
        let header = ConnectHeader::new("example.test", 80);
        assert_eq!(header.encode(), b"CONNECT example.test 80\n");
        assert_eq!(header.to_string(), "example.test:80");
    }

    #[test]
    fn single_read() {
        let done = decode_one(b"CONNECT example.test 80\n").unwrap().unwrap();
        assert_eq!(done.header, ConnectHeader::new("example.test", 80));
        assert!(done.remainder.is_empty());
    }

    #[test]
    fn byte_at_a_time_matches_single_read() {
        let line = b"CONNECT db.internal 5432\n";
        let mut decoder = HeaderDecoder::default();
        for i in 0..line.len() - 1 {
            assert!(decoder.feed(&line[i..i + 1]).unwrap().is_none());
        }
        assert_eq!(decoder.pending(), line.len() - 1);
        let done = decoder.feed(&line[line.len() - 1..]).unwrap().unwrap();
        assert_eq!(done.header, ConnectHeader::new("db.internal", 5432));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn arbitrary_splits_match_single_read() {
        let line = b"CONNECT 10.0.0.7 8443\n";
        let expected = ConnectHeader::new("10.0.0.7", 8443);
        for split in 1..line.len() {
            let done = decode_all(&[&line[..split], &line[split..]]).unwrap().unwrap();
            assert_eq!(done.header, expected, "split at {split}");
        }
    }

    #[test]
    fn remainder_is_preserved() {
        let done = decode_one(b"CONNECT example.test 80\nGET / HTTP/1.0\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(done.header, ConnectHeader::new("example.test", 80));
        assert_eq!(done.remainder, b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn crlf_and_extra_spacing_are_tolerated() {
        let done = decode_one(b"CONNECT   host.test\t443\r\n").unwrap().unwrap();
        assert_eq!(done.header, ConnectHeader::new("host.test", 443));
    }

    #[test]
    fn wrong_token_count_is_malformed() {
        for line in [
            &b"CONNECT host.test\n"[..],
            b"CONNECT host.test 80 extra\n",
            b"\n",
        ] {
            assert!(matches!(
                decode_one(line),
                Err(StreamFailureCause::MalformedHeader(_))
            ));
        }
    }

    #[test]
    fn wrong_keyword_is_malformed() {
        for line in [&b"GET host.test 80\n"[..], b"connect host.test 80\n"] {
            assert!(matches!(
                decode_one(line),
                Err(StreamFailureCause::MalformedHeader(_))
            ));
        }
    }

    #[test]
    fn non_utf8_is_malformed() {
        assert!(matches!(
            decode_one(b"CONNECT \xff\xfe 80\n"),
            Err(StreamFailureCause::MalformedHeader(_))
        ));
    }

    #[test]
    fn bad_ports_are_rejected() {
        for line in [
            &b"CONNECT host.test http\n"[..],
            b"CONNECT host.test 70000\n",
            b"CONNECT host.test 0\n",
            b"CONNECT host.test -1\n",
        ] {
            assert!(matches!(
                decode_one(line),
                Err(StreamFailureCause::InvalidPort(_))
            ));
        }
    }

    #[test]
    fn oversized_without_newline_is_rejected() {
        let mut decoder = HeaderDecoder::new(16);
        assert!(decoder.feed(b"CONNECT aaaa").unwrap().is_none());
        assert_eq!(
            decoder.feed(b"aaaaaaa").unwrap_err(),
            StreamFailureCause::HeaderTooLong { limit: 16 }
        );
    }

    #[test]
    fn oversized_line_with_newline_is_rejected() {
        let mut decoder = HeaderDecoder::new(16);
        assert_eq!(
            decoder.feed(b"CONNECT very-long-host 80\n").unwrap_err(),
            StreamFailureCause::HeaderTooLong { limit: 16 }
        );
    }

    #[test]
    fn line_exactly_at_limit_is_accepted() {
        let line = b"CONNECT h 8080\n";
        let mut decoder = HeaderDecoder::new(line.len());
        let done = decoder.feed(line).unwrap().unwrap();
        assert_eq!(done.header, ConnectHeader::new("h", 8080));
    }
}
