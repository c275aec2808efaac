//! Zero-copy HTTP/1.x request-line and header parser
//!
//! Parses raw bytes into offset spans against the request buffer; no
//! allocations beyond the fixed header-span table, no copies. The
//! buffer is left untouched: spans carry the lengths the original
//! bytes would otherwise need terminators for.

use memchr::{memchr, memrchr};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Capacity of the per-connection request buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Header lines retained per request; one more fails the request.
pub const MAX_HEADER_LINES: usize = 32;

/// Shortest acceptable request line after the method: `/ HTTP/1.0`
const MIN_REQUEST_LINE: usize = 10;

/// Offset/length pair into a request-owned store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    start: u32,
    len: u32,
}

impl Span {
    pub const EMPTY: Span = Span { start: 0, len: 0 };

    pub fn new(start: usize, len: usize) -> Self {
        Self {
            start: start as u32,
            len: len as u32,
        }
    }

    pub fn start(self) -> usize {
        self.start as usize
    }

    pub fn len(self) -> usize {
        self.len as usize
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    pub fn end(self) -> usize {
        self.start() + self.len()
    }

    pub fn range(self) -> std::ops::Range<usize> {
        self.start()..self.end()
    }

    pub fn slice(self, store: &[u8]) -> &[u8] {
        &store[self.range()]
    }
}

/// HTTP methods accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Options,
    Delete,
}

impl Method {
    /// Identify the method from the first bytes of the request line.
    ///
    /// Dispatches on the first four bytes and returns how many bytes
    /// the method token and its trailing space consume.
    pub fn parse(bytes: &[u8]) -> Option<(Method, usize)> {
        match bytes.get(..4)? {
            b"GET " => Some((Method::Get, 4)),
            b"HEAD" => Some((Method::Head, 5)),
            b"POST" => Some((Method::Post, 5)),
            b"OPTI" => Some((Method::Options, 8)),
            b"DELE" => Some((Method::Delete, 7)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Options => "OPTIONS",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the head parser learns about one request.
///
/// All spans point into the buffer the request was parsed from. The
/// interesting headers are recognized during the header walk; anything
/// else stays reachable through `header_lines`.
#[derive(Debug, Default)]
pub(crate) struct ParsedHead {
    pub method: Option<Method>,
    pub is_http_1_0: bool,
    pub url: Span,
    pub query: Span,
    pub fragment: Span,
    pub header_lines: SmallVec<[Span; MAX_HEADER_LINES]>,
    /// Offset of the first byte past this request, when the buffer
    /// already holds more (a pipelined request or a POST body).
    pub next_request: Option<usize>,
    pub accept_encoding: Span,
    pub authorization: Span,
    pub connection: Span,
    pub content_type: Span,
    pub content_length: Span,
    pub cookie: Span,
    pub if_modified_since: Span,
    pub range: Span,
}

/// Parse the request line and header block starting at `start`.
///
/// `bytes` is the filled part of the request buffer; the read loop has
/// already established that a header terminator is in it (or that a
/// pipelined tail was latched).
pub(crate) fn parse_head(bytes: &[u8], start: usize) -> Result<ParsedHead> {
    let start = crate::ascii::skip_leading_whitespace(bytes, start);

    let (method, consumed) = Method::parse(&bytes[start.min(bytes.len())..]).ok_or(Error::NotAllowed)?;
    let path_start = start + consumed;

    if bytes.get(path_start) != Some(&b'/') {
        return Err(Error::BadRequest);
    }

    let cr = path_start
        + memchr(b'\r', &bytes[path_start..]).ok_or(Error::BadRequest)?;
    if cr - path_start < MIN_REQUEST_LINE {
        return Err(Error::BadRequest);
    }

    let mut head = ParsedHead {
        method: Some(method),
        ..ParsedHead::default()
    };

    match &bytes[cr - 8..cr] {
        b"HTTP/1.0" => head.is_http_1_0 = true,
        b"HTTP/1.1" => {}
        _ => return Err(Error::BadRequest),
    }

    // The URL ends right before the space that precedes the version.
    head.url = Span::new(path_start, cr - 9 - path_start);
    let (query, fragment) = split_fragment_and_query(bytes, &mut head.url);
    head.query = query;
    head.fragment = fragment;

    parse_header_lines(bytes, cr + 2, &mut head)?;
    recognize_headers(bytes, &mut head);

    Ok(head)
}

/// Split `url` on `#` and `?`, shrinking it to the bare path.
///
/// Fragments are usually short and near the end, so the `#` scan runs
/// backwards; query strings are usually long, so the `?` scan runs
/// forwards. Returns the (query, fragment) spans.
pub(crate) fn split_fragment_and_query(bytes: &[u8], url: &mut Span) -> (Span, Span) {
    let line_end = url.end();
    let mut query = Span::EMPTY;
    let mut fragment = Span::EMPTY;
    let mut hash_pos = None;

    if let Some(rel) = memrchr(b'#', url.slice(bytes)) {
        let hash = url.start() + rel;
        fragment = Span::new(hash + 1, line_end - hash - 1);
        *url = Span::new(url.start(), hash - url.start());
        hash_pos = Some(hash);
    }

    if let Some(rel) = memchr(b'?', url.slice(bytes)) {
        let qmark = url.start() + rel;
        let end = hash_pos.unwrap_or(line_end);
        query = Span::new(qmark + 1, end - qmark - 1);
        *url = Span::new(url.start(), qmark - url.start());
    }

    (query, fragment)
}

fn parse_header_lines(bytes: &[u8], mut pos: usize, head: &mut ParsedHead) -> Result<()> {
    loop {
        if pos >= bytes.len() {
            return Ok(());
        }
        let line_cr = match memchr(b'\r', &bytes[pos..]) {
            Some(rel) => pos + rel,
            None => return Ok(()),
        };
        if line_cr + 1 >= bytes.len() {
            // Lone trailing CR: an incomplete tail, not an error
            return Ok(());
        }
        if bytes[line_cr + 1] != b'\n' {
            return Err(Error::BadRequest);
        }

        if line_cr == pos {
            // Blank line ends the block; anything past it belongs to
            // the next pipelined request (or this request's body).
            if line_cr + 2 < bytes.len() {
                head.next_request = Some(line_cr + 2);
            }
            return Ok(());
        }

        if head.header_lines.len() == MAX_HEADER_LINES {
            return Err(Error::TooLarge);
        }
        head.header_lines.push(Span::new(pos, line_cr - pos));
        pos = line_cr + 2;
    }
}

fn recognize_headers(bytes: &[u8], head: &mut ParsedHead) {
    for i in 0..head.header_lines.len() {
        let line = head.header_lines[i];
        let l = line.slice(bytes);
        match l.get(..4) {
            Some(b"Acce") => assign(&mut head.accept_encoding, line, l, b"Accept-Encoding: "),
            Some(b"Auth") => assign(&mut head.authorization, line, l, b"Authorization: "),
            Some(b"Conn") => assign(&mut head.connection, line, l, b"Connection: "),
            Some(b"Cont") => {
                assign(&mut head.content_type, line, l, b"Content-Type: ");
                assign(&mut head.content_length, line, l, b"Content-Length: ");
            }
            Some(b"Cook") => assign(&mut head.cookie, line, l, b"Cookie: "),
            Some(b"If-M") => assign(&mut head.if_modified_since, line, l, b"If-Modified-Since: "),
            Some(b"Rang") => assign(&mut head.range, line, l, b"Range: "),
            _ => {}
        }
    }
}

fn assign(slot: &mut Span, line: Span, l: &[u8], name: &[u8]) {
    if l.starts_with(name) {
        *slot = Span::new(line.start() + name.len(), line.len() - name.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Result<ParsedHead> {
        parse_head(input, 0)
    }

    #[test]
    fn test_simple_get() {
        let buf = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.method, Some(Method::Get));
        assert!(!head.is_http_1_0);
        assert_eq!(head.url.slice(buf), b"/");
        assert!(head.query.is_empty());
        assert!(head.fragment.is_empty());
        assert_eq!(head.header_lines.len(), 1);
        assert_eq!(head.header_lines[0].slice(buf), b"Host: localhost");
        assert!(head.next_request.is_none());
    }

    #[test]
    fn test_query_and_fragment() {
        let buf = b"GET /a/b?x=1&y=2#frag HTTP/1.1\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.url.slice(buf), b"/a/b");
        assert_eq!(head.query.slice(buf), b"x=1&y=2");
        assert_eq!(head.fragment.slice(buf), b"frag");
    }

    #[test]
    fn test_fragment_without_query() {
        let buf = b"GET /p#f HTTP/1.1\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.url.slice(buf), b"/p");
        assert!(head.query.is_empty());
        assert_eq!(head.fragment.slice(buf), b"f");
    }

    #[test]
    fn test_empty_fragment_does_not_leak_into_query() {
        let buf = b"GET /p?q=1# HTTP/1.1\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.url.slice(buf), b"/p");
        assert_eq!(head.query.slice(buf), b"q=1");
        assert!(head.fragment.is_empty());
    }

    #[test]
    fn test_http_1_0_flag() {
        let head = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(head.is_http_1_0);
    }

    #[test]
    fn test_unknown_version_rejected() {
        assert!(matches!(parse(b"GET / HTTP/2.0\r\n\r\n"), Err(Error::BadRequest)));
        assert!(matches!(parse(b"GET / HTTP/1.2\r\n\r\n"), Err(Error::BadRequest)));
    }

    #[test]
    fn test_unknown_method_not_allowed() {
        assert!(matches!(parse(b"PATCH / HTTP/1.1\r\n\r\n"), Err(Error::NotAllowed)));
        // No method at all: the path is not a recognizable method token
        assert!(matches!(parse(b"/ HTTP/1.0\r\n\r\n"), Err(Error::NotAllowed)));
    }

    #[test]
    fn test_all_methods() {
        for (line, method) in [
            (&b"GET / HTTP/1.1\r\n\r\n"[..], Method::Get),
            (b"HEAD / HTTP/1.1\r\n\r\n", Method::Head),
            (b"POST / HTTP/1.1\r\n\r\n", Method::Post),
            (b"OPTIONS / HTTP/1.1\r\n\r\n", Method::Options),
            (b"DELETE / HTTP/1.1\r\n\r\n", Method::Delete),
        ] {
            assert_eq!(parse(line).unwrap().method, Some(method));
        }
    }

    #[test]
    fn test_path_must_start_with_slash() {
        assert!(matches!(parse(b"GET http://h/ HTTP/1.1\r\n\r\n"), Err(Error::BadRequest)));
    }

    #[test]
    fn test_request_line_too_short() {
        assert!(matches!(parse(b"GET /\r\n\r\n"), Err(Error::BadRequest)));
    }

    #[test]
    fn test_leading_whitespace_ignored() {
        let buf = b"  \r\nGET / HTTP/1.1\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.method, Some(Method::Get));
        assert_eq!(head.url.slice(buf), b"/");
    }

    #[test]
    fn test_interesting_headers_recognized() {
        let buf = b"POST /f HTTP/1.1\r\n\
            Accept-Encoding: gzip\r\n\
            Authorization: Basic abc\r\n\
            Connection: keep-alive\r\n\
            Content-Type: text/plain\r\n\
            Content-Length: 7\r\n\
            Cookie: a=b\r\n\
            If-Modified-Since: Wed, 21 Oct 2015 07:28:00 GMT\r\n\
            Range: bytes=0-99\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.accept_encoding.slice(buf), b"gzip");
        assert_eq!(head.authorization.slice(buf), b"Basic abc");
        assert_eq!(head.connection.slice(buf), b"keep-alive");
        assert_eq!(head.content_type.slice(buf), b"text/plain");
        assert_eq!(head.content_length.slice(buf), b"7");
        assert_eq!(head.cookie.slice(buf), b"a=b");
        assert_eq!(
            head.if_modified_since.slice(buf),
            b"Wed, 21 Oct 2015 07:28:00 GMT"
        );
        assert_eq!(head.range.slice(buf), b"bytes=0-99");
    }

    #[test]
    fn test_interesting_match_is_exact() {
        // Lowercase names are kept as raw lines but not recognized
        let buf = b"GET / HTTP/1.1\r\ncookie: a=b\r\n\r\n";
        let head = parse(buf).unwrap();
        assert!(head.cookie.is_empty());
        assert_eq!(head.header_lines.len(), 1);
    }

    #[test]
    fn test_pipelined_tail_recorded() {
        let buf = b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n";
        let head = parse(buf).unwrap();
        assert_eq!(head.next_request, Some(19));
        assert_eq!(&buf[19..23], b"GET ");
    }

    #[test]
    fn test_header_cap() {
        let mut buf = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        for i in 0..MAX_HEADER_LINES {
            buf.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        let head = parse(&buf).unwrap();
        assert_eq!(head.header_lines.len(), MAX_HEADER_LINES);

        let mut over = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        for i in 0..=MAX_HEADER_LINES {
            over.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        over.extend_from_slice(b"\r\n");
        assert!(matches!(parse(&over), Err(Error::TooLarge)));
    }

    #[test]
    fn test_same_block_parses_identically() {
        let buf = b"GET /a?b=c HTTP/1.1\r\nHost: h\r\n\r\n";
        let first = parse(buf).unwrap();
        let second = parse(buf).unwrap();
        assert_eq!(first.url, second.url);
        assert_eq!(first.query, second.query);
        assert_eq!(first.header_lines.len(), second.header_lines.len());
    }
}
