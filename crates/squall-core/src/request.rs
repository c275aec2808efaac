//! Per-request state and typed accessors
//!
//! A [`Request`] owns three byte stores (the head buffer, an optional
//! body buffer and an optional rewritten URL) and every parsed value
//! is a span into one of them. Ownership ties span validity to the
//! request itself; nothing can dangle. Expensive header parses (query,
//! cookies, form body, Range, If-Modified-Since) run lazily at most
//! once, latched by a flag.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use smallvec::SmallVec;

use crate::body::BodyStore;
use crate::error::{Error, Result};
use crate::parser::{self, Method, Span, DEFAULT_BUFFER_SIZE, MAX_HEADER_LINES};
use crate::proxy::{ProxyAddresses, ProxyPeer};
use crate::urlencoded::{parse_key_values, percent_decode_in_place, KeyValueSpans, ValueDecode};

/// Contiguous read buffer, reused across pipelined requests.
///
/// Capacity is fixed; `filled` tracks how much of it holds data. The
/// leftover tail of a pipelined request moves to offset 0 between
/// requests, which is the only copy the request path ever makes.
#[derive(Debug)]
pub struct RequestBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            filled: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_slice(input: &[u8]) -> Self {
        Self {
            data: input.to_vec(),
            filled: input.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.filled]
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.filled += n;
    }

    /// Move the tail starting at `offset` to the front of the buffer.
    pub(crate) fn shift_front(&mut self, offset: usize) {
        self.data.copy_within(offset..self.filled, 0);
        self.filled -= offset;
    }

    pub(crate) fn reset(&mut self) {
        self.filled = 0;
    }
}

impl Default for RequestBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Which request-owned store a span resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Store {
    #[default]
    Head,
    Url,
    Body,
}

/// A span plus the store it lives in.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Loc {
    pub store: Store,
    pub span: Span,
}

impl Loc {
    fn head(span: Span) -> Self {
        Self {
            store: Store::Head,
            span,
        }
    }
}

/// Request flag bag. Lazy-parse latches are monotonic: set once, never
/// cleared within a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RequestFlags(u32);

impl RequestFlags {
    pub const IS_HTTP_1_0: u32 = 1 << 0;
    pub const PROXIED: u32 = 1 << 1;
    pub const KEEP_ALIVE: u32 = 1 << 2;
    pub const WANTS_UPGRADE: u32 = 1 << 3;
    pub const ACCEPT_GZIP: u32 = 1 << 4;
    pub const ACCEPT_DEFLATE: u32 = 1 << 5;
    pub const PARSED_QUERY: u32 = 1 << 6;
    pub const PARSED_COOKIES: u32 = 1 << 7;
    pub const PARSED_POST: u32 = 1 << 8;
    pub const PARSED_RANGE: u32 = 1 << 9;
    pub const PARSED_IF_MODIFIED_SINCE: u32 = 1 << 10;
    pub const URL_REWRITTEN: u32 = 1 << 11;
    pub const HEADERS_SENT: u32 = 1 << 12;
    pub const IS_WEBSOCKET: u32 = 1 << 13;

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Parse positions and cached parses for one request.
#[derive(Debug, Default)]
pub(crate) struct Helper {
    pub accept_encoding: Span,
    pub authorization: Span,
    pub connection: Span,
    pub content_type: Span,
    pub content_length: Span,
    pub cookie: Span,
    pub if_modified_since: Span,
    pub if_modified_since_parsed: Option<SystemTime>,
    pub range: Span,
    pub range_from: i64,
    pub range_to: i64,
    pub query_string: Loc,
    pub fragment: Loc,
    pub post_data: Loc,
    pub header_lines: SmallVec<[Span; MAX_HEADER_LINES]>,
    /// Offset of the next pipelined request (or body) in the buffer
    pub next_request: Option<usize>,
    pub rewrites: u32,
}

/// Head parse failure; hands the buffer back so the connection can
/// respond and, when a pipelined tail is queued, keep going.
pub(crate) struct ParseFailure {
    pub buf: RequestBuffer,
    pub error: Error,
    pub next_request: Option<usize>,
}

/// A parsed HTTP request.
pub struct Request {
    pub(crate) buf: RequestBuffer,
    pub(crate) flags: RequestFlags,
    method: Method,
    url: Loc,
    original_url: Loc,
    rewritten: Vec<u8>,
    pub(crate) body: BodyStore,
    pub(crate) helper: Helper,
    cookies: Option<KeyValueSpans>,
    query_params: Option<KeyValueSpans>,
    post_params: Option<KeyValueSpans>,
    peer_addr: Option<SocketAddr>,
    proxy: Option<ProxyAddresses>,
}

impl Request {
    /// Parse the request head out of `buf`, starting past any PROXY
    /// preamble. The URL is percent-decoded in place; query, cookies
    /// and the body wait for their accessors.
    pub(crate) fn parse(
        mut buf: RequestBuffer,
        start: usize,
        peer_addr: Option<SocketAddr>,
        proxy: Option<ProxyAddresses>,
    ) -> std::result::Result<Request, ParseFailure> {
        let head = match parser::parse_head(buf.bytes(), start) {
            Ok(head) => head,
            Err(error) => {
                return Err(ParseFailure {
                    buf,
                    error,
                    next_request: None,
                })
            }
        };

        let Some(method) = head.method else {
            return Err(ParseFailure {
                buf,
                error: Error::NotAllowed,
                next_request: head.next_request,
            });
        };

        let url = match percent_decode_in_place(&mut buf.bytes_mut()[head.url.range()]) {
            Ok(new_len) => Span::new(head.url.start(), new_len),
            Err(error) => {
                return Err(ParseFailure {
                    buf,
                    error,
                    next_request: head.next_request,
                })
            }
        };

        let mut flags = RequestFlags::default();
        if head.is_http_1_0 {
            flags.set(RequestFlags::IS_HTTP_1_0);
        }
        if proxy.is_some() {
            flags.set(RequestFlags::PROXIED);
        }

        let mut request = Request {
            buf,
            flags,
            method,
            url: Loc::head(url),
            original_url: Loc::head(url),
            rewritten: Vec::new(),
            body: BodyStore::None,
            helper: Helper {
                accept_encoding: head.accept_encoding,
                authorization: head.authorization,
                connection: head.connection,
                content_type: head.content_type,
                content_length: head.content_length,
                cookie: head.cookie,
                if_modified_since: head.if_modified_since,
                range: head.range,
                query_string: Loc::head(head.query),
                fragment: Loc::head(head.fragment),
                header_lines: head.header_lines,
                next_request: head.next_request,
                ..Helper::default()
            },
            cookies: None,
            query_params: None,
            post_params: None,
            peer_addr,
            proxy,
        };

        request.parse_connection_header();
        Ok(request)
    }

    pub(crate) fn into_parts(self) -> (RequestBuffer, Option<usize>) {
        (self.buf, self.helper.next_request)
    }

    fn store_slice(&self, store: Store) -> &[u8] {
        match store {
            Store::Head => self.buf.bytes(),
            Store::Url => &self.rewritten,
            Store::Body => match &self.body {
                BodyStore::Buffered(buffer) => buffer.as_slice(),
                _ => &[],
            },
        }
    }

    // ===== Request line =====

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn is_http_1_0(&self) -> bool {
        self.flags.contains(RequestFlags::IS_HTTP_1_0)
    }

    /// Current URL (path only, percent-decoded, prefix-stripped on
    /// dispatch).
    pub fn url(&self) -> &[u8] {
        self.url.span.slice(self.store_slice(self.url.store))
    }

    /// The URL as parsed, before any prefix strip or rewrite.
    pub fn original_url(&self) -> &[u8] {
        self.original_url
            .span
            .slice(self.store_slice(self.original_url.store))
    }

    /// Raw query string (undecoded; see [`Request::query_param`]).
    pub fn query_string(&self) -> &[u8] {
        self.helper
            .query_string
            .span
            .slice(self.store_slice(self.helper.query_string.store))
    }

    pub fn fragment(&self) -> &[u8] {
        self.helper
            .fragment
            .span
            .slice(self.store_slice(self.helper.fragment.store))
    }

    // ===== Connection negotiation =====

    pub fn keep_alive(&self) -> bool {
        self.flags.contains(RequestFlags::KEEP_ALIVE)
    }

    pub fn wants_upgrade(&self) -> bool {
        self.flags.contains(RequestFlags::WANTS_UPGRADE)
    }

    pub fn is_websocket(&self) -> bool {
        self.flags.contains(RequestFlags::IS_WEBSOCKET)
    }

    pub fn proxied(&self) -> bool {
        self.flags.contains(RequestFlags::PROXIED)
    }

    fn parse_connection_header(&mut self) {
        let value = self.helper.connection;
        let mut is_keep_alive = false;
        let mut is_close = false;
        let mut flags = self.flags;

        if !value.is_empty() {
            for token in value.slice(self.buf.bytes()).split(|&b| b == b',') {
                let token = crate::ascii::trim(token);
                if tag_matches(token, b"keep") {
                    is_keep_alive = true;
                } else if tag_matches(token, b"clos") {
                    is_close = true;
                } else if tag_matches(token, b"upgr") {
                    flags.set(RequestFlags::WANTS_UPGRADE);
                }
            }
        }

        // HTTP/1.1 defaults to keep-alive unless closed; 1.0 needs it
        // spelled out.
        if !flags.contains(RequestFlags::IS_HTTP_1_0) {
            is_keep_alive = !is_close;
        }

        if is_keep_alive {
            flags.set(RequestFlags::KEEP_ALIVE);
        } else {
            flags.clear(RequestFlags::KEEP_ALIVE);
        }
        self.flags = flags;
    }

    // ===== Typed header accessors =====

    /// Accept-Encoding support. Populates the gzip/deflate flags from
    /// full tokens, so `gzippy` does not count as `gzip`.
    pub fn parse_accept_encoding(&mut self) {
        let value = self.helper.accept_encoding;
        if value.is_empty() {
            return;
        }

        let mut flags = self.flags;
        for token in value.slice(self.buf.bytes()).split(|&b| b == b',') {
            let token = crate::ascii::trim(token);
            let token = token.split(|&b| b == b';').next().unwrap_or(token);
            match crate::ascii::trim(token) {
                b"gzip" | b"x-gzip" => flags.set(RequestFlags::ACCEPT_GZIP),
                b"deflate" | b"x-deflate" => flags.set(RequestFlags::ACCEPT_DEFLATE),
                _ => {}
            }
        }
        self.flags = flags;
    }

    pub fn accepts_gzip(&self) -> bool {
        self.flags.contains(RequestFlags::ACCEPT_GZIP)
    }

    pub fn accepts_deflate(&self) -> bool {
        self.flags.contains(RequestFlags::ACCEPT_DEFLATE)
    }

    /// Parsed Range header as `(from, to)`, `-1` meaning open-ended.
    ///
    /// `None` when the header is absent or unparsable. A descending
    /// range like `5-2` is handed through; what it means is the
    /// consumer's business.
    pub fn range(&mut self) -> Option<(i64, i64)> {
        if !self.flags.contains(RequestFlags::PARSED_RANGE) {
            self.flags.set(RequestFlags::PARSED_RANGE);
            self.parse_range();
        }
        if self.helper.range.is_empty() {
            return None;
        }
        if self.helper.range_from == -1 && self.helper.range_to == -1 {
            return None;
        }
        Some((self.helper.range_from, self.helper.range_to))
    }

    fn parse_range(&mut self) {
        self.helper.range_from = -1;
        self.helper.range_to = -1;

        let raw = self.helper.range;
        if raw.is_empty() {
            return;
        }
        let Some(spec) = raw.slice(self.buf.bytes()).strip_prefix(b"bytes=") else {
            return;
        };

        let (from, to) = if let Some((from, digits)) = take_u64(spec) {
            if spec.get(digits) != Some(&b'-') {
                return;
            }
            match take_u64(&spec[digits + 1..]) {
                Some((to, _)) => (from, to as i128),
                None => (from, -1),
            }
        } else if spec.first() == Some(&b'-') {
            match take_u64(&spec[1..]) {
                Some((to, _)) => (0, to as i128),
                None => return,
            }
        } else {
            return;
        };

        if from > i64::MAX as u64 || to > i64::MAX as i128 {
            return;
        }
        self.helper.range_from = from as i64;
        self.helper.range_to = to as i64;
    }

    /// Parsed If-Modified-Since, `None` when absent or malformed.
    pub fn if_modified_since(&mut self) -> Option<SystemTime> {
        if !self.flags.contains(RequestFlags::PARSED_IF_MODIFIED_SINCE) {
            self.flags.set(RequestFlags::PARSED_IF_MODIFIED_SINCE);
            let raw = self.helper.if_modified_since;
            if !raw.is_empty() {
                if let Ok(s) = std::str::from_utf8(raw.slice(self.buf.bytes())) {
                    if let Ok(when) = httpdate::parse_http_date(s) {
                        self.helper.if_modified_since_parsed = Some(when);
                    }
                }
            }
        }
        self.helper.if_modified_since_parsed
    }

    /// Case-insensitive lookup over every retained header line.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        let name = name.as_bytes();
        for &line in &self.helper.header_lines {
            let l = line.slice(self.buf.bytes());
            if l.len() < name.len() + 2 {
                continue;
            }
            let (n, rest) = l.split_at(name.len());
            if n.eq_ignore_ascii_case(name) && rest.starts_with(b": ") {
                return Some(&rest[2..]);
            }
        }
        None
    }

    pub fn content_type(&self) -> &[u8] {
        self.helper.content_type.slice(self.buf.bytes())
    }

    pub fn authorization(&self) -> &[u8] {
        self.helper.authorization.slice(self.buf.bytes())
    }

    // ===== Body =====

    /// Raw request body; empty until the dispatch pipeline reads it.
    pub fn body(&self) -> &[u8] {
        match &self.body {
            BodyStore::None => &[],
            BodyStore::Inline(span) => span.slice(self.buf.bytes()),
            BodyStore::Buffered(buffer) => buffer.as_slice(),
        }
    }

    // ===== Key/value collections =====

    /// Look up a query parameter (percent-decoded, first occurrence
    /// wins on duplicates).
    pub fn query_param(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.ensure_query_parsed();
        let loc = self.helper.query_string;
        let params = self.query_params.as_ref()?;
        params.lookup(self.store_slice(loc.store), key)
    }

    /// Sorted query parameters as `(key, value)` slices.
    pub fn query_pairs(&mut self) -> Vec<(&[u8], &[u8])> {
        self.ensure_query_parsed();
        let store = self.store_slice(self.helper.query_string.store);
        match &self.query_params {
            Some(params) => params
                .iter()
                .map(|&(k, v)| (k.slice(store), v.slice(store)))
                .collect(),
            None => Vec::new(),
        }
    }

    fn ensure_query_parsed(&mut self) {
        if self.flags.contains(RequestFlags::PARSED_QUERY) {
            return;
        }
        self.flags.set(RequestFlags::PARSED_QUERY);
        let loc = self.helper.query_string;
        self.query_params = match loc.store {
            Store::Head => parse_key_values(self.buf.bytes_mut(), loc.span, b'&', ValueDecode::Url),
            Store::Url => parse_key_values(&mut self.rewritten, loc.span, b'&', ValueDecode::Url),
            Store::Body => None,
        };
    }

    /// Look up a cookie. Values are not decoded.
    pub fn cookie(&mut self, key: &[u8]) -> Option<&[u8]> {
        if !self.flags.contains(RequestFlags::PARSED_COOKIES) {
            self.flags.set(RequestFlags::PARSED_COOKIES);
            let span = self.helper.cookie;
            self.cookies =
                parse_key_values(self.buf.bytes_mut(), span, b';', ValueDecode::Identity);
        }
        let params = self.cookies.as_ref()?;
        params.lookup(self.buf.bytes(), key)
    }

    /// Look up a form field from an `x-www-form-urlencoded` body.
    pub fn post_param(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.ensure_post_parsed();
        let loc = self.helper.post_data;
        let params = self.post_params.as_ref()?;
        params.lookup(self.store_slice(loc.store), key)
    }

    /// Sorted form fields as `(key, value)` slices.
    pub fn post_pairs(&mut self) -> Vec<(&[u8], &[u8])> {
        self.ensure_post_parsed();
        let store = self.store_slice(self.helper.post_data.store);
        match &self.post_params {
            Some(params) => params
                .iter()
                .map(|&(k, v)| (k.slice(store), v.slice(store)))
                .collect(),
            None => Vec::new(),
        }
    }

    fn ensure_post_parsed(&mut self) {
        if self.flags.contains(RequestFlags::PARSED_POST) {
            return;
        }
        self.flags.set(RequestFlags::PARSED_POST);

        let content_type = self.helper.content_type;
        if !content_type
            .slice(self.buf.bytes())
            .starts_with(b"application/x-www-form-urlencoded")
        {
            return;
        }

        let loc = self.helper.post_data;
        self.post_params = match loc.store {
            Store::Head => parse_key_values(self.buf.bytes_mut(), loc.span, b'&', ValueDecode::Url),
            Store::Body => match &mut self.body {
                BodyStore::Buffered(buffer) => {
                    parse_key_values(buffer.as_mut_slice(), loc.span, b'&', ValueDecode::Url)
                }
                _ => None,
            },
            Store::Url => None,
        };
    }

    // ===== Connection-scoped accessors =====

    /// Numeric remote address: the proxied source when a PROXY
    /// preamble introduced the request, the socket peer otherwise.
    pub fn remote_address(&self) -> Option<String> {
        if self.flags.contains(RequestFlags::PROXIED) {
            return match self.proxy?.source {
                ProxyPeer::Inet(addr) => Some(addr.ip().to_string()),
                ProxyPeer::Unspecified => Some("*unspecified*".to_string()),
            };
        }
        self.peer_addr.map(|addr| addr.ip().to_string())
    }

    /// Suspend the handler for `ms` milliseconds.
    pub async fn sleep(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    // ===== Dispatch support =====

    /// Replace the URL for another routing pass. The new URL is owned
    /// by the request; spans from it cannot outlive the request.
    pub fn rewrite_url(&mut self, url: String) {
        self.rewritten = url.into_bytes();
        self.url = Loc {
            store: Store::Url,
            span: Span::new(0, self.rewritten.len()),
        };
        self.flags.set(RequestFlags::URL_REWRITTEN);
    }

    pub(crate) fn apply_rewrite(&mut self) -> Result<()> {
        self.flags.clear(RequestFlags::URL_REWRITTEN);

        let store = self.url.store;
        let mut span = self.url.span;
        let (query, fragment) = parser::split_fragment_and_query(self.store_slice(store), &mut span);
        self.url.span = span;
        self.helper.query_string = Loc { store, span: query };
        self.helper.fragment = Loc {
            store,
            span: fragment,
        };

        self.helper.rewrites += 1;
        if self.helper.rewrites > 4 {
            return Err(Error::Internal("rewrite loop"));
        }
        Ok(())
    }

    pub(crate) fn strip_url_prefix(&mut self, n: usize) {
        let span = self.url.span;
        self.url.span = Span::new(span.start() + n, span.len() - n);
    }

    pub(crate) fn remove_leading_slashes(&mut self) {
        let bytes = self.store_slice(self.url.store);
        let mut start = self.url.span.start();
        let mut len = self.url.span.len();
        while len > 0 && bytes[start] == b'/' {
            start += 1;
            len -= 1;
        }
        self.url.span = Span::new(start, len);
    }
}

/// Prefix-tag compare for Connection tokens, case-insensitive.
fn tag_matches(token: &[u8], tag: &[u8]) -> bool {
    token.len() >= tag.len() && token[..tag.len()].eq_ignore_ascii_case(tag)
}

/// Leading decimal run as u64 plus the digit count; `None` on no
/// digits or overflow.
fn take_u64(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut digits = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
        digits += 1;
    }
    if digits == 0 {
        None
    } else {
        Some((value, digits))
    }
}
