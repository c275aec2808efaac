//! In-place percent-decoding and key/value splitting
//!
//! Query strings, form bodies and cookies all reduce to the same shape:
//! a separator-delimited list of `key=value` tokens inside a region of
//! some request-owned store. Decoding only ever shrinks, so it rewrites
//! the token's own bytes and records the new length in its span; no
//! copies are made.

use memchr::memchr;

use crate::ascii::{decode_hex_digit, is_hex_digit};
use crate::error::{Error, Result};
use crate::parser::Span;

/// How values (and keys) of a token list are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDecode {
    /// Percent-decode in place (query strings, form bodies)
    Url,
    /// Leave bytes untouched (cookies)
    Identity,
}

/// Percent-decode `buf` in place and return the decoded length.
///
/// `%XY` with two hex digits becomes a single byte, `+` becomes a
/// space, and a malformed escape is copied through literally. Decoding
/// to a NUL byte is rejected so a decoded string can never silently
/// truncate consumers that stop at the first zero.
pub fn percent_decode_in_place(buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    let mut write = 0;

    while read < buf.len() {
        let b = buf[read];
        if b == b'%' && read + 2 < buf.len() && is_hex_digit(buf[read + 1]) && is_hex_digit(buf[read + 2]) {
            let decoded = decode_hex_digit(buf[read + 1]) << 4 | decode_hex_digit(buf[read + 2]);
            if decoded == 0 {
                return Err(Error::BadRequest);
            }
            buf[write] = decoded;
            read += 3;
        } else if b == b'+' {
            buf[write] = b' ';
            read += 1;
        } else {
            buf[write] = b;
            read += 1;
        }
        write += 1;
    }

    Ok(write)
}

/// Key/value span pairs sorted by key for binary-search lookup.
///
/// Duplicate keys are kept; lookup returns the first entry in sorted
/// order, which under the stable sort is the first occurrence in the
/// source text.
#[derive(Debug, Default)]
pub struct KeyValueSpans {
    pairs: Vec<(Span, Span)>,
}

impl KeyValueSpans {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Span, Span)> {
        self.pairs.iter()
    }

    /// Binary-search `key` and resolve the value against `store`.
    pub fn lookup<'s>(&self, store: &'s [u8], key: &[u8]) -> Option<&'s [u8]> {
        let mut idx = self
            .pairs
            .binary_search_by(|(k, _)| k.slice(store).cmp(key))
            .ok()?;
        while idx > 0 && self.pairs[idx - 1].0.slice(store) == key {
            idx -= 1;
        }
        Some(self.pairs[idx].1.slice(store))
    }
}

/// Split `region` of `store` into sorted key/value spans.
///
/// Tokens are delimited by `separator` (with surrounding spaces
/// skipped) and split on the first `=`; a token without `=` gets an
/// empty value. A key or value that fails decoding, or a key that
/// decodes to nothing under [`ValueDecode::Url`], discards the whole
/// array, as does a trailing separator.
pub fn parse_key_values(
    store: &mut [u8],
    region: Span,
    separator: u8,
    decode: ValueDecode,
) -> Option<KeyValueSpans> {
    if region.is_empty() {
        return None;
    }

    let mut pairs = Vec::new();
    let mut pos = region.start();
    let end = region.end();

    loop {
        while pos < end && (store[pos] == b' ' || store[pos] == separator) {
            pos += 1;
        }
        if pos >= end {
            return None;
        }

        let token_end = match memchr(separator, &store[pos..end]) {
            Some(rel) => pos + rel,
            None => end,
        };

        let (key, value) = match memchr(b'=', &store[pos..token_end]) {
            Some(rel) => (
                Span::new(pos, rel),
                Span::new(pos + rel + 1, token_end - (pos + rel + 1)),
            ),
            None => (Span::new(pos, token_end - pos), Span::new(token_end, 0)),
        };

        let value = decode_region(store, value, decode)?;
        let key = decode_region(store, key, decode)?;
        if decode == ValueDecode::Url && key.is_empty() {
            return None;
        }

        pairs.push((key, value));

        if token_end >= end {
            break;
        }
        pos = token_end + 1;
    }

    pairs.sort_by(|(a, _), (b, _)| store[a.range()].cmp(&store[b.range()]));

    Some(KeyValueSpans { pairs })
}

fn decode_region(store: &mut [u8], span: Span, decode: ValueDecode) -> Option<Span> {
    match decode {
        ValueDecode::Identity => Some(span),
        ValueDecode::Url => {
            let new_len = percent_decode_in_place(&mut store[span.range()]).ok()?;
            Some(Span::new(span.start(), new_len))
        }
    }
}
