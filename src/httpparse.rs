// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Restartable HTTP/1 response-line and header tokenizers.
//!
//! Both [`parse_status_line`] and [`parse_header`] operate on the *entire* buffer
//! received so far and are safe to call again with more bytes appended: they never
//! retain state across calls beyond what the caller already owns (the buffer itself).
//! [`Parsed::Incomplete`] means "call me again once more bytes have arrived".

use std::fmt::Display;

/// Failure parsing a status line or header field.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The status line did not start with a recognizable `HTTP/` token.
    Version,
    /// The status code was not exactly three ASCII digits.
    StatusCode,
    /// A header line had no `:` separator, or a malformed name/value.
    Header,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ParseError::Version => "bad HTTP response line",
            ParseError::StatusCode => "bad HTTP status code",
            ParseError::Header => "bad HTTP header",
        })
    }
}

impl std::error::Error for ParseError {}

/// Result of a restartable parse: either the buffer doesn't yet hold a complete token,
/// or it does and `consumed` bytes should be shifted off the front of it.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<T> {
    /// Not enough bytes buffered yet; call again once more have arrived.
    Incomplete,
    /// A token was parsed, consuming this many bytes from the start of the buffer.
    Complete {
        /// The parsed value, borrowed from the input buffer.
        value: T,
        /// Number of bytes to advance past, including any terminating CRLF.
        consumed: usize,
    },
}

/// An HTTP/1 status line: `HTTP/1.1 200 OK`.
#[derive(Debug, PartialEq, Eq)]
pub struct StatusLine<'a> {
    /// The protocol token, e.g. `b"HTTP/1.1"`.
    pub proto: &'a [u8],
    /// The three-digit status code.
    pub code: u16,
    /// The reason phrase, e.g. `b"OK"`. May be empty.
    pub reason: &'a [u8],
}

/// A single HTTP header field.
#[derive(Debug, PartialEq, Eq)]
pub struct Header<'a> {
    /// Header field name, not including the trailing `:`.
    pub name: &'a [u8],
    /// Header field value, with leading/trailing optional whitespace stripped.
    pub value: &'a [u8],
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses a status line from the front of `buf`.
///
/// # Example
/// ```
/// # use aggressor::httpparse::{parse_status_line, Parsed};
/// let Parsed::Complete { value, consumed } =
///     parse_status_line(b"HTTP/1.1 200 OK\r\nmore").unwrap()
/// else { panic!("expected complete") };
/// assert_eq!(200, value.code);
/// assert_eq!(17, consumed);
/// ```
pub fn parse_status_line(buf: &[u8]) -> Result<Parsed<StatusLine<'_>>, ParseError> {
    let Some(eol) = find_crlf(buf) else {
        return Ok(Parsed::Incomplete);
    };
    let line = &buf[..eol];

    let Some(sp1) = line.iter().position(|&b| b == b' ') else {
        return Err(ParseError::Version);
    };
    let proto = &line[..sp1];
    if !proto.starts_with(b"HTTP/") {
        return Err(ParseError::Version);
    }

    let rest = &line[sp1 + 1..];
    if rest.len() < 3 || !rest[..3].iter().all(u8::is_ascii_digit) {
        return Err(ParseError::StatusCode);
    }
    let code: u16 = std::str::from_utf8(&rest[..3])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::StatusCode)?;

    let reason = match rest.get(3) {
        Some(b' ') => &rest[4..],
        None => &rest[3..],
        Some(_) => return Err(ParseError::StatusCode),
    };

    Ok(Parsed::Complete {
        value: StatusLine { proto, code, reason },
        consumed: eol + 2,
    })
}

/// Parses one header field, or the blank line terminating the header block, from the
/// front of `buf`.
///
/// A blank line (bare `\r\n`) yields `consumed <= 2` with an empty name and value,
/// signaling the caller to stop iterating headers.
pub fn parse_header(buf: &[u8]) -> Result<Parsed<Header<'_>>, ParseError> {
    let Some(eol) = find_crlf(buf) else {
        return Ok(Parsed::Incomplete);
    };
    let line = &buf[..eol];
    let consumed = eol + 2;

    if line.is_empty() {
        return Ok(Parsed::Complete {
            value: Header { name: b"", value: b"" },
            consumed,
        });
    }

    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return Err(ParseError::Header);
    };
    let name = &line[..colon];
    if name.is_empty() {
        return Err(ParseError::Header);
    }

    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
        value = &value[..value.len() - 1];
    }

    Ok(Parsed::Complete {
        value: Header { name, value },
        consumed,
    })
}

/// Case-insensitive comparison of a header name against an ASCII literal such as
/// `"Content-Length"`.
#[inline]
pub fn header_name_eq(name: &[u8], literal: &str) -> bool {
    name.eq_ignore_ascii_case(literal.as_bytes())
}
