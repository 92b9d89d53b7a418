/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::websocket::WS_GUID;
use sha1::{Digest, Sha1};
use std::io;
use std::io::Write;
use std::str;

// some reasonable number
pub const HEADERS_MAX: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] httparse::Error),

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid header value")]
    InvalidHeader,

    #[error("request body of {size} bytes exceeds limit of {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("request head exceeds buffer capacity")]
    RequestTooLarge,

    #[error("invalid websocket upgrade: {0}")]
    InvalidUpgrade(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: &str, value: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            value: value.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    NoBody,
    Known(usize),
}

// a parsed request head plus its body, owned by the call that carries it
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version_minor: u8,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        for h in self.headers.iter() {
            if h.name.eq_ignore_ascii_case(name) {
                return Some(&h.value);
            }
        }

        None
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        match self.header(name) {
            Some(value) => str::from_utf8(value).ok(),
            None => None,
        }
    }

    // true if the comma-separated header contains the token, ignoring case
    pub fn header_contains_token(&self, name: &str, token: &str) -> bool {
        let value = match self.header_str(name) {
            Some(value) => value,
            None => return false,
        };

        for part in value.split(',') {
            if part.trim().eq_ignore_ascii_case(token) {
                return true;
            }
        }

        false
    }

    pub fn is_persistent(&self) -> bool {
        if self.version_minor >= 1 {
            !self.header_contains_token("Connection", "close")
        } else {
            self.header_contains_token("Connection", "keep-alive")
        }
    }

    pub fn expects_100(&self) -> bool {
        self.header_contains_token("Expect", "100-continue")
    }
}

// owned parse of a request head. returns None when more bytes are needed,
// and the head size + body expectation on success
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(Request, usize, BodySize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
    let mut req = httparse::Request::new(&mut headers);

    let size = match req.parse(buf)? {
        httparse::Status::Complete(size) => size,
        httparse::Status::Partial => return Ok(None),
    };

    let mut out_headers = Vec::with_capacity(req.headers.len());
    let mut body_size = BodySize::NoBody;

    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            let value = str::from_utf8(h.value).map_err(|_| Error::InvalidContentLength)?;

            let size: usize = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidContentLength)?;

            body_size = BodySize::Known(size);
        }

        if h.name.eq_ignore_ascii_case("Transfer-Encoding") {
            let value = str::from_utf8(h.value).map_err(|_| Error::InvalidHeader)?;

            if !value.trim().eq_ignore_ascii_case("identity") {
                return Err(Error::UnsupportedTransferEncoding);
            }
        }

        out_headers.push(Header::new(h.name, h.value));
    }

    let request = Request {
        method: req.method.unwrap().to_owned(),
        uri: req.path.unwrap().to_owned(),
        version_minor: req.version.unwrap(),
        headers: out_headers,
        body: Vec::new(),
    };

    Ok(Some((request, size, body_size)))
}

#[derive(Debug)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(code: u16, reason: &str, body: &str) -> Self {
        let mut resp = Self::new(code, reason);

        resp.headers
            .push(Header::new("Content-Type", b"text/plain"));
        resp.body = body.as_bytes().to_vec();

        resp
    }

    pub fn header(mut self, name: &str, value: &[u8]) -> Self {
        self.headers.push(Header::new(name, value));

        self
    }
}

pub fn write_response<W: Write>(
    writer: &mut W,
    resp: &Response,
    persistent: bool,
) -> Result<(), io::Error> {
    write!(writer, "HTTP/1.1 {} {}\r\n", resp.code, resp.reason)?;

    for h in resp.headers.iter() {
        write!(writer, "{}: ", h.name)?;
        writer.write_all(&h.value)?;
        writer.write_all(b"\r\n")?;
    }

    write!(writer, "Content-Length: {}\r\n", resp.body.len())?;

    if persistent {
        writer.write_all(b"Connection: keep-alive\r\n")?;
    } else {
        writer.write_all(b"Connection: close\r\n")?;
    }

    writer.write_all(b"\r\n")?;
    writer.write_all(&resp.body)?;

    Ok(())
}

pub fn write_100_continue<W: Write>(writer: &mut W) -> Result<(), io::Error> {
    writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
}

// a single entry from a Sec-WebSocket-Extensions header: name plus params
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, String)>,
}

// split a header value on the separator, honoring double quotes
fn split_quoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (pos, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == sep && !in_quotes {
            parts.push(&s[start..pos]);
            start = pos + 1;
        }
    }

    parts.push(&s[start..]);

    parts
}

fn unquote(s: &str) -> &str {
    let s = s.trim();

    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

// parse a Sec-WebSocket-Extensions value: offers separated by commas,
// params by semicolons, param values optionally quoted
pub fn parse_extension_offers(value: &[u8]) -> Result<Vec<ExtensionOffer>, Error> {
    let value = str::from_utf8(value).map_err(|_| Error::InvalidHeader)?;

    let mut offers = Vec::new();

    for entry in split_quoted(value, ',') {
        let entry = entry.trim();

        if entry.is_empty() {
            continue;
        }

        let mut parts = split_quoted(entry, ';').into_iter();

        // there's always a first part
        let name = parts.next().unwrap().trim();

        if name.is_empty() {
            return Err(Error::InvalidHeader);
        }

        let mut params = Vec::new();

        for part in parts {
            let part = part.trim();

            if part.is_empty() {
                return Err(Error::InvalidHeader);
            }

            let (k, v) = match part.find('=') {
                Some(pos) => (part[..pos].trim(), unquote(&part[(pos + 1)..])),
                None => (part, ""),
            };

            if k.is_empty() {
                return Err(Error::InvalidHeader);
            }

            params.push((k.to_owned(), v.to_owned()));
        }

        offers.push(ExtensionOffer {
            name: name.to_owned(),
            params,
        });
    }

    Ok(offers)
}

// websocket upgrade boundary

pub fn is_upgrade_request(req: &Request) -> bool {
    req.header_contains_token("Connection", "upgrade")
        && req.header_contains_token("Upgrade", "websocket")
}

// validate the handshake and return the client's key
pub fn validate_upgrade(req: &Request) -> Result<&str, Error> {
    if req.method != "GET" {
        return Err(Error::InvalidUpgrade("method must be GET"));
    }

    if req.version_minor < 1 {
        return Err(Error::InvalidUpgrade("version must be at least 1.1"));
    }

    match req.header_str("Sec-WebSocket-Version") {
        Some("13") => {}
        _ => return Err(Error::InvalidUpgrade("unsupported version")),
    }

    let key = match req.header_str("Sec-WebSocket-Key") {
        Some(key) if !key.is_empty() => key,
        _ => return Err(Error::InvalidUpgrade("missing key")),
    };

    Ok(key)
}

pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();

    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());

    base64::encode(hasher.finalize())
}

pub fn write_upgrade_response<W: Write>(
    writer: &mut W,
    accept: &str,
    extensions: Option<&str>,
    protocol: Option<&str>,
) -> Result<(), io::Error> {
    writer.write_all(b"HTTP/1.1 101 Switching Protocols\r\n")?;
    writer.write_all(b"Upgrade: websocket\r\n")?;
    writer.write_all(b"Connection: Upgrade\r\n")?;
    write!(writer, "Sec-WebSocket-Accept: {}\r\n", accept)?;

    if let Some(extensions) = extensions {
        write!(writer, "Sec-WebSocket-Extensions: {}\r\n", extensions)?;
    }

    if let Some(protocol) = protocol {
        write!(writer, "Sec-WebSocket-Protocol: {}\r\n", protocol)?;
    }

    writer.write_all(b"\r\n")?;

    Ok(())
}
