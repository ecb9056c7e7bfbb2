//! HTTP/1.x stream dissector using httparse.
//!
//! Messages spanning several TCP segments are dissected once reassembly
//! holds the complete message. Supports requests and responses, bodies
//! delimited by `Content-Length`, chunked transfer encoding or the end of
//! the connection, and several messages per connection.

use std::ops::Range;

use httparse::{Header, Request, Response, Status, EMPTY_HEADER};

use crate::attr::{Attr, Value};
use crate::error::DissectError;
use crate::layer::Layer;
use crate::stream::{StreamContext, StreamDissection, StreamDissector};

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 64;

/// Ports HTTP is dissected on.
const HTTP_PORTS: [u16; 6] = [80, 8080, 8000, 8888, 3000, 5000];

/// Headers surfaced as attributes: (header name, attribute id).
const HEADER_ATTRS: &[(&str, &str)] = &[
    ("host", "http.host"),
    ("user-agent", "http.user_agent"),
    ("content-type", "http.content_type"),
    ("content-length", "http.content_length"),
    ("transfer-encoding", "http.transfer_encoding"),
    ("server", "http.server"),
    ("location", "http.location"),
    ("connection", "http.connection"),
];

/// Offsets of `part` within `data`; `part` must be a subslice of `data`.
fn span(data: &[u8], part: &[u8]) -> Range<usize> {
    let start = (part.as_ptr() as usize).saturating_sub(data.as_ptr() as usize);
    start..start + part.len()
}

/// Length of a complete chunked body, or `None` if more data is needed.
fn chunked_len(data: &[u8]) -> Result<Option<usize>, DissectError> {
    let malformed = |reason: &str| DissectError::InvalidField {
        dissector: "http",
        field: "chunk",
        reason: reason.to_string(),
    };
    let mut pos = 0;
    loop {
        let Some(line_len) = data[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&data[pos..pos + line_len])
            .map_err(|_| malformed("chunk size is not text"))?;
        // Chunk extensions follow a semicolon
        let size = line.split(';').next().unwrap_or(line).trim();
        let size = usize::from_str_radix(size, 16).map_err(|_| malformed("invalid chunk size"))?;
        pos += line_len + 2;

        if size == 0 {
            // Last chunk: empty line, possibly after trailers
            if data[pos..].starts_with(b"\r\n") {
                return Ok(Some(pos + 2));
            }
            return Ok(data[pos..]
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|end| pos + end + 4));
        }

        let end = pos
            .checked_add(size)
            .and_then(|n| n.checked_add(2))
            .ok_or_else(|| malformed("chunk size too large"))?;
        if data.len() < end {
            return Ok(None);
        }
        if &data[end - 2..end] != b"\r\n" {
            return Err(malformed("chunk not terminated by CRLF"));
        }
        pos = end;
    }
}

fn header<'h>(headers: &'h [Header<'_>], name: &str) -> Option<&'h Header<'h>> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name))
}

/// How the message body is delimited.
enum Body {
    None,
    Length(usize),
    Chunked,
    /// Until the connection closes.
    ToClose,
}

fn body_kind(headers: &[Header<'_>]) -> Result<Body, DissectError> {
    if let Some(te) = header(headers, "transfer-encoding") {
        if String::from_utf8_lossy(te.value).to_ascii_lowercase().contains("chunked") {
            return Ok(Body::Chunked);
        }
    }
    match header(headers, "content-length") {
        Some(cl) => std::str::from_utf8(cl.value)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(Body::Length)
            .ok_or_else(|| DissectError::InvalidField {
                dissector: "http",
                field: "content-length",
                reason: String::from_utf8_lossy(cl.value).into_owned(),
            }),
        None => Ok(Body::None),
    }
}

/// HTTP/1.x over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDissector;

impl HttpDissector {
    /// Build the layer for a message whose header block is `header_len` bytes.
    ///
    /// `closed` says whether the stream has ended, which completes a body
    /// delimited by the connection.
    fn finish(
        data: &[u8],
        header_len: usize,
        body: Body,
        closed: bool,
        mut layer: Layer,
        headers: &[Header<'_>],
    ) -> Result<StreamDissection, DissectError> {
        for h in headers.iter().filter(|h| !h.name.is_empty()) {
            let Some((_, id)) = HEADER_ATTRS.iter().find(|(name, _)| h.name.eq_ignore_ascii_case(name)) else {
                continue;
            };
            let text = String::from_utf8_lossy(h.value);
            let value = match text.trim().parse::<i64>() {
                Ok(n) if *id == "http.content_length" => Value::Int(n),
                _ => Value::str(text.trim()),
            };
            layer.push_attr(Attr::new(id, value, span(data, h.value)));
        }

        let body_len = match body {
            Body::None => 0,
            Body::Length(len) => len,
            Body::Chunked => match chunked_len(&data[header_len..])? {
                Some(len) => len,
                None => return Ok(StreamDissection::NeedMore { minimum: None }),
            },
            Body::ToClose if !closed => return Ok(StreamDissection::NeedMore { minimum: None }),
            Body::ToClose => data.len() - header_len,
        };
        let total = header_len
            .checked_add(body_len)
            .ok_or_else(|| DissectError::InvalidField {
                dissector: "http",
                field: "content-length",
                reason: format!("body of {body_len} bytes is too large"),
            })?;
        if data.len() < total {
            return Ok(StreamDissection::NeedMore {
                minimum: Some(total),
            });
        }
        if body_len > 0 {
            layer.push_attr(Attr::new(
                "http.body",
                Value::bytes(&data[header_len..total]),
                header_len..total,
            ));
        }
        Ok(StreamDissection::Layer {
            layer: layer.with_payload(total..total),
            consumed: total,
        })
    }
}

impl StreamDissector for HttpDissector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn min_len(&self) -> usize {
        16
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[
            ("http", "Hypertext Transfer Protocol"),
            ("http.request", "Request"),
            ("http.request.method", "Request Method"),
            ("http.request.uri", "Request URI"),
            ("http.request.version", "Request Version"),
            ("http.response", "Response"),
            ("http.response.version", "Response Version"),
            ("http.response.code", "Status Code"),
            ("http.response.phrase", "Response Phrase"),
            ("http.host", "Host"),
            ("http.user_agent", "User-Agent"),
            ("http.content_type", "Content-Type"),
            ("http.content_length", "Content-Length"),
            ("http.transfer_encoding", "Transfer-Encoding"),
            ("http.server", "Server"),
            ("http.location", "Location"),
            ("http.connection", "Connection"),
            ("http.body", "Body"),
        ]
    }

    fn accepts(&self, context: &StreamContext<'_>) -> bool {
        context.protocol() == "tcp" && HTTP_PORTS.iter().any(|p| context.has_port(*p))
    }

    fn dissect(
        &self,
        data: &[u8],
        context: &StreamContext<'_>,
    ) -> Result<StreamDissection, DissectError> {
        let invalid = |e: httparse::Error| DissectError::InvalidField {
            dissector: "http",
            field: "message",
            reason: e.to_string(),
        };

        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        if data.starts_with(b"HTTP/") {
            let mut response = Response::new(&mut headers);
            let header_len = match response.parse(data).map_err(invalid)? {
                Status::Complete(len) => len,
                Status::Partial => return Ok(StreamDissection::NeedMore { minimum: None }),
            };
            let code = response.code.unwrap_or_default();
            let version = format!("HTTP/1.{}", response.version.unwrap_or_default());
            let phrase = response.reason.unwrap_or_default();
            let status_line = data.iter().position(|&b| b == b'\r').unwrap_or(header_len);

            let layer = Layer::new("http", 0..data.len()).with_attr(
                Attr::new("http.response", true, 0..status_line)
                    .with_child(Attr::new("http.response.version", Value::str(&version), 0..8))
                    .with_child(Attr::new("http.response.code", code, 9..12))
                    .with_child(Attr::new("http.response.phrase", phrase, span(data, phrase.as_bytes()))),
            );
            let mut body = body_kind(response.headers)?;
            // No body for 1xx, 204 and 304; otherwise an undelimited body runs to close
            if matches!(body, Body::None) && !(code < 200 || code == 204 || code == 304) {
                body = Body::ToClose;
            }
            return Self::finish(data, header_len, body, context.closed, layer, response.headers);
        }

        let mut request = Request::new(&mut headers);
        let header_len = match request.parse(data).map_err(invalid)? {
            Status::Complete(len) => len,
            Status::Partial => return Ok(StreamDissection::NeedMore { minimum: None }),
        };
        let method = request.method.unwrap_or_default();
        let uri = request.path.unwrap_or_default();
        let version = format!("HTTP/1.{}", request.version.unwrap_or_default());
        let request_line = data.iter().position(|&b| b == b'\r').unwrap_or(header_len);
        let version_start = request_line.saturating_sub(8);

        let layer = Layer::new("http", 0..data.len()).with_attr(
            Attr::new("http.request", true, 0..request_line)
                .with_child(Attr::new("http.request.method", method, span(data, method.as_bytes())))
                .with_child(Attr::new("http.request.uri", uri, span(data, uri.as_bytes())))
                .with_child(Attr::new(
                    "http.request.version",
                    Value::str(&version),
                    version_start..request_line,
                )),
        );
        let body = body_kind(request.headers)?;
        Self::finish(data, header_len, body, context.closed, layer, request.headers)
    }
}
