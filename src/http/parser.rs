//! Incremental HTTP/1.1 request parser.
//!
//! The parser is fed the connection's accumulated read buffer and advances
//! through two phases: headers (terminated by the first `\r\n\r\n`), then an
//! optional fixed-length body. Each phase is entered exactly once per
//! request; on completion the caller drains the consumed bytes so a
//! pipelined follow-up request stays buffered for later.

use super::limits;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Options,
    Head,
    Unknown,
}

impl Method {
    fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "HEAD" => Method::Head,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Head => "HEAD",
            Method::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ParsedRequest {
    pub method: Option<Method>,
    pub url: String,
    pub path: String,
    pub query: String,
    pub version_major: u8,
    pub version_minor: u8,
    headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_length: usize,
}

impl ParsedRequest {
    pub fn method(&self) -> Method {
        self.method.unwrap_or(Method::Unknown)
    }

    /// Case-insensitive header lookup; first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => true,
        }
    }

    pub fn body_str(&self) -> Option<&str> {
        self.body.as_deref().and_then(|b| std::str::from_utf8(b).ok())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// Wait for more bytes.
    NeedMore,
    /// A full request is available; `consumed` bytes belong to it.
    Complete { consumed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    Body { header_len: usize },
}

/// One parser instance per in-flight request on a connection.
pub struct RequestParser {
    phase: Phase,
    request: ParsedRequest,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Headers,
            request: ParsedRequest::default(),
        }
    }

    pub fn reading_body(&self) -> bool {
        matches!(self.phase, Phase::Body { .. })
    }

    /// Feed the accumulated buffer. Protocol violations (malformed start
    /// line, bound exceedance) are errors; the caller closes the connection.
    pub fn advance(&mut self, buf: &[u8]) -> Result<ParseStatus> {
        if self.phase == Phase::Headers {
            let Some(header_end) = find_header_end(buf) else {
                // No terminator yet. A header block larger than the read
                // buffer cap can never complete.
                if buf.len() >= limits::MAX_READ_BUF {
                    return Err(GatewayError::Protocol("header block too large".into()));
                }
                return Ok(ParseStatus::NeedMore);
            };

            self.parse_header_block(&buf[..header_end])?;
            let header_len = header_end + 4;

            if self.request.content_length > limits::MAX_BODY_LEN {
                return Err(GatewayError::Protocol("body exceeds maximum length".into()));
            }

            if self.request.content_length == 0 {
                return Ok(ParseStatus::Complete { consumed: header_len });
            }
            self.phase = Phase::Body { header_len };
        }

        let Phase::Body { header_len } = self.phase else {
            unreachable!()
        };

        let available = buf.len().saturating_sub(header_len);
        if available < self.request.content_length {
            return Ok(ParseStatus::NeedMore);
        }

        let body = buf[header_len..header_len + self.request.content_length].to_vec();
        self.request.body = Some(body);
        Ok(ParseStatus::Complete {
            consumed: header_len + self.request.content_length,
        })
    }

    /// Consume the parser, yielding the finished request.
    pub fn finish(self) -> ParsedRequest {
        self.request
    }

    fn parse_header_block(&mut self, block: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(block)
            .map_err(|_| GatewayError::Protocol("header block is not valid UTF-8".into()))?;

        let mut lines = text.split("\r\n");
        let start_line = lines
            .next()
            .ok_or_else(|| GatewayError::Protocol("empty request".into()))?;

        self.parse_start_line(start_line)?;

        let req = &mut self.request;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if req.headers.len() >= limits::MAX_HEADERS {
                return Err(GatewayError::Protocol("too many headers".into()));
            }
            let Some(colon) = line.find(':') else {
                // Tolerate and skip malformed header lines
                continue;
            };
            let key = &line[..colon];
            let value = line[colon + 1..].trim_start_matches(' ');
            if key.len() > limits::MAX_HEADER_KEY {
                return Err(GatewayError::Protocol("header key too long".into()));
            }
            if value.len() > limits::MAX_HEADER_VALUE {
                return Err(GatewayError::Protocol("header value too long".into()));
            }
            req.headers.push((key.to_string(), value.to_string()));
        }

        if let Some(cl) = req.header("Content-Length") {
            req.content_length = cl.trim().parse::<usize>().unwrap_or(0);
        }

        Ok(())
    }

    fn parse_start_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.splitn(3, ' ');
        let method = parts
            .next()
            .ok_or_else(|| GatewayError::Protocol("malformed request line".into()))?;
        let url = parts
            .next()
            .ok_or_else(|| GatewayError::Protocol("malformed request line".into()))?;
        let version = parts.next().unwrap_or("HTTP/1.1");

        if url.len() >= limits::MAX_URL_LEN {
            return Err(GatewayError::Protocol("URL too long".into()));
        }

        let req = &mut self.request;
        req.method = Some(Method::parse(method));
        req.url = url.to_string();

        match url.split_once('?') {
            Some((path, query)) => {
                req.path = path.to_string();
                req.query = query.to_string();
            }
            None => {
                req.path = url.to_string();
                req.query = String::new();
            }
        }

        let (major, minor) = parse_version(version);
        req.version_major = major;
        req.version_minor = minor;
        Ok(())
    }
}

fn parse_version(s: &str) -> (u8, u8) {
    s.strip_prefix("HTTP/")
        .and_then(|v| v.split_once('.'))
        .and_then(|(maj, min)| Some((maj.parse().ok()?, min.parse().ok()?)))
        .unwrap_or((1, 1))
}

pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
