//! HTTP response builder.
//!
//! Headers are emitted in registration order; `Content-Length` is always
//! injected last, computed from the body. The body is sent verbatim.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Response {
    status_code: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status_code: 200,
            status_text: "OK".into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, code: u16, text: &str) {
        self.status_code = code;
        self.status_text = text.to_string();
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_string(), value.to_string()));
    }

    /// Add a header only if no header with that name exists yet.
    pub fn ensure_header(&mut self, key: &str, value: &str) {
        if !self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) {
            self.add_header(key, value);
        }
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn set_json(&mut self, json: &Value) {
        self.add_header("Content-Type", "application/json");
        self.body = serde_json::to_vec(json).unwrap_or_else(|_| b"{}".to_vec());
    }

    /// Convenience constructor for the common JSON-reply case.
    pub fn json(code: u16, text: &str, value: &Value) -> Response {
        let mut resp = Response::new();
        resp.set_status(code, text);
        resp.set_json(value);
        resp
    }

    /// Serialize: status line, headers in order, Content-Length last,
    /// blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text).as_bytes(),
        );
        for (key, value) in &self.headers {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
