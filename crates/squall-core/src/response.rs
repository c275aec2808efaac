//! HTTP response types
//!
//! Response serialization proper lives outside the request core; this
//! is the minimal surface the core needs to emit default error pages,
//! handler responses and the 101 upgrade.

use smallvec::SmallVec;

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            101 => "Switching Protocols",
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: SmallVec<[(String, String); 8]>,
    pub body: bytes::Bytes,
    /// Suppress the Content-Length header (101 upgrade responses)
    pub no_content_length: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: SmallVec::new(),
            body: bytes::Bytes::new(),
            no_content_length: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Create a text response
    pub fn text(body: impl Into<bytes::Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::OK)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .build()
    }

    /// Create an HTML response
    pub fn html(body: impl Into<bytes::Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(body)
            .build()
    }

    /// Default error page for a status code.
    pub fn default_for(status: StatusCode) -> Self {
        let body = format!(
            "<html><head><title>{status}</title></head><body><h1>{status}</h1></body></html>",
        );
        ResponseBuilder::new(status)
            .header("Content-Type", "text/html")
            .body(body)
            .build()
    }

    /// 401 challenge for a basic-auth realm.
    pub fn unauthorized(realm: &str) -> Self {
        let mut response = Self::default_for(StatusCode::UNAUTHORIZED);
        response
            .headers
            .push(("WWW-Authenticate".to_string(), format!("Basic realm=\"{realm}\"")));
        response
    }

    /// Get a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to HTTP/1.1 wire format.
    ///
    /// `keep_alive` decides the Connection header unless the response
    /// already carries one (the 101 upgrade does).
    pub fn to_http1_bytes(&self, keep_alive: bool) -> bytes::Bytes {
        let mut buf = Vec::with_capacity(256 + self.body.len());

        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(self.status.0.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.reason_phrase().as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if self.header("Connection").is_none() {
            buf.extend_from_slice(if keep_alive {
                b"Connection: keep-alive\r\n".as_slice()
            } else {
                b"Connection: close\r\n".as_slice()
            });
        }

        if !self.no_content_length {
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(self.body.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);

        buf.into()
    }
}

/// Builder for constructing responses
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            response: Response::new(status),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<bytes::Bytes>) -> Self {
        self.response.body = body.into();
        self
    }

    pub fn no_content_length(mut self) -> Self {
        self.response.no_content_length = true;
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize() {
        let response = ResponseBuilder::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body("hello")
            .build();
        let bytes = response.to_http1_bytes(true);
        let s = std::str::from_utf8(&bytes).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: text/plain\r\n"));
        assert!(s.contains("Connection: keep-alive\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_serialize_close() {
        let bytes = Response::default_for(StatusCode::NOT_FOUND).to_http1_bytes(false);
        let s = std::str::from_utf8(&bytes).unwrap();
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_unauthorized_challenge() {
        let response = Response::unauthorized("admin");
        assert_eq!(
            response.header("WWW-Authenticate"),
            Some("Basic realm=\"admin\"")
        );
    }

    #[test]
    fn test_explicit_connection_header_wins() {
        let response = ResponseBuilder::new(StatusCode::SWITCHING_PROTOCOLS)
            .header("Connection", "Upgrade")
            .no_content_length()
            .build();
        let bytes = response.to_http1_bytes(true);
        let s = std::str::from_utf8(&bytes).unwrap();
        assert!(s.contains("Connection: Upgrade\r\n"));
        assert!(!s.contains("keep-alive"));
        assert!(!s.contains("Content-Length"));
    }
}
