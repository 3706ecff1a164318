//! Minimal HTTP/1.1 framing used by the request driver
//!
//! Only what the bridge needs: serializing an outbound request, parsing a
//! response head, and incrementally decoding a response body.

pub mod body;
pub mod head;

pub use body::{BodyDecoder, ChunkedDecoder};
pub use head::ResponseHead;

use bytes::{BufMut, Bytes, BytesMut};
use http::Method;
use http::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue};

use crate::error::{BridgeError, Result};

/// Normalized outbound request handed to the driver
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, host, path)
    }

    pub fn post(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::POST, host, path)
    }

    /// Add a header, replacing any previous value with the same name
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| BridgeError::Protocol(format!("invalid header name `{}`: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| BridgeError::Protocol(format!("invalid header value for {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON body with the matching content type
    pub fn json(self, value: &serde_json::Value) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("content-type", "application/json")?.body(body))
    }

    /// Serialize as an HTTP/1.1 message, filling in `Host` and `Content-Length`
    pub fn encode(&self) -> Bytes {
        let path = if self.path.is_empty() { "/" } else { &self.path };

        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        if !self.headers.contains_key(HOST) {
            put_header(&mut buf, HOST.as_str(), self.host.as_bytes());
        }
        for (name, value) in &self.headers {
            put_header(&mut buf, name.as_str(), value.as_bytes());
        }
        if !self.headers.contains_key(CONTENT_LENGTH) && self.needs_content_length() {
            put_header(
                &mut buf,
                CONTENT_LENGTH.as_str(),
                self.body.len().to_string().as_bytes(),
            );
        }

        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }

    fn needs_content_length(&self) -> bool {
        !self.body.is_empty()
            || matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Build a percent-encoded query string from ordered key/value pairs
///
/// Keys are emitted verbatim; values keep `A-Za-z0-9-_.!~*'()` and escape
/// every other byte as `%XX`.
pub fn encode_query<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut query = String::new();
    for (i, (key, value)) in params.into_iter().enumerate() {
        if i > 0 {
            query.push('&');
        }
        query.push_str(key);
        query.push('=');
        for byte in value.bytes() {
            match byte {
                b'A'..=b'Z'
                | b'a'..=b'z'
                | b'0'..=b'9'
                | b'-'
                | b'_'
                | b'.'
                | b'!'
                | b'~'
                | b'*'
                | b'\''
                | b'('
                | b')' => query.push(byte as char),
                _ => query.push_str(&format!("%{:02X}", byte)),
            }
        }
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_post_with_body() {
        let req = HttpRequest::post("api.example.com", "/v1/chat")
            .header("User-Agent", "bridge-test")
            .unwrap()
            .body("hello");

        let encoded = String::from_utf8(req.encode().to_vec()).unwrap();
        assert!(encoded.starts_with("POST /v1/chat HTTP/1.1\r\n"));
        assert!(encoded.contains("host: api.example.com\r\n"));
        assert!(encoded.contains("user-agent: bridge-test\r\n"));
        assert!(encoded.contains("content-length: 5\r\n"));
        assert!(encoded.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_encode_get_without_body() {
        let req = HttpRequest::get("example.com", "");
        let encoded = String::from_utf8(req.encode().to_vec()).unwrap();
        assert!(encoded.starts_with("GET / HTTP/1.1\r\n"));
        assert!(!encoded.contains("content-length"));
        assert!(encoded.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_explicit_host_wins() {
        let req = HttpRequest::get("10.0.0.1", "/")
            .header("Host", "chat.example.com")
            .unwrap();
        let encoded = String::from_utf8(req.encode().to_vec()).unwrap();
        assert!(encoded.contains("host: chat.example.com\r\n"));
        assert!(!encoded.contains("10.0.0.1"));
    }

    #[test]
    fn test_json_body() {
        let req = HttpRequest::post("example.com", "/api")
            .json(&serde_json::json!({"stream": true}))
            .unwrap();
        assert_eq!(&req.body[..], br#"{"stream":true}"#);
        assert_eq!(req.headers["content-type"], "application/json");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = HttpRequest::get("example.com", "/").header("bad header", "x");
        assert!(matches!(result, Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_encode_query() {
        let query = encode_query([
            ("q", "hello world"),
            ("page", "1"),
            ("mkt", ""),
            ("filter", "WebPages,Translations"),
        ]);
        assert_eq!(query, "q=hello%20world&page=1&mkt=&filter=WebPages%2CTranslations");
    }

    #[test]
    fn test_encode_query_utf8() {
        assert_eq!(encode_query([("q", "é")]), "q=%C3%A9");
    }
}
