//! Incoming request type.
//!
//! The server collects the body before the chain runs, so handlers see a
//! complete `Bytes` buffer. The same type is built synthetically by the event
//! multiplexer for every envelope it receives, and by tests.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Uri};

/// A value stored on a request or a context.
pub type Value = Arc<dyn Any + Send + Sync>;

/// An incoming request.
pub struct Request {
    pub(crate) method: http::Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) extensions: Extensions,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) values: HashMap<String, Value>,
}

impl Request {
    /// Builds a request by hand. A URI that does not parse becomes `/`.
    pub fn new(method: http::Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.parse().unwrap_or_else(|_| Uri::from_static("/")),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            extensions: Extensions::new(),
            remote_addr: None,
            values: HashMap::new(),
        }
    }

    pub(crate) fn from_parts(parts: http::request::Parts, body: Bytes, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            extensions: parts.extensions,
            remote_addr,
            values: HashMap::new(),
        }
    }

    /// Adds a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.append(n, v);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Attaches a request-scoped value, visible through
    /// [`Context::value`](crate::Context::value) when the context store has
    /// no entry of the same key.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Any + Send + Sync) -> Self {
        self.values.insert(key.into(), Arc::new(value));
        self
    }

    pub fn method(&self) -> &http::Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn extensions(&self) -> &Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.extensions }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup; non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Content length as declared, falling back to the buffered body size.
    pub fn content_length(&self) -> u64 {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.body.len() as u64)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new(http::Method::GET, "/")
    }
}
