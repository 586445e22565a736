//! Buffered response writer.
//!
//! Handlers never talk to the connection directly. They write into a
//! [`Response`], which records the status, headers and body, counts the bytes
//! written and remembers whether the header has been committed. The server
//! turns the finished buffer into one `http::Response`; the event multiplexer
//! turns it into one outbound envelope. Either way a handler's several writes
//! leave as a single message.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::logger::{Logger, TracingLogger};

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Css,          // text/css
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Gif,          // image/gif
    Html,         // text/html; charset=utf-8
    Javascript,   // text/javascript; charset=utf-8
    Jpeg,         // image/jpeg
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Pdf,          // application/pdf
    Png,          // image/png
    Svg,          // image/svg+xml
    Text,         // text/plain; charset=utf-8
    Wasm,         // application/wasm
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Css         => "text/css; charset=utf-8",
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Gif         => "image/gif",
            Self::Html        => "text/html; charset=utf-8",
            Self::Javascript  => "text/javascript; charset=utf-8",
            Self::Jpeg        => "image/jpeg",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Pdf         => "application/pdf",
            Self::Png         => "image/png",
            Self::Svg         => "image/svg+xml",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Wasm        => "application/wasm",
            Self::Xml         => "application/xml",
        }
    }

    /// Guesses a content type from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "css"          => Self::Css,
            "csv"          => Self::Csv,
            "gif"          => Self::Gif,
            "htm" | "html" => Self::Html,
            "js" | "mjs"   => Self::Javascript,
            "jpg" | "jpeg" => Self::Jpeg,
            "json"         => Self::Json,
            "pdf"          => Self::Pdf,
            "png"          => Self::Png,
            "svg"          => Self::Svg,
            "txt"          => Self::Text,
            "wasm"         => Self::Wasm,
            "xml"          => Self::Xml,
            _              => Self::OctetStream,
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

type BeforeHook = Box<dyn FnOnce(&mut Response) + Send>;
type AfterHook = Box<dyn Fn(&Response) + Send + Sync>;

/// The response writer handed to every handler through its context.
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: BytesMut,
    size: u64,
    committed: bool,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    logger: Arc<dyn Logger>,
}

impl Response {
    pub(crate) fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            size: 0,
            committed: false,
            before: Vec::new(),
            after: Vec::new(),
            logger,
        }
    }

    pub fn status(&self) -> u16 { self.status }
    pub fn size(&self) -> u64 { self.size }
    pub fn committed(&self) -> bool { self.committed }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Headers may be edited until the response is committed.
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    /// Sets a header, replacing any previous value. Invalid names or values
    /// are dropped.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.insert(n, v);
        }
    }

    /// Appends a header value without replacing existing ones.
    pub fn append_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.append(n, v);
        }
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header(CONTENT_TYPE.as_str(), content_type);
    }

    /// Registers a hook run right before the header is committed.
    pub fn before(&mut self, f: impl FnOnce(&mut Response) + Send + 'static) {
        self.before.push(Box::new(f));
    }

    /// Registers a hook run after every body write.
    pub fn after(&mut self, f: impl Fn(&Response) + Send + Sync + 'static) {
        self.after.push(Box::new(f));
    }

    /// Commits the status. A second call is a logged no-op.
    pub fn write_header(&mut self, code: u16) {
        if self.committed {
            self.logger.printf(format_args!("response already committed"));
            return;
        }
        for hook in std::mem::take(&mut self.before) {
            hook(self);
        }
        self.status = code;
        self.committed = true;
    }

    /// Appends to the body, committing a `200` first if nothing was committed.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if !self.committed {
            self.write_header(200);
        }
        self.body.extend_from_slice(bytes);
        self.size += bytes.len() as u64;
        let after = std::mem::take(&mut self.after);
        for hook in &after {
            hook(self);
        }
        self.after = after;
        bytes.len()
    }

    /// Takes the buffered body, leaving the writer empty.
    pub(crate) fn take_body(&mut self) -> Bytes {
        std::mem::take(&mut self.body).freeze()
    }

    pub(crate) fn reset(&mut self, logger: Arc<dyn Logger>) {
        self.clear();
        self.logger = logger;
    }

    /// Empties the writer, keeping its logger.
    pub(crate) fn clear(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.size = 0;
        self.committed = false;
        self.before.clear();
        self.after.clear();
    }

    /// Moves status, headers and body out into an `http::Response`,
    /// leaving the writer empty.
    pub(crate) fn take_http(&mut self) -> http::Response<Bytes> {
        let mut res = http::Response::new(self.take_body());
        *res.status_mut() =
            http::StatusCode::from_u16(self.status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        *res.headers_mut() = std::mem::take(&mut self.headers);
        res
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl Logger for Capture {
        fn printf(&self, args: std::fmt::Arguments<'_>) {
            self.0.lock().unwrap().push(args.to_string());
        }
    }

    #[test]
    fn commits_once() {
        let log = Arc::new(Capture(Mutex::new(Vec::new())));
        let mut res = Response::new(log.clone());
        res.write_header(201);
        res.write_header(500);
        assert_eq!(res.status(), 201);
        assert_eq!(log.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn clear_keeps_logger() {
        let log = Arc::new(Capture(Mutex::new(Vec::new())));
        let mut res = Response::new(log.clone());
        res.write(b"stale");
        res.clear();
        assert!(!res.committed());
        assert!(res.body().is_empty());
        res.write_header(201);
        res.write_header(500);
        assert_eq!(log.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn write_commits_and_counts() {
        let mut res = Response::default();
        res.write(b"hello ");
        res.write(b"world");
        assert!(res.committed());
        assert_eq!(res.status(), 200);
        assert_eq!(res.size(), 11);
        assert_eq!(res.body(), b"hello world");
    }

    #[test]
    fn hooks_run_around_writes() {
        let mut res = Response::default();
        res.before(|r| r.set_header("x-before", "1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        res.after(move |r| s.lock().unwrap().push(r.size()));
        res.write(b"ab");
        res.write(b"c");
        assert_eq!(res.headers()["x-before"], "1");
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn reset_clears_everything() {
        let mut res = Response::default();
        res.set_header("x-a", "b");
        res.write(b"data");
        res.reset(Arc::new(TracingLogger));
        assert!(!res.committed());
        assert_eq!(res.size(), 0);
        assert!(res.headers().is_empty());
        assert!(res.body().is_empty());
    }

    #[test]
    fn extension_lookup() {
        assert_eq!(ContentType::from_extension("HTML"), ContentType::Html);
        assert_eq!(ContentType::from_extension("bin"), ContentType::OctetStream);
    }
}
