//! Per-request context.
//!
//! A [`Context`] bundles the request, the response writer, the route match
//! and a small key/value store. Contexts are pooled by the server: one is
//! taken per request, reset, handed to the middleware chain by `&mut`, then
//! cleaned and returned. The parameter buffer keeps its length (the router's
//! widest route) and its string capacity across requests.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, HttpError, Result};
use crate::form::{Form, FormFile};
use crate::handler::{BoxedHandler, Middleware};
use crate::method::Method;
use crate::request::{Request, Value};
use crate::response::{ContentType, Response};
use crate::router::{Lookup, Router};
use crate::server::{self, Fallback, Route, Server};

/// Per-request state handed to handlers and middleware.
pub struct Context {
    request: Request,
    response: Response,
    path: Arc<str>,
    pnames: Arc<[String]>,
    pvalues: Vec<String>,
    query: Option<HashMap<String, Vec<String>>>,
    form: Option<Form>,
    pub(crate) handler: Option<BoxedHandler>,
    store: RwLock<HashMap<String, Value>>,
    server: Option<Arc<Server>>,
}

impl Context {
    /// A detached context, useful for exercising handlers without a server.
    /// Error and OK responses use the default handlers.
    pub fn new(request: Request) -> Self {
        Self::with_params(request, 0)
    }

    pub(crate) fn with_params(request: Request, max_param: usize) -> Self {
        Self {
            request,
            response: Response::default(),
            path: Arc::from(""),
            pnames: Arc::from(Vec::new()),
            pvalues: vec![String::new(); max_param],
            query: None,
            form: None,
            handler: None,
            store: RwLock::new(HashMap::new()),
            server: None,
        }
    }

    /// Prepares a pooled context for a new request.
    pub(crate) fn reset(&mut self, request: Request, server: Arc<Server>) {
        let logger = server.logger();
        self.pvalues.resize_with(server.max_param(), String::new);
        self.request = request;
        self.response.reset(logger);
        self.server = Some(server);
    }

    /// Drops everything request-specific so the context can go back to the pool.
    pub(crate) fn clean(&mut self) -> Request {
        self.response.clear();
        self.path = Arc::from("");
        self.pnames = Arc::from(Vec::new());
        self.pvalues.iter_mut().for_each(String::clear);
        self.query = None;
        self.form = None;
        self.handler = None;
        self.store.get_mut().clear();
        self.server = None;
        std::mem::take(&mut self.request)
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request { &self.request }
    pub fn request_mut(&mut self) -> &mut Request { &mut self.request }
    pub fn response(&self) -> &Response { &self.response }
    pub fn response_mut(&mut self) -> &mut Response { &mut self.response }

    /// The server handling this request, if any.
    pub fn server(&self) -> Option<&Arc<Server>> {
        self.server.as_ref()
    }

    /// Template of the matched route, e.g. `/users/:id`.
    pub fn path(&self) -> &str { &self.path }

    pub fn set_path(&mut self, path: &str) {
        self.path = Arc::from(path);
    }

    /// Resolves the request against `router`, filling the route template,
    /// parameter names and values, and the handler to run.
    pub(crate) fn route(&mut self, router: &Router<Route>, fallback: &Fallback, post: &[Middleware]) {
        let Some(method) = Method::from_http(self.request.method()) else {
            self.handler = Some(Arc::clone(fallback.method_not_allowed.chained(post)));
            return;
        };
        let found = router.find(method, self.request.uri.path(), &mut self.pvalues);
        let route = match found.handler {
            Lookup::Matched(route) => route,
            Lookup::MethodNotAllowed => &fallback.method_not_allowed,
            Lookup::NotFound => &fallback.not_found,
        };
        self.handler = Some(Arc::clone(route.chained(post)));
        self.path = found.path;
        self.pnames = found.pnames;
    }

    pub fn handler(&self) -> Option<&BoxedHandler> {
        self.handler.as_ref()
    }

    // ── Path parameters ──────────────────────────────────────────────────────

    /// Value of the named path parameter; `""` when the route has no such name.
    pub fn param(&self, name: &str) -> &str {
        self.pnames
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.pvalues.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn param_names(&self) -> &[String] { &self.pnames }

    /// Captured values in registration order.
    pub fn param_values(&self) -> &[String] {
        let n = self.pnames.len().min(self.pvalues.len());
        &self.pvalues[..n]
    }

    pub fn set_param_names(&mut self, names: Vec<String>) {
        if self.pvalues.len() < names.len() {
            self.pvalues.resize_with(names.len(), String::new);
        }
        self.pnames = Arc::from(names);
    }

    /// Overwrites captured values; extra values past the buffer are ignored.
    pub fn set_param_values(&mut self, values: &[&str]) {
        for (slot, v) in self.pvalues.iter_mut().zip(values) {
            slot.clear();
            slot.push_str(v);
        }
    }

    // ── Query ────────────────────────────────────────────────────────────────

    pub fn query_string(&self) -> &str {
        self.request.query().unwrap_or("")
    }

    /// Parsed query, computed on first use.
    pub fn query_params(&mut self) -> &HashMap<String, Vec<String>> {
        let raw = self.request.query().unwrap_or("");
        self.query.get_or_insert_with(|| parse_pairs(raw.as_bytes()))
    }

    pub fn query_param(&mut self, name: &str) -> Option<&str> {
        self.query_params().get(name).and_then(|v| v.first()).map(String::as_str)
    }

    // ── Form ─────────────────────────────────────────────────────────────────

    /// True for `application/x-www-form-urlencoded` and `multipart/form-data`.
    pub fn is_form(&self) -> bool {
        let ct = self.request.header("content-type").unwrap_or("");
        ct.starts_with("application/x-www-form-urlencoded") || ct.starts_with("multipart/form-data")
    }

    /// Parses the form body once; later calls reuse the result.
    pub async fn form(&mut self) -> Result<&Form> {
        if self.form.is_none() {
            let form = Form::parse(&self.request).await?;
            self.form = Some(form);
        }
        Ok(self.form.get_or_insert_with(Form::default))
    }

    pub async fn form_params(&mut self) -> Result<&HashMap<String, Vec<String>>> {
        Ok(&self.form().await?.values)
    }

    pub async fn form_value(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.form().await?.value(name).map(str::to_owned))
    }

    pub async fn form_file(&mut self, name: &str) -> Result<Option<FormFile>> {
        Ok(self.form().await?.file(name).cloned())
    }

    // ── Headers, cookies, peer ───────────────────────────────────────────────

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        parse_cookies(self.request.header("cookie").unwrap_or(""))
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies().remove(name)
    }

    pub fn set_cookie(&mut self, cookie: &Cookie) {
        self.response.append_header("set-cookie", &cookie.to_string());
    }

    pub fn is_websocket(&self) -> bool {
        self.request
            .header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// `https` or `http`, honouring the usual proxy headers.
    pub fn scheme(&self) -> &str {
        if self.request.uri().scheme_str() == Some("https") {
            return "https";
        }
        if let Some(proto) = self.header("x-forwarded-proto").or_else(|| self.header("x-forwarded-protocol")) {
            return if proto.eq_ignore_ascii_case("https") { "https" } else { "http" };
        }
        if self.header("x-forwarded-ssl").is_some_and(|v| v.eq_ignore_ascii_case("on")) {
            return "https";
        }
        if let Some(scheme) = self.header("x-url-scheme") {
            return if scheme.eq_ignore_ascii_case("https") { "https" } else { "http" };
        }
        "http"
    }

    /// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
    pub fn real_ip(&self) -> Option<String> {
        if let Some(xff) = self.header("x-forwarded-for") {
            if let Some(first) = xff.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return Some(first.to_owned());
            }
        }
        if let Some(ip) = self.header("x-real-ip") {
            return Some(ip.trim().to_owned());
        }
        self.request.remote_addr().map(|a| a.ip()).map(|ip: IpAddr| ip.to_string())
    }

    // ── Store ────────────────────────────────────────────────────────────────

    /// Stores a value for the rest of this request.
    pub fn with_value(&self, key: impl Into<String>, value: impl std::any::Any + Send + Sync) {
        self.store.write().insert(key.into(), Arc::new(value));
    }

    /// Looks the key up in the context store, then in the request's values.
    pub fn value(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.store.read().get(key) {
            return Some(Arc::clone(v));
        }
        self.request.value(key).cloned()
    }

    /// Typed convenience over [`value`](Self::value).
    pub fn value_as<T: std::any::Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.value(key).and_then(|v| v.downcast::<T>().ok())
    }

    // ── Responses ────────────────────────────────────────────────────────────

    /// Writes `body` with the given status and content type.
    pub fn blob(&mut self, code: u16, content_type: &str, body: &[u8]) -> Result<()> {
        self.response.set_content_type(content_type);
        self.response.write_header(code);
        self.response.write(body);
        Ok(())
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, code: u16, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.blob(code, ContentType::Json.as_str(), &body)
    }

    pub fn json_pretty<T: Serialize + ?Sized>(&mut self, code: u16, value: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        self.blob(code, ContentType::Json.as_str(), &body)
    }

    pub fn string(&mut self, code: u16, body: &str) -> Result<()> {
        self.blob(code, ContentType::Text.as_str(), body.as_bytes())
    }

    pub fn html(&mut self, code: u16, body: &str) -> Result<()> {
        self.blob(code, ContentType::Html.as_str(), body.as_bytes())
    }

    /// Copies `reader` into the response until EOF.
    pub async fn stream<R>(&mut self, code: u16, content_type: &str, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.response.set_content_type(content_type);
        self.response.write_header(code);
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.response.write(&buf[..n]);
        }
    }

    /// Serves a regular file, or `index.html` when `file` is a directory.
    pub async fn file(&mut self, file: impl AsRef<Path>) -> Result<()> {
        let mut path: PathBuf = file.as_ref().to_path_buf();
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => return Err(HttpError::not_found().into()),
        };
        if meta.is_dir() {
            let index = self.server.as_ref().map(|s| s.index_file().to_owned());
            path.push(index.as_deref().unwrap_or("index.html"));
            match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => {}
                _ => return Err(HttpError::not_found().into()),
            }
        }
        let body = tokio::fs::read(&path).await?;
        if self.response.headers().get("content-type").is_none() {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            self.response.set_content_type(ContentType::from_extension(ext).as_str());
        }
        self.response.write_header(200);
        if self.request.method() != http::Method::HEAD {
            self.response.write(&body);
        }
        Ok(())
    }

    /// Serves `file` as a download named `name`.
    pub async fn attachment(&mut self, file: impl AsRef<Path>, name: &str) -> Result<()> {
        self.content_disposition(file, name, "attachment").await
    }

    /// Serves `file` for in-browser display under `name`.
    pub async fn inline(&mut self, file: impl AsRef<Path>, name: &str) -> Result<()> {
        self.content_disposition(file, name, "inline").await
    }

    async fn content_disposition(&mut self, file: impl AsRef<Path>, name: &str, kind: &str) -> Result<()> {
        let value = format!("{kind}; filename=\"{}\"", name.replace('"', "\\\""));
        self.response.set_header("content-disposition", &value);
        self.file(file).await
    }

    /// Redirects with a `3xx` status; other codes are refused without writing.
    pub fn redirect(&mut self, code: u16, url: &str) -> Result<()> {
        if !(300..=308).contains(&code) {
            return Err(Error::InvalidRedirectCode(code));
        }
        self.response.set_header("location", url);
        self.response.write_header(code);
        Ok(())
    }

    /// Writes only the status.
    pub fn no_content(&mut self, code: u16) -> Result<()> {
        self.response.write_header(code);
        Ok(())
    }

    /// Sends `data` through the server's OK handler (`{errno: 0, data}` by default).
    pub fn ok<T: Serialize + ?Sized>(&mut self, data: &T) -> Result<()> {
        let data = serde_json::to_value(data)?;
        match self.server.clone() {
            Some(server) => server.handle_ok(data, self),
            None => server::default_ok_handler(data, self),
        }
    }

    /// Sends `err` through the server's error handler.
    pub fn error(&mut self, err: Error) {
        match self.server.clone() {
            Some(server) => server.handle_error(err, self),
            None => server::default_error_handler(err, false, self),
        }
    }

    pub fn body(&self) -> &Bytes {
        self.request.body()
    }
}

// ── Cookies ──────────────────────────────────────────────────────────────────

/// A `Set-Cookie` value.
#[derive(Clone, Debug, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(p) = &self.path {
            let _ = write!(out, "; Path={p}");
        }
        if let Some(d) = &self.domain {
            let _ = write!(out, "; Domain={d}");
        }
        if let Some(age) = self.max_age {
            let _ = write!(out, "; Max-Age={age}");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        f.write_str(&out)
    }
}

pub(crate) fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let value = parts.next().unwrap_or("").trim().trim_matches('"');
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}

pub(crate) fn parse_pairs(raw: &[u8]) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in url::form_urlencoded::parse(raw) {
        out.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    out
}
