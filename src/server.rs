//! Server: registration, the middleware pipeline and the listener.
//!
//! # Request pipeline
//!
//! ```text
//! pre_1(… pre_n( route-find → post_1(… post_m( route_mw( handler )) …)) …)
//! ```
//!
//! Pre-middleware runs before the router is consulted, so it may rewrite the
//! request path. Post-middleware (`use_`) wraps only the resolved handler.
//! Whatever error escapes the chain, or whatever panic unwinds out of it, is
//! rendered once by the error handler before the context goes back to the
//! pool.
//!
//! # Lifecycle
//!
//! Register routes on a `Server`, wrap it in an `Arc`, then call
//! [`Server::start`] (binds from the config, stops on SIGTERM / Ctrl-C) or
//! [`Server::serve`] with a listener of your own. [`Server::shutdown`] stops
//! accepting and drains in-flight connections; [`Server::close`] aborts them.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::{Config, ListenerNetwork};
use crate::context::Context;
use crate::controller::{self, Controller};
use crate::error::{Error, HttpError, Result};
use crate::events::{Registry, Subject};
use crate::group::Group;
use crate::handler::{BoxedHandler, Handler, HandlerFuture, Middleware, StatusHandler, boxed, compose};
use crate::logger::{Logger, TracingLogger};
use crate::method::Method;
use crate::request::Request;
use crate::router::Router;

/// Renders an error escaping the chain.
pub type ErrorHandler = Arc<dyn Fn(Error, &mut Context) + Send + Sync>;

/// Renders a successful payload (`Context::ok`, controller return values).
pub type OkHandler = Arc<dyn Fn(serde_json::Value, &mut Context) -> Result<()> + Send + Sync>;

/// A registered handler and, once first served, the same handler wrapped
/// in the post-routing middleware.
pub(crate) struct Route {
    handler: BoxedHandler,
    chained: OnceLock<BoxedHandler>,
}

impl Route {
    fn new(handler: BoxedHandler) -> Self {
        Self { handler, chained: OnceLock::new() }
    }

    pub(crate) fn chained(&self, post: &[Middleware]) -> &BoxedHandler {
        self.chained.get_or_init(|| compose(Arc::clone(&self.handler), post))
    }
}

/// Handlers used when routing fails.
pub(crate) struct Fallback {
    pub(crate) not_found: Route,
    pub(crate) method_not_allowed: Route,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stop {
    Running,
    Graceful,
    Immediate,
}

/// The HTTP server.
pub struct Server {
    router: Router<Route>,
    pre: Vec<Middleware>,
    post: Vec<Middleware>,
    chain: OnceLock<BoxedHandler>,
    fallback: Fallback,
    pool: Mutex<Vec<Box<Context>>>,
    error_handler: Option<ErrorHandler>,
    ok_handler: Option<OkHandler>,
    logger: Arc<dyn Logger>,
    config: Config,
    events: Registry,
    stop: watch::Sender<Stop>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let (stop, _) = watch::channel(Stop::Running);
        Self {
            router: Router::new(),
            pre: Vec::new(),
            post: Vec::new(),
            chain: OnceLock::new(),
            fallback: Fallback {
                not_found: Route::new(boxed(StatusHandler(404))),
                method_not_allowed: Route::new(boxed(StatusHandler(405))),
            },
            pool: Mutex::new(Vec::new()),
            error_handler: None,
            ok_handler: None,
            logger: Arc::new(TracingLogger),
            config,
            events: Registry::default(),
            stop,
        }
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &Config { &self.config }
    pub fn debug(&self) -> bool { self.config.debug }
    pub fn set_debug(&mut self, debug: bool) { self.config.debug = debug; }
    pub fn logger(&self) -> Arc<dyn Logger> { Arc::clone(&self.logger) }
    pub fn set_logger(&mut self, logger: impl Logger) { self.logger = Arc::new(logger); }
    pub fn max_param(&self) -> usize { self.router.max_param() }
    pub(crate) fn index_file(&self) -> &str { &self.config.index_file }

    pub fn set_error_handler(&mut self, f: impl Fn(Error, &mut Context) + Send + Sync + 'static) {
        self.error_handler = Some(Arc::new(f));
    }

    pub fn set_ok_handler(
        &mut self,
        f: impl Fn(serde_json::Value, &mut Context) -> Result<()> + Send + Sync + 'static,
    ) {
        self.ok_handler = Some(Arc::new(f));
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Middleware run before routing.
    pub fn pre(&mut self, mw: Middleware) -> &mut Self {
        self.pre.push(mw);
        self
    }

    /// Middleware run after routing, around the matched handler.
    pub fn use_(&mut self, mw: Middleware) -> &mut Self {
        self.post.push(mw);
        self
    }

    /// Registers `handler` for `method` + `path`, wrapped in route-level
    /// middleware (first one outermost).
    pub fn add(&mut self, method: Method, path: &str, handler: impl Handler, mw: &[Middleware]) -> &mut Self {
        self.add_boxed(method, path, compose(boxed(handler), mw));
        self
    }

    pub(crate) fn add_boxed(&mut self, method: Method, path: &str, handler: BoxedHandler) {
        self.router.add(method, path, Route::new(handler));
    }

    pub fn connect(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Connect, path, h, &[]) }
    pub fn delete(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Delete, path, h, &[]) }
    pub fn get(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Get, path, h, &[]) }
    pub fn head(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Head, path, h, &[]) }
    pub fn options(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Options, path, h, &[]) }
    pub fn patch(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Patch, path, h, &[]) }
    pub fn post(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Post, path, h, &[]) }
    pub fn put(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Put, path, h, &[]) }
    pub fn trace(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Trace, path, h, &[]) }
    pub fn propfind(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Propfind, path, h, &[]) }
    pub fn report(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Report, path, h, &[]) }

    /// Registers a route reachable only through WebSocket envelopes.
    pub fn websocket(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::WebSocket, path, h, &[]) }

    /// Registers a route reachable only through in-process call envelopes.
    pub fn call(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Call, path, h, &[]) }

    /// Registers `h` for every standard method.
    pub fn any(&mut self, path: &str, h: impl Handler) -> &mut Self {
        self.match_methods(&Method::STANDARD, path, h)
    }

    pub fn match_methods(&mut self, methods: &[Method], path: &str, h: impl Handler) -> &mut Self {
        let h = boxed(h);
        for &m in methods {
            self.add_boxed(m, path, Arc::clone(&h));
        }
        self
    }

    /// A prefixed sub-router sharing `mw`.
    pub fn group(&mut self, prefix: &str, mw: &[Middleware]) -> Group<'_> {
        Group::new(self, prefix, mw.to_vec())
    }

    /// Serves files below `root` under `prefix/*`.
    pub fn static_dir(&mut self, prefix: &str, root: impl Into<PathBuf>) -> &mut Self {
        let path = format!("{}/*", prefix.trim_end_matches('/'));
        let h = StaticDir { root: root.into() };
        self.add(Method::Get, &path, h, &[]);
        self
    }

    /// Registers every method of controller `T` as `prefix/<snake_name>`.
    pub fn controller<T: Controller>(&mut self, method: Method, prefix: &str) -> &mut Self {
        let prefix = prefix.trim_end_matches('/');
        for name in controller::names::<T>() {
            let path = format!("{prefix}/{name}");
            self.add(method, &path, controller::handler_named::<T>(&name), &[]);
        }
        self
    }

    /// Every registered `(method, pattern)` pair.
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.router.routes()
    }

    /// The event subject registered for `method` + `path`, if a connection
    /// has ever joined it.
    pub fn subject(&self, method: Method, path: &str) -> Option<Arc<Subject>> {
        self.events.get(method, path)
    }

    pub(crate) fn events(&self) -> &Registry {
        &self.events
    }

    // ── Serving ──────────────────────────────────────────────────────────────

    fn chain(&self) -> &BoxedHandler {
        self.chain.get_or_init(|| compose(boxed(Dispatch), &self.pre))
    }

    fn acquire(&self) -> Box<Context> {
        self.pool
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(Context::with_params(Request::default(), self.max_param())))
    }

    fn release(&self, mut c: Box<Context>) {
        c.clean();
        self.pool.lock().push(c);
    }

    /// Runs one request through the pipeline and returns the buffered response.
    ///
    /// This is the single entry point for every transport: hyper connections,
    /// WebSocket envelopes and in-process calls.
    pub async fn serve_http(self: &Arc<Self>, req: Request) -> http::Response<Bytes> {
        let mut c = self.acquire();
        c.reset(req, Arc::clone(self));

        let outcome = AssertUnwindSafe(self.chain().call(&mut *c)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.handle_error(err, &mut *c),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                self.logger.printf(format_args!("[PANIC RECOVER] {msg}"));
                c.response_mut().reset(self.logger());
                let err = HttpError::internal_server_error().with_internal(Error::msg(msg));
                self.handle_error(err.into(), &mut *c);
            }
        }

        let res = c.response_mut().take_http();
        self.release(c);
        res
    }

    pub(crate) fn handle_error(&self, err: Error, c: &mut Context) {
        match &self.error_handler {
            Some(h) => h(err, c),
            None => default_error_handler(err, self.config.debug, c),
        }
    }

    pub(crate) fn handle_ok(&self, data: serde_json::Value, c: &mut Context) -> Result<()> {
        match &self.ok_handler {
            Some(h) => h(data, c),
            None => default_ok_handler(data, c),
        }
    }

    async fn handle_hyper(
        self: Arc<Self>,
        req: hyper::Request<hyper::body::Incoming>,
        remote: Option<SocketAddr>,
    ) -> http::Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.config.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let he = if e.downcast_ref::<LengthLimitError>().is_some() {
                    HttpError::payload_too_large()
                } else {
                    debug!(error = %e, "failed to read request body");
                    HttpError::bad_request()
                };
                let req = Request::from_parts(parts, Bytes::new(), remote);
                return self.reject(req, Error::from(he.with_internal(Error::Other(e)))).map(Full::new);
            }
        };
        let res = self.serve_http(Request::from_parts(parts, body, remote)).await;
        res.map(Full::new)
    }

    /// Answers `req` with `err` through the error handler, skipping routing.
    fn reject(self: &Arc<Self>, req: Request, err: Error) -> http::Response<Bytes> {
        let mut c = self.acquire();
        c.reset(req, Arc::clone(self));
        self.handle_error(err, &mut *c);
        let res = c.response_mut().take_http();
        self.release(c);
        res
    }

    // ── Listener ─────────────────────────────────────────────────────────────

    /// Binds from the config and serves until SIGTERM / Ctrl-C or
    /// [`shutdown`](Self::shutdown).
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = Listener::bind(self.config.listener_network, &self.config.address).await?;
        let server = Arc::clone(&self);
        tokio::spawn(async move {
            shutdown_signal().await;
            server.shutdown();
        });
        self.serve(listener).await
    }

    /// Stops accepting and waits for in-flight connections.
    pub fn shutdown(&self) {
        self.stop.send_replace(Stop::Graceful);
    }

    /// Stops accepting and aborts in-flight connections.
    pub fn close(&self) {
        self.stop.send_replace(Stop::Immediate);
    }

    /// Resolves once `shutdown` or `close` has been requested.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        loop {
            if *rx.borrow_and_update() != Stop::Running {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Accepts connections from `listener` until stopped.
    pub async fn serve(self: Arc<Self>, listener: Listener) -> Result<()> {
        self.stop.send_replace(Stop::Running);
        let mut stop = self.stop.subscribe();
        info!(addr = %listener.describe(), debug = self.config.debug, "hornet listening");

        let mut tasks = tokio::task::JoinSet::new();
        let mode = loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    let mode = if changed.is_ok() { *stop.borrow() } else { Stop::Graceful };
                    if mode != Stop::Running {
                        break mode;
                    }
                }

                res = listener.accept() => {
                    match res {
                        Ok((io, remote)) => {
                            let server = Arc::clone(&self);
                            tasks.spawn(serve_connection(server, io, remote));
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        match mode {
            Stop::Immediate => {
                info!(in_flight = tasks.len(), "closing, aborting connections");
                tasks.abort_all();
            }
            _ => info!(in_flight = tasks.len(), "shutting down, draining connections"),
        }
        while tasks.join_next().await.is_some() {}

        info!("hornet stopped");
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Router step of the pipeline: resolve, then run post-middleware and the handler.
struct Dispatch;

impl Handler for Dispatch {
    fn call<'a>(&'a self, c: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let Some(server) = c.server().cloned() else {
                return Err(HttpError::internal_server_error().into());
            };
            c.route(&server.router, &server.fallback, &server.post);
            let Some(h) = c.handler.clone() else {
                return Err(HttpError::not_found().into());
            };
            h.call(c).await
        })
    }
}

struct StaticDir {
    root: PathBuf,
}

impl Handler for StaticDir {
    fn call<'a>(&'a self, c: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let rel = Path::new(c.param("*"));
            if rel.components().any(|p| !matches!(p, Component::Normal(_) | Component::CurDir)) {
                return Err(HttpError::not_found().into());
            }
            let path = self.root.join(rel);
            c.file(path).await
        })
    }
}

/// Serves one connection. Once the server stops, keep-alive connections are
/// told to finish their current request and close.
async fn serve_connection<IO>(server: Arc<Server>, io: IO, remote: Option<SocketAddr>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stopping = Arc::clone(&server);
    let svc = service_fn(move |req| {
        let server = Arc::clone(&server);
        async move { Ok::<_, Infallible>(server.handle_hyper(req, remote).await) }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), svc);
    tokio::pin!(conn);
    let stopped = stopping.stopped();
    tokio::pin!(stopped);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = &mut stopped => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        match remote {
            Some(peer) => error!(peer = %peer, "connection error: {e}"),
            None => error!("connection error: {e}"),
        }
    }
}

// ── Default handlers ─────────────────────────────────────────────────────────

/// `{code, [errno], message}`, plus `error` in debug mode. `HEAD` gets the
/// status only. Opaque errors are reported as 500.
pub fn default_error_handler(err: Error, debug: bool, c: &mut Context) {
    let (he, cause) = match err {
        Error::Http(he) => {
            let mut he = he.unwrap_internal();
            let cause = he.internal.take();
            (he, cause.map(|e| e.to_string()))
        }
        other => (HttpError::internal_server_error(), Some(other.to_string())),
    };

    if c.response().committed() {
        return;
    }

    let result = if c.request().method() == http::Method::HEAD {
        c.no_content(he.code)
    } else {
        let mut body = serde_json::to_value(&he).unwrap_or_default();
        if debug {
            let detail = cause.unwrap_or_else(|| he.message.clone());
            if let serde_json::Value::Object(map) = &mut body {
                map.insert("error".to_owned(), serde_json::Value::String(detail));
            }
        }
        c.json(he.code, &body)
    };
    if let Err(e) = result {
        error!("error handler failed: {e}");
    }
}

/// `{errno: 0, data}` with status 200.
pub fn default_ok_handler(data: serde_json::Value, c: &mut Context) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Ok {
        errno: i64,
        data: serde_json::Value,
    }
    c.json(200, &Ok { errno: 0, data })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

// ── Listener ─────────────────────────────────────────────────────────────────

/// A bound socket the server accepts from.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

type Accepted = (Box<dyn Io>, Option<SocketAddr>);

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

impl Listener {
    /// Binds `address` on the given network. `tcp4` / `tcp6` only accept
    /// addresses of that family.
    pub async fn bind(network: ListenerNetwork, address: &str) -> Result<Self> {
        match network {
            ListenerNetwork::Tcp => Ok(Self::Tcp(TcpListener::bind(address).await?)),
            ListenerNetwork::Tcp4 | ListenerNetwork::Tcp6 => {
                let want_v4 = network == ListenerNetwork::Tcp4;
                let addr = tokio::net::lookup_host(address)
                    .await?
                    .find(|a| a.is_ipv4() == want_v4)
                    .ok_or_else(|| Error::InvalidNetwork(format!("{network:?} cannot bind {address}")))?;
                Ok(Self::Tcp(TcpListener::bind(addr).await?))
            }
            #[cfg(unix)]
            ListenerNetwork::Unix => {
                let path = PathBuf::from(address);
                Ok(Self::Unix(tokio::net::UnixListener::bind(&path)?, path))
            }
            #[cfg(not(unix))]
            ListenerNetwork::Unix => Err(Error::InvalidNetwork("unix".to_owned())),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix(..) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Tcp(l) => l.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            #[cfg(unix)]
            Self::Unix(_, path) => format!("unix:{}", path.display()),
        }
    }

    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Box::new(stream), Some(peer)))
            }
            #[cfg(unix)]
            Self::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                Ok((Box::new(stream), None))
            }
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Self {
        Self::Tcp(l)
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or Ctrl-C. A signal that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
