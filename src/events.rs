//! Event multiplexer: many logical request/response exchanges over one
//! persistent transport.
//!
//! Each inbound [`Envelope`] is lifted into a synthetic request with the
//! sentinel method `WEBSOCKET` or `CALL` and fed through
//! [`Server::serve_http`], so envelope routes are registered like any other:
//!
//! ```rust,ignore
//! server.get("/ws", events::upgrade);            // the transport endpoint
//! server.websocket("/api/ping", ping);           // an envelope route
//! ```
//!
//! Envelopes from one connection are served one at a time, and each reply is
//! queued before the next envelope is read, so replies leave in request order.
//! Connections join a [`Subject`] keyed by `(method, endpoint path)`; a
//! subject can push one envelope to every live connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, HttpError, Result};
use crate::handler::HandlerFuture;
use crate::method::Method;
use crate::request::Request;
use crate::server::Server;

/// Header carrying the caller-chosen connection id.
pub const CONNECTION_ID: &str = "x-connection-id";

// ── Envelope ─────────────────────────────────────────────────────────────────

/// One framed message: `{rid, uri, header, body}`.
///
/// `body` is kept as raw JSON and handed to the handler untouched.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(default)]
    pub rid: u64,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Box<RawValue>>,
}

impl Envelope {
    /// A push envelope (rid `0`) carrying `body` serialised as JSON.
    pub fn push<T: Serialize + ?Sized>(uri: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self {
            rid: 0,
            uri: uri.into(),
            header: HashMap::new(),
            body: Some(serde_json::value::to_raw_value(body)?),
        })
    }

    /// Decodes `body` into `T`; a missing body decodes from `null`.
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let raw = self.body.as_deref().map_or("null", RawValue::get);
        Ok(serde_json::from_str(raw)?)
    }

    /// Builds the synthetic request served for this envelope.
    fn to_request(&self, method: Method, conn: &str) -> Result<Request> {
        if self.uri.is_empty() || self.uri.parse::<http::Uri>().is_err() {
            return Err(HttpError::new(400, format!("invalid uri `{}`", self.uri)).into());
        }
        let m = http::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| HttpError::internal_server_error().with_internal(Error::msg(e.to_string())))?;

        let mut req = Request::new(m, &self.uri);
        for (k, v) in &self.header {
            req = req.with_header(k, v);
        }
        let headers = req.headers_mut();
        headers.remove("x-request-id");
        headers.remove("content-type");
        headers.remove(CONNECTION_ID);
        let body = self.body.as_deref().map(|b| Bytes::copy_from_slice(b.get().as_bytes()));
        Ok(req
            .with_header("x-request-id", &self.rid.to_string())
            .with_header("content-type", "application/json")
            .with_header(CONNECTION_ID, conn)
            .with_body(body.unwrap_or_default()))
    }

    fn reply(rid: u64, uri: String, res: http::Response<Bytes>) -> Self {
        let (parts, body) = res.into_parts();
        let header = parts
            .headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
            .collect();
        Self { rid, uri, header, body: raw_body(&body) }
    }

    fn failure(rid: u64, uri: String, err: &HttpError) -> Self {
        Self {
            rid,
            uri,
            header: HashMap::from([("content-type".to_owned(), "application/json".to_owned())]),
            body: serde_json::value::to_raw_value(err).ok(),
        }
    }
}

/// JSON bodies pass through; other text becomes a JSON string, binary a
/// base64 string.
fn raw_body(body: &[u8]) -> Option<Box<RawValue>> {
    if body.is_empty() {
        return None;
    }
    match std::str::from_utf8(body) {
        Ok(s) => RawValue::from_string(s.to_owned())
            .ok()
            .or_else(|| serde_json::value::to_raw_value(s).ok()),
        Err(_) => serde_json::value::to_raw_value(&STANDARD.encode(body)).ok(),
    }
}

// ── Subjects ─────────────────────────────────────────────────────────────────

struct Peer {
    tx: mpsc::UnboundedSender<Envelope>,
    close: watch::Sender<bool>,
}

/// Every live connection that joined one `(method, path)` endpoint.
pub struct Subject {
    method: Method,
    path: String,
    peers: RwLock<HashMap<String, Peer>>,
}

impl Subject {
    fn new(method: Method, path: &str) -> Self {
        Self { method, path: path.to_owned(), peers: RwLock::new(HashMap::new()) }
    }

    pub fn method(&self) -> Method { self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn len(&self) -> usize { self.peers.read().len() }
    pub fn is_empty(&self) -> bool { self.peers.read().is_empty() }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Ids of the live connections.
    pub fn connections(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    /// Queues `env` on every live connection. Peers that went away are
    /// reported together; the rest still receive the envelope.
    pub fn broadcast(&self, env: &Envelope) -> Result<()> {
        let peers: Vec<(String, mpsc::UnboundedSender<Envelope>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, p)| (id.clone(), p.tx.clone()))
            .collect();

        let failed: Vec<(String, Error)> = peers
            .into_iter()
            .filter_map(|(id, tx)| tx.send(env.clone()).err().map(|_| (id, Error::Closed)))
            .collect();
        if failed.is_empty() { Ok(()) } else { Err(Error::Broadcast(failed)) }
    }

    /// Queues `env` on one connection.
    pub fn send_to(&self, id: &str, env: Envelope) -> Result<()> {
        let tx = self.peers.read().get(id).map(|p| p.tx.clone()).ok_or(Error::Closed)?;
        tx.send(env).map_err(|_| Error::Closed)
    }

    /// Asks a connection's serving loop to stop. Returns `false` for unknown ids.
    pub fn disconnect(&self, id: &str) -> bool {
        match self.peers.write().remove(id) {
            Some(peer) => {
                peer.close.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn join(&self, id: &str, peer: Peer) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(id) {
            return Err(Error::DuplicateConnection(id.to_owned()));
        }
        peers.insert(id.to_owned(), peer);
        Ok(())
    }

    fn leave(&self, id: &str) {
        self.peers.write().remove(id);
    }
}

/// The server's subject table.
#[derive(Default)]
pub(crate) struct Registry {
    subjects: RwLock<HashMap<(Method, String), Arc<Subject>>>,
}

impl Registry {
    pub(crate) fn get(&self, method: Method, path: &str) -> Option<Arc<Subject>> {
        self.subjects.read().get(&(method, path.to_owned())).cloned()
    }

    pub(crate) fn subject(&self, method: Method, path: &str) -> Arc<Subject> {
        if let Some(s) = self.get(method, path) {
            return s;
        }
        let mut subjects = self.subjects.write();
        Arc::clone(
            subjects
                .entry((method, path.to_owned()))
                .or_insert_with(|| Arc::new(Subject::new(method, path))),
        )
    }
}

/// Registers a new connection on `subject` and returns its outbound queue
/// and close signal.
fn attach(
    subject: &Subject,
    id: &str,
) -> Result<(mpsc::UnboundedSender<Envelope>, mpsc::UnboundedReceiver<Envelope>, watch::Receiver<bool>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (close, cancel) = watch::channel(false);
    subject.join(id, Peer { tx: tx.clone(), close })?;
    Ok((tx, rx, cancel))
}

// ── Serving loop ─────────────────────────────────────────────────────────────

type Socket = WebSocketStream<TokioIo<Upgraded>>;

enum Inbound {
    Socket(SplitStream<Socket>),
    Pipe(mpsc::UnboundedReceiver<Envelope>),
}

impl Inbound {
    /// Next envelope. `None` ends the connection; `Some(Err(Json))` is a bad
    /// frame the loop skips.
    async fn recv(&mut self) -> Option<Result<Envelope>> {
        match self {
            Self::Pipe(rx) => rx.recv().await.map(Ok),
            Self::Socket(stream) => loop {
                let msg = match stream.next().await? {
                    Ok(m) => m,
                    Err(e) => return Some(Err(e.into())),
                };
                let decoded = match &msg {
                    Message::Text(t) => serde_json::from_str(t.as_str()),
                    Message::Binary(b) => serde_json::from_slice(b),
                    Message::Close(_) => return None,
                    _ => continue,
                };
                return Some(decoded.map_err(Error::from));
            },
        }
    }
}

struct Connection {
    server: Arc<Server>,
    method: Method,
    subject: Arc<Subject>,
    id: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    cancel: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self, mut inbound: Inbound) {
        let server = Arc::clone(&self.server);
        let stopped = server.stopped();
        tokio::pin!(stopped);

        debug!(conn = %self.id, subject = %self.subject.path(), "event connection opened");
        loop {
            let next = tokio::select! {
                _ = self.cancel.changed() => break,
                () = &mut stopped => break,
                next = inbound.recv() => next,
            };
            match next {
                None => break,
                Some(Ok(env)) => {
                    if let Some(reply) = self.dispatch(env).await {
                        if self.outbound.send(reply).is_err() {
                            break;
                        }
                    }
                }
                Some(Err(Error::Json(e))) => warn!(conn = %self.id, "malformed envelope: {e}"),
                Some(Err(e)) => {
                    debug!(conn = %self.id, "transport error: {e}");
                    break;
                }
            }
        }
        self.subject.leave(&self.id);
        debug!(conn = %self.id, "event connection closed");
    }

    /// Serves one envelope. Envelopes without a rid cannot be answered and
    /// are dropped.
    async fn dispatch(&self, env: Envelope) -> Option<Envelope> {
        let Envelope { rid, uri, .. } = &env;
        if *rid == 0 {
            warn!(conn = %self.id, uri = %uri, "dropping envelope without rid");
            return None;
        }
        let req = match env.to_request(self.method, &self.id) {
            Ok(req) => req,
            Err(e) => {
                let he = match e {
                    Error::Http(he) => he,
                    other => HttpError::bad_request().with_internal(other),
                };
                return Some(Envelope::failure(*rid, uri.clone(), &he));
            }
        };
        let res = self.server.serve_http(req).await;
        Some(Envelope::reply(env.rid, env.uri, res))
    }
}

// ── WebSocket transport ──────────────────────────────────────────────────────

/// Upgrades the request to a WebSocket and serves envelopes on it until the
/// peer leaves, the connection is disconnected or the server stops.
///
/// The connection joins the subject `(WEBSOCKET, <matched route>)`; its id is
/// the `X-Connection-ID` request header or a fresh UUID.
pub fn upgrade<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Some(server) = c.server().cloned() else {
            return Err(HttpError::internal_server_error().into());
        };
        let key = match c.header("sec-websocket-key") {
            Some(key) if c.is_websocket() => derive_accept_key(key.as_bytes()),
            _ => return Err(HttpError::new(400, "websocket upgrade required").into()),
        };
        let Some(on_upgrade) = c.request_mut().extensions_mut().remove::<OnUpgrade>() else {
            return Err(HttpError::new(400, "connection cannot be upgraded").into());
        };

        let id = connection_id(c);
        let subject = server.events().subject(Method::WebSocket, c.path());
        let (outbound, rx, cancel) = attach(&subject, &id)
            .map_err(|e| HttpError::new(409, "connection id in use").with_internal(e))?;

        let res = c.response_mut();
        res.set_header("upgrade", "websocket");
        res.set_header("connection", "Upgrade");
        res.set_header("sec-websocket-accept", &key);
        res.write_header(101);

        let conn = Connection { server, method: Method::WebSocket, subject, id, outbound, cancel };
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    warn!(conn = %conn.id, "websocket upgrade failed: {e}");
                    conn.subject.leave(&conn.id);
                    return;
                }
            };
            let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            let (sink, stream) = ws.split();
            tokio::spawn(write_socket(sink, rx));
            conn.run(Inbound::Socket(stream)).await;
        });
        Ok(())
    })
}

async fn write_socket(
    mut sink: futures_util::stream::SplitSink<Socket, Message>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(env) = rx.recv().await {
        let text = match serde_json::to_string(&env) {
            Ok(t) => t,
            Err(e) => {
                warn!(rid = env.rid, "cannot encode envelope: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::text(text)).await {
            debug!("websocket write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

fn connection_id(c: &Context) -> String {
    c.header(CONNECTION_ID)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

// ── In-process transport ─────────────────────────────────────────────────────

/// Receives envelopes no pending [`CallClient::call`] is waiting for:
/// pushes, and replies to [`CallClient::send`].
pub type Callback = Arc<dyn Fn(Envelope) + Send + Sync>;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>;

/// An in-process connection to the server's `CALL` routes.
///
/// ```rust,ignore
/// server.call("/api/ping", ping);
/// let server = Arc::new(server);
/// let client = CallClient::connect(&server, "/internal")?;
/// let reply = client.call("/api/ping", HashMap::new(), None).await?;
/// ```
pub struct CallClient {
    id: String,
    subject: Arc<Subject>,
    inbound: mpsc::UnboundedSender<Envelope>,
    pending: Pending,
    next_rid: AtomicU64,
}

impl CallClient {
    /// Joins the `(CALL, subject)` subject under a fresh id, without a callback.
    pub fn connect(server: &Arc<Server>, subject: &str) -> Result<Self> {
        Self::connect_with(server, subject, None, None)
    }

    pub fn connect_with(
        server: &Arc<Server>,
        subject: &str,
        id: Option<String>,
        callback: Option<Callback>,
    ) -> Result<Self> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let subject = server.events().subject(Method::Call, subject);
        let (outbound, rx, cancel) = attach(&subject, &id)?;
        let (inbound, requests) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();

        tokio::spawn(route_replies(rx, Arc::clone(&pending), callback));
        let conn = Connection {
            server: Arc::clone(server),
            method: Method::Call,
            subject: Arc::clone(&subject),
            id: id.clone(),
            outbound,
            cancel,
        };
        tokio::spawn(conn.run(Inbound::Pipe(requests)));

        Ok(Self { id, subject, inbound, pending, next_rid: AtomicU64::new(1) })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends a request envelope and waits for its reply.
    pub async fn call(
        &self,
        uri: &str,
        header: HashMap<String, String>,
        body: Option<Box<RawValue>>,
    ) -> Result<Envelope> {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(rid, tx);
        let env = Envelope { rid, uri: uri.to_owned(), header, body };
        if self.inbound.send(env).is_err() {
            self.pending.lock().remove(&rid);
            return Err(Error::Closed);
        }
        rx.await.map_err(|_| Error::Closed)
    }

    /// Sends a request envelope without waiting; its reply goes to the
    /// callback. Returns the assigned rid.
    pub fn send(&self, uri: &str, header: HashMap<String, String>, body: Option<Box<RawValue>>) -> Result<u64> {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        let env = Envelope { rid, uri: uri.to_owned(), header, body };
        self.inbound.send(env).map_err(|_| Error::Closed)?;
        Ok(rid)
    }

    /// Leaves the subject and stops the serving loop.
    pub fn close(&self) {
        self.subject.disconnect(&self.id);
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn route_replies(mut rx: mpsc::UnboundedReceiver<Envelope>, pending: Pending, callback: Option<Callback>) {
    while let Some(env) = rx.recv().await {
        let waiter = if env.rid != 0 { pending.lock().remove(&env.rid) } else { None };
        match (waiter, &callback) {
            (Some(tx), _) => {
                let _ = tx.send(env);
            }
            (None, Some(cb)) => cb(env),
            (None, None) => debug!(rid = env.rid, "no receiver for envelope"),
        }
    }
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_frames() {
        let a: Envelope = serde_json::from_str(r#"{"rid":1,"uri":"/api/ping","header":{},"body":null}"#).unwrap();
        let b: Envelope = serde_json::from_str(r#"{"rid":2,"uri":"/api/ping","body":null}"#).unwrap();
        assert_eq!((a.rid, a.uri.as_str()), (1, "/api/ping"));
        assert!(a.body.is_none() && b.body.is_none());
        assert!(b.header.is_empty());
    }

    #[test]
    fn synthetic_request_carries_envelope() {
        let env: Envelope = serde_json::from_str(
            r#"{"rid":9,"uri":"/api/echo?x=1","header":{"authorization":"t","x-request-id":"spoof"},"body":{"a":1}}"#,
        )
        .unwrap();
        let req = env.to_request(Method::WebSocket, "conn-1").unwrap();
        assert_eq!(req.method().as_str(), "WEBSOCKET");
        assert_eq!(req.path(), "/api/echo");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.header("x-request-id"), Some("9"));
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("authorization"), Some("t"));
        assert_eq!(req.header(CONNECTION_ID), Some("conn-1"));
        assert_eq!(&req.body()[..], br#"{"a":1}"#);
    }

    #[test]
    fn rejects_missing_uri() {
        let env = Envelope { rid: 3, ..Envelope::default() };
        match env.to_request(Method::Call, "c") {
            Err(err) => assert_eq!(err.as_http().map(|h| h.code), Some(400)),
            Ok(_) => panic!("an envelope without uri must not become a request"),
        }
    }

    fn pong<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move { c.string(200, "pong") })
    }

    #[tokio::test]
    async fn envelopes_without_rid_are_not_served() {
        let mut server = Server::new();
        server.call("/api/ping", pong);
        let server = Arc::new(server);
        let subject = server.events().subject(Method::Call, "/c");
        let (outbound, _rx, cancel) = attach(&subject, "a").unwrap();
        let conn = Connection { server: Arc::clone(&server), method: Method::Call, subject, id: "a".into(), outbound, cancel };

        let env: Envelope = serde_json::from_str(r#"{"uri":"/api/ping"}"#).unwrap();
        assert!(conn.dispatch(env).await.is_none());

        let env: Envelope = serde_json::from_str(r#"{"rid":4,"uri":"/api/ping"}"#).unwrap();
        let reply = conn.dispatch(env).await.unwrap();
        assert_eq!(reply.rid, 4);
        assert_eq!(reply.body_as::<String>().unwrap(), "pong");
    }

    #[test]
    fn reply_bodies_stay_json() {
        assert_eq!(raw_body(br#"{"ok":true}"#).unwrap().get(), r#"{"ok":true}"#);
        assert_eq!(raw_body(b"pong").unwrap().get(), r#""pong""#);
        assert_eq!(raw_body(&[0xff, 0x00]).unwrap().get(), r#""/wA=""#);
        assert!(raw_body(b"").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let subject = Subject::new(Method::WebSocket, "/ws");
        let _first = attach(&subject, "a").unwrap();
        assert!(matches!(attach(&subject, "a"), Err(Error::DuplicateConnection(id)) if id == "a"));
        assert_eq!(subject.len(), 1);
    }

    #[test]
    fn broadcast_reaches_live_peers_and_reports_gone_ones() {
        let subject = Subject::new(Method::WebSocket, "/ws");
        let (_tx_a, mut rx_a, _cancel_a) = attach(&subject, "a").unwrap();
        let (_tx_b, rx_b, _cancel_b) = attach(&subject, "b").unwrap();
        drop(rx_b);

        let env = Envelope::push("/news", &serde_json::json!({"n": 1})).unwrap();
        match subject.broadcast(&env) {
            Err(Error::Broadcast(failed)) => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "b");
            }
            other => panic!("unexpected {other:?}"),
        }
        let got = rx_a.try_recv().unwrap();
        assert_eq!(got.uri, "/news");
        assert_eq!(got.body_as::<serde_json::Value>().unwrap()["n"], 1);
    }

    #[test]
    fn disconnect_signals_the_loop() {
        let subject = Subject::new(Method::Call, "/c");
        let (_tx, _rx, mut cancel) = attach(&subject, "a").unwrap();
        assert!(subject.disconnect("a"));
        assert!(*cancel.borrow_and_update());
        assert!(subject.is_empty());
        assert!(!subject.disconnect("a"));
    }

    #[test]
    fn registry_reuses_subjects() {
        let reg = Registry::default();
        assert!(reg.get(Method::WebSocket, "/ws").is_none());
        let a = reg.subject(Method::WebSocket, "/ws");
        let b = reg.subject(Method::WebSocket, "/ws");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(reg.get(Method::Call, "/ws").is_none());
    }
}
