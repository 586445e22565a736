//! Envelope multiplexing over the in-process pipe and over a real WebSocket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hornet::events::{self, CallClient, Envelope};
use hornet::{Context, HandlerFuture, Listener, Method, Server};
use serde_json::value::RawValue;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn ping<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
    Box::pin(async move {
        let rid = c.header("x-request-id").unwrap_or("").to_owned();
        c.json(200, &serde_json::json!({ "pong": rid }))
    })
}

fn echo<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
    Box::pin(async move {
        // several writes still leave as one envelope
        c.response_mut().set_content_type("application/json");
        c.response_mut().write(b"{\"echo\":");
        let body = c.body().clone();
        c.response_mut().write(&body);
        c.response_mut().write(b"}");
        Ok(())
    })
}

fn raw(json: &str) -> Option<Box<RawValue>> {
    Some(RawValue::from_string(json.to_owned()).unwrap())
}

fn server() -> Server {
    let mut server = Server::new();
    server.call("/api/ping", ping);
    server.call("/api/echo", echo);
    server.websocket("/api/ping", ping);
    server.get("/ws", events::upgrade);
    server
}

#[tokio::test]
async fn call_round_trip() {
    let server = Arc::new(server());
    let client = CallClient::connect(&server, "/internal").unwrap();

    let reply = client.call("/api/ping", HashMap::new(), None).await.unwrap();
    assert_eq!(reply.rid, 1);
    assert_eq!(reply.uri, "/api/ping");
    assert_eq!(reply.body_as::<serde_json::Value>().unwrap(), serde_json::json!({ "pong": "1" }));

    let reply = client.call("/api/echo", HashMap::new(), raw(r#"{"n":[1,2]}"#)).await.unwrap();
    assert_eq!(reply.body.unwrap().get(), r#"{"echo":{"n":[1,2]}}"#);

    let reply = client.call("/api/nowhere", HashMap::new(), None).await.unwrap();
    assert_eq!(reply.body_as::<serde_json::Value>().unwrap()["code"], 404);
}

#[tokio::test]
async fn call_replies_keep_order_and_reach_callback() {
    let server = Arc::new(server());
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let callback: events::Callback = Arc::new(move |env| {
        let _ = tx.send(env);
    });
    let client =
        CallClient::connect_with(&server, "/internal", Some("worker-1".to_owned()), Some(callback)).unwrap();

    let sent: Vec<u64> = (0..5).map(|_| client.send("/api/ping", HashMap::new(), None).unwrap()).collect();
    let mut got = Vec::new();
    for _ in 0..5 {
        got.push(rx.recv().await.unwrap().rid);
    }
    assert_eq!(got, sent);

    let subject = server.subject(Method::Call, "/internal").unwrap();
    assert_eq!(subject.connections(), ["worker-1"]);
    subject.broadcast(&Envelope::push("/news", &serde_json::json!({ "n": 1 })).unwrap()).unwrap();
    let pushed = rx.recv().await.unwrap();
    assert_eq!((pushed.rid, pushed.uri.as_str()), (0, "/news"));

    assert!(CallClient::connect_with(&server, "/internal", Some("worker-1".to_owned()), None).is_err());

    drop(client);
    assert!(subject.is_empty());
}

#[tokio::test]
async fn call_rejects_bad_envelopes() {
    let server = Arc::new(server());
    let client = CallClient::connect(&server, "/internal").unwrap();
    let reply = client.call("", HashMap::new(), None).await.unwrap();
    assert_eq!(reply.body_as::<serde_json::Value>().unwrap()["code"], 400);
}

#[tokio::test]
async fn websocket_multiplex() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server());
    let serving = tokio::spawn(Arc::clone(&server).serve(Listener::from(listener)));

    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(Message::text(r#"{"rid":1,"uri":"/api/ping","header":{},"body":null}"#)).await.unwrap();
    ws.send(Message::text(r#"{"rid":2,"uri":"/api/ping","body":null}"#)).await.unwrap();

    let mut replies = Vec::new();
    while replies.len() < 2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            let env: Envelope = serde_json::from_str(text.as_str()).unwrap();
            replies.push(env);
        }
    }
    assert_eq!(replies[0].rid, 1);
    assert_eq!(replies[1].rid, 2);
    assert_eq!(replies[1].body_as::<serde_json::Value>().unwrap()["pong"], "2");

    let subject = server.subject(Method::WebSocket, "/ws").unwrap();
    assert_eq!(subject.len(), 1);
    subject.broadcast(&Envelope::push("/news", &"hello").unwrap()).unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    let env: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(env.body_as::<String>().unwrap(), "hello");

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
}
