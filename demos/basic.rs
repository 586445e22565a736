//! Minimal hornet example: JSON endpoints, a controller and a WebSocket
//! endpoint multiplexing envelope requests.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:8080/users/42
//!   curl -X POST http://localhost:8080/user/login -d 'username=alice&password=secret'
//!   websocat ws://localhost:8080/ws
//!     {"rid":1,"uri":"/api/ping","header":{},"body":null}

use std::sync::Arc;

use hornet::{
    Bind, BoxFuture, Config, Context, Controller, Field, HandlerFuture, HttpError, Methods, Result, Server, Verify,
    controller, events, middleware,
};
use serde::{Deserialize, Serialize};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = match std::env::var("HORNET_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::default(),
    };

    let mut server = Server::with_config(config);
    server.pre(middleware::trace()).pre(middleware::request_id());

    server.get("/users/:id", get_user);
    server.post("/user/login", controller::handler::<User>());

    server.get("/ws", events::upgrade);
    server.websocket("/api/ping", ping);

    Arc::new(server).start().await
}

// GET /users/:id
fn get_user<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = c.param("id").to_owned();
        c.ok(&serde_json::json!({ "id": id, "name": "alice" }))
    })
}

// WEBSOCKET /api/ping
fn ping<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
    Box::pin(async move { c.ok(&"pong") })
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct LoginRequest {
    username: String,
    password: String,
}

impl Bind for LoginRequest {
    fn fields() -> Vec<Field> {
        vec![
            Field::new("username").from("form").process("trim,tolower"),
            Field::new("password").from("form"),
        ]
    }
}

impl Verify for LoginRequest {
    fn verify(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(HttpError::new(400, "username required").with_errno(10001).into());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Token {
    token: String,
}

#[derive(Default)]
struct User;

impl Controller for User {
    fn register(m: &mut Methods<Self>) {
        m.method("Login", Self::login);
    }
}

impl User {
    fn login<'a>(&'a mut self, _c: &'a mut Context, req: &'a LoginRequest) -> BoxFuture<'a, Result<Token>> {
        Box::pin(async move {
            if req.password != "secret" {
                return Err(HttpError::new(200, "bad password").with_errno(10003).into());
            }
            Ok(Token { token: format!("token-{}", req.username) })
        })
    }
}
