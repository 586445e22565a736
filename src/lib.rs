//! # hornet
//!
//! A small web-service framework on tokio and hyper.
//!
//! - Radix-tree routing with `:param` and trailing `*` segments; static beats
//!   param beats any, with backtracking.
//! - Pooled per-request [`Context`] with declarative [`Bind`]ing, response
//!   helpers and a key/value store.
//! - Pre-routing and post-routing middleware, structured [`HttpError`]s and
//!   panic recovery.
//! - Typed [`controller`] dispatch.
//! - An [`events`] multiplexer that serves many `{rid, uri, header, body}`
//!   envelopes over one WebSocket (or an in-process pipe) through the same
//!   router, and broadcasts to every connection of a subject.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hornet::{Context, HandlerFuture, Server, middleware};
//!
//! fn get_user<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
//!     Box::pin(async move {
//!         let id = c.param("id").to_owned();
//!         c.ok(&serde_json::json!({ "id": id }))
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> hornet::Result<()> {
//!     let mut server = Server::new();
//!     server.pre(middleware::trace());
//!     server.get("/users/:id", get_user);
//!     Arc::new(server).start().await
//! }
//! ```

mod bind;
mod config;
mod context;
mod error;
mod form;
mod group;
mod handler;
mod logger;
mod method;
mod request;
mod response;
mod router;
mod server;

pub mod controller;
pub mod events;
pub mod middleware;

pub use bind::{Bind, Field, Kind, Process, Source};
pub use config::{Config, ListenerNetwork};
pub use context::{Context, Cookie};
pub use controller::{Controller, Methods, Verify};
pub use error::{Error, HttpError, Result};
pub use form::{Form, FormFile};
pub use group::Group;
pub use handler::{BoxedHandler, Handler, HandlerFuture, Middleware, boxed, middleware};
pub use logger::{Logger, TracingLogger};
pub use method::Method;
pub use request::{Request, Value};
pub use response::{ContentType, Response};
pub use router::{Found, Lookup, Router};
pub use server::{ErrorHandler, Listener, OkHandler, Server, default_error_handler, default_ok_handler};

pub use futures_util::future::BoxFuture;
