//! Route groups: a shared path prefix and middleware stack.
//!
//! ```rust,ignore
//! let mut api = server.group("/api", &[auth]);
//! api.get("/users/:id", get_user);
//! let mut admin = api.group("/admin", &[audit]);
//! admin.delete("/users/:id", delete_user);   // auth(audit(delete_user))
//! ```
//!
//! Each group owns its own middleware vector; nesting clones it, so adding
//! middleware to a child never leaks into the parent or into routes that are
//! already registered.

use std::sync::Arc;

use crate::handler::{Handler, Middleware, boxed, compose};
use crate::method::Method;
use crate::server::Server;

/// A prefixed view of the server used during registration.
pub struct Group<'s> {
    server: &'s mut Server,
    prefix: String,
    mw: Vec<Middleware>,
}

impl<'s> Group<'s> {
    pub(crate) fn new(server: &'s mut Server, prefix: &str, mw: Vec<Middleware>) -> Self {
        Self { server, prefix: prefix.trim_end_matches('/').to_owned(), mw }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Appends middleware for routes registered after this call.
    pub fn use_(&mut self, mw: Middleware) -> &mut Self {
        self.mw.push(mw);
        self
    }

    /// A nested group; its middleware runs inside this group's.
    pub fn group(&mut self, prefix: &str, mw: &[Middleware]) -> Group<'_> {
        let mut all = self.mw.clone();
        all.extend_from_slice(mw);
        let prefix = format!("{}{}", self.prefix, prefix);
        Group::new(&mut *self.server, &prefix, all)
    }

    /// Registers under the group prefix; route middleware runs inside the
    /// group's.
    pub fn add(&mut self, method: Method, path: &str, handler: impl Handler, mw: &[Middleware]) -> &mut Self {
        let mut all = self.mw.clone();
        all.extend_from_slice(mw);
        let path = format!("{}{}", self.prefix, path);
        self.server.add_boxed(method, &path, compose(boxed(handler), &all));
        self
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
    pub fn websocket(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::WebSocket, path, h, &[]) }
    pub fn call(&mut self, path: &str, h: impl Handler) -> &mut Self { self.add(Method::Call, path, h, &[]) }

    pub fn any(&mut self, path: &str, h: impl Handler) -> &mut Self {
        self.match_methods(&Method::STANDARD, path, h)
    }

    pub fn match_methods(&mut self, methods: &[Method], path: &str, h: impl Handler) -> &mut Self {
        let h = compose(boxed(h), &self.mw);
        let path = format!("{}{}", self.prefix, path);
        for &m in methods {
            self.server.add_boxed(m, &path, Arc::clone(&h));
        }
        self
    }
}
