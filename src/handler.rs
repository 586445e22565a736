//! Handler trait, middleware and type erasure.
//!
//! # How handlers are stored
//!
//! The router holds handlers of *different* types in one tree, so every
//! handler is erased behind `Arc<dyn Handler>`:
//!
//! ```text
//! fn hello(c: &mut Context) -> HandlerFuture<'_> { … }   ← user writes this
//!        ↓ server.get("/", hello)
//! Arc::new(hello)                                       ← BoxedHandler
//!        ↓
//! handler.call(&mut ctx)  at request time               ← one vtable dispatch
//! ```
//!
//! Handlers borrow the pooled [`Context`] mutably for the duration of the
//! returned future, which is why the future type carries the borrow's
//! lifetime.
//!
//! # Middleware
//!
//! A [`Middleware`] turns one handler into another. Composition wraps the
//! innermost handler first, so `[a, b, c]` around `h` yields `a(b(c(h)))`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;

/// A boxed future borrowing the request context.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Anything that can serve a request.
///
/// Implemented for every function of the shape
///
/// ```text
/// fn name(c: &mut Context) -> HandlerFuture<'_>
/// ```
///
/// and for [`Middleware`]-produced wrappers.
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, c: &'a mut Context) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, c: &'a mut Context) -> HandlerFuture<'a> {
        (self)(c)
    }
}

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Handler>;

/// Erases a concrete handler.
pub fn boxed(h: impl Handler) -> BoxedHandler {
    Arc::new(h)
}

/// Wraps a handler in another handler.
pub type Middleware = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static>;

/// Builds a [`Middleware`] from a function that receives the context and the
/// next handler in the chain.
///
/// ```rust,ignore
/// fn auth<'a>(c: &'a mut Context, next: &'a BoxedHandler) -> HandlerFuture<'a> {
///     Box::pin(async move {
///         if c.header("authorization").is_none() {
///             return Err(HttpError::unauthorized().into());
///         }
///         next.call(c).await
///     })
/// }
///
/// server.use_(middleware(auth));
/// ```
pub fn middleware<F>(f: F) -> Middleware
where
    F: for<'a> Fn(&'a mut Context, &'a BoxedHandler) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: BoxedHandler| -> BoxedHandler {
        Arc::new(Wrapped { f: Arc::clone(&f), next })
    })
}

struct Wrapped<F> {
    f: Arc<F>,
    next: BoxedHandler,
}

impl<F> Handler for Wrapped<F>
where
    F: for<'a> Fn(&'a mut Context, &'a BoxedHandler) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, c: &'a mut Context) -> HandlerFuture<'a> {
        (self.f)(c, &self.next)
    }
}

/// Applies `mws` around `h`, first middleware outermost.
pub(crate) fn compose(h: BoxedHandler, mws: &[Middleware]) -> BoxedHandler {
    mws.iter().rev().fold(h, |h, mw| mw(h))
}

/// A handler that always fails with the given status.
pub(crate) struct StatusHandler(pub(crate) u16);

impl Handler for StatusHandler {
    fn call<'a>(&'a self, _c: &'a mut Context) -> HandlerFuture<'a> {
        let code = self.0;
        Box::pin(async move { Err(crate::error::HttpError::status(code).into()) })
    }
}
