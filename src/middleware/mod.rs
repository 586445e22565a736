//! Built-in middleware.
//!
//! - [`trace`] runs each request inside a `tracing` span and logs method,
//!   path, status and latency when it completes.
//! - [`request_id`] makes sure every response carries an `X-Request-ID`.
//!
//! Both are plain [`Middleware`] values and work as pre, post or route
//! middleware:
//!
//! ```rust,ignore
//! server.pre(middleware::trace()).pre(middleware::request_id());
//! ```

use std::time::Instant;

use tracing::{Instrument, info, info_span, warn};

use crate::context::Context;
use crate::handler::{BoxedHandler, HandlerFuture, Middleware, middleware};

const REQUEST_ID: &str = "x-request-id";

/// Per-request span and completion log.
///
/// Errors are logged with the status they will be rendered with; the error
/// itself still propagates to the server's error handler.
pub fn trace() -> Middleware {
    middleware(trace_request)
}

fn trace_request<'a>(c: &'a mut Context, next: &'a BoxedHandler) -> HandlerFuture<'a> {
    let span = info_span!(
        "request",
        method = %c.request().method(),
        path = %c.request().path(),
        id = c.header(REQUEST_ID).unwrap_or(""),
    );
    Box::pin(
        async move {
            let start = Instant::now();
            let result = next.call(c).await;
            let latency_us = start.elapsed().as_micros() as u64;
            match &result {
                Ok(()) => info!(status = c.response().status(), size = c.response().size(), latency_us, "completed"),
                Err(e) => {
                    let status = e.as_http().map_or(500, |h| h.code);
                    warn!(status, latency_us, error = %e, "failed");
                }
            }
            result
        }
        .instrument(span),
    )
}

/// Copies the request's `X-Request-ID` to the response, or generates a
/// UUID v4. The id is also stored on the context under `"request_id"`.
pub fn request_id() -> Middleware {
    middleware(ensure_request_id)
}

fn ensure_request_id<'a>(c: &'a mut Context, next: &'a BoxedHandler) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = c
            .header(REQUEST_ID)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        c.response_mut().set_header(REQUEST_ID, &id);
        c.with_value("request_id", id);
        next.call(c).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{boxed, compose};
    use crate::request::Request;

    fn echo_id<'a>(c: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let id = c.value_as::<String>("request_id").map(|s| s.to_string()).unwrap_or_default();
            c.string(200, &id)
        })
    }

    #[tokio::test]
    async fn request_id_is_copied_or_generated() {
        let h = compose(boxed(echo_id), &[request_id()]);

        let mut c = Context::new(Request::default().with_header("x-request-id", "abc"));
        h.call(&mut c).await.unwrap();
        assert_eq!(c.response().headers()["x-request-id"], "abc");
        assert_eq!(c.response().body(), b"abc");

        let mut c = Context::new(Request::default());
        h.call(&mut c).await.unwrap();
        let generated = c.response().headers()["x-request-id"].to_str().unwrap().to_owned();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[tokio::test]
    async fn trace_passes_results_through() {
        fn fail<'a>(_c: &'a mut Context) -> HandlerFuture<'a> {
            Box::pin(async { Err(crate::error::HttpError::forbidden().into()) })
        }
        let h = compose(boxed(fail), &[trace()]);
        let mut c = Context::new(Request::default());
        let err = h.call(&mut c).await.unwrap_err();
        assert_eq!(err.as_http().map(|h| h.code), Some(403));
    }
}
