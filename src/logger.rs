//! The `Printf`-style logger the server reports through.
//!
//! hornet logs its own lifecycle with `tracing`. The [`Logger`] seam exists
//! for the few messages an application may want to route elsewhere: writes
//! to an already-committed response and recovered handler panics.

use std::fmt;

pub trait Logger: Send + Sync + 'static {
    fn printf(&self, args: fmt::Arguments<'_>);
}

/// Default logger; forwards every line to `tracing` at WARN.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn printf(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(target: "hornet", "{args}");
    }
}
