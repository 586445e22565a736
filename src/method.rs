//! HTTP method as a typed enum.
//!
//! Covers the RFC 9110 standard methods, the two WebDAV methods the router
//! keeps a slot for (`PROPFIND`, `REPORT`), and two sentinels used by the
//! event multiplexer: `WEBSOCKET` for envelopes arriving over a WebSocket and
//! `CALL` for envelopes arriving over an in-process pipe. Sentinels never
//! appear on the wire; they only select a handler slot in the router.

use std::fmt;
use std::str::FromStr;

/// A method the router can hold a handler for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Method {
    // RFC 9110 ─────────────────────────────────────────────────────────────────
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
    // WebDAV ───────────────────────────────────────────────────────────────────
    Propfind,
    Report,
    // Event multiplexer sentinels ──────────────────────────────────────────────
    WebSocket,
    Call,
}

impl Method {
    /// Number of handler slots a route node carries.
    pub const COUNT: usize = 13;

    /// Every method, in slot order.
    pub const ALL: [Method; Self::COUNT] = [
        Self::Connect,
        Self::Delete,
        Self::Get,
        Self::Head,
        Self::Options,
        Self::Patch,
        Self::Post,
        Self::Put,
        Self::Trace,
        Self::Propfind,
        Self::Report,
        Self::WebSocket,
        Self::Call,
    ];

    /// Methods registered by [`Server::any`](crate::Server::any).
    pub const STANDARD: [Method; 11] = [
        Self::Connect,
        Self::Delete,
        Self::Get,
        Self::Head,
        Self::Options,
        Self::Patch,
        Self::Post,
        Self::Put,
        Self::Trace,
        Self::Propfind,
        Self::Report,
    ];

    /// Returns the uppercase wire representation (e.g. `"GET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect   => "CONNECT",
            Self::Delete    => "DELETE",
            Self::Get       => "GET",
            Self::Head      => "HEAD",
            Self::Options   => "OPTIONS",
            Self::Patch     => "PATCH",
            Self::Post      => "POST",
            Self::Propfind  => "PROPFIND",
            Self::Put       => "PUT",
            Self::Report    => "REPORT",
            Self::Trace     => "TRACE",
            Self::WebSocket => "WEBSOCKET",
            Self::Call      => "CALL",
        }
    }

    /// Slot of this method in a node's handler table.
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Maps an `http::Method` onto a router slot. Unknown extension methods
    /// have no slot.
    pub fn from_http(m: &http::Method) -> Option<Self> {
        m.as_str().parse().ok()
    }
}

/// Parses an uppercase method string (e.g. `"GET"`). Case-sensitive per RFC 9110 §9.1.
impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT"   => Ok(Self::Connect),
            "DELETE"    => Ok(Self::Delete),
            "GET"       => Ok(Self::Get),
            "HEAD"      => Ok(Self::Head),
            "OPTIONS"   => Ok(Self::Options),
            "PATCH"     => Ok(Self::Patch),
            "POST"      => Ok(Self::Post),
            "PROPFIND"  => Ok(Self::Propfind),
            "PUT"       => Ok(Self::Put),
            "REPORT"    => Ok(Self::Report),
            "TRACE"     => Ok(Self::Trace),
            "WEBSOCKET" => Ok(Self::WebSocket),
            "CALL"      => Ok(Self::Call),
            _           => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_declaration_order() {
        for (i, m) in Method::ALL.iter().enumerate() {
            assert_eq!(m.index(), i);
            assert_eq!(m.as_str().parse::<Method>(), Ok(*m));
        }
    }

    #[test]
    fn lowercase_is_rejected() {
        assert!("get".parse::<Method>().is_err());
        assert_eq!(Method::from_http(&http::Method::POST), Some(Method::Post));
    }
}
