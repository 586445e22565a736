//! Server configuration.
//!
//! Build a [`Config`] in code or load it from TOML:
//!
//! ```toml
//! debug = true
//! listener_network = "tcp4"
//! address = "0.0.0.0:8080"
//! max_body_size = 4194304
//! index_file = "index.html"
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Socket family the listener binds.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerNetwork {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl FromStr for ListenerNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp"  => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "unix" => Ok(Self::Unix),
            other  => Err(Error::InvalidNetwork(other.to_owned())),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adds the internal error to error responses.
    pub debug: bool,
    pub listener_network: ListenerNetwork,
    /// `host:port` for TCP networks, a filesystem path for `unix`.
    pub address: String,
    /// Requests with larger bodies are answered with `413`.
    pub max_body_size: usize,
    /// File served when [`Context::file`](crate::Context::file) is given a directory.
    pub index_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            listener_network: ListenerNetwork::Tcp,
            address: "0.0.0.0:8080".to_owned(),
            max_body_size: 32 << 20,
            index_file: "index.html".to_owned(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }
}
