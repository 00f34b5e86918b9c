//! Configuration
//!
//! The configuration document is JSON:
//!
//! ```ignore
//! {
//!     "server": "proxy.example.com",
//!     "server_port": 8388,
//!     "local_port": 1080,
//!     "password": "the-password",
//!     "method": "aes-256-cfb",
//!     "auth": false,
//!     "timeout": 60,
//!     "port_password": {"8388": "pw1", "8389": "pw2"},
//!     "server_password": [["host:8388", "pw", "aes-256-cfb"]],
//!     "user_id": 7,
//!     "user_password": {"7": "pw"}
//! }
//! ```
//!
//! Unset or zero-valued fields take the built-in defaults; a `method`
//! ending in `-auth` strips the suffix and turns one-time auth on.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{CipherError, CipherKind};
use crate::users::UserCredential;

pub const DEFAULT_METHOD: &str = "aes-256-cfb";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("invalid configuration document: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidMethod(#[from] CipherError),
    #[error("must specify both server_port and password, or port_password")]
    MissingServerCredentials,
    #[error("must specify server, server_port and password, or server_password")]
    MissingClientCredentials,
    #[error("server_password entry {0:?} must be [address, password] or [address, password, method]")]
    InvalidServerEntry(Vec<String>),
}

/// The legacy `server` field takes either one address or a list
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ServerField {
    Single(String),
    List(Vec<String>),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// one-time auth demanded globally
    #[serde(default)]
    pub auth: bool,
    /// read timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    // server side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_password: Option<HashMap<String, String>>,

    // client side; order of entries is significant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_password: Option<Vec<Vec<String>>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_password: Option<HashMap<String, String>>,

    // credential backend selection; the backends themselves are external
    #[serde(default)]
    pub use_database: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default)]
    pub use_redis: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_server: Option<String>,

    // DNS-over-tunnel forwarder on the client
    #[serde(default)]
    pub enable_dns_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_dns_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_proxy_port: Option<u16>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let data = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&data)?;
        config.normalize();
        config.check()?;
        Ok(config)
    }

    /// Apply defaults and the `-auth` method-suffix convention
    pub fn normalize(&mut self) {
        if let Some(ref mut method) = self.method {
            let lowered = method.to_lowercase();
            if let Some(stripped) = lowered.strip_suffix("-auth") {
                *method = stripped.to_owned();
                self.auth = true;
            }
        }
        if matches!(self.method.as_deref(), None | Some("")) {
            self.method = Some(DEFAULT_METHOD.to_owned());
        }
        if self.enable_dns_proxy && self.dns_proxy_port.is_none() {
            self.dns_proxy_port = Some(53);
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.method()?;
        if let Some(ref entries) = self.server_password {
            for entry in entries {
                if entry.len() < 2 || entry.len() > 3 {
                    return Err(ConfigError::InvalidServerEntry(entry.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn method(&self) -> Result<CipherKind, ConfigError> {
        let name = self.method.as_deref().unwrap_or(DEFAULT_METHOD);
        Ok(name.parse::<CipherKind>()?)
    }

    pub fn timeout(&self) -> Duration {
        match self.timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_TIMEOUT,
        }
    }

    pub fn udp_timeout(&self) -> Duration {
        self.timeout()
    }

    /// Listen ports for the server engine. `port_password` wins; the
    /// single `server_port`/`password` pair is folded into it.
    pub fn port_password(&self) -> Result<HashMap<String, String>, ConfigError> {
        if let Some(ref pp) = self.port_password {
            if !pp.is_empty() {
                return Ok(pp.clone());
            }
        }
        match (self.server_port, self.password.as_ref()) {
            (Some(port), Some(password)) if port != 0 && !password.is_empty() => {
                Ok(HashMap::from([(port.to_string(), password.clone())]))
            }
            _ => Err(ConfigError::MissingServerCredentials),
        }
    }

    /// The legacy `server` list, single-server form included
    pub fn server_list(&self) -> Vec<String> {
        match self.server {
            Some(ServerField::Single(ref s)) => vec![s.clone()],
            Some(ServerField::List(ref list)) => list.clone(),
            None => Vec::new(),
        }
    }

    /// Per-user credentials from the `user_password` block; bandwidth is
    /// unlimited for file-configured users
    pub fn user_map(&self) -> HashMap<u32, UserCredential> {
        let mut users = HashMap::new();
        if let Some(ref map) = self.user_password {
            for (id, password) in map {
                if let Ok(user_id) = id.parse::<u32>() {
                    users.insert(
                        user_id,
                        UserCredential {
                            password: password.clone(),
                            bandwidth_mbps: -1,
                        },
                    );
                }
            }
        }
        users
    }
}
