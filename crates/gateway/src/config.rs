#![forbid(unsafe_code)]

//! Peer configuration: built-in defaults, then an optional TOML file, then `PEERLINK_*`
//! environment variables. Command-line flags are applied last by the binary.
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 52011
//! shared_token = "lan-secret"
//! tls_cert = "/etc/peerlink/cert.pem"
//! tls_key = "/etc/peerlink/key.pem"
//! ```

use crate::GatewayError;
use crate::runtime::RUNTIME_DIR_ENV;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_ENV: &str = "PEERLINK_DB";
pub const BIND_ENV: &str = "PEERLINK_BIND";
pub const PORT_ENV: &str = "PEERLINK_PORT";
pub const TOKEN_ENV: &str = "PEERLINK_TOKEN";
pub const TLS_CERT_ENV: &str = "PEERLINK_TLS_CERT";
pub const TLS_KEY_ENV: &str = "PEERLINK_TLS_KEY";

const CONFIG_DIR_NAME: &str = "peerlink";
const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "registry.db";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    pub runtime_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub bind: IpAddr,
    /// `0` picks any free port.
    pub port: u16,
    /// Token every peer on the LAN accepts instead of its per-start token.
    pub shared_token: Option<String>,
    /// Certificate chain and key served by the gateway. Without them it serves a
    /// self-signed certificate generated at start.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Scheme for peers whose endpoint file is not readable from this host. `false` only to
    /// reach plain-HTTP peers of older builds.
    pub remote_tls: bool,
    pub heartbeat_interval_secs: u64,
    pub drain_timeout_ms: u64,
    pub invoke_timeout_secs: u64,
    pub history_keep_per_session: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            db_path: None,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            shared_token: None,
            tls_cert: None,
            tls_key: None,
            remote_tls: true,
            heartbeat_interval_secs: 30,
            drain_timeout_ms: 5_000,
            invoke_timeout_secs: 90,
            history_keep_per_session: 500,
        }
    }
}

impl PeerConfig {
    /// Reads `path` when given (it must exist), else the per-user config file when present.
    /// Environment overrides are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            GatewayError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml(&text)
            .map_err(|err| GatewayError::Config(format!("{}: {err}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self, GatewayError> {
        toml::from_str(text).map_err(|err| GatewayError::Config(err.to_string()))
    }

    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), GatewayError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(dir) = get(RUNTIME_DIR_ENV) {
            self.runtime_dir = Some(PathBuf::from(dir));
        }
        if let Some(db) = get(DB_ENV) {
            self.db_path = Some(PathBuf::from(db));
        }
        if let Some(bind) = get(BIND_ENV) {
            self.bind = bind
                .parse()
                .map_err(|_| GatewayError::Config(format!("{BIND_ENV}: invalid address {bind:?}")))?;
        }
        if let Some(port) = get(PORT_ENV) {
            self.port = port
                .parse()
                .map_err(|_| GatewayError::Config(format!("{PORT_ENV}: invalid port {port:?}")))?;
        }
        if let Some(token) = get(TOKEN_ENV) {
            self.shared_token = Some(token);
        }
        if let Some(cert) = get(TLS_CERT_ENV) {
            self.tls_cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = get(TLS_KEY_ENV) {
            self.tls_key = Some(PathBuf::from(key));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(GatewayError::Config(
                "tls_cert and tls_key must be configured together".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(GatewayError::Config(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self
            .shared_token
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err(GatewayError::Config("shared_token must not be blank".to_string()));
        }
        Ok(())
    }

    pub fn db_path_or_default(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(CONFIG_DIR_NAME)
                .join(DB_FILE_NAME)
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        Some((self.tls_cert.as_deref()?, self.tls_key.as_deref()?))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
