use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ws_tunnel::SessionConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    /// Decoded `host:port` strings clients may reach. Empty allows all.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            allow: Vec::new(),
            session: SessionSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the listen address, replacing its port when `port` is given.
    pub fn listen_socket_addr(&self, port: Option<u16>) -> anyhow::Result<SocketAddr> {
        let mut addr: SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", self.listen_addr))?;
        if let Some(port) = port {
            addr.set_port(port);
        }
        Ok(addr)
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    /// Zero disables the timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_backlog")]
    pub backlog_messages: usize,
    #[serde(default = "default_linger")]
    pub linger_secs: u64,
    /// Time allowed from accept until the session starts.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            backlog_messages: default_backlog(),
            linger_secs: default_linger(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: (self.connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.connect_timeout_secs)),
            backlog: self.backlog_messages.max(1),
            linger: Duration::from_secs(self.linger_secs),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Audit logging is off unless a path is set.
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit_log_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:5999".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_backlog() -> usize {
    256
}

fn default_linger() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the defaults, so the proxy can be started from
/// flags and environment alone. The caller reports the fallback once
/// logging is up.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
