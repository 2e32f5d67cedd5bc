// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Connection and behaviour settings for a [`Bus`](crate::Bus).
///
/// Keys are camelCase so a JSON file can use the same option names as
/// other bus implementations (`rpcTimeout`, `restartInterval`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub vhost: Option<String>,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    /// Default RPC timeout in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: u64,
    /// Delay between reconnect attempts in milliseconds.
    #[serde(default = "default_restart_interval")]
    pub restart_interval: u64,
    #[serde(default = "default_client_prefix")]
    pub client_prefix: String,
}

// Default values
fn default_protocol() -> String { "amqp".to_string() }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_heartbeat() -> u16 { 5 }
fn default_rpc_timeout() -> u64 { 30_000 }
fn default_restart_interval() -> u64 { 5_000 }

fn default_client_prefix() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let hostname = if hostname.is_empty() { "localhost".to_string() } else { hostname };
    format!("bus-{}-node-{}-", hostname, std::process::id())
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl BusConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            protocol: default_protocol(),
            username: default_username(),
            password: default_password(),
            vhost: None,
            heartbeat: default_heartbeat(),
            rpc_timeout: default_rpc_timeout(),
            restart_interval: default_restart_interval(),
            client_prefix: default_client_prefix(),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = Some(vhost.to_string());
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout.as_millis() as u64;
        self
    }

    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval.as_millis() as u64;
        self
    }

    pub fn with_client_prefix(mut self, prefix: &str) -> Self {
        self.client_prefix = prefix.to_string();
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval)
    }

    /// Vhost as shown in log lines: empty for the default vhost, `/name` otherwise.
    pub fn vhost_display(&self) -> String {
        match self.vhost.as_deref() {
            None | Some("") | Some("/") => String::new(),
            Some(vhost) => format!("/{}", vhost),
        }
    }

    /// Composes `{protocol}://{username}:{password}@{host}[/{vhost}]?heartbeat={n}`.
    pub fn amqp_uri(&self) -> String {
        let vhost = match self.vhost.as_deref() {
            None | Some("") | Some("/") => String::new(),
            Some(vhost) => format!("/{}", vhost.replace('/', "%2f")),
        };
        format!(
            "{}://{}:{}@{}{}?heartbeat={}",
            self.protocol, self.username, self.password, self.host, vhost, self.heartbeat
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("Configuration error: host cannot be empty"));
        }
        if self.rpc_timeout == 0 {
            return Err(anyhow!("Configuration error: rpcTimeout must be greater than zero"));
        }
        if self.restart_interval == 0 {
            return Err(anyhow!("Configuration error: restartInterval must be greater than zero"));
        }
        Ok(())
    }

    /// Reads `BUS_*` variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let host = env::var("BUS_HOST").context("BUS_HOST must be set")?;
        let mut config = BusConfig::new(&host);

        if let Ok(protocol) = env::var("BUS_PROTOCOL") {
            config.protocol = protocol;
        }
        if let Ok(username) = env::var("BUS_USERNAME") {
            config.username = username;
        }
        if let Ok(password) = env::var("BUS_PASSWORD") {
            config.password = password;
        }
        if let Ok(vhost) = env::var("BUS_VHOST") {
            config.vhost = Some(vhost);
        }
        if let Ok(val) = env::var("BUS_HEARTBEAT") {
            config.heartbeat = val.parse().context("BUS_HEARTBEAT must be a number of seconds")?;
        }
        if let Ok(val) = env::var("BUS_RPC_TIMEOUT_MS") {
            config.rpc_timeout = val.parse().context("BUS_RPC_TIMEOUT_MS must be a number")?;
        }
        if let Ok(val) = env::var("BUS_RESTART_INTERVAL_MS") {
            config.restart_interval = val
                .parse()
                .context("BUS_RESTART_INTERVAL_MS must be a number")?;
        }
        if let Ok(prefix) = env::var("BUS_CLIENT_PREFIX") {
            config.client_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: BusConfig = serde_json::from_str(content)
            .context("Configuration contains invalid JSON or missing required fields")?;
        config.validate()?;
        Ok(config)
    }

    /// Finds a config file and loads it.
    pub fn load() -> Result<Self> {
        let path = find_config_file()?;
        Self::from_file(&path)
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("rabbit_bus.json")),
        ("Current directory (alternative)", Path::new("config/rabbit_bus.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbit_bus.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find rabbit_bus.json configuration file. \
         Create one in the current directory, ./config, or as ~/.rabbit_bus.json"
    ))
}
