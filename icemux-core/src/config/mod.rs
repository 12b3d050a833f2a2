//! Configuration system for the front-end
//!
//! Configuration is a TOML file turned into typed structs, with defaults for
//! every key and a handful of `ICEMUX_*` environment overrides applied on
//! top. The running server consumes configuration through [`ConfigStore`],
//! which hands out immutable snapshots and swaps in a fresh one on SIGHUP.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::{env, fs};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// A listening endpoint and its attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address; all interfaces when absent
    pub bind_address: Option<String>,
    /// Listen queue length
    pub backlog: u32,
    /// SO_SNDBUF override in bytes
    pub so_sndbuf: Option<usize>,
    /// TCP maximum segment size override
    pub so_mss: Option<u32>,
    /// Wrap accepted connections in TLS
    pub tls: bool,
    /// Speak the legacy Shoutcast source handshake on this port
    pub shoutcast_compat: bool,
    /// Mount used for translated Shoutcast sources
    pub shoutcast_mount: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: None,
            backlog: 32,
            so_sndbuf: None,
            so_mss: None,
            tls: false,
            shoutcast_compat: false,
            shoutcast_mount: "/stream".to_string(),
        }
    }
}

/// One alias rewrite rule, applied to GET requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasConfig {
    pub source: String,
    pub destination: String,
    /// Only applies on this listener port when set
    pub port: Option<u16>,
    /// Only applies on this bind address when set
    pub bind_address: Option<String>,
}

/// Access log tuning consumed by the GET dispatcher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessLogConfig {
    /// Space-separated extensions whose requests skip the access log
    pub exclude_ext: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// error | warn | info | debug | trace
    pub level: String,
    /// Append records to this file in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file: None }
    }
}

/// Complete front-end configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IcemuxConfig {
    pub listeners: Vec<ListenerConfig>,

    /// PEM file holding the certificate chain and private key
    pub cert_file: Option<PathBuf>,
    /// Cipher suite names to allow; provider defaults when absent
    pub cipher_list: Option<String>,

    pub ban_file: Option<PathBuf>,
    pub allow_file: Option<PathBuf>,
    pub agent_file: Option<PathBuf>,

    /// Seconds a client gets to deliver its request headers
    pub header_timeout: u64,
    /// Global cap enforced on non-admin GET requests
    pub client_limit: usize,

    pub admin_user: String,
    pub admin_password: Option<String>,
    pub relay_user: String,
    pub relay_password: Option<String>,
    pub source_password: Option<String>,
    /// Accept the deprecated ice-password header for sources
    pub ice_login: bool,

    /// Peers whose X-Forwarded-For header is honored
    pub xforward: Vec<String>,
    pub aliases: Vec<AliasConfig>,
    pub access_log: AccessLogConfig,

    /// Multiplier for a pause after each accept (x 5 ms) under back-pressure
    pub new_connections_slowdown: u64,

    pub logging: LoggingConfig,
}

impl Default for IcemuxConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig::default()],
            cert_file: None,
            cipher_list: None,
            ban_file: None,
            allow_file: None,
            agent_file: None,
            header_timeout: 15,
            client_limit: 256,
            admin_user: "admin".to_string(),
            admin_password: None,
            relay_user: "relay".to_string(),
            relay_password: None,
            source_password: None,
            ice_login: false,
            xforward: Vec::new(),
            aliases: Vec::new(),
            access_log: AccessLogConfig::default(),
            new_connections_slowdown: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl IcemuxConfig {
    /// Load a configuration file, apply env overrides and validate.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: IcemuxConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variables
    pub fn apply_env_vars(&mut self) {
        if let Ok(level) = env::var("ICEMUX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(limit) = env::var("ICEMUX_CLIENT_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.client_limit = n;
            }
        }
        if let Ok(timeout) = env::var("ICEMUX_HEADER_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                self.header_timeout = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("no listeners configured");
        }
        if self.header_timeout == 0 {
            bail!("header_timeout must be at least 1 second");
        }
        for listener in &self.listeners {
            if listener.port == 0 {
                bail!("listener port must not be 0");
            }
            if listener.shoutcast_compat && !listener.shoutcast_mount.starts_with('/') {
                bail!(
                    "shoutcast_mount \"{}\" must start with /",
                    listener.shoutcast_mount
                );
            }
            if let Some(addr) = &listener.bind_address {
                if addr.parse::<std::net::IpAddr>().is_err() {
                    bail!("invalid bind_address \"{}\"", addr);
                }
            }
        }
        for alias in &self.aliases {
            if !alias.source.starts_with('/') || !alias.destination.starts_with('/') {
                bail!("alias URIs must start with /");
            }
        }
        if self.listeners.iter().any(|l| l.tls) && self.cert_file.is_none() {
            bail!("a TLS listener is configured but cert_file is not set");
        }
        Ok(())
    }

    /// Header timeout in milliseconds, the unit the client deadline uses.
    pub fn header_timeout_ms(&self) -> u64 {
        self.header_timeout * 1000
    }
}

/// Locked snapshot store, the interface the running server reads config
/// through. `snapshot()` is cheap; `reload()` re-reads the backing file and
/// swaps the snapshot atomically.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<IcemuxConfig>>,
}

impl ConfigStore {
    /// Store around an in-memory config (tests, embedders).
    pub fn new(config: IcemuxConfig) -> Self {
        Self { path: None, current: RwLock::new(Arc::new(config)) }
    }

    /// Store backed by a file, enabling `reload()`.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = IcemuxConfig::load(&path)?;
        Ok(Self { path: Some(path), current: RwLock::new(Arc::new(config)) })
    }

    /// Current configuration snapshot.
    pub fn snapshot(&self) -> Arc<IcemuxConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Replace the snapshot with an in-memory config.
    pub fn replace(&self, config: IcemuxConfig) {
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
    }

    /// Re-read the backing file and swap the snapshot.
    pub fn reload(&self) -> Result<Arc<IcemuxConfig>> {
        let Some(path) = &self.path else {
            bail!("no config file to reload");
        };
        let config = Arc::new(IcemuxConfig::load(path)?);
        *self.current.write().expect("config lock poisoned") = config.clone();
        Ok(config)
    }
}
