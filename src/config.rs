use crate::backoff::{BackoffConfig, BackoffStrategy};
use crate::render::RenderSettings;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `node_id`
pub const NODE_ID_ENV: &str = "LB_NODE_ID";
/// Environment variable overriding `registry.endpoint`
pub const ENDPOINT_ENV: &str = "ETCD_NODE";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Identity of this load balancer node, attached to every log line
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub render: RenderSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            registry: RegistryConfig::default(),
            backoff: BackoffConfig::default(),
            proxy: ProxyConfig::default(),
            render: RenderSettings::default(),
        }
    }
}

fn default_node_id() -> String {
    "lb-go".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Base URL of the etcd JSON gateway
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Key prefix backends register under
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// TCP connect timeout for every registry call
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    /// Deadline for the startup liveness probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Deadline for each reconciliation snapshot read
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            prefix: default_prefix(),
            dial_timeout_ms: default_dial_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

impl RegistryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn default_endpoint() -> String {
    "http://etcd1:2379".to_string()
}

fn default_prefix() -> String {
    "/services/backend/".to_string()
}

fn default_dial_timeout() -> u64 {
    3000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_fetch_timeout() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Proxy executable, resolved through PATH when relative
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Live configuration read by the running proxy
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Candidate written and checked before being renamed over `config_path`.
    /// Must be on the same filesystem for the rename to be atomic.
    #[serde(default = "default_staging_path")]
    pub staging_path: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            config_path: default_config_path(),
            staging_path: default_staging_path(),
        }
    }
}

fn default_binary() -> PathBuf {
    PathBuf::from("haproxy")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg")
}

fn default_staging_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg.tmp")
}

impl Config {
    /// Parse the file at `path`. Validation happens in [`Config::resolve`],
    /// once environment overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` (or defaults), then apply environment overrides
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Span carrying this node's identity, entered for the life of the process
    pub fn node_span(&self) -> tracing::Span {
        tracing::info_span!("node", node_id = %self.node_id)
    }

    /// Override node id and registry endpoint from the environment.
    /// Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup(NODE_ID_ENV).filter(|v| !v.is_empty()) {
            self.node_id = node_id;
        }
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.is_empty()) {
            self.registry.endpoint = endpoint;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.node_id.trim().is_empty() {
            errors.push("node_id must not be empty".to_string());
        }
        if self.registry.endpoint.trim().is_empty() {
            errors.push("registry.endpoint must not be empty".to_string());
        }
        if self.registry.prefix.is_empty() {
            errors.push("registry.prefix must not be empty".to_string());
        }
        for (name, value) in [
            ("registry.dial_timeout_ms", self.registry.dial_timeout_ms),
            ("registry.probe_timeout_ms", self.registry.probe_timeout_ms),
            ("registry.fetch_timeout_ms", self.registry.fetch_timeout_ms),
            ("backoff.initial_ms", self.backoff.initial_ms),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than 0", name));
            }
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            errors.push(format!(
                "backoff.max_ms ({}) must not be less than backoff.initial_ms ({})",
                self.backoff.max_ms, self.backoff.initial_ms
            ));
        }
        if self.backoff.jitter && self.backoff.strategy == BackoffStrategy::Constant {
            errors.push("backoff.jitter requires strategy = \"exponential\"".to_string());
        }

        if self.proxy.config_path == self.proxy.staging_path {
            errors.push(format!(
                "proxy.staging_path must differ from proxy.config_path ({})",
                self.proxy.config_path.display()
            ));
        }

        let render = &self.render;
        if render.frontend_port == 0 {
            errors.push("render.frontend_port must be greater than 0".to_string());
        }
        if render.stats_port == 0 {
            errors.push("render.stats_port must be greater than 0".to_string());
        }
        if render.frontend_port != 0 && render.frontend_port == render.stats_port {
            errors.push(format!(
                "render.frontend_port and render.stats_port are both {}",
                render.frontend_port
            ));
        }
        if render.rise == 0 || render.fall == 0 {
            errors.push("render.rise and render.fall must be greater than 0".to_string());
        }
        if render.check_interval_secs == 0 {
            errors.push("render.check_interval_secs must be greater than 0".to_string());
        }
        if render.timeout_connect_secs == 0
            || render.timeout_client_secs == 0
            || render.timeout_server_secs == 0
        {
            errors.push("render timeouts must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
