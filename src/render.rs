//! HAProxy configuration rendering
//!
//! `render` is a pure function of the backend set: entries are sorted by
//! name so the same set always produces byte-identical text. Health checks
//! are only emitted when there is more than one backend; a lone server has
//! nothing to fail over to.

use crate::backend::BackendSet;
use serde::Deserialize;
use std::fmt::Write;

/// Rendered configuration text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig(String);

impl RenderedConfig {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// `[render]` section: the fixed parts of the generated configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RenderSettings {
    /// Global connection cap
    #[serde(default = "default_maxconn")]
    pub maxconn: u32,

    /// Port the front-end binds to
    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,

    /// Port of the stats listener
    #[serde(default = "default_stats_port")]
    pub stats_port: u16,

    #[serde(default = "default_frontend_name")]
    pub frontend_name: String,

    /// Name of the back-end group all servers belong to
    #[serde(default = "default_backend_name")]
    pub backend_name: String,

    #[serde(default = "default_timeout_connect")]
    pub timeout_connect_secs: u64,

    #[serde(default = "default_timeout_client")]
    pub timeout_client_secs: u64,

    #[serde(default = "default_timeout_server")]
    pub timeout_server_secs: u64,

    /// Path probed by active health checks (multi-backend only)
    #[serde(default = "default_check_path")]
    pub check_path: String,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Consecutive successes before a server is marked up
    #[serde(default = "default_rise")]
    pub rise: u32,

    /// Consecutive failures before a server is marked down
    #[serde(default = "default_fall")]
    pub fall: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            maxconn: default_maxconn(),
            frontend_port: default_frontend_port(),
            stats_port: default_stats_port(),
            frontend_name: default_frontend_name(),
            backend_name: default_backend_name(),
            timeout_connect_secs: default_timeout_connect(),
            timeout_client_secs: default_timeout_client(),
            timeout_server_secs: default_timeout_server(),
            check_path: default_check_path(),
            check_interval_secs: default_check_interval(),
            rise: default_rise(),
            fall: default_fall(),
        }
    }
}

fn default_maxconn() -> u32 {
    4096
}

fn default_frontend_port() -> u16 {
    80
}

fn default_stats_port() -> u16 {
    8404
}

fn default_frontend_name() -> String {
    "http-in".to_string()
}

fn default_backend_name() -> String {
    "app".to_string()
}

fn default_timeout_connect() -> u64 {
    5
}

fn default_timeout_client() -> u64 {
    50
}

fn default_timeout_server() -> u64 {
    50
}

fn default_check_path() -> String {
    "/".to_string()
}

fn default_check_interval() -> u64 {
    2
}

fn default_rise() -> u32 {
    2
}

fn default_fall() -> u32 {
    3
}

/// Render the proxy configuration for `backends`
pub fn render(backends: &BackendSet, settings: &RenderSettings) -> RenderedConfig {
    let sorted = backends.sorted();
    let health_checks = sorted.len() > 1;
    let mut out = String::with_capacity(512 + sorted.len() * 48);

    // Writing into a String cannot fail
    let _ = write!(
        out,
        "global
    log stdout format raw local0
    maxconn {maxconn}

defaults
    log global
    mode http
    timeout connect {connect}s
    timeout client {client}s
    timeout server {server}s

frontend {frontend}
    bind *:{frontend_port}
    default_backend {backend}

backend {backend}
    balance roundrobin
",
        maxconn = settings.maxconn,
        connect = settings.timeout_connect_secs,
        client = settings.timeout_client_secs,
        server = settings.timeout_server_secs,
        frontend = settings.frontend_name,
        frontend_port = settings.frontend_port,
        backend = settings.backend_name,
    );

    if health_checks {
        let _ = writeln!(out, "    option httpchk GET {}", settings.check_path);
        let _ = writeln!(
            out,
            "    default-server inter {}s rise {} fall {}",
            settings.check_interval_secs, settings.rise, settings.fall
        );
    }

    for entry in sorted {
        if health_checks {
            let _ = writeln!(out, "    server {} {} check", entry.name, entry.address);
        } else {
            let _ = writeln!(out, "    server {} {}", entry.name, entry.address);
        }
    }

    let _ = write!(
        out,
        "
listen stats
    bind *:{}
    stats enable
    stats uri /
",
        settings.stats_port
    );

    RenderedConfig(out)
}
