//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol::framing::DEFAULT_MAX_FRAME_BYTES;
use crate::render::script::{DEFAULT_ACCEPT, DEFAULT_USER_AGENT};

/// Root configuration for the render proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Renderer executable and script defaults.
    pub renderer: RendererConfig,

    /// Network namespace plumbing.
    pub namespace: NamespaceConfig,

    /// Traffic recording settings.
    pub recorder: RecorderConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind host (the port comes from the command line).
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: usize,

    /// Size of each socket read.
    pub read_buffer_bytes: usize,

    /// How long shutdown waits for in-flight connections, in seconds.
    pub drain_secs: u64,
}

impl ListenerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_buffer_bytes: 8 * 1024,
            drain_secs: 30,
        }
    }
}

/// Headless renderer invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Path to the renderer executable.
    pub executable: PathBuf,

    /// Fixed arguments; the script arrives on stdin.
    pub args: Vec<String>,

    /// User agent used when the request has none.
    pub default_user_agent: String,

    /// Accept header used when the request has none.
    pub default_accept: String,

    /// Kill the renderer after this many seconds (unset = wait forever).
    pub timeout_secs: Option<u64>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/usr/bin/phantomjs"),
            args: vec![
                "--ignore-ssl-errors=true".to_string(),
                "--ssl-protocol=TLSv1".to_string(),
                "/dev/stdin".to_string(),
            ],
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            default_accept: DEFAULT_ACCEPT.to_string(),
            timeout_secs: None,
        }
    }
}

/// Network namespace configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Absolute path of `ip` (the environment, PATH included, is cleared).
    pub ip_command: PathBuf,

    /// Absolute path of `iptables`.
    pub iptables_command: PathBuf,

    /// Base of the pool point-to-point links are carved from.
    pub address_pool: Ipv4Addr,

    /// Prefix length of the pool.
    pub address_pool_prefix: u8,

    /// Prefix of namespace names.
    pub name_prefix: String,
}

impl NamespaceConfig {
    /// Number of /30 links available in the pool.
    pub fn link_count(&self) -> u64 {
        if self.address_pool_prefix > 30 {
            return 0;
        }
        1u64 << (30 - self.address_pool_prefix as u32)
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            ip_command: PathBuf::from("/sbin/ip"),
            iptables_command: PathBuf::from("/sbin/iptables"),
            address_pool: Ipv4Addr::new(100, 64, 0, 0),
            address_pool_prefix: 10,
            name_prefix: "render".to_string(),
        }
    }
}

/// Recording configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Directory session files are written to.
    pub store_dir: PathBuf,

    /// Grace period for intercepted flows after the renderer exits.
    pub drain_timeout_ms: u64,

    /// Timeout for connecting to the original destination.
    pub connect_timeout_ms: u64,

    /// Size of each relay read.
    pub relay_buffer_bytes: usize,

    /// Chunks a session may have queued for its writer. Chunks arriving
    /// while the queue is full are dropped and counted.
    pub queue_chunks: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./recordings"),
            drain_timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
            relay_buffer_bytes: 16 * 1024,
            queue_chunks: 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "render_proxy=info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
