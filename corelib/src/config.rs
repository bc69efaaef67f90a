//! Configuration loading for the transport core. Mirrors the
//! `serdeconv`-based TOML loading used for the logger config: a plain serde
//! struct, read from a file or string, with defaults for everything optional.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Top level configuration for a running EventLoop + ConnectionManager stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Clamp applied to OPN-requested SecureChannel lifetimes, in milliseconds.
    #[serde(default = "default_channel_lifetime_ms")]
    pub channel_lifetime_ms: u32,

    /// Bound on the poll/retry loop used by non-blocking send paths, in milliseconds.
    #[serde(default = "default_send_retry_bound_ms")]
    pub send_retry_bound_ms: u32,

    #[serde(default)]
    pub tcp: TcpDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpDefaults {
    #[serde(default = "default_recv_bufsize")]
    pub recv_bufsize: u32,
    #[serde(default = "default_send_bufsize")]
    pub send_bufsize: u32,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
}

impl Default for TcpDefaults {
    fn default() -> Self {
        TcpDefaults {
            recv_bufsize: default_recv_bufsize(),
            send_bufsize: default_send_bufsize(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            log_level: default_log_level(),
            channel_lifetime_ms: default_channel_lifetime_ms(),
            send_retry_bound_ms: default_send_retry_bound_ms(),
            tcp: TcpDefaults::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_channel_lifetime_ms() -> u32 {
    600_000
}

fn default_send_retry_bound_ms() -> u32 {
    100
}

fn default_recv_bufsize() -> u32 {
    65536
}

fn default_send_bufsize() -> u32 {
    65536
}

fn default_listen_backlog() -> u32 {
    128
}

impl RuntimeConfig {
    pub fn from_toml_str(toml: &str) -> Result<RuntimeConfig, serdeconv::Error> {
        serdeconv::from_toml_str(toml)
    }

    pub fn from_file(path: &Path) -> Result<RuntimeConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_nothing_specified() {
        let cfg = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.channel_lifetime_ms, 600_000);
        assert_eq!(cfg.tcp.recv_bufsize, 65536);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = RuntimeConfig::from_toml_str("channel_lifetime_ms = 30000\n[tcp]\nrecv_bufsize = 4096\n").unwrap();
        assert_eq!(cfg.channel_lifetime_ms, 30_000);
        assert_eq!(cfg.tcp.recv_bufsize, 4096);
        assert_eq!(cfg.tcp.send_bufsize, 65536);
    }
}
