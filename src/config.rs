//! Daemon configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pty::HostEntry;

/// Top-level configuration for the live layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub terminal: TerminalConfig,
    /// JSON file with host entries, merged over `hosts`.
    pub hosts_file: Option<PathBuf>,
    /// Inline host entries keyed by host ref.
    pub hosts: HashMap<String, HostEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `3031`).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3031,
        }
    }
}

/// Broadcast hub tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-connection outgoing buffer capacity (frames).
    pub buffer_capacity: usize,
    /// Keepalive interval in seconds.
    pub keepalive_interval_secs: u64,
    /// How long a connection may sit on unflushed frames before it is closed.
    pub flush_grace_secs: u64,
    /// Event types whose loss closes the connection instead of dropping.
    pub critical_event_types: HashSet<String>,
    /// Capacity of the in-process event bus.
    pub bus_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            keepalive_interval_secs: 30,
            flush_grace_secs: 10,
            critical_event_types: HashSet::new(),
            bus_capacity: 1024,
        }
    }
}

impl HubConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::from_secs(self.flush_grace_secs.max(1))
    }
}

/// Which process backend terminal sessions use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TerminalBackend {
    /// Native pseudo-terminal via `portable-pty`.
    #[default]
    Pty,
    /// Piped stdio wrapped by the platform `script` strategy.
    Pipe,
}

/// Terminal session tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Idle timeout in seconds, `0` disables it.
    pub idle_timeout_secs: u64,
    /// Grace between the terminate signal and the forced kill.
    pub kill_grace_ms: u64,
    /// Output chunks buffered per session before the reader blocks.
    pub output_buffer: usize,
    pub backend: TerminalBackend,
    pub cols: u16,
    pub rows: u16,
    /// TCP probe timeout for SSH hosts, `0` disables probing.
    pub probe_timeout_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            kill_grace_ms: 3000,
            output_buffer: 256,
            backend: TerminalBackend::Pty,
            cols: 80,
            rows: 24,
            probe_timeout_ms: 3000,
        }
    }
}

impl TerminalConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        (self.probe_timeout_ms > 0).then(|| Duration::from_millis(self.probe_timeout_ms))
    }
}

impl LiveConfig {
    /// Load a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Inline hosts plus the entries of `hosts_file`, file entries winning.
    pub fn resolved_hosts(&self) -> Result<HashMap<String, HostEntry>> {
        let mut hosts = self.hosts.clone();
        if let Some(path) = &self.hosts_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read hosts file {}", path.display()))?;
            let from_file: HashMap<String, HostEntry> = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse hosts file {}", path.display()))?;
            hosts.extend(from_file);
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_dashboard_timings() {
        let cfg = LiveConfig::default();
        assert_eq!(cfg.hub.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(
            cfg.terminal.idle_timeout(),
            Some(Duration::from_secs(30 * 60))
        );
        assert_eq!(cfg.terminal.backend, TerminalBackend::Pty);
        assert_eq!((cfg.terminal.cols, cfg.terminal.rows), (80, 24));
    }

    #[test]
    fn zero_disables_idle_timeout_and_probe() {
        let cfg = TerminalConfig {
            idle_timeout_secs: 0,
            probe_timeout_ms: 0,
            ..TerminalConfig::default()
        };
        assert!(cfg.idle_timeout().is_none());
        assert!(cfg.probe_timeout().is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"hub":{"buffer_capacity":10,"critical_event_types":["audit-entry-created"]},"terminal":{"backend":"pipe"}}"#;
        let cfg: LiveConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.hub.buffer_capacity, 10);
        assert!(cfg.hub.critical_event_types.contains("audit-entry-created"));
        assert_eq!(cfg.hub.keepalive_interval_secs, 30);
        assert_eq!(cfg.terminal.backend, TerminalBackend::Pipe);
        assert_eq!(cfg.server.port, 3031);
    }

    #[test]
    fn hosts_file_overrides_inline_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"h1":{{"kind":"local","command":"/bin/cat"}},"h2":{{"kind":"ssh","host":"10.0.0.2","username":"root","key_path":"/root/.ssh/id_rsa_dashboard"}}}}"#
        )
        .unwrap();

        let mut cfg = LiveConfig::default();
        cfg.hosts.insert(
            "h1".into(),
            HostEntry::Local {
                command: "/bin/sh".into(),
                args: vec![],
                cwd: None,
                platform: None,
            },
        );
        cfg.hosts_file = Some(file.path().to_path_buf());

        let hosts = cfg.resolved_hosts().unwrap();
        assert_eq!(hosts.len(), 2);
        assert!(matches!(
            &hosts["h1"],
            HostEntry::Local { command, .. } if command == "/bin/cat"
        ));
        assert!(matches!(&hosts["h2"], HostEntry::Ssh { port: 22, .. }));
    }

    #[test]
    fn missing_hosts_file_is_an_error() {
        let cfg = LiveConfig {
            hosts_file: Some(PathBuf::from("/nonexistent/hosts.json")),
            ..LiveConfig::default()
        };
        assert!(cfg.resolved_hosts().is_err());
    }
}
