//! Host resolution: `hostRef` → the command that opens a shell on it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use super::platform::Platform;
use crate::errors::{LiveError, LiveResult};

fn default_ssh_port() -> u16 {
    22
}

/// A configured terminal target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostEntry {
    /// Remote appliance reached over SSH with a per-host key.
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        key_path: PathBuf,
        #[serde(default)]
        platform: Option<Platform>,
    },
    /// Command run on this machine.
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        platform: Option<Platform>,
    },
}

/// What a session should run for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host_ref: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Platform whose wrapping strategy applies.
    pub platform: Platform,
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host_ref: &str) -> LiveResult<HostTarget>;
}

/// Resolver over a fixed table of host entries.
pub struct StaticHostResolver {
    hosts: HashMap<String, HostEntry>,
    probe_timeout: Option<Duration>,
    local_platform: Platform,
}

impl StaticHostResolver {
    pub fn new(hosts: HashMap<String, HostEntry>, probe_timeout: Option<Duration>) -> Self {
        Self {
            hosts,
            probe_timeout,
            local_platform: Platform::current(),
        }
    }

    pub fn host_refs(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }
}

/// Arguments for an interactive, non-prompting SSH session.
pub fn ssh_args(host: &str, port: u16, username: &str, key_path: &std::path::Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-tt".into(), "-o".into(), "RequestTTY=force".into()];
    args.push("-i".into());
    args.push(key_path.display().to_string());
    for option in [
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
        "LogLevel=QUIET",
        "ConnectTimeout=10",
        "ServerAliveInterval=30",
        "ServerAliveCountMax=3",
    ] {
        args.push("-o".into());
        args.push(option.into());
    }
    args.push("-p".into());
    args.push(port.to_string());
    args.push(format!("{username}@{host}"));
    args
}

async fn probe(host: &str, port: u16, limit: Duration) -> LiveResult<()> {
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(LiveError::HostUnreachable(format!(
            "{host}:{port} unreachable: {e}"
        ))),
        Err(_) => Err(LiveError::HostUnreachable(format!(
            "{host}:{port} did not answer within {}ms",
            limit.as_millis()
        ))),
    }
}

#[async_trait]
impl HostResolver for StaticHostResolver {
    async fn resolve(&self, host_ref: &str) -> LiveResult<HostTarget> {
        let entry = self
            .hosts
            .get(host_ref)
            .ok_or_else(|| LiveError::HostUnreachable(format!("unknown host {host_ref}")))?;

        match entry {
            HostEntry::Ssh {
                host,
                port,
                username,
                key_path,
                platform,
            } => {
                if !tokio::fs::try_exists(key_path).await.unwrap_or(false) {
                    return Err(LiveError::HostUnreachable(format!(
                        "SSH key not found: {}",
                        key_path.display()
                    )));
                }
                if let Some(limit) = self.probe_timeout {
                    probe(host, *port, limit).await?;
                }
                debug!(host_ref, host = %host, port, "[hosts] resolved ssh target");
                Ok(HostTarget {
                    host_ref: host_ref.to_string(),
                    command: "ssh".into(),
                    args: ssh_args(host, *port, username, key_path),
                    env: BTreeMap::new(),
                    cwd: None,
                    platform: platform.unwrap_or(self.local_platform),
                })
            }
            HostEntry::Local {
                command,
                args,
                cwd,
                platform,
            } => Ok(HostTarget {
                host_ref: host_ref.to_string(),
                command: command.clone(),
                args: args.clone(),
                env: BTreeMap::new(),
                cwd: cwd.clone(),
                platform: platform.unwrap_or(self.local_platform),
            }),
        }
    }
}
