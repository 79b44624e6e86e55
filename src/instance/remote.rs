//! Remote backend: pre-existing hosts, one claim per instance.
//!
//! Provisioning a remote instance allocates nothing; it claims a configured
//! host that no other worker is using and checks that its management port
//! accepts connections. Teardown releases the claim and leaves the host
//! running.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{BackendKind, InfraError, InfraResult, InstanceBackend, InstanceSpec};
use crate::config::RemoteBackendConfig;

/// Hands out configured hosts, at most one worker per host.
pub struct RemoteHostBackend {
    hosts: Vec<String>,
    claimed: Mutex<HashSet<String>>,
    connect_timeout: Duration,
}

impl RemoteHostBackend {
    /// Creates a backend over the configured hosts.
    pub fn new(config: &RemoteBackendConfig) -> Self {
        let hosts = config
            .hosts
            .iter()
            .map(|host| with_port(host, config.api_port))
            .collect();
        Self {
            hosts,
            claimed: Mutex::new(HashSet::new()),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Configured hosts as `host:port`.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Number of hosts currently claimed.
    pub fn claimed(&self) -> usize {
        self.claimed.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn claim_next(&self, skip: &HashSet<String>) -> InfraResult<Option<String>> {
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|_| InfraError::ProvisionFailed("host registry poisoned".into()))?;
        let next = self
            .hosts
            .iter()
            .find(|h| !claimed.contains(*h) && !skip.contains(*h))
            .cloned();
        if let Some(host) = &next {
            claimed.insert(host.clone());
        }
        Ok(next)
    }

    fn release(&self, host: &str) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(host);
        }
    }

    async fn reachable(&self, address: &str) -> Result<(), String> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", self.connect_timeout)),
        }
    }
}

#[async_trait]
impl InstanceBackend for RemoteHostBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn create(&self, spec: &InstanceSpec) -> InfraResult<String> {
        let mut unreachable = HashSet::new();
        while let Some(host) = self.claim_next(&unreachable)? {
            match self.reachable(&host).await {
                Ok(()) => {
                    debug!("Claimed remote host {} for {}", host, spec.name);
                    return Ok(host);
                }
                Err(e) => {
                    warn!("Remote host {} is unreachable: {}", host, e);
                    self.release(&host);
                    unreachable.insert(host);
                }
            }
        }

        if unreachable.is_empty() {
            Err(InfraError::NoHostAvailable(format!(
                "all {} host(s) are in use",
                self.hosts.len()
            )))
        } else {
            Err(InfraError::Connection(format!(
                "no reachable host among {}",
                unreachable.into_iter().collect::<Vec<_>>().join(", ")
            )))
        }
    }

    async fn address(&self, handle: &str) -> InfraResult<String> {
        Ok(handle.to_string())
    }

    async fn destroy(&self, handle: &str) -> InfraResult<()> {
        self.release(handle);
        debug!("Released remote host {}", handle);
        Ok(())
    }
}

/// Appends `port` unless `host` already names one.
fn with_port(host: &str, port: u16) -> String {
    let host = host.trim();
    let has_port = match host.rsplit_once(':') {
        // Bracketed IPv6 with a port: `[::1]:8089`.
        Some((h, p)) if h.ends_with(']') => p.parse::<u16>().is_ok(),
        // Bare IPv6 has several colons and no port.
        Some((h, p)) => !h.contains(':') && p.parse::<u16>().is_ok(),
        None => false,
    };
    if has_port {
        host.to_string()
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
