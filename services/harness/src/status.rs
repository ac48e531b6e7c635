//! Status helpers for tests running against a pool.

use std::collections::BTreeMap;
use std::fmt;

use hostpool_retry::{poll_until, Poll, PollError, RetryPolicy};
use hostpool_remote::RunOptions;
use serde::Deserialize;
use tabled::{Table, Tabled};
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::host::{Host, HostState};
use crate::pool::HostPool;
use crate::role::Role;

const HEALTHY_STATUSES: &[&str] = &["running", "active", "healthy"];

/// Parsed output of the service status command:
/// `{"services": {"<name>": {"status": "<status>"}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceState {
    pub status: String,
}

impl ServiceStatus {
    pub fn parse(output: &str) -> Result<Self> {
        Ok(serde_json::from_str(output.trim())?)
    }

    /// Status of one service, if reported.
    pub fn service(&self, name: &str) -> Option<&str> {
        self.services.get(name).map(|s| s.status.as_str())
    }

    /// Services not in a healthy status.
    pub fn unhealthy(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, state)| !is_healthy_status(&state.status))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// True when at least one service is reported and all are healthy.
    pub fn is_healthy(&self) -> bool {
        !self.services.is_empty() && self.unhealthy().is_empty()
    }
}

fn is_healthy_status(status: &str) -> bool {
    HEALTHY_STATUSES.contains(&status.to_ascii_lowercase().as_str())
}

/// Wait until `service` reports a healthy status on `host`.
pub async fn wait_for_service(host: &Host, service: &str, policy: &RetryPolicy) -> Result<()> {
    let status_command = host.settings().commands.status.clone();
    let operation = format!("wait for {service}");

    let result = poll_until(policy, &operation, || {
        let status_command = status_command.as_str();
        async move {
            let output = host
                .run_command(status_command, &RunOptions::new().elevated().warn_only())
                .await?;
            let status = ServiceStatus::parse(&output.stdout).unwrap_or_default();
            match status.service(service) {
                Some(s) if is_healthy_status(s) => Ok::<_, HarnessError>(Poll::Ready(())),
                current => {
                    debug!(host = %host.name(), service, status = ?current, "Service not ready");
                    Ok(Poll::Pending)
                }
            }
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(PollError::Exhausted { operation, attempts }) => Err(HarnessError::Timeout {
            host: host.name().to_string(),
            operation,
            attempts,
        }),
        Err(PollError::Failed(e)) => Err(e),
    }
}

/// One row of a pool summary.
#[derive(Debug, Clone, PartialEq, Eq, Tabled)]
pub struct HostSummary {
    #[tabled(rename = "Name")]
    pub name: String,

    #[tabled(rename = "Role")]
    pub role: Role,

    #[tabled(rename = "State")]
    pub state: HostState,

    #[tabled(rename = "Public IP", display = "display_option")]
    pub public_ip: Option<String>,

    #[tabled(rename = "Private IP", display = "display_option")]
    pub private_ip: Option<String>,
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

impl fmt::Display for HostSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {} public={} private={}",
            self.name,
            self.role,
            self.state,
            display_option(&self.public_ip),
            display_option(&self.private_ip)
        )
    }
}

/// Hosts of a pool, rendered as a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    pub namespace: String,
    pub hosts: Vec<HostSummary>,
}

impl fmt::Display for PoolSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "namespace: {}", self.namespace)?;
        write!(f, "{}", Table::new(&self.hosts))
    }
}

pub fn host_summary(host: &Host) -> HostSummary {
    HostSummary {
        name: host.name().to_string(),
        role: host.role(),
        state: host.state(),
        public_ip: host.ip_address().ok().map(str::to_string),
        private_ip: host.private_ip_address().ok().map(str::to_string),
    }
}

pub fn pool_summary(pool: &HostPool) -> PoolSummary {
    PoolSummary {
        namespace: pool.namespace().to_string(),
        hosts: pool.hosts().iter().map(host_summary).collect(),
    }
}
