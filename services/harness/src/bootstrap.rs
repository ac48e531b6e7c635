//! Bootstrap document and the sentinel-file job protocol.
//!
//! A bootstrap job runs detached on the host. It signals the outcome by
//! creating one of two sentinel files:
//!
//! - `/tmp/<job>_complete`: finished successfully
//! - `/tmp/<job>_failed`: finished with an error
//!
//! Neither file means the job is still running. The job's output goes to
//! `/tmp/<job>.log` and its input document is `/tmp/<job>_config.json`.

use std::collections::BTreeMap;
use std::fmt;

use hostpool_remote::shell_quote;
use serde::{Deserialize, Serialize};

use crate::certs::RemoteCertPaths;
use crate::config::AdminCredentials;
use crate::role::Role;

/// Observed state of a bootstrap job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Running,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::NotStarted => "not-started",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A host-side job identified by its sentinel-file prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BootstrapJob {
    name: String,
}

impl BootstrapJob {
    /// The bootstrap job of a host. Host names are unique per pool, so are
    /// the sentinel paths.
    pub fn for_host(host_name: &str) -> Self {
        Self {
            name: format!("{host_name}_bootstrap"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn complete_path(&self) -> String {
        format!("/tmp/{}_complete", self.name)
    }

    pub fn failed_path(&self) -> String {
        format!("/tmp/{}_failed", self.name)
    }

    pub fn log_path(&self) -> String {
        format!("/tmp/{}.log", self.name)
    }

    pub fn config_path(&self) -> String {
        format!("/tmp/{}_config.json", self.name)
    }

    /// Start `command` detached.
    ///
    /// Stale sentinels from an earlier attempt are removed in the foreground,
    /// so relaunching a job is safe and a probe issued after this command
    /// returns never sees them. Only the job itself is backgrounded, with every
    /// standard stream redirected, so the remote session closes immediately.
    pub fn launch_command(&self, command: &str) -> String {
        let complete = self.complete_path();
        let failed = self.failed_path();
        let log = self.log_path();
        let script = format!(
            "{command} >> {log} 2>&1 && touch {complete} || touch {failed}",
            log = shell_quote(&log),
            complete = shell_quote(&complete),
            failed = shell_quote(&failed),
        );
        format!(
            "rm -f {complete} {failed} && : > {log} && \
             {{ nohup sh -c {script} < /dev/null > /dev/null 2>&1 & }}",
            complete = shell_quote(&complete),
            failed = shell_quote(&failed),
            log = shell_quote(&log),
            script = shell_quote(&script),
        )
    }

    /// Print the job state; the failure sentinel is checked first.
    pub fn probe_command(&self) -> String {
        format!(
            "if [ -e {failed} ]; then echo failed; \
             elif [ -e {complete} ]; then echo complete; \
             elif [ -e {log} ]; then echo running; \
             else echo not-started; fi",
            failed = shell_quote(&self.failed_path()),
            complete = shell_quote(&self.complete_path()),
            log = shell_quote(&self.log_path()),
        )
    }

    /// Interpret the output of [`probe_command`](Self::probe_command).
    pub fn parse_probe(output: &str) -> Option<JobState> {
        match output.trim() {
            "failed" => Some(JobState::Failed),
            "complete" => Some(JobState::Done),
            "running" => Some(JobState::Running),
            "not-started" => Some(JobState::NotStarted),
            _ => None,
        }
    }

    /// Remove every file the job created.
    pub fn cleanup_command(&self) -> String {
        format!(
            "rm -f {} {} {} {}",
            shell_quote(&self.complete_path()),
            shell_quote(&self.failed_path()),
            shell_quote(&self.log_path()),
            shell_quote(&self.config_path()),
        )
    }
}

/// Input document of the bootstrap command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub role: Role,
    pub node_name: String,
    pub networking: NetworkingConfig,
    pub security: SecurityConfig,

    /// Absent for standalone hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,

    /// Optional services to enable or disable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkingConfig {
    pub public_address: String,
    pub private_address: String,
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub admin_username: String,
    pub admin_password: String,
    pub ca_cert_path: String,
    pub cert_path: String,
    pub key_path: String,
}

impl SecurityConfig {
    pub fn new(admin: &AdminCredentials, certs: &RemoteCertPaths) -> Self {
        Self {
            admin_username: admin.username.clone(),
            admin_password: admin.password.clone(),
            ca_cert_path: certs.ca_cert.clone(),
            cert_path: certs.cert.clone(),
            key_path: certs.key.clone(),
        }
    }
}

/// Cluster membership. Every list holds all members of that role,
/// including the host itself when it has the role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub brokers: Vec<PeerConfig>,
    pub databases: Vec<PeerConfig>,
    pub managers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub private_address: String,
    pub public_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths_are_per_host() {
        let a = BootstrapJob::for_host("manager-0");
        let b = BootstrapJob::for_host("manager-1");

        assert_eq!(a.complete_path(), "/tmp/manager-0_bootstrap_complete");
        assert_eq!(a.failed_path(), "/tmp/manager-0_bootstrap_failed");
        assert_eq!(a.log_path(), "/tmp/manager-0_bootstrap.log");
        assert_eq!(a.config_path(), "/tmp/manager-0_bootstrap_config.json");
        assert_ne!(a.complete_path(), b.complete_path());
    }

    #[test]
    fn test_probe_checks_failed_first() {
        let probe = BootstrapJob::for_host("db-0").probe_command();
        let failed = probe.find("_failed").unwrap();
        let complete = probe.find("_complete").unwrap();
        assert!(failed < complete);
    }

    #[test]
    fn test_launch_removes_stale_sentinels_before_starting() {
        let job = BootstrapJob::for_host("broker-0");
        let launch = job.launch_command("svcctl install --config /tmp/broker-0_bootstrap_config.json");

        assert!(launch.starts_with(
            "rm -f /tmp/broker-0_bootstrap_complete /tmp/broker-0_bootstrap_failed"
        ));
        assert!(launch.contains("{ nohup sh -c '"));
        assert!(launch.contains("< /dev/null > /dev/null 2>&1 & }"));
    }

    #[test]
    fn test_parse_probe() {
        assert_eq!(BootstrapJob::parse_probe("failed\n"), Some(JobState::Failed));
        assert_eq!(BootstrapJob::parse_probe("complete"), Some(JobState::Done));
        assert_eq!(BootstrapJob::parse_probe("running"), Some(JobState::Running));
        assert_eq!(BootstrapJob::parse_probe("garbage"), None);
    }

    #[test]
    fn test_config_document_shape() {
        let config = BootstrapConfig {
            role: Role::Manager,
            node_name: "manager-0".into(),
            networking: NetworkingConfig {
                public_address: "192.0.2.3".into(),
                private_address: "10.0.0.3".into(),
                networks: BTreeMap::new(),
            },
            security: SecurityConfig {
                admin_username: "admin".into(),
                admin_password: "pw".into(),
                ca_cert_path: "/etc/hostpool/ssl/ca.crt".into(),
                cert_path: "/etc/hostpool/ssl/host.crt".into(),
                key_path: "/etc/hostpool/ssl/host.key".into(),
            },
            cluster: Some(ClusterConfig {
                brokers: vec![PeerConfig {
                    name: "broker-0".into(),
                    private_address: "10.0.0.1".into(),
                    public_address: "192.0.2.1".into(),
                }],
                ..ClusterConfig::default()
            }),
            services: BTreeMap::new(),
        };

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["role"], json!("manager"));
        assert_eq!(value["cluster"]["brokers"][0]["private_address"], json!("10.0.0.1"));
        assert!(value.get("services").is_none());

        let parsed: BootstrapConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config);
    }
}
