//! Configuration for the harness.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hostpool_infra::InfraConfig;
use hostpool_retry::RetryPolicy;

/// What to do with a pool after the test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeepPolicy {
    /// Always destroy.
    #[default]
    Never,
    /// Keep the hosts of failed runs for inspection.
    OnFailure,
    /// Never destroy.
    Always,
}

impl KeepPolicy {
    pub fn should_keep(&self, passed: bool) -> bool {
        match self {
            KeepPolicy::Never => false,
            KeepPolicy::OnFailure => !passed,
            KeepPolicy::Always => true,
        }
    }
}

impl FromStr for KeepPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(KeepPolicy::Never),
            "on-failure" => Ok(KeepPolicy::OnFailure),
            "always" => Ok(KeepPolicy::Always),
            other => Err(anyhow!(
                "invalid keep policy '{other}' (expected never, on-failure or always)"
            )),
        }
    }
}

/// Bounds of every polling loop the harness runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Infra `install` jobs.
    pub provisioning: RetryPolicy,
    /// Host-side bootstrap sentinels.
    pub bootstrap: RetryPolicy,
    /// Convergence of cancelled server-side jobs.
    pub cancellation: RetryPolicy,
    /// Service health after bootstrap.
    pub health: RetryPolicy,
    /// Remote channel reconnects.
    pub reconnect: RetryPolicy,
    /// Infra `uninstall` jobs.
    pub uninstall: RetryPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            provisioning: RetryPolicy::new(90, Duration::from_secs(10)),
            bootstrap: RetryPolicy::new(180, Duration::from_secs(10)),
            cancellation: RetryPolicy::new(30, Duration::from_secs(5)),
            health: RetryPolicy::new(60, Duration::from_secs(5)),
            reconnect: RetryPolicy::new(5, Duration::from_secs(3)),
            uninstall: RetryPolicy::new(60, Duration::from_secs(10)),
        }
    }
}

impl PollSettings {
    /// The same bound for every loop.
    pub fn uniform(max_attempts: u32, delay: Duration) -> Self {
        let policy = RetryPolicy::new(max_attempts, delay);
        Self {
            provisioning: policy,
            bootstrap: policy,
            cancellation: policy,
            health: policy,
            reconnect: policy,
            uninstall: policy,
        }
    }
}

/// Host-side commands of the service under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapCommands {
    /// Install and configure; `{config}` is replaced by the document path.
    pub install: String,
    /// Remove the service and its runtime state.
    pub uninstall: String,
    /// Print service status as JSON.
    pub status: String,
    /// File the service creates once its own setup has finished.
    pub setup_marker: String,
}

impl Default for BootstrapCommands {
    fn default() -> Self {
        Self {
            install: "svcctl install --config {config}".to_string(),
            uninstall: "svcctl remove --force".to_string(),
            status: "svcctl status --json".to_string(),
            setup_marker: "/var/lib/svc/setup_finished".to_string(),
        }
    }
}

impl BootstrapCommands {
    pub fn install_command(&self, config_path: &str) -> String {
        self.install.replace("{config}", config_path)
    }
}

/// Credentials the bootstrap creates for the service's admin user.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How hosts are reached and driven.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub ssh_user: String,
    pub windows_user: String,
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: u16,
    pub commands: BootstrapCommands,
    pub poll: PollSettings,
}

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub infra: InfraConfig,

    /// VM template (blueprint) every host deployment is created from.
    pub template_id: String,
    pub linux_image: String,
    pub windows_image: String,
    pub flavor: String,

    pub ssh_user: String,
    pub windows_user: String,
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: u16,

    pub admin: AdminCredentials,
    pub keep: KeepPolicy,
    pub log_json: bool,

    pub poll: PollSettings,
    pub commands: BootstrapCommands,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            infra: InfraConfig::default(),
            template_id: "test-vm".to_string(),
            linux_image: "rhel-8".to_string(),
            windows_image: "windows-2019".to_string(),
            flavor: "m1.large".to_string(),
            ssh_user: "centos".to_string(),
            windows_user: "Administrator".to_string(),
            ssh_key: None,
            ssh_port: 22,
            admin: AdminCredentials {
                username: "admin".to_string(),
                password: generate_password(),
            },
            keep: KeepPolicy::Never,
            log_json: false,
            poll: PollSettings::default(),
            commands: BootstrapCommands::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from `HOSTPOOL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |name: &str, default: String| lookup(name).unwrap_or(default);

        let infra = InfraConfig {
            url: string("HOSTPOOL_INFRA_URL", defaults.infra.url),
            username: string("HOSTPOOL_INFRA_USER", defaults.infra.username),
            password: string("HOSTPOOL_INFRA_PASSWORD", defaults.infra.password),
            insecure: parse_var(&lookup, "HOSTPOOL_INFRA_INSECURE", defaults.infra.insecure)?,
            request_timeout: defaults.infra.request_timeout,
        };

        let mut poll = defaults.poll;
        poll.bootstrap = RetryPolicy::new(
            parse_var(
                &lookup,
                "HOSTPOOL_BOOTSTRAP_POLL_ATTEMPTS",
                poll.bootstrap.max_attempts,
            )?,
            Duration::from_secs(parse_var(
                &lookup,
                "HOSTPOOL_BOOTSTRAP_POLL_SECS",
                poll.bootstrap.delay.as_secs(),
            )?),
        );

        let commands = BootstrapCommands {
            install: string("HOSTPOOL_BOOTSTRAP_COMMAND", defaults.commands.install),
            uninstall: string("HOSTPOOL_UNINSTALL_COMMAND", defaults.commands.uninstall),
            status: string("HOSTPOOL_STATUS_COMMAND", defaults.commands.status),
            setup_marker: string("HOSTPOOL_SETUP_MARKER", defaults.commands.setup_marker),
        };

        let keep = match lookup("HOSTPOOL_KEEP") {
            Some(value) => value.parse().context("HOSTPOOL_KEEP")?,
            None => defaults.keep,
        };

        Ok(Self {
            infra,
            template_id: string("HOSTPOOL_TEMPLATE", defaults.template_id),
            linux_image: string("HOSTPOOL_IMAGE_LINUX", defaults.linux_image),
            windows_image: string("HOSTPOOL_IMAGE_WINDOWS", defaults.windows_image),
            flavor: string("HOSTPOOL_FLAVOR", defaults.flavor),
            ssh_user: string("HOSTPOOL_SSH_USER", defaults.ssh_user),
            windows_user: string("HOSTPOOL_WINDOWS_USER", defaults.windows_user),
            ssh_key: lookup("HOSTPOOL_SSH_KEY").map(PathBuf::from),
            ssh_port: parse_var(&lookup, "HOSTPOOL_SSH_PORT", defaults.ssh_port)?,
            admin: AdminCredentials {
                username: string("HOSTPOOL_ADMIN_USER", defaults.admin.username),
                password: string("HOSTPOOL_ADMIN_PASSWORD", defaults.admin.password),
            },
            keep,
            log_json: parse_var(&lookup, "HOSTPOOL_LOG_JSON", defaults.log_json)?,
            poll,
            commands,
        })
    }

    /// Settings handed to every host of a pool.
    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            ssh_user: self.ssh_user.clone(),
            windows_user: self.windows_user.clone(),
            ssh_key: self.ssh_key.clone(),
            ssh_port: self.ssh_port,
            commands: self.commands.clone(),
            poll: self.poll,
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow!("invalid value '{value}' for {name}: {e}")),
        None => Ok(default),
    }
}

fn generate_password() -> String {
    ulid::Ulid::new().to_string().to_ascii_lowercase()
}
