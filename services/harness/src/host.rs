//! A single pool host.
//!
//! A host moves through
//! `unprovisioned -> addressed -> configuring -> ready -> stopped -> torn-down`,
//! with `configuring -> failed` terminal. Hosts without a bootstrap go from
//! `addressed` straight to `ready`.
//!
//! All operations take `&self`; state lives behind a lock that is never held
//! across a remote call, so a pool can poll many hosts from one task.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use hostpool_remote::{shell_quote, CommandOutput, Connector, RemoteChannel, RunOptions, Target};
use hostpool_retry::{poll_until, Poll, PollError, RetryPolicy};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapConfig, BootstrapJob, JobState};
use crate::certs::{HostCertificates, RemoteCertPaths, REMOTE_CERT_DIR};
use crate::config::HostSettings;
use crate::error::{HarnessError, Result};
use crate::role::{HostSpec, OsFamily, Role};
use crate::status::{wait_for_service, ServiceStatus};

/// Lines of the bootstrap log included in failure diagnostics.
const DIAGNOSTIC_LOG_LINES: u32 = 100;

/// Lifecycle state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostState {
    Unprovisioned,
    Addressed,
    Configuring,
    Ready,
    Stopped,
    TornDown,
    Failed,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Unprovisioned => "unprovisioned",
            HostState::Addressed => "addressed",
            HostState::Configuring => "configuring",
            HostState::Ready => "ready",
            HostState::Stopped => "stopped",
            HostState::TornDown => "torn-down",
            HostState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Addresses the infra server reported for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddresses {
    pub public: String,
    pub private: String,
    pub networks: BTreeMap<String, String>,

    /// Opaque server id from the infra backend.
    pub server_id: Option<String>,
}

#[derive(Debug)]
struct HostStatus {
    state: HostState,
    bootstrap_config: Option<BootstrapConfig>,
    bootstrap_started_at: Option<DateTime<Utc>>,
    bootstrap_finished_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

/// One machine in a pool.
pub struct Host {
    spec: HostSpec,
    job: BootstrapJob,
    settings: HostSettings,
    connector: Arc<dyn Connector>,
    addresses: OnceLock<HostAddresses>,
    channel: OnceLock<RemoteChannel>,
    status: Mutex<HostStatus>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("spec", &self.spec)
            .field("addresses", &self.addresses.get())
            .field("status", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(spec: HostSpec, settings: HostSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            job: BootstrapJob::for_host(&spec.name),
            spec,
            settings,
            connector,
            addresses: OnceLock::new(),
            channel: OnceLock::new(),
            status: Mutex::new(HostStatus {
                state: HostState::Unprovisioned,
                bootstrap_config: None,
                bootstrap_started_at: None,
                bootstrap_finished_at: None,
                failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn role(&self) -> Role {
        self.spec.role
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn job(&self) -> &BootstrapJob {
        &self.job
    }

    pub fn state(&self) -> HostState {
        self.lock().state
    }

    /// When the bootstrap was launched.
    pub fn bootstrap_started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().bootstrap_started_at
    }

    /// When the bootstrap was observed complete.
    pub fn bootstrap_finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().bootstrap_finished_at
    }

    /// The document the bootstrap was launched with.
    pub fn bootstrap_config(&self) -> Option<BootstrapConfig> {
        self.lock().bootstrap_config.clone()
    }

    pub fn addresses(&self) -> Result<&HostAddresses> {
        self.addresses.get().ok_or_else(|| self.invalid_state("not provisioned yet"))
    }

    /// Externally reachable address.
    pub fn ip_address(&self) -> Result<&str> {
        Ok(&self.addresses()?.public)
    }

    /// Address on the pool's private network.
    pub fn private_ip_address(&self) -> Result<&str> {
        Ok(&self.addresses()?.private)
    }

    pub fn server_id(&self) -> Option<&str> {
        self.addresses.get().and_then(|a| a.server_id.as_deref())
    }

    /// Fill in addressing once the infra server reports it.
    ///
    /// Calling this twice is an error.
    pub fn assign(&self, addresses: HostAddresses) -> Result<()> {
        if self.state() != HostState::Unprovisioned {
            return Err(self.invalid_state("addresses already assigned"));
        }

        let user = match self.spec.os {
            OsFamily::Linux => &self.settings.ssh_user,
            OsFamily::Windows => &self.settings.windows_user,
        };
        let mut target = Target::new(&addresses.public, user)
            .with_port(self.settings.ssh_port)
            .with_shell(self.spec.os.shell());
        if let Some(key) = &self.settings.ssh_key {
            target = target.with_key(key);
        }

        info!(
            host = %self.name(),
            public_ip = %addresses.public,
            private_ip = %addresses.private,
            server_id = ?addresses.server_id,
            "Host addressed"
        );

        self.addresses
            .set(addresses)
            .map_err(|_| self.invalid_state("addresses already assigned"))?;
        let channel = RemoteChannel::new(target, self.connector.clone(), self.settings.poll.reconnect);
        self.channel
            .set(channel)
            .map_err(|_| self.invalid_state("channel already open"))?;

        self.transition(&[HostState::Unprovisioned], HostState::Addressed)?;
        if !self.role().needs_bootstrap() {
            self.transition(&[HostState::Addressed], HostState::Ready)?;
        }
        Ok(())
    }

    fn channel(&self) -> Result<&RemoteChannel> {
        self.channel.get().ok_or_else(|| self.invalid_state("not provisioned yet"))
    }

    /// Run a command on the host.
    pub async fn run_command(&self, command: &str, options: &RunOptions) -> Result<CommandOutput> {
        self.channel()?
            .run(command, options)
            .await
            .map_err(|e| HarnessError::remote(self.name(), e))
    }

    pub async fn get_remote_file_content(&self, path: &str) -> Result<String> {
        self.channel()?
            .read_file(path)
            .await
            .map_err(|e| HarnessError::remote(self.name(), e))
    }

    pub async fn put_remote_file_content(&self, path: &str, contents: &str, elevated: bool) -> Result<()> {
        self.channel()?
            .write_file(path, contents, elevated)
            .await
            .map_err(|e| HarnessError::remote(self.name(), e))
    }

    /// Bootstrap the host.
    ///
    /// With `blocking` set, waits for the job to finish and runs the finalize
    /// checks; otherwise returns once the job is launched.
    pub async fn bootstrap(
        &self,
        config: BootstrapConfig,
        certs: &HostCertificates,
        blocking: bool,
    ) -> Result<()> {
        self.start_bootstrap(config, certs).await?;
        if blocking {
            self.wait_for_bootstrap().await?;
            self.finalize().await?;
        }
        Ok(())
    }

    /// Upload certificates and the bootstrap document, then launch the
    /// bootstrap job detached. Relaunching a configuring host is allowed.
    pub async fn start_bootstrap(&self, config: BootstrapConfig, certs: &HostCertificates) -> Result<()> {
        if !self.role().needs_bootstrap() {
            return Err(HarnessError::Configuration(format!(
                "{} host {} has no bootstrap",
                self.role(),
                self.name()
            )));
        }
        self.transition(
            &[HostState::Addressed, HostState::Configuring],
            HostState::Configuring,
        )?;

        let started_at = Utc::now();
        if let Err(e) = self.launch_bootstrap(&config, certs).await {
            self.fail(e.to_string());
            return Err(e);
        }

        let mut status = self.lock();
        status.bootstrap_started_at = Some(started_at);
        status.bootstrap_finished_at = None;
        status.bootstrap_config = Some(config);
        Ok(())
    }

    async fn launch_bootstrap(&self, config: &BootstrapConfig, certs: &HostCertificates) -> Result<()> {
        let remote = RemoteCertPaths::default();
        self.run_command(
            &format!("mkdir -p {REMOTE_CERT_DIR} && chmod 700 {REMOTE_CERT_DIR}"),
            &RunOptions::new().elevated(),
        )
        .await?;
        for (local, remote) in [
            (&certs.ca_cert, &remote.ca_cert),
            (&certs.cert, &remote.cert),
            (&certs.key, &remote.key),
        ] {
            let contents = tokio::fs::read_to_string(local).await?;
            self.put_remote_file_content(remote, &contents, true).await?;
        }

        let document = serde_json::to_string_pretty(config)?;
        let config_path = self.job.config_path();
        self.put_remote_file_content(&config_path, &document, false)
            .await?;

        let install = self.settings.commands.install_command(&config_path);
        self.run_command(
            &self.job.launch_command(&install),
            &RunOptions::new().elevated(),
        )
        .await?;

        info!(host = %self.name(), job = %self.job.name(), "Bootstrap launched");
        Ok(())
    }

    /// Check the bootstrap sentinels without blocking.
    ///
    /// Returns `Ok(false)` while the job runs. The failure sentinel wins over
    /// the completion sentinel and is reported with diagnostics gathered from
    /// the host.
    pub async fn is_bootstrap_complete(&self) -> Result<bool> {
        match self.state() {
            HostState::Ready => return Ok(true),
            HostState::Configuring => {}
            HostState::Failed => {
                let diagnostics = self.lock().failure.clone().unwrap_or_default();
                return Err(HarnessError::BootstrapFailed {
                    host: self.name().to_string(),
                    diagnostics,
                });
            }
            other => {
                return Err(self.invalid_state(&format!("no bootstrap running ({other})")));
            }
        }

        let output = self
            .run_command(&self.job.probe_command(), &RunOptions::new().hide_output())
            .await?;

        match BootstrapJob::parse_probe(&output.stdout) {
            Some(JobState::Failed) => {
                let diagnostics = self.diagnostics().await;
                error!(host = %self.name(), job = %self.job.name(), "Bootstrap failed");
                self.fail(diagnostics.clone());
                Err(HarnessError::BootstrapFailed {
                    host: self.name().to_string(),
                    diagnostics,
                })
            }
            Some(JobState::Done) => {
                self.lock().bootstrap_finished_at = Some(Utc::now());
                self.transition(&[HostState::Configuring], HostState::Ready)?;
                info!(host = %self.name(), job = %self.job.name(), "Bootstrap complete");
                Ok(true)
            }
            Some(state) => {
                info!(host = %self.name(), job = %self.job.name(), state = %state, "Bootstrap in progress");
                Ok(false)
            }
            None => {
                warn!(
                    host = %self.name(),
                    output = %output.stdout.trim(),
                    "Unexpected bootstrap probe output"
                );
                Ok(false)
            }
        }
    }

    /// Poll the sentinels until the job finishes, within the bootstrap bound.
    pub async fn wait_for_bootstrap(&self) -> Result<()> {
        let operation = format!("bootstrap of {}", self.name());
        let result = poll_until(&self.settings.poll.bootstrap, &operation, || async move {
            if self.is_bootstrap_complete().await? {
                Ok::<_, HarnessError>(Poll::Ready(()))
            } else {
                Ok(Poll::Pending)
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::Exhausted {
                operation,
                attempts,
            }) => {
                self.fail(format!("{operation} timed out"));
                Err(HarnessError::Timeout {
                    host: self.name().to_string(),
                    operation,
                    attempts,
                })
            }
            Err(PollError::Failed(e)) => Err(e),
        }
    }

    /// Role-specific checks once bootstrap is done: the host is healthy and
    /// every service its role requires reports healthy. A no-op for hosts not
    /// flagged for finalize.
    pub async fn finalize(&self) -> Result<()> {
        if !self.spec.finalize || !self.role().needs_bootstrap() {
            return Ok(());
        }
        if self.state() != HostState::Ready {
            return Err(self.invalid_state("finalize before bootstrap completed"));
        }

        let policy = &self.settings.poll.health;
        self.verify_healthy(policy).await?;
        for service in self.role().required_services() {
            wait_for_service(self, service, policy).await?;
        }
        info!(host = %self.name(), role = %self.role(), "Host finalized");
        Ok(())
    }

    /// Wait until the service reports healthy.
    ///
    /// Unhealthy services before the setup-finished marker exists mean the
    /// service is still starting; after it exists they are a terminal failure.
    pub async fn verify_healthy(&self, policy: &RetryPolicy) -> Result<()> {
        let status_command = self.settings.commands.status.as_str();
        let operation = format!("health check of {}", self.name());

        let result = poll_until(policy, &operation, || async move {
            let output = match self
                .run_command(status_command, &RunOptions::new().elevated().warn_only())
                .await
            {
                Ok(output) => output,
                Err(e @ HarnessError::Connection { .. }) => {
                    warn!(host = %self.name(), error = %e, "Health check could not reach host");
                    return Ok(Poll::Pending);
                }
                Err(e) => return Err(e),
            };

            let status = ServiceStatus::parse(&output.stdout).ok();
            if output.success() && status.as_ref().is_some_and(ServiceStatus::is_healthy) {
                return Ok(Poll::Ready(()));
            }

            let detail = match &status {
                Some(status) => format!("unhealthy services: {}", status.unhealthy().join(", ")),
                None => format!(
                    "status command exited {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            };

            if self.setup_finished().await? {
                return Err(HarnessError::Unhealthy {
                    host: self.name().to_string(),
                    detail,
                });
            }
            debug!(host = %self.name(), detail = %detail, "Service still starting");
            Ok(Poll::Pending)
        })
        .await;

        match result {
            Ok(()) => {
                info!(host = %self.name(), "Host healthy");
                Ok(())
            }
            Err(PollError::Exhausted {
                operation,
                attempts,
            }) => Err(HarnessError::Timeout {
                host: self.name().to_string(),
                operation,
                attempts,
            }),
            Err(PollError::Failed(e)) => Err(e),
        }
    }

    async fn setup_finished(&self) -> Result<bool> {
        let command = format!("test -e {}", shell_quote(&self.settings.commands.setup_marker));
        let output = self
            .run_command(&command, &RunOptions::new().elevated().warn_only().hide_output())
            .await?;
        Ok(output.success())
    }

    /// Bootstrap log tail and service status, for failure reports.
    ///
    /// Never fails; unreachable sources are noted in the text.
    pub async fn diagnostics(&self) -> String {
        let sources = [
            (
                "bootstrap log",
                format!(
                    "tail -n {DIAGNOSTIC_LOG_LINES} {}",
                    shell_quote(&self.job.log_path())
                ),
            ),
            ("service status", self.settings.commands.status.clone()),
        ];

        let mut report = String::new();
        for (label, command) in sources {
            report.push_str(&format!("--- {label} ---\n"));
            match self
                .run_command(&command, &RunOptions::new().elevated().warn_only())
                .await
            {
                Ok(output) => {
                    report.push_str(&output.stdout);
                    report.push_str(&output.stderr);
                }
                Err(e) => report.push_str(&format!("<unavailable: {e}>")),
            }
            if !report.ends_with('\n') {
                report.push('\n');
            }
        }
        report
    }

    /// Uninstall the service and remove generated credentials.
    pub async fn teardown(&self) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            HostState::Unprovisioned | HostState::Stopped | HostState::TornDown
        ) {
            debug!(host = %self.name(), state = %state, "Nothing to tear down");
            return Ok(());
        }

        if self.role().needs_bootstrap() {
            let uninstall = self
                .run_command(
                    &self.settings.commands.uninstall,
                    &RunOptions::new().elevated().warn_only(),
                )
                .await?;
            if !uninstall.success() {
                warn!(
                    host = %self.name(),
                    exit_code = uninstall.exit_code,
                    "Uninstall command failed, removing files anyway"
                );
            }

            let cleanup = format!("rm -rf {REMOTE_CERT_DIR} && {}", self.job.cleanup_command());
            self.run_command(&cleanup, &RunOptions::new().elevated())
                .await?;
        }

        self.set_state(HostState::Stopped);
        if let Some(channel) = self.channel.get() {
            channel.close().await;
        }
        Ok(())
    }

    /// Record that the underlying VM is gone.
    pub(crate) fn mark_torn_down(&self) {
        self.set_state(HostState::TornDown);
    }

    /// HTTPS API of a manager or standalone host.
    pub fn rest_endpoint(&self) -> Result<String> {
        self.require_role(&[Role::Manager, Role::Standalone], "REST endpoint")?;
        Ok(format!("https://{}/api", self.ip_address()?))
    }

    /// AMQP listener of a broker.
    pub fn amqp_endpoint(&self) -> Result<String> {
        self.require_role(&[Role::Broker], "AMQP endpoint")?;
        Ok(format!("amqps://{}:5671", self.private_ip_address()?))
    }

    /// PostgreSQL listener of a database host.
    pub fn postgres_endpoint(&self) -> Result<String> {
        self.require_role(&[Role::Database], "PostgreSQL endpoint")?;
        Ok(format!("postgresql://{}:5432", self.private_ip_address()?))
    }

    fn require_role(&self, roles: &[Role], what: &str) -> Result<()> {
        if roles.contains(&self.role()) {
            Ok(())
        } else {
            Err(HarnessError::Configuration(format!(
                "{} is a {} host and has no {what}",
                self.name(),
                self.role()
            )))
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, allowed: &[HostState], to: HostState) -> Result<()> {
        let mut status = self.lock();
        if !allowed.contains(&status.state) {
            return Err(self.invalid_state(&format!("cannot move from {} to {to}", status.state)));
        }
        let from = std::mem::replace(&mut status.state, to);
        if from != to {
            info!(host = %self.name(), from = %from, to = %to, "Host state changed");
        }
        Ok(())
    }

    fn set_state(&self, to: HostState) {
        let from = std::mem::replace(&mut self.lock().state, to);
        info!(host = %self.name(), from = %from, to = %to, "Host state changed");
    }

    pub(crate) fn fail(&self, reason: String) {
        self.lock().failure = Some(reason);
        self.set_state(HostState::Failed);
    }

    fn invalid_state(&self, detail: &str) -> HarnessError {
        HarnessError::InvalidState {
            host: self.name().to_string(),
            detail: detail.to_string(),
        }
    }
}
