//! Host pool orchestration.
//!
//! A pool owns one infra namespace and one deployment per host. Lifecycle:
//!
//! ```text
//! created -> provisioning -> provisioned -> bootstrapping -> ready
//!                                                              |
//!                                          destroying -> destroyed
//! ```
//!
//! Any error while provisioning or bootstrapping moves the pool to
//! `destroying` and tears it down before the error is returned, so a failed
//! [`HostPool::start`] never leaks infra resources.
//!
//! Teardown cancels in-flight server-side jobs first. If they do not stop,
//! teardown halts before releasing anything and the pool stays `destroying`.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostpool_infra::{
    wait_for_execution, Execution, InfraApi, InfraError, INSTALL_WORKFLOW, UNINSTALL_WORKFLOW,
};
use hostpool_remote::Connector;
use hostpool_retry::{poll_until, Poll, PollError};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapConfig, ClusterConfig, NetworkingConfig, PeerConfig, SecurityConfig};
use crate::certs::{PoolCertificates, RemoteCertPaths};
use crate::config::{AdminCredentials, HarnessConfig, KeepPolicy, PollSettings};
use crate::error::{HarnessError, Result};
use crate::host::{Host, HostAddresses, HostState};
use crate::ids::PoolId;
use crate::role::{OsFamily, Role, Topology};

/// Node type of the VM inside every host deployment.
const VM_NODE_TYPE: &str = "vm";

/// Namespaces are used as DNS labels by some infra backends.
const MAX_NAMESPACE_LEN: usize = 63;

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Provisioning,
    Provisioned,
    Bootstrapping,
    Ready,
    Destroying,
    Destroyed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Created => "created",
            PoolState::Provisioning => "provisioning",
            PoolState::Provisioned => "provisioned",
            PoolState::Bootstrapping => "bootstrapping",
            PoolState::Ready => "ready",
            PoolState::Destroying => "destroying",
            PoolState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Outcome of [`HostPool::destroy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReport {
    /// The keep policy left every resource in place.
    Kept,
    /// The pool had already been destroyed; nothing was done.
    AlreadyDestroyed,
    /// Resources were released. `failures` lists best-effort steps that
    /// failed and were skipped.
    Destroyed {
        cancelled: usize,
        failures: Vec<String>,
    },
}

/// A set of hosts backing one test run.
pub struct HostPool {
    id: PoolId,
    run_id: String,
    namespace: String,
    created_at: DateTime<Utc>,

    template_id: String,
    linux_image: String,
    windows_image: String,
    flavor: String,
    admin: AdminCredentials,
    keep: KeepPolicy,
    poll: PollSettings,

    infra: Arc<dyn InfraApi>,
    hosts: Vec<Host>,
    state: PoolState,
    certs: Option<PoolCertificates>,
    deployments: Vec<String>,
    namespace_created: bool,
}

impl fmt::Debug for HostPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPool")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("state", &self.state)
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

impl HostPool {
    /// Create a pool without touching the infra server.
    ///
    /// The topology is validated here, so an invalid one never creates
    /// anything remotely.
    pub fn new(
        run_id: &str,
        topology: &Topology,
        config: &HarnessConfig,
        infra: Arc<dyn InfraApi>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        topology.validate()?;

        let id = PoolId::new();
        let created_at = Utc::now();
        let namespace = namespace_name(run_id, created_at, &id.suffix());
        if namespace.is_empty() {
            return Err(HarnessError::Configuration(format!(
                "run id '{run_id}' yields an empty namespace"
            )));
        }

        let settings = config.host_settings();
        let hosts = topology
            .specs()
            .into_iter()
            .map(|spec| Host::new(spec, settings.clone(), connector.clone()))
            .collect();

        info!(pool_id = %id, namespace = %namespace, run_id, "Pool created");

        Ok(Self {
            id,
            run_id: run_id.to_string(),
            namespace,
            created_at,
            template_id: config.template_id.clone(),
            linux_image: config.linux_image.clone(),
            windows_image: config.windows_image.clone(),
            flavor: config.flavor.clone(),
            admin: config.admin.clone(),
            keep: config.keep,
            poll: config.poll,
            infra,
            hosts,
            state: PoolState::Created,
            certs: None,
            deployments: Vec::new(),
            namespace_created: false,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Infra namespace holding every resource of this pool.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name() == name)
    }

    pub fn hosts_with_role(&self, role: Role) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(move |h| h.role() == role)
    }

    /// PEM of the pool CA, once certificates are issued.
    pub fn ca_cert_pem(&self) -> Option<&str> {
        self.certs.as_ref().map(PoolCertificates::ca_cert_pem)
    }

    /// Provision and bootstrap every host.
    ///
    /// On error the pool is torn down unconditionally, ignoring the keep
    /// policy, and the original error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != PoolState::Created {
            return Err(HarnessError::InvalidState {
                host: self.namespace.clone(),
                detail: format!("pool already {}", self.state),
            });
        }

        info!(
            pool_id = %self.id,
            namespace = %self.namespace,
            hosts = self.hosts.len(),
            "Starting pool"
        );

        if let Err(e) = self.provision_and_bootstrap().await {
            error!(
                pool_id = %self.id,
                namespace = %self.namespace,
                reason = e.reason_code(),
                error = %e,
                "Pool start failed, tearing down"
            );
            match self.teardown().await {
                Ok(report) => debug!(report = ?report, "Teardown after failed start finished"),
                Err(teardown_error) => error!(
                    namespace = %self.namespace,
                    error = %teardown_error,
                    "Teardown after failed start failed"
                ),
            }
            return Err(e);
        }

        info!(pool_id = %self.id, namespace = %self.namespace, "Pool ready");
        Ok(())
    }

    async fn provision_and_bootstrap(&mut self) -> Result<()> {
        self.provision().await?;
        self.bootstrap().await
    }

    async fn provision(&mut self) -> Result<()> {
        self.set_state(PoolState::Provisioning);

        self.infra.create_namespace(&self.namespace).await?;
        self.namespace_created = true;

        for host in &self.hosts {
            let image = match host.spec().os {
                OsFamily::Linux => &self.linux_image,
                OsFamily::Windows => &self.windows_image,
            };
            let inputs = json!({
                "image": image,
                "flavor": self.flavor,
                "name": host.name(),
            });
            self.infra
                .create_deployment(&self.namespace, &self.template_id, host.name(), &inputs)
                .await?;
            self.deployments.push(host.name().to_string());
        }

        for host in &self.hosts {
            self.wait_for_environment(host).await?;
        }

        // Every install is started before waiting on any of them.
        let mut installs = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let execution = self
                .infra
                .start_execution(&self.namespace, host.name(), INSTALL_WORKFLOW)
                .await?;
            debug!(host = %host.name(), execution_id = %execution.id, "Install started");
            installs.push(execution);
        }

        for (host, install) in self.hosts.iter().zip(&installs) {
            self.wait_for_job(host, install).await?;
            self.assign_addresses(host).await?;
        }

        self.set_state(PoolState::Provisioned);
        Ok(())
    }

    /// Deployments are unusable until their environment-setup job finishes.
    async fn wait_for_environment(&self, host: &Host) -> Result<()> {
        let executions = self
            .infra
            .list_executions(&self.namespace, Some(host.name()))
            .await?;
        for setup in executions
            .iter()
            .filter(|e| e.is_environment_setup() && !e.status.is_terminal())
        {
            self.wait_for_job(host, setup).await?;
        }
        Ok(())
    }

    async fn wait_for_job(&self, host: &Host, execution: &Execution) -> Result<()> {
        let finished = wait_for_execution(
            self.infra.as_ref(),
            &self.namespace,
            execution,
            &self.poll.provisioning,
        )
        .await
        .map_err(|e| match e {
            InfraError::Timeout { .. } => HarnessError::ProvisioningFailed {
                host: host.name().to_string(),
                reason: e.to_string(),
            },
            other => other.into(),
        })?;

        if !finished.status.is_success() {
            return Err(HarnessError::ProvisioningFailed {
                host: host.name().to_string(),
                reason: format!(
                    "{} ended {}: {}",
                    finished.workflow_id,
                    finished.status,
                    finished.error.as_deref().unwrap_or("no error reported")
                ),
            });
        }
        Ok(())
    }

    async fn assign_addresses(&self, host: &Host) -> Result<()> {
        let instances = self
            .infra
            .get_node_instances(&self.namespace, VM_NODE_TYPE, host.name())
            .await?;
        let provisioning_failed = |reason: &str| HarnessError::ProvisioningFailed {
            host: host.name().to_string(),
            reason: reason.to_string(),
        };

        let instance = instances
            .first()
            .ok_or_else(|| provisioning_failed("no vm node instance"))?;
        let (Some(public), Some(private)) = (instance.public_ip(), instance.private_ip()) else {
            return Err(provisioning_failed("node instance has no addresses"));
        };

        host.assign(HostAddresses {
            public: public.to_string(),
            private: private.to_string(),
            networks: instance.networks(),
            server_id: instance.server_id().map(str::to_string),
        })
    }

    async fn bootstrap(&mut self) -> Result<()> {
        self.set_state(PoolState::Bootstrapping);
        self.issue_certificates()?;

        let mut tiers: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for (index, host) in self.hosts.iter().enumerate() {
            if host.role().needs_bootstrap() {
                tiers.entry(host.role().tier()).or_default().push(index);
            }
        }

        for (tier, members) in &tiers {
            let members: Vec<&Host> = members.iter().map(|&i| &self.hosts[i]).collect();
            self.bootstrap_tier(*tier, &members).await?;
        }

        self.set_state(PoolState::Ready);
        Ok(())
    }

    fn issue_certificates(&mut self) -> Result<()> {
        if self.certs.is_none() {
            self.certs = Some(PoolCertificates::new(&format!("{} CA", self.namespace))?);
        }
        let Some(certs) = self.certs.as_mut() else {
            return Ok(());
        };

        for host in self.hosts.iter().filter(|h| h.role().needs_bootstrap()) {
            let addresses = host.addresses()?;
            certs.add_host(
                host.name(),
                &[host.name(), addresses.public.as_str(), addresses.private.as_str()],
            )?;
        }
        Ok(())
    }

    async fn bootstrap_tier(&self, tier: u8, members: &[&Host]) -> Result<()> {
        let not_ready: Vec<&str> = self
            .hosts
            .iter()
            .filter(|h| h.role().needs_bootstrap() && h.role().tier() < tier)
            .filter(|h| h.state() != HostState::Ready)
            .map(|h| h.name())
            .collect();
        if !not_ready.is_empty() {
            return Err(HarnessError::Configuration(format!(
                "tier {tier} cannot start before {} are ready",
                not_ready.join(", ")
            )));
        }

        info!(
            namespace = %self.namespace,
            tier,
            hosts = ?members.iter().map(|h| h.name()).collect::<Vec<_>>(),
            max_wait = ?self.poll.bootstrap.max_wait(),
            "Bootstrapping tier"
        );

        let certs = self.certs.as_ref().ok_or_else(|| HarnessError::InvalidState {
            host: self.namespace.clone(),
            detail: "certificates not issued".to_string(),
        })?;
        let cluster = self.cluster_config()?;

        for host in members {
            let host_certs = certs.host(host.name()).ok_or_else(|| HarnessError::InvalidState {
                host: host.name().to_string(),
                detail: "no certificate issued".to_string(),
            })?;
            let config = self.bootstrap_config(host, cluster.as_ref())?;
            host.start_bootstrap(config, host_certs).await?;
        }

        let operation = format!("bootstrap of tier {tier}");
        let result = poll_until(&self.poll.bootstrap, &operation, || async move {
            let mut done = true;
            for host in members {
                if !host.is_bootstrap_complete().await? {
                    done = false;
                }
            }
            Ok::<_, HarnessError>(if done { Poll::Ready(()) } else { Poll::Pending })
        })
        .await;

        match result {
            Ok(()) => {}
            Err(PollError::Exhausted {
                operation,
                attempts,
            }) => {
                let pending: Vec<&Host> = members
                    .iter()
                    .copied()
                    .filter(|h| h.state() != HostState::Ready)
                    .collect();
                for host in &pending {
                    host.fail(format!("{operation} timed out"));
                }
                return Err(HarnessError::Timeout {
                    host: pending
                        .iter()
                        .map(|h| h.name())
                        .collect::<Vec<_>>()
                        .join(", "),
                    operation,
                    attempts,
                });
            }
            Err(PollError::Failed(e)) => return Err(e),
        }

        for host in members {
            host.finalize().await?;
        }
        Ok(())
    }

    /// Membership of every clustered role, or `None` for a standalone pool.
    fn cluster_config(&self) -> Result<Option<ClusterConfig>> {
        if !self.hosts.iter().any(|h| h.role().is_clustered()) {
            return Ok(None);
        }

        let peers = |role: Role| -> Result<Vec<PeerConfig>> {
            self.hosts_with_role(role)
                .map(|host| -> Result<PeerConfig> {
                    Ok(PeerConfig {
                        name: host.name().to_string(),
                        private_address: host.private_ip_address()?.to_string(),
                        public_address: host.ip_address()?.to_string(),
                    })
                })
                .collect()
        };

        Ok(Some(ClusterConfig {
            brokers: peers(Role::Broker)?,
            databases: peers(Role::Database)?,
            managers: peers(Role::Manager)?,
        }))
    }

    fn bootstrap_config(&self, host: &Host, cluster: Option<&ClusterConfig>) -> Result<BootstrapConfig> {
        let addresses = host.addresses()?;
        Ok(BootstrapConfig {
            role: host.role(),
            node_name: host.name().to_string(),
            networking: NetworkingConfig {
                public_address: addresses.public.clone(),
                private_address: addresses.private.clone(),
                networks: addresses.networks.clone(),
            },
            security: SecurityConfig::new(&self.admin, &RemoteCertPaths::default()),
            cluster: cluster.filter(|_| host.role().is_clustered()).cloned(),
            services: BTreeMap::new(),
        })
    }

    /// Destroy the pool after a test run, honoring the keep policy.
    ///
    /// Calling this on a destroyed pool is a no-op.
    pub async fn destroy(&mut self, passed: bool) -> Result<TeardownReport> {
        if self.state == PoolState::Destroyed {
            debug!(namespace = %self.namespace, "Pool already destroyed");
            return Ok(TeardownReport::AlreadyDestroyed);
        }

        if self.keep.should_keep(passed) {
            warn!(
                namespace = %self.namespace,
                passed,
                "Keeping pool; delete the namespace manually when done"
            );
            for host in &self.hosts {
                if let Ok(addresses) = host.addresses() {
                    warn!(
                        host = %host.name(),
                        public_ip = %addresses.public,
                        user = %self.login_user(host),
                        "Kept host"
                    );
                }
            }
            self.certs = None;
            self.set_state(PoolState::Destroyed);
            return Ok(TeardownReport::Kept);
        }

        self.teardown().await
    }

    fn login_user<'a>(&self, host: &'a Host) -> &'a str {
        let settings = host.settings();
        match host.spec().os {
            OsFamily::Linux => &settings.ssh_user,
            OsFamily::Windows => &settings.windows_user,
        }
    }

    async fn teardown(&mut self) -> Result<TeardownReport> {
        self.set_state(PoolState::Destroying);

        if !self.namespace_created {
            self.set_state(PoolState::Destroyed);
            return Ok(TeardownReport::Destroyed {
                cancelled: 0,
                failures: Vec::new(),
            });
        }

        // Hard gate: nothing is released while jobs are still running.
        let cancelled = self.cancel_executions().await?;

        let mut failures = Vec::new();
        let mut order: Vec<&Host> = self.hosts.iter().collect();
        order.sort_by_key(|h| Reverse(h.role().tier()));

        for host in &order {
            if let Err(e) = host.teardown().await {
                warn!(host = %host.name(), error = %e, "Host teardown failed");
                failures.push(format!("{}: {e}", host.name()));
            }
        }

        let mut uninstalls = Vec::new();
        for host in order.iter().filter(|h| self.deployments.iter().any(|d| d == h.name())) {
            match self
                .infra
                .start_execution(&self.namespace, host.name(), UNINSTALL_WORKFLOW)
                .await
            {
                Ok(execution) => uninstalls.push(execution),
                Err(e) => {
                    warn!(deployment_id = %host.name(), error = %e, "Could not start uninstall");
                    failures.push(format!("uninstall of {}: {e}", host.name()));
                }
            }
        }
        for execution in &uninstalls {
            match wait_for_execution(
                self.infra.as_ref(),
                &self.namespace,
                execution,
                &self.poll.uninstall,
            )
            .await
            {
                Ok(finished) if finished.status.is_success() => {}
                Ok(finished) => {
                    warn!(
                        deployment_id = %finished.deployment_id,
                        status = %finished.status,
                        "Uninstall did not succeed"
                    );
                    failures.push(format!(
                        "uninstall of {} ended {}",
                        finished.deployment_id, finished.status
                    ));
                }
                Err(e) => {
                    warn!(deployment_id = %execution.deployment_id, error = %e, "Uninstall wait failed");
                    failures.push(format!("uninstall of {}: {e}", execution.deployment_id));
                }
            }
        }

        for deployment in &self.deployments {
            match self.infra.delete_deployment(&self.namespace, deployment).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(deployment_id = %deployment, error = %e, "Could not delete deployment");
                    failures.push(format!("delete of {deployment}: {e}"));
                }
            }
        }

        match self.infra.delete_namespace(&self.namespace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(namespace = %self.namespace, error = %e, "Could not delete namespace");
                failures.push(format!("delete of namespace {}: {e}", self.namespace));
            }
        }

        for host in &self.hosts {
            host.mark_torn_down();
        }
        self.certs = None;
        self.deployments.clear();
        self.namespace_created = false;
        self.set_state(PoolState::Destroyed);

        if failures.is_empty() {
            info!(namespace = %self.namespace, cancelled, "Pool destroyed");
        } else {
            warn!(
                namespace = %self.namespace,
                cancelled,
                failures = failures.len(),
                "Pool destroyed with failures"
            );
        }
        Ok(TeardownReport::Destroyed {
            cancelled,
            failures,
        })
    }

    /// Cancel every in-flight job except environment setup and wait for the
    /// cancellations to land, escalating to a forced cancel once.
    async fn cancel_executions(&self) -> Result<usize> {
        let executions = self.infra.list_executions(&self.namespace, None).await?;
        let active: Vec<Execution> = executions
            .into_iter()
            .filter(|e| !e.status.is_terminal() && !e.is_environment_setup())
            .collect();
        if active.is_empty() {
            return Ok(0);
        }

        let total = active.len();
        let mut pending = active;
        for force in [false, true] {
            for execution in &pending {
                info!(
                    execution_id = %execution.id,
                    deployment_id = %execution.deployment_id,
                    workflow = %execution.workflow_id,
                    force,
                    "Cancelling execution"
                );
                if let Err(e) = self
                    .infra
                    .cancel_execution(&self.namespace, &execution.id, force)
                    .await
                {
                    warn!(execution_id = %execution.id, error = %e, "Cancel request failed");
                }
            }

            pending = self.await_cancellation(&pending).await;
            if pending.is_empty() {
                return Ok(total);
            }
            warn!(
                namespace = %self.namespace,
                pending = pending.len(),
                force,
                "Cancellation did not converge"
            );
        }

        let pending: Vec<String> = pending
            .iter()
            .map(|e| format!("{} ({} on {})", e.id, e.workflow_id, e.deployment_id))
            .collect();
        error!(
            namespace = %self.namespace,
            pending = ?pending,
            "Halting teardown, jobs are still running"
        );
        Err(HarnessError::CancellationFailed {
            namespace: self.namespace.clone(),
            pending,
        })
    }

    /// Poll until every execution is terminal; returns the ones that are not.
    async fn await_cancellation(&self, executions: &[Execution]) -> Vec<Execution> {
        let result = poll_until(
            &self.poll.cancellation,
            "cancellation",
            || async move {
                let running = self.still_running(executions).await;
                Ok::<_, Infallible>(if running.is_empty() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                })
            },
        )
        .await;

        match result {
            Ok(()) => Vec::new(),
            Err(PollError::Exhausted { .. }) => self.still_running(executions).await,
            Err(PollError::Failed(never)) => match never {},
        }
    }

    async fn still_running(&self, executions: &[Execution]) -> Vec<Execution> {
        let mut running = Vec::new();
        for execution in executions {
            match self.infra.get_execution(&self.namespace, &execution.id).await {
                Ok(current) if current.status.is_terminal() => {}
                Ok(current) => running.push(current),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    debug!(execution_id = %execution.id, error = %e, "Could not poll execution");
                    running.push(execution.clone());
                }
            }
        }
        running
    }

    fn set_state(&mut self, to: PoolState) {
        if self.state != to {
            info!(namespace = %self.namespace, from = %self.state, to = %to, "Pool state changed");
            self.state = to;
        }
    }
}

/// Namespace for a pool: `<run-id>-<UTC yyyymmddHHMMSS>-<suffix>`, reduced to
/// lowercase `[a-z0-9-]` and at most 63 characters.
pub fn namespace_name(run_id: &str, now: DateTime<Utc>, suffix: &str) -> String {
    let raw = format!("{run_id}-{}-{suffix}", now.format("%Y%m%d%H%M%S"));

    let mut name = String::with_capacity(raw.len());
    for c in raw.chars().map(|c| c.to_ascii_lowercase()) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && (name.is_empty() || name.ends_with('-')) {
            continue;
        }
        name.push(c);
    }

    // Keep the unique tail when truncating.
    if name.len() > MAX_NAMESPACE_LEN {
        name = name[name.len() - MAX_NAMESPACE_LEN..].to_string();
    }
    name.trim_matches('-').to_string()
}
