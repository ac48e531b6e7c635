//! Infrastructure API adapter.
//!
//! The harness provisions pool VMs by creating one deployment per host on an
//! infrastructure server and running its `install` workflow. This crate is a
//! thin client for that server:
//!
//! - [`InfraApi`]: the narrow interface the orchestrator depends on
//! - [`RestInfraClient`]: the reqwest-backed implementation
//! - [`MockInfra`]: an in-memory implementation for tests
//!
//! Every call except namespace creation/deletion is scoped to a namespace.

use async_trait::async_trait;
use hostpool_retry::{poll_until, Poll, PollError, RetryPolicy};
use thiserror::Error;
use tracing::{debug, warn};

mod mock;
mod rest;
mod types;

pub use mock::{InfraCall, MockInfra};
pub use rest::{InfraConfig, RestInfraClient};
pub use types::{
    Execution, ExecutionStatus, NodeInstance, ENVIRONMENT_SETUP_WORKFLOW, INSTALL_WORKFLOW,
    UNINSTALL_WORKFLOW,
};

/// Infra API errors.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Transport-level failure talking to the server.
    #[error("infra request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("infra API error: {status} - {body}")]
    Api { status: u16, body: String },

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists or is in a conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A server-side job did not reach a terminal status in time.
    #[error("{operation} did not finish after {attempts} attempts")]
    Timeout { operation: String, attempts: u32 },

    /// The server answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl InfraError {
    /// Returns true for failures worth retrying (transport errors and 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            InfraError::Http(_) => true,
            InfraError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, InfraError::NotFound(_))
    }
}

/// Result type for infra operations.
pub type Result<T> = std::result::Result<T, InfraError>;

/// Operations the orchestrator needs from the infrastructure server.
#[async_trait]
pub trait InfraApi: Send + Sync {
    /// Create the namespace isolating one pool's resources.
    async fn create_namespace(&self, namespace: &str) -> Result<()>;

    /// Release a namespace and everything still inside it.
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    /// Create a deployment from a VM template.
    async fn create_deployment(
        &self,
        namespace: &str,
        template_id: &str,
        deployment_id: &str,
        inputs: &serde_json::Value,
    ) -> Result<()>;

    /// Start a workflow on a deployment. Returns immediately.
    async fn start_execution(
        &self,
        namespace: &str,
        deployment_id: &str,
        workflow: &str,
    ) -> Result<Execution>;

    /// Fetch the current state of an execution.
    async fn get_execution(&self, namespace: &str, execution_id: &str) -> Result<Execution>;

    /// List executions in the namespace, optionally for one deployment.
    async fn list_executions(
        &self,
        namespace: &str,
        deployment_id: Option<&str>,
    ) -> Result<Vec<Execution>>;

    /// Request cancellation of an execution.
    async fn cancel_execution(
        &self,
        namespace: &str,
        execution_id: &str,
        force: bool,
    ) -> Result<Execution>;

    /// Delete a deployment.
    async fn delete_deployment(&self, namespace: &str, deployment_id: &str) -> Result<()>;

    /// Node instances of `node_type` in a deployment.
    async fn get_node_instances(
        &self,
        namespace: &str,
        node_type: &str,
        deployment_id: &str,
    ) -> Result<Vec<NodeInstance>>;
}

/// Wait for an execution to reach a terminal status and return it.
///
/// Transient API failures while polling count as "still running". A
/// non-successful terminal status is returned, not raised; callers decide
/// what a failed job means for them.
pub async fn wait_for_execution(
    api: &dyn InfraApi,
    namespace: &str,
    execution: &Execution,
    policy: &RetryPolicy,
) -> Result<Execution> {
    let operation = format!("{} on {}", execution.workflow_id, execution.deployment_id);

    let result = poll_until(policy, &operation, || async move {
        match api.get_execution(namespace, &execution.id).await {
            Ok(current) if current.status.is_terminal() => Ok(Poll::Ready(current)),
            Ok(current) => {
                debug!(
                    execution_id = %current.id,
                    deployment_id = %current.deployment_id,
                    status = %current.status,
                    "Execution still running"
                );
                Ok(Poll::Pending)
            }
            Err(e) if e.is_transient() => {
                warn!(execution_id = %execution.id, error = %e, "Transient error polling execution");
                Ok(Poll::Pending)
            }
            Err(e) => Err(e),
        }
    })
    .await;

    match result {
        Ok(finished) => Ok(finished),
        Err(PollError::Exhausted {
            operation,
            attempts,
        }) => Err(InfraError::Timeout {
            operation,
            attempts,
        }),
        Err(PollError::Failed(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_execution_reaches_terminal() {
        let infra = MockInfra::new().with_polls_before_finish(2);
        infra.create_namespace("ns").await.unwrap();
        infra
            .create_deployment("ns", "tpl", "vm-0", &serde_json::json!({}))
            .await
            .unwrap();
        let execution = infra
            .start_execution("ns", "vm-0", INSTALL_WORKFLOW)
            .await
            .unwrap();

        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let finished = wait_for_execution(&infra, "ns", &execution, &policy)
            .await
            .unwrap();

        assert_eq!(finished.status, ExecutionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_wait_for_execution_times_out() {
        let infra = MockInfra::new().with_polls_before_finish(10);
        infra.create_namespace("ns").await.unwrap();
        infra
            .create_deployment("ns", "tpl", "vm-0", &serde_json::json!({}))
            .await
            .unwrap();
        let execution = infra
            .start_execution("ns", "vm-0", INSTALL_WORKFLOW)
            .await
            .unwrap();

        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let err = wait_for_execution(&infra, "ns", &execution, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, InfraError::Timeout { attempts: 3, .. }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(InfraError::Api {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!InfraError::Api {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!InfraError::NotFound("x".into()).is_transient());
    }
}
