//! In-memory infra server for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::types::{
    Execution, ExecutionStatus, NodeInstance, ENVIRONMENT_SETUP_WORKFLOW, INSTALL_WORKFLOW,
};
use crate::{InfraApi, InfraError, Result};

/// A call recorded by [`MockInfra`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraCall {
    CreateNamespace(String),
    DeleteNamespace(String),
    CreateDeployment(String),
    StartExecution { deployment_id: String, workflow: String },
    GetExecution(String),
    ListExecutions,
    CancelExecution { execution_id: String, force: bool },
    DeleteDeployment(String),
    GetNodeInstances(String),
}

#[derive(Debug)]
struct MockExecution {
    namespace: String,
    execution: Execution,
    polls_remaining: u32,
}

#[derive(Debug, Default)]
struct MockState {
    namespaces: BTreeSet<String>,
    deployments: BTreeSet<(String, String)>,
    executions: BTreeMap<String, MockExecution>,
    node_instances: HashMap<(String, String), NodeInstance>,
    calls: Vec<InfraCall>,
    next_execution: u64,
    next_host: u32,
}

/// In-memory [`InfraApi`] implementation.
///
/// Workflows report `started` for a configurable number of polls, then
/// finish. A successful `install` allocates addresses for the deployment's
/// `vm` node instance.
#[derive(Debug, Default)]
pub struct MockInfra {
    state: Mutex<MockState>,
    polls_before_finish: u32,
    failing_installs: HashSet<String>,
    stuck_cancellations: bool,
    running_environment_setup: bool,
}

impl MockInfra {
    /// Create a mock where every workflow finishes on the first poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `started` for `polls` polls before finishing a workflow.
    pub fn with_polls_before_finish(mut self, polls: u32) -> Self {
        self.polls_before_finish = polls;
        self
    }

    /// Make the `install` workflow of `deployment_id` fail.
    pub fn with_failing_install(mut self, deployment_id: &str) -> Self {
        self.failing_installs.insert(deployment_id.to_string());
        self
    }

    /// Cancellation requests are accepted but never converge.
    pub fn with_stuck_cancellations(mut self) -> Self {
        self.stuck_cancellations = true;
        self
    }

    /// Leave the environment-setup job of new deployments running.
    pub fn with_running_environment_setup(mut self) -> Self {
        self.running_environment_setup = true;
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<InfraCall> {
        self.lock().calls.clone()
    }

    /// Returns true if the namespace currently exists.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.lock().namespaces.contains(namespace)
    }

    /// Deployments currently present in a namespace.
    pub fn deployments(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .deployments
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Start a long-running execution that only finishes through cancellation.
    pub fn inject_running_execution(
        &self,
        namespace: &str,
        deployment_id: &str,
        workflow: &str,
    ) -> Execution {
        let mut state = self.lock();
        Self::new_execution(&mut state, namespace, deployment_id, workflow, u32::MAX)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A poisoned lock only happens after a panicking test; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_execution(
        state: &mut MockState,
        namespace: &str,
        deployment_id: &str,
        workflow: &str,
        polls_remaining: u32,
    ) -> Execution {
        state.next_execution += 1;
        let execution = Execution {
            id: format!("exec-{}", state.next_execution),
            deployment_id: deployment_id.to_string(),
            workflow_id: workflow.to_string(),
            status: ExecutionStatus::Started,
            error: None,
        };
        state.executions.insert(
            execution.id.clone(),
            MockExecution {
                namespace: namespace.to_string(),
                execution: execution.clone(),
                polls_remaining,
            },
        );
        execution
    }

    fn require_namespace(state: &MockState, namespace: &str) -> Result<()> {
        if state.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(InfraError::NotFound(format!("namespace {namespace}")))
        }
    }

    fn finish(&self, state: &mut MockState, execution_id: &str) {
        let Some(entry) = state.executions.get_mut(execution_id) else {
            return;
        };

        let deployment_id = entry.execution.deployment_id.clone();
        let namespace = entry.namespace.clone();
        let is_install = entry.execution.workflow_id == INSTALL_WORKFLOW;

        if is_install && self.failing_installs.contains(&deployment_id) {
            entry.execution.status = ExecutionStatus::Failed;
            entry.execution.error = Some("server creation failed".to_string());
            return;
        }
        entry.execution.status = ExecutionStatus::Terminated;

        if is_install {
            state.next_host += 1;
            let n = state.next_host;
            let instance = NodeInstance {
                id: format!("vm_{deployment_id}"),
                node_id: "vm".to_string(),
                deployment_id: deployment_id.clone(),
                state: Some("started".to_string()),
                runtime_properties: json!({
                    "public_ip": format!("192.0.2.{n}"),
                    "ip": format!("10.0.0.{n}"),
                    "external_id": format!("srv-{n}"),
                    "networks": {"default": format!("10.0.0.{n}")},
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            };
            state.node_instances.insert((namespace, deployment_id), instance);
        }
    }
}

#[async_trait]
impl InfraApi for MockInfra {
    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(InfraCall::CreateNamespace(namespace.to_string()));
        if !state.namespaces.insert(namespace.to_string()) {
            return Err(InfraError::Conflict(format!("namespace {namespace}")));
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(InfraCall::DeleteNamespace(namespace.to_string()));
        if !state.namespaces.remove(namespace) {
            return Err(InfraError::NotFound(format!("namespace {namespace}")));
        }
        state.deployments.retain(|(ns, _)| ns != namespace);
        state.node_instances.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        _template_id: &str,
        deployment_id: &str,
        _inputs: &serde_json::Value,
    ) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(InfraCall::CreateDeployment(deployment_id.to_string()));
        Self::require_namespace(&state, namespace)?;

        if !state
            .deployments
            .insert((namespace.to_string(), deployment_id.to_string()))
        {
            return Err(InfraError::Conflict(format!("deployment {deployment_id}")));
        }

        let polls = if self.running_environment_setup { u32::MAX } else { 0 };
        let setup = Self::new_execution(
            &mut state,
            namespace,
            deployment_id,
            ENVIRONMENT_SETUP_WORKFLOW,
            polls,
        );
        if !self.running_environment_setup {
            self.finish(&mut state, &setup.id);
        }
        Ok(())
    }

    async fn start_execution(
        &self,
        namespace: &str,
        deployment_id: &str,
        workflow: &str,
    ) -> Result<Execution> {
        let mut state = self.lock();
        state.calls.push(InfraCall::StartExecution {
            deployment_id: deployment_id.to_string(),
            workflow: workflow.to_string(),
        });
        Self::require_namespace(&state, namespace)?;
        if !state
            .deployments
            .contains(&(namespace.to_string(), deployment_id.to_string()))
        {
            return Err(InfraError::NotFound(format!("deployment {deployment_id}")));
        }

        let execution = Self::new_execution(
            &mut state,
            namespace,
            deployment_id,
            workflow,
            self.polls_before_finish,
        );
        debug!(execution_id = %execution.id, deployment_id, workflow, "[MOCK] Started execution");
        Ok(execution)
    }

    async fn get_execution(&self, namespace: &str, execution_id: &str) -> Result<Execution> {
        let mut state = self.lock();
        state
            .calls
            .push(InfraCall::GetExecution(execution_id.to_string()));

        let entry = state
            .executions
            .get_mut(execution_id)
            .filter(|e| e.namespace == namespace)
            .ok_or_else(|| InfraError::NotFound(format!("execution {execution_id}")))?;

        let cancelling = matches!(
            entry.execution.status,
            ExecutionStatus::Cancelling | ExecutionStatus::ForceCancelling
        );
        if entry.execution.status.is_terminal() || cancelling {
            return Ok(entry.execution.clone());
        }
        if entry.polls_remaining > 0 {
            if entry.polls_remaining != u32::MAX {
                entry.polls_remaining -= 1;
            }
            return Ok(entry.execution.clone());
        }

        self.finish(&mut state, execution_id);
        Ok(state.executions[execution_id].execution.clone())
    }

    async fn list_executions(
        &self,
        namespace: &str,
        deployment_id: Option<&str>,
    ) -> Result<Vec<Execution>> {
        let mut state = self.lock();
        state.calls.push(InfraCall::ListExecutions);
        Self::require_namespace(&state, namespace)?;

        Ok(state
            .executions
            .values()
            .filter(|e| e.namespace == namespace)
            .filter(|e| deployment_id.is_none_or(|id| e.execution.deployment_id == id))
            .map(|e| e.execution.clone())
            .collect())
    }

    async fn cancel_execution(
        &self,
        namespace: &str,
        execution_id: &str,
        force: bool,
    ) -> Result<Execution> {
        let mut state = self.lock();
        state.calls.push(InfraCall::CancelExecution {
            execution_id: execution_id.to_string(),
            force,
        });

        let stuck = self.stuck_cancellations;
        let entry = state
            .executions
            .get_mut(execution_id)
            .filter(|e| e.namespace == namespace)
            .ok_or_else(|| InfraError::NotFound(format!("execution {execution_id}")))?;

        if !entry.execution.status.is_terminal() {
            entry.execution.status = match (stuck, force) {
                (true, true) => ExecutionStatus::ForceCancelling,
                (true, false) => ExecutionStatus::Cancelling,
                (false, _) => ExecutionStatus::Cancelled,
            };
        }
        Ok(entry.execution.clone())
    }

    async fn delete_deployment(&self, namespace: &str, deployment_id: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(InfraCall::DeleteDeployment(deployment_id.to_string()));
        let key = (namespace.to_string(), deployment_id.to_string());
        if !state.deployments.remove(&key) {
            return Err(InfraError::NotFound(format!("deployment {deployment_id}")));
        }
        state.node_instances.remove(&key);
        Ok(())
    }

    async fn get_node_instances(
        &self,
        namespace: &str,
        node_type: &str,
        deployment_id: &str,
    ) -> Result<Vec<NodeInstance>> {
        let mut state = self.lock();
        state
            .calls
            .push(InfraCall::GetNodeInstances(deployment_id.to_string()));
        Self::require_namespace(&state, namespace)?;

        Ok(state
            .node_instances
            .get(&(namespace.to_string(), deployment_id.to_string()))
            .filter(|instance| instance.node_id == node_type)
            .cloned()
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_allocates_addresses() {
        let infra = MockInfra::new();
        infra.create_namespace("ns").await.unwrap();
        infra
            .create_deployment("ns", "tpl", "broker-0", &json!({}))
            .await
            .unwrap();
        let execution = infra
            .start_execution("ns", "broker-0", INSTALL_WORKFLOW)
            .await
            .unwrap();
        let finished = infra.get_execution("ns", &execution.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Terminated);

        let instances = infra
            .get_node_instances("ns", "vm", "broker-0")
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].public_ip().is_some());
        assert!(instances[0].private_ip().is_some());
    }

    #[tokio::test]
    async fn test_namespace_conflict() {
        let infra = MockInfra::new();
        infra.create_namespace("ns").await.unwrap();
        assert!(matches!(
            infra.create_namespace("ns").await,
            Err(InfraError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_install() {
        let infra = MockInfra::new().with_failing_install("db-0");
        infra.create_namespace("ns").await.unwrap();
        infra
            .create_deployment("ns", "tpl", "db-0", &json!({}))
            .await
            .unwrap();
        let execution = infra
            .start_execution("ns", "db-0", INSTALL_WORKFLOW)
            .await
            .unwrap();
        let finished = infra.get_execution("ns", &execution.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Failed);
        assert!(infra
            .get_node_instances("ns", "vm", "db-0")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stuck_cancellation_never_terminal() {
        let infra = MockInfra::new().with_stuck_cancellations();
        infra.create_namespace("ns").await.unwrap();
        let running = infra.inject_running_execution("ns", "manager-0", INSTALL_WORKFLOW);

        let after = infra
            .cancel_execution("ns", &running.id, false)
            .await
            .unwrap();
        assert_eq!(after.status, ExecutionStatus::Cancelling);
        let polled = infra.get_execution("ns", &running.id).await.unwrap();
        assert!(!polled.status.is_terminal());
    }

    #[tokio::test]
    async fn test_delete_namespace_cascades() {
        let infra = MockInfra::new();
        infra.create_namespace("ns").await.unwrap();
        infra
            .create_deployment("ns", "tpl", "vm-0", &json!({}))
            .await
            .unwrap();
        infra.delete_namespace("ns").await.unwrap();

        assert!(!infra.has_namespace("ns"));
        assert!(infra.deployments("ns").is_empty());
    }
}
