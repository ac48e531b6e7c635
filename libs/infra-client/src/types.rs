//! Wire types shared by the REST client and the in-memory fake.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Workflow that the infra server runs when a deployment is created.
///
/// Cancelling it leaves the deployment unusable, so teardown never touches it.
pub const ENVIRONMENT_SETUP_WORKFLOW: &str = "create_deployment_environment";

/// Workflow that creates the VM behind a deployment.
pub const INSTALL_WORKFLOW: &str = "install";

/// Workflow that releases the VM behind a deployment.
pub const UNINSTALL_WORKFLOW: &str = "uninstall";

/// Server-side job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Scheduled,
    Started,
    Cancelling,
    ForceCancelling,
    Cancelled,
    Terminated,
    Failed,
}

impl ExecutionStatus {
    /// Returns true once the execution can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Terminated | Self::Failed)
    }

    /// Returns true if the execution finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Cancelling => "cancelling",
            Self::ForceCancelling => "force_cancelling",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A server-side job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub deployment_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Returns true for the protected environment-setup job.
    pub fn is_environment_setup(&self) -> bool {
        self.workflow_id == ENVIRONMENT_SETUP_WORKFLOW
    }
}

/// A provisioned node instance; runtime properties carry the VM's addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    pub node_id: String,
    pub deployment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub runtime_properties: serde_json::Map<String, serde_json::Value>,
}

impl NodeInstance {
    fn str_property(&self, key: &str) -> Option<&str> {
        self.runtime_properties.get(key).and_then(|v| v.as_str())
    }

    /// Externally reachable address.
    pub fn public_ip(&self) -> Option<&str> {
        self.str_property("public_ip")
    }

    /// Address on the pool's private network.
    pub fn private_ip(&self) -> Option<&str> {
        self.str_property("ip")
    }

    /// Opaque server identifier assigned by the infra backend.
    pub fn server_id(&self) -> Option<&str> {
        self.str_property("external_id")
    }

    /// Network name to address map. Non-string entries are skipped.
    pub fn networks(&self) -> BTreeMap<String, String> {
        self.runtime_properties
            .get("networks")
            .and_then(|v| v.as_object())
            .map(|nets| {
                nets.iter()
                    .filter_map(|(name, addr)| {
                        addr.as_str().map(|a| (name.clone(), a.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Paginated list envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse<T> {
    pub items: Vec<T>,
}
