//! reqwest-backed infra client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info};

use crate::types::{Execution, ListResponse, NodeInstance};
use crate::{InfraApi, InfraError, Result};

const API_PREFIX: &str = "/api/v3.1";

/// Header selecting the namespace a request applies to.
const TENANT_HEADER: &str = "Tenant";

/// Connection settings for the infra server.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    /// Base URL, e.g. `https://infra.example.com`.
    pub url: String,

    pub username: String,
    pub password: String,

    /// Accept self-signed server certificates.
    pub insecure: bool,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:80".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            insecure: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// REST client for the infra server.
#[derive(Debug, Clone)]
pub struct RestInfraClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestInfraClient {
    /// Create a new client.
    pub fn new(config: &InfraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn request(&self, method: Method, path: &str, namespace: Option<&str>) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(ns) = namespace {
            request = request.header(TENANT_HEADER, ns);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, what, "Infra request failed");

        Err(match status {
            StatusCode::NOT_FOUND => InfraError::NotFound(what.to_string()),
            StatusCode::CONFLICT => InfraError::Conflict(what.to_string()),
            _ => InfraError::Api {
                status: status.as_u16(),
                body,
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self.send(request, what).await?;
        response
            .json()
            .await
            .map_err(|e| InfraError::InvalidResponse(format!("{what}: {e}")))
    }
}

#[async_trait]
impl InfraApi for RestInfraClient {
    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let what = format!("namespace {namespace}");
        let request = self.request(Method::POST, &format!("/tenants/{namespace}"), None);
        self.send(request, &what).await?;
        info!(namespace, "Created namespace");
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let what = format!("namespace {namespace}");
        let request = self.request(Method::DELETE, &format!("/tenants/{namespace}"), None);
        self.send(request, &what).await?;
        info!(namespace, "Deleted namespace");
        Ok(())
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        template_id: &str,
        deployment_id: &str,
        inputs: &serde_json::Value,
    ) -> Result<()> {
        let what = format!("deployment {deployment_id}");
        let request = self
            .request(
                Method::PUT,
                &format!("/deployments/{deployment_id}"),
                Some(namespace),
            )
            .json(&json!({
                "blueprint_id": template_id,
                "inputs": inputs,
            }));
        self.send(request, &what).await?;
        debug!(namespace, deployment_id, template_id, "Created deployment");
        Ok(())
    }

    async fn start_execution(
        &self,
        namespace: &str,
        deployment_id: &str,
        workflow: &str,
    ) -> Result<Execution> {
        let what = format!("{workflow} execution on {deployment_id}");
        let request = self
            .request(Method::POST, "/executions", Some(namespace))
            .json(&json!({
                "deployment_id": deployment_id,
                "workflow_id": workflow,
            }));
        let execution: Execution = self.send_json(request, &what).await?;
        debug!(
            namespace,
            deployment_id,
            workflow,
            execution_id = %execution.id,
            "Started execution"
        );
        Ok(execution)
    }

    async fn get_execution(&self, namespace: &str, execution_id: &str) -> Result<Execution> {
        let what = format!("execution {execution_id}");
        let request = self.request(
            Method::GET,
            &format!("/executions/{execution_id}"),
            Some(namespace),
        );
        self.send_json(request, &what).await
    }

    async fn list_executions(
        &self,
        namespace: &str,
        deployment_id: Option<&str>,
    ) -> Result<Vec<Execution>> {
        let mut request = self.request(Method::GET, "/executions", Some(namespace));
        if let Some(id) = deployment_id {
            request = request.query(&[("deployment_id", id)]);
        }
        let list: ListResponse<Execution> = self.send_json(request, "executions").await?;
        Ok(list.items)
    }

    async fn cancel_execution(
        &self,
        namespace: &str,
        execution_id: &str,
        force: bool,
    ) -> Result<Execution> {
        let what = format!("cancel execution {execution_id}");
        let action = if force { "force-cancel" } else { "cancel" };
        let request = self
            .request(
                Method::POST,
                &format!("/executions/{execution_id}"),
                Some(namespace),
            )
            .json(&json!({ "action": action }));
        let execution: Execution = self.send_json(request, &what).await?;
        info!(namespace, execution_id, force, status = %execution.status, "Requested cancellation");
        Ok(execution)
    }

    async fn delete_deployment(&self, namespace: &str, deployment_id: &str) -> Result<()> {
        let what = format!("deployment {deployment_id}");
        let request = self.request(
            Method::DELETE,
            &format!("/deployments/{deployment_id}"),
            Some(namespace),
        );
        self.send(request, &what).await?;
        info!(namespace, deployment_id, "Deleted deployment");
        Ok(())
    }

    async fn get_node_instances(
        &self,
        namespace: &str,
        node_type: &str,
        deployment_id: &str,
    ) -> Result<Vec<NodeInstance>> {
        let what = format!("node instances of {deployment_id}");
        let request = self
            .request(Method::GET, "/node-instances", Some(namespace))
            .query(&[("deployment_id", deployment_id), ("node_id", node_type)]);
        let list: ListResponse<NodeInstance> = self.send_json(request, &what).await?;
        Ok(list.items)
    }
}
