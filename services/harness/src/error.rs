//! Error types for the harness.

use hostpool_infra::InfraError;
use hostpool_pki::PkiError;
use hostpool_remote::RemoteError;
use thiserror::Error;

/// Harness errors.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The remote channel to a host could not be (re)established.
    #[error("connection to {host} failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: RemoteError,
    },

    /// A remote command exited non-zero.
    #[error("command `{command}` on {host} exited with status {exit_code}: {stderr}")]
    Command {
        host: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The bootstrap job left its failure sentinel.
    #[error("bootstrap failed on {host}:\n{diagnostics}")]
    BootstrapFailed { host: String, diagnostics: String },

    /// The infra server could not provision a host.
    #[error("provisioning failed for {host}: {reason}")]
    ProvisioningFailed { host: String, reason: String },

    /// Server-side jobs did not stop; teardown was halted.
    #[error("cancellation in namespace {namespace} did not converge, still running: {pending:?}")]
    CancellationFailed {
        namespace: String,
        pending: Vec<String>,
    },

    /// Inconsistent caller-supplied topology or settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("infra error: {0}")]
    Infra(#[from] InfraError),

    #[error("certificate error: {0}")]
    Pki(#[from] PkiError),

    /// A polling bound was exhausted.
    #[error("{operation} on {host} did not finish after {attempts} attempts")]
    Timeout {
        host: String,
        operation: String,
        attempts: u32,
    },

    /// Services reported unhealthy after setup finished.
    #[error("{host} is unhealthy: {detail}")]
    Unhealthy { host: String, detail: String },

    /// An operation was called in a state that does not allow it.
    #[error("invalid state for {host}: {detail}")]
    InvalidState { host: String, detail: String },

    #[error("invalid bootstrap document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Attribute a remote channel error to a host.
    pub fn remote(host: &str, error: RemoteError) -> Self {
        match error {
            RemoteError::Command {
                command,
                exit_code,
                stdout,
                stderr,
            } => HarnessError::Command {
                host: host.to_string(),
                command,
                exit_code,
                stdout,
                stderr,
            },
            source => HarnessError::Connection {
                host: host.to_string(),
                source,
            },
        }
    }

    /// Short machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            HarnessError::Connection { .. } => "connection_error",
            HarnessError::Command { .. } => "command_error",
            HarnessError::BootstrapFailed { .. } => "bootstrap_failed",
            HarnessError::ProvisioningFailed { .. } => "provisioning_failed",
            HarnessError::CancellationFailed { .. } => "cancellation_failed",
            HarnessError::Configuration(_) => "configuration_error",
            HarnessError::Infra(_) => "infra_error",
            HarnessError::Pki(_) => "pki_error",
            HarnessError::Timeout { .. } => "timeout",
            HarnessError::Unhealthy { .. } => "unhealthy",
            HarnessError::InvalidState { .. } => "invalid_state",
            HarnessError::Serialization(_) => "serialization_error",
            HarnessError::Io(_) => "io_error",
        }
    }
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
