//! Transport seam between the channel and a concrete remote shell.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::options::{CommandOutput, Target};

/// Transport-level failures. The channel reconnects and retries those for
/// which [`is_session_lost`](TransportError::is_session_lost) holds; a failed
/// transfer is returned as is.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    /// The session went away; a fresh one is needed.
    #[error("session lost: {0}")]
    Disconnected(String),

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true if the session is unusable and must be replaced.
    ///
    /// A failed transfer (e.g. a missing remote file) leaves the session intact.
    pub fn is_session_lost(&self) -> bool {
        !matches!(self, TransportError::Transfer(_))
    }
}

/// Opens sessions to targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, TransportError>;
}

/// An established session to one host.
#[async_trait]
pub trait Session: Send {
    /// Cheap liveness check.
    async fn probe(&mut self) -> Result<(), TransportError>;

    /// Run a command that has already been wrapped for the remote shell.
    ///
    /// A non-zero exit is a successful call; only transport failures are errors.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError>;

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError>;

    /// Tear the session down. Best effort.
    async fn close(&mut self);
}
