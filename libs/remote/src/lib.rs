//! Remote command channel.
//!
//! A [`RemoteChannel`] owns the connection to one pool host. It connects
//! lazily on first use, probes liveness before reusing a session and
//! reconnects with a bounded fixed-delay policy when the transport drops.
//!
//! The transport itself sits behind the [`Connector`] / [`Session`] traits:
//!
//! - [`OpenSshConnector`]: the system `ssh`/`scp` binaries with a
//!   ControlMaster socket per host
//! - [`mock::MockConnector`]: in-memory machines for tests

use thiserror::Error;

mod channel;
pub mod mock;
mod openssh;
mod options;
mod transport;

pub use channel::{encode_powershell, shell_quote, RemoteChannel};
pub use openssh::OpenSshConnector;
pub use options::{CommandOutput, RunOptions, Shell, Target};
pub use transport::{Connector, Session, TransportError};

/// Remote channel errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The transport could not be (re)established within the reconnect bound.
    #[error("connection to {target} failed after {attempts} attempts: {source}")]
    Connection {
        target: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The command ran and exited non-zero.
    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// A file transfer failed on an otherwise healthy session.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// Local staging file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Returns true for transport failures.
    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection { .. })
    }
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;
