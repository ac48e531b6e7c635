//! Transport over the system OpenSSH client.
//!
//! Each session runs a ControlMaster in the background; commands and copies
//! multiplex over its control socket so only the first connect pays for the
//! handshake.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::options::{CommandOutput, Target};
use crate::transport::{Connector, Session, TransportError};

/// `ssh` exit status reserved for transport failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Connector driving `ssh` and `scp`.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    control_dir: Arc<TempDir>,
    connect_timeout: Duration,
}

impl OpenSshConnector {
    /// Create a connector with control sockets in a fresh temporary directory.
    pub fn new(connect_timeout: Duration) -> std::io::Result<Self> {
        let control_dir = tempfile::Builder::new().prefix("hostpool-ssh").tempdir()?;
        Ok(Self {
            control_dir: Arc::new(control_dir),
            connect_timeout,
        })
    }

    fn control_path(&self, target: &Target) -> PathBuf {
        let name: String = format!("{}-{}", target.address, target.port)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.control_dir.path().join(format!("{name}.sock"))
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, TransportError> {
        let session = OpenSshSession {
            target: target.clone(),
            control_path: self.control_path(target),
            connect_timeout: self.connect_timeout,
            // Keep the socket directory alive as long as any session.
            _control_dir: self.control_dir.clone(),
        };

        let output = session
            .ssh()
            .args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg(session.destination())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Connect(format!(
                "{}: {}",
                target,
                stderr.trim()
            )));
        }

        debug!(target = %target, control_path = %session.control_path.display(), "ControlMaster started");
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    target: Target,
    control_path: PathBuf,
    connect_timeout: Duration,
    _control_dir: Arc<TempDir>,
}

impl OpenSshSession {
    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.address)
    }

    /// `user@host:path`, bracketing IPv6 literals.
    fn scp_location(&self, remote: &str) -> String {
        if self.target.address.contains(':') {
            format!("{}@[{}]:{}", self.target.user, self.target.address, remote)
        } else {
            format!("{}:{}", self.destination(), remote)
        }
    }

    fn common_options(&self, command: &mut Command) {
        command
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if let Some(key) = &self.target.key_path {
            command.arg("-i").arg(key);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
    }

    fn ssh(&self) -> Command {
        let mut command = Command::new("ssh");
        self.common_options(&mut command);
        command.arg("-p").arg(self.target.port.to_string());
        command
    }

    fn scp(&self) -> Command {
        let mut command = Command::new("scp");
        self.common_options(&mut command);
        command.arg("-q").arg("-P").arg(self.target.port.to_string());
        command
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let output = self.scp().arg(from).arg(to).output().await?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(SSH_TRANSPORT_FAILURE) | None => Err(TransportError::Disconnected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Some(_) => Err(TransportError::Transfer(format!(
                "{from} -> {to}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

#[async_trait]
impl Session for OpenSshSession {
    async fn probe(&mut self) -> Result<(), TransportError> {
        let output = self
            .ssh()
            .args(["-O", "check"])
            .arg(self.destination())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Disconnected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        let output = self
            .ssh()
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match output.status.code() {
            Some(SSH_TRANSPORT_FAILURE) | None => Err(TransportError::Disconnected(stderr)),
            Some(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
            }),
        }
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let from = local.display().to_string();
        let to = self.scp_location(remote);
        self.copy(&from, &to).await
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let from = self.scp_location(remote);
        let to = local.display().to_string();
        self.copy(&from, &to).await
    }

    async fn close(&mut self) {
        let result = self
            .ssh()
            .args(["-O", "exit"])
            .arg(self.destination())
            .output()
            .await;
        if let Err(e) = result {
            warn!(target = %self.target, error = %e, "Failed to stop ControlMaster");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(address: &str) -> OpenSshSession {
        let connector = OpenSshConnector::new(Duration::from_secs(10)).unwrap();
        let target = Target::new(address, "centos").with_port(2222);
        OpenSshSession {
            control_path: connector.control_path(&target),
            target,
            connect_timeout: Duration::from_secs(10),
            _control_dir: connector.control_dir.clone(),
        }
    }

    #[test]
    fn test_control_path_is_sanitized() {
        let s = session("fd00::1");
        let name = s.control_path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "fd00__1-2222.sock");
    }

    #[test]
    fn test_scp_location() {
        assert_eq!(session("10.0.0.4").scp_location("/tmp/x"), "centos@10.0.0.4:/tmp/x");
        assert_eq!(session("fd00::1").scp_location("/tmp/x"), "centos@[fd00::1]:/tmp/x");
    }
}
