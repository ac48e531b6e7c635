//! Connection-owning command channel for one host.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hostpool_retry::{retry, RetryPolicy};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::options::{CommandOutput, RunOptions, Shell, Target};
use crate::transport::{Connector, Session, TransportError};
use crate::{RemoteError, Result};

/// Command channel to a single host.
///
/// Safe to share between tasks; commands on one channel are serialised.
pub struct RemoteChannel {
    target: Target,
    connector: Arc<dyn Connector>,
    reconnect: RetryPolicy,
    session: Mutex<Option<Box<dyn Session>>>,
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("target", &self.target)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl RemoteChannel {
    /// Create a channel. No connection is made until the first command.
    pub fn new(target: Target, connector: Arc<dyn Connector>, reconnect: RetryPolicy) -> Self {
        Self {
            target,
            connector,
            reconnect,
            session: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Run a command and capture its output.
    ///
    /// A non-zero exit is an error unless `warn_only` is set. A session that
    /// drops mid-command is replaced and the command re-issued.
    pub async fn run(&self, command: &str, options: &RunOptions) -> Result<CommandOutput> {
        let shell = options.shell.unwrap_or(self.target.shell);
        let wrapped = wrap_command(command, shell, options.elevated);
        let command_line = wrapped.as_str();

        info!(
            host = %self.target.address,
            command,
            elevated = options.elevated,
            "Running remote command"
        );

        let output = self
            .with_reconnect("run", || self.exec_once(command_line))
            .await?;

        if options.hide_output {
            debug!(
                host = %self.target.address,
                exit_code = output.exit_code,
                "Remote command finished"
            );
        } else {
            debug!(
                host = %self.target.address,
                exit_code = output.exit_code,
                stdout = %output.stdout.trim_end(),
                stderr = %output.stderr.trim_end(),
                "Remote command finished"
            );
        }

        if !output.success() {
            if !options.warn_only {
                return Err(RemoteError::Command {
                    command: command.to_string(),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
            warn!(
                host = %self.target.address,
                command,
                exit_code = output.exit_code,
                "Remote command failed, continuing"
            );
        }

        Ok(output)
    }

    /// Upload a local file.
    pub async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %self.target.address, local = %local.display(), remote, "Uploading file");
        self.with_reconnect("upload", || self.upload_once(local, remote))
            .await
    }

    /// Download a remote file.
    pub async fn get_file(&self, remote: &str, local: &Path) -> Result<()> {
        debug!(host = %self.target.address, remote, local = %local.display(), "Downloading file");
        self.with_reconnect("download", || self.download_once(remote, local))
            .await
    }

    /// Read a remote text file.
    pub async fn read_file(&self, remote: &str) -> Result<String> {
        let staging = tempfile::NamedTempFile::new()?;
        self.get_file(remote, staging.path()).await?;
        Ok(tokio::fs::read_to_string(staging.path()).await?)
    }

    /// Replace a remote file's contents.
    ///
    /// Elevated writes on POSIX hosts are staged in `/tmp` and moved into
    /// place with `sudo`.
    pub async fn write_file(&self, remote: &str, contents: &str, elevated: bool) -> Result<()> {
        let staging = tempfile::NamedTempFile::new()?;
        tokio::fs::write(staging.path(), contents).await?;

        if !elevated || self.target.shell == Shell::PowerShell {
            return self.put_file(staging.path(), remote).await;
        }

        let file_name = remote.rsplit('/').next().unwrap_or(remote);
        let staged = format!("/tmp/.hostpool-stage-{file_name}");
        self.put_file(staging.path(), &staged).await?;
        self.run(
            &format!("mv {} {}", shell_quote(&staged), shell_quote(remote)),
            &RunOptions::new().elevated(),
        )
        .await?;
        Ok(())
    }

    /// Close the current session, if any. The next command reconnects.
    pub async fn close(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.close().await;
            debug!(host = %self.target.address, "Session closed");
        }
    }

    async fn with_reconnect<T, F, Fut>(&self, operation: &str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let operation_name = format!("{operation} on {}", self.target.address);
        retry(
            &self.reconnect,
            &operation_name,
            |e: &TransportError| e.is_session_lost(),
            attempt,
        )
        .await
        .map_err(|source| match source {
            TransportError::Transfer(reason) => RemoteError::Transfer(reason),
            source => RemoteError::Connection {
                target: self.target.to_string(),
                attempts: self.reconnect.max_attempts.max(1),
                source,
            },
        })
    }

    async fn exec_once(&self, command: &str) -> std::result::Result<CommandOutput, TransportError> {
        let mut slot = self.session.lock().await;
        let result = self.live_session(&mut slot).await?.exec(command).await;
        if let Err(e) = &result {
            self.discard(&mut slot, e).await;
        }
        result
    }

    async fn upload_once(
        &self,
        local: &Path,
        remote: &str,
    ) -> std::result::Result<(), TransportError> {
        let mut slot = self.session.lock().await;
        let result = self.live_session(&mut slot).await?.upload(local, remote).await;
        if let Err(e) = &result {
            self.discard(&mut slot, e).await;
        }
        result
    }

    async fn download_once(
        &self,
        remote: &str,
        local: &Path,
    ) -> std::result::Result<(), TransportError> {
        let mut slot = self.session.lock().await;
        let result = self.live_session(&mut slot).await?.download(remote, local).await;
        if let Err(e) = &result {
            self.discard(&mut slot, e).await;
        }
        result
    }

    /// Return a session that passed a liveness probe, connecting if needed.
    async fn live_session<'a>(
        &self,
        slot: &'a mut Option<Box<dyn Session>>,
    ) -> std::result::Result<&'a mut Box<dyn Session>, TransportError> {
        if let Some(session) = slot.as_mut() {
            if let Err(e) = session.probe().await {
                warn!(host = %self.target.address, error = %e, "Liveness probe failed, reconnecting");
                session.close().await;
                *slot = None;
            }
        }

        if slot.is_none() {
            debug!(target = %self.target, "Connecting");
            let session = self.connector.connect(&self.target).await?;
            info!(target = %self.target, "Connected");
            *slot = Some(session);
        }

        slot.as_mut()
            .ok_or_else(|| TransportError::Disconnected("no session".to_string()))
    }

    async fn discard(&self, slot: &mut Option<Box<dyn Session>>, error: &TransportError) {
        if !error.is_session_lost() {
            return;
        }
        warn!(host = %self.target.address, error = %error, "Session lost");
        if let Some(mut session) = slot.take() {
            session.close().await;
        }
    }
}

/// Wrap a command for the target shell.
fn wrap_command(command: &str, shell: Shell, elevated: bool) -> String {
    match shell {
        Shell::Posix if elevated => format!("sudo -n sh -c {}", shell_quote(command)),
        Shell::Posix => command.to_string(),
        // The remote user is an administrator; there is no sudo equivalent.
        Shell::PowerShell => format!(
            "powershell -NoProfile -NonInteractive -EncodedCommand {}",
            encode_powershell(command)
        ),
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Encode a script for `powershell -EncodedCommand` (base64 of UTF-16LE).
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockMachine};
    use rstest::rstest;
    use std::time::Duration;

    fn channel_for(connector: &Arc<MockConnector>, address: &str) -> RemoteChannel {
        RemoteChannel::new(
            Target::new(address, "centos"),
            connector.clone(),
            RetryPolicy::new(3, Duration::from_secs(5)),
        )
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("/tmp/a_b-c.json", "/tmp/a_b-c.json")]
    #[case("two words", "'two words'")]
    #[case("it's", r"'it'\''s'")]
    #[case("", "''")]
    fn test_shell_quote(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[test]
    fn test_wrap_elevated_posix() {
        assert_eq!(
            wrap_command("echo 'hi'", Shell::Posix, true),
            r"sudo -n sh -c 'echo '\''hi'\'''"
        );
        assert_eq!(wrap_command("id -u", Shell::Posix, false), "id -u");
    }

    #[test]
    fn test_encode_powershell() {
        assert_eq!(encode_powershell("dir"), "ZABpAHIA");
        assert!(wrap_command("dir", Shell::PowerShell, true).ends_with("-EncodedCommand ZABpAHIA"));
    }

    #[tokio::test]
    async fn test_connects_lazily() {
        let machine = MockMachine::new();
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine.clone());

        let channel = channel_for(&connector, "10.0.0.1");
        assert_eq!(machine.connects(), 0);

        channel.run("true", &RunOptions::new()).await.unwrap();
        channel.run("true", &RunOptions::new()).await.unwrap();
        assert_eq!(machine.connects(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let machine = MockMachine::new();
        machine.set_handler(|_, _| CommandOutput::failed(3, "boom"));
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine);
        let channel = channel_for(&connector, "10.0.0.1");

        let err = channel.run("false", &RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Command { exit_code: 3, ref stderr, .. } if stderr == "boom"));

        let output = channel
            .run("false", &RunOptions::new().warn_only())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_failed_probe_reconnects() {
        let machine = MockMachine::new();
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine.clone());
        let channel = channel_for(&connector, "10.0.0.1");

        channel.run("true", &RunOptions::new()).await.unwrap();
        machine.sever_sessions();
        channel.run("true", &RunOptions::new()).await.unwrap();

        assert_eq!(machine.connects(), 2);
        assert_eq!(machine.commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_is_connection_error() {
        let machine = MockMachine::new();
        machine.set_unreachable(true);
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine);
        let channel = channel_for(&connector, "10.0.0.1");

        let err = channel.run("true", &RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Connection { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let machine = MockMachine::new();
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine.clone());
        let channel = channel_for(&connector, "10.0.0.1");

        channel
            .write_file("/tmp/config.json", "{\"a\":1}", false)
            .await
            .unwrap();
        assert_eq!(machine.file("/tmp/config.json").as_deref(), Some("{\"a\":1}"));

        let contents = channel.read_file("/tmp/config.json").await.unwrap();
        assert_eq!(contents, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_retried() {
        let machine = MockMachine::new();
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine.clone());
        let channel = channel_for(&connector, "10.0.0.1");

        let err = channel.read_file("/etc/missing").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transfer(_)));
        assert_eq!(machine.connects(), 1);
    }

    #[tokio::test]
    async fn test_elevated_write_moves_into_place() {
        let machine = MockMachine::new();
        let connector = Arc::new(MockConnector::new());
        connector.add_machine("10.0.0.1", machine.clone());
        let channel = channel_for(&connector, "10.0.0.1");

        channel
            .write_file("/etc/svc/config.yaml", "x: 1", true)
            .await
            .unwrap();

        assert_eq!(machine.file("/tmp/.hostpool-stage-config.yaml").as_deref(), Some("x: 1"));
        assert_eq!(
            machine.commands(),
            vec!["sudo -n sh -c 'mv /tmp/.hostpool-stage-config.yaml /etc/svc/config.yaml'"]
        );
    }
}
