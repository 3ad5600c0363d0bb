//! Local shells using `tokio::process`

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::channel::Channel;
use crate::error::ExecError;
use crate::shell::Shell;
use crate::traits::Connect;

/// Local subprocess connector
///
/// Spawns the shell as a child of this process; its stdin and merged
/// stdout/stderr become the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalConnector;

impl LocalConnector {
    /// Create a new local connector
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Build the command that launches `shell`
    pub(crate) fn shell_command(shell: Shell) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(shell.launch_line())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Connect for LocalConnector {
    #[instrument(skip(self), level = "debug")]
    async fn connect(&self, shell: Shell) -> Result<Channel, ExecError> {
        let child = Self::shell_command(shell)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        debug!(pid = ?child.id(), launch = shell.launch_line(), "spawned local shell");

        Channel::from_process("local", child).await
    }

    fn target(&self) -> String {
        "local".to_string()
    }

    fn connector_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_run() {
        let mut channel = LocalConnector::new().connect(Shell::Sh).await.unwrap();

        let result = Shell::Sh.exec(&mut channel, "echo hello", None).await.unwrap();
        assert!(result.success());
        assert_eq!(result.output, "hello\n");

        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_failure() {
        let mut channel = LocalConnector::new().connect(Shell::Sh).await.unwrap();

        let result = Shell::Sh.exec(&mut channel, "false", None).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.status, 1);

        // the shell survives failing commands
        let result = Shell::Sh.exec(&mut channel, "echo still here", None).await.unwrap();
        assert_eq!(result.output, "still here\n");

        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_ends_channel() {
        let mut channel = LocalConnector::new().connect(Shell::Sh).await.unwrap();

        let err = Shell::Sh.exec(&mut channel, "exit 4", None).await.unwrap_err();
        assert!(err.is_transport_error());

        channel.close().await.unwrap();
    }
}
