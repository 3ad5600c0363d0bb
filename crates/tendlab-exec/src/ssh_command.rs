//! SSH sessions through the system `ssh` client
//!
//! The client runs either as a local child process or, for nested machines,
//! is `exec`ed inside a fresh shell obtained from a parent connector. In the
//! nested case the parent's channel carries the raw session bytes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument};

use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::ExecError;
use crate::keys::{Credentials, ResolvedKey};
use crate::result::ConnectionInfo;
use crate::shell::{Marker, Shell, command_line};
use crate::ssh::DEFAULT_CONNECT_TIMEOUT;
use crate::traits::Connect;

/// Connector running the `ssh` binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommandConnector {
    info: ConnectionInfo,
    credentials: Credentials,
    /// Run `ssh` inside a shell from this connector instead of locally
    via: Option<Box<Connector>>,
    connect_timeout: Duration,
}

impl SshCommandConnector {
    /// Create a connector that runs `ssh` locally
    #[must_use]
    pub fn new(info: ConnectionInfo, credentials: Credentials) -> Self {
        Self {
            info,
            credentials,
            via: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Launch `ssh` from a shell on the machine `parent` connects to
    ///
    /// Key files are then looked up on that machine.
    #[must_use]
    pub fn via(mut self, parent: Connector) -> Self {
        self.via = Some(Box::new(parent));
        self
    }

    /// Set the limit for establishing the session
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Parent connector, for nested sessions
    pub fn parent(&self) -> Option<&Connector> {
        self.via.as_deref()
    }

    /// Arguments for the `ssh` client, destination and remote command last
    fn ssh_args(&self, identity: Option<&str>, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.info.port.to_string(),
        ];
        if let Some(identity) = identity {
            args.push("-i".to_string());
            args.push(identity.to_string());
        }
        if self.info.ignore_hostkey {
            args.extend(
                [
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "UserKnownHostsFile=/dev/null",
                ]
                .map(String::from),
            );
        }
        for option in &self.info.ssh_config {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(format!("{}@{}", self.info.user, self.info.host));
        args.push(remote_command.to_string());
        args
    }

    /// Resolve credentials to an `-i` argument
    ///
    /// The returned key (if temporary) must outlive the session.
    fn identity(&self) -> Result<(Option<String>, Option<ResolvedKey>), ExecError> {
        if self.via.is_some() {
            return match &self.credentials {
                Credentials::Agent => Ok((None, None)),
                Credentials::KeyFile(path) => Ok((Some(path.display().to_string()), None)),
                other => Err(ExecError::SshKeyError(format!(
                    "{other:?} cannot be used for a nested ssh session"
                ))),
            };
        }

        let resolved = self
            .credentials
            .resolve_key_file()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        let identity = resolved.as_ref().map(|k| k.path().display().to_string());
        Ok((identity, resolved))
    }

    /// Turn a failure while waiting for the banner into a connect error
    fn classify(&self, err: ExecError) -> ExecError {
        let target = self.info.target();
        let details = match &err {
            ExecError::UnexpectedEof { tail, .. } => tail.clone(),
            other => other.to_string(),
        };

        if details.contains("Host key verification failed")
            || details.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
        {
            ExecError::HostKeyRejected { target }
        } else if details.contains("Permission denied") {
            ExecError::AuthenticationFailed {
                target,
                reason: details.trim().to_string(),
            }
        } else {
            ExecError::ConnectionFailed {
                target,
                reason: details.trim().to_string(),
            }
        }
    }
}

#[async_trait]
impl Connect for SshCommandConnector {
    #[instrument(skip(self), fields(target = %self.info.target()))]
    async fn connect(&self, shell: Shell) -> Result<Channel, ExecError> {
        let (identity, key) = self.identity()?;
        let marker = Marker::next();
        let remote_command = format!("{}; {}", marker.banner_command(), shell.launch_line());
        let args = self.ssh_args(identity.as_deref(), &remote_command);

        let mut channel = match &self.via {
            None => {
                info!(target = %self.info.target(), "spawning ssh");
                let child = Command::new("ssh")
                    .args(&args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| ExecError::SpawnError(format!("ssh: {e}")))?;
                merge_stderr(child, self.info.target()).await?
            }
            Some(parent) => {
                info!(
                    target = %self.info.target(),
                    via = %parent.target(),
                    "launching nested ssh"
                );
                let mut channel = parent.connect(Shell::Sh).await?;
                let line = format!("exec ssh {} 2>&1\n", command_line(&args));
                if let Err(e) = channel.write_all(line.as_bytes()).await {
                    let _ = channel.close().await;
                    return Err(e);
                }
                channel
            }
        };

        channel.rename(self.info.target());
        if let Some(key) = key {
            channel.attach_key(key);
        }

        if let Err(e) = channel
            .read_until(&marker.banner_pattern(), Some(self.connect_timeout))
            .await
        {
            let _ = channel.close().await;
            return Err(self.classify(e));
        }

        debug!(target = %self.info.target(), "ssh session ready");
        Ok(channel)
    }

    fn target(&self) -> String {
        match &self.via {
            Some(parent) => format!("{} via {}", self.info.target(), parent.target()),
            None => self.info.target(),
        }
    }

    fn connector_type(&self) -> &'static str {
        "ssh"
    }
}

/// Fold a local `ssh` client's stderr into its stdout stream
///
/// `ssh` reports connection problems on its own stderr, before the remote
/// shell with its merged streams is running.
async fn merge_stderr(mut child: Child, name: String) -> Result<Channel, ExecError> {
    let (Some(stdin), Some(mut stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill().await;
        return Err(ExecError::SpawnError("ssh: stdio not piped".to_string()));
    };

    let (merged_reader, mut merged_writer) = tokio::io::simplex(64 * 1024);
    tokio::spawn(async move {
        let mut out_buf = vec![0u8; 16 * 1024];
        let mut err_buf = vec![0u8; 4 * 1024];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            let (n, is_out) = tokio::select! {
                r = stdout.read(&mut out_buf), if out_open => (r.unwrap_or(0), true),
                r = stderr.read(&mut err_buf), if err_open => (r.unwrap_or(0), false),
            };
            if n == 0 {
                if is_out {
                    out_open = false;
                } else {
                    err_open = false;
                }
                continue;
            }
            let data = if is_out { &out_buf[..n] } else { &err_buf[..n] };
            if merged_writer.write_all(data).await.is_err() {
                break;
            }
        }
        let _ = merged_writer.shutdown().await;
    });

    Ok(Channel::from_process_parts(name, merged_reader, stdin, child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalConnector;

    fn connector() -> SshCommandConnector {
        SshCommandConnector::new(
            ConnectionInfo::new("localhost", "tester")
                .with_port(2022)
                .with_ssh_option("ServerAliveInterval=5"),
            Credentials::Agent,
        )
    }

    #[test]
    fn test_ssh_args() {
        let args = connector().ssh_args(Some("/keys/id"), "true");
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-p",
                "2022",
                "-i",
                "/keys/id",
                "-o",
                "ServerAliveInterval=5",
                "tester@localhost",
                "true",
            ]
        );
    }

    #[test]
    fn test_ignore_hostkey_args() {
        let mut info = connector().info;
        info.ignore_hostkey = true;
        let args = SshCommandConnector::new(info, Credentials::Agent).ssh_args(None, "true");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
    }

    #[test]
    fn test_nested_rejects_env_keys() {
        let nested = SshCommandConnector::new(
            ConnectionInfo::new("localhost", "tester"),
            Credentials::KeyEnv("SOME_KEY".to_string()),
        )
        .via(Connector::Local(LocalConnector::new()));
        assert!(matches!(nested.identity(), Err(ExecError::SshKeyError(_))));
        assert_eq!(nested.target(), "tester@localhost:22 via local");
    }

    #[test]
    fn test_classify() {
        let c = connector();
        let eof = |tail: &str| ExecError::UnexpectedEof {
            channel: "ssh".to_string(),
            received: tail.len(),
            tail: tail.to_string(),
        };

        assert!(matches!(
            c.classify(eof("tester@localhost: Permission denied (publickey).")),
            ExecError::AuthenticationFailed { .. }
        ));
        assert!(matches!(
            c.classify(eof("Host key verification failed.")),
            ExecError::HostKeyRejected { .. }
        ));
        assert!(matches!(
            c.classify(eof("ssh: connect to host localhost port 2022: Connection refused")),
            ExecError::ConnectionFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let connector = SshCommandConnector::new(
            ConnectionInfo::new("127.0.0.1", "nobody")
                .with_port(1)
                .ignore_hostkey(true),
            Credentials::Agent,
        )
        .with_connect_timeout(Duration::from_secs(10));

        match connector.connect(Shell::Sh).await {
            Err(e) => assert!(e.is_connect_error()),
            Ok(_) => panic!("connected to port 1"),
        }
    }

    #[tokio::test]
    #[ignore = "requires key-based SSH login to localhost for the current user"]
    async fn test_ssh_command_exec() {
        use crate::machine::Machine;

        let user = std::env::var("USER").unwrap();
        let direct = SshCommandConnector::new(
            ConnectionInfo::new("localhost", user.clone()).ignore_hostkey(true),
            Credentials::Agent,
        );
        let nested = SshCommandConnector::new(
            ConnectionInfo::new("localhost", user).ignore_hostkey(true),
            Credentials::Agent,
        )
        .via(Connector::Local(LocalConnector::new()));

        for connector in [direct, nested] {
            let mut m = Machine::builder("ssh-localhost").connector(connector).build();
            m.enter().await.unwrap();

            assert_eq!(m.exec0("true").await.unwrap(), "");
            let err = m.exec0("false").await.unwrap_err();
            assert_eq!(err.exit_status(), Some(1));
            assert_eq!(m.exec0("echo hello").await.unwrap(), "hello\n");

            m.exit().await.unwrap();
        }
    }
}
