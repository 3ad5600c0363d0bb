//! Library-mediated SSH sessions using the russh crate

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::{Disconnect, client};
use tracing::{debug, info, instrument, warn};

use crate::channel::Channel;
use crate::error::ExecError;
use crate::keys::Credentials;
use crate::result::ConnectionInfo;
use crate::shell::{Marker, Shell};
use crate::traits::Connect;

/// Default limit for TCP connect, key exchange and the shell banner
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH client handler for russh
#[derive(Debug)]
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    ignore_hostkey: bool,
    rejected: Arc<AtomicBool>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.ignore_hostkey {
            debug!(host = %self.host, "accepting host key without verification");
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, port = self.port, "host key not in known_hosts");
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, "host key mismatch");
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// Connector for SSH sessions negotiated in-process
///
/// Every `connect()` opens a new SSH connection, runs the shell launch line
/// on a session channel and hands the session's stream out as a [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RusshConnector {
    /// Connection configuration
    info: ConnectionInfo,
    /// How to authenticate
    credentials: Credentials,
    /// Limit for establishing the session
    connect_timeout: Duration,
}

impl RusshConnector {
    /// Create a new connector
    #[must_use]
    pub fn new(info: ConnectionInfo, credentials: Credentials) -> Self {
        Self {
            info,
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
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

    fn connection_failed(&self, reason: impl Into<String>) -> ExecError {
        ExecError::ConnectionFailed {
            target: self.info.target(),
            reason: reason.into(),
        }
    }

    fn auth_failed(&self, reason: impl Into<String>) -> ExecError {
        ExecError::AuthenticationFailed {
            target: self.info.target(),
            reason: reason.into(),
        }
    }

    async fn handshake(&self) -> Result<client::Handle<ClientHandler>, ExecError> {
        let config = Arc::new(client::Config::default());
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            host: self.info.host.clone(),
            port: self.info.port,
            ignore_hostkey: self.info.ignore_hostkey,
            rejected: Arc::clone(&rejected),
        };

        let connecting = client::connect(config, (&self.info.host[..], self.info.port), handler);
        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(_)) if rejected.load(Ordering::SeqCst) => Err(ExecError::HostKeyRejected {
                target: self.info.target(),
            }),
            Ok(Err(e)) => Err(self.connection_failed(e.to_string())),
            Err(_) => Err(self.connection_failed(format!(
                "timed out after {:?} during SSH handshake",
                self.connect_timeout
            ))),
        }
    }

    async fn authenticate(&self, session: &mut client::Handle<ClientHandler>) -> Result<(), ExecError> {
        let user = &self.info.user;

        let success = match &self.credentials {
            Credentials::Agent => {
                return Err(self.auth_failed(
                    "SSH agent authentication is not supported for library sessions",
                ));
            }
            Credentials::Password(password) => session
                .authenticate_password(user, password)
                .await
                .map_err(|e| self.auth_failed(e.to_string()))?
                .success(),
            Credentials::KeyFile(_) | Credentials::KeyEnv(_) => {
                let key_pair = self
                    .credentials
                    .load_private_key()
                    .map_err(|e| ExecError::SshKeyError(e.to_string()))?
                    .ok_or_else(|| self.auth_failed("no private key available"))?;

                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                session
                    .authenticate_publickey(
                        user,
                        PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                    )
                    .await
                    .map_err(|e| self.auth_failed(e.to_string()))?
                    .success()
            }
        };

        if success {
            Ok(())
        } else {
            Err(self.auth_failed("server rejected credentials"))
        }
    }

    /// Authenticate and open the shell channel on an established session
    async fn open_shell(
        &self,
        session: &mut client::Handle<ClientHandler>,
        shell: Shell,
        marker: &Marker,
    ) -> Result<russh::Channel<client::Msg>, ExecError> {
        self.authenticate(session).await?;

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| self.connection_failed(format!("opening session channel: {e}")))?;

        let launch = format!("{}; {}", marker.banner_command(), shell.launch_line());
        channel
            .exec(true, launch)
            .await
            .map_err(|e| self.connection_failed(format!("starting shell: {e}")))?;

        Ok(channel)
    }
}

#[async_trait]
impl Connect for RusshConnector {
    #[instrument(skip(self), fields(target = %self.info.target()))]
    async fn connect(&self, shell: Shell) -> Result<Channel, ExecError> {
        info!(
            host = %self.info.host,
            port = self.info.port,
            user = %self.info.user,
            "connecting to SSH"
        );

        let mut session = self.handshake().await?;
        let marker = Marker::next();

        let ssh_channel = match self.open_shell(&mut session, shell, &marker).await {
            Ok(channel) => channel,
            Err(e) => {
                // no half-open sessions
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(ssh_channel.into_stream());
        let mut channel = Channel::from_session(self.info.target(), reader, writer, session);

        if let Err(e) = channel
            .read_until(&marker.banner_pattern(), Some(self.connect_timeout))
            .await
        {
            let _ = channel.close().await;
            return Err(self.connection_failed(format!("shell did not start: {e}")));
        }

        info!(target = %self.info.target(), "SSH connected and authenticated");
        Ok(channel)
    }

    fn target(&self) -> String {
        self.info.target()
    }

    fn connector_type(&self) -> &'static str {
        "russh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        // port 1 on localhost is essentially never listening
        let info = ConnectionInfo::new("127.0.0.1", "nobody").with_port(1);
        let connector = RusshConnector::new(info, Credentials::Password("x".to_string()))
            .with_connect_timeout(Duration::from_secs(5));

        let err = connector.connect(Shell::Sh).await.unwrap_err();
        assert!(matches!(err, ExecError::ConnectionFailed { .. }));
        assert!(err.is_connect_error());
    }

    #[tokio::test]
    async fn test_silent_server_handshake_timeout_is_connect_error() {
        // accepts TCP but never sends an SSH banner
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let info = ConnectionInfo::new("127.0.0.1", "nobody").with_port(port);
        let connector = RusshConnector::new(info, Credentials::Password("x".to_string()))
            .with_connect_timeout(Duration::from_millis(200));

        let err = connector.connect(Shell::Sh).await.unwrap_err();
        assert!(err.is_connect_error());
        let ExecError::ConnectionFailed { reason, .. } = err else {
            panic!("expected ConnectionFailed, got {err:?}");
        };
        assert!(reason.contains("timed out"));

        server.abort();
    }

    #[tokio::test]
    #[ignore = "requires SSH server on localhost with password auth (TENDLAB_SSH_PASSWORD)"]
    async fn test_russh_exec() {
        let user = std::env::var("USER").unwrap();
        let password = std::env::var("TENDLAB_SSH_PASSWORD").unwrap();
        let connector = RusshConnector::new(
            ConnectionInfo::new("localhost", user).ignore_hostkey(true),
            Credentials::Password(password),
        );

        let mut channel = connector.connect(Shell::Sh).await.unwrap();
        let result = Shell::Sh.exec(&mut channel, "echo hello", None).await.unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.output, "hello\n");
        channel.close().await.unwrap();
    }
}
