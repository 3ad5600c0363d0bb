//! The closed set of transports a machine can use

use async_trait::async_trait;

use crate::channel::Channel;
use crate::error::ExecError;
use crate::local::LocalConnector;
use crate::shell::Shell;
use crate::ssh::RusshConnector;
use crate::ssh_command::SshCommandConnector;
use crate::traits::Connect;

/// Transport descriptor
///
/// Immutable; every `connect()` establishes a new transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connector {
    /// Local subprocess
    Local(LocalConnector),
    /// System `ssh` client, possibly launched from a parent machine
    SshCommand(SshCommandConnector),
    /// In-process SSH session
    Russh(RusshConnector),
}

impl Connector {
    /// Local shell
    #[must_use]
    pub fn local() -> Self {
        Connector::Local(LocalConnector::new())
    }

    fn inner(&self) -> &dyn Connect {
        match self {
            Connector::Local(c) => c,
            Connector::SshCommand(c) => c,
            Connector::Russh(c) => c,
        }
    }
}

impl From<LocalConnector> for Connector {
    fn from(c: LocalConnector) -> Self {
        Connector::Local(c)
    }
}

impl From<SshCommandConnector> for Connector {
    fn from(c: SshCommandConnector) -> Self {
        Connector::SshCommand(c)
    }
}

impl From<RusshConnector> for Connector {
    fn from(c: RusshConnector) -> Self {
        Connector::Russh(c)
    }
}

#[async_trait]
impl Connect for Connector {
    async fn connect(&self, shell: Shell) -> Result<Channel, ExecError> {
        self.inner().connect(shell).await
    }

    fn target(&self) -> String {
        self.inner().target()
    }

    fn connector_type(&self) -> &'static str {
        self.inner().connector_type()
    }
}
