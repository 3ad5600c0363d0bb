//! Connector and command-log traits

use async_trait::async_trait;

use crate::channel::Channel;
use crate::error::ExecError;
use crate::result::CommandResult;
use crate::shell::Shell;

/// Establishes a [`Channel`] running `shell` for one transport kind
#[async_trait]
pub trait Connect: Send + Sync {
    /// Establish a new transport and start `shell` on it
    ///
    /// Produces one fresh channel per call. On error nothing stays open.
    async fn connect(&self, shell: Shell) -> Result<Channel, ExecError>;

    /// Human readable target (`local`, `user@host:port`, ...)
    fn target(&self) -> String;

    fn connector_type(&self) -> &'static str;
}

/// Receives every command a machine runs, unless logging was suppressed
pub trait CommandLog: Send + Sync {
    fn command(&self, machine: &str, command: &str, result: &CommandResult);
}
