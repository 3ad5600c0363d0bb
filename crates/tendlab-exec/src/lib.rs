//! tendlab-exec: Remote command execution
//!
//! Channels over local subprocesses and SSH sessions, the sentinel protocol
//! that turns a channel into a command shell, and machines composing the two.

pub mod channel;
pub mod connector;
pub mod error;
pub mod keys;
pub mod local;
pub mod machine;
pub mod result;
pub mod retry;
pub mod shell;
pub mod ssh;
pub mod ssh_command;
pub mod traits;

pub use channel::{Channel, ChannelState};
pub use connector::Connector;
pub use error::ExecError;
pub use keys::Credentials;
pub use local::LocalConnector;
pub use machine::{DEFAULT_COMMAND_TIMEOUT, ExecOptions, Machine, MachineBuilder};
pub use result::{CommandResult, ConnectionInfo};
pub use retry::{RetryPolicy, retry};
pub use shell::{Shell, command_line, quote};
pub use ssh::RusshConnector;
pub use ssh_command::SshCommandConnector;
pub use traits::{CommandLog, Connect};
