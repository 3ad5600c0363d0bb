//! Error types for tendlab-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while connecting to or driving a machine
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to establish the transport (unreachable host, early EOF, ...)
    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed {
        /// Connector description (`user@host:port`, `local`, ...)
        target: String,
        /// What went wrong
        reason: String,
    },

    /// Authentication failed
    #[error("authentication to {target} failed: {reason}")]
    AuthenticationFailed {
        /// Connector description
        target: String,
        /// What went wrong
        reason: String,
    },

    /// Server host key was unknown or did not match `known_hosts`
    #[error("host key of {target} rejected")]
    HostKeyRejected {
        /// Connector description
        target: String,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// Read or write on a channel that was already closed
    #[error("channel {channel} is closed")]
    ChannelClosed {
        /// Channel name
        channel: String,
    },

    /// Stream ended before the expected pattern showed up
    #[error("unexpected end of stream on {channel} after {received} bytes: {tail:?}")]
    UnexpectedEof {
        /// Channel name
        channel: String,
        /// Bytes received while waiting
        received: usize,
        /// Last bytes received, for diagnostics
        tail: String,
    },

    /// I/O error on the underlying transport
    #[error("I/O error on {channel}: {reason}")]
    IoError {
        /// Channel name
        channel: String,
        /// Error message
        reason: String,
    },

    /// A read did not complete in time
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// The remote side sent something the sentinel protocol cannot parse
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Machine used before `enter()` or after `exit()`
    #[error("machine {0} is not connected")]
    NotConnected(String),

    /// Command exited with a non-zero status (`exec0`)
    #[error("`{command}` on {machine} exited with status {status}")]
    CommandFailed {
        /// Machine the command ran on
        machine: String,
        /// Command line
        command: String,
        /// Exit status
        status: i32,
        /// Captured output
        output: String,
    },

    /// A bounded polling loop ran out of attempts
    #[error("gave up waiting for {what} after {attempts} attempts")]
    RetryExhausted {
        /// The condition that never became true
        what: String,
        /// Number of attempts made
        attempts: u32,
    },
}

impl ExecError {
    /// Whether this error happened while establishing a transport
    #[must_use]
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed { .. }
                | ExecError::AuthenticationFailed { .. }
                | ExecError::HostKeyRejected { .. }
                | ExecError::SpawnError(_)
                | ExecError::SshKeyError(_)
        )
    }

    /// Whether this error left the machine's channel unusable
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            ExecError::ChannelClosed { .. }
                | ExecError::UnexpectedEof { .. }
                | ExecError::IoError { .. }
                | ExecError::Timeout { .. }
                | ExecError::Protocol(_)
                | ExecError::NotConnected(_)
        )
    }

    /// Check if re-acquiring the machine may help
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed { .. }
                | ExecError::Timeout { .. }
                | ExecError::UnexpectedEof { .. }
        )
    }

    /// Exit status of a failed command, if this is a command failure
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let connect = ExecError::HostKeyRejected {
            target: "root@lab:22".to_string(),
        };
        assert!(connect.is_connect_error());
        assert!(!connect.is_transport_error());

        let eof = ExecError::UnexpectedEof {
            channel: "lab".to_string(),
            received: 3,
            tail: "abc".to_string(),
        };
        assert!(eof.is_transport_error());
        assert!(eof.is_retryable());

        let failed = ExecError::CommandFailed {
            machine: "lab".to_string(),
            command: "false".to_string(),
            status: 1,
            output: String::new(),
        };
        assert!(!failed.is_transport_error());
        assert_eq!(failed.exit_status(), Some(1));
    }
}
