//! Result and descriptor types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a command execution
///
/// `output` holds stdout and stderr interleaved, exactly as the shell wrote
/// them to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// Captured output with sentinel artifacts removed
    pub output: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Connection information for an SSH target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
    /// Accept any host key (`StrictHostKeyChecking=no`)
    #[serde(default)]
    pub ignore_hostkey: bool,
    /// Extra `ssh -o` options, e.g. `"ServerAliveInterval=5"`
    #[serde(default)]
    pub ssh_config: Vec<String>,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            ignore_hostkey: false,
            ssh_config: Vec::new(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Accept unknown or changed host keys
    #[must_use]
    pub fn ignore_hostkey(mut self, ignore: bool) -> Self {
        self.ignore_hostkey = ignore;
        self
    }

    /// Add an `ssh -o` option
    #[must_use]
    pub fn with_ssh_option(mut self, option: impl Into<String>) -> Self {
        self.ssh_config.push(option.into());
        self
    }

    /// `user@host:port`, used in logs and errors
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_builder() {
        let info = ConnectionInfo::new("localhost", "tester")
            .with_port(2022)
            .ignore_hostkey(true)
            .with_ssh_option("ServerAliveInterval=5");

        assert_eq!(info.target(), "tester@localhost:2022");
        assert!(info.ignore_hostkey);
        assert_eq!(info.ssh_config, vec!["ServerAliveInterval=5"]);
    }

    #[test]
    fn test_connection_info_default_port() {
        let info: ConnectionInfo =
            serde_json::from_str(r#"{"host": "lab", "user": "root"}"#).unwrap();
        assert_eq!(info.port, 22);
        assert!(!info.ignore_hostkey);
    }
}
