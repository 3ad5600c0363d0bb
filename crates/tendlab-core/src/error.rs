//! Core error types for tendlab-core

use std::fmt::Write as _;

use thiserror::Error;

use tendlab_exec::ExecError;

use crate::config::ConfigError;
use crate::invocation::FrameInfo;

/// Errors raised while running testcases
#[derive(Error, Debug)]
pub enum Error {
    /// Command execution or transport failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Configuration lookup failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A testcase check did not hold
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// A testcase argument is unusable
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No testcase with this name is registered
    #[error("unknown testcase '{0}'")]
    UnknownTestcase(String),

    /// Failure wrapped with the frame chain where it happened
    #[error(transparent)]
    Testcase(Box<TestcaseFailure>),
}

/// A failure and the chain of testcase frames that led to it
#[derive(Error, Debug)]
#[error("testcase '{name}' failed: {source}")]
pub struct TestcaseFailure {
    /// Innermost failing testcase
    pub name: String,
    /// Frames from the outermost testcase down to `name`
    pub trace: Vec<FrameInfo>,
    /// The underlying error
    #[source]
    pub source: Error,
}

impl Error {
    /// The underlying error with any testcase wrapping removed
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Error::Testcase(failure) => failure.source.root(),
            other => other,
        }
    }

    /// The execution error at the root, if that is what failed
    #[must_use]
    pub fn as_exec(&self) -> Option<&ExecError> {
        match self.root() {
            Error::Exec(e) => Some(e),
            _ => None,
        }
    }

    /// Frame chain recorded at the point of failure
    #[must_use]
    pub fn trace(&self) -> Option<&[FrameInfo]> {
        match self {
            Error::Testcase(failure) => Some(&failure.trace),
            _ => None,
        }
    }

    /// Human-readable invocation trace
    ///
    /// One line per frame, indented by depth, followed by the failing
    /// command with its status and output when a command failed.
    #[must_use]
    pub fn trace_report(&self) -> String {
        let mut out = String::new();

        for frame in self.trace().unwrap_or_default() {
            let _ = writeln!(
                out,
                "{}{}({})",
                "  ".repeat(frame.depth),
                frame.name,
                frame
                    .args
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        match self.root() {
            Error::Exec(ExecError::CommandFailed {
                machine,
                command,
                status,
                output,
            }) => {
                let _ = writeln!(out, "[{machine}] {command}");
                let _ = writeln!(out, "exit status: {status}");
                for line in output.lines() {
                    let _ = writeln!(out, "  | {line}");
                }
            }
            root => {
                let _ = writeln!(out, "{root}");
            }
        }

        out
    }
}
