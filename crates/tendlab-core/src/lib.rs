//! tendlab-core: Testcase orchestration
//!
//! The invocation context and execution log, the typed configuration store,
//! machines described by configuration, and the shell tasks and fixtures
//! that lab testcases are built from.

pub mod config;
pub mod error;
pub mod invocation;
pub mod lab;
pub mod minisshd;
pub mod selftest;
pub mod tasks;
pub mod testcase;

pub use config::{Config, ConfigError, ConfigValue, FromConfig};
pub use error::{Error, TestcaseFailure};
pub use invocation::{Ctx, Frame, FrameInfo, FrameStatus, LogRecord, LogSink};
pub use lab::{DEFAULT_LABHOST, Lab, connector_from_config, machine_from_config};
pub use minisshd::{check_minisshd, minissh_lab_machine, minisshd};
pub use tasks::{TftpDirectory, cp_to_tftpdir, retrieve_build_artifact, setup_tftpdir};
pub use testcase::{Registry, Testcase};
