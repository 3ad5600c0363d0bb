//! Machines described by configuration
//!
//! Each machine lives under `machines.<name>`:
//!
//! ```toml
//! [machines.labhost]
//! connector = "ssh"          # local | ssh | russh
//! shell = "bash"             # sh | bash
//! host = "lab.example.com"
//! user = "tester"
//! port = 22
//! key = { path = "/home/tester/.ssh/id_ed25519" }   # or key_env / password
//! ssh_config = ["ServerAliveInterval=10"]
//! ignore_hostkey = false
//! workdir = { path = "/tmp/tendlab-wd" }
//! timeout = 300
//!
//! [machines.board]
//! connector = "ssh"
//! via = "labhost"            # ssh is started from the lab host
//! host = "192.168.0.42"
//! user = "root"
//! ```
//!
//! A missing `machines.labhost` section means a local lab host.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tendlab_exec::{
    CommandLog, ConnectionInfo, Connector, Credentials, DEFAULT_COMMAND_TIMEOUT, LocalConnector,
    Machine, RusshConnector, Shell, SshCommandConnector,
};

use crate::config::{Config, ConfigError};
use crate::error::Error;
use crate::invocation::LogSink;

/// Name of the lab host machine unless `lab.machine` says otherwise
pub const DEFAULT_LABHOST: &str = "labhost";

/// Deepest `via` chain accepted before assuming a cycle
const MAX_VIA_DEPTH: usize = 8;

/// Build the connector described by `machines.<name>`
///
/// # Errors
/// Missing or mistyped keys, unknown connector kinds, `via` on a library
/// SSH connector, and `via` cycles
pub fn connector_from_config(config: &Config, name: &str) -> Result<Connector, ConfigError> {
    connector_at_depth(config, name, 0)
}

fn connector_at_depth(config: &Config, name: &str, depth: usize) -> Result<Connector, ConfigError> {
    let prefix = format!("machines.{name}");
    let key = |field: &str| format!("{prefix}.{field}");

    if !config.contains(&prefix) {
        if name == DEFAULT_LABHOST {
            return Ok(Connector::local());
        }
        return Err(ConfigError::Missing(prefix.clone()));
    }

    let kind: String = config.get_or(&key("connector"), "local".to_string())?;
    match kind.as_str() {
        "local" => Ok(LocalConnector::new().into()),
        "ssh" => {
            let mut connector =
                SshCommandConnector::new(connection_info(config, &prefix)?, credentials(config, &prefix)?);
            if let Some(timeout) = config.get_opt::<Duration>(&key("connect_timeout"))? {
                connector = connector.with_connect_timeout(timeout);
            }
            if let Some(parent) = config.get_opt::<String>(&key("via"))? {
                if depth >= MAX_VIA_DEPTH {
                    return Err(ConfigError::InvalidValue {
                        key: key("via"),
                        reason: format!("'via' chain deeper than {MAX_VIA_DEPTH}, is there a cycle?"),
                    });
                }
                debug!(machine = name, via = %parent, "nested ssh connector");
                connector = connector.via(connector_at_depth(config, &parent, depth + 1)?);
            }
            Ok(connector.into())
        }
        "russh" => {
            if config.contains(&key("via")) {
                return Err(ConfigError::InvalidValue {
                    key: key("via"),
                    reason: "only the 'ssh' connector can be started from another machine".into(),
                });
            }
            let mut connector =
                RusshConnector::new(connection_info(config, &prefix)?, credentials(config, &prefix)?);
            if let Some(timeout) = config.get_opt::<Duration>(&key("connect_timeout"))? {
                connector = connector.with_connect_timeout(timeout);
            }
            Ok(connector.into())
        }
        other => Err(ConfigError::InvalidValue {
            key: key("connector"),
            reason: format!("unknown connector '{other}' (expected local, ssh or russh)"),
        }),
    }
}

fn connection_info(config: &Config, prefix: &str) -> Result<ConnectionInfo, ConfigError> {
    let host: String = config.get(&format!("{prefix}.host"))?;
    let user: String = config.get(&format!("{prefix}.user"))?;
    let port: u16 = config.get_or(&format!("{prefix}.port"), 22)?;
    let ignore: bool = config.get_or(&format!("{prefix}.ignore_hostkey"), false)?;
    let options: Vec<String> = config.get_or(&format!("{prefix}.ssh_config"), Vec::new())?;

    Ok(options.into_iter().fold(
        ConnectionInfo::new(host, user)
            .with_port(port)
            .ignore_hostkey(ignore),
        ConnectionInfo::with_ssh_option,
    ))
}

fn credentials(config: &Config, prefix: &str) -> Result<Credentials, ConfigError> {
    let key_file = config.get_opt::<PathBuf>(&format!("{prefix}.key"))?;
    let key_env = config.get_opt::<String>(&format!("{prefix}.key_env"))?;
    let password = config.get_opt::<String>(&format!("{prefix}.password"))?;

    match (key_file, key_env, password) {
        (None, None, None) => Ok(Credentials::Agent),
        (Some(path), None, None) => Ok(Credentials::KeyFile(path)),
        (None, Some(var), None) => Ok(Credentials::KeyEnv(var)),
        (None, None, Some(password)) => Ok(Credentials::Password(password)),
        _ => Err(ConfigError::InvalidValue {
            key: prefix.to_string(),
            reason: "set at most one of 'key', 'key_env' and 'password'".into(),
        }),
    }
}

fn shell_from_config(config: &Config, prefix: &str) -> Result<Shell, ConfigError> {
    let key = format!("{prefix}.shell");
    match config.get_or(&key, "sh".to_string())?.as_str() {
        "sh" => Ok(Shell::Sh),
        "bash" => Ok(Shell::Bash),
        other => Err(ConfigError::InvalidValue {
            key,
            reason: format!("unknown shell '{other}' (expected sh or bash)"),
        }),
    }
}

/// Build the (not yet entered) machine described by `machines.<name>`
///
/// # Errors
/// See [`connector_from_config`]
pub fn machine_from_config(
    config: &Config,
    name: &str,
    log: Option<Arc<dyn CommandLog>>,
) -> Result<Machine, ConfigError> {
    let prefix = format!("machines.{name}");

    let mut builder = Machine::builder(name)
        .connector(connector_from_config(config, name)?)
        .shell(shell_from_config(config, &prefix)?)
        .timeout(Some(
            config.get_or(&format!("{prefix}.timeout"), DEFAULT_COMMAND_TIMEOUT)?,
        ));
    if let Some(workdir) = config.get_opt::<PathBuf>(&format!("{prefix}.workdir"))? {
        builder = builder.workdir(workdir);
    }
    if let Some(log) = log {
        builder = builder.log(log);
    }

    Ok(builder.build())
}

/// The lab: configuration plus the machines opened so far
///
/// Machines handed out by [`Lab::machine`] stay connected until
/// [`Lab::close`].
pub struct Lab {
    config: Arc<Config>,
    log: LogSink,
    machines: BTreeMap<String, Machine>,
}

impl Lab {
    /// Creates a lab with no open machines
    #[must_use]
    pub fn new(config: Config, log: LogSink) -> Self {
        Self {
            config: Arc::new(config),
            log,
            machines: BTreeMap::new(),
        }
    }

    /// Shared handle to the configuration
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Build an unconnected machine the caller manages itself
    ///
    /// # Errors
    /// Configuration errors
    pub fn build_machine(&self, name: &str) -> Result<Machine, Error> {
        Ok(machine_from_config(
            &self.config,
            name,
            Some(Arc::new(self.log.clone())),
        )?)
    }

    /// Connected machine `name`, connecting on first use
    ///
    /// # Errors
    /// Configuration or connect errors
    pub async fn machine(&mut self, name: &str) -> Result<&mut Machine, Error> {
        let config = &self.config;
        let log = &self.log;
        let machine = match self.machines.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(machine_from_config(
                config,
                name,
                Some(Arc::new(log.clone())),
            )?),
        };
        machine.enter().await?;
        Ok(machine)
    }

    /// Name of the lab host machine
    ///
    /// # Errors
    /// `lab.machine` present but not a string
    pub fn labhost_name(&self) -> Result<String, Error> {
        Ok(self
            .config
            .get_or("lab.machine", DEFAULT_LABHOST.to_string())?)
    }

    /// The connected lab host
    ///
    /// # Errors
    /// Configuration or connect errors
    pub async fn labhost(&mut self) -> Result<&mut Machine, Error> {
        let name = self.labhost_name()?;
        self.machine(&name).await
    }

    /// Exit every open machine
    ///
    /// All machines are released even if some fail.
    ///
    /// # Errors
    /// The first release failure
    pub async fn close(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for (name, mut machine) in std::mem::take(&mut self.machines) {
            if let Err(e) = machine.exit().await {
                warn!(machine = %name, error = %e, "failed to release machine");
                first_error.get_or_insert(e);
            }
        }
        info!("lab closed");
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}
