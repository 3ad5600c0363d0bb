//! Machines: a connector and a shell composed into something to run
//! commands on

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::ExecError;
use crate::result::CommandResult;
use crate::retry::{RetryPolicy, retry};
use crate::shell::{Shell, command_line, quote};
use crate::traits::{CommandLog, Connect};

/// Default limit for a single command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Keep command and output out of the logs
    pub suppress_log: bool,
    /// Override the machine's command timeout
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    /// Options that keep the command out of the logs
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            suppress_log: true,
            timeout: None,
        }
    }

    /// Set a timeout for this call
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A host that runs shell commands
///
/// Composed from a [`Connector`] (how to reach it), a [`Shell`] (how to talk
/// to it) and an optional working directory. Must be entered before use;
/// [`Machine::scoped`] pairs `enter` and `exit` for a body of work.
pub struct Machine {
    name: String,
    connector: Connector,
    shell: Shell,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
    log: Option<Arc<dyn CommandLog>>,
    channel: Option<Channel>,
    /// Auxiliary processes to terminate on exit
    daemons: Vec<u32>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("connector", &self.connector)
            .field("shell", &self.shell)
            .field("workdir", &self.workdir)
            .field("connected", &self.is_connected())
            .field("daemons", &self.daemons)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Start building a machine
    pub fn builder(name: impl Into<String>) -> MachineBuilder {
        MachineBuilder {
            name: name.into(),
            connector: Connector::local(),
            shell: Shell::default(),
            workdir: None,
            timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            log: None,
        }
    }

    /// Machine name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport descriptor
    #[must_use]
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Shell capability
    #[must_use]
    pub fn shell(&self) -> Shell {
        self.shell
    }

    /// Working directory, if this machine has one
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Whether `enter()` succeeded and `exit()` has not run yet
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(Channel::is_open)
    }

    /// Pids recorded by [`Machine::spawn_daemon`] that are still alive
    #[must_use]
    pub fn daemons(&self) -> &[u32] {
        &self.daemons
    }

    /// Establish the channel
    ///
    /// Entering a connected machine is a no-op.
    ///
    /// # Errors
    /// Connect errors from the connector. A channel that came up but did not
    /// answer the first command is closed and reported as
    /// `ConnectionFailed`.
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn enter(&mut self) -> Result<(), ExecError> {
        if self.is_connected() {
            return Ok(());
        }

        info!(
            machine = %self.name,
            connector = self.connector.connector_type(),
            target = %self.connector.target(),
            "connecting"
        );

        let mut channel = self.connector.connect(self.shell).await?;
        if let Err(e) = self.shell.exec(&mut channel, "true", self.timeout).await {
            let _ = channel.close().await;
            return Err(ExecError::ConnectionFailed {
                target: self.connector.target(),
                reason: format!("shell not responding: {e}"),
            });
        }
        self.channel = Some(channel);

        if let Some(workdir) = self.workdir.clone() {
            let prepared = self
                .exec0_with(
                    &format!("mkdir -p {}", quote(&workdir.to_string_lossy())),
                    &ExecOptions::quiet(),
                )
                .await;
            if let Err(e) = prepared {
                let _ = self.exit().await;
                return Err(e);
            }
        }

        debug!(machine = %self.name, "machine ready");
        Ok(())
    }

    /// Run a command and return its status and output
    ///
    /// A non-zero status is not an error here.
    ///
    /// # Errors
    /// `NotConnected` before `enter()`/after `exit()`, transport errors.
    /// A transport error closes the channel; `enter()` reconnects.
    pub async fn exec(&mut self, command: &str) -> Result<CommandResult, ExecError> {
        self.exec_with(command, &ExecOptions::default()).await
    }

    /// [`Machine::exec`] with explicit options
    ///
    /// # Errors
    /// See [`Machine::exec`]
    pub async fn exec_with(
        &mut self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<CommandResult, ExecError> {
        let timeout = options.timeout.or(self.timeout);
        let Some(channel) = self.channel.as_mut().filter(|c| c.is_open()) else {
            return Err(ExecError::NotConnected(self.name.clone()));
        };

        if !options.suppress_log {
            info!(machine = %self.name, command = %command, "exec");
        }

        let result = self.shell.exec(channel, command, timeout).await;

        match &result {
            Ok(result) if !options.suppress_log => {
                debug!(
                    machine = %self.name,
                    status = result.status,
                    duration = ?result.duration,
                    output = %result.output,
                    "command completed"
                );
                if let Some(log) = &self.log {
                    log.command(&self.name, command, result);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(machine = %self.name, error = %e, "command did not complete");
                if e.is_transport_error() {
                    self.drop_channel().await;
                }
            }
        }

        result
    }

    /// Discard a channel whose stream can no longer be trusted
    async fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(machine = %self.name, error = %e, "closing broken channel failed");
            }
            warn!(machine = %self.name, "channel closed after transport error");
        }
    }

    /// Run a command that has to succeed, returning its output
    ///
    /// # Errors
    /// `CommandFailed` for a non-zero status, otherwise as [`Machine::exec`]
    pub async fn exec0(&mut self, command: &str) -> Result<String, ExecError> {
        self.exec0_with(command, &ExecOptions::default()).await
    }

    /// [`Machine::exec0`] with explicit options
    ///
    /// # Errors
    /// See [`Machine::exec0`]
    pub async fn exec0_with(
        &mut self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<String, ExecError> {
        let result = self.exec_with(command, options).await?;
        if result.success() {
            return Ok(result.output);
        }

        Err(ExecError::CommandFailed {
            machine: self.name.clone(),
            command: command.to_string(),
            status: result.status,
            output: result.output,
        })
    }

    /// Run a command and report whether it succeeded
    ///
    /// # Errors
    /// See [`Machine::exec`]
    pub async fn test(&mut self, command: &str) -> Result<bool, ExecError> {
        Ok(self.exec(command).await?.success())
    }

    /// Value of an environment variable on the machine
    ///
    /// # Errors
    /// `Protocol` for names that are not valid variable names, otherwise
    /// as [`Machine::exec0`]
    pub async fn env(&mut self, var: &str) -> Result<String, ExecError> {
        let valid = !var.is_empty()
            && !var.starts_with(|c: char| c.is_ascii_digit())
            && var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ExecError::Protocol(format!(
                "invalid environment variable name {var:?}"
            )));
        }

        self.exec0_with(&format!("printf '%s' \"${{{var}}}\""), &ExecOptions::quiet())
            .await
    }

    /// Start an auxiliary process and record its pid
    ///
    /// `command` must start the process in the background and have it (or
    /// the command itself) write its pid to `pid_file`. The pid file is
    /// polled according to `policy`. Recorded processes are terminated by
    /// [`Machine::exit`].
    ///
    /// # Errors
    /// `CommandFailed` if `command` fails, `RetryExhausted` if the pid file
    /// never shows up
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn spawn_daemon(
        &mut self,
        command: &str,
        pid_file: &Path,
        policy: &RetryPolicy,
    ) -> Result<u32, ExecError> {
        self.exec0(command).await?;

        let read_pid = format!("cat {}", quote(&pid_file.to_string_lossy()));
        let what = format!("pid file {}", pid_file.display());
        let pid = retry(policy, &what, async |_| {
            let result = self.exec_with(&read_pid, &ExecOptions::quiet()).await?;
            if !result.success() {
                return Ok(None);
            }
            Ok(result.output.trim().parse::<u32>().ok())
        })
        .await?;

        info!(machine = %self.name, pid, "auxiliary process started");
        self.daemons.push(pid);
        Ok(pid)
    }

    /// Terminate a recorded auxiliary process before `exit()`
    ///
    /// # Errors
    /// `CommandFailed` if `kill` fails
    pub async fn kill_daemon(&mut self, pid: u32) -> Result<(), ExecError> {
        self.exec0(&command_line(&["kill", &pid.to_string()])).await?;
        self.daemons.retain(|p| *p != pid);
        Ok(())
    }

    /// Terminate recorded auxiliary processes and close the channel
    ///
    /// Always closes the channel, even when terminating a process failed.
    /// Idempotent.
    ///
    /// # Errors
    /// The first failure encountered
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn exit(&mut self) -> Result<(), ExecError> {
        let mut first_error = None;

        for pid in std::mem::take(&mut self.daemons) {
            info!(machine = %self.name, pid, "stopping auxiliary process");
            let kill = command_line(&["kill", &pid.to_string()]);
            match self.exec_with(&kill, &ExecOptions::quiet()).await {
                Ok(result) if result.success() => {}
                Ok(result) => {
                    warn!(machine = %self.name, pid, status = result.status, "kill failed");
                }
                Err(e) => {
                    warn!(machine = %self.name, pid, error = %e, "could not send kill");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                first_error.get_or_insert(e);
            }
            info!(machine = %self.name, "disconnected");
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Enter, run `body`, and exit on every path
    ///
    /// Returns the body's result. If the body succeeded but releasing the
    /// machine failed, the release error is returned instead.
    ///
    /// # Errors
    /// Errors from `enter`, the body, or `exit`
    pub async fn scoped<T, E>(
        &mut self,
        body: impl AsyncFnOnce(&mut Machine) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ExecError>,
    {
        self.enter().await?;
        let result = body(&mut *self).await;
        let released = self.exit().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                warn!(machine = %self.name, error = %release, "release failed after body error");
                Err(e)
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!(
                machine = %self.name,
                daemons = ?self.daemons,
                "machine dropped without exit(), local processes are killed"
            );
        }
    }
}

/// Builder for [`Machine`]
pub struct MachineBuilder {
    name: String,
    connector: Connector,
    shell: Shell,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
    log: Option<Arc<dyn CommandLog>>,
}

impl MachineBuilder {
    /// Set the transport
    #[must_use]
    pub fn connector(mut self, connector: impl Into<Connector>) -> Self {
        self.connector = connector.into();
        self
    }

    /// Set the shell capability
    #[must_use]
    pub fn shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    /// Give the machine a working directory, created on enter
    #[must_use]
    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Limit for a single command; `None` waits forever
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mirror executed commands to `log`
    #[must_use]
    pub fn log(mut self, log: Arc<dyn CommandLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Build the (not yet entered) machine
    #[must_use]
    pub fn build(self) -> Machine {
        Machine {
            name: self.name,
            connector: self.connector,
            shell: self.shell,
            workdir: self.workdir,
            timeout: self.timeout,
            log: self.log,
            channel: None,
            daemons: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn local(name: &str) -> Machine {
        Machine::builder(name)
            .timeout(Some(Duration::from_secs(30)))
            .build()
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tendlab-machine-{tag}-{}", std::process::id()))
    }

    #[derive(Default)]
    struct RecordingLog(Mutex<Vec<(String, String, i32)>>);

    impl CommandLog for RecordingLog {
        fn command(&self, machine: &str, command: &str, result: &CommandResult) {
            self.0
                .lock()
                .unwrap()
                .push((machine.to_string(), command.to_string(), result.status));
        }
    }

    #[tokio::test]
    async fn test_exec0_true_and_false() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        assert_eq!(m.exec0("true").await.unwrap(), "");

        let err = m.exec0("false").await.unwrap_err();
        assert!(matches!(err, ExecError::CommandFailed { status: 1, .. }));
        assert_eq!(err.exit_status(), Some(1));

        m.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_echo_has_no_marker() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        let result = m.exec("echo hello").await.unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.output, "hello\n");
        assert!(!result.output.contains("__TLM"));

        m.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut m = local("idle");
        assert!(matches!(
            m.exec("true").await,
            Err(ExecError::NotConnected(_))
        ));

        m.enter().await.unwrap();
        m.exit().await.unwrap();
        m.exit().await.unwrap();
        assert!(matches!(
            m.exec("true").await,
            Err(ExecError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_env_and_test() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        m.exec0("export TENDLAB_GREETING='hi there'").await.unwrap();
        assert_eq!(m.env("TENDLAB_GREETING").await.unwrap(), "hi there");
        assert!(matches!(m.env("BAD NAME").await, Err(ExecError::Protocol(_))));

        assert!(m.test("test -d /").await.unwrap());
        assert!(!m.test("test -f /nonexistent/file").await.unwrap());

        m.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_output_is_captured() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        // 5 MiB of 'x' in 1 KiB lines
        let command = "i=0; line=$(printf '%1023s' '' | tr ' ' x); \
                       while [ $i -lt 5120 ]; do echo \"$line\"; i=$((i+1)); done";
        let result = m.exec_with(command, &ExecOptions::quiet()).await.unwrap();

        assert_eq!(result.status, 0);
        assert_eq!(result.output.len(), 5 * 1024 * 1024);
        assert!(result.output.bytes().all(|b| b == b'x' || b == b'\n'));

        // the channel is still in sync afterwards
        assert_eq!(m.exec0("echo after").await.unwrap(), "after\n");
        m.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_log_respects_suppression() {
        let log = Arc::new(RecordingLog::default());
        let mut m = Machine::builder("logged").log(log.clone()).build();
        m.enter().await.unwrap();

        m.exec("echo visible").await.unwrap();
        m.exec_with("echo hidden", &ExecOptions::quiet()).await.unwrap();
        m.exit().await.unwrap();

        let entries = log.0.lock().unwrap();
        assert_eq!(
            *entries,
            vec![("logged".to_string(), "echo visible".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_workdir_is_created() {
        let dir = scratch_dir("workdir");
        let mut m = Machine::builder("lab").workdir(&dir).build();

        m.enter().await.unwrap();
        assert_eq!(m.workdir(), Some(dir.as_path()));
        assert!(dir.is_dir());
        m.exit().await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        let options = ExecOptions::default().with_timeout(Duration::from_millis(100));
        let err = m.exec_with("sleep 5", &options).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));

        m.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_discards_late_output() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        let options = ExecOptions::default().with_timeout(Duration::from_millis(100));
        let err = m
            .exec_with("sleep 1; echo stale", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(!m.is_connected());
        assert!(matches!(
            m.exec("echo hi").await,
            Err(ExecError::NotConnected(_))
        ));

        m.enter().await.unwrap();
        let result = m.exec("echo hi").await.unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.output, "hi\n");

        m.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_closes_channel_and_enter_reconnects() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        let err = m.exec("exit 4").await.unwrap_err();
        assert!(matches!(err, ExecError::UnexpectedEof { .. }));
        assert!(!m.is_connected());

        m.enter().await.unwrap();
        assert_eq!(m.exec0("echo hi").await.unwrap(), "hi\n");

        m.exit().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_scoped_release_kills_daemon_on_failure() {
        let dir = scratch_dir("daemon");
        let pid_file = dir.join("sleeper.pid");
        let mut m = local("lab");

        let mut spawned = None;
        let result: Result<(), ExecError> = m
            .scoped(async |m: &mut Machine| {
                m.exec0(&format!("mkdir -p {}", dir.display())).await?;
                let launch = format!(
                    "sleep 300 >/dev/null 2>&1 & echo $! > {}",
                    pid_file.display()
                );
                let pid = m
                    .spawn_daemon(&launch, &pid_file, &RetryPolicy::default())
                    .await?;
                spawned = Some(pid);
                m.exec0("exit_status=7; (exit $exit_status)").await?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ExecError::CommandFailed { status: 7, .. })));
        assert!(!m.is_connected());
        assert!(m.daemons().is_empty());

        let pid = spawned.expect("daemon pid recorded");
        let mut checker = local("checker");
        let gone = checker
            .scoped(async |c: &mut Machine| {
                let dead = format!(
                    "test ! -e /proc/{pid} || grep -q '^State:.*Z' /proc/{pid}/status"
                );
                retry(
                    &RetryPolicy::new(20, Duration::from_millis(100)),
                    "daemon exit",
                    async |_| Ok(c.test(&dead).await?.then_some(())),
                )
                .await
            })
            .await;
        assert!(gone.is_ok(), "daemon {pid} still running");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_spawn_daemon_without_pid_file_times_out() {
        let mut m = local("lab");
        m.enter().await.unwrap();

        let err = m
            .spawn_daemon(
                "true",
                Path::new("/nonexistent/tendlab.pid"),
                &RetryPolicy::new(3, Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::RetryExhausted { attempts: 3, .. }));

        m.exit().await.unwrap();
    }
}
