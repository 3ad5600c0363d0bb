//! Ephemeral SSH server fixture
//!
//! Starts `dropbear` on the lab host, bound to localhost, and hands the body
//! a machine that reaches it with the system `ssh` client launched from the
//! lab host's own connector. The server is stopped on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tendlab_exec::{
    ConnectionInfo, Credentials, Machine, RetryPolicy, RusshConnector, Shell, SshCommandConnector,
    command_line,
};

use crate::error::Error;
use crate::invocation::Ctx;

/// Port dropbear listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 2022;

/// Workdir used on the lab host when it has none configured
const FALLBACK_WORKDIR: &str = "/tmp/tendlab-wd";

/// Workdir of the machines logged in through the fixture
pub const REMOTE_WORKDIR: &str = "/tmp/tendlab-wd/minisshd-remote";

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Whether `lab` can run the fixture
///
/// # Errors
/// Transport errors while probing
pub async fn check_minisshd(ctx: &Ctx, lab: &mut Machine) -> Result<bool, Error> {
    ctx.testcase("check_minisshd", &[], async |_| {
        Ok(lab.test("command -v dropbear >/dev/null").await?)
    })
    .await
}

/// Run `body` with a machine logged in to a fresh dropbear on `lab`
///
/// The server gets a host key under `<workdir>/minisshd` (generated once),
/// listens on `127.0.0.1:<port>` and is killed after the body returns,
/// whether or not it succeeded. Login uses the lab host user and its
/// ssh agent or default keys.
///
/// # Errors
/// Setup failures, the body's error, or failure to stop the server
pub async fn minisshd<T>(
    ctx: &Ctx,
    lab: &mut Machine,
    port: u16,
    body: impl AsyncFnOnce(&Ctx, &mut Machine) -> Result<T, Error>,
) -> Result<T, Error> {
    ctx.testcase("minisshd", &[("port", port.to_string())], async |ctx| {
        let workdir = lab
            .workdir()
            .map_or_else(|| PathBuf::from(FALLBACK_WORKDIR), Path::to_path_buf);
        let server_dir = workdir.join("minisshd");
        let key_file = server_dir.join("ssh_host_key");
        let pid_file = server_dir.join("dropbear.pid");

        lab.exec0(&command_line(&["mkdir", "-p", &path_arg(&server_dir)]))
            .await?;
        if !lab
            .test(&command_line(&["test", "-e", &path_arg(&key_file)]))
            .await?
        {
            lab.exec0(&command_line(&[
                "dropbearkey",
                "-t",
                "rsa",
                "-f",
                &path_arg(&key_file),
            ]))
            .await?;
        }
        lab.exec0(&command_line(&["rm", "-f", &path_arg(&pid_file)]))
            .await?;

        let listen = format!("127.0.0.1:{port}");
        let pid = lab
            .spawn_daemon(
                &command_line(&[
                    "dropbear",
                    "-p",
                    &listen,
                    "-r",
                    &path_arg(&key_file),
                    "-P",
                    &path_arg(&pid_file),
                ]),
                &pid_file,
                &RetryPolicy::new(10, Duration::from_millis(200)),
            )
            .await?;

        let user = lab.env("USER").await?;
        let mut ssh = Machine::builder("minissh-local")
            .connector(
                SshCommandConnector::new(
                    ConnectionInfo::new("localhost", user)
                        .with_port(port)
                        .with_ssh_option("StrictHostKeyChecking=no")
                        .with_ssh_option("UserKnownHostsFile=/dev/null"),
                    Credentials::Agent,
                )
                .via(lab.connector().clone()),
            )
            .shell(Shell::Bash)
            .workdir(REMOTE_WORKDIR)
            .log(ctx.command_log())
            .build();

        let result = ssh.scoped(async |machine| body(ctx, machine).await).await;

        ctx.message("stopping dropbear");
        let stopped = lab.kill_daemon(pid).await;

        match (result, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    })
    .await
}

/// Machine logging in to a fixture server through the russh library
///
/// Connects from this process rather than from the lab host, so it only
/// reaches a dropbear running on the local machine. The host key is not
/// checked.
#[must_use]
pub fn minissh_lab_machine(port: u16, user: &str, credentials: Credentials) -> Machine {
    Machine::builder("minissh-lab")
        .connector(RusshConnector::new(
            ConnectionInfo::new("localhost", user)
                .with_port(port)
                .ignore_hostkey(true),
            credentials,
        ))
        .shell(Shell::Bash)
        .workdir(REMOTE_WORKDIR)
        .build()
}
