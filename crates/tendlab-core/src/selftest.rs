//! Built-in testcases exercising the lab host, the channel layer and the
//! shell tasks

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use tendlab_exec::{Connect, LocalConnector, Machine, Shell, command_line, quote};

use crate::error::Error;
use crate::invocation::Ctx;
use crate::lab::Lab;
use crate::minisshd::{DEFAULT_PORT, check_minisshd, minisshd};
use crate::tasks::{cp_to_tftpdir, retrieve_build_artifact, setup_tftpdir};
use crate::testcase::{Registry, Testcase};

pub(crate) fn register(registry: &mut Registry) {
    registry.register(Box::new(Version));
    registry.register(Box::new(RawChannel));
    registry.register(Box::new(Tftp));
    registry.register(Box::new(Minisshd));
    registry.register(Box::new(StageArtifact));
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), Error> {
    if condition {
        Ok(())
    } else {
        Err(Error::Assertion(message()))
    }
}

/// Read a file on `machine`
///
/// # Errors
/// `cat` failing
pub async fn cat_file(ctx: &Ctx, machine: &mut Machine, path: &Path) -> Result<String, Error> {
    let path = path.to_string_lossy().into_owned();
    ctx.testcase("cat_file", &[("path", path.clone())], async |_| {
        Ok(machine.exec0(&command_line(&["cat", &path])).await?)
    })
    .await
}

/// Lab host round trip through a file, and a tolerated nested failure
struct Version;

#[async_trait]
impl Testcase for Version {
    fn name(&self) -> &'static str {
        "selftest_version"
    }

    fn description(&self) -> &'static str {
        "read the lab host kernel version and hostname"
    }

    async fn run(&self, ctx: &Ctx, lab: &mut Lab) -> Result<(), Error> {
        let lh = lab.labhost().await?;

        let version = cat_file(ctx, lh, Path::new("/proc/version")).await?;
        ctx.message(&format!("Version: {}", version.trim()));

        let file = lh
            .workdir()
            .map_or_else(std::env::temp_dir, Path::to_path_buf)
            .join("tendlab-selftest-name.txt");
        lh.exec0(&format!("uname -n > {}", quote(&file.to_string_lossy())))
            .await?;
        let name = cat_file(ctx, lh, &file).await?;
        ctx.message(&format!("Name: {}", name.trim()));

        let expected = lh.exec0("uname -n").await?;
        check(name == expected, || {
            format!("{} holds {name:?}, expected {expected:?}", file.display())
        })?;

        let failing = ctx
            .testcase("failing", &[], async |_| -> Result<(), Error> {
                Err(Error::Assertion("this testcase always fails".to_string()))
            })
            .await;
        match failing {
            Err(e) if matches!(e.root(), Error::Assertion(_)) => Ok(()),
            Err(e) => Err(e),
            Ok(()) => Err(Error::Assertion("failing testcase succeeded".to_string())),
        }
    }
}

/// Direct use of a channel without a machine
struct RawChannel;

#[async_trait]
impl Testcase for RawChannel {
    fn name(&self) -> &'static str {
        "selftest_channel"
    }

    fn description(&self) -> &'static str {
        "run a command on a bare local channel and close it twice"
    }

    async fn run(&self, ctx: &Ctx, _lab: &mut Lab) -> Result<(), Error> {
        let mut channel = LocalConnector::new().connect(Shell::Sh).await?;
        ctx.message(&format!("channel: {}", channel.name()));

        let result = Shell::Sh
            .exec(&mut channel, "uname -s", Some(Duration::from_secs(10)))
            .await;
        channel.close().await?;
        channel.close().await?;

        let result = result?;
        check(result.success(), || format!("uname exited with {}", result.status))?;
        ctx.message(&format!("uname: {}", result.output.trim()));
        Ok(())
    }
}

/// TFTP directory setup and copy on the lab host
struct Tftp;

#[async_trait]
impl Testcase for Tftp {
    fn name(&self) -> &'static str {
        "selftest_tftp"
    }

    fn description(&self) -> &'static str {
        "create the TFTP directory (tftp.root, tftp.directory) and copy a file into it"
    }

    async fn run(&self, ctx: &Ctx, lab: &mut Lab) -> Result<(), Error> {
        let config = lab.config();
        let lh = lab.labhost().await?;

        let dir = setup_tftpdir(ctx, lh, &config, None, None).await?;

        let source = lh
            .workdir()
            .map_or_else(std::env::temp_dir, Path::to_path_buf)
            .join("tendlab-selftest-tftp.txt");
        lh.exec0(&format!("echo tendlab > {}", quote(&source.to_string_lossy())))
            .await?;

        let copied = cp_to_tftpdir(ctx, lh, &source, None, &dir).await?;
        let content = cat_file(ctx, lh, &copied).await?;
        check(content == "tendlab\n", || {
            format!("{} holds {content:?}", copied.display())
        })?;

        lh.exec0(&command_line(&["rm", "-f", &copied.to_string_lossy()]))
            .await?;
        Ok(())
    }
}

/// Ephemeral SSH server on the lab host
struct Minisshd;

#[async_trait]
impl Testcase for Minisshd {
    fn name(&self) -> &'static str {
        "selftest_minisshd"
    }

    fn description(&self) -> &'static str {
        "log in to a temporary dropbear on the lab host (minisshd.port)"
    }

    async fn run(&self, ctx: &Ctx, lab: &mut Lab) -> Result<(), Error> {
        let port = lab.config().get_or("minisshd.port", DEFAULT_PORT)?;
        let lh = lab.labhost().await?;

        if !check_minisshd(ctx, lh).await? {
            warn!(machine = lh.name(), "dropbear is not installed, skipping");
            ctx.message("dropbear not available, skipped");
            return Ok(());
        }

        minisshd(ctx, lh, port, async |ctx, ssh| {
            let greeting = ssh.exec0("echo hello").await?;
            check(greeting == "hello\n", || format!("unexpected echo {greeting:?}"))?;

            check(!ssh.test("false").await?, || {
                "`false` succeeded over ssh".to_string()
            })?;

            let uname = ssh.exec0("uname -a").await?;
            ctx.message(&format!("remote: {}", uname.trim()));
            Ok(())
        })
        .await
    }
}

/// Fetch a build artifact and stage it for TFTP boot
struct StageArtifact;

#[async_trait]
impl Testcase for StageArtifact {
    fn name(&self) -> &'static str {
        "stage_artifact"
    }

    fn description(&self) -> &'static str {
        "scp build.artifact from the build host and copy it into the TFTP directory"
    }

    async fn run(&self, ctx: &Ctx, lab: &mut Lab) -> Result<(), Error> {
        let config = lab.config();
        let artifact: PathBuf = config.get("build.artifact")?;
        let lh = lab.labhost().await?;

        let local = retrieve_build_artifact(ctx, lh, &config, &artifact, None, None, None).await?;
        ctx.message(&format!("retrieved {}", local.display()));

        if config.contains("tftp.root") {
            let dir = setup_tftpdir(ctx, lh, &config, None, None).await?;
            let staged = cp_to_tftpdir(ctx, lh, &local, None, &dir).await?;
            ctx.message(&format!("staged {}", staged.display()));
        }
        Ok(())
    }
}
