//! Shell tasks shared by lab testcases

use std::path::{Path, PathBuf};

use tracing::debug;

use tendlab_exec::{ExecOptions, Machine, command_line, quote};

use crate::config::Config;
use crate::error::Error;
use crate::invocation::Ctx;

/// A TFTP directory on the lab host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpDirectory {
    /// TFTP server root
    pub root: PathBuf,
    /// Directory below the root, as the board requests it
    pub subdir: PathBuf,
}

impl TftpDirectory {
    /// Full path on the lab host
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.subdir)
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Make sure the TFTP directory exists on the lab host
///
/// `root` and `subdir` default to `tftp.root` and `tftp.directory`.
///
/// # Errors
/// Missing or mistyped config, or `mkdir` failing
pub async fn setup_tftpdir(
    ctx: &Ctx,
    lab: &mut Machine,
    config: &Config,
    root: Option<PathBuf>,
    subdir: Option<PathBuf>,
) -> Result<TftpDirectory, Error> {
    let args = [
        ("root", root.as_deref().map(display).unwrap_or_default()),
        ("subdir", subdir.as_deref().map(display).unwrap_or_default()),
    ];

    ctx.testcase("setup_tftpdir", &args, async |_| {
        let root = match root {
            Some(root) => root,
            None => config.get("tftp.root")?,
        };
        let subdir = match subdir {
            Some(subdir) => subdir,
            None => config.get("tftp.directory")?,
        };
        if subdir.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "TFTP directory {} must be relative to the TFTP root",
                subdir.display()
            )));
        }

        let dir = TftpDirectory { root, subdir };
        lab.exec0_with(
            &command_line(&["mkdir", "-p", &display(&dir.path())]),
            &ExecOptions::quiet(),
        )
        .await?;
        debug!(path = %dir.path().display(), "TFTP directory ready");
        Ok(dir)
    })
    .await
}

/// Copy a file on the lab host into the TFTP directory
///
/// The copy keeps the source file name unless `dest_name` is given.
/// Returns the destination path.
///
/// # Errors
/// `cp` failing, or a source path without a file name
pub async fn cp_to_tftpdir(
    ctx: &Ctx,
    lab: &mut Machine,
    source: &Path,
    dest_name: Option<&str>,
    tftpdir: &TftpDirectory,
) -> Result<PathBuf, Error> {
    let args = [
        ("source", display(source)),
        ("dest_name", dest_name.unwrap_or_default().to_string()),
    ];

    ctx.testcase("cp_to_tftpdir", &args, async |_| {
        let name = match dest_name {
            Some(name) => PathBuf::from(name),
            None => source
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| Error::InvalidArgument(format!("{} has no file name", source.display())))?,
        };
        let dest = tftpdir.path().join(name);

        lab.exec0(&command_line(&["cp", &display(source), &display(&dest)]))
            .await?;
        Ok(dest)
    })
    .await
}

/// Fetch a build artifact from a build host onto the lab host
///
/// The artifact lands in `lab.artifactsdir` under its own file name. When
/// not given, `buildhost` defaults to `build.default`, and the scp flags and
/// address come from `build.<buildhost>.{scp_flags,username,hostname}`.
/// Returns the path of the copy on the lab host.
///
/// # Errors
/// Missing or mistyped config, or `scp` failing
pub async fn retrieve_build_artifact(
    ctx: &Ctx,
    lab: &mut Machine,
    config: &Config,
    buildfile: &Path,
    buildhost: Option<&str>,
    scp_flags: Option<&str>,
    scp_address: Option<&str>,
) -> Result<PathBuf, Error> {
    let args = [
        ("buildfile", display(buildfile)),
        ("buildhost", buildhost.unwrap_or_default().to_string()),
    ];

    ctx.testcase("retrieve_build_artifact", &args, async |_| {
        let buildhost = match buildhost {
            Some(host) => host.to_string(),
            None => config.get::<String>("build.default")?,
        };
        let prefix = format!("build.{buildhost}");

        let scp_flags = match scp_flags {
            Some(flags) => flags.to_string(),
            None => config.get_or(&format!("{prefix}.scp_flags"), String::new())?,
        };
        let scp_address = match scp_address {
            Some(address) => address.to_string(),
            None => format!(
                "{}@{}",
                config.get::<String>(&format!("{prefix}.username"))?,
                config.get::<String>(&format!("{prefix}.hostname"))?
            ),
        };

        let artifacts: PathBuf = config.get("lab.artifactsdir")?;
        let name = buildfile.file_name().ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no file name", buildfile.display()))
        })?;
        let destination = artifacts.join(name);

        lab.exec0_with(
            &command_line(&["mkdir", "-p", &display(&artifacts)]),
            &ExecOptions::quiet(),
        )
        .await?;

        // scp_flags is a flag string and stays unquoted
        let mut scp = String::from("scp");
        if !scp_flags.trim().is_empty() {
            scp.push(' ');
            scp.push_str(scp_flags.trim());
        }
        scp.push(' ');
        scp.push_str(&quote(&format!("{scp_address}:{}", display(buildfile))));
        scp.push(' ');
        scp.push_str(&quote(&display(&destination)));

        lab.exec0(&scp).await?;
        Ok(destination)
    })
    .await
}

#[cfg(test)]
mod tests {
    use tendlab_exec::LocalConnector;

    use super::*;
    use crate::config::ConfigError;
    use crate::invocation::LogSink;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tendlab-tasks-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_tftp_setup_and_copy() {
        let root = scratch("tftp");
        let mut config = Config::new();
        config.set("tftp.root", root.clone()).unwrap();
        config.set("tftp.directory", PathBuf::from("board/latest")).unwrap();

        let source = scratch("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("u-boot.bin"), b"firmware").unwrap();

        let ctx = Ctx::root(LogSink::new());
        let mut lab = Machine::builder("lab").connector(LocalConnector::new()).build();
        lab.enter().await.unwrap();

        let dir = setup_tftpdir(&ctx, &mut lab, &config, None, None).await.unwrap();
        assert_eq!(dir.path(), root.join("board/latest"));
        assert!(dir.path().is_dir());

        let copied = cp_to_tftpdir(&ctx, &mut lab, &source.join("u-boot.bin"), None, &dir)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&copied).unwrap(), b"firmware");

        let renamed = cp_to_tftpdir(&ctx, &mut lab, &source.join("u-boot.bin"), Some("boot.img"), &dir)
            .await
            .unwrap();
        assert_eq!(renamed, dir.path().join("boot.img"));

        lab.exit().await.unwrap();
        let _ = std::fs::remove_dir_all(&root);
        let _ = std::fs::remove_dir_all(&source);
    }

    #[tokio::test]
    async fn test_tftp_root_must_be_a_path() {
        let config = Config::from_toml_str("[tftp]\nroot = \"/srv/tftp\"\ndirectory = { path = \"x\" }\n").unwrap();
        let ctx = Ctx::root(LogSink::new());
        let mut lab = Machine::builder("lab").build();

        let err = setup_tftpdir(&ctx, &mut lab, &config, None, None).await.unwrap_err();
        assert!(matches!(
            err.root(),
            Error::Config(ConfigError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_absolute_tftp_subdir_rejected() {
        let ctx = Ctx::root(LogSink::new());
        let mut lab = Machine::builder("lab").build();

        let err = setup_tftpdir(
            &ctx,
            &mut lab,
            &Config::new(),
            Some(PathBuf::from("/srv/tftp")),
            Some(PathBuf::from("/etc")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.root(), Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_build_host_settings_resolved_from_config() {
        let config = Config::from_toml_str(
            r#"
[build]
default = "lab-pc"

[build.lab-pc]
hostname = "build.example.com"
"#,
        )
        .unwrap();
        let ctx = Ctx::root(LogSink::new());
        let mut lab = Machine::builder("lab").build();

        let err = retrieve_build_artifact(
            &ctx,
            &mut lab,
            &config,
            Path::new("/build/out/u-boot.bin"),
            None,
            None,
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.root(),
            Error::Config(ConfigError::Missing(key)) if key == "build.lab-pc.username"
        ));
        assert_eq!(err.trace().unwrap()[0].name, "retrieve_build_artifact");
    }
}
