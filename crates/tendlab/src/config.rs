//! Configuration discovery and layering

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use tendlab_core::Config;
use tracing::{info, warn};

/// Environment variable naming a config file to use instead of discovery
pub const CONFIG_ENV: &str = "TENDLAB_CONFIG";

/// Candidate locations, first match wins
fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("tendlab.toml"),
        PathBuf::from("/etc/tendlab/tendlab.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("tendlab/tendlab.toml"));
    }
    paths
}

fn load_file(path: &Path) -> eyre::Result<Config> {
    Config::load(path).wrap_err_with(|| format!("failed to load config {}", path.display()))
}

/// Load from `$TENDLAB_CONFIG` or the first default path that exists
///
/// # Errors
/// Returns error if the chosen file cannot be read or parsed
pub fn load_default() -> eyre::Result<Config> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return load_file(Path::new(&path));
    }

    for path in default_paths() {
        if path.exists() {
            info!(path = %path.display(), "using config file");
            return load_file(&path);
        }
    }

    warn!("no config file found, using a local lab host");
    Ok(Config::default())
}

/// Build the effective configuration
///
/// Explicit `files` are merged in order, later ones overriding earlier
/// ones; without any the default file is used. `overrides` (`KEY=VALUE`)
/// are applied last.
///
/// # Errors
/// Returns error for unreadable files or malformed overrides
pub fn load(files: &[PathBuf], overrides: &[String]) -> eyre::Result<Config> {
    let mut config = if files.is_empty() {
        load_default()?
    } else {
        let mut config = Config::new();
        for path in files {
            config.merge(load_file(path)?);
        }
        config
    };

    for assignment in overrides {
        config
            .apply_override(assignment)
            .wrap_err_with(|| format!("bad override '{assignment}'"))?;
    }

    Ok(config)
}
