//! Typed hierarchical configuration
//!
//! Values come from TOML files and `KEY=VALUE` overrides and are looked up by
//! dotted path (`build.lab-pc.hostname`). Every lookup names the type it
//! expects; a value of another type is a [`ConfigError::TypeMismatch`], never
//! a silent conversion. Filesystem paths are written as `{ path = "/srv" }`
//! so a plain string cannot pass for one.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Errors from loading or querying configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required key is absent
    #[error("missing config key '{0}'")]
    Missing(String),

    /// Key is present but holds another type
    #[error("config key '{key}' must be {expected}, found {found}")]
    TypeMismatch {
        /// Dotted key
        key: String,
        /// Type the caller asked for
        expected: &'static str,
        /// Type actually stored
        found: &'static str,
    },

    /// Key has the right type but an unusable value
    #[error("invalid value for config key '{key}': {reason}")]
    InvalidValue {
        /// Dotted key
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// TOML could not be parsed
    #[error("failed to parse {origin}: {reason}")]
    Parse {
        /// File name, or `<string>` for in-memory text
        origin: String,
        /// Parser message
        reason: String,
    },

    /// Config file could not be read
    #[error("failed to read {path}: {reason}")]
    Io {
        /// File path
        path: String,
        /// Error message
        reason: String,
    },

    /// Malformed `KEY=VALUE` override
    #[error("invalid override '{0}' (expected KEY=VALUE)")]
    InvalidOverride(String),
}

/// A configuration value
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Path(PathBuf),
    List(Vec<ConfigValue>),
    Table(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Type name used in error messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigValue::String(_) => "a string",
            ConfigValue::Integer(_) => "an integer",
            ConfigValue::Float(_) => "a float",
            ConfigValue::Boolean(_) => "a boolean",
            ConfigValue::Path(_) => "a path",
            ConfigValue::List(_) => "a list",
            ConfigValue::Table(_) => "a table",
        }
    }
}

impl From<toml::Value> for ConfigValue {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => ConfigValue::String(s),
            toml::Value::Integer(i) => ConfigValue::Integer(i),
            toml::Value::Float(f) => ConfigValue::Float(f),
            toml::Value::Boolean(b) => ConfigValue::Boolean(b),
            toml::Value::Datetime(d) => ConfigValue::String(d.to_string()),
            toml::Value::Array(items) => {
                ConfigValue::List(items.into_iter().map(ConfigValue::from).collect())
            }
            toml::Value::Table(table) => {
                if table.len() == 1
                    && let Some(toml::Value::String(path)) = table.get("path")
                {
                    return ConfigValue::Path(PathBuf::from(path));
                }
                ConfigValue::Table(
                    table
                        .into_iter()
                        .map(|(k, v)| (k, ConfigValue::from(v)))
                        .collect(),
                )
            }
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Integer(i)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Boolean(b)
    }
}

impl From<PathBuf> for ConfigValue {
    fn from(p: PathBuf) -> Self {
        ConfigValue::Path(p)
    }
}

impl From<&Path> for ConfigValue {
    fn from(p: &Path) -> Self {
        ConfigValue::Path(p.to_path_buf())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => write!(f, "{s:?}"),
            ConfigValue::Integer(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
            ConfigValue::Boolean(b) => write!(f, "{b}"),
            ConfigValue::Path(p) => write!(f, "{}", p.display()),
            ConfigValue::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
            ConfigValue::Table(table) => write!(f, "{{{} keys}}", table.len()),
        }
    }
}

/// Types that can be read from a [`ConfigValue`]
pub trait FromConfig: Sized {
    /// Type name used in error messages
    const EXPECTED: &'static str;

    /// Convert, or `None` if `value` has another type
    fn from_config(value: &ConfigValue) -> Option<Self>;
}

impl FromConfig for String {
    const EXPECTED: &'static str = "a string";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromConfig for i64 {
    const EXPECTED: &'static str = "an integer";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

macro_rules! unsigned_from_config {
    ($($ty:ty => $expected:literal),* $(,)?) => {
        $(
            impl FromConfig for $ty {
                const EXPECTED: &'static str = $expected;

                fn from_config(value: &ConfigValue) -> Option<Self> {
                    match value {
                        ConfigValue::Integer(i) => <$ty>::try_from(*i).ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

unsigned_from_config! {
    u16 => "an integer in 0..=65535",
    u32 => "a non-negative 32-bit integer",
    u64 => "a non-negative integer",
}

impl FromConfig for f64 {
    const EXPECTED: &'static str = "a number";

    #[allow(clippy::cast_precision_loss)]
    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(x) => Some(*x),
            ConfigValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromConfig for bool {
    const EXPECTED: &'static str = "a boolean";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromConfig for PathBuf {
    const EXPECTED: &'static str = "a path ({ path = \"...\" })";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Path(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl FromConfig for Duration {
    const EXPECTED: &'static str = "a duration in seconds";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Integer(i) => u64::try_from(*i).ok().map(Duration::from_secs),
            ConfigValue::Float(x) => Duration::try_from_secs_f64(*x).ok(),
            _ => None,
        }
    }
}

impl FromConfig for Vec<String> {
    const EXPECTED: &'static str = "a list of strings";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::List(items) => items.iter().map(String::from_config).collect(),
            _ => None,
        }
    }
}

impl FromConfig for ConfigValue {
    const EXPECTED: &'static str = "any value";

    fn from_config(value: &ConfigValue) -> Option<Self> {
        Some(value.clone())
    }
}

/// Hierarchical configuration store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    root: BTreeMap<String, ConfigValue>,
}

impl Config {
    /// Empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` if the text is not valid TOML
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, "<string>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(text).map_err(|e| ConfigError::Parse {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            root: table
                .into_iter()
                .map(|(k, v)| (k, ConfigValue::from(v)))
                .collect(),
        })
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` or `ConfigError::Parse`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::parse(&content, &path.display().to_string())?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Overlay `other` on top of this configuration
    ///
    /// Tables are merged key by key; any other value in `other` replaces
    /// the existing one.
    pub fn merge(&mut self, other: Config) {
        merge_tables(&mut self.root, other.root);
    }

    /// Set a value, creating intermediate tables
    ///
    /// # Errors
    /// `TypeMismatch` if an intermediate key holds a non-table value
    pub fn set(&mut self, key: &str, value: impl Into<ConfigValue>) -> Result<(), ConfigError> {
        let mut parts: Vec<&str> = key.split('.').collect();
        let Some(leaf) = parts.pop() else {
            return Err(ConfigError::InvalidOverride(key.to_string()));
        };

        let mut table = &mut self.root;
        let mut walked = String::new();
        for part in parts {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(part);

            let entry = table
                .entry(part.to_string())
                .or_insert_with(|| ConfigValue::Table(BTreeMap::new()));
            table = match entry {
                ConfigValue::Table(inner) => inner,
                other => {
                    return Err(ConfigError::TypeMismatch {
                        key: walked,
                        expected: "a table",
                        found: other.kind(),
                    });
                }
            };
        }

        table.insert(leaf.to_string(), value.into());
        Ok(())
    }

    /// Apply a `KEY=VALUE` override
    ///
    /// `VALUE` is read as a TOML value (`42`, `true`, `{ path = "/srv" }`,
    /// `["a", "b"]`); `@/srv` is shorthand for a path and anything that does
    /// not parse is taken as a string.
    ///
    /// # Errors
    /// `InvalidOverride` for a missing `=` or empty key
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let Some((key, raw)) = assignment.split_once('=') else {
            return Err(ConfigError::InvalidOverride(assignment.to_string()));
        };
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(ConfigError::InvalidOverride(assignment.to_string()));
        }

        let value = if let Some(path) = raw.strip_prefix('@') {
            ConfigValue::Path(PathBuf::from(path))
        } else {
            toml::from_str::<toml::Table>(&format!("v = {raw}"))
                .ok()
                .and_then(|mut t| t.remove("v"))
                .map_or_else(|| ConfigValue::String(raw.to_string()), ConfigValue::from)
        };

        debug!(key, value = %value, "config override");
        self.set(key, value)
    }

    /// Raw value at `key`
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&ConfigValue> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut value = self.root.get(first)?;
        for part in parts {
            match value {
                ConfigValue::Table(table) => value = table.get(part)?,
                _ => return None,
            }
        }
        Some(value)
    }

    /// Whether `key` is present
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Typed value at `key`, `None` if absent
    ///
    /// # Errors
    /// `TypeMismatch` if present with another type
    pub fn get_opt<T: FromConfig>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.lookup(key) else {
            return Ok(None);
        };

        T::from_config(value)
            .map(Some)
            .ok_or_else(|| ConfigError::TypeMismatch {
                key: key.to_string(),
                expected: T::EXPECTED,
                found: value.kind(),
            })
    }

    /// Typed value at `key`
    ///
    /// # Errors
    /// `Missing` if absent, `TypeMismatch` if present with another type
    pub fn get<T: FromConfig>(&self, key: &str) -> Result<T, ConfigError> {
        self.get_opt(key)?
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Typed value at `key`, `default` if absent
    ///
    /// # Errors
    /// `TypeMismatch` if present with another type
    pub fn get_or<T: FromConfig>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get_opt(key)?.unwrap_or(default))
    }

    /// Names of the direct children of the table at `key`
    #[must_use]
    pub fn children(&self, key: &str) -> Vec<String> {
        match self.lookup(key) {
            Some(ConfigValue::Table(table)) => table.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

fn merge_tables(base: &mut BTreeMap<String, ConfigValue>, overlay: BTreeMap<String, ConfigValue>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(ConfigValue::Table(existing)), ConfigValue::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
