//! Configuration lookup
//!
//! The supervisor does not parse configuration files itself, it only needs to look up
//! a couple of keys in a named section. [`ConfigSource`] is that lookup. It is implemented
//! for a parsed [`toml::Table`] (sections are top-level tables) and for [`MemoryConfig`],
//! an in-memory map mostly useful for compositors with their own configuration format.
//!
//! ```
//! use xwayland_supervisor::config::XWaylandConfig;
//!
//! let config = XWaylandConfig::from_toml_str(
//!     r#"
//!     [xwayland]
//!     path = "/opt/xorg/bin/Xwayland"
//!     disable_access_control = true
//!     "#,
//! )
//! .unwrap();
//! assert!(config.disable_access_control);
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Name of the configuration section read by the supervisor
pub const XWAYLAND_SECTION: &str = "xwayland";

/// Server binary used when the configuration does not name one
///
/// Can be overridden at compile time through the `XSERVER_PATH` environment variable.
pub const DEFAULT_XSERVER_PATH: &str = match option_env!("XSERVER_PATH") {
    Some(path) => path,
    None => "/usr/bin/Xwayland",
};

/// Errors that can happen while loading a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file `{path:?}`")]
    Io {
        /// Path of the file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The configuration is not valid TOML
    #[error("Invalid configuration")]
    Parse(#[from] toml::de::Error),
}

/// A section/key lookup into the compositor configuration
pub trait ConfigSource {
    /// Returns the string stored at `key` in `section`, if any
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    /// Returns the boolean stored at `key` in `section`, if any
    fn get_bool(&self, section: &str, key: &str) -> Option<bool>;
}

impl ConfigSource for toml::Table {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.get(section)?
            .as_table()?
            .get(key)?
            .as_str()
            .map(ToOwned::to_owned)
    }

    fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.get(section)?.as_table()?.get(key)?.as_bool()
    }
}

/// Value stored in a [`MemoryConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// A string value
    String(String),
    /// A boolean value
    Bool(bool),
}

/// In-memory [`ConfigSource`]
#[derive(Debug, Default, Clone)]
pub struct MemoryConfig {
    values: HashMap<(String, String), ConfigValue>,
}

impl MemoryConfig {
    /// Creates an empty configuration
    pub fn new() -> MemoryConfig {
        MemoryConfig::default()
    }

    /// Stores `value` at `key` in `section`, replacing any previous value
    pub fn set(&mut self, section: &str, key: &str, value: ConfigValue) -> &mut Self {
        self.values.insert((section.to_owned(), key.to_owned()), value);
        self
    }

    fn get(&self, section: &str, key: &str) -> Option<&ConfigValue> {
        self.values.get(&(section.to_owned(), key.to_owned()))
    }
}

impl ConfigSource for MemoryConfig {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        match self.get(section, key)? {
            ConfigValue::String(s) => Some(s.clone()),
            ConfigValue::Bool(_) => None,
        }
    }

    fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.get(section, key)? {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::String(_) => None,
        }
    }
}

/// Resolved `[xwayland]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XWaylandConfig {
    /// Path of the X server binary
    pub path: PathBuf,
    /// Pass `-ac` to the server, disabling host based access control
    pub disable_access_control: bool,
}

impl Default for XWaylandConfig {
    fn default() -> Self {
        XWaylandConfig {
            path: PathBuf::from(DEFAULT_XSERVER_PATH),
            disable_access_control: false,
        }
    }
}

impl XWaylandConfig {
    /// Reads the `xwayland` section of `source`, falling back to defaults for missing keys
    pub fn from_source(source: &dyn ConfigSource) -> XWaylandConfig {
        let default = XWaylandConfig::default();
        let config = XWaylandConfig {
            path: source
                .get_string(XWAYLAND_SECTION, "path")
                .map(PathBuf::from)
                .unwrap_or(default.path),
            disable_access_control: source
                .get_bool(XWAYLAND_SECTION, "disable_access_control")
                .unwrap_or(default.disable_access_control),
        };
        debug!(?config, "Resolved xwayland configuration");
        config
    }

    /// Parses a TOML document and resolves its `xwayland` section
    pub fn from_toml_str(document: &str) -> Result<XWaylandConfig, ConfigError> {
        let table: toml::Table = document.parse()?;
        Ok(XWaylandConfig::from_source(&table))
    }
}

/// Reads and parses a TOML configuration file
pub fn load_config_file(path: impl AsRef<Path>) -> Result<toml::Table, ConfigError> {
    let path = path.as_ref();
    let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(document.parse()?)
}
