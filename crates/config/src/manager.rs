//! Configuration manager implementation
//!
//! Sources, lowest precedence first: built-in defaults, a configuration file
//! (`$MODEL_HUB_CONFIG`, `./model-hub.{toml,yaml,json}` or
//! `<user config dir>/model-hub/config.*`), then `MODEL_HUB_*` variables.

use std::path::{Path, PathBuf};
use std::time::Duration;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use tracing::debug;

use common::error::{Error, Result};

use crate::defaults;

fn config_error(err: config::ConfigError) -> Error {
    Error::Config(err.to_string())
}

/// Read-only configuration, constructed once and shared as `Arc<ConfigManager>`
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Merged configuration
    inner: Config,
}

impl ConfigManager {
    /// Loads defaults, the discovered configuration file and the environment
    pub fn new() -> Result<Self> {
        let mut builder = Self::defaults()?;

        match std::env::var(defaults::CONFIG_FILE_ENV) {
            Ok(path) => {
                debug!("Loading configuration from {}", path);
                builder = builder.add_source(File::with_name(&path).required(true));
            }
            Err(_) => {
                builder = builder.add_source(File::with_name("model-hub").required(false));
                if let Some(dir) = dirs::config_dir() {
                    let user_file = dir.join("model-hub").join("config");
                    builder = builder.add_source(
                        File::with_name(&user_file.to_string_lossy()).required(false),
                    );
                }
            }
        }

        let inner = builder
            .add_source(Environment::with_prefix(defaults::ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(config_error)?;

        Ok(Self { inner })
    }

    /// Loads defaults and one required configuration file, ignoring the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Self::defaults()?
            .add_source(File::from(path).required(true))
            .build()
            .map_err(config_error)?;

        Ok(Self { inner })
    }

    /// Defaults plus explicit string overrides, ignoring files and the environment
    pub fn with_overrides<I, K, V>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut builder = Self::defaults()?;
        for (key, value) in overrides {
            builder = builder
                .set_override(key.as_ref(), value.into())
                .map_err(config_error)?;
        }

        let inner = builder.build().map_err(config_error)?;

        Ok(Self { inner })
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let mut builder = Config::builder();
        for (key, value) in defaults::string_defaults() {
            builder = builder.set_default(key, value).map_err(config_error)?;
        }
        for (key, value) in defaults::integer_defaults() {
            builder = builder.set_default(key, value).map_err(config_error)?;
        }
        Ok(builder)
    }

    /// Gets a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.inner.get_string(key).map_err(config_error)
    }

    /// Gets an optional string value; missing or empty keys yield `None`
    pub fn get_optional_string(&self, key: &str) -> Option<String> {
        self.inner.get_string(key).ok().filter(|v| !v.is_empty())
    }

    /// Gets a filesystem path
    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get_string(key).map(PathBuf::from)
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.inner.get_bool(key).map_err(config_error)
    }

    /// Gets a non-negative integer
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        let value = self.inner.get_int(key).map_err(config_error)?;
        usize::try_from(value)
            .map_err(|_| Error::Config(format!("{} must be non-negative, got {}", key, value)))
    }

    /// Gets a duration stored in milliseconds
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        let millis = self.get_usize(key)?;
        Ok(Duration::from_millis(millis as u64))
    }
}
