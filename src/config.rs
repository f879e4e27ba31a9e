//! Configuration and on-disk layout.
//!
//! Sources, lowest to highest precedence: built-in defaults from
//! [`get_global_dirs`], `config.toml` in the config directory, the
//! `FORMA_PREFIX` environment variable, then command-line flags.

use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::global::utils::{get_global_config_dir, get_global_dirs};

pub const CONFIG_FILE: &str = "config.toml";
pub const PREFIX_ENV: &str = "FORMA_PREFIX";

/// Contents of `config.toml`. Every field is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub prefix: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub formula_dirs: Vec<PathBuf>,
}

impl Config {
    /// Loads `config.toml` from the global config directory, or defaults if absent.
    pub fn load_global() -> Result<Config> {
        Config::load_or_default(get_global_config_dir()?.join(CONFIG_FILE))
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

/// Overrides taken from the command line.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub prefix: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub formula_dirs: Vec<PathBuf>,
}

/// Where kegs, links, cached downloads and formulas live.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub prefix: PathBuf,
    pub cache_dir: PathBuf,
    pub formula_dirs: Vec<PathBuf>,
}

impl Layout {
    pub fn new<P: AsRef<Path>, C: AsRef<Path>>(prefix: P, cache_dir: C) -> Self {
        let prefix = prefix.as_ref().to_path_buf();
        Layout {
            formula_dirs: vec![prefix.join("Formula")],
            prefix,
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    /// Combines defaults, config file, environment and command-line overrides.
    pub fn resolve(config: &Config, overrides: &Overrides) -> Result<Layout> {
        let (_, default_cache, default_data) = get_global_dirs()?;
        let env_prefix = std::env::var_os(PREFIX_ENV).map(PathBuf::from);
        let mut layout = Layout::resolve_with(
            config,
            overrides,
            env_prefix,
            default_data,
            default_cache,
        );
        // links in `<prefix>/bin` must not depend on the working directory
        layout.prefix = std::path::absolute(&layout.prefix)
            .with_context(|| format!("Invalid prefix {}", layout.prefix.display()))?;
        Ok(layout)
    }

    fn resolve_with(
        config: &Config,
        overrides: &Overrides,
        env_prefix: Option<PathBuf>,
        default_prefix: PathBuf,
        default_cache: PathBuf,
    ) -> Layout {
        let prefix = overrides
            .prefix
            .clone()
            .or(env_prefix)
            .or_else(|| config.prefix.clone())
            .unwrap_or(default_prefix);
        let cache_dir = overrides
            .cache_dir
            .clone()
            .or_else(|| config.cache_dir.clone())
            .unwrap_or(default_cache);
        let mut layout = Layout::new(prefix, cache_dir);
        if !overrides.formula_dirs.is_empty() {
            layout.formula_dirs = overrides.formula_dirs.clone();
        } else if !config.formula_dirs.is_empty() {
            layout.formula_dirs = config.formula_dirs.clone();
        }
        layout
    }

    /// Root of all kegs: `<prefix>/Cellar`.
    pub fn cellar(&self) -> PathBuf {
        self.prefix.join("Cellar")
    }

    /// Directory holding links to installed executables: `<prefix>/bin`.
    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn keg_path(&self, name: &str, version: &str) -> PathBuf {
        self.cellar().join(name).join(version)
    }

    /// Creates the prefix, cellar, bin and cache directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.cellar(), self.bin_dir(), self.cache_dir.clone()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Could not create {}", dir.display()))?;
        }
        Ok(())
    }
}
