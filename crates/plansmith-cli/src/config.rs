//! Configuration file management for plansmith.
//!
//! Provides a TOML config file at `~/.config/plansmith/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use plansmith_core::EngineConfig;
use plansmith_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the plansmith config directory: `$XDG_CONFIG_HOME/plansmith` or
/// `~/.config/plansmith`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("plansmith");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("plansmith")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // The database URL may carry a password.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct PlansmithConfig {
    pub db_config: DbConfig,
    pub engine: EngineConfig,
}

impl PlansmithConfig {
    /// Resolve from the process environment and the default config path.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            Some(load_config(&path)?)
        } else {
            None
        };
        let env_url = std::env::var(DbConfig::ENV_VAR).ok();
        Ok(Self::resolve_from(cli_db_url, env_url.as_deref(), file))
    }

    /// - DB URL: `cli_db_url` > `PLANSMITH_DATABASE_URL` > `database.url` > `DbConfig::DEFAULT_URL`
    /// - Engine: `[engine]` section, defaults for anything missing
    pub fn resolve_from(
        cli_db_url: Option<&str>,
        env_db_url: Option<&str>,
        file: Option<ConfigFile>,
    ) -> Self {
        let (file_url, engine) = match file {
            Some(cfg) => (Some(cfg.database.url), cfg.engine),
            None => (None, EngineConfig::default()),
        };

        let db_url = cli_db_url
            .or(env_db_url)
            .map(str::to_string)
            .or(file_url)
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_string());

        Self {
            db_config: DbConfig::new(db_url),
            engine,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
