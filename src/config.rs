use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::image_builder::{ImageBuilderType, MkisofsConfig};
use crate::core::models::FileSystemType;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/isoforge/config.toml";
pub const ENV_PREFIX: &str = "ISOFORGE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub poll_interval_secs: u64,
    pub progress_interval_secs: u64,
    pub soft_timeout_secs: u64,
    pub hard_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            progress_interval_secs: 30,
            soft_timeout_secs: 10 * 60,
            hard_timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub builder: ImageBuilderType,
    pub file_system: FileSystemType,
    pub mkisofs: MkisofsConfig,
    pub timeouts: TimeoutConfig,
    pub verbose: bool,
    pub json_logs: bool,
}

impl AppConfig {
    /// Layer defaults, the TOML file, `ISOFORGE_*` env vars and CLI args,
    /// later layers winning.
    ///
    /// Nested keys use `__` in env vars, e.g.
    /// `ISOFORGE_TIMEOUTS__HARD_TIMEOUT_SECS=600`.
    pub fn new<T: Serialize>(config_path: Option<&Path>, cli_args: Option<&T>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if config_path.is_some() && !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let figment = Self::figment(&path).merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment, cli_args)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::file(path))
    }

    fn extract<T: Serialize>(mut figment: Figment, cli_args: Option<&T>) -> Result<Self> {
        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.poll_interval_secs == 0 {
            bail!("timeouts.poll_interval_secs must be greater than zero");
        }
        if t.progress_interval_secs == 0 {
            bail!("timeouts.progress_interval_secs must be greater than zero");
        }
        if t.hard_timeout_secs == 0 {
            bail!("timeouts.hard_timeout_secs must be greater than zero");
        }
        if t.soft_timeout_secs > t.hard_timeout_secs {
            bail!(
                "timeouts.soft_timeout_secs ({}) must not exceed timeouts.hard_timeout_secs ({})",
                t.soft_timeout_secs,
                t.hard_timeout_secs
            );
        }
        if self.builder == ImageBuilderType::Mkisofs && self.mkisofs.program.trim().is_empty() {
            bail!("mkisofs.program must not be empty");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
