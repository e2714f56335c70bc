//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::constants::{BUILD_PER_PAGE_LIMIT, BUILD_POTENTIAL_LIMIT};

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxisearchConfig {
    /// Adaptive hash search configuration.
    pub search: Option<SearchConfigSpec>,
    /// Buffer pool configuration.
    pub pool: Option<PoolConfigSpec>,
}

impl OxisearchConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXISEARCH_CONFIG` env var (if set),
    /// then apply `OXISEARCH__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXISEARCH_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXISEARCH__") {
                continue;
            }
            let path = key["OXISEARCH__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["search", "enabled"] => {
                    self.search_mut().enabled = Some(parse_value(&key, &value)?);
                }
                ["search", "build_per_page_limit"] => {
                    self.search_mut().build_per_page_limit = Some(parse_value(&key, &value)?);
                }
                ["search", "build_potential_limit"] => {
                    self.search_mut().build_potential_limit = Some(parse_value(&key, &value)?);
                }
                ["pool", "n_pages"] => {
                    self.pool_mut().n_pages = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build an `AhiConfig` using defaults plus overrides.
    pub fn to_ahi_config(&self) -> AhiConfig {
        let mut config = AhiConfig::default();
        if let Some(search) = &self.search {
            search.apply_to(&mut config);
        }
        config
    }

    /// Build a `PoolConfig` using defaults plus overrides.
    pub fn to_pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default();
        if let Some(pool) = &self.pool {
            pool.apply_to(&mut config);
        }
        config
    }

    fn search_mut(&mut self) -> &mut SearchConfigSpec {
        if self.search.is_none() {
            self.search = Some(SearchConfigSpec::default());
        }
        self.search.as_mut().expect("search config")
    }

    fn pool_mut(&mut self) -> &mut PoolConfigSpec {
        if self.pool.is_none() {
            self.pool = Some(PoolConfigSpec::default());
        }
        self.pool.as_mut().expect("pool config")
    }
}

/// Adaptive hash search configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchConfigSpec {
    /// Whether the adaptive hash index is enabled at startup.
    pub enabled: Option<bool>,
    /// Per-page build vote divisor.
    pub build_per_page_limit: Option<u32>,
    /// Global potential threshold before a page is built.
    pub build_potential_limit: Option<u32>,
}

impl SearchConfigSpec {
    fn apply_to(&self, config: &mut AhiConfig) {
        if let Some(value) = self.enabled {
            config.enabled = value;
        }
        if let Some(value) = self.build_per_page_limit {
            config.build_per_page_limit = value.max(1);
        }
        if let Some(value) = self.build_potential_limit {
            config.build_potential_limit = value.max(1);
        }
    }
}

/// Buffer pool configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfigSpec {
    /// Number of page frames in the pool.
    pub n_pages: Option<usize>,
}

impl PoolConfigSpec {
    fn apply_to(&self, config: &mut PoolConfig) {
        if let Some(value) = self.n_pages {
            config.n_pages = value.max(1);
        }
    }
}

/// Resolved adaptive hash search configuration.
#[derive(Debug, Clone)]
pub struct AhiConfig {
    /// Whether the hash index is enabled at startup.
    pub enabled: bool,
    /// A page is voted for building when the number of assists exceeds the
    /// page record count divided by this limit.
    pub build_per_page_limit: u32,
    /// Consecutive potentially successful searches required before building.
    pub build_potential_limit: u32,
}

impl Default for AhiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            build_per_page_limit: BUILD_PER_PAGE_LIMIT,
            build_potential_limit: BUILD_POTENTIAL_LIMIT,
        }
    }
}

/// Resolved buffer pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of page frames in the pool.
    pub n_pages: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { n_pages: 256 }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = OxisearchConfig::default();
        let ahi = config.to_ahi_config();
        assert!(ahi.enabled);
        assert_eq!(ahi.build_per_page_limit, 16);
        assert_eq!(ahi.build_potential_limit, 100);
        assert_eq!(config.to_pool_config().n_pages, 256);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        unsafe {
            env::set_var("OXISEARCH__search__enabled", "false");
            env::set_var("OXISEARCH__search__build_potential_limit", "10");
            env::set_var("OXISEARCH__pool__n_pages", "64");
        }

        let mut config = OxisearchConfig::default();
        config.apply_env_overrides().unwrap();

        unsafe {
            env::remove_var("OXISEARCH__search__enabled");
            env::remove_var("OXISEARCH__search__build_potential_limit");
            env::remove_var("OXISEARCH__pool__n_pages");
        }

        let ahi = config.to_ahi_config();
        assert!(!ahi.enabled);
        assert_eq!(ahi.build_potential_limit, 10);
        assert_eq!(config.to_pool_config().n_pages, 64);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();

        unsafe {
            env::set_var("OXISEARCH__search__no_such_key", "1");
        }
        let mut config = OxisearchConfig::default();
        let result = config.apply_env_overrides();
        unsafe {
            env::remove_var("OXISEARCH__search__no_such_key");
        }
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[search]\nbuild_per_page_limit = 8\n\n[pool]\nn_pages = 32\n"
        )
        .unwrap();

        let config = OxisearchConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.to_ahi_config().build_per_page_limit, 8);
        assert_eq!(config.to_pool_config().n_pages, 32);
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let result = OxisearchConfig::load_from_path("/nonexistent/oxisearch.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_value() {
        let _guard = ENV_LOCK.lock().unwrap();

        unsafe {
            env::set_var("OXISEARCH__pool__n_pages", "not-a-number");
        }
        let mut config = OxisearchConfig::default();
        let result = config.apply_env_overrides();
        unsafe {
            env::remove_var("OXISEARCH__pool__n_pages");
        }
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
