//! Configuration file management for the Hub.
//!
//! Provides a TOML-based config file at `~/.config/hub/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default, for every
//! setting enumerated in spec.md §6.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hub_core::project::PortRanges;
use hub_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub federation: FederationSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BusSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PortsSection {
    pub backend: Option<(u16, u16)>,
    pub frontend: Option<(u16, u16)>,
    pub db: Option<(u16, u16)>,
    pub cache: Option<(u16, u16)>,
    pub worker_tokens: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FederationSection {
    pub stale_threshold_seconds: Option<u64>,
    pub stale_check_interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ApiSection {
    pub keys: Option<Vec<String>>,
    pub container_driver: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the hub config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/hub` or `~/.config/hub`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("hub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("hub")
}

/// Return the path to the hub config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved Hub configuration, ready for use by `serve` and the
/// operator subcommands.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub db_config: DbConfig,
    pub bus_url: String,
    pub port_ranges: PortRanges,
    pub worker_tokens: usize,
    pub stale_threshold_seconds: u64,
    pub stale_check_interval_seconds: u64,
    pub api_keys: Vec<String>,
    pub container_driver: String,
}

const DEFAULT_BUS_URL: &str = "nats://localhost:4222";
const DEFAULT_WORKER_TOKENS: usize = 4;
const DEFAULT_STALE_THRESHOLD_SECONDS: u64 = 90;
const DEFAULT_STALE_CHECK_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_CONTAINER_DRIVER: &str = "docker-compose";

impl HubConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, independently for every setting in spec.md §6.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let db_url = cli_db_url
            .map(str::to_string)
            .or_else(|| std::env::var("HUB_DATABASE_URL").ok())
            .or(file.database.url.clone())
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_string());

        let bus_url = std::env::var("BUS_URL")
            .ok()
            .or(file.bus.url.clone())
            .unwrap_or_else(|| DEFAULT_BUS_URL.to_string());

        let default_ranges = PortRanges::default();
        let port_ranges = PortRanges {
            backend: env_port_range("PORT_RANGE_BACKEND").or(file.ports.backend).unwrap_or(default_ranges.backend),
            frontend: env_port_range("PORT_RANGE_FRONTEND").or(file.ports.frontend).unwrap_or(default_ranges.frontend),
            db: env_port_range("PORT_RANGE_DB").or(file.ports.db).unwrap_or(default_ranges.db),
            cache: env_port_range("PORT_RANGE_CACHE").or(file.ports.cache).unwrap_or(default_ranges.cache),
        };

        let worker_tokens = env_parse("WORKER_TOKENS")
            .or(file.ports.worker_tokens)
            .unwrap_or(DEFAULT_WORKER_TOKENS);

        let stale_threshold_seconds = env_parse("STALE_THRESHOLD_SECONDS")
            .or(file.federation.stale_threshold_seconds)
            .unwrap_or(DEFAULT_STALE_THRESHOLD_SECONDS);

        let stale_check_interval_seconds = env_parse("STALE_CHECK_INTERVAL_SECONDS")
            .or(file.federation.stale_check_interval_seconds)
            .unwrap_or(DEFAULT_STALE_CHECK_INTERVAL_SECONDS);

        let api_keys = std::env::var("API_KEYS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .or(file.api.keys.clone())
            .unwrap_or_default();

        let container_driver = std::env::var("CONTAINER_DRIVER")
            .ok()
            .or(file.api.container_driver.clone())
            .unwrap_or_else(|| DEFAULT_CONTAINER_DRIVER.to_string());

        Ok(Self {
            db_config: DbConfig::new(db_url),
            bus_url,
            port_ranges,
            worker_tokens,
            stale_threshold_seconds,
            stale_check_interval_seconds,
            api_keys,
            container_driver,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_port_range(name: &str) -> Option<(u16, u16)> {
    let raw = std::env::var(name).ok()?;
    let (lo, hi) = raw.split_once('-')?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let original = ConfigFile {
            database: DatabaseSection { url: Some("postgresql://testhost:5432/testdb".to_string()) },
            ..Default::default()
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        unsafe { std::env::set_var("HUB_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = HubConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("HUB_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("HUB_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = HubConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("HUB_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("HUB_DATABASE_URL") };
        unsafe { std::env::remove_var("API_KEYS") };

        let config = HubConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.worker_tokens, DEFAULT_WORKER_TOKENS);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn env_port_range_parses_dash_separated_bounds() {
        unsafe { std::env::set_var("HUB_TEST_PORT_RANGE", "9000-9099") };
        assert_eq!(env_port_range("HUB_TEST_PORT_RANGE"), Some((9000, 9099)));
        unsafe { std::env::remove_var("HUB_TEST_PORT_RANGE") };
    }

    #[test]
    fn api_keys_env_splits_on_comma() {
        let _lock = lock_env();
        unsafe { std::env::set_var("API_KEYS", "key-a, key-b ,key-c") };
        let config = HubConfig::resolve(None).unwrap();
        assert_eq!(config.api_keys, vec!["key-a", "key-b", "key-c"]);
        unsafe { std::env::remove_var("API_KEYS") };
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("hub/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
