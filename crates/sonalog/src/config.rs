//! Configuration management for sonalog.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "sonalog";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "sonalog.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SONALOG_`, sections separated by `__`)
/// 2. TOML config file at `~/.config/sonalog/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local store configuration.
    pub storage: StorageConfig,
    /// Location capture configuration.
    pub location: LocationConfig,
    /// Family sharing configuration.
    pub family: FamilyConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/sonalog/sonalog.db`
    pub database_path: Option<PathBuf>,
    /// Maximum total size of stored bucket payloads in bytes.
    /// Set to 0 for unlimited.
    pub quota_bytes: u64,
}

/// Where device positions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationProvider {
    /// Query a local gpsd daemon.
    #[default]
    Gpsd,
    /// Use the coordinates from this configuration.
    Static,
    /// Location access is switched off.
    Disabled,
}

/// Location capture configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Position provider.
    pub provider: LocationProvider,
    /// Upper bound for one acquisition, in seconds.
    pub timeout_secs: u64,
    /// Accept a cached fix up to this age, in seconds.
    pub maximum_age_secs: u64,
    /// Require a 3D fix from providers that distinguish fix quality.
    pub high_accuracy: bool,
    /// Address of the gpsd daemon.
    pub gpsd_address: String,
    /// Latitude for the static provider.
    pub static_latitude: Option<f64>,
    /// Longitude for the static provider.
    pub static_longitude: Option<f64>,
    /// Reported accuracy for the static provider, in meters.
    pub static_accuracy: f64,
    /// Look up a human-readable address for each fix.
    pub reverse_geocode: bool,
    /// Base URL of the Nominatim-compatible reverse geocoder.
    pub geocoder_url: String,
    /// Preferred language for geocoded addresses.
    pub accept_language: String,
}

/// Which family backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hosted REST backend.
    #[default]
    Rest,
    /// In-process backend; records live only as long as the process.
    Memory,
}

/// Family sharing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyConfig {
    /// Backend implementation.
    pub backend: BackendKind,
    /// Base URL of the REST backend.
    pub backend_url: Option<String>,
    /// API key sent with every backend request.
    pub api_key: Option<String>,
    /// How often the REST change feed polls for changes, in milliseconds.
    pub poll_interval_ms: u64,
    /// HTTP request timeout, in milliseconds.
    pub request_timeout_ms: u64,
    /// Republish interval for `family watch --auto-update`, in minutes.
    pub auto_update_minutes: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Resolved at runtime
            quota_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            provider: LocationProvider::default(),
            timeout_secs: 10,
            maximum_age_secs: 300,
            high_accuracy: false,
            gpsd_address: "127.0.0.1:2947".to_string(),
            static_latitude: None,
            static_longitude: None,
            static_accuracy: 50.0,
            reverse_geocode: true,
            geocoder_url: "https://nominatim.openstreetmap.org".to_string(),
            accept_language: "ja".to_string(),
        }
    }
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            backend_url: None,
            api_key: None,
            poll_interval_ms: 2_000,
            request_timeout_ms: 10_000,
            auto_update_minutes: 5,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("SONALOG_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.location.timeout_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "location.timeout_secs must be greater than 0".to_string(),
            });
        }

        if let Some(lat) = self.location.static_latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(Error::ConfigValidation {
                    message: format!("location.static_latitude ({lat}) must be between -90 and 90"),
                });
            }
        }

        if let Some(lon) = self.location.static_longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(Error::ConfigValidation {
                    message: format!(
                        "location.static_longitude ({lon}) must be between -180 and 180"
                    ),
                });
            }
        }

        if self.location.static_accuracy < 0.0 {
            return Err(Error::ConfigValidation {
                message: "location.static_accuracy must not be negative".to_string(),
            });
        }

        if self.location.provider == LocationProvider::Static
            && (self.location.static_latitude.is_none() || self.location.static_longitude.is_none())
        {
            return Err(Error::ConfigValidation {
                message: "the static location provider needs static_latitude and static_longitude"
                    .to_string(),
            });
        }

        if self.location.reverse_geocode && !is_http_url(&self.location.geocoder_url) {
            return Err(Error::ConfigValidation {
                message: format!(
                    "location.geocoder_url must be an http(s) URL: {}",
                    self.location.geocoder_url
                ),
            });
        }

        if self.family.poll_interval_ms == 0 {
            return Err(Error::ConfigValidation {
                message: "family.poll_interval_ms must be greater than 0".to_string(),
            });
        }

        if self.family.request_timeout_ms == 0 {
            return Err(Error::ConfigValidation {
                message: "family.request_timeout_ms must be greater than 0".to_string(),
            });
        }

        if let Some(url) = &self.family.backend_url {
            if !is_http_url(url) {
                return Err(Error::ConfigValidation {
                    message: format!("family.backend_url must be an http(s) URL: {url}"),
                });
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the location acquisition timeout.
    #[must_use]
    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location.timeout_secs)
    }

    /// Get the maximum age of a cached fix.
    #[must_use]
    pub fn location_maximum_age(&self) -> Duration {
        Duration::from_secs(self.location.maximum_age_secs)
    }

    /// Get the change feed poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.family.poll_interval_ms)
    }

    /// Get the backend request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.family.request_timeout_ms)
    }

    /// Get the auto-update interval, or `None` when disabled.
    #[must_use]
    pub fn auto_update_interval(&self) -> Option<Duration> {
        if self.family.auto_update_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(
                u64::from(self.family.auto_update_minutes) * 60,
            ))
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
