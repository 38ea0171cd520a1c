//! Configuration management for livetrip.
//!
//! Configuration is layered with figment: built-in defaults, then a TOML
//! file, then `LIVETRIP_` environment variables.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::PhoneRules;
use crate::error::{Error, Result};
use crate::fix::{Accuracy, FixOptions, WatchOptions};
use crate::session::SessionConfig;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "livetrip";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "livetrip.db";

/// Shape of `auth.country_code`.
const COUNTRY_CODE_PATTERN: &str = r"^\+[0-9]{1,3}$";

fn country_code_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(COUNTRY_CODE_PATTERN).expect("Invalid regex pattern"))
}

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `LIVETRIP_`, sections split on `__`,
///    e.g. `LIVETRIP_LOCATION__INTERVAL_MS`)
/// 2. TOML config file at `~/.config/livetrip/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Positioning configuration.
    pub location: LocationConfig,
    /// Trip store configuration.
    pub store: StoreConfig,
    /// Session configuration.
    pub session: SessionSettings,
    /// Sign-in configuration.
    pub auth: AuthConfig,
}

/// Positioning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Upper bound on the one-shot fix at trip start, in milliseconds.
    pub fix_timeout_ms: u64,
    /// Oldest acceptable cached fix, in milliseconds.
    pub fix_maximum_age_ms: u64,
    /// Prefer GPS over power-saving positioning.
    pub high_accuracy: bool,
    /// Minimum movement between two continuous reports, in meters.
    pub distance_filter_m: f64,
    /// Minimum time between two continuous reports, in milliseconds.
    pub interval_ms: u64,
    /// Only report significant location changes.
    pub use_significant_changes: bool,
}

/// Trip store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/livetrip/livetrip.db`
    pub database_path: Option<PathBuf>,
    /// Bound on every store read or write issued by a session, in milliseconds.
    pub write_timeout_ms: u64,
    /// Polling period of the bus feed, in milliseconds.
    pub feed_poll_interval_ms: u64,
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Capacity of the fix channel between the location source and the session.
    pub event_buffer: usize,
}

/// Sign-in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Prefix prepended to the local number, e.g. `+91`.
    pub country_code: String,
    /// Digits in a local phone number.
    pub phone_digits: usize,
    /// Digits in a verification code.
    pub code_digits: usize,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            fix_timeout_ms: 15_000,
            fix_maximum_age_ms: 10_000,
            high_accuracy: true,
            distance_filter_m: 10.0,
            interval_ms: 5_000,
            use_significant_changes: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Resolved at runtime
            write_timeout_ms: 10_000,
            feed_poll_interval_ms: 1_000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            country_code: "+91".to_string(),
            phone_digits: 10,
            code_digits: 6,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("LIVETRIP_").split("__"));

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
        for (name, value) in [
            ("location.fix_timeout_ms", self.location.fix_timeout_ms),
            ("location.fix_maximum_age_ms", self.location.fix_maximum_age_ms),
            ("location.interval_ms", self.location.interval_ms),
            ("store.write_timeout_ms", self.store.write_timeout_ms),
            ("store.feed_poll_interval_ms", self.store.feed_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than 0")));
            }
        }

        let distance = self.location.distance_filter_m;
        if !distance.is_finite() || distance < 0.0 {
            return Err(invalid(format!(
                "location.distance_filter_m must be a non-negative number, got {distance}"
            )));
        }

        if self.session.event_buffer == 0 {
            return Err(invalid("session.event_buffer must be greater than 0"));
        }

        if !country_code_regex().is_match(&self.auth.country_code) {
            return Err(invalid(format!(
                "auth.country_code must look like +91, got {:?}",
                self.auth.country_code
            )));
        }

        if self.auth.phone_digits == 0 || self.auth.code_digits == 0 {
            return Err(invalid(
                "auth.phone_digits and auth.code_digits must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    fn accuracy(&self) -> Accuracy {
        if self.location.high_accuracy {
            Accuracy::High
        } else {
            Accuracy::PowerSaving
        }
    }

    /// Options for the one-shot fix at trip start.
    #[must_use]
    pub fn fix_options(&self) -> FixOptions {
        FixOptions {
            timeout: Duration::from_millis(self.location.fix_timeout_ms),
            maximum_age: Duration::from_millis(self.location.fix_maximum_age_ms),
            accuracy: self.accuracy(),
        }
    }

    /// Options for the continuous subscription.
    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            distance_filter_m: self.location.distance_filter_m,
            interval: Duration::from_millis(self.location.interval_ms),
            accuracy: self.accuracy(),
            use_significant_changes: self.location.use_significant_changes,
        }
    }

    /// Get the bus feed polling period.
    #[must_use]
    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.feed_poll_interval_ms)
    }

    /// Everything a trip session needs to know.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            fix_options: self.fix_options(),
            watch_options: self.watch_options(),
            write_timeout: Duration::from_millis(self.store.write_timeout_ms),
            event_buffer: self.session.event_buffer,
        }
    }

    /// Phone number and code rules for sign-in.
    #[must_use]
    pub fn phone_rules(&self) -> PhoneRules {
        PhoneRules {
            country_code: self.auth.country_code.clone(),
            phone_digits: self.auth.phone_digits,
            code_digits: self.auth.code_digits,
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
