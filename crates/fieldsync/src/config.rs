//! Configuration loading for the sync service
//!
//! Supports loading settings from (in order of priority):
//! 1. A JSON file named by `FIELDSYNC_CONFIG`
//! 2. `settings.json` in the fieldsync config directory
//! 3. Runtime environment variables (fallback)

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::LOCK_FILE;
use crate::models::STUCK_THRESHOLD_SECS;
use crate::sync::{FetchPolicy, STATE_FILE, ScheduleConfig};

/// Settings filename in the fieldsync config directory
const SETTINGS_FILE: &str = "settings.json";

/// Environment variable naming an explicit settings file
pub const CONFIG_ENV: &str = "FIELDSYNC_CONFIG";

/// Database filename used when no path is configured
const DB_FILE: &str = "fieldsync.db";

pub const DEFAULT_TOKEN_URL: &str = "https://auth.servicetitan.io/connect/token";
pub const DEFAULT_API_BASE: &str = "https://api.servicetitan.io";

/// Everything the service needs to run
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    pub tenant: String,
    pub client_id: String,
    pub client_secret: String,
    pub app_key: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// SQLite database file; defaults to `fieldsync.db` in the data dir
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Directory for the state and lock files
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Lower time bound for entities that support one
    #[serde(default)]
    pub sync_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    pub request_secs: u64,
    pub token_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            request_secs: 30,
            token_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleSettings {
    pub quick_interval_mins: u64,
    pub full_interval_mins: u64,
    pub probe_interval_mins: u64,
    pub startup_delay_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            quick_interval_mins: 30,
            full_interval_mins: 180,
            probe_interval_mins: 15,
            startup_delay_secs: 10,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchSettings {
    pub max_consecutive_errors: u32,
    pub retry_delay_ms: u64,
    /// Overrides every entity's pacing delay
    pub pacing_ms: Option<u64>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            retry_delay_ms: 2000,
            pacing_ms: None,
        }
    }
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl ServiceSettings {
    /// Load settings using the following priority:
    /// 1. File named by `FIELDSYNC_CONFIG`
    /// 2. JSON file (~/.config/fieldsync/settings.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }

        if config::config_exists(SETTINGS_FILE) {
            let settings: Self = config::load_json(SETTINGS_FILE)?;
            settings.validate()?;
            return Ok(settings);
        }

        Self::from_env()
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings: Self = config::load_json_file(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self =
            serde_json::from_str(json).context("Failed to parse settings JSON")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{} environment variable not set", key))
        };

        let sync_since = lookup("FIELDSYNC_SYNC_SINCE")
            .filter(|v| !v.is_empty())
            .map(|v| parse_since(&v))
            .transpose()?;

        let settings = Self {
            tenant: required("ST_TENANT")?,
            client_id: required("ST_CLIENT_ID")?,
            client_secret: required("ST_CLIENT_SECRET")?,
            app_key: required("ST_APP_KEY")?,
            token_url: lookup("ST_TOKEN_URL").unwrap_or_else(default_token_url),
            api_base: lookup("ST_API_BASE").unwrap_or_else(default_api_base),
            db_path: lookup("FIELDSYNC_DB_PATH").map(PathBuf::from),
            data_dir: lookup("FIELDSYNC_DATA_DIR").map(PathBuf::from),
            sync_since,
            timeouts: TimeoutSettings::default(),
            schedule: ScheduleSettings::default(),
            fetch: FetchSettings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tenant", &self.tenant),
            ("clientId", &self.client_id),
            ("clientSecret", &self.client_secret),
            ("appKey", &self.app_key),
        ] {
            if value.trim().is_empty() {
                bail!("Setting '{}' must not be empty", name);
            }
        }

        let schedule = &self.schedule;
        if schedule.quick_interval_mins == 0
            || schedule.full_interval_mins == 0
            || schedule.probe_interval_mins == 0
        {
            bail!("Schedule intervals must be at least one minute");
        }
        // The probe also refreshes the process lock
        if schedule.probe_interval_mins * 60 >= STUCK_THRESHOLD_SECS as u64 {
            bail!(
                "schedule.probeIntervalMins must be under {} minutes",
                STUCK_THRESHOLD_SECS / 60
            );
        }
        if self.fetch.max_consecutive_errors == 0 {
            bail!("fetch.maxConsecutiveErrors must be at least 1");
        }
        Ok(())
    }

    /// Directory for state, lock and (by default) the database
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::data_dir().context("Could not determine data directory"),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join(DB_FILE)),
        }
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STATE_FILE))
    }

    pub fn lock_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(LOCK_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.token_secs)
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        let s = &self.schedule;
        ScheduleConfig {
            quick_interval: Duration::from_secs(s.quick_interval_mins * 60),
            full_interval: Duration::from_secs(s.full_interval_mins * 60),
            probe_interval: Duration::from_secs(s.probe_interval_mins * 60),
            startup_delay: Duration::from_secs(s.startup_delay_secs),
            shutdown_grace: Duration::from_secs(s.shutdown_grace_secs),
        }
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_consecutive_errors: self.fetch.max_consecutive_errors,
            retry_delay: Duration::from_millis(self.fetch.retry_delay_ms),
            pacing_override: self.fetch.pacing_ms.map(Duration::from_millis),
            watermark: self.sync_since,
        }
    }

    /// Get the default settings file path (~/.config/fieldsync/settings.json)
    pub fn default_settings_path() -> Option<PathBuf> {
        config::config_path(SETTINGS_FILE)
    }
}

/// Accept a full RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC)
fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid FIELDSYNC_SYNC_SINCE value: {}", value))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}
