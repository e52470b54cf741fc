use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::reconcile::ReconcileWindows;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Scheduling
    #[serde(default = "default_reconcile_interval", alias = "check_interval_seconds")]
    pub reconcile_interval_secs: u64,
    #[serde(default)]
    pub run_on_startup: bool,

    // Idle-time windows, in minutes
    #[serde(default = "default_notify_after_mins")]
    pub notify_after_mins: i64,
    #[serde(default = "default_notify_until_mins")]
    pub notify_until_mins: i64,
    #[serde(default = "default_reset_after_mins")]
    pub reset_after_mins: i64,

    // Alert routing
    #[serde(default = "default_organization_name")]
    pub organization_name: String,
    #[serde(default = "default_organization_name")]
    pub metrics_organization_name: String,
    #[serde(default = "default_ops_mailbox")]
    pub ops_mailbox: String,

    // Alert content
    #[serde(default = "default_notification_message")]
    pub notification_message: String,
    #[serde(default = "default_notification_icon_url")]
    pub notification_icon_url: String,
    #[serde(default)]
    pub email_logo_url: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_database_path() -> String {
    "stallwatch.db".to_string()
}

fn default_reconcile_interval() -> u64 {
    3600
}

fn default_notify_after_mins() -> i64 {
    3 * 60
}

fn default_notify_until_mins() -> i64 {
    5 * 60
}

fn default_reset_after_mins() -> i64 {
    24 * 60
}

fn default_organization_name() -> String {
    "coltefinanciera".to_string()
}

fn default_ops_mailbox() -> String {
    "operations@localhost".to_string()
}

fn default_notification_message() -> String {
    "You have unfinished conversations".to_string()
}

fn default_notification_icon_url() -> String {
    "/icons/message-square-exclamation.svg".to_string()
}

fn default_timezone() -> String {
    "America/Bogota".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            reconcile_interval_secs: default_reconcile_interval(),
            run_on_startup: false,
            notify_after_mins: default_notify_after_mins(),
            notify_until_mins: default_notify_until_mins(),
            reset_after_mins: default_reset_after_mins(),
            organization_name: default_organization_name(),
            metrics_organization_name: default_organization_name(),
            ops_mailbox: default_ops_mailbox(),
            notification_message: default_notification_message(),
            notification_icon_url: default_notification_icon_url(),
            email_logo_url: None,
            timezone: default_timezone(),
        }
    }
}

impl WatchConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable), overridable with `STALLWATCH_CONFIG`.
    pub fn config_path() -> PathBuf {
        match env::var("STALLWATCH_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => Self::get_base_dir().join("stallwatch_config.toml"),
        }
    }

    /// Load config from the TOML file, falling back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                return config;
            }
            Ok(None) => tracing::warn!("No config file found, using defaults + env vars"),
            Err(e) => tracing::error!("{:#}; using defaults + env vars", e),
        }
        Self::from_env()
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let config = toml::from_str::<WatchConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(config))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("STALLWATCH_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(interval) = env::var("STALLWATCH_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.reconcile_interval_secs = seconds;
            }
        }

        if let Ok(enabled) = env::var("STALLWATCH_RUN_ON_STARTUP") {
            config.run_on_startup = parse_flag(&enabled);
        }

        if let Ok(minutes) = env::var("STALLWATCH_NOTIFY_AFTER_MINS") {
            if let Ok(minutes) = minutes.parse() {
                config.notify_after_mins = minutes;
            }
        }

        if let Ok(minutes) = env::var("STALLWATCH_NOTIFY_UNTIL_MINS") {
            if let Ok(minutes) = minutes.parse() {
                config.notify_until_mins = minutes;
            }
        }

        if let Ok(minutes) = env::var("STALLWATCH_RESET_AFTER_MINS") {
            if let Ok(minutes) = minutes.parse() {
                config.reset_after_mins = minutes;
            }
        }

        if let Ok(name) = env::var("STALLWATCH_ORGANIZATION") {
            if !name.trim().is_empty() {
                config.metrics_organization_name = name.clone();
                config.organization_name = name;
            }
        }

        if let Ok(name) = env::var("STALLWATCH_METRICS_ORGANIZATION") {
            if !name.trim().is_empty() {
                config.metrics_organization_name = name;
            }
        }

        if let Ok(mailbox) = env::var("STALLWATCH_OPS_MAILBOX") {
            if !mailbox.trim().is_empty() {
                config.ops_mailbox = mailbox;
            }
        }

        if let Ok(tz) = env::var("STALLWATCH_TIMEZONE") {
            if !tz.trim().is_empty() {
                config.timezone = tz;
            }
        }

        config
    }

    /// Idle-time windows derived from the minute fields.
    pub fn windows(&self) -> Result<ReconcileWindows> {
        ReconcileWindows::new(
            minutes("notify_after_mins", self.notify_after_mins)?,
            minutes("notify_until_mins", self.notify_until_mins)?,
            minutes("reset_after_mins", self.reset_after_mins)?,
        )
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|e| anyhow!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

fn minutes(field: &str, value: i64) -> Result<Duration> {
    Duration::try_minutes(value).ok_or_else(|| anyhow!("{} = {} is out of range", field, value))
}

fn parse_flag(raw: &str) -> bool {
    ["1", "true", "yes"]
        .iter()
        .any(|truthy| raw.eq_ignore_ascii_case(truthy))
}
