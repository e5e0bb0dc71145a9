//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::fetch::RetryPolicy;
use crate::task::kinds::{CommandKind, NotifierId, TaskKind};

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application identifier, used as the result file prefix.
    pub app_name: String,
    /// Directory holding persisted task results.
    pub data_dir: PathBuf,
    /// Path to the JSON schedule table.
    pub schedule_path: PathBuf,
    /// Capacity of the coordinator's run/cancel queues.
    pub request_queue_capacity: usize,
    /// Retry policy for outbound HTTP.
    pub fetch: RetryPolicy,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Notifier used for stdin commands.
    pub default_notifier: NotifierId,
    /// URLs polled by the built-in site watch task.
    pub watch_urls: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "taskbot".to_string(),
            data_dir: PathBuf::from("./data"),
            schedule_path: PathBuf::from("./schedule.json"),
            request_queue_capacity: 64,
            fetch: RetryPolicy::default(),
            log_dir: None,
            default_notifier: NotifierId::from("default"),
            watch_urls: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Build from `TASKBOT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let request_queue_capacity: usize =
            parse_env("TASKBOT_QUEUE_CAPACITY")?.unwrap_or(defaults.request_queue_capacity);
        if request_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKBOT_QUEUE_CAPACITY".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let fetch = RetryPolicy {
            max_retries: parse_env("TASKBOT_FETCH_MAX_RETRIES")?
                .unwrap_or(defaults.fetch.max_retries),
            min_delay: parse_env("TASKBOT_FETCH_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch.min_delay),
            max_delay: parse_env("TASKBOT_FETCH_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch.max_delay),
        };

        Ok(Self {
            app_name: std::env::var("TASKBOT_APP_NAME").unwrap_or(defaults.app_name),
            data_dir: std::env::var("TASKBOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            schedule_path: std::env::var("TASKBOT_SCHEDULE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.schedule_path),
            request_queue_capacity,
            fetch,
            log_dir: std::env::var("TASKBOT_LOG_DIR").ok().map(PathBuf::from),
            default_notifier: std::env::var("TASKBOT_DEFAULT_NOTIFIER")
                .map(NotifierId::from)
                .unwrap_or(defaults.default_notifier),
            watch_urls: std::env::var("TASKBOT_WATCH_URLS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// One row of the schedule table.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub task: TaskKind,
    pub command: CommandKind,
    /// Six- or seven-field cron expression (seconds first).
    pub time_spec: String,
    #[serde(default = "default_runnable")]
    pub runnable: bool,
    pub notifier: NotifierId,
}

fn default_runnable() -> bool {
    true
}

/// The declarative schedule table read by the cron scheduler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub entries: Vec<ScheduleEntry>,
}

impl ScheduleConfig {
    /// Load from a JSON file. A missing file yields an empty schedule.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No schedule file, starting with empty schedule");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn runnable_entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().filter(|e| e.runnable)
    }
}
