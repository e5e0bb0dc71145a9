//! Error types for taskbot.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coordinator lifecycle and enqueue errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("No notification sender configured")]
    MissingNotificationSender,

    #[error("Coordinator is not running")]
    NotRunning,

    #[error("Failed to enqueue {what}: coordinator channel closed")]
    EnqueueFailed { what: &'static str },
}

/// Task registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task {kind} is already registered")]
    DuplicateTask { kind: String },

    #[error("Task {kind} has no commands")]
    NoCommands { kind: String },

    #[error("{second} would share the result file of {first}")]
    ResultFileCollision { first: String, second: String },
}

/// Errors raised by task factories and task bodies.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Failed to create task {kind}/{command}: {reason}")]
    Construction {
        kind: String,
        command: String,
        reason: String,
    },

    #[error("Task failed: {reason}")]
    Failed { reason: String },

    #[error("Task canceled")]
    Canceled,
}

/// Retrying fetcher errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to build request: {0}")]
    Build(String),

    #[error("Request body cannot be replayed between attempts")]
    BodyNotReplayable,

    #[error("Request canceled")]
    Canceled,

    #[error("Retries exhausted after {attempts} attempts ({last})")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to encode result data: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Cron scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}' for {kind}/{command}: {reason}")]
    InvalidExpression {
        kind: String,
        command: String,
        expression: String,
        reason: String,
    },

    #[error("Scheduled run of {kind}/{command} was not accepted: {reason}")]
    RunRejected {
        kind: String,
        command: String,
        reason: String,
    },
}

/// Result type alias for taskbot.
pub type Result<T> = std::result::Result<T, Error>;
