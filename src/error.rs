//! Error types for the inference node.

use crate::task::TaskId;

/// Top-level error type for the node.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid coordinator address {address}: {source}")]
    InvalidUrl {
        address: String,
        #[source]
        source: url::ParseError,
    },
}

/// Coordinator connection errors. All of them end the current session and
/// lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Connection closed by coordinator")]
    Closed,

    #[error("Scheduling loop is gone")]
    SchedulerGone,
}

/// Execution engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to initialize engine with model {model_path}: {reason}")]
    InitFailed { model_path: String, reason: String },

    #[error("Engine rejected task {id} with status {status}")]
    Rejected { id: TaskId, status: i32 },

    #[error("Failed to build engine thread runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Engine thread exited")]
    ThreadExited,
}

/// Task bookkeeping errors. None of them are fatal; the offending task is
/// discarded.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} has an empty conversation")]
    EmptyConversation { id: TaskId },

    #[error("Task {id} is already active")]
    AlreadyActive { id: TaskId },

    #[error("Task rejected by engine: {0}")]
    Rejected(#[from] EngineError),

    #[error("Failed to decode task command: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type alias for the node.
pub type Result<T> = std::result::Result<T, Error>;
