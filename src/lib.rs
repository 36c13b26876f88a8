//! Inference node: streams engine output back to a remote coordinator.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod task;
