//! Execution engine contract.
//!
//! The engine is not thread-safe. It is built by an [`EngineFactory`] on the
//! dedicated engine thread and never leaves it; every call comes from the
//! scheduling loop. Progress is reported as the return value of
//! [`Engine::drive_once`] instead of out-of-band callbacks.

pub mod echo;

pub use echo::EchoEngine;

use crate::error::EngineError;
use crate::task::TaskId;

/// Sampling parameters handed to the engine, in the engine's integer
/// percent representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingParams {
    pub temperature: i32,
    pub top_p: i32,
}

impl SamplingParams {
    /// Greedy decoding. The node does not forward per-task temperatures.
    pub const FIXED: Self = Self {
        temperature: 0,
        top_p: 100,
    };
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::FIXED
    }
}

/// Everything the engine needs to start a generation.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub id: TaskId,
    pub system: &'a str,
    pub prompt: &'a str,
    pub max_new_tokens: i32,
    pub sampling: SamplingParams,
}

/// Progress reported by one engine tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Raw output bytes. Not guaranteed to end on a UTF-8 boundary.
    Delta { id: TaskId, bytes: Vec<u8> },
    /// The generation for this task is over.
    Finished { id: TaskId },
}

/// The execution engine as seen by the scheduling loop.
pub trait Engine {
    /// Start a generation. An error means the task was rejected and will
    /// produce no events.
    fn submit(&mut self, request: SubmitRequest<'_>) -> Result<(), EngineError>;

    /// Advance all live generations by one unit of work. Must be called
    /// periodically even when nothing is running.
    fn drive_once(&mut self) -> Vec<EngineEvent>;

    /// Best-effort abort of a generation. Returns whether the task was live.
    fn cancel(&mut self, id: TaskId) -> bool {
        let _ = id;
        false
    }
}

/// One-shot constructor run on the engine thread. Failure is fatal to the
/// node.
pub type EngineFactory = Box<dyn FnOnce() -> Result<Box<dyn Engine>, EngineError> + Send>;
