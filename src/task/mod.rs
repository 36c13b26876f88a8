//! Task bookkeeping: model, lifecycle, output buffering and the registry.
//!
//! - `model`: chat turns, tasks and prompt rendering
//! - `state`: task state machine (Created → Streaming → Finished/Stopped)
//! - `buffer`: per-task output buffer that never splits a UTF-8 sequence
//! - `registry`: authoritative map of in-flight tasks

pub mod buffer;
pub mod model;
pub mod registry;
pub mod state;

pub use buffer::TextBuffer;
pub use model::{ChatTurn, Role, Task, TaskId, render_prompt};
pub use registry::TaskRegistry;
pub use state::TaskState;
