//! Loopback engine.
//!
//! Streams each task's prompt back in fixed-size byte pieces, one piece per
//! tick and per task. Pieces ignore character boundaries, the way byte-level
//! tokenizers do, so the node's output buffering is exercised for real.
//! Used by the binary when no native engine is linked, and by the tests.

use std::path::Path;

use tracing::{debug, info};

use super::{Engine, EngineEvent, SubmitRequest};
use crate::error::EngineError;
use crate::task::TaskId;

/// Context window shared by system prompt and history, in bytes.
pub const CONTEXT_BYTES: usize = 2048;
/// Room kept free for generated output.
pub const RESERVED_BYTES: usize = 300;
/// Bytes emitted per generated "token".
pub const PIECE_BYTES: usize = 4;

#[derive(Debug)]
struct Generation {
    id: TaskId,
    output: Vec<u8>,
    cursor: usize,
    produced: i32,
    max_new_tokens: i32,
}

#[derive(Debug, Default)]
pub struct EchoEngine {
    live: Vec<Generation>,
}

impl EchoEngine {
    /// Check the model file and build the engine.
    pub fn init(model_path: &Path) -> Result<Self, EngineError> {
        let metadata = std::fs::metadata(model_path).map_err(|e| EngineError::InitFailed {
            model_path: model_path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !metadata.is_file() {
            return Err(EngineError::InitFailed {
                model_path: model_path.display().to_string(),
                reason: "not a regular file".to_string(),
            });
        }
        info!(model = %model_path.display(), "Echo engine loaded");
        Ok(Self::default())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl Engine for EchoEngine {
    fn submit(&mut self, request: SubmitRequest<'_>) -> Result<(), EngineError> {
        let budget = (CONTEXT_BYTES - RESERVED_BYTES).saturating_sub(request.system.len());
        if budget == 0 {
            debug!(task_id = request.id, "System prompt leaves no room for history");
            return Err(EngineError::Rejected {
                id: request.id,
                status: -1,
            });
        }

        // Keep the tail of the prompt that fits, starting on a char boundary.
        let prompt = request.prompt;
        let mut start = prompt.len().saturating_sub(budget);
        while !prompt.is_char_boundary(start) {
            start += 1;
        }

        self.live.retain(|g| g.id != request.id);
        self.live.push(Generation {
            id: request.id,
            output: prompt.as_bytes()[start..].to_vec(),
            cursor: 0,
            produced: 0,
            max_new_tokens: request.max_new_tokens,
        });
        Ok(())
    }

    fn drive_once(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.live.retain_mut(|g| {
            if g.produced >= g.max_new_tokens || g.cursor >= g.output.len() {
                events.push(EngineEvent::Finished { id: g.id });
                return false;
            }
            let end = (g.cursor + PIECE_BYTES).min(g.output.len());
            events.push(EngineEvent::Delta {
                id: g.id,
                bytes: g.output[g.cursor..end].to_vec(),
            });
            g.cursor = end;
            g.produced += 1;
            true
        });
        events
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.live.len();
        self.live.retain(|g| g.id != id);
        before != self.live.len()
    }
}
