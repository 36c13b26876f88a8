//! Task state machine.

/// Lifecycle state of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Accepted by the engine, no output seen yet.
    Created,
    /// At least one output delta has arrived.
    Streaming,
    /// The engine reported completion.
    Finished,
    /// The coordinator asked for the task to stop.
    Stopped,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Created, Streaming) | (Created, Finished) | (Created, Stopped) |
            (Streaming, Finished) | (Streaming, Stopped)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Streaming => "streaming",
            Self::Finished => "finished",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
