//! Task registry: the authoritative map of in-flight tasks.
//!
//! Owned by the scheduling loop and only touched from the engine thread.
//! Outbound frames go through a bounded queue; sends wait when it is full.
//! Every frame carries the session its task was submitted on, so output of
//! a task abandoned with its session is never delivered to a later one.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::buffer::TextBuffer;
use super::model::{Task, TaskId};
use super::state::TaskState;
use crate::engine::{Engine, SamplingParams, SubmitRequest};
use crate::error::TaskError;
use crate::protocol::{ResultFrame, SessionFrame, SessionId};

#[derive(Debug)]
struct TaskEntry {
    state: TaskState,
    buffer: TextBuffer,
    session: SessionId,
    submitted_at: Instant,
}

impl TaskEntry {
    fn transition_to(&mut self, id: TaskId, target: TaskState) {
        if self.state.can_transition_to(target) {
            self.state = target;
        } else {
            debug!(task_id = id, from = %self.state, to = %target, "Ignoring task transition");
        }
    }
}

pub struct TaskRegistry {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Abandoned tasks the engine could not cancel, with their session. A
    /// late finish for one of them is routed to that dead session.
    abandoned: HashMap<TaskId, SessionId>,
    session: SessionId,
    outbound: mpsc::Sender<SessionFrame>,
}

impl TaskRegistry {
    pub fn new(outbound: mpsc::Sender<SessionFrame>) -> Self {
        Self {
            tasks: HashMap::new(),
            abandoned: HashMap::new(),
            session: 0,
            outbound,
        }
    }

    /// Session new tasks are submitted on.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Move on to `session`, abandoning every task of earlier sessions
    /// without notifying anyone. A no-op unless `session` is newer.
    /// Returns the number of abandoned tasks.
    pub fn begin_session(&mut self, engine: &mut dyn Engine, session: SessionId) -> usize {
        if session <= self.session {
            return 0;
        }
        self.session = session;

        let count = self.tasks.len();
        for (id, entry) in self.tasks.drain() {
            if !engine.cancel(id) {
                self.abandoned.insert(id, entry.session);
            }
        }
        if count > 0 {
            info!(count, session, "Abandoned tasks of previous session");
        }
        count
    }

    /// Render the prompt, hand the task to the engine and register it.
    ///
    /// An engine rejection still emits a completion frame so the coordinator
    /// does not wait on a task that will never run.
    pub async fn submit(&mut self, engine: &mut dyn Engine, task: Task) -> Result<(), TaskError> {
        if task.turns.is_empty() {
            return Err(TaskError::EmptyConversation { id: task.id });
        }
        if self.tasks.contains_key(&task.id) {
            return Err(TaskError::AlreadyActive { id: task.id });
        }

        let prompt = task.prompt();
        let request = SubmitRequest {
            id: task.id,
            system: &task.system,
            prompt: &prompt,
            max_new_tokens: task.max_new_tokens,
            sampling: SamplingParams::FIXED,
        };
        if let Err(e) = engine.submit(request) {
            self.send(self.session, ResultFrame::completion(task.id)).await;
            return Err(e.into());
        }

        info!(
            task_id = task.id,
            session = self.session,
            turns = task.turns.len(),
            max_new_tokens = task.max_new_tokens,
            temperature = task.temperature,
            "Task submitted"
        );
        self.abandoned.remove(&task.id);
        self.tasks.insert(
            task.id,
            TaskEntry {
                state: TaskState::Created,
                buffer: TextBuffer::new(task.id),
                session: self.session,
                submitted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Accumulate an output delta. Unknown ids are ignored; a delta racing a
    /// finish or stop is expected.
    pub async fn on_bytes(&mut self, id: TaskId, bytes: &[u8]) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            warn!(task_id = id, "Output for unknown task");
            return;
        };
        if entry.state == TaskState::Created {
            entry.transition_to(id, TaskState::Streaming);
        }
        let session = entry.session;
        if let Some(frame) = entry.buffer.append(bytes) {
            self.send(session, frame).await;
        }
    }

    /// The engine reported completion.
    pub async fn finish(&mut self, id: TaskId) -> Option<TaskState> {
        self.close(id, TaskState::Finished).await
    }

    /// The coordinator asked to stop. The engine is asked to cancel, then
    /// the task is closed exactly like a finish.
    pub async fn stop(&mut self, engine: &mut dyn Engine, id: TaskId) -> Option<TaskState> {
        if engine.cancel(id) {
            debug!(task_id = id, "Engine cancelled generation");
        }
        self.close(id, TaskState::Stopped).await
    }

    /// Flush pending output, emit the completion frame and drop the entry.
    /// The completion frame is sent even when the id is unknown. Returns the
    /// final state of the removed task.
    async fn close(&mut self, id: TaskId, target: TaskState) -> Option<TaskState> {
        let (session, closed) = match self.tasks.remove(&id) {
            Some(mut entry) => {
                if let Some(frame) = entry.buffer.flush() {
                    self.send(entry.session, frame).await;
                }
                entry.transition_to(id, target);
                info!(
                    task_id = id,
                    state = %entry.state,
                    elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
                    "Task closed"
                );
                (entry.session, Some(entry.state))
            }
            None => {
                debug!(task_id = id, to = %target, "Closing unknown task");
                let session = self.abandoned.remove(&id).unwrap_or(self.session);
                (session, None)
            }
        };
        self.send(session, ResultFrame::completion(id)).await;
        closed
    }

    async fn send(&self, session: SessionId, frame: ResultFrame) {
        if self
            .outbound
            .send(SessionFrame { session, frame })
            .await
            .is_err()
        {
            warn!("Outbound queue closed, dropping result frame");
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
