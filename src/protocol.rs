//! Wire protocol between the node and the coordinator.
//!
//! Inbound: JSON task commands in text frames.
//! Outbound: binary frames, a 4-byte big-endian task id followed by result
//! bytes. An empty payload marks the task as complete.

use serde::Deserialize;

use crate::error::TaskError;
use crate::task::{ChatTurn, Task, TaskId};

/// Size of the task id prefix on outbound frames.
pub const TASK_ID_LEN: usize = 4;

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCommand {
    /// New work.
    Submit(Task),
    /// Terminate the stream for this task.
    Stop(TaskId),
}

impl TaskCommand {
    /// Decode a command from the JSON carried by a text frame.
    pub fn decode(text: &str) -> Result<Self, TaskError> {
        let wire: WireCommand = serde_json::from_str(text)?;
        Ok(wire.into())
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submit(task) => task.id,
            Self::Stop(id) => *id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCommand {
    id: TaskId,
    #[serde(default)]
    max_new_tokens: i32,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    messages: Option<Vec<ChatTurn>>,
    #[serde(default)]
    temperature: f64,
    #[serde(default)]
    stop: bool,
}

impl From<WireCommand> for TaskCommand {
    fn from(wire: WireCommand) -> Self {
        if wire.stop {
            return Self::Stop(wire.id);
        }
        Self::Submit(Task {
            id: wire.id,
            system: wire.system.unwrap_or_default(),
            turns: wire.messages.unwrap_or_default(),
            max_new_tokens: wire.max_new_tokens,
            temperature: wire.temperature,
        })
    }
}

/// An outbound result message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    pub task_id: TaskId,
    pub payload: Vec<u8>,
}

impl ResultFrame {
    /// Incremental output for a task.
    pub fn chunk(task_id: TaskId, payload: Vec<u8>) -> Self {
        Self { task_id, payload }
    }

    /// Completion marker for a task.
    pub fn completion(task_id: TaskId) -> Self {
        Self {
            task_id,
            payload: Vec::new(),
        }
    }

    pub fn is_completion(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TASK_ID_LEN + self.payload.len());
        bytes.extend_from_slice(&self.task_id.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a binary frame. `None` if it is too short to carry a task id.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (id, payload) = bytes.split_first_chunk::<TASK_ID_LEN>()?;
        Some(Self {
            task_id: TaskId::from_be_bytes(*id),
            payload: payload.to_vec(),
        })
    }
}

/// Counts coordinator sessions. The connection manager advances it every
/// time a session ends.
pub type SessionId = u64;

/// An inbound command tagged with the session it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCommand {
    pub session: SessionId,
    pub command: TaskCommand,
}

/// An outbound frame tagged with the session its task was submitted on.
/// Writers only send frames of the session they serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFrame {
    pub session: SessionId,
    pub frame: ResultFrame,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Role;

    #[test]
    fn decodes_submit() {
        let cmd = TaskCommand::decode(
            r#"{"id":1,"max_new_tokens":128,"system":"Be brief.",
                "messages":[{"role":"user","content":"Hi"}],"temperature":0.7,"stop":false}"#,
        )
        .unwrap();
        let TaskCommand::Submit(task) = cmd else {
            panic!("expected submit, got {cmd:?}");
        };
        assert_eq!(task.id, 1);
        assert_eq!(task.max_new_tokens, 128);
        assert_eq!(task.system, "Be brief.");
        assert_eq!(task.turns, vec![ChatTurn::user("Hi")]);
        assert!((task.temperature - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn stop_ignores_other_fields() {
        let cmd = TaskCommand::decode(
            r#"{"id":9,"stop":true,"messages":[{"role":"user","content":"ignored"}]}"#,
        )
        .unwrap();
        assert_eq!(cmd, TaskCommand::Stop(9));
        assert_eq!(cmd.task_id(), 9);
    }

    #[test]
    fn missing_and_null_fields_default() {
        let cmd = TaskCommand::decode(r#"{"id":2,"messages":null,"system":null}"#).unwrap();
        let TaskCommand::Submit(task) = cmd else {
            panic!("expected submit");
        };
        assert!(task.turns.is_empty());
        assert_eq!(task.system, "");
        assert_eq!(task.max_new_tokens, 0);
    }

    #[test]
    fn roles_are_normalized_at_decode() {
        let cmd = TaskCommand::decode(
            r#"{"id":3,"messages":[{"role":"ASSISTANT","content":"a"},{"role":"system","content":"b"}]}"#,
        )
        .unwrap();
        let TaskCommand::Submit(task) = cmd else {
            panic!("expected submit");
        };
        assert_eq!(task.turns[0].role, Role::Assistant);
        assert_eq!(task.turns[1].role, Role::User);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            TaskCommand::decode("{not json"),
            Err(TaskError::Decode(_))
        ));
        assert!(TaskCommand::decode(r#"{"id":-1}"#).is_err());
        assert!(TaskCommand::decode("").is_err());
    }

    #[test]
    fn encodes_big_endian_id_prefix() {
        let frame = ResultFrame::chunk(0x0102_0304, b"ok".to_vec());
        assert_eq!(frame.encode(), vec![1, 2, 3, 4, b'o', b'k']);

        let done = ResultFrame::completion(258);
        assert!(done.is_completion());
        assert_eq!(done.encode(), vec![0, 0, 1, 2]);
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert!(ResultFrame::decode(&[0, 0, 1]).is_none());
        let frame = ResultFrame::decode(&[0, 0, 0, 5, b'x']).unwrap();
        assert_eq!(frame, ResultFrame::chunk(5, b"x".to_vec()));
    }
}
