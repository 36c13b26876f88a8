//! Task model and prompt rendering.

use serde::Deserialize;

/// Coordinator-assigned task identifier.
pub type TaskId = u32;

/// Speaker of a chat turn. Anything that is not `assistant` is treated as
/// the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Marker written in front of the turn's content.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::User => "User: ",
            Self::Assistant => "Assistant: ",
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        if raw.trim().eq_ignore_ascii_case("assistant") {
            Self::Assistant
        } else {
            Self::User
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        };
        write!(f, "{s}")
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A unit of inference work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub system: String,
    pub turns: Vec<ChatTurn>,
    pub max_new_tokens: i32,
    pub temperature: f64,
}

impl Task {
    pub fn new(id: TaskId, turns: Vec<ChatTurn>) -> Self {
        Self {
            id,
            system: String::new(),
            turns,
            max_new_tokens: 0,
            temperature: 0.0,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: i32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Render the conversation into the prompt handed to the engine.
    pub fn prompt(&self) -> String {
        render_prompt(&self.turns)
    }
}

/// Concatenate turns with role markers. Assistant turns are closed with a
/// newline; a trailing `Assistant:` marker is appended unless the
/// conversation already ends with an assistant turn.
pub fn render_prompt(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push('\n');
        prompt.push_str(turn.role.marker());
        prompt.push_str(&turn.content);
        if turn.role == Role::Assistant {
            prompt.push('\n');
        }
    }
    if turns.last().is_some_and(|t| t.role != Role::Assistant) {
        prompt.push_str("\nAssistant:");
    }
    prompt
}
