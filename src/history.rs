use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub image: Option<PathBuf>,
    pub ordinal: usize,
}

/// Ordered chat transcript as the UI sees it. Prompt assembly only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
    next_ordinal: usize,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>, image: Option<PathBuf>) -> usize {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.turns.push(ConversationTurn {
            role,
            text: text.into(),
            image,
            ordinal,
        });
        ordinal
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> usize {
        self.push(Role::User, text, None)
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) -> usize {
        self.push(Role::Assistant, text, None)
    }

    pub fn remove_last(&mut self) -> Option<ConversationTurn> {
        self.turns.pop()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
