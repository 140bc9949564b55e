//! Conversation accumulator and context-window construction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::agents::Role;
use crate::budget::TokenCounter;
use crate::llm::ChatMessage;
use crate::task::{AgentMessage, ToolInvocation};

/// One completed agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// 0-based position in the conversation.
    pub index: u32,
    pub role: Role,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn to_message(&self) -> AgentMessage {
        AgentMessage {
            agent: self.role.name().to_string(),
            content: self.content.clone(),
            order: self.index,
            token_count: Some(self.output_tokens),
            tool_calls: self.tool_calls.clone(),
            created_at: self.created_at,
        }
    }

    fn rendered(&self) -> String {
        format!("[{}]: {}", self.role.name(), self.content)
    }
}

/// Turns produced so far in one run, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Index the next turn will get.
    pub fn next_index(&self) -> u32 {
        self.turns.len() as u32
    }

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.turns.iter().map(Turn::to_message).collect()
    }

    pub fn speakers(&self) -> Vec<Role> {
        self.turns.iter().map(|t| t.role).collect()
    }

    /// Tokens spent per role name, input and output combined.
    pub fn tokens_by_role(&self) -> BTreeMap<String, u64> {
        let mut by_role = BTreeMap::new();
        for turn in &self.turns {
            *by_role.entry(turn.role.name().to_string()).or_insert(0) +=
                turn.input_tokens + turn.output_tokens;
        }
        by_role
    }

    /// Build the prompt for `role`.
    ///
    /// Layout: the role's system prompt, the pinned task statement, then
    /// prior turns as `[Role]: content` user messages. While the estimate is
    /// over `max_tokens`, the oldest prior turn is dropped; the newest one is
    /// always kept.
    pub fn context_window(
        &self,
        role: Role,
        task_text: &str,
        max_tokens: u64,
        counter: &TokenCounter,
    ) -> Vec<ChatMessage> {
        let system = ChatMessage::system(role.system_prompt()).with_name(role.name());
        let task = ChatMessage::user(format!("Research task:\n{task_text}"));

        let rendered: Vec<String> = self.turns.iter().map(Turn::rendered).collect();
        let costs: Vec<u64> = rendered.iter().map(|r| counter.count(r)).collect();

        let mut total = counter.count(system.text())
            + counter.count(task.text())
            + costs.iter().sum::<u64>();
        let mut start = 0;
        while total > max_tokens && start + 1 < rendered.len() {
            total -= costs[start];
            start += 1;
        }
        if start > 0 {
            tracing::debug!(
                role = %role,
                dropped = start,
                kept = rendered.len() - start,
                tokens = total,
                "Trimmed conversation history"
            );
        }

        let mut messages = Vec::with_capacity(2 + rendered.len() - start);
        messages.push(system);
        messages.push(task);
        messages.extend(rendered.into_iter().skip(start).map(ChatMessage::user));
        messages
    }
}
