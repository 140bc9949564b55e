//! Deterministic, offline model gateway.
//!
//! Backs the `MODEL_TYPE=scripted` demo mode and every test that needs a
//! model without a network. Replies come either from a queue or from a
//! closure that sees which agent is speaking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    ChatMessage, ChatOptions, ChatResponse, FunctionCall, LlmClient, LlmError, LlmErrorKind,
    RetryConfig, Role, TokenUsage, ToolCall, ToolDefinition,
};

/// One canned answer.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Ask for a tool call instead of answering.
    Tool { name: String, arguments: Value },
    /// An empty assistant message.
    Empty,
    Fail(LlmErrorKind),
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }
}

/// What the scripted client was asked.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    /// 0-based call counter across the client's lifetime.
    pub index: usize,
    /// Name attached to the system prompt, i.e. the speaking agent.
    pub agent: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
}

type ReplyFn = dyn Fn(&ScriptedCall) -> ScriptedReply + Send + Sync;

enum Source {
    Queue(Mutex<VecDeque<ScriptedReply>>),
    Func(Box<ReplyFn>),
}

pub struct ScriptedClient {
    source: Source,
    calls: AtomicUsize,
    history: Mutex<Vec<ScriptedCall>>,
    latency: Option<Duration>,
    /// Applied the way the HTTP client applies it; every attempt is a call.
    retry: Option<RetryConfig>,
}

impl ScriptedClient {
    /// Replies are consumed in order; once exhausted every call gets a
    /// generic answer naming the agent.
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self::with_source(Source::Queue(Mutex::new(replies.into())))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ScriptedCall) -> ScriptedReply + Send + Sync + 'static,
    {
        Self::with_source(Source::Func(Box::new(f)))
    }

    /// Every call fails with `kind`.
    pub fn failing(kind: LlmErrorKind) -> Self {
        Self::from_fn(move |_| ScriptedReply::Fail(kind))
    }

    /// Role-aware canned answers; the Critic approves on its first turn.
    pub fn demo() -> Self {
        Self::from_fn(|call| {
            let agent = call.agent.as_deref().unwrap_or("Assistant");
            let topic = call
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.text().lines().last().unwrap_or("").trim().to_string())
                .unwrap_or_default();
            let body = match agent {
                "Researcher" => format!(
                    "**Understanding**: {topic}\n\n**Findings**:\n- Key background collected.\n- Open questions flagged for review."
                ),
                "Analyst" => "**Key Patterns Identified**:\n- The findings are consistent.\n\n**Limitations**:\n- Offline demo data.".to_string(),
                "Writer" => format!(
                    "# Report\n\n## Executive Summary\nA short synthesis of the research on: {topic}\n\n## Conclusions\nSee findings above."
                ),
                "Critic" => "**Quality Review**: APPROVED\n\nThis work meets all quality standards.\n\nTERMINATE".to_string(),
                other => format!("{other} has nothing to add."),
            };
            ScriptedReply::Text(body)
        })
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            calls: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
            latency: None,
            retry: None,
        }
    }

    /// Sleep this long before every answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Retry transient scripted failures with `retry`.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Agents that spoke, in call order.
    pub fn speakers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.agent.unwrap_or_default())
            .collect()
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, call: &ScriptedCall) -> ScriptedReply {
        match &self.source {
            Source::Queue(queue) => queue
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or_else(|| {
                    ScriptedReply::Text(format!(
                        "{} reply #{}",
                        call.agent.as_deref().unwrap_or("assistant"),
                        call.index
                    ))
                }),
            Source::Func(f) => f(call),
        }
    }
}

fn estimate(text_len: usize) -> u64 {
    (text_len as u64).div_ceil(4).max(1)
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        match &self.retry {
            Some(retry) => retry.run(|| self.answer(model, messages, tools)).await,
            None => self.answer(model, messages, tools).await,
        }
    }

    fn provider(&self) -> &str {
        "scripted"
    }
}

impl ScriptedClient {
    async fn answer(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChatResponse, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let call = ScriptedCall {
            index,
            agent: messages
                .iter()
                .find(|m| m.role == Role::System)
                .and_then(|m| m.name.clone()),
            messages: messages.to_vec(),
            tools: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.function.name.clone())
                .collect(),
        };
        let reply = self.next_reply(&call);
        if let Ok(mut history) = self.history.lock() {
            history.push(call);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let prompt_len: usize = messages.iter().map(|m| m.text().len()).sum();
        let mut response = ChatResponse {
            model: Some(model.to_string()),
            ..ChatResponse::default()
        };
        let completion_len = match reply {
            ScriptedReply::Text(text) => {
                let len = text.len();
                response.content = Some(text);
                response.finish_reason = Some("stop".into());
                len
            }
            ScriptedReply::Tool { name, arguments } => {
                response.tool_calls = Some(vec![ToolCall {
                    id: format!("call_{index}"),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name,
                        arguments: arguments.to_string(),
                    },
                }]);
                response.finish_reason = Some("tool_calls".into());
                16
            }
            ScriptedReply::Empty => {
                response.content = Some(String::new());
                response.finish_reason = Some("stop".into());
                0
            }
            ScriptedReply::Fail(kind) => {
                return Err(LlmError::new(kind, format!("scripted failure on call {index}")));
            }
        };
        response.usage = Some(TokenUsage::new(
            estimate(prompt_len),
            estimate(completion_len),
        ));
        Ok(response)
    }
}
