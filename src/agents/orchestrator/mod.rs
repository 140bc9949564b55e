//! Orchestrator - runs the research roles over one task.
//!
//! # Responsibilities
//! 1. Pick the participating roles (all four, or `classify` when routing is on)
//! 2. Give each role a bounded context window and call the model gateway
//! 3. Resolve tool calls on the role's allow-list
//! 4. Report every turn to a `TurnObserver` as it starts and finishes
//! 5. Stop on the Critic's termination marker or at the turn limit
//! 6. Account tokens and cost for the whole run
//!
//! # Turn Flow
//! ```text
//! turn_started ─▶ context window ─▶ gateway ─┬─▶ tool calls ─▶ gateway (≤ N rounds)
//!                                            └─▶ reply ─▶ turn_finished ─▶ marker?
//! ```

mod transcript;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::agents::{classify, AgentContext, Role, RoleSet};
use crate::error::{ResearchError, ResearchResult};
use crate::llm::{ChatMessage, ChatOptions, ToolCall};
use crate::task::{TaskMetrics, ToolInvocation};

pub use transcript::{Transcript, Turn};

/// Team configuration for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub model: String,
    pub temperature: f64,
    /// Total turns across all roles, not full cycles.
    pub max_turns: u32,
    pub max_context_tokens: u64,
    pub enable_tools: bool,
    pub dynamic_routing: bool,
    /// Tool-call rounds allowed inside one turn before a forced plain answer.
    pub max_tool_rounds: u32,
    /// Extra attempts after an empty reply.
    pub malformed_retry_budget: u32,
    pub termination_marker: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            temperature: 0.7,
            max_turns: 12,
            max_context_tokens: 4000,
            enable_tools: true,
            dynamic_routing: false,
            max_tool_rounds: 4,
            malformed_retry_budget: 2,
            termination_marker: "TERMINATE".to_string(),
        }
    }
}

/// Receives turn boundaries as they happen.
///
/// An `Err` from either hook aborts the run.
#[async_trait]
pub trait TurnObserver: Send + Sync {
    async fn turn_started(&self, turn: u32, role: Role) -> ResearchResult<()>;

    async fn turn_finished(&self, turn: &Turn) -> ResearchResult<()>;
}

/// Observer that ignores everything.
pub struct NoopObserver;

#[async_trait]
impl TurnObserver for NoopObserver {
    async fn turn_started(&self, _turn: u32, _role: Role) -> ResearchResult<()> {
        Ok(())
    }

    async fn turn_finished(&self, _turn: &Turn) -> ResearchResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The Critic emitted the termination marker.
    Terminated,
    /// The turn limit was reached.
    TurnLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub roles: RoleSet,
    pub transcript: Transcript,
    pub stop: StopReason,
    pub stats: RunStats,
    pub duration_secs: f64,
}

impl RunOutcome {
    pub fn metrics(&self) -> TaskMetrics {
        TaskMetrics {
            input_tokens: self.stats.input_tokens,
            output_tokens: self.stats.output_tokens,
            total_tokens: self.stats.total_tokens,
            estimated_cost: self.stats.estimated_cost,
            duration_secs: self.duration_secs,
            total_messages: self.transcript.len() as u32,
            model: self.stats.model.clone(),
            by_role: self.transcript.tokens_by_role(),
        }
    }
}

pub struct Orchestrator {
    ctx: Arc<AgentContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Run the team on `task_text` until termination or the turn limit.
    pub async fn run(
        &self,
        task_text: &str,
        config: &RunConfig,
        observer: &dyn TurnObserver,
    ) -> ResearchResult<RunOutcome> {
        let started = Instant::now();
        let roles = if config.dynamic_routing {
            classify(task_text)
        } else {
            RoleSet::all()
        };
        tracing::info!(
            roles = ?roles.as_slice(),
            max_turns = config.max_turns,
            model = %config.model,
            "Research run started"
        );

        let mut transcript = Transcript::new();
        let mut stop = StopReason::TurnLimit;

        for turn in 0..config.max_turns {
            let Some(role) = roles.speaker(turn) else {
                break;
            };
            observer.turn_started(turn, role).await?;

            let finished = self.run_turn(turn, role, task_text, &transcript, config).await?;
            tracing::info!(
                turn,
                role = %role,
                input_tokens = finished.input_tokens,
                output_tokens = finished.output_tokens,
                tool_calls = finished.tool_calls.len(),
                "Turn finished"
            );
            observer.turn_finished(&finished).await?;

            let terminated =
                role == Role::Critic && finished.content.contains(&config.termination_marker);
            transcript.push(finished);
            if terminated {
                stop = StopReason::Terminated;
                break;
            }
        }

        let input_tokens: u64 = transcript.turns().iter().map(|t| t.input_tokens).sum();
        let output_tokens: u64 = transcript.turns().iter().map(|t| t.output_tokens).sum();
        let stats = RunStats {
            model: config.model.clone(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost: self
                .ctx
                .pricing
                .estimate_cost(&config.model, input_tokens, output_tokens),
        };
        tracing::info!(
            turns = transcript.len(),
            stop = ?stop,
            total_tokens = stats.total_tokens,
            cost = stats.estimated_cost,
            "Research run finished"
        );

        Ok(RunOutcome {
            roles,
            transcript,
            stop,
            stats,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    async fn run_turn(
        &self,
        index: u32,
        role: Role,
        task_text: &str,
        transcript: &Transcript,
        config: &RunConfig,
    ) -> ResearchResult<Turn> {
        let mut messages =
            transcript.context_window(role, task_text, config.max_context_tokens, &self.ctx.tokens);
        let tool_defs = if config.enable_tools {
            self.ctx.tools.schemas_for(role.tool_names())
        } else {
            Vec::new()
        };
        let options = ChatOptions {
            temperature: Some(config.temperature),
            max_tokens: None,
        };

        let mut invocations = Vec::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut tool_rounds = 0u32;
        let mut empty_replies = 0u32;

        loop {
            let offer_tools = !tool_defs.is_empty() && tool_rounds < config.max_tool_rounds;
            let tools = offer_tools.then_some(tool_defs.as_slice());

            let response = self
                .ctx
                .llm
                .chat_completion(&config.model, &messages, tools, &options)
                .await?;

            let reply_text = response.content.clone().unwrap_or_default();
            match &response.usage {
                Some(usage) => {
                    input_tokens += usage.prompt_tokens;
                    output_tokens += usage.completion_tokens;
                }
                None => {
                    input_tokens += self.ctx.tokens.count_all(messages.iter().map(|m| m.text()));
                    output_tokens += self.ctx.tokens.count(&reply_text);
                }
            }

            if offer_tools && response.has_tool_calls() {
                tool_rounds += 1;
                let calls = response.tool_calls.unwrap_or_default();
                messages.push(ChatMessage::assistant_tool_calls(calls.clone()));
                for call in calls {
                    let invocation = self.invoke_tool(role, &call).await;
                    messages.push(ChatMessage::tool_result(&call.id, &invocation.output));
                    invocations.push(invocation);
                }
                continue;
            }

            let content = reply_text.trim();
            if content.is_empty() {
                if empty_replies >= config.malformed_retry_budget {
                    return Err(ResearchError::MalformedOutput {
                        role: role.name().to_string(),
                        attempts: empty_replies + 1,
                    });
                }
                empty_replies += 1;
                tracing::warn!(
                    turn = index,
                    role = %role,
                    attempt = empty_replies,
                    "Empty reply; asking again"
                );
                continue;
            }

            return Ok(Turn {
                index,
                role,
                content: content.to_string(),
                input_tokens,
                output_tokens,
                tool_calls: invocations,
                created_at: chrono::Utc::now(),
            });
        }
    }

    /// Run one requested tool. Failures become the tool's output.
    async fn invoke_tool(&self, role: Role, call: &ToolCall) -> ToolInvocation {
        let name = call.function.name.as_str();
        let arguments: Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));

        let output = if !role.tool_names().contains(&name) {
            json!({
                "status": "error",
                "message": format!("Tool '{name}' is not available to {role}"),
            })
            .to_string()
        } else if !arguments.is_object() {
            json!({ "status": "error", "message": "Tool arguments must be a JSON object" })
                .to_string()
        } else {
            match self.ctx.tools.execute(name, arguments.clone()).await {
                Ok(output) => output,
                Err(e) => json!({ "status": "error", "message": e.to_string() }).to_string(),
            }
        };
        tracing::debug!(role = %role, tool = %name, "Tool call resolved");

        ToolInvocation {
            tool: name.to_string(),
            arguments,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmErrorKind, ScriptedClient, ScriptedReply};
    use std::sync::Mutex;

    fn orchestrator(client: ScriptedClient) -> (Orchestrator, Arc<ScriptedClient>) {
        let client = Arc::new(client);
        let ctx = AgentContext::new(client.clone());
        (Orchestrator::new(Arc::new(ctx)), client)
    }

    fn config() -> RunConfig {
        RunConfig {
            model: "gpt-4o-mini".into(),
            ..RunConfig::default()
        }
    }

    /// Records hook calls in order.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TurnObserver for Recorder {
        async fn turn_started(&self, turn: u32, role: Role) -> ResearchResult<()> {
            self.events.lock().unwrap().push(format!("start {turn} {role}"));
            Ok(())
        }

        async fn turn_finished(&self, turn: &Turn) -> ResearchResult<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish {} {}", turn.index, turn.role));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_critic_marker_stops_run() {
        let (orch, client) = orchestrator(ScriptedClient::demo());
        let recorder = Recorder::default();
        let outcome = orch.run("Explain X", &config(), &recorder).await.unwrap();

        assert_eq!(outcome.stop, StopReason::Terminated);
        assert_eq!(
            outcome.transcript.speakers(),
            vec![Role::Researcher, Role::Analyst, Role::Writer, Role::Critic]
        );
        assert_eq!(client.call_count(), 4);
        assert_eq!(
            recorder.events.lock().unwrap().clone(),
            vec![
                "start 0 Researcher",
                "finish 0 Researcher",
                "start 1 Analyst",
                "finish 1 Analyst",
                "start 2 Writer",
                "finish 2 Writer",
                "start 3 Critic",
                "finish 3 Critic",
            ]
        );
        let metrics = outcome.metrics();
        assert!(metrics.total_tokens > 0);
        assert_eq!(metrics.total_tokens, metrics.input_tokens + metrics.output_tokens);
        assert_eq!(metrics.total_messages, 4);
        assert!(metrics.estimated_cost > 0.0);
    }

    #[tokio::test]
    async fn test_turn_limit_counts_total_turns() {
        // No reply ever contains the marker.
        let (orch, client) = orchestrator(ScriptedClient::new(vec![]));
        let cfg = RunConfig {
            max_turns: 6,
            ..config()
        };
        let outcome = orch.run("Explain X", &cfg, &NoopObserver).await.unwrap();
        assert_eq!(outcome.stop, StopReason::TurnLimit);
        assert_eq!(outcome.transcript.len(), 6);
        assert_eq!(client.call_count(), 6);
        let orders: Vec<u32> = outcome.transcript.turns().iter().map(|t| t.index).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(outcome.transcript.speakers()[4], Role::Researcher);
    }

    #[tokio::test]
    async fn test_marker_from_non_critic_is_ignored() {
        let (orch, _) = orchestrator(ScriptedClient::from_fn(|call| match call.agent.as_deref() {
            Some("Critic") => ScriptedReply::text("Needs work."),
            _ => ScriptedReply::text("TERMINATE"),
        }));
        let cfg = RunConfig {
            max_turns: 5,
            ..config()
        };
        let outcome = orch.run("Explain X", &cfg, &NoopObserver).await.unwrap();
        assert_eq!(outcome.stop, StopReason::TurnLimit);
        assert_eq!(outcome.transcript.len(), 5);
    }

    #[tokio::test]
    async fn test_dynamic_routing_skips_roles() {
        let (orch, client) = orchestrator(ScriptedClient::demo());
        let cfg = RunConfig {
            dynamic_routing: true,
            ..config()
        };
        let outcome = orch.run("what is 2 + 2", &cfg, &NoopObserver).await.unwrap();
        assert_eq!(
            outcome.transcript.speakers(),
            vec![Role::Researcher, Role::Critic]
        );
        assert_eq!(client.speakers(), vec!["Researcher", "Critic"]);
    }

    #[tokio::test]
    async fn test_tool_calls_are_resolved_and_recorded() {
        let (orch, client) = orchestrator(ScriptedClient::new(vec![
            ScriptedReply::Tool {
                name: "calculator".into(),
                arguments: json!({"expression": "6 * 7"}),
            },
            ScriptedReply::text("The answer is 42."),
        ]));
        let cfg = RunConfig {
            max_turns: 1,
            ..config()
        };
        let outcome = orch.run("what is 6 * 7", &cfg, &NoopObserver).await.unwrap();
        let turn = &outcome.transcript.turns()[0];
        assert_eq!(turn.content, "The answer is 42.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].tool, "calculator");
        assert!(turn.tool_calls[0].output.contains("42"));

        let calls = client.calls();
        assert_eq!(calls[0].tools, vec!["web_search", "calculator"]);
        // The tool result is fed back before the second call.
        assert!(calls[1].messages.iter().any(|m| m.tool_call_id.is_some()));
    }

    #[tokio::test]
    async fn test_tool_rounds_are_capped() {
        let (orch, client) = orchestrator(ScriptedClient::from_fn(|call| {
            if call.tools.is_empty() {
                ScriptedReply::text("Done without tools.")
            } else {
                ScriptedReply::Tool {
                    name: "calculator".into(),
                    arguments: json!({"expression": "1 + 1"}),
                }
            }
        }));
        let cfg = RunConfig {
            max_turns: 1,
            max_tool_rounds: 2,
            ..config()
        };
        let outcome = orch.run("Explain X", &cfg, &NoopObserver).await.unwrap();
        assert_eq!(outcome.transcript.turns()[0].tool_calls.len(), 2);
        assert_eq!(outcome.transcript.turns()[0].content, "Done without tools.");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_disallowed_tool_is_refused() {
        let (orch, _) = orchestrator(ScriptedClient::demo());
        let call = ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: crate::llm::FunctionCall {
                name: "web_search".into(),
                arguments: r#"{"query":"x"}"#.into(),
            },
        };
        let invocation = orch.invoke_tool(Role::Analyst, &call).await;
        assert_eq!(invocation.tool, "web_search");
        assert!(invocation.output.contains("not available to Analyst"));

        let garbled = ToolCall {
            function: crate::llm::FunctionCall {
                name: "calculator".into(),
                arguments: "not json".into(),
            },
            ..call
        };
        let invocation = orch.invoke_tool(Role::Analyst, &garbled).await;
        assert!(invocation.output.contains("must be a JSON object"));
    }

    #[tokio::test]
    async fn test_empty_replies_exhaust_budget() {
        let (orch, client) = orchestrator(ScriptedClient::from_fn(|_| ScriptedReply::Empty));
        let err = orch
            .run("Explain X", &config(), &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResearchError::MalformedOutput { ref role, attempts: 3 } if role == "Researcher"
        ));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_reply_then_recovery() {
        let (orch, _) = orchestrator(ScriptedClient::new(vec![
            ScriptedReply::Empty,
            ScriptedReply::text("Recovered."),
        ]));
        let cfg = RunConfig {
            max_turns: 1,
            ..config()
        };
        let outcome = orch.run("Explain X", &cfg, &NoopObserver).await.unwrap();
        assert_eq!(outcome.transcript.turns()[0].content, "Recovered.");
    }

    #[tokio::test]
    async fn test_gateway_error_aborts_run() {
        let (orch, _) = orchestrator(ScriptedClient::failing(LlmErrorKind::Auth));
        let err = orch
            .run("Explain X", &config(), &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Upstream { transient: false, .. }));
    }

    #[tokio::test]
    async fn test_observer_error_aborts_run() {
        struct Broken;

        #[async_trait]
        impl TurnObserver for Broken {
            async fn turn_started(&self, _turn: u32, _role: Role) -> ResearchResult<()> {
                Ok(())
            }

            async fn turn_finished(&self, _turn: &Turn) -> ResearchResult<()> {
                Err(ResearchError::Storage("disk full".into()))
            }
        }

        let (orch, client) = orchestrator(ScriptedClient::demo());
        let err = orch.run("Explain X", &config(), &Broken).await.unwrap_err();
        assert!(matches!(err, ResearchError::Storage(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_turn_limit() {
        let (orch, client) = orchestrator(ScriptedClient::demo());
        let cfg = RunConfig {
            max_turns: 0,
            ..config()
        };
        let outcome = orch.run("Explain X", &cfg, &NoopObserver).await.unwrap();
        assert!(outcome.transcript.is_empty());
        assert_eq!(client.call_count(), 0);
    }
}
