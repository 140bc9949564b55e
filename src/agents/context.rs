//! Agent execution context - shared dependencies of every run.

use std::sync::Arc;

use crate::budget::{ModelPricing, TokenCounter};
use crate::llm::LlmClient;
use crate::tools::ToolRegistry;

/// Shared context passed to the orchestrator.
///
/// # Thread Safety
/// Context is wrapped in Arc for sharing across workers. Nothing in it is
/// mutated by a run.
pub struct AgentContext {
    /// LLM client for model calls
    pub llm: Arc<dyn LlmClient>,

    /// Tool registry for task execution
    pub tools: ToolRegistry,

    /// Model pricing information
    pub pricing: ModelPricing,

    /// Tokenizer for usage estimates and context sizing
    pub tokens: TokenCounter,
}

impl AgentContext {
    /// Create a new agent context with the default tools and pricing.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            tools: ToolRegistry::new(),
            pricing: ModelPricing::new(),
            tokens: TokenCounter::new(),
        }
    }

    /// Replace the tool registry.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn provider(&self) -> &str {
        self.llm.provider()
    }
}
