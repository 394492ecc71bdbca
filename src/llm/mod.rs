//! LLM client abstraction: OpenRouter transport, wire types, and tool-call
//! normalization (spec §4.7).
//!
//! ## Example
//!
//! ```rust,ignore
//! use northstar_engine::llm::{ClientConfig, OpenRouterClient, LLMClient, CompletionRequest, ChatMessage};
//!
//! let client = OpenRouterClient::new(
//!     ClientConfig::new("your-api-key").with_default_model("anthropic/claude-3.5-sonnet"),
//! );
//!
//! let request = CompletionRequest::new().with_message(ChatMessage::user("Hello"));
//! let response = client.complete(request).await?;
//! ```

mod client;
mod types;

pub use client::{ClientConfig, LLMClient, OpenRouterClient};
pub use types::{
    CacheControl, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker,
    ModelCosts, ModelSpec, ModelTier, NormalizedToolCall, Provider, StopReason, ToolDefinition,
    TokenUsage,
};
