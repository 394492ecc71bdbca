//! # northstar-engine
//!
//! Autonomous research cycle orchestrator: an LLM "Lead" repeatedly
//! selects a direction in a persistent knowledge graph, dispatches
//! research workers against it, synthesizes their findings back into the
//! graph, and reassesses confidence — cycle after cycle, until the graph
//! converges or a caller-set budget runs out.
//!
//! ## Core Components
//!
//! - **Store**: SQLite-backed persistence for the direction graph, cycle
//!   records, and workspace bookkeeping.
//! - **Lead**: the select/synthesize/reassess JSON-contract LLM protocol
//!   that drives the graph's evolution.
//! - **Worker**: the per-direction tool-use research loop.
//! - **Cycle Executor / Orchestrator**: the state machine and top-level
//!   coordinator that run cycles end to end.
//! - **Report Synthesizer**: turns the accumulated graph into a narrative
//!   Markdown document.
//!
//! ## Example
//!
//! ```rust,ignore
//! use northstar_engine::{EngineConfig, Orchestrator, Lead, Store};
//!
//! let store = Store::in_memory()?;
//! store.ensure_workspace("ws", "Map the competitive landscape for X")?;
//! // ... construct an LLMClient, a Lead, a Vec<Worker>, an EventBus ...
//! ```

pub mod config;
pub mod context;
pub mod cycle;
pub mod error;
pub mod events;
pub mod lead;
pub mod llm;
pub mod merge;
pub mod orchestrator;
pub mod propagation;
pub mod report;
pub mod similarity;
pub mod store;
pub mod tools;
pub mod types;
pub mod views;
pub mod worker;

pub use config::{EngineConfig, RetryPolicy};
pub use context::{ContextBuilder, ResearchContext, TokenBudget};
pub use cycle::CycleConfig;
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventEmitter, EventType};
pub use lead::{Lead, LeadCallMetrics, ReassessmentOutcome, SelectOutcome, SynthesisOutcome, SynthesizedDirection};
pub use llm::{
    ChatMessage, ChatRole, ClientConfig, CompletionRequest, CompletionResponse, CostTracker,
    LLMClient, ModelSpec, ModelTier, NormalizedToolCall, OpenRouterClient, Provider, StopReason,
    ToolDefinition, TokenUsage,
};
pub use merge::{deduplicate_children, execute_merge, merge_directions_into_graph, MergeStats};
pub use orchestrator::{Orchestrator, OrchestratorSummary};
pub use propagation::{
    boost_confidence, evidence_to_confidence, propagate_downward, propagate_upward,
    recalculate_all, CONSENSUS_BOOST,
};
pub use report::{ReportResult, ReportSynthesizer, ReportTokenBudget};
pub use similarity::{claim_similarity, find_similar, group_duplicate_children, longest_claim, SimilarMatch};
pub use store::Store;
pub use tools::{read_graph_node, search_graph, tool_definitions, SearchManager, SearchProvider, SearchResult, WebFetcher};
pub use types::{
    ContextDocument, CycleRecord, Direction, DirectionStatus, Evidence, NodeKind, ReportMetadata,
    SearchRecord, WorkerOutput, WorkerSummary,
};
pub use views::{render_focused_view, render_summary_view, render_weakest_n};
pub use worker::{Worker, WorkerContext};
