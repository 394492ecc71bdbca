//! Research Worker: one LLM tool-use loop under a search/iteration budget
//! (spec §4.7), grounded on the OpenRouter adapter's `run()` loop.

use chrono::Utc;
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient, NormalizedToolCall};
use crate::store::Store;
use crate::tools::{read_graph_node, search_graph, tool_definitions, SearchManager, WebFetcher};
use crate::types::{SearchRecord, WorkerOutput};

const DEFAULT_MAX_ITERATIONS: u32 = 30;

/// Everything a worker needs to execute its tool calls against shared
/// state, without reaching for any ambient/global handle (DESIGN.md open
/// question on "global graph context").
pub struct WorkerContext<'a> {
    pub store: &'a Store,
    pub workspace_id: &'a str,
    pub search_manager: &'a SearchManager,
    pub web_fetcher: &'a dyn WebFetcher,
}

/// Runs one research worker's tool-use loop against `client`.
pub struct Worker<'a> {
    agent_name: String,
    model: String,
    client: &'a dyn LLMClient,
    max_iterations: u32,
}

impl<'a> Worker<'a> {
    pub fn new(agent_name: impl Into<String>, model: impl Into<String>, client: &'a dyn LLMClient) -> Self {
        Self {
            agent_name: agent_name.into(),
            model: model.into(),
            client,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// The agent name this worker reports in `WorkerOutput`/events.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Run the tool-use loop: call the model, execute any tool calls it
    /// emits, append results, and repeat until it stops or the iteration
    /// budget is exhausted. Errors never propagate past this boundary —
    /// a failure surfaces as a `WorkerOutput` with `failed = true`, per
    /// spec §4.7's failure policy (the cycle continues with other workers).
    pub async fn run(&self, system_prompt: &str, user_prompt: &str, ctx: &WorkerContext<'_>) -> WorkerOutput {
        let started = Instant::now();

        match self.run_inner(system_prompt, user_prompt, ctx).await {
            Ok(mut output) => {
                output.duration_seconds = started.elapsed().as_secs_f64();
                output
            }
            Err(e) => {
                warn!(agent = %self.agent_name, error = %e, "worker failed");
                WorkerOutput {
                    agent_name: self.agent_name.clone(),
                    model: self.model.clone(),
                    raw_text: String::new(),
                    self_critique: format!("Worker failed: {e}"),
                    searches_performed: Vec::new(),
                    cost_usd: 0.0,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    total_tokens: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    failed: true,
                }
            }
        }
    }

    async fn run_inner(&self, system_prompt: &str, user_prompt: &str, ctx: &WorkerContext<'_>) -> Result<WorkerOutput> {
        let tools = tool_definitions();
        let mut messages = vec![ChatMessage::user(user_prompt)];
        let mut searches_performed = Vec::new();
        let mut cost_usd = 0.0;
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut last_text = String::new();

        for _ in 0..self.max_iterations {
            let request = CompletionRequest::new()
                .with_model(&self.model)
                .with_system(system_prompt)
                .with_messages(messages.clone())
                .with_tools(tools.clone())
                .with_temperature(0.7);

            let response = self.client.complete(request).await?;

            input_tokens += response.usage.input_tokens;
            output_tokens += response.usage.output_tokens;
            cost_usd += response.cost.unwrap_or(0.0);
            last_text = response.content.clone();

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(response.content));
                break;
            }

            messages.push(ChatMessage::assistant(response.content).with_tool_calls(response.tool_calls.clone()));

            for call in &response.tool_calls {
                let result = self.execute_tool(call, ctx, &mut searches_performed).await;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
        }

        info!(
            agent = %self.agent_name,
            model = %self.model,
            searches = searches_performed.len(),
            cost_usd,
            "worker completed"
        );

        Ok(WorkerOutput {
            agent_name: self.agent_name.clone(),
            model: self.model.clone(),
            raw_text: last_text,
            self_critique: String::new(),
            searches_performed,
            cost_usd,
            duration_seconds: 0.0,
            total_tokens: input_tokens + output_tokens,
            input_tokens,
            output_tokens,
            failed: false,
        })
    }

    async fn execute_tool(
        &self,
        call: &NormalizedToolCall,
        ctx: &WorkerContext<'_>,
        searches_performed: &mut Vec<SearchRecord>,
    ) -> String {
        let result = match call.name.as_str() {
            "web_search" => self.execute_web_search(&call.arguments, ctx, searches_performed).await,
            "web_fetch" => self.execute_web_fetch(&call.arguments, ctx).await,
            "read_graph_node" => Ok(call
                .arguments
                .get("id")
                .and_then(Value::as_str)
                .map(|id| read_graph_node(ctx.store, id))
                .unwrap_or_else(|| Value::String("missing id argument".to_string()))),
            "search_graph" => Ok(self.execute_search_graph(&call.arguments, ctx)),
            other => Err(crate::error::Error::tool_execution(other, "unknown tool")),
        };

        match result {
            Ok(value) => value.to_string(),
            Err(e) => format!("Error executing {}: {e}", call.name),
        }
    }

    async fn execute_web_search(
        &self,
        args: &Value,
        ctx: &WorkerContext<'_>,
        searches_performed: &mut Vec<SearchRecord>,
    ) -> Result<Value> {
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default().to_string();
        let max_results = args.get("max_results").and_then(Value::as_u64).unwrap_or(10) as u32;

        let results = ctx.search_manager.search(&query, max_results).await?;

        searches_performed.push(SearchRecord {
            query: query.clone(),
            engine: results.first().and_then(|r| r.source.clone()).unwrap_or_else(|| "unknown".to_string()),
            timestamp: Utc::now(),
            results_summary: format!("{} results", results.len()),
            urls_visited: results.iter().map(|r| r.url.clone()).collect(),
        });

        Ok(serde_json::to_value(&results)?)
    }

    async fn execute_web_fetch(&self, args: &Value, ctx: &WorkerContext<'_>) -> Result<Value> {
        let url = args.get("url").and_then(Value::as_str).unwrap_or_default();
        let markdown = ctx.web_fetcher.fetch(url).await?;
        Ok(Value::String(markdown))
    }

    fn execute_search_graph(&self, args: &Value, ctx: &WorkerContext<'_>) -> Value {
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
        search_graph(ctx.store, ctx.workspace_id, query, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ModelSpec, Provider, StopReason, TokenUsage};
    use crate::tools::SearchResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubClient {
        responses: Mutex<Vec<CompletionResponse>>,
    }

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.remove(0))
        }

        fn provider(&self) -> Provider {
            Provider::OpenRouter
        }

        fn available_models(&self) -> Vec<ModelSpec> {
            vec![ModelSpec::claude_sonnet()]
        }
    }

    fn stub_response(content: &str, tool_calls: Vec<NormalizedToolCall>) -> CompletionResponse {
        CompletionResponse {
            id: "r1".to_string(),
            model: "anthropic/claude-3.5-sonnet".to_string(),
            content: content.to_string(),
            stop_reason: Some(if tool_calls.is_empty() { StopReason::EndTurn } else { StopReason::ToolUse }),
            usage: TokenUsage { input_tokens: 10, output_tokens: 5, cache_read_tokens: None, cache_creation_tokens: None },
            timestamp: Utc::now(),
            cost: Some(0.001),
            tool_calls,
        }
    }

    struct NoopFetcher;
    #[async_trait]
    impl WebFetcher for NoopFetcher {
        async fn fetch(&self, _url: &str) -> Result<String> {
            Ok("fetched content".to_string())
        }
    }

    struct StubProvider {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl crate::tools::SearchProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        fn cost_per_search(&self) -> f64 {
            0.0
        }
        async fn search(&self, _query: &str, _max_results: u32) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SearchResult {
                title: "t".to_string(),
                url: "https://example.com".to_string(),
                snippet: "s".to_string(),
                score: 1.0,
                published_date: None,
                source: Some("stub".to_string()),
            }])
        }
    }

    #[tokio::test]
    async fn worker_stops_on_first_text_only_response() {
        let client = StubClient { responses: Mutex::new(vec![stub_response("final answer", vec![])]) };
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let search_manager = SearchManager::new(vec![Box::new(StubProvider { calls: AtomicUsize::new(0) })]);
        let fetcher = NoopFetcher;
        let ctx = WorkerContext { store: &store, workspace_id: "ws", search_manager: &search_manager, web_fetcher: &fetcher };

        let worker = Worker::new("agent-1", "anthropic/claude-3.5-sonnet", &client);
        let output = worker.run("system", "user", &ctx).await;

        assert!(!output.failed);
        assert_eq!(output.raw_text, "final answer");
        assert_eq!(output.searches_performed.len(), 0);
    }

    #[tokio::test]
    async fn worker_executes_web_search_tool_call_then_finishes() {
        let call = NormalizedToolCall { id: "call_0".to_string(), name: "web_search".to_string(), arguments: serde_json::json!({"query": "rust async"}) };
        let client = StubClient {
            responses: Mutex::new(vec![
                stub_response("", vec![call]),
                stub_response("done researching", vec![]),
            ]),
        };
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let search_manager = SearchManager::new(vec![Box::new(StubProvider { calls: AtomicUsize::new(0) })]);
        let fetcher = NoopFetcher;
        let ctx = WorkerContext { store: &store, workspace_id: "ws", search_manager: &search_manager, web_fetcher: &fetcher };

        let worker = Worker::new("agent-1", "anthropic/claude-3.5-sonnet", &client);
        let output = worker.run("system", "user", &ctx).await;

        assert!(!output.failed);
        assert_eq!(output.searches_performed.len(), 1);
        assert_eq!(output.searches_performed[0].query, "rust async");
        assert_eq!(output.raw_text, "done researching");
    }

    #[tokio::test]
    async fn worker_marks_failed_on_client_error() {
        struct ErrClient;
        #[async_trait]
        impl LLMClient for ErrClient {
            async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
                Err(crate::error::Error::auth("openrouter", "bad key"))
            }
            fn provider(&self) -> Provider {
                Provider::OpenRouter
            }
            fn available_models(&self) -> Vec<ModelSpec> {
                vec![]
            }
        }

        let client = ErrClient;
        let store = Store::in_memory().unwrap();
        let search_manager = SearchManager::new(vec![]);
        let fetcher = NoopFetcher;
        let ctx = WorkerContext { store: &store, workspace_id: "ws", search_manager: &search_manager, web_fetcher: &fetcher };

        let worker = Worker::new("agent-1", "anthropic/claude-3.5-sonnet", &client);
        let output = worker.run("system", "user", &ctx).await;

        assert!(output.failed);
        assert!(output.self_critique.contains("bad key"));
    }
}
