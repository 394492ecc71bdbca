//! Tool surface exposed to research workers: web search (multi-provider
//! with fallback), web fetch, and graph read/search (spec §4.7, §6).
//!
//! Search/fetch HTTP transports are external collaborators (spec §1 scope)
//! — only the trait boundaries and the in-process graph tools live here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::Store;

/// One hit from a web search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// A web search backend (Tavily/Brave/Serper/etc., provided by the host
/// application — the HTTP transport itself is out of scope here).
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    fn cost_per_search(&self) -> f64;
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchResult>>;
}

/// Fetches a URL's content, reduced to Markdown.
#[async_trait]
pub trait WebFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Composes multiple search providers with ordered fallback: providers are
/// tried in priority order, the first non-empty, non-error result wins.
pub struct SearchManager {
    providers: Vec<Box<dyn SearchProvider>>,
}

impl SearchManager {
    pub fn new(providers: Vec<Box<dyn SearchProvider>>) -> Self {
        Self { providers }
    }

    pub async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchResult>> {
        let mut last_error: Option<Error> = None;

        for provider in &self.providers {
            debug!(provider = provider.name(), %query, "trying search provider");
            match provider.search(query, max_results).await {
                Ok(results) if !results.is_empty() => {
                    info!(provider = provider.name(), count = results.len(), "search succeeded");
                    return Ok(results);
                }
                Ok(_) => {
                    warn!(provider = provider.name(), "no results");
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "search provider failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(Error::tool_execution("web_search", format!("all search providers failed: {e}"))),
            None => Ok(Vec::new()),
        }
    }
}

/// Read one direction by id, as compact JSON for a tool result.
pub fn read_graph_node(store: &Store, node_id: &str) -> Value {
    let Ok(id) = node_id.parse::<uuid::Uuid>() else {
        return json!({ "error": format!("invalid node id: {node_id}") });
    };

    match store.get(&id) {
        Ok(Some(direction)) => json!({
            "id": direction.id.to_string(),
            "claim": direction.claim,
            "confidence": direction.confidence,
            "importance": direction.importance,
            "depth": direction.depth,
            "children_count": direction.children.len(),
            "evidence_count": direction.evidence.len(),
            "tags": direction.tags,
            "created_by_cycle": direction.created_by_cycle,
        }),
        Ok(None) => json!({ "error": format!("node {node_id} not found") }),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// Full-text search over the workspace's directions, as compact JSON.
pub fn search_graph(store: &Store, workspace_id: &str, query: &str, limit: usize) -> Value {
    match store.search_by_text(workspace_id, query, limit) {
        Ok(directions) => json!(directions
            .iter()
            .map(|d| json!({
                "id": d.id.to_string(),
                "claim": d.claim,
                "confidence": d.confidence,
                "importance": d.importance,
            }))
            .collect::<Vec<_>>()),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// JSON-schema tool definitions advertised to the worker loop, matching the
/// four-tool surface named in spec §4.7 (the legacy `note_finding` tool is
/// deliberately not offered).
pub fn tool_definitions() -> Vec<crate::llm::ToolDefinition> {
    vec![
        crate::llm::ToolDefinition {
            name: "web_search".to_string(),
            description: "Search the web for information relevant to the research target.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_results": {"type": "integer", "default": 10},
                },
                "required": ["query"],
            }),
        },
        crate::llm::ToolDefinition {
            name: "web_fetch".to_string(),
            description: "Fetch a URL and return its content as Markdown.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "url": {"type": "string"} },
                "required": ["url"],
            }),
        },
        crate::llm::ToolDefinition {
            name: "read_graph_node".to_string(),
            description: "Read one knowledge-graph direction by id.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "id": {"type": "string"} },
                "required": ["id"],
            }),
        },
        crate::llm::ToolDefinition {
            name: "search_graph".to_string(),
            description: "Full-text search the knowledge graph for related directions.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "default": 5},
                },
                "required": ["query"],
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        name: String,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for FlakyProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn cost_per_search(&self) -> f64 {
            0.001
        }

        async fn search(&self, _query: &str, _max_results: u32) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::tool_execution("web_search", "boom"))
            } else {
                Ok(vec![SearchResult {
                    title: "hit".to_string(),
                    url: "https://example.com".to_string(),
                    snippet: "...".to_string(),
                    score: 1.0,
                    published_date: None,
                    source: Some(self.name.clone()),
                }])
            }
        }
    }

    #[tokio::test]
    async fn search_manager_falls_back_to_next_provider() {
        let manager = SearchManager::new(vec![
            Box::new(FlakyProvider { name: "primary".to_string(), fail: true, calls: AtomicUsize::new(0) }),
            Box::new(FlakyProvider { name: "backup".to_string(), fail: false, calls: AtomicUsize::new(0) }),
        ]);

        let results = manager.search("rust", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source.as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn search_manager_errors_when_all_providers_fail() {
        let manager = SearchManager::new(vec![Box::new(FlakyProvider {
            name: "only".to_string(),
            fail: true,
            calls: AtomicUsize::new(0),
        })]);

        assert!(manager.search("rust", 5).await.is_err());
    }

    #[test]
    fn read_graph_node_reports_missing_node() {
        let store = Store::in_memory().unwrap();
        let result = read_graph_node(&store, &uuid::Uuid::new_v4().to_string());
        assert!(result["error"].is_string());
    }

    #[test]
    fn read_graph_node_returns_fields() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let direction = Direction::new_root("ws", "Understand the market", 0);
        store.create(&direction).unwrap();

        let result = read_graph_node(&store, &direction.id.to_string());
        assert_eq!(result["claim"], "Understand the market");
    }

    #[test]
    fn tool_definitions_cover_the_four_tool_surface() {
        let names: Vec<_> = tool_definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["web_search", "web_fetch", "read_graph_node", "search_graph"]);
    }
}
