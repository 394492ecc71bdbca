//! LLM client trait and the OpenRouter-backed implementation.
//!
//! All model traffic is routed through OpenRouter (spec §4.7); the engine
//! never talks to Anthropic/OpenAI/Google endpoints directly. Provider tags
//! on `ModelSpec` are logical only, used for pricing/display.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, ModelSpec, NormalizedToolCall, Provider,
    StopReason, TokenUsage,
};

/// LLM client trait for making completions.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    fn provider(&self) -> Provider;

    fn available_models(&self) -> Vec<ModelSpec>;
}

/// Configuration for the OpenRouter client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Sent as `HTTP-Referer`/`X-Title`, OpenRouter's app-identification headers.
    pub app_referer: Option<String>,
    pub app_title: Option<String>,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
            max_retries: 3,
            app_referer: None,
            app_title: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_app_identity(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.app_referer = Some(referer.into());
        self.app_title = Some(title.into());
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed environments panic during proxy auto-detection in
    // reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client"),
    }
}

/// OpenRouter chat-completions client. The sole LLM transport (spec §4.7).
pub struct OpenRouterClient {
    config: ClientConfig,
    http: Client,
}

impl OpenRouterClient {
    const DEFAULT_BASE_URL: &'static str = "https://openrouter.ai/api/v1";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(Self::DEFAULT_BASE_URL)
    }

    /// POST one chat-completions call, retrying transient/HTTP errors with
    /// exponential backoff (base 2s, cap 10s) up to `max_retries` attempts.
    async fn post_with_retry(&self, body: &Value) -> Result<OpenRouterResponse> {
        let url = format!("{}/chat/completions", self.base_url());
        let mut attempt = 0u32;

        loop {
            let result = self.post_once(&url, body).await;

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_retries => {
                    let backoff = Duration::from_secs_f64((2u64 << attempt) as f64).min(Duration::from_secs(10));
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<OpenRouterResponse> {
        let mut request = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json");

        if let Some(referer) = &self.config.app_referer {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.config.app_title {
            request = request.header("X-Title", title);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| Error::provider_transient("openrouter", e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("failed to read OpenRouter response: {e}")))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth("openrouter", text));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::provider_transient("openrouter", format!("{status}: {text}")));
        }
        if !status.is_success() {
            return Err(Error::provider_permanent("openrouter", format!("{status}: {text}")));
        }

        serde_json::from_str(&text).map_err(|e| Error::parse("openrouter response", e.to_string()))
    }
}

// ---- OpenRouter wire types ----

#[derive(Debug, Serialize)]
struct OpenRouterMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    id: String,
    model: String,
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: OpenRouterUsage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenRouterReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<RawToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenRouterUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// A tool call entry as it appears on the wire, before normalization.
/// `function` is optional because some providers' OpenRouter passthrough
/// omits it entirely on malformed entries.
#[derive(Debug, Default, Deserialize)]
struct RawToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<RawFunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFunctionCall {
    #[serde(default)]
    name: Option<String>,
    /// Most providers send a JSON-encoded string here, but some OpenRouter
    /// passthroughs (Anthropic/Gemini) leak a parsed object instead.
    #[serde(default)]
    arguments: Option<Value>,
}

/// Parse a tool call's `arguments` field into a JSON object, tolerating the
/// many shapes providers actually send: a JSON-encoded string, a
/// pre-parsed object, absence, empty/whitespace strings, and malformed or
/// non-object JSON (all treated as an empty object).
fn parse_arguments(raw: Option<&Value>) -> Value {
    match raw {
        None => json!({}),
        Some(Value::Object(_)) => raw.cloned().unwrap(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return json!({});
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) => json!({}),
                Err(_) => best_effort_parse_arguments(trimmed),
            }
        }
        Some(_) => json!({}),
    }
}

/// Best-effort recovery for near-valid JSON (e.g. a trailing comma before
/// the closing brace), which some smaller open models emit.
fn best_effort_parse_arguments(s: &str) -> Value {
    let cleaned = s.replace(",}", "}").replace(",]", "]");
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    }
}

/// Normalize a choice's `tool_calls` array into the engine's wire-agnostic
/// shape. Entries with no `function` at all, or with a missing function
/// name, are skipped rather than failing the whole batch. Missing ids are
/// synthesized so downstream tool-result messages always have something to
/// reference.
fn normalize_tool_calls(raw: &Option<Vec<RawToolCall>>) -> Vec<NormalizedToolCall> {
    let Some(entries) = raw else {
        return Vec::new();
    };

    let mut normalized = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let Some(function) = &entry.function else {
            continue;
        };
        let Some(name) = &function.name else {
            continue;
        };

        let id = entry
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{i}"));
        let arguments = parse_arguments(function.arguments.as_ref());

        normalized.push(NormalizedToolCall {
            id,
            name: name.clone(),
            arguments,
        });
    }

    normalized
}

/// Fallback extraction for models that emit tool calls inline in the
/// message content instead of the standard `tool_calls` array (Hermes/Qwen
/// `<tool_call>{...}</tool_call>` blocks, Mistral `[TOOL_CALLS] [...]`).
/// Only ever consulted when the standard array is empty.
fn extract_tool_calls_from_content(content: &str) -> Vec<NormalizedToolCall> {
    let mut calls = Vec::new();

    if let Some(rest) = content.trim_start().strip_prefix("[TOOL_CALLS]") {
        if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(rest.trim()) {
            for (i, entry) in entries.iter().enumerate() {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let arguments = entry.get("arguments").cloned().unwrap_or_else(|| json!({}));
                calls.push(NormalizedToolCall {
                    id: format!("call_{i}"),
                    name: name.to_string(),
                    arguments,
                });
            }
        }
        return calls;
    }

    let mut remaining = content;
    let mut i = 0;
    while let Some(start) = remaining.find("<tool_call>") {
        let after_tag = &remaining[start + "<tool_call>".len()..];
        let Some(end) = after_tag.find("</tool_call>") else {
            break;
        };
        let body = after_tag[..end].trim();

        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if let Some(name) = value.get("name").and_then(Value::as_str) {
                let arguments = value.get("arguments").cloned().unwrap_or_else(|| json!({}));
                calls.push(NormalizedToolCall {
                    id: format!("call_{i}"),
                    name: name.to_string(),
                    arguments,
                });
                i += 1;
            }
        }

        remaining = &after_tag[end + "</tool_call>".len()..];
    }

    calls
}

#[async_trait]
impl LLMClient for OpenRouterClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| ModelSpec::claude_sonnet().id);

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OpenRouterMessage {
                role: "system".to_string(),
                content: system.clone(),
                tool_call_id: None,
            });
        }
        for m in &request.messages {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            messages.push(OpenRouterMessage {
                role: role.to_string(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
            });
        }

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(0.7),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(stop) = &request.stop {
            body["stop"] = json!(stop);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let response = self.post_with_retry(&body).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("openrouter response", "no choices returned"))?;

        let content = choice.message.content.clone().unwrap_or_default();
        let mut tool_calls = normalize_tool_calls(&choice.message.tool_calls);
        if tool_calls.is_empty() && !content.is_empty() {
            tool_calls = extract_tool_calls_from_content(&content);
        }

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });
        let stop_reason = if !tool_calls.is_empty() {
            Some(StopReason::ToolUse)
        } else {
            stop_reason
        };

        let usage = TokenUsage {
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
            cache_read_tokens: None,
            cache_creation_tokens: None,
        };

        let model_spec = self
            .available_models()
            .into_iter()
            .find(|m| m.id == response.model || response.model.starts_with(&m.id))
            .unwrap_or_else(ModelSpec::claude_sonnet);
        let cost = model_spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        Ok(CompletionResponse {
            id: response.id,
            model: response.model,
            content,
            stop_reason,
            usage,
            timestamp: Utc::now(),
            cost: Some(cost),
            tool_calls,
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenRouter
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![
            ModelSpec::claude_sonnet(),
            ModelSpec::claude_haiku(),
            ModelSpec::gpt4o(),
            ModelSpec::gpt4o_mini(),
            ModelSpec::llama_3_1_70b(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("test-key")
            .with_base_url("https://custom.api.com")
            .with_default_model("anthropic/claude-3.5-haiku")
            .with_timeout(60);

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, Some("https://custom.api.com".to_string()));
        assert_eq!(config.default_model, Some("anthropic/claude-3.5-haiku".to_string()));
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_openrouter_available_models() {
        let client = OpenRouterClient::new(ClientConfig::new("test"));
        let models = client.available_models();
        assert_eq!(models.len(), 5);
        assert!(models.iter().any(|m| m.id.contains("sonnet")));
    }

    #[test]
    fn parse_arguments_json_string() {
        let raw = json!("{\"query\": \"rust\"}");
        let parsed = parse_arguments(Some(&raw));
        assert_eq!(parsed["query"], "rust");
    }

    #[test]
    fn parse_arguments_dict_passthrough() {
        let raw = json!({"query": "rust"});
        let parsed = parse_arguments(Some(&raw));
        assert_eq!(parsed["query"], "rust");
    }

    #[test]
    fn parse_arguments_empty_string_yields_empty_object() {
        let raw = json!("");
        assert_eq!(parse_arguments(Some(&raw)), json!({}));
    }

    #[test]
    fn parse_arguments_none_yields_empty_object() {
        assert_eq!(parse_arguments(None), json!({}));
    }

    #[test]
    fn parse_arguments_whitespace_only_yields_empty_object() {
        let raw = json!("   \n  ");
        assert_eq!(parse_arguments(Some(&raw)), json!({}));
    }

    #[test]
    fn parse_arguments_non_dict_json_yields_empty_object() {
        let raw = json!("[1, 2, 3]");
        assert_eq!(parse_arguments(Some(&raw)), json!({}));
        let raw = json!("42");
        assert_eq!(parse_arguments(Some(&raw)), json!({}));
    }

    #[test]
    fn parse_arguments_best_effort_on_trailing_comma() {
        let raw = json!("{\"query\": \"rust\",}");
        let parsed = parse_arguments(Some(&raw));
        assert_eq!(parsed["query"], "rust");
    }

    #[test]
    fn parse_arguments_nested_objects() {
        let raw = json!("{\"filter\": {\"year\": 2024}}");
        let parsed = parse_arguments(Some(&raw));
        assert_eq!(parsed["filter"]["year"], 2024);
    }

    #[test]
    fn normalize_tool_calls_standard_shape() {
        let raw = vec![RawToolCall {
            id: Some("call_1".to_string()),
            function: Some(RawFunctionCall {
                name: Some("web_search".to_string()),
                arguments: Some(json!("{\"query\": \"rust\"}")),
            }),
        }];
        let normalized = normalize_tool_calls(&Some(raw));
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].id, "call_1");
        assert_eq!(normalized[0].name, "web_search");
        assert_eq!(normalized[0].arguments["query"], "rust");
    }

    #[test]
    fn normalize_tool_calls_skips_missing_function_name() {
        let raw = vec![RawToolCall {
            id: Some("call_1".to_string()),
            function: Some(RawFunctionCall {
                name: None,
                arguments: Some(json!("{}")),
            }),
        }];
        assert!(normalize_tool_calls(&Some(raw)).is_empty());
    }

    #[test]
    fn normalize_tool_calls_skips_missing_function_key() {
        let raw = vec![RawToolCall {
            id: Some("call_1".to_string()),
            function: None,
        }];
        assert!(normalize_tool_calls(&Some(raw)).is_empty());
    }

    #[test]
    fn normalize_tool_calls_dict_arguments_leak_through() {
        let raw = vec![RawToolCall {
            id: Some("call_1".to_string()),
            function: Some(RawFunctionCall {
                name: Some("web_search".to_string()),
                arguments: Some(json!({"query": "rust"})),
            }),
        }];
        let normalized = normalize_tool_calls(&Some(raw));
        assert_eq!(normalized[0].arguments["query"], "rust");
    }

    #[test]
    fn normalize_tool_calls_empty_string_arguments_becomes_empty_object() {
        let raw = vec![RawToolCall {
            id: Some("call_1".to_string()),
            function: Some(RawFunctionCall {
                name: Some("web_search".to_string()),
                arguments: Some(json!("")),
            }),
        }];
        let normalized = normalize_tool_calls(&Some(raw));
        assert_eq!(normalized[0].arguments, json!({}));
    }

    #[test]
    fn normalize_tool_calls_synthesizes_missing_id() {
        let raw = vec![RawToolCall {
            id: None,
            function: Some(RawFunctionCall {
                name: Some("web_search".to_string()),
                arguments: Some(json!({})),
            }),
        }];
        let normalized = normalize_tool_calls(&Some(raw));
        assert_eq!(normalized[0].id, "call_0");
    }

    #[test]
    fn normalize_tool_calls_keeps_valid_skips_invalid() {
        let raw = vec![
            RawToolCall {
                id: Some("call_1".to_string()),
                function: Some(RawFunctionCall {
                    name: Some("web_search".to_string()),
                    arguments: Some(json!({})),
                }),
            },
            RawToolCall {
                id: Some("call_2".to_string()),
                function: Some(RawFunctionCall {
                    name: None,
                    arguments: Some(json!({})),
                }),
            },
            RawToolCall {
                id: Some("call_3".to_string()),
                function: Some(RawFunctionCall {
                    name: Some("web_fetch".to_string()),
                    arguments: Some(json!({})),
                }),
            },
        ];
        let normalized = normalize_tool_calls(&Some(raw));
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].name, "web_search");
        assert_eq!(normalized[1].name, "web_fetch");
    }

    #[test]
    fn normalize_tool_calls_none_yields_empty() {
        assert!(normalize_tool_calls(&None).is_empty());
    }

    #[test]
    fn extract_from_content_hermes_single_block() {
        let content = "<tool_call>{\"name\": \"web_search\", \"arguments\": {\"query\": \"rust\"}}</tool_call>";
        let calls = extract_tool_calls_from_content(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
    }

    #[test]
    fn extract_from_content_hermes_multiple_blocks() {
        let content = "<tool_call>{\"name\": \"a\", \"arguments\": {}}</tool_call>\
                        <tool_call>{\"name\": \"b\", \"arguments\": {}}</tool_call>";
        let calls = extract_tool_calls_from_content(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
    }

    #[test]
    fn extract_from_content_mistral_bracket_array() {
        let content = "[TOOL_CALLS] [{\"name\": \"web_search\", \"arguments\": {\"query\": \"rust\"}}]";
        let calls = extract_tool_calls_from_content(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
    }

    #[test]
    fn extract_from_content_plain_text_yields_empty() {
        let calls = extract_tool_calls_from_content("Just a regular answer, no tool calls here.");
        assert!(calls.is_empty());
    }
}
