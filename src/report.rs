//! Report Synthesizer (spec §4.11): a single `tools=[]`, `max_iterations=1`
//! LLM call that turns the accumulated graph into a narrative Markdown
//! document, organized by theme rather than by node or cycle. Grounded on
//! `orchestrator/report.py`'s `ReportSynthesizer`.

use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::store::Store;
use crate::types::{Direction, ReportMetadata};

/// Default cache window before a report is considered stale, when a
/// workspace hasn't set its own `regeneration_interval_secs` yet.
const DEFAULT_REGENERATION_INTERVAL_SECS: i64 = 3600;

/// Character limits for report context sections (~4 chars per token).
#[derive(Debug, Clone)]
pub struct ReportTokenBudget {
    pub nodes: usize,
    pub cycle_summaries: usize,
    pub contradictions: usize,
    pub open_questions: usize,
}

impl Default for ReportTokenBudget {
    fn default() -> Self {
        Self { nodes: 40_000, cycle_summaries: 12_000, contradictions: 4_000, open_questions: 4_000 }
    }
}

/// Result of one report generation.
#[derive(Debug, Clone)]
pub struct ReportResult {
    pub markdown: String,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub node_count: usize,
    pub cycle_count: usize,
    /// True when this result was served from the cached
    /// `ReportMetadata` instead of calling the model.
    pub from_cache: bool,
}

#[derive(Serialize)]
struct FrontMatter {
    generated: String,
    nodes: usize,
    cycles: usize,
    avg_confidence: f64,
}

#[derive(Default)]
struct ReportContext {
    nodes_section: String,
    cycle_summaries: String,
    contradictions: String,
    open_questions: String,
}

/// Generates a narrative research report from one workspace's graph.
/// `generate` refuses to run concurrently against the same instance,
/// mirroring the cycle mutex's acquire-release shape (spec §4.10/§4.11
/// imply the same one-at-a-time discipline; `Error::ReportBusy` is this
/// module's analog of `CycleAlreadyRunningError`).
pub struct ReportSynthesizer<'a> {
    store: &'a Store,
    client: &'a dyn LLMClient,
    model: String,
    north_star: String,
    budget: ReportTokenBudget,
    busy: Mutex<bool>,
}

impl<'a> ReportSynthesizer<'a> {
    pub fn new(store: &'a Store, client: &'a dyn LLMClient, model: impl Into<String>, north_star: impl Into<String>) -> Self {
        Self {
            store,
            client,
            model: model.into(),
            north_star: north_star.into(),
            budget: ReportTokenBudget::default(),
            busy: Mutex::new(false),
        }
    }

    pub fn with_budget(mut self, budget: ReportTokenBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Generate (or, absent `force` and with a fresh cache, replay) the
    /// report for `workspace_id`.
    pub async fn generate(&self, workspace_id: &str, force: bool) -> Result<ReportResult> {
        {
            let mut busy = self.busy.lock().unwrap();
            if *busy {
                return Err(Error::ReportBusy);
            }
            *busy = true;
        }
        let result = self.generate_inner(workspace_id, force).await;
        *self.busy.lock().unwrap() = false;
        result
    }

    async fn generate_inner(&self, workspace_id: &str, force: bool) -> Result<ReportResult> {
        let nodes = self.store.get_active(workspace_id)?;
        if nodes.is_empty() {
            return Err(Error::store_invariant(
                "cannot generate report: knowledge graph is empty, run research cycles first",
            ));
        }

        let records = self.store.list_cycle_records(workspace_id)?;
        let cycle_count = records.iter().filter(|r| r.success).count();
        let avg_confidence = nodes.iter().map(|n| n.confidence).sum::<f64>() / nodes.len() as f64;

        let metadata = self.store.get_report_metadata(workspace_id)?;
        if !force && !metadata.needs_regeneration() {
            if let Some(markdown) = metadata.markdown.clone() {
                return Ok(ReportResult {
                    markdown,
                    cost_usd: 0.0,
                    duration_seconds: 0.0,
                    total_tokens: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    node_count: nodes.len(),
                    cycle_count,
                    from_cache: true,
                });
            }
        }

        let started = Instant::now();
        let context = self.build_context(workspace_id, &nodes)?;
        let system_prompt = Self::build_system_prompt();
        let user_prompt = self.build_user_prompt(&context);

        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(system_prompt)
            .with_message(ChatMessage::user(user_prompt));

        let response = self.client.complete(request).await?;
        let duration_seconds = started.elapsed().as_secs_f64();

        let front_matter = FrontMatter {
            generated: Utc::now().to_rfc3339(),
            nodes: nodes.len(),
            cycles: cycle_count,
            avg_confidence,
        };
        let frontmatter_yaml = serde_yaml::to_string(&front_matter).unwrap_or_default();

        let footer = format!(
            "\n\n---\n*Report generated {} from {} nodes across {} research cycles (avg confidence: {:.0}%). Regenerate to refresh after running more cycles.*\n",
            front_matter.generated,
            nodes.len(),
            cycle_count,
            avg_confidence * 100.0,
        );

        let markdown = format!("---\n{frontmatter_yaml}---\n\n{}{footer}", response.content.trim());

        let interval = if metadata.regeneration_interval_secs > 0 {
            metadata.regeneration_interval_secs
        } else {
            DEFAULT_REGENERATION_INTERVAL_SECS
        };
        let new_metadata = ReportMetadata {
            regeneration_interval_secs: interval,
            last_generated_at: Some(Utc::now()),
            markdown: Some(markdown.clone()),
        };
        self.store.save_report_metadata(workspace_id, &new_metadata)?;

        Ok(ReportResult {
            markdown,
            cost_usd: response.cost.unwrap_or(0.0),
            duration_seconds,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            node_count: nodes.len(),
            cycle_count,
            from_cache: false,
        })
    }

    fn build_context(&self, workspace_id: &str, nodes: &[Direction]) -> Result<ReportContext> {
        Ok(ReportContext {
            nodes_section: self.build_nodes_section(workspace_id, nodes)?,
            cycle_summaries: self.build_cycle_summaries(workspace_id)?,
            contradictions: self.build_contradictions(workspace_id)?,
            open_questions: self.build_open_questions(workspace_id)?,
        })
    }

    fn build_nodes_section(&self, workspace_id: &str, nodes: &[Direction]) -> Result<String> {
        let roots = self.store.get_roots(workspace_id)?;
        if roots.is_empty() {
            return Ok(String::new());
        }

        let total_nodes = nodes.len();
        let mut lines = Vec::new();
        let mut chars_used = 0usize;

        for root in &roots {
            if chars_used >= self.budget.nodes {
                break;
            }
            let section = self.render_node_for_report(root, total_nodes, self.budget.nodes - chars_used, 0)?;
            if section.is_empty() {
                continue;
            }
            chars_used += section.chars().count();
            lines.push(section);
        }

        Ok(lines.join("\n"))
    }

    fn render_node_for_report(&self, node: &Direction, total_nodes: usize, remaining_chars: usize, depth: usize) -> Result<String> {
        if remaining_chars == 0 {
            return Ok(String::new());
        }

        let indent = "  ".repeat(depth);
        let type_label = format!(" [{}]", node.kind);
        let use_brief = node.importance < 0.4 && total_nodes > 100;

        let mut lines = vec![format!("{indent}- {} (confidence: {:.2}{type_label})", node.claim, node.confidence)];
        if !use_brief {
            for evidence in node.evidence.iter().take(2) {
                let preview = if evidence.text.chars().count() > 150 {
                    let head: String = evidence.text.chars().take(150).collect();
                    format!("{head}...")
                } else {
                    evidence.text.clone()
                };
                lines.push(format!("{indent}  Evidence: {preview} [{}]", evidence.source));
            }
        }

        let mut result = lines.join("\n");
        result.push('\n');
        let mut remaining = remaining_chars.saturating_sub(result.chars().count());

        for child in self.store.get_children(&node.id)? {
            if remaining == 0 {
                break;
            }
            let child_section = self.render_node_for_report(&child, total_nodes, remaining, depth + 1)?;
            if !child_section.is_empty() {
                remaining = remaining.saturating_sub(child_section.chars().count());
                result.push_str(&child_section);
            }
        }

        Ok(result)
    }

    fn build_cycle_summaries(&self, workspace_id: &str) -> Result<String> {
        let mut records = self.store.list_cycle_records(workspace_id)?;
        records.retain(|r| r.success);
        records.truncate(50);

        if records.is_empty() {
            return Ok(String::new());
        }

        let mut lines = Vec::new();
        for record in &records {
            let claim_preview = truncate_inline(&record.target_claim_snapshot, 100);
            lines.push(format!("Cycle {}: Researched \"{claim_preview}\"", record.cycle_id));
            lines.push(format!(
                "  Created {} findings, updated {}",
                record.created_direction_ids.len(),
                record.updated_direction_ids.len()
            ));

            if !record.synthesis_reasoning.is_empty() {
                lines.push(format!("  Synthesis: {}", truncate_inline(&record.synthesis_reasoning, 300)));
            }
            for consensus in record.consensus_directions.iter().take(3) {
                lines.push(format!("  Consensus: {}", truncate_inline(consensus, 150)));
            }
            lines.push(String::new());
        }

        Ok(truncate(&lines.join("\n"), self.budget.cycle_summaries))
    }

    fn build_contradictions(&self, workspace_id: &str) -> Result<String> {
        let mut records = self.store.list_cycle_records(workspace_id)?;
        records.retain(|r| r.success);

        let mut lines = Vec::new();
        for record in &records {
            for contradiction in &record.contradictions {
                lines.push(format!("- Cycle {}: {}", record.cycle_id, truncate_inline(contradiction, 200)));
            }
        }

        if lines.is_empty() {
            return Ok(String::new());
        }
        Ok(truncate(&lines.join("\n"), self.budget.contradictions))
    }

    fn build_open_questions(&self, workspace_id: &str) -> Result<String> {
        let critiques = self.store.get_recent_critiques(workspace_id, 20)?;
        if critiques.is_empty() {
            return Ok(String::new());
        }

        let lines: Vec<String> = critiques
            .iter()
            .map(|(agent, cycle_id, text)| format!("- {agent} (cycle {cycle_id}): {}", truncate_inline(text, 300)))
            .collect();

        Ok(truncate(&lines.join("\n"), self.budget.open_questions))
    }

    fn build_system_prompt() -> String {
        r#"You are a research report writer. Your task is to synthesize a knowledge
graph into a cohesive, well-organized research report.

Write the report in markdown with these sections:

1. **Executive Summary** - Key conclusions with confidence levels. Lead with the
   most important findings.

2. **Key Findings** - Organized by theme (NOT by cycle or node). For each finding,
   include:
   - The claim and its confidence level (use labels: Confirmed >80%, Likely
     60-80%, Uncertain 40-60%, Speculative <40%)
   - Supporting evidence with source citations
   - Note when multiple independent sources confirm a finding

3. **Contradictions and Debates** - Areas where evidence conflicts. Present both
   sides fairly.

4. **Open Questions and Gaps** - What remains unknown or under-researched.

5. **Methodology Note** - Brief note on how many nodes/cycles/agents contributed
   to this report.

Guidelines:
- Integrate findings into a narrative; do NOT just list nodes
- Group related findings by theme, not by their position in the graph
- Use inline citations where possible (e.g., [Source Name])
- Be honest about uncertainty; label confidence levels clearly
- Write for a knowledgeable reader who wants actionable insights
- Do NOT include the YAML frontmatter (that will be added automatically)
"#
        .to_string()
    }

    fn build_user_prompt(&self, context: &ReportContext) -> String {
        let mut sections = vec![format!("# Research Mission\n\n{}\n", self.north_star)];

        if !context.nodes_section.is_empty() {
            let line_count = context.nodes_section.matches('\n').count();
            sections.push(format!(
                "# Knowledge Graph ({line_count} lines)\n\nThe following nodes represent the accumulated \
                 research findings, organized hierarchically:\n\n{}",
                context.nodes_section
            ));
        }
        if !context.cycle_summaries.is_empty() {
            sections.push(format!("# Research Cycle History\n\n{}", context.cycle_summaries));
        }
        if !context.contradictions.is_empty() {
            sections.push(format!("# Identified Contradictions\n\n{}", context.contradictions));
        }
        if !context.open_questions.is_empty() {
            sections.push(format!("# Open Questions from Agent Self-Critiques\n\n{}", context.open_questions));
        }

        sections.push(
            "# Instructions\n\nWrite a comprehensive research report based on the above data. Synthesize the \
             findings into a narrative organized by themes."
                .to_string(),
        );

        sections.join("\n\n")
    }
}

/// Truncate `text` to `max_chars`, preferring to cut at a line boundary.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let truncated: String = text.chars().take(max_chars).collect();
    let cutoff = match truncated.rfind('\n') {
        Some(pos) if pos as f64 > max_chars as f64 * 0.5 => pos,
        _ => truncated.len(),
    };

    format!("{}\n\n[...truncated for token budget]", &truncated[..cutoff])
}

fn truncate_inline(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ModelSpec, Provider, TokenUsage};
    use crate::types::Direction;
    use async_trait::async_trait;

    struct StubClient {
        response: String,
    }

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub-model".to_string(),
                content: self.response.clone(),
                stop_reason: None,
                usage: TokenUsage { input_tokens: 10, output_tokens: 20, cache_read_tokens: None, cache_creation_tokens: None },
                timestamp: Utc::now(),
                cost: Some(0.01),
                tool_calls: Vec::new(),
            })
        }

        fn provider(&self) -> Provider {
            Provider::OpenRouter
        }

        fn available_models(&self) -> Vec<ModelSpec> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn generate_fails_on_empty_graph() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let client = StubClient { response: "# Report".to_string() };
        let synthesizer = ReportSynthesizer::new(&store, &client, "stub-model", "Understand the thing.");

        let err = synthesizer.generate("ws", false).await.unwrap_err();
        assert!(matches!(err, Error::StoreInvariant(_)));
    }

    #[tokio::test]
    async fn generate_produces_frontmatter_and_body() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let root = Direction::new_root("ws", "Root claim", 1);
        store.create(&root).unwrap();

        let client = StubClient { response: "## Executive Summary\n\nAll good.".to_string() };
        let synthesizer = ReportSynthesizer::new(&store, &client, "stub-model", "Understand the thing.");

        let result = synthesizer.generate("ws", false).await.unwrap();
        assert!(result.markdown.starts_with("---\n"));
        assert!(result.markdown.contains("Executive Summary"));
        assert_eq!(result.node_count, 1);
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn second_generate_within_interval_serves_cache() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let root = Direction::new_root("ws", "Root claim", 1);
        store.create(&root).unwrap();

        let client = StubClient { response: "## Executive Summary\n\nFirst pass.".to_string() };
        let synthesizer = ReportSynthesizer::new(&store, &client, "stub-model", "Understand the thing.");

        let first = synthesizer.generate("ws", false).await.unwrap();
        assert!(!first.from_cache);

        let second = synthesizer.generate("ws", false).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.markdown, first.markdown);
    }
}
