//! Research context builder: assembles prior-cycle knowledge into a
//! token-budgeted string injected into worker and Lead prompts (§4.5).

use crate::error::Result;
use crate::store::Store;
use crate::views::{render_summary_view, render_weakest_n};
use std::collections::HashSet;

/// Character limits per section (~4 chars/token).
#[derive(Debug, Clone)]
pub struct TokenBudget {
    pub summary_view: usize,
    pub prior_cycles: usize,
    pub search_history: usize,
    pub contradictions: usize,
    pub weakest_nodes: usize,
    pub open_questions: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            summary_view: 3200,
            prior_cycles: 4800,
            search_history: 2400,
            contradictions: 1600,
            weakest_nodes: 1600,
            open_questions: 2400,
        }
    }
}

/// Pre-rendered context sections, ready to fold into a prompt via `render`.
#[derive(Debug, Clone, Default)]
pub struct ResearchContext {
    pub graph_summary: String,
    pub prior_cycle_summaries: String,
    pub search_history: String,
    pub contradictions: String,
    pub weakest_nodes: String,
    pub open_questions: String,
    pub total_prior_cycles: usize,
}

impl ResearchContext {
    /// Combine non-empty sections into one context string. Empty (no
    /// section headers at all) when there are no prior cycles yet.
    pub fn render(&self) -> String {
        if self.total_prior_cycles == 0 {
            return String::new();
        }

        let mut sections = vec![format!(
            "## Accumulated Research Context ({} prior cycles)\n\n\
             You have access to everything discovered in prior cycles. \
             Use this to avoid redundant work and build on existing knowledge.",
            self.total_prior_cycles
        )];

        if !self.graph_summary.is_empty() {
            sections.push(format!("### Knowledge Graph Overview\n\n{}", self.graph_summary));
        }
        if !self.prior_cycle_summaries.is_empty() {
            sections.push(format!("### Prior Cycle Summaries\n\n{}", self.prior_cycle_summaries));
        }
        if !self.search_history.is_empty() {
            sections.push(format!(
                "### Prior Searches (avoid repeating these)\n\n{}",
                self.search_history
            ));
        }
        if !self.contradictions.is_empty() {
            sections.push(format!("### Unresolved Contradictions\n\n{}", self.contradictions));
        }
        if !self.weakest_nodes.is_empty() {
            sections.push(format!("### Areas Needing Attention\n\n{}", self.weakest_nodes));
        }
        if !self.open_questions.is_empty() {
            sections.push(format!(
                "### Open Questions from Prior Research\n\n{}",
                self.open_questions
            ));
        }

        sections.join("\n\n")
    }
}

/// Truncate `text` to `max_chars`, preferring to cut at the last newline
/// at or past 50% of the budget so sections don't end mid-sentence.
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

/// Builds token-budgeted research context from graph and cycle history.
pub struct ContextBuilder<'a> {
    store: &'a Store,
    budget: TokenBudget,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            budget: TokenBudget::default(),
        }
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Build the full context. Returns an empty (zero `total_prior_cycles`)
    /// context when this is the workspace's first cycle.
    pub fn build(&self, workspace_id: &str) -> Result<ResearchContext> {
        let records = self.store.list_cycle_records(workspace_id)?;
        let successful: Vec<_> = records.iter().filter(|r| r.success).collect();

        if successful.is_empty() {
            return Ok(ResearchContext::default());
        }

        Ok(ResearchContext {
            graph_summary: self.build_graph_summary(workspace_id)?,
            prior_cycle_summaries: self.build_prior_cycle_summaries(workspace_id)?,
            search_history: self.build_search_history(workspace_id)?,
            contradictions: self.build_contradictions(workspace_id)?,
            weakest_nodes: self.build_weakest_nodes(workspace_id)?,
            open_questions: self.build_open_questions(workspace_id)?,
            total_prior_cycles: successful.len(),
        })
    }

    fn build_graph_summary(&self, workspace_id: &str) -> Result<String> {
        let summary = render_summary_view(self.store, workspace_id, 2, 50)?;
        Ok(truncate(&summary, self.budget.summary_view))
    }

    fn build_prior_cycle_summaries(&self, workspace_id: &str) -> Result<String> {
        let mut records = self.store.list_cycle_records(workspace_id)?;
        records.retain(|r| r.success);
        records.truncate(10);

        if records.is_empty() {
            return Ok(String::new());
        }

        let mut lines = Vec::new();
        for record in &records {
            let claim_preview = truncate_inline(&record.target_claim_snapshot, 80);
            lines.push(format!("Cycle {}: Researched \"{claim_preview}\"", record.cycle_id));
            lines.push(format!(
                "  - Created {} findings, updated {}",
                record.created_direction_ids.len(),
                record.updated_direction_ids.len()
            ));

            if !record.synthesis_reasoning.is_empty() {
                lines.push(format!(
                    "  - Synthesis: {}",
                    truncate_inline(&record.synthesis_reasoning, 200)
                ));
            }

            for consensus in record.consensus_directions.iter().take(3) {
                lines.push(format!("  - Consensus: {}", truncate_inline(consensus, 100)));
            }

            lines.push(String::new());
        }

        Ok(truncate(&lines.join("\n"), self.budget.prior_cycles))
    }

    fn build_search_history(&self, workspace_id: &str) -> Result<String> {
        let queries = self.store.get_all_search_queries(workspace_id, 200)?;

        if queries.is_empty() {
            return Ok(String::new());
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for query in &queries {
            let normalized = query.trim().to_lowercase();
            if seen.insert(normalized) {
                unique.push(query.clone());
            }
        }

        let mut lines = vec![format!("({} unique searches performed so far)", unique.len())];
        lines.extend(unique.iter().map(|q| format!("- \"{q}\"")));

        Ok(truncate(&lines.join("\n"), self.budget.search_history))
    }

    fn build_contradictions(&self, workspace_id: &str) -> Result<String> {
        let mut records = self.store.list_cycle_records(workspace_id)?;
        records.retain(|r| r.success);
        records.truncate(20);

        let mut lines = Vec::new();
        for record in &records {
            for contradiction in &record.contradictions {
                lines.push(format!(
                    "- Cycle {}: {}",
                    record.cycle_id,
                    truncate_inline(contradiction, 150)
                ));
            }
        }

        if lines.is_empty() {
            return Ok(String::new());
        }

        Ok(truncate(&lines.join("\n"), self.budget.contradictions))
    }

    fn build_weakest_nodes(&self, workspace_id: &str) -> Result<String> {
        let weakest = render_weakest_n(self.store, workspace_id, 5)?;
        Ok(truncate(&weakest, self.budget.weakest_nodes))
    }

    fn build_open_questions(&self, workspace_id: &str) -> Result<String> {
        let critiques = self.store.get_recent_critiques(workspace_id, 10)?;

        if critiques.is_empty() {
            return Ok(String::new());
        }

        let lines: Vec<String> = critiques
            .iter()
            .map(|(agent, cycle_id, text)| format!("- {agent} (cycle {cycle_id}): {}", truncate_inline(text, 200)))
            .collect();

        Ok(truncate(&lines.join("\n"), self.budget.open_questions))
    }
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

    #[test]
    fn empty_workspace_yields_empty_context() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let ctx = ContextBuilder::new(&store).build("ws").unwrap();
        assert_eq!(ctx.total_prior_cycles, 0);
        assert_eq!(ctx.render(), "");
    }

    #[test]
    fn truncate_respects_newline_boundary() {
        let text = "a".repeat(40) + "\n" + &"b".repeat(40);
        let truncated = truncate(&text, 50);
        assert!(truncated.contains("[...truncated for token budget]"));
        assert!(!truncated.contains('b'));
    }

    #[test]
    fn truncate_noop_under_budget() {
        assert_eq!(truncate("short text", 100), "short text");
    }
}
