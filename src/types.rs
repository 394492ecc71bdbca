//! Core data model: directions, evidence, cycle records, worker output.
//!
//! Mirrors `graph/models.py`'s `KnowledgeNode`/`Evidence` and
//! `agents/protocol.py`'s `SearchRecord`/`AgentOutput` from the source this
//! engine was distilled from, reshaped into tagged Rust records per spec §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a direction. `Killed` and `Merged` are terminal (I4):
/// such nodes are never returned by active listings and never re-activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionStatus {
    Active,
    Completed,
    Closed,
    Killed,
    Merged,
    Speculative,
}

impl DirectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Killed | Self::Merged)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for DirectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Closed => "closed",
            Self::Killed => "killed",
            Self::Merged => "merged",
            Self::Speculative => "speculative",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DirectionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "closed" => Ok(Self::Closed),
            "killed" => Ok(Self::Killed),
            "merged" => Ok(Self::Merged),
            "speculative" => Ok(Self::Speculative),
            other => Err(format!("unknown direction status: {other}")),
        }
    }
}

/// `kind` tag on a direction. Current model always writes `Direction`;
/// legacy kinds are migrated to it on schema upgrade (see `store::schema`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Direction,
    /// Legacy, pre-migration kinds. Never written by current code paths.
    Question,
    Hypothesis,
    Supporting,
    Opposing,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Direction => "direction",
            Self::Question => "question",
            Self::Hypothesis => "hypothesis",
            Self::Supporting => "supporting",
            Self::Opposing => "opposing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "direction" => Ok(Self::Direction),
            "question" => Ok(Self::Question),
            "hypothesis" => Ok(Self::Hypothesis),
            "supporting" => Ok(Self::Supporting),
            "opposing" => Ok(Self::Opposing),
            other => Err(format!("unknown node kind: {other}")),
        }
    }
}

/// A (text, source) pair attached to a direction, optionally witnessed by
/// one or more agents independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub text: String,
    pub source: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub verified_by: Vec<String>,
}

impl Evidence {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            observed_at: Utc::now(),
            verified_by: Vec::new(),
        }
    }

    pub fn with_verifier(mut self, agent: impl Into<String>) -> Self {
        self.verified_by.push(agent.into());
        self
    }
}

/// A strategic research path: a graph node with a claim and supporting
/// evidence. See spec §3 Data Model for the full invariant list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Direction {
    pub id: Uuid,
    pub workspace_id: String,
    pub parent_id: Option<Uuid>,
    pub claim: String,
    pub description: Option<String>,
    pub confidence: f64,
    pub importance: f64,
    pub depth: u32,
    pub status: DirectionStatus,
    pub kind: NodeKind,
    pub children: Vec<Uuid>,
    pub tags: Vec<String>,
    pub evidence: Vec<Evidence>,
    pub source_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_cycle: i64,
    pub updated_by_cycle: i64,
}

impl Direction {
    /// Create a new root direction (no parent, depth 0) for bootstrapping
    /// an empty graph from the mission text (spec §4.9 step SELECTING).
    pub fn new_root(workspace_id: impl Into<String>, claim: impl Into<String>, cycle_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            parent_id: None,
            claim: claim.into(),
            description: None,
            confidence: 0.5,
            importance: 1.0,
            depth: 0,
            status: DirectionStatus::Active,
            kind: NodeKind::Direction,
            children: Vec::new(),
            tags: Vec::new(),
            evidence: Vec::new(),
            source_files: Vec::new(),
            created_at: now,
            updated_at: now,
            created_by_cycle: cycle_id,
            updated_by_cycle: cycle_id,
        }
    }

    /// Create a child direction under `parent`, per spec §4.8 create branch
    /// (`depth = parent.depth + 1`; see DESIGN.md Open Question #2).
    pub fn new_child(
        parent: &Direction,
        claim: impl Into<String>,
        confidence: f64,
        importance: f64,
        cycle_id: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: parent.workspace_id.clone(),
            parent_id: Some(parent.id),
            claim: claim.into(),
            description: None,
            confidence: confidence.clamp(0.0, 0.95),
            importance: importance.clamp(0.0, 1.0),
            depth: parent.depth + 1,
            status: DirectionStatus::Active,
            kind: NodeKind::Direction,
            children: Vec::new(),
            tags: Vec::new(),
            evidence: Vec::new(),
            source_files: Vec::new(),
            created_at: now,
            updated_at: now,
            created_by_cycle: cycle_id,
            updated_by_cycle: cycle_id,
        }
    }

    /// Staleness: hours since `updated_at`.
    pub fn staleness_hours(&self) -> f64 {
        (Utc::now() - self.updated_at).num_seconds() as f64 / 3600.0
    }

    pub fn kill(&mut self, reason: &str, cycle_id: i64) {
        self.status = DirectionStatus::Killed;
        self.tags.push(format!("killed:{reason}"));
        self.updated_at = Utc::now();
        self.updated_by_cycle = cycle_id;
    }

    pub fn mark_merged_into(&mut self, new_id: Uuid, cycle_id: i64) {
        self.status = DirectionStatus::Merged;
        self.tags.push(format!("merged_into:{new_id}"));
        self.updated_at = Utc::now();
        self.updated_by_cycle = cycle_id;
    }
}

/// Record of a single `web_search` tool call made by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub engine: String,
    pub timestamp: DateTime<Utc>,
    pub results_summary: String,
    pub urls_visited: Vec<String>,
}

/// Raw output from one research worker's tool-use loop (spec §4.7).
/// Intentionally carries raw text only, no structured findings list — the
/// legacy `note_finding`/`Finding` path is not implemented (DESIGN.md #7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub agent_name: String,
    pub model: String,
    pub raw_text: String,
    pub self_critique: String,
    pub searches_performed: Vec<SearchRecord>,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Set when the worker failed outright; `raw_text`/`self_critique` then
    /// carry the error message per spec §7 propagation policy.
    pub failed: bool,
}

/// A filename/content pair attached to a workspace and injected into
/// worker prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDocument {
    pub filename: String,
    pub content: String,
}

/// Per-workspace report regeneration bookkeeping (spec §3, behavior added
/// in SPEC_FULL.md §B).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportMetadata {
    pub regeneration_interval_secs: i64,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub markdown: Option<String>,
}

impl ReportMetadata {
    /// Whether a fresh report is due, per SPEC_FULL.md §B's "no newer
    /// report needed" fast path.
    pub fn needs_regeneration(&self) -> bool {
        match (self.last_generated_at, &self.markdown) {
            (Some(last), Some(_)) => {
                let elapsed = (Utc::now() - last).num_seconds();
                elapsed >= self.regeneration_interval_secs
            }
            _ => true,
        }
    }
}

/// Per-worker summary embedded in a `CycleRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub agent_name: String,
    pub model: String,
    pub role: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub searches_performed: Vec<SearchRecord>,
    pub raw_text: String,
    pub self_critique: String,
}

/// One end-to-end cycle execution record (spec §3 `CycleRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: i64,
    pub workspace_id: String,
    pub target_direction_id: Uuid,
    pub target_claim_snapshot: String,
    pub synthesis_reasoning: String,
    pub consensus_directions: Vec<String>,
    pub contradictions: Vec<String>,
    pub created_direction_ids: Vec<Uuid>,
    pub updated_direction_ids: Vec<Uuid>,
    pub skipped_count: u32,
    pub worker_outputs: Vec<WorkerSummary>,
    pub total_cost_usd: f64,
    pub lead_llm_cost_usd: f64,
    pub research_agents_cost_usd: f64,
    pub duration_seconds: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub failed_stage: Option<String>,
    pub selection_strategy: String,
    pub selection_reasoning: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(DirectionStatus::Killed.is_terminal());
        assert!(DirectionStatus::Merged.is_terminal());
        assert!(!DirectionStatus::Active.is_terminal());
        assert!(!DirectionStatus::Completed.is_terminal());
    }

    #[test]
    fn child_depth_is_parent_depth_plus_one() {
        let root = Direction::new_root("ws", "Understand the market", 0);
        let child = Direction::new_child(&root, "Segment: SMB buyers", 0.6, 0.7, 1);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id, Some(root.id));
    }

    #[test]
    fn report_needs_regeneration_when_never_generated() {
        let meta = ReportMetadata::default();
        assert!(meta.needs_regeneration());
    }

    #[test]
    fn report_skips_regeneration_within_interval() {
        let meta = ReportMetadata {
            regeneration_interval_secs: 3600,
            last_generated_at: Some(Utc::now()),
            markdown: Some("# Report".to_string()),
        };
        assert!(!meta.needs_regeneration());
    }
}
