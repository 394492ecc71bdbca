//! Orchestrator (spec §4.10): the top-level coordinator that owns the
//! cycle mutex, cumulative cost, cycle count, and runs the Cycle Executor
//! repeatedly. Grounded on `orchestrator/core.py`'s `Orchestrator` class,
//! which plays the same role around its own `ResearchCycle`.

use std::path::PathBuf;
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::lead::Lead;
use crate::store::Store;
use crate::tools::{SearchManager, WebFetcher};
use crate::types::CycleRecord;
use crate::worker::Worker;
use crate::{cycle, cycle::CycleConfig};

struct OrchestratorState {
    active_cycle_id: Option<i64>,
    cycle_count: i64,
    total_cost_usd: f64,
    cycle_history: Vec<CycleRecord>,
}

impl OrchestratorState {
    fn fresh() -> Self {
        Self { active_cycle_id: None, cycle_count: 0, total_cost_usd: 0.0, cycle_history: Vec::new() }
    }
}

/// Aggregate counters returned by `get_summary`, spec §4.10.
#[derive(Debug, Clone)]
pub struct OrchestratorSummary {
    pub cycle_count: i64,
    pub successful_cycles: i64,
    pub failed_cycles: i64,
    pub total_findings: i64,
    pub total_cost_usd: f64,
    pub agent_count: usize,
    pub north_star_preview: String,
}

impl OrchestratorSummary {
    /// Human-readable rendering matching the reference's multi-line summary.
    pub fn render(&self) -> String {
        format!(
            "Research Orchestrator Summary\n\
             ================================\n\
             Total Cycles: {} ({} successful, {} failed)\n\
             Total Findings: {} (created + updated)\n\
             Total Cost: ${:.4}\n\
             Agents: {}\n\
             North Star: {}\n",
            self.cycle_count,
            self.successful_cycles,
            self.failed_cycles,
            self.total_findings,
            self.total_cost_usd,
            self.agent_count,
            self.north_star_preview,
        )
    }
}

/// Releases the active-cycle flag when a cycle finishes, errors, or is
/// cancelled — a plain `Drop` runs even on future cancellation, which is
/// what makes this safe without holding the mutex across the whole
/// `.await` chain (spec §4.9's "acquire-release mutex held for the entire
/// cycle" is satisfied by the flag's lifetime, not by literally pinning
/// the `Mutex` guard across long-running awaits).
struct ActiveCycleGuard<'a> {
    state: &'a Mutex<OrchestratorState>,
}

impl Drop for ActiveCycleGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.active_cycle_id = None;
        }
    }
}

/// Coordinates research cycles against one workspace's graph.
pub struct Orchestrator<'a> {
    store: &'a Store,
    workspace_id: String,
    lead: Lead<'a>,
    workers: Vec<Worker<'a>>,
    search_manager: &'a SearchManager,
    web_fetcher: &'a dyn WebFetcher,
    events: EventEmitter,
    transcripts_dir: Option<PathBuf>,
    max_searches_per_cycle: u32,
    confidence_discount: f64,
    similarity_threshold: f64,
    dedup_threshold: f64,
    state: Mutex<OrchestratorState>,
}

impl<'a> Orchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a Store,
        workspace_id: impl Into<String>,
        lead: Lead<'a>,
        workers: Vec<Worker<'a>>,
        search_manager: &'a SearchManager,
        web_fetcher: &'a dyn WebFetcher,
        events: EventEmitter,
    ) -> Self {
        Self {
            store,
            workspace_id: workspace_id.into(),
            lead,
            workers,
            search_manager,
            web_fetcher,
            events,
            transcripts_dir: None,
            max_searches_per_cycle: 25,
            confidence_discount: 0.7,
            similarity_threshold: 0.75,
            dedup_threshold: 0.85,
            state: Mutex::new(OrchestratorState::fresh()),
        }
    }

    pub fn with_transcripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcripts_dir = Some(dir.into());
        self
    }

    pub fn with_max_searches_per_cycle(mut self, n: u32) -> Self {
        self.max_searches_per_cycle = n;
        self
    }

    pub fn with_confidence_discount(mut self, discount: f64) -> Self {
        self.confidence_discount = discount;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_dedup_threshold(mut self, threshold: f64) -> Self {
        self.dedup_threshold = threshold;
        self
    }

    /// Run a single research cycle. Fails only with
    /// `Error::cycle_already_running` if another cycle is already in
    /// flight for this orchestrator — the cycle itself never returns an
    /// `Err`, it records failure in the returned `CycleRecord` instead.
    pub async fn run_cycle(
        &self,
        target_node_id: Option<Uuid>,
        cycle_instruction: Option<&str>,
        use_consensus: bool,
    ) -> Result<CycleRecord> {
        let cycle_id = {
            let mut state = self.state.lock().unwrap();
            if let Some(active) = state.active_cycle_id {
                return Err(Error::cycle_already_running(active));
            }
            state.cycle_count += 1;
            let id = state.cycle_count;
            state.active_cycle_id = Some(id);
            id
        };
        let _guard = ActiveCycleGuard { state: &self.state };

        let config = CycleConfig {
            store: self.store,
            workspace_id: &self.workspace_id,
            lead: &self.lead,
            workers: &self.workers,
            search_manager: self.search_manager,
            web_fetcher: self.web_fetcher,
            events: &self.events,
            transcripts_dir: self.transcripts_dir.as_deref(),
            max_searches_per_cycle: self.max_searches_per_cycle,
            similarity_threshold: self.similarity_threshold,
            dedup_threshold: self.dedup_threshold,
            confidence_discount: self.confidence_discount,
        };

        let record = cycle::execute(&config, cycle_id, target_node_id, cycle_instruction, use_consensus).await;

        {
            let mut state = self.state.lock().unwrap();
            state.total_cost_usd += record.total_cost_usd;
            state.cycle_history.push(record.clone());
        }

        Ok(record)
    }

    /// Run `n` cycles back to back, auto-selecting a target each time.
    /// Stops early on the first failed cycle when `stop_on_error` is set.
    pub async fn run_cycles(&self, n: u32, use_consensus: bool, stop_on_error: bool) -> Result<Vec<CycleRecord>> {
        let mut results = Vec::new();
        for _ in 0..n {
            let record = self.run_cycle(None, None, use_consensus).await?;
            let failed = !record.success;
            results.push(record);
            if failed && stop_on_error {
                break;
            }
        }
        Ok(results)
    }

    /// Run cycles until the graph's average active-node confidence reaches
    /// `min_confidence`, or `max_cycles` is hit. The threshold is checked
    /// *before* each cycle, matching spec §4.10.
    pub async fn run_until_complete(
        &self,
        min_confidence: f64,
        max_cycles: u32,
        use_consensus: bool,
    ) -> Result<Vec<CycleRecord>> {
        let mut results = Vec::new();
        for _ in 0..max_cycles {
            if self.average_active_confidence()? >= min_confidence {
                break;
            }
            let record = self.run_cycle(None, None, use_consensus).await?;
            results.push(record);
        }
        Ok(results)
    }

    fn average_active_confidence(&self) -> Result<f64> {
        let nodes = self.store.get_active(&self.workspace_id)?;
        if nodes.is_empty() {
            return Ok(0.0);
        }
        Ok(nodes.iter().map(|n| n.confidence).sum::<f64>() / nodes.len() as f64)
    }

    /// Aggregate statistics across every cycle run so far.
    pub fn get_summary(&self) -> OrchestratorSummary {
        let state = self.state.lock().unwrap();
        let successful_cycles = state.cycle_history.iter().filter(|c| c.success).count() as i64;
        let failed_cycles = state.cycle_history.len() as i64 - successful_cycles;
        let total_findings: i64 = state
            .cycle_history
            .iter()
            .map(|c| c.created_direction_ids.len() as i64 + c.updated_direction_ids.len() as i64)
            .sum();

        OrchestratorSummary {
            cycle_count: state.cycle_count,
            successful_cycles,
            failed_cycles,
            total_findings,
            total_cost_usd: state.total_cost_usd,
            agent_count: self.workers.len(),
            north_star_preview: preview(self.lead.north_star(), 100),
        }
    }

    /// Clear in-memory counters. Never touches the graph itself.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = OrchestratorState::fresh();
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}
