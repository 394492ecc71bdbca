//! Cycle Executor (spec §4.9): runs one research cycle against a single
//! target direction through the state sequence
//! `SELECTING -> DISPATCHING -> SYNTHESIZING -> MERGING -> REASSESSING ->
//! PERSISTING`, emitting lifecycle events at each step. Grounded on
//! `orchestrator/lead.py`'s control flow (the reference inlines this same
//! sequence directly in its orchestrator loop) plus spec §4.9's explicit
//! step list.
//!
//! The cycle mutex (at most one concurrent cycle per workspace) is owned by
//! `orchestrator.rs`, not here — this module assumes mutual exclusion has
//! already been arranged by its caller and just executes one cycle.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::Utc;
use uuid::Uuid;

use crate::error::Error;
use crate::events::EventEmitter;
use crate::lead::Lead;
use crate::merge::{deduplicate_children, merge_directions_into_graph};
use crate::propagation::{boost_confidence, CONSENSUS_BOOST};
use crate::store::Store;
use crate::tools::{SearchManager, WebFetcher};
use crate::types::{CycleRecord, Direction, WorkerSummary};
use crate::worker::{Worker, WorkerContext};

/// Everything one cycle execution needs. Borrowed for the duration of the
/// call; the orchestrator owns all of these for the engine's lifetime.
pub struct CycleConfig<'a> {
    pub store: &'a Store,
    pub workspace_id: &'a str,
    pub lead: &'a Lead<'a>,
    pub workers: &'a [Worker<'a>],
    pub search_manager: &'a SearchManager,
    pub web_fetcher: &'a dyn WebFetcher,
    pub events: &'a EventEmitter,
    /// Root directory raw worker transcripts are written under
    /// (`raw/{yyyy-mm-dd}/cycle_{k}.md`). `None` skips transcript writing.
    pub transcripts_dir: Option<&'a Path>,
    pub max_searches_per_cycle: u32,
    pub similarity_threshold: f64,
    pub dedup_threshold: f64,
    pub confidence_discount: f64,
}

/// One stage's failure: which step it happened in, and why.
struct StageError {
    stage: &'static str,
    message: String,
}

fn stage_err(stage: &'static str, message: impl Into<String>) -> StageError {
    StageError { stage, message: message.into() }
}

impl From<(&'static str, Error)> for StageError {
    fn from((stage, error): (&'static str, Error)) -> Self {
        stage_err(stage, error.to_string())
    }
}

/// Run a single cycle to completion (or failure). Never panics or
/// propagates an error past this boundary: a failed stage produces a
/// `CycleRecord` with `success = false` rather than an `Err`, matching
/// spec §4.9's FAILED terminal state.
pub async fn execute(
    config: &CycleConfig<'_>,
    cycle_id: i64,
    target_node_id: Option<Uuid>,
    cycle_instruction: Option<&str>,
    use_consensus: bool,
) -> CycleRecord {
    let started = std::time::Instant::now();
    let mut target_direction_id = Uuid::nil();
    let mut target_claim_snapshot = String::new();

    let outcome = run(
        config,
        cycle_id,
        target_node_id,
        cycle_instruction,
        use_consensus,
        started,
        &mut target_direction_id,
        &mut target_claim_snapshot,
    )
    .await;

    match outcome {
        Ok(record) => record,
        Err(stage_error) => {
            let record = CycleRecord {
                cycle_id,
                workspace_id: config.workspace_id.to_string(),
                target_direction_id,
                target_claim_snapshot,
                synthesis_reasoning: String::new(),
                consensus_directions: Vec::new(),
                contradictions: Vec::new(),
                created_direction_ids: Vec::new(),
                updated_direction_ids: Vec::new(),
                skipped_count: 0,
                worker_outputs: Vec::new(),
                total_cost_usd: 0.0,
                lead_llm_cost_usd: 0.0,
                research_agents_cost_usd: 0.0,
                duration_seconds: started.elapsed().as_secs_f64(),
                success: false,
                error_message: Some(stage_error.message.clone()),
                failed_stage: Some(stage_error.stage.to_string()),
                selection_strategy: "lead_select".to_string(),
                selection_reasoning: String::new(),
                created_at: Utc::now(),
            };
            let _ = config.store.save_cycle_record(&record);
            config.events.cycle_failed(cycle_id, stage_error.stage, &stage_error.message);
            record
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: &CycleConfig<'_>,
    cycle_id: i64,
    target_node_id: Option<Uuid>,
    cycle_instruction: Option<&str>,
    use_consensus: bool,
    started: std::time::Instant,
    target_direction_id: &mut Uuid,
    target_claim_snapshot: &mut String,
) -> Result<CycleRecord, StageError> {
    // ---- SELECTING ----
    config.events.cycle_step(cycle_id, "selecting");
    bootstrap_if_empty(config, cycle_id).map_err(|e| ("selecting", e))?;

    let mut select_cost_usd = 0.0;
    let (target_id, selection_strategy, selection_reasoning) = match target_node_id {
        Some(id) => {
            config
                .store
                .get(&id)
                .map_err(|e| ("selecting", e))?
                .ok_or_else(|| stage_err("selecting", format!("target node {id} not found")))?;
            (id, "explicit".to_string(), "Target supplied by caller".to_string())
        }
        None => {
            let (outcome, metrics) = config
                .lead
                .select(config.store, config.workspace_id, &HashSet::new(), None, cycle_instruction, None)
                .await
                .map_err(|e| ("selecting", e))?;
            select_cost_usd = metrics.cost_usd;
            (outcome.target_id, "lead_select".to_string(), outcome.reasoning)
        }
    };

    let target = config
        .store
        .get(&target_id)
        .map_err(|e| ("selecting", e))?
        .ok_or_else(|| stage_err("selecting", format!("selected node {target_id} vanished")))?;
    *target_direction_id = target.id;
    *target_claim_snapshot = target.claim.clone();
    config.events.cycle_started(cycle_id, Some(&target.id.to_string()));

    // ---- DISPATCHING ----
    config.events.cycle_step(cycle_id, "dispatching");
    let (system_prompt, user_prompt) = config
        .lead
        .dispatch_prompts(config.store, &target, config.max_searches_per_cycle, cycle_instruction)
        .map_err(|e| ("dispatching", e))?;

    for worker in config.workers {
        config.events.agent_started(cycle_id, worker.agent_name());
    }

    let worker_ctx = WorkerContext {
        store: config.store,
        workspace_id: config.workspace_id,
        search_manager: config.search_manager,
        web_fetcher: config.web_fetcher,
    };

    // Launch every worker's research loop concurrently and wait for all of
    // them — genuinely interleaved on this task rather than spawned threads,
    // since `Worker`/`WorkerContext` borrow from `config` and aren't `'static`.
    let futures = config.workers.iter().map(|worker| worker.run(&system_prompt, &user_prompt, &worker_ctx));
    let results = futures::future::join_all(futures).await;

    let mut outputs = Vec::new();
    for output in results {
        for search in &output.searches_performed {
            config.events.agent_search(cycle_id, &output.agent_name, &search.query);
        }
        config.events.agent_completed(cycle_id, &output.agent_name, output.cost_usd, output.failed);
        if !output.failed {
            outputs.push(output);
        }
    }

    if outputs.is_empty() {
        return Err(stage_err("dispatching", "all research agents failed"));
    }

    // ---- SYNTHESIZING ----
    config.events.cycle_step(cycle_id, "synthesizing");
    config.events.synthesis_started(cycle_id, outputs.len());
    let (synthesis, synth_metrics) = config
        .lead
        .synthesize(&target, &outputs, cycle_instruction)
        .await
        .map_err(|e| ("synthesizing", e))?;
    config
        .events
        .synthesis_completed(cycle_id, synthesis.consensus_directions.len(), synthesis.contradictions.len());

    // ---- MERGING ----
    config.events.cycle_step(cycle_id, "merging");
    let before_children: HashSet<Uuid> =
        config.store.get_children(&target.id).map_err(|e| ("merging", e))?.iter().map(|d| d.id).collect();

    let merge_stats = merge_directions_into_graph(
        config.store,
        &synthesis.directions,
        &target.id,
        cycle_id,
        config.similarity_threshold,
        config.confidence_discount,
    )
    .map_err(|e| ("merging", e))?;

    let after_children = config.store.get_children(&target.id).map_err(|e| ("merging", e))?;
    let mut created_ids = Vec::new();
    let mut updated_ids = Vec::new();
    for child in &after_children {
        if before_children.contains(&child.id) {
            updated_ids.push(child.id);
            config.events.node_updated(cycle_id, &child.id.to_string(), &child.claim);
        } else {
            created_ids.push(child.id);
            config.events.node_created(cycle_id, &child.id.to_string(), &child.claim);
        }
    }

    deduplicate_children(config.store, &target.id, cycle_id, config.dedup_threshold).map_err(|e| ("merging", e))?;

    // ---- REASSESSING ----
    config.events.cycle_step(cycle_id, "reassessing");
    let (reassessment, reassess_metrics) =
        config.lead.reassess(&target, &outputs, &synthesis).await.map_err(|e| ("reassessing", e))?;

    let mut refreshed_target = config
        .store
        .get(&target.id)
        .map_err(|e| ("reassessing", e))?
        .ok_or_else(|| stage_err("reassessing", format!("target {} vanished before reassessment", target.id)))?;
    refreshed_target.confidence = reassessment.confidence;
    refreshed_target.importance = reassessment.importance;
    refreshed_target.status = reassessment.status;
    refreshed_target.updated_at = Utc::now();
    refreshed_target.updated_by_cycle = cycle_id;
    config.store.update(&refreshed_target).map_err(|e| ("reassessing", e))?;

    // Independent workers reaching consensus boosts the target's confidence
    // beyond whatever Lead.Reassess already settled on (spec §4.3).
    if use_consensus && !synthesis.consensus_directions.is_empty() {
        boost_confidence(config.store, &refreshed_target.id, CONSENSUS_BOOST).map_err(|e| ("reassessing", e))?;
    }

    // ---- PERSISTING ----
    config.events.cycle_step(cycle_id, "persisting");
    let worker_summaries: Vec<WorkerSummary> = outputs
        .iter()
        .map(|o| WorkerSummary {
            agent_name: o.agent_name.clone(),
            model: o.model.clone(),
            role: "research".to_string(),
            input_tokens: o.input_tokens,
            output_tokens: o.output_tokens,
            cost_usd: o.cost_usd,
            searches_performed: o.searches_performed.clone(),
            raw_text: o.raw_text.clone(),
            self_critique: o.self_critique.clone(),
        })
        .collect();

    let research_agents_cost_usd: f64 = outputs.iter().map(|o| o.cost_usd).sum();
    let lead_llm_cost_usd = select_cost_usd + synth_metrics.cost_usd + reassess_metrics.cost_usd;

    write_transcript(config, cycle_id, &target, &outputs);

    let record = CycleRecord {
        cycle_id,
        workspace_id: config.workspace_id.to_string(),
        target_direction_id: target.id,
        target_claim_snapshot: target.claim.clone(),
        synthesis_reasoning: synthesis.synthesis_reasoning.clone(),
        consensus_directions: synthesis.consensus_directions.clone(),
        contradictions: synthesis.contradictions.clone(),
        created_direction_ids: created_ids,
        updated_direction_ids: updated_ids,
        skipped_count: merge_stats.skipped as u32,
        worker_outputs: worker_summaries,
        total_cost_usd: research_agents_cost_usd + lead_llm_cost_usd,
        lead_llm_cost_usd,
        research_agents_cost_usd,
        duration_seconds: started.elapsed().as_secs_f64(),
        success: true,
        error_message: None,
        failed_stage: None,
        selection_strategy,
        selection_reasoning,
        created_at: Utc::now(),
    };

    config.store.save_cycle_record(&record).map_err(|e| ("persisting", e))?;
    config.events.cycle_completed(cycle_id, record.total_cost_usd, record.duration_seconds);

    Ok(record)
}

/// Insert a root direction derived from the north-star's first sentence
/// when the workspace's graph is still empty. Only ever fires on a
/// workspace's very first cycle.
fn bootstrap_if_empty(config: &CycleConfig<'_>, cycle_id: i64) -> crate::error::Result<()> {
    if !config.store.get_active(config.workspace_id)?.is_empty() {
        return Ok(());
    }

    let north_star = config.lead.north_star();
    let first_sentence = north_star.split(['.', '\n']).next().unwrap_or(north_star).trim();
    let claim = if first_sentence.is_empty() { north_star.to_string() } else { first_sentence.to_string() };

    let root = Direction::new_root(config.workspace_id.to_string(), claim, cycle_id);
    config.store.create(&root)
}

/// Write the cycle's raw worker transcripts to
/// `raw/{yyyy-mm-dd}/cycle_{k}.md` under `transcripts_dir`, per spec §4.9
/// PERSISTING. Best-effort: a write failure is logged, not propagated —
/// losing a transcript must never fail an otherwise-successful cycle.
fn write_transcript(config: &CycleConfig<'_>, cycle_id: i64, target: &Direction, outputs: &[crate::types::WorkerOutput]) {
    let Some(root) = config.transcripts_dir else { return };

    let day_dir = root.join(Utc::now().format("%Y-%m-%d").to_string());
    if let Err(e) = fs::create_dir_all(&day_dir) {
        tracing::warn!(error = %e, "failed to create transcript directory");
        return;
    }

    let mut body = format!("# Cycle {cycle_id}\n\nTarget: {}\n\n", target.claim);
    for output in outputs {
        body.push_str(&format!(
            "## {}\n\n### Research Output\n\n{}\n\n### Self-Critique\n\n{}\n\n",
            output.agent_name, output.raw_text, output.self_critique
        ));
    }

    let path = day_dir.join(format!("cycle_{cycle_id}.md"));
    if let Err(e) = fs::write(&path, body) {
        tracing::warn!(error = %e, path = %path.display(), "failed to write cycle transcript");
    }
}
