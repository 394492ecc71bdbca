//! Lead Protocol: the three stateless LLM calls that steer a cycle
//! (spec §4.6) — select which direction to pursue, synthesize worker
//! output into strategic directions, and reassess the target afterward.
//!
//! Every call is a single-shot `max_iterations=1`, `tools=[]` completion
//! whose response is a JSON object extracted from free text (the model is
//! asked to respond with ONLY JSON, but code fences and stray prose still
//! show up in practice). `extract_json_object` does that extraction with a
//! balanced-brace scan rather than a fixed-shape regex, so it keeps working
//! whether or not the object contains nested objects/arrays.

use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::store::Store;
use crate::types::{Direction, DirectionStatus, WorkerOutput};
use crate::views::{render_summary_view, render_weakest_n};

/// Cost/token accounting for a single Lead call, folded into the owning
/// `CycleRecord.lead_llm_cost_usd` by the caller.
#[derive(Debug, Clone, Default)]
pub struct LeadCallMetrics {
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result of `Lead::select`.
#[derive(Debug, Clone)]
pub struct SelectOutcome {
    pub target_id: Uuid,
    pub reasoning: String,
}

/// One direction extracted by `Lead::synthesize`.
#[derive(Debug, Clone)]
pub struct SynthesizedDirection {
    pub claim: String,
    pub description: String,
    pub stance: String,
    pub direction_outcome: String,
    pub confidence: f64,
    pub importance: f64,
    pub reasoning: String,
    pub evidence_summary: String,
    pub tags: Vec<String>,
}

/// Result of `Lead::synthesize`.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub directions: Vec<SynthesizedDirection>,
    pub synthesis_reasoning: String,
    pub consensus_directions: Vec<String>,
    pub contradictions: Vec<String>,
}

/// Result of `Lead::reassess`.
#[derive(Debug, Clone)]
pub struct ReassessmentOutcome {
    pub confidence: f64,
    pub importance: f64,
    pub status: DirectionStatus,
    pub reasoning: String,
}

/// The Lead LLM: one model, one system of prompts, no tools, no
/// conversational state carried between calls.
pub struct Lead<'a> {
    client: &'a dyn LLMClient,
    model: String,
    north_star: String,
}

impl<'a> Lead<'a> {
    pub fn new(client: &'a dyn LLMClient, model: impl Into<String>, north_star: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            north_star: north_star.into(),
        }
    }

    /// The mission statement this Lead was constructed with.
    pub fn north_star(&self) -> &str {
        &self.north_star
    }

    async fn call(&self, system_prompt: String, user_prompt: String) -> Result<(String, LeadCallMetrics)> {
        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(system_prompt)
            .with_message(ChatMessage::user(user_prompt));

        let response = self.client.complete(request).await?;
        let metrics = LeadCallMetrics {
            cost_usd: response.cost.unwrap_or(0.0),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        };
        Ok((response.content.trim().to_string(), metrics))
    }

    /// Build the system/user prompts a Research Worker dispatch needs for
    /// `target` (spec §4.9 DISPATCHING). Unlike `select`/`synthesize`/
    /// `reassess`, this does not call the model itself — dispatch is a
    /// multi-turn tool-use loop owned by `worker::Worker`, not a single-shot
    /// Lead call, so only the prompt construction lives here.
    pub fn dispatch_prompts(
        &self,
        store: &Store,
        target: &Direction,
        max_searches: u32,
        cycle_instruction: Option<&str>,
    ) -> Result<(String, String)> {
        let focused_view = crate::views::render_focused_view(store, &target.id, 3)?;
        let cycle_instruction_section = render_cycle_instruction(cycle_instruction);

        let system_prompt = format!(
            r#"You are a Research Worker investigating a direction for this mission:

{north_star}

## Research Guidelines

1. **Evidence-Based**: Ground every claim in something you found, not assumption.
2. **Multiple Sources**: Triangulate important claims across independent sources.
3. **Skeptical**: Actively look for disconfirming evidence, not just confirmation.
4. **Comprehensive**: Cover the direction from multiple angles before concluding.
5. **Budget**: You have up to {max_searches} searches this cycle. Use them deliberately.
6. **Stay broad enough**: Don't tunnel on the first source you find useful.
7. **Align with user steering**: If a cycle override instruction is present, prioritize it.

## Important Changes

- There is no structured findings tool. Your raw research output IS the primary artifact
  a synthesis step will read — write it as a clear, well-organized narrative.
- Focus on quality of reasoning and evidence over exhaustive coverage.

## Tools Available

- `web_search`: search the web
- `web_fetch`: fetch a URL and read its content as Markdown
- `read_graph_node`: read one knowledge-graph direction by id
- `search_graph`: full-text search the knowledge graph for related directions
{cycle_instruction_section}"#,
            north_star = self.north_star,
            max_searches = max_searches,
            cycle_instruction_section = cycle_instruction_section,
        );

        let user_prompt = format!(
            r#"## Research Direction

{focused_view}

## Your Research Task

Investigate this direction thoroughly. Use your tools to search the web and read the
knowledge graph as needed. Write up your findings as a clear narrative: what you found,
how confident you are in each claim, what remains uncertain, and what a skeptical reader
would want to double-check.

When you are done researching, write your final answer as that narrative (no tool calls
in your last turn).
"#
        );

        Ok((system_prompt, user_prompt))
    }

    /// Select the next direction to pursue (spec §4.6.1).
    pub async fn select(
        &self,
        store: &Store,
        workspace_id: &str,
        excluded: &HashSet<Uuid>,
        last_selected: Option<Uuid>,
        cycle_instruction: Option<&str>,
        report_excerpt: Option<&str>,
    ) -> Result<(SelectOutcome, LeadCallMetrics)> {
        let all_nodes = store.get_active(workspace_id)?;
        if all_nodes.is_empty() {
            return Err(Error::store_invariant("no active nodes in graph - cannot select direction"));
        }

        let candidates: Vec<&Direction> = all_nodes.iter().filter(|d| !excluded.contains(&d.id)).collect();
        if candidates.is_empty() {
            return Err(Error::store_invariant("no eligible active nodes remain after exclusions"));
        }

        let graph_summary = render_summary_view(store, workspace_id, 2, 50)?;
        let weakest_nodes = render_weakest_n(store, workspace_id, 10)?;

        let mut node_options = Vec::new();
        for node in candidates.iter().take(30) {
            let children_count = store.get_children(&node.id)?.len();
            node_options.push(format!(
                "- **{}**: {}\n  Conf: {:.2} | Imp: {:.2} | Depth: {} | Stale: {:.1}h | Children: {}",
                short_id(&node.id),
                preview(&node.claim, 100),
                node.confidence,
                node.importance,
                node.depth,
                node.staleness_hours(),
                children_count,
            ));
        }
        let node_list = node_options.join("\n");
        let cycle_instruction_section = render_cycle_instruction(cycle_instruction);

        let system_prompt = format!(
            r#"You are the Lead LLM orchestrating an autonomous research project:

{north_star}

Your role is to strategically select which direction to pursue next in the knowledge graph.
You have maximum autonomy - analyze the current state and make the best strategic decision.

## Priority Order

1. **Honor user steering first**:
   - If a cycle override instruction is present, align selection to that intent.
2. **Maintain balanced progress**:
   - Avoid tunnel vision on a single branch when credible alternatives remain unexplored.
3. **Maximize useful learning**:
   - Prefer choices that reduce key uncertainty and improve decision quality.

## Strategic Considerations

1. **Exploration vs Exploitation Balance**
   - Explore: Pursue directions with low depth and few children (breadth)
   - Exploit: Deepen directions with low confidence but high importance (depth)
   - Keep a healthy portfolio across cycles instead of repeatedly selecting the same local area

2. **Confidence Gaps**
   - Prioritize directions with low confidence (<0.6) if they're important
   - Don't neglect high-confidence directions that might need challenging

3. **Staleness**
   - Consider refreshing stale directions (>72 hours)
   - Balance with pursuing new directions

4. **Research Momentum**
   - Build on recent progress where appropriate
   - Don't get stuck in local minima or repetitive deep dives

5. **Strategic Value**
   - Importance score reflects strategic relevance to mission
   - High importance, low confidence = high priority

6. **Concreteness Progression (Depth-Aware)**
   - Treat graph depth as a concreteness ladder:
     - Depth 0: strategic thesis
     - Depth 1: wedge + segment
     - Depth 2: buyer/workflow + measurable pain
     - Depth 3+: concrete targets, procurement path, integration/feasibility specifics
   - If the graph already has many sibling branches, prefer selecting leaf/near-leaf nodes to refine concreteness
   - Avoid repeatedly selecting high-level nodes when deeper unresolved nodes exist in that branch
{cycle_instruction_section}

## Output Format

Respond with ONLY this JSON structure:
{{
  "selected_node_id": "abc123...",
  "reasoning": "2-3 sentences explaining why this direction is the best strategic choice right now"
}}
"#,
            north_star = self.north_star,
            cycle_instruction_section = cycle_instruction_section,
        );

        let report_section = report_excerpt
            .map(|r| format!("\n## Current Research Report\n\n{}\n", preview(r, 2000)))
            .unwrap_or_default();

        let last_selected_section = match last_selected.and_then(|id| store.get(&id).ok().flatten()) {
            Some(node) => format!(
                "\n## Last Selected Direction\n\n**{}**\n(ID: {})\n\nConsider whether to continue building on this or pivot to a different direction.\n",
                preview(&node.claim, 100),
                node.id,
            ),
            None => String::new(),
        };

        let excluded_section = if excluded.is_empty() {
            String::new()
        } else {
            let mut ids: Vec<String> = excluded.iter().map(|id| id.to_string()).collect();
            ids.sort();
            ids.truncate(30);
            let list = ids.iter().map(|id| format!("- {id}")).collect::<Vec<_>>().join("\n");
            format!("\n## Excluded Directions (Do Not Select)\n\n{list}\n")
        };

        let user_prompt = format!(
            r#"## Graph State

{graph_summary}

## Priority Directions

{weakest_nodes}

## All Available Directions

{node_list}
{report_section}{last_selected_section}{excluded_section}
---

Analyze the graph state and select the best direction to pursue next.
Consider exploration/exploitation balance, confidence gaps, staleness, and strategic value.

Respond with ONLY the JSON structure specified (no markdown, no explanation outside JSON).
"#
        );

        let (raw_text, metrics) = self.call(system_prompt, user_prompt).await?;

        let fallback = |reason: String| SelectOutcome {
            target_id: candidates[0].id,
            reasoning: format!("Fallback selection ({reason})"),
        };

        let Some(parsed) = extract_json_object(&raw_text) else {
            return Ok((fallback("Lead LLM response parse failed".to_string()), metrics));
        };

        let selected_id_raw = parsed.get("selected_node_id").and_then(Value::as_str);
        let reasoning = parsed
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let Some(selected_id_raw) = selected_id_raw else {
            return Ok((fallback("Lead LLM response parse failed".to_string()), metrics));
        };

        let resolved = resolve_node_id(selected_id_raw, &all_nodes);

        let outcome = match resolved {
            Some(target) if excluded.contains(&target.id) => {
                fallback(format!("excluded ID: {selected_id_raw}"))
            }
            Some(target) => SelectOutcome {
                target_id: target.id,
                reasoning,
            },
            None => fallback(format!("invalid ID: {selected_id_raw}")),
        };

        Ok((outcome, metrics))
    }

    /// Synthesize worker raw outputs into strategic directions (spec §4.6.2).
    pub async fn synthesize(
        &self,
        target: &Direction,
        worker_outputs: &[WorkerOutput],
        cycle_instruction: Option<&str>,
    ) -> Result<(SynthesisOutcome, LeadCallMetrics)> {
        let mut formatted_outputs = String::new();
        for (i, output) in worker_outputs.iter().enumerate() {
            formatted_outputs.push_str(&format!(
                "## Research Agent {}: {}\n\n**Searches**: {} searches performed\n**Duration**: {:.1}s\n**Cost**: ${:.4}\n\n### Research Output:\n\n{}\n\n### Self-Critique:\n\n{}\n\n---\n\n",
                i + 1,
                output.agent_name,
                output.searches_performed.len(),
                output.duration_seconds,
                output.cost_usd,
                output.raw_text,
                output.self_critique,
            ));
        }

        let cycle_instruction_section = render_cycle_instruction(cycle_instruction);

        let system_prompt = format!(
            r#"You are the Lead LLM synthesizing research for:

{north_star}

Multiple research agents investigated a direction independently. You will receive their
raw outputs and must extract strategic DIRECTIONS to pursue next.

## What Are Directions?

Directions are meaningful paths to explore - NOT individual facts. Examples:
- "Investigate B2B vs B2C market fit for legal tech startups"
- "Explore funding strategies: VC vs bootstrapping vs strategic partnerships"
- "Analyze competitive advantages in the AI-powered contract review space"

NOT directions (too granular):
- "Legal tech market is $50B" (this is just a fact)
- "YC funded 10 legal tech companies" (just a data point)

## Synthesis Guidelines

1. **Extract Directions**:
   - Look for strategic questions, approaches, or hypotheses
   - Group related findings into coherent directions
   - Each direction should suggest a path of inquiry
   - For each direction, provide:
     - `claim`: concise one-line summary
     - `description`: long-form Markdown narrative (at least 220 words; target 350-700 words)
       - Use Markdown structure with short sections and bullets where helpful
       - Preserve meaningful line breaks between sections/points
       - Include concrete items: context, key evidence, assumptions/risks, and executable next actions
     - `stance`: one of:
       - `support`: evidence supports this direction claim
       - `mixed`: evidence is mixed/uncertain
       - `disconfirm`: evidence undermines this direction claim
     - `direction_outcome`: one of:
       - `pursue`: keep active for future investigation
       - `complete`: treat as sufficiently concluded/dead-end for now
   - Prefer deepening or revising existing strategic paths when evidence supports that
   - Propose genuinely new branches only when current evidence indicates clear unexplored opportunity
   - Do not branch for its own sake; avoid direction inflation
   - Preserve depth-wise progression: child directions should usually be more concrete than the target direction

2. **Concreteness Ladder (By Target Depth)**:
   - If target depth is 0, output should trend toward wedge/segment specificity
   - If target depth is 1, output should trend toward buyer/workflow and measurable pains
   - If target depth is 2, output should trend toward concrete accounts/companies and deployment constraints
   - If target depth is 3+, output should trend toward execution-ready specificity
   - Avoid lateral rewording at the same abstraction level unless evidence is explicitly contradictory

3. **Assess Confidence**:
   - Interpret confidence as confidence in THIS direction claim.
   - High (0.8-1.0): Strong corroboration for the claim
   - Medium (0.5-0.7): Mixed but direction still plausible
   - Low (0.0-0.4): Weak or contradictory support for this claim
   - If stance is `disconfirm`, confidence should usually be low unless disconfirmation itself is strongly evidenced.

4. **Determine Importance**:
   - High (0.8-1.0): Critical to mission, high impact
   - Medium (0.5-0.7): Relevant, moderate impact
   - Low (0.0-0.4): Tangential, low impact

5. **Identify Consensus**:
   - What did multiple agents agree on?
   - Where is there strong corroboration?

6. **Spot Contradictions**:
   - What disagreements exist?
   - Which claims conflict?
   - If most evidence is negative against a direction claim, label stance=`disconfirm` and prefer direction_outcome=`complete`

7. **Respect User Steering**:
   - If a cycle override instruction is present, bias synthesis priorities to that instruction
   - Keep conclusions evidence-grounded and avoid overfitting to a single narrative
{cycle_instruction_section}

8. **Branching Discipline**:
   - You are not required to create multiple new directions every cycle
   - It is valid to return a small set of focused directions if that best reflects the evidence
   - Prioritize clarity and strategic utility over quantity

9. **Next Actions Must Be Executable**:
   - In each direction description, the `## Next Actions` section must include ONLY actions
     that can be executed in a future cycle via web-based research.
   - Allowed action types:
     - Investigate a sub-direction with targeted web searches
     - Assess feasibility by reviewing academic papers, benchmarks, standards, docs, filings, or technical reports
     - Resolve contradictions across independent sources
     - Gather specific missing evidence needed to raise/lower confidence
   - Disallowed action types:
     - Talk to customers, interviews, surveys, or sales calls
     - Run product experiments, build prototypes, or engineering implementation
     - Hiring, partnerships, procurement, or other offline operational tasks
   - For each next action include:
     - Objective: what the research action should prove/disprove
     - Query seeds: 2-5 concrete web search query ideas
     - Source targets: what source types to prioritize
     - Completion signal: explicit evidence threshold for considering the action done

## Output Format

Respond with ONLY this JSON structure:
{{
  "directions": [
    {{
      "claim": "Short summary (one line, <=120 chars)",
      "description": "Markdown one-page narrative (target 350-700 words) with sections like ## Context, ## Evidence, ## Risks/Assumptions, ## Next Actions",
      "stance": "support|mixed|disconfirm",
      "direction_outcome": "pursue|complete",
      "confidence": 0.85,
      "importance": 0.9,
      "reasoning": "Why this direction matters and what it builds on",
      "evidence_summary": "Brief summary of supporting evidence",
      "tags": ["tag1", "tag2"]
    }}
  ],
  "synthesis_reasoning": "2-3 sentences on your synthesis approach",
  "consensus_directions": ["Direction 1", "Direction 2"],
  "contradictions": ["Contradiction 1", "Contradiction 2"]
}}

Be strategic - extract directions that move research forward, not just facts."#,
            north_star = self.north_star,
            cycle_instruction_section = cycle_instruction_section,
        );

        let user_prompt = format!(
            r#"## Target Direction Researched

**{claim}**

**Target Depth**: {depth}

## Raw Research Outputs

{formatted_outputs}

---

Analyze all outputs and extract strategic DIRECTIONS (not facts).
Identify consensus and contradictions.
Respond with ONLY the JSON structure (no markdown, no extra text).
"#,
            claim = target.claim,
            depth = target.depth,
        );

        let (raw_text, metrics) = self.call(system_prompt, user_prompt).await?;

        let outcome = parse_synthesis(&raw_text, &target.claim).unwrap_or_else(|reason| fallback_synthesis(&target.claim, &reason));

        Ok((outcome, metrics))
    }

    /// Reassess the target direction's confidence/importance/status after
    /// this cycle's research (spec §4.6.3).
    pub async fn reassess(
        &self,
        target: &Direction,
        worker_outputs: &[WorkerOutput],
        synthesis: &SynthesisOutcome,
    ) -> Result<(ReassessmentOutcome, LeadCallMetrics)> {
        let mut agent_summaries = Vec::new();
        for (i, output) in worker_outputs.iter().enumerate() {
            let raw_excerpt = preview(&output.raw_text, 1400);
            let critique_excerpt = if output.self_critique.is_empty() {
                String::new()
            } else {
                preview(&output.self_critique, 400)
            };
            agent_summaries.push(format!(
                "## Agent {}: {}\n- Searches: {}\n- Cost: ${:.4}\n- Raw excerpt:\n{}\n\n- Self-critique:\n{}\n",
                i + 1,
                output.agent_name,
                output.searches_performed.len(),
                output.cost_usd,
                raw_excerpt,
                critique_excerpt,
            ));
        }

        let directions_preview = synthesis
            .directions
            .iter()
            .take(12)
            .map(|d| format!("- {} (conf={:.2}, imp={:.2})", d.claim, d.confidence, d.importance))
            .collect::<Vec<_>>()
            .join("\n");

        let consensus_preview = if synthesis.consensus_directions.is_empty() {
            "- none".to_string()
        } else {
            synthesis
                .consensus_directions
                .iter()
                .take(10)
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let contradiction_preview = if synthesis.contradictions.is_empty() {
            "- none".to_string()
        } else {
            synthesis
                .contradictions
                .iter()
                .take(10)
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let system_prompt = format!(
            r#"You are the Lead LLM for this research mission:

{north_star}

You must reassess ONE target direction after a completed research cycle.

Rules:
- Use only the provided cycle evidence and synthesis.
- Provide direct judgment (no averaging formula, no blending instructions).
- Keep scores in [0.0, 1.0].
- Confidence reflects how strongly the direction is now validated.
- Importance reflects strategic relevance to the mission now.
- Choose exactly ONE strategic action for this target:
  - diverge: keep this direction active and branch into additional related directions
  - deepen: keep this direction active and continue focused investigation on this same path
  - close: this path is a dead end or sufficiently concluded for now; mark as completed
- Decide lifecycle status:
  - active: continue investing (for `diverge` or `deepen`)
  - completed: sufficiently answered / dead end for now (for `close`)
  - closed: not viable / low strategic value now

Return ONLY JSON:
{{
  "action": "diverge|deepen|close",
  "confidence": 0.0,
  "importance": 0.0,
  "status": "active|completed|closed",
  "reasoning": "2-4 sentences justifying the chosen action and updated scores."
}}"#,
            north_star = self.north_star,
        );

        let user_prompt = format!(
            r#"## Target Direction
- ID: {id}
- Claim: {claim}
- Previous confidence: {confidence:.2}
- Previous importance: {importance:.2}

## Synthesized Directions From This Cycle
{directions_preview}

## Consensus
{consensus_preview}

## Contradictions
{contradiction_preview}

## Agent Evidence Summary
{agent_evidence_summary}

Reassess the target direction and return ONLY the JSON schema.
You must choose one action: diverge, deepen, or close."#,
            id = target.id,
            claim = target.claim,
            confidence = target.confidence,
            importance = target.importance,
            directions_preview = if directions_preview.is_empty() { "- none".to_string() } else { directions_preview },
            agent_evidence_summary = agent_summaries.join("\n"),
        );

        let (raw_text, metrics) = self.call(system_prompt, user_prompt).await?;

        let outcome = parse_reassessment(&raw_text, target).unwrap_or_else(|reason| ReassessmentOutcome {
            confidence: target.confidence,
            importance: target.importance,
            status: target.status,
            reasoning: reason,
        });

        Ok((outcome, metrics))
    }
}

/// Render optional cycle-specific steering guidance.
fn render_cycle_instruction(cycle_instruction: Option<&str>) -> String {
    match cycle_instruction.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => format!(
            "\n## Cycle Override Instruction (Highest Priority This Cycle)\n\n{text}\n\n\
             This comes from user-provided steering for this cycle. \
             Honor it as the primary directive unless it conflicts with safety or factual integrity.\n"
        ),
        None => String::new(),
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

fn resolve_node_id<'a>(raw_id: &str, candidates: &'a [Direction]) -> Option<&'a Direction> {
    if let Ok(uuid) = raw_id.parse::<Uuid>() {
        if let Some(exact) = candidates.iter().find(|d| d.id == uuid) {
            return Some(exact);
        }
    }
    candidates.iter().find(|d| d.id.to_string().starts_with(raw_id))
}

fn parse_synthesis(raw_text: &str, target_claim: &str) -> std::result::Result<SynthesisOutcome, String> {
    let _ = target_claim;
    let Some(parsed) = extract_json_object(raw_text) else {
        return Err("Synthesis parse failed - using fallback direction".to_string());
    };

    let Some(raw_directions) = parsed.get("directions").and_then(Value::as_array) else {
        return Err("Synthesis parse failed - using fallback direction".to_string());
    };

    let mut directions = Vec::new();
    for dir_data in raw_directions {
        let description = dir_data
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if description.is_empty() {
            return Err("Synthesis parse error: direction description must be non-empty".to_string());
        }

        let claim = dir_data.get("claim").and_then(Value::as_str).ok_or("missing claim")?;
        let confidence = dir_data.get("confidence").and_then(Value::as_f64).ok_or("missing confidence")?;
        let importance = dir_data.get("importance").and_then(Value::as_f64).ok_or("missing importance")?;
        let reasoning = dir_data.get("reasoning").and_then(Value::as_str).ok_or("missing reasoning")?;
        let evidence_summary = dir_data
            .get("evidence_summary")
            .and_then(Value::as_str)
            .ok_or("missing evidence_summary")?;

        let mut stance = dir_data
            .get("stance")
            .and_then(Value::as_str)
            .unwrap_or("mixed")
            .trim()
            .to_lowercase();
        if !["support", "mixed", "disconfirm"].contains(&stance.as_str()) {
            stance = "mixed".to_string();
        }

        let outcome_present = dir_data.get("direction_outcome").is_some();
        let mut direction_outcome = dir_data
            .get("direction_outcome")
            .and_then(Value::as_str)
            .unwrap_or("pursue")
            .trim()
            .to_lowercase();
        if !["pursue", "complete"].contains(&direction_outcome.as_str()) {
            direction_outcome = "pursue".to_string();
        }
        if !outcome_present && stance == "disconfirm" {
            direction_outcome = "complete".to_string();
        }

        let tags = dir_data
            .get("tags")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        directions.push(SynthesizedDirection {
            claim: claim.to_string(),
            description: description.to_string(),
            stance,
            direction_outcome,
            confidence,
            importance,
            reasoning: reasoning.to_string(),
            evidence_summary: evidence_summary.to_string(),
            tags,
        });
    }

    let synthesis_reasoning = parsed
        .get("synthesis_reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let consensus_directions = parsed
        .get("consensus_directions")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let contradictions = parsed
        .get("contradictions")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Ok(SynthesisOutcome {
        directions,
        synthesis_reasoning,
        consensus_directions,
        contradictions,
    })
}

/// Comprehensive placeholder direction used when synthesis output cannot
/// be parsed: deliberately long because it stands in for an entire
/// cycle's worth of strategic guidance.
fn fallback_synthesis(target_claim: &str, reason: &str) -> SynthesisOutcome {
    let description = "This fallback direction is intentionally comprehensive because synthesis output \
         could not be parsed. The next cycle should restate the target direction and \
         establish the precise decision objective it informs, then enumerate the key \
         unknowns that currently block confident judgment. Research should map the \
         assumptions behind the current direction, identify which assumptions are most \
         fragile, and prioritize evidence collection that can falsify or confirm those \
         assumptions quickly. Include both supporting and contradicting signals from \
         independent sources, with explicit source quality assessment and recency checks. \
         Quantify where possible: market sizes, rates of change, comparative benchmarks, \
         and confidence intervals or uncertainty bounds when data quality is limited. \
         If contradictory claims appear, isolate the disagreement drivers such as scope \
         differences, stale data, or methodological inconsistencies, and propose targeted \
         queries to resolve each contradiction. The output should also define practical next \
         steps: what to test in the next cycle, what can be deprioritized, and which \
         conditions would justify re-scoring confidence or importance for this direction."
        .to_string();

    SynthesisOutcome {
        directions: vec![SynthesizedDirection {
            claim: format!("Continue investigating: {target_claim}"),
            description,
            stance: "mixed".to_string(),
            direction_outcome: "pursue".to_string(),
            confidence: 0.5,
            importance: 0.7,
            reasoning: format!("Fallback direction ({reason})"),
            evidence_summary: "Research agents completed investigation but synthesis failed to parse".to_string(),
            tags: Vec::new(),
        }],
        synthesis_reasoning: reason.to_string(),
        consensus_directions: Vec::new(),
        contradictions: Vec::new(),
    }
}

fn parse_reassessment(raw_text: &str, target: &Direction) -> std::result::Result<ReassessmentOutcome, String> {
    let Some(parsed) = extract_json_object(raw_text) else {
        return Err("Reassessment parse failed; retained previous scores.".to_string());
    };

    let action = parsed
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    let confidence = parsed.get("confidence").and_then(Value::as_f64);
    let importance = parsed.get("importance").and_then(Value::as_f64);
    let (Some(confidence), Some(importance)) = (confidence, importance) else {
        return Err("Reassessment parse failed; retained previous scores.".to_string());
    };

    let mut status_str = parsed
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(&target.status.to_string())
        .trim()
        .to_lowercase();
    let reasoning = parsed
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let confidence = confidence.clamp(0.0, 1.0);
    let importance = importance.clamp(0.0, 1.0);

    if action == "close" {
        status_str = "completed".to_string();
    }

    let status = match status_str.parse::<DirectionStatus>() {
        Ok(DirectionStatus::Active) => DirectionStatus::Active,
        Ok(DirectionStatus::Completed) => DirectionStatus::Completed,
        Ok(DirectionStatus::Closed) => DirectionStatus::Closed,
        _ => target.status,
    };

    Ok(ReassessmentOutcome {
        confidence,
        importance,
        status,
        reasoning,
    })
}

/// Extract the first JSON object from free text, tolerating markdown code
/// fences and leading/trailing prose: scans for `{`, balances braces
/// (respecting string literals and escapes), and tries to parse the
/// resulting substring as an object. Advances to the next `{` on failure.
fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;

    while let Some(open_offset) = bytes[start..].iter().position(|&b| b == b'{') {
        let open = start + open_offset;
        if let Some(end) = find_matching_brace(bytes, open) {
            let candidate = &text[open..=end];
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                return Some(Value::Object(map));
            }
        }
        start = open + 1;
    }

    None
}

fn find_matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    struct StubClient {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<crate::llm::CompletionResponse> {
            let content = self.responses.lock().unwrap().remove(0);
            Ok(crate::llm::CompletionResponse {
                id: "id".to_string(),
                model: "stub".to_string(),
                content,
                stop_reason: Some(crate::llm::StopReason::EndTurn),
                usage: crate::llm::TokenUsage::default(),
                timestamp: Utc::now(),
                cost: Some(0.001),
                tool_calls: Vec::new(),
            })
        }

        fn provider(&self) -> crate::llm::Provider {
            crate::llm::Provider::OpenRouter
        }

        fn available_models(&self) -> Vec<crate::llm::ModelSpec> {
            Vec::new()
        }
    }

    fn worker_output(text: &str) -> WorkerOutput {
        WorkerOutput {
            agent_name: "agent-1".to_string(),
            model: "m".to_string(),
            raw_text: text.to_string(),
            self_critique: "none".to_string(),
            searches_performed: Vec::new(),
            cost_usd: 0.01,
            duration_seconds: 1.0,
            total_tokens: 10,
            input_tokens: 5,
            output_tokens: 5,
            failed: false,
        }
    }

    #[test]
    fn extract_json_object_handles_nested_objects_and_prose() {
        let text = "Here you go:\n```json\n{\"directions\": [{\"claim\": \"a\", \"nested\": {\"x\": 1}}], \"synthesis_reasoning\": \"ok\"}\n```\nthanks";
        let parsed = extract_json_object(text).unwrap();
        assert!(parsed.get("directions").is_some());
    }

    #[test]
    fn extract_json_object_returns_none_for_plain_text() {
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn extract_json_object_skips_malformed_candidate_and_finds_next() {
        let text = "{not json} then {\"selected_node_id\": \"abc\", \"reasoning\": \"why\"}";
        let parsed = extract_json_object(text).unwrap();
        assert_eq!(parsed["selected_node_id"], "abc");
    }

    #[tokio::test]
    async fn select_resolves_exact_and_prefix_ids() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let root = Direction::new_root("ws", "root claim", 0);
        store.create(&root).unwrap();

        let prefix = short_id(&root.id);
        let response = format!("{{\"selected_node_id\": \"{prefix}\", \"reasoning\": \"best bet\"}}");
        let client = StubClient { responses: Mutex::new(vec![response]) };
        let lead = Lead::new(&client, "model", "mission");

        let (outcome, _) = lead
            .select(&store, "ws", &HashSet::new(), None, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.target_id, root.id);
        assert_eq!(outcome.reasoning, "best bet");
    }

    #[tokio::test]
    async fn select_falls_back_on_excluded_id() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let root = Direction::new_root("ws", "root claim", 0);
        store.create(&root).unwrap();
        let child = Direction::new_child(&root, "child claim", 0.5, 0.5, 1);
        store.create(&child).unwrap();

        let response = format!("{{\"selected_node_id\": \"{}\", \"reasoning\": \"x\"}}", root.id);
        let client = StubClient { responses: Mutex::new(vec![response]) };
        let lead = Lead::new(&client, "model", "mission");

        let mut excluded = HashSet::new();
        excluded.insert(root.id);

        let (outcome, _) = lead.select(&store, "ws", &excluded, None, None, None).await.unwrap();
        assert_eq!(outcome.target_id, child.id);
        assert!(outcome.reasoning.starts_with("Fallback selection"));
    }

    #[tokio::test]
    async fn select_errors_when_graph_is_empty() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let client = StubClient { responses: Mutex::new(vec![]) };
        let lead = Lead::new(&client, "model", "mission");

        let result = lead.select(&store, "ws", &HashSet::new(), None, None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn synthesize_parses_directions_and_defaults_outcome_from_stance() {
        let target = Direction::new_root("ws", "target claim", 0);
        let response = r#"{"directions": [{"claim": "a claim", "description": "a full description of the direction", "stance": "disconfirm", "confidence": 0.2, "importance": 0.4, "reasoning": "r", "evidence_summary": "e", "tags": []}], "synthesis_reasoning": "done", "consensus_directions": [], "contradictions": []}"#.to_string();
        let client = StubClient { responses: Mutex::new(vec![response]) };
        let lead = Lead::new(&client, "model", "mission");

        let (outcome, _) = lead
            .synthesize(&target, &[worker_output("raw findings")], None)
            .await
            .unwrap();
        assert_eq!(outcome.directions.len(), 1);
        assert_eq!(outcome.directions[0].direction_outcome, "complete");
    }

    #[tokio::test]
    async fn synthesize_falls_back_on_empty_description() {
        let target = Direction::new_root("ws", "target claim", 0);
        let response = r#"{"directions": [{"claim": "a", "description": "", "confidence": 0.2, "importance": 0.4, "reasoning": "r", "evidence_summary": "e"}]}"#.to_string();
        let client = StubClient { responses: Mutex::new(vec![response]) };
        let lead = Lead::new(&client, "model", "mission");

        let (outcome, _) = lead
            .synthesize(&target, &[worker_output("raw findings")], None)
            .await
            .unwrap();
        assert_eq!(outcome.directions.len(), 1);
        assert!(outcome.directions[0].claim.starts_with("Continue investigating"));
    }

    #[tokio::test]
    async fn reassess_maps_close_action_to_completed_status() {
        let mut target = Direction::new_root("ws", "target claim", 0);
        target.confidence = 0.4;
        target.importance = 0.6;
        let response = r#"{"action": "close", "confidence": 0.3, "importance": 0.5, "status": "active", "reasoning": "done"}"#.to_string();
        let client = StubClient { responses: Mutex::new(vec![response]) };
        let lead = Lead::new(&client, "model", "mission");

        let synthesis = SynthesisOutcome {
            directions: Vec::new(),
            synthesis_reasoning: String::new(),
            consensus_directions: Vec::new(),
            contradictions: Vec::new(),
        };

        let (outcome, _) = lead
            .reassess(&target, &[worker_output("raw")], &synthesis)
            .await
            .unwrap();
        assert_eq!(outcome.status, DirectionStatus::Completed);
        assert!((outcome.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reassess_retains_previous_scores_on_parse_failure() {
        let mut target = Direction::new_root("ws", "target claim", 0);
        target.confidence = 0.4;
        target.importance = 0.6;
        let client = StubClient { responses: Mutex::new(vec!["not json".to_string()]) };
        let lead = Lead::new(&client, "model", "mission");

        let synthesis = SynthesisOutcome {
            directions: Vec::new(),
            synthesis_reasoning: String::new(),
            consensus_directions: Vec::new(),
            contradictions: Vec::new(),
        };

        let (outcome, _) = lead
            .reassess(&target, &[worker_output("raw")], &synthesis)
            .await
            .unwrap();
        assert_eq!(outcome.confidence, 0.4);
        assert_eq!(outcome.status, target.status);
    }
}
