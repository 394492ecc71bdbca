//! Merge component (spec §4.8): folds Lead-synthesized directions into the
//! graph against existing nodes (update-or-create), then deduplicates the
//! target's children that collided as near-identical siblings.
//!
//! Also carries the group-merge execution spec §4.2 names (`Merge`) but
//! that `similarity.rs::group_duplicate_children` only groups ids for —
//! combining evidence, reparenting children, and marking originals
//! `status=merged`.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lead::SynthesizedDirection;
use crate::propagation::evidence_to_confidence;
use crate::similarity::{find_similar, group_duplicate_children, longest_claim};
use crate::store::Store;
use crate::types::{Direction, Evidence};

/// Outcome counts from `merge_directions_into_graph`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Fold each Lead-synthesized direction into the graph: update the best
/// existing similar node if one is found under `target_node_id`, otherwise
/// create a new child of it (spec §4.8).
pub fn merge_directions_into_graph(
    store: &Store,
    directions: &[SynthesizedDirection],
    target_node_id: &Uuid,
    cycle_id: i64,
    similarity_threshold: f64,
    confidence_discount: f64,
) -> Result<MergeStats> {
    let target = store
        .get(target_node_id)?
        .ok_or_else(|| Error::store_invariant(format!("merge target {target_node_id} not found")))?;

    let mut stats = MergeStats::default();

    for direction in directions {
        if direction.claim.trim().is_empty() {
            stats.skipped += 1;
            continue;
        }

        let matches = find_similar(
            store,
            &target.workspace_id,
            &direction.claim,
            Some(target_node_id),
            similarity_threshold,
            5,
        )?;

        if let Some(best) = matches.into_iter().next() {
            update_with_direction(store, best.direction, direction, cycle_id, confidence_discount)?;
            stats.updated += 1;
        } else {
            create_from_direction(store, &target, direction, cycle_id, confidence_discount)?;
            stats.created += 1;
        }
    }

    Ok(stats)
}

fn update_with_direction(
    store: &Store,
    mut existing: Direction,
    direction: &SynthesizedDirection,
    cycle_id: i64,
    confidence_discount: f64,
) -> Result<()> {
    existing.evidence.push(
        Evidence::new(direction.evidence_summary.clone(), format!("lead_llm_synthesis_cycle_{cycle_id}"))
            .with_verifier(format!("lead_llm_cycle_{cycle_id}")),
    );

    // Independent-confirmation model: conf = 1 - (1-p1)(1-p2).
    let old_conf = existing.confidence;
    let new_conf = direction.confidence * confidence_discount;
    let combined = 1.0 - (1.0 - old_conf) * (1.0 - new_conf);
    existing.confidence = combined.min(0.95);

    if direction.claim.len() > existing.claim.len() {
        existing.claim = direction.claim.clone();
    }

    let description_is_richer = existing
        .description
        .as_ref()
        .map(|current| direction.description.len() > current.len())
        .unwrap_or(true);
    if !direction.description.is_empty() && description_is_richer {
        existing.description = Some(direction.description.clone());
    }

    existing.importance = existing.importance * 0.7 + direction.importance * 0.3;

    for tag in &direction.tags {
        if !existing.tags.contains(tag) {
            existing.tags.push(tag.clone());
        }
    }

    existing.updated_at = Utc::now();
    existing.updated_by_cycle = cycle_id;
    store.update(&existing)
}

fn create_from_direction(
    store: &Store,
    target: &Direction,
    direction: &SynthesizedDirection,
    cycle_id: i64,
    confidence_discount: f64,
) -> Result<()> {
    let initial_confidence = direction.confidence * confidence_discount;
    let mut new_node = Direction::new_child(target, direction.claim.clone(), initial_confidence, direction.importance, cycle_id);

    if !direction.description.is_empty() {
        new_node.description = Some(direction.description.clone());
    }
    new_node.tags = direction.tags.clone();
    new_node.evidence.push(
        Evidence::new(direction.evidence_summary.clone(), format!("lead_llm_synthesis_cycle_{cycle_id}"))
            .with_verifier(format!("lead_llm_cycle_{cycle_id}")),
    );

    store.create(&new_node)
}

/// Execute a group merge (spec §4.2 `Merge(ids, mergedClaim, cycleId)`):
/// union evidence across `node_ids`, reparent every member's children onto
/// the new node, and mark the originals `status=merged`. Returns the new
/// merged node.
pub fn execute_merge(store: &Store, node_ids: &[Uuid], merged_claim: &str, cycle_id: i64) -> Result<Direction> {
    if node_ids.len() < 2 {
        return Err(Error::store_invariant("must provide at least 2 nodes to merge"));
    }

    let mut nodes = Vec::new();
    for id in node_ids {
        if let Some(node) = store.get(id)? {
            nodes.push(node);
        }
    }
    if nodes.is_empty() {
        return Err(Error::store_invariant("no valid nodes found to merge"));
    }

    let base = nodes[0].clone();

    let mut all_evidence: Vec<Evidence> = Vec::new();
    let mut all_sources: Vec<String> = Vec::new();
    for node in &nodes {
        all_evidence.extend(node.evidence.clone());
        all_sources.extend(node.source_files.clone());
    }
    all_sources.sort();
    all_sources.dedup();

    let merged_confidence = evidence_to_confidence(&all_evidence);
    let merged_importance = nodes.iter().map(|n| n.importance).fold(0.0_f64, f64::max);
    let merged_depth = nodes.iter().map(|n| n.depth).max().unwrap_or(base.depth);

    let mut merged_node = Direction::new_root(base.workspace_id.clone(), merged_claim, cycle_id);
    merged_node.parent_id = base.parent_id;
    merged_node.depth = merged_depth;
    merged_node.confidence = merged_confidence;
    merged_node.importance = merged_importance;
    merged_node.evidence = all_evidence;
    merged_node.source_files = all_sources;
    merged_node.tags = std::iter::once("merged".to_string()).chain(base.tags.iter().cloned()).collect();
    store.create(&merged_node)?;

    for node in &nodes {
        for child in store.get_children(&node.id)? {
            store.reparent(&child.id, &merged_node.id, cycle_id)?;
        }
    }

    for mut node in nodes {
        node.mark_merged_into(merged_node.id, cycle_id);
        store.update(&node)?;
    }

    Ok(merged_node)
}

/// Deduplicate `parent_id`'s children (spec §4.2 `DeduplicateChildren`):
/// group near-identical siblings, merge each group via `execute_merge`
/// using the longest claim as the merged claim. Returns the number of
/// nodes folded away (group size minus one, summed across groups).
pub fn deduplicate_children(store: &Store, parent_id: &Uuid, cycle_id: i64, similarity_threshold: f64) -> Result<usize> {
    let children = store.get_children(parent_id)?;
    if children.len() < 2 {
        return Ok(0);
    }

    let groups = group_duplicate_children(&children, similarity_threshold);
    let mut merged_count = 0;

    for group in groups {
        let claims: Vec<&str> = group
            .iter()
            .filter_map(|id| children.iter().find(|c| &c.id == id).map(|c| c.claim.as_str()))
            .collect();
        let Some(merged_claim) = longest_claim(claims) else {
            continue;
        };
        let merged_claim = merged_claim.to_string();

        execute_merge(store, &group, &merged_claim, cycle_id)?;
        merged_count += group.len() - 1;
    }

    Ok(merged_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DirectionStatus;

    fn synthesized(claim: &str, description: &str, confidence: f64, importance: f64) -> SynthesizedDirection {
        SynthesizedDirection {
            claim: claim.to_string(),
            description: description.to_string(),
            stance: "mixed".to_string(),
            direction_outcome: "pursue".to_string(),
            confidence,
            importance,
            reasoning: "r".to_string(),
            evidence_summary: "evidence".to_string(),
            tags: vec!["tag-a".to_string()],
        }
    }

    #[test]
    fn merge_creates_new_child_when_no_similar_node_exists() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let target = Direction::new_root("ws", "target claim", 0);
        store.create(&target).unwrap();

        let directions = vec![synthesized("Totally unrelated fresh direction", "desc", 0.8, 0.9)];
        let stats = merge_directions_into_graph(&store, &directions, &target.id, 1, 0.75, 0.7).unwrap();

        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 0);

        let children = store.get_children(&target.id).unwrap();
        assert_eq!(children.len(), 1);
        assert!((children[0].confidence - 0.8 * 0.7).abs() < 1e-9);
        assert_eq!(children[0].depth, 1);
    }

    #[test]
    fn merge_updates_existing_similar_child_instead_of_creating() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let target = Direction::new_root("ws", "target claim", 0);
        store.create(&target).unwrap();

        let existing = Direction::new_child(&target, "the market favors smb buyers heavily", 0.4, 0.5, 0);
        store.create(&existing).unwrap();

        let directions = vec![synthesized("the market favors smb buyers strongly", "desc", 0.7, 0.8)];
        let stats = merge_directions_into_graph(&store, &directions, &target.id, 1, 0.6, 0.7).unwrap();

        assert_eq!(stats.updated, 1);
        assert_eq!(stats.created, 0);

        let children = store.get_children(&target.id).unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].confidence > existing.confidence);
        assert_eq!(children[0].evidence.len(), 1);
    }

    #[test]
    fn execute_merge_reparents_children_and_marks_originals_merged() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let parent = Direction::new_root("ws", "parent", 0);
        store.create(&parent).unwrap();

        let a = Direction::new_child(&parent, "claim a", 0.5, 0.5, 0);
        let b = Direction::new_child(&parent, "claim b is a longer claim", 0.5, 0.5, 0);
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        let grandchild = Direction::new_child(&a, "grandchild under a", 0.5, 0.5, 0);
        store.create(&grandchild).unwrap();

        let merged = execute_merge(&store, &[a.id, b.id], "claim b is a longer claim", 1).unwrap();

        let refreshed_a = store.get(&a.id).unwrap().unwrap();
        let refreshed_b = store.get(&b.id).unwrap().unwrap();
        assert_eq!(refreshed_a.status, DirectionStatus::Merged);
        assert_eq!(refreshed_b.status, DirectionStatus::Merged);
        assert!(refreshed_a.tags.iter().any(|t| t == &format!("merged_into:{}", merged.id)));

        let refreshed_grandchild = store.get(&grandchild.id).unwrap().unwrap();
        assert_eq!(refreshed_grandchild.parent_id, Some(merged.id));
    }

    #[test]
    fn deduplicate_children_merges_near_identical_siblings() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let parent = Direction::new_root("ws", "parent", 0);
        store.create(&parent).unwrap();

        let c1 = Direction::new_child(&parent, "the market favors smb buyers heavily", 0.5, 0.5, 0);
        let c2 = Direction::new_child(&parent, "the market favors smb buyers strongly", 0.5, 0.5, 0);
        let c3 = Direction::new_child(&parent, "totally unrelated enterprise sales claim", 0.5, 0.5, 0);
        store.create(&c1).unwrap();
        store.create(&c2).unwrap();
        store.create(&c3).unwrap();

        let merged_count = deduplicate_children(&store, &parent.id, 1, 0.6).unwrap();
        assert_eq!(merged_count, 1);

        let active_children = store
            .get_children(&parent.id)
            .unwrap()
            .into_iter()
            .filter(|c| c.status.is_active())
            .count();
        assert_eq!(active_children, 2);
    }

    #[test]
    fn execute_merge_requires_at_least_two_nodes() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let only = Direction::new_root("ws", "only", 0);
        store.create(&only).unwrap();

        assert!(execute_merge(&store, &[only.id], "claim", 1).is_err());
    }
}
