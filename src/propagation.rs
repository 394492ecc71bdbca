//! Confidence propagation: evidence-derived confidence and tree-wide
//! recalculation.

use crate::error::Result;
use crate::store::Store;
use crate::types::{Direction, Evidence, NodeKind};
use uuid::Uuid;

/// Fixed per-evidence-item confidence weight.
const EVIDENCE_CONFIDENCE: f64 = 0.7;

/// Cap applied to any computed confidence: nothing is ever fully certain.
const CONFIDENCE_CAP: f64 = 0.95;

/// Confidence boost applied on independent consensus agreement (§4.3).
pub const CONSENSUS_BOOST: f64 = 0.15;

/// Independent-confirmation ("noisy-OR") confidence from a list of
/// evidence: `1 - product(1 - 0.7)` per item, capped at 0.95.
pub fn evidence_to_confidence(evidence: &[Evidence]) -> f64 {
    if evidence.is_empty() {
        return 0.0;
    }

    let mut unconfirmed = 1.0;
    for _ in evidence {
        unconfirmed *= 1.0 - EVIDENCE_CONFIDENCE;
    }

    (1.0 - unconfirmed).min(CONFIDENCE_CAP)
}

/// Legacy hypothesis support/oppose ratio: `supporting / (supporting +
/// opposing)`, clamped to [0.05, 0.95]. Returns `None` when no typed
/// supporting/opposing children exist (caller falls back to default
/// propagation), matching the reference's dispatch rule.
fn hypothesis_confidence(children: &[Direction]) -> Option<f64> {
    let mut supporting_total = 0.0;
    let mut opposing_total = 0.0;

    for child in children {
        match child.kind {
            NodeKind::Supporting => supporting_total += child.confidence,
            NodeKind::Opposing => opposing_total += child.confidence,
            _ => {}
        }
    }

    if supporting_total == 0.0 && opposing_total == 0.0 {
        return None;
    }

    let total = supporting_total + opposing_total;
    Some((supporting_total / total).clamp(0.05, 0.95))
}

/// Recalculate one direction's confidence in place from its own evidence
/// and (if any) its children's confidence, per §4.3's weighted-blend
/// formula: `child_weight = min(0.7, children_count / 10)`.
fn recalculate_one(direction: &mut Direction, children: &[Direction]) {
    if direction.kind == NodeKind::Hypothesis && !children.is_empty() {
        if let Some(conf) = hypothesis_confidence(children) {
            direction.confidence = conf;
            return;
        }
    }

    let own_confidence = evidence_to_confidence(&direction.evidence);

    if children.is_empty() {
        direction.confidence = own_confidence;
        return;
    }

    let children_mean = children.iter().map(|c| c.confidence).sum::<f64>() / children.len() as f64;
    let child_weight = (children.len() as f64 / 10.0).min(0.7);
    let own_weight = 1.0 - child_weight;

    direction.confidence = own_weight * own_confidence + child_weight * children_mean;
}

/// Propagate a confidence change upward from `id` to the root, recomputing
/// each ancestor's confidence from its (possibly just-updated) children.
/// Bounded by `max_depth` hops to guard against cycle corruption.
pub fn propagate_upward(store: &Store, id: &Uuid, max_depth: u32) -> Result<()> {
    propagate_upward_inner(store, id, max_depth)
}

fn propagate_upward_inner(store: &Store, id: &Uuid, max_depth: u32) -> Result<()> {
    if max_depth == 0 {
        return Ok(());
    }

    let Some(mut direction) = store.get(id)? else {
        return Ok(());
    };

    let children = store.get_children(id)?;
    recalculate_one(&mut direction, &children);
    store.update(&direction)?;

    if let Some(parent_id) = direction.parent_id {
        propagate_upward_inner(store, &parent_id, max_depth - 1)?;
    }

    Ok(())
}

/// Propagate a confidence change downward from `id` through all
/// descendants, recomputing each as it goes.
pub fn propagate_downward(store: &Store, id: &Uuid, max_depth: u32) -> Result<()> {
    if max_depth == 0 {
        return Ok(());
    }

    let Some(mut direction) = store.get(id)? else {
        return Ok(());
    };

    let children = store.get_children(id)?;
    recalculate_one(&mut direction, &children);
    store.update(&direction)?;

    for child in &children {
        propagate_downward(store, &child.id, max_depth - 1)?;
    }

    Ok(())
}

/// Recalculate confidence for every active direction in a workspace,
/// deepest-first so leaves are settled before their parents are
/// recomputed. Returns the number of directions whose confidence moved
/// by more than 0.01 (and was therefore persisted).
pub fn recalculate_all(store: &Store, workspace_id: &str) -> Result<u32> {
    let mut directions = store.get_active(workspace_id)?;
    directions.sort_by(|a, b| b.depth.cmp(&a.depth));

    let mut updated = 0;
    for mut direction in directions {
        let children = store.get_children(&direction.id)?;
        let old_confidence = direction.confidence;
        recalculate_one(&mut direction, &children);

        if (direction.confidence - old_confidence).abs() > 0.01 {
            store.update(&direction)?;
            updated += 1;
        }
    }

    Ok(updated)
}

/// Boost a direction's confidence by `boost_factor` (capped at 0.95), then
/// propagate the change upward. Used when independent workers reach
/// consensus on the same claim (§4.3).
pub fn boost_confidence(store: &Store, id: &Uuid, boost_factor: f64) -> Result<()> {
    let Some(mut direction) = store.get(id)? else {
        return Ok(());
    };

    direction.confidence = (direction.confidence + boost_factor).min(CONFIDENCE_CAP);
    let parent_id = direction.parent_id;
    store.update(&direction)?;

    if let Some(parent_id) = parent_id {
        propagate_upward(store, &parent_id, 10)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DirectionStatus;

    #[test]
    fn no_evidence_yields_zero_confidence() {
        assert_eq!(evidence_to_confidence(&[]), 0.0);
    }

    #[test]
    fn single_evidence_item_yields_point_seven() {
        let ev = vec![Evidence::new("text", "source")];
        assert!((evidence_to_confidence(&ev) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn multiple_evidence_items_increase_confidence_but_stay_capped() {
        let ev: Vec<Evidence> = (0..10).map(|i| Evidence::new(format!("e{i}"), "source")).collect();
        let conf = evidence_to_confidence(&ev);
        assert!(conf <= 0.95);
        assert!(conf > 0.9);
    }

    #[test]
    fn hypothesis_confidence_all_supporting_caps_at_95() {
        let root = Direction::new_root("ws", "root", 0);
        let mut supporting = Direction::new_child(&root, "supports it", 0.9, 0.5, 1);
        supporting.kind = NodeKind::Supporting;
        let conf = hypothesis_confidence(&[supporting]).unwrap();
        assert!((conf - 0.95).abs() < 1e-9);
    }

    #[test]
    fn hypothesis_confidence_falls_back_without_typed_children() {
        let root = Direction::new_root("ws", "root", 0);
        let plain = Direction::new_child(&root, "plain", 0.9, 0.5, 1);
        assert!(hypothesis_confidence(&[plain]).is_none());
    }

    #[test]
    fn propagate_upward_updates_parent_from_children() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();

        let mut root = Direction::new_root("ws", "root claim", 0);
        root.evidence = vec![];
        store.create(&root).unwrap();

        let mut child = Direction::new_child(&root, "child claim", 0.5, 0.5, 1);
        child.evidence = vec![Evidence::new("evidence", "source")];
        child.confidence = evidence_to_confidence(&child.evidence);
        store.create(&child).unwrap();

        propagate_upward(&store, &child.id, 10).unwrap();

        let updated_root = store.get(&root.id).unwrap().unwrap();
        assert!(updated_root.confidence > 0.0);
        assert!(updated_root.status.is_active());
        let _ = DirectionStatus::Active;
    }

    #[test]
    fn recalculate_all_processes_leaves_before_parents() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();

        let root = Direction::new_root("ws", "root", 0);
        store.create(&root).unwrap();
        let mut child = Direction::new_child(&root, "child", 0.5, 0.5, 1);
        child.evidence = vec![Evidence::new("e", "s")];
        store.create(&child).unwrap();

        let updated = recalculate_all(&store, "ws").unwrap();
        assert!(updated >= 1);
    }

    #[test]
    fn boost_confidence_caps_at_95() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let mut root = Direction::new_root("ws", "root", 0);
        root.confidence = 0.9;
        store.create(&root).unwrap();

        boost_confidence(&store, &root.id, 0.5).unwrap();
        let updated = store.get(&root.id).unwrap().unwrap();
        assert!((updated.confidence - 0.95).abs() < 1e-9);
    }

    proptest::proptest! {
        // P6: adding an evidence item never decreases own_confidence, and
        // the result never exceeds the 0.95 cap.
        #[test]
        fn prop_monotone_in_evidence_count(n in 0usize..20) {
            let ev: Vec<Evidence> = (0..n).map(|i| Evidence::new(format!("e{i}"), "source")).collect();
            let conf_n = evidence_to_confidence(&ev);

            let mut ev_plus_one = ev;
            ev_plus_one.push(Evidence::new("extra", "source"));
            let conf_n_plus_1 = evidence_to_confidence(&ev_plus_one);

            proptest::prop_assert!(conf_n_plus_1 >= conf_n - 1e-12);
            proptest::prop_assert!(conf_n_plus_1 <= CONFIDENCE_CAP + 1e-12);
            proptest::prop_assert!(conf_n <= CONFIDENCE_CAP + 1e-12);
        }
    }
}
