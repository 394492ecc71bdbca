//! Claim similarity, duplicate detection, and children deduplication.

use crate::error::Result;
use crate::store::Store;
use crate::types::Direction;
use std::collections::HashSet;
use uuid::Uuid;

/// Jaccard similarity over lowercased, whitespace-tokenized claim text.
/// Returns 0.0 if either claim tokenizes to the empty set.
pub fn claim_similarity(claim1: &str, claim2: &str) -> f64 {
    let tokens1: HashSet<&str> = claim1.split_whitespace().collect();
    let tokens2: HashSet<&str> = claim2.split_whitespace().collect();

    if tokens1.is_empty() || tokens2.is_empty() {
        return 0.0;
    }

    let lower1: HashSet<String> = tokens1.iter().map(|t| t.to_lowercase()).collect();
    let lower2: HashSet<String> = tokens2.iter().map(|t| t.to_lowercase()).collect();

    let intersection = lower1.intersection(&lower2).count();
    let union = lower1.union(&lower2).count();

    intersection as f64 / union as f64
}

/// A candidate match from `find_similar`, paired with its similarity score.
pub struct SimilarMatch {
    pub score: f64,
    pub direction: Direction,
}

/// Find directions with a claim similar to `claim`, restricted to siblings
/// under `parent_id` when given, otherwise all active directions in the
/// workspace. Sorted by similarity descending, capped at `limit`.
pub fn find_similar(
    store: &Store,
    workspace_id: &str,
    claim: &str,
    parent_id: Option<&Uuid>,
    threshold: f64,
    limit: usize,
) -> Result<Vec<SimilarMatch>> {
    let candidates = match parent_id {
        Some(id) => store.get_children(id)?,
        None => store.get_active(workspace_id)?,
    };

    let mut matches: Vec<SimilarMatch> = candidates
        .into_iter()
        .filter_map(|d| {
            let score = claim_similarity(claim, &d.claim);
            (score >= threshold).then_some(SimilarMatch { score, direction: d })
        })
        .collect();

    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    matches.truncate(limit);
    Ok(matches)
}

/// Group children under `parent_id` into duplicate clusters at or above
/// `similarity_threshold`. Each returned group has 2+ members; a member
/// appears in at most one group (greedy, in sibling order, mirroring the
/// reference algorithm's single linear pass).
pub fn group_duplicate_children(
    children: &[Direction],
    similarity_threshold: f64,
) -> Vec<Vec<Uuid>> {
    let mut processed: HashSet<Uuid> = HashSet::new();
    let mut groups = Vec::new();

    for (i, child1) in children.iter().enumerate() {
        if processed.contains(&child1.id) {
            continue;
        }

        let mut duplicates = Vec::new();
        for child2 in &children[i + 1..] {
            if processed.contains(&child2.id) {
                continue;
            }
            if claim_similarity(&child1.claim, &child2.claim) >= similarity_threshold {
                duplicates.push(child2.id);
            }
        }

        if !duplicates.is_empty() {
            processed.insert(child1.id);
            let mut group = vec![child1.id];
            for dup in &duplicates {
                processed.insert(*dup);
            }
            group.extend(duplicates);
            groups.push(group);
        }
    }

    groups
}

/// Pick the merged claim text for a duplicate group: the longest of the
/// member claims, matching the reference's `max(claims, key=len)`.
pub fn longest_claim<'a>(claims: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    claims.into_iter().max_by_key(|c| c.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    #[test]
    fn identical_claims_are_fully_similar() {
        assert_eq!(claim_similarity("quantum error correction", "quantum error correction"), 1.0);
    }

    #[test]
    fn disjoint_claims_have_zero_similarity() {
        assert_eq!(claim_similarity("apples and oranges", "quantum physics research"), 0.0);
    }

    #[test]
    fn empty_claim_yields_zero() {
        assert_eq!(claim_similarity("", "anything"), 0.0);
    }

    #[test]
    fn case_insensitive() {
        let a = claim_similarity("Quantum Error Correction", "quantum error correction");
        assert_eq!(a, 1.0);
    }

    #[test]
    fn group_duplicate_children_clusters_similar_claims() {
        let root = Direction::new_root("ws", "root", 0);
        let c1 = Direction::new_child(&root, "The market favors SMB buyers heavily", 0.5, 0.5, 1);
        let c2 = Direction::new_child(&root, "The market favors SMB buyers strongly", 0.5, 0.5, 1);
        let c3 = Direction::new_child(&root, "Totally unrelated enterprise sales claim", 0.5, 0.5, 1);
        let children = vec![c1.clone(), c2.clone(), c3.clone()];

        let groups = group_duplicate_children(&children, 0.6);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].contains(&c1.id));
        assert!(groups[0].contains(&c2.id));
        assert!(!groups[0].contains(&c3.id));
    }

    #[test]
    fn longest_claim_picks_longest() {
        let claims = vec!["short", "a much longer claim text"];
        assert_eq!(longest_claim(claims), Some("a much longer claim text"));
    }

    proptest::proptest! {
        // P5: sim(x, x) = 1 for any non-empty claim.
        #[test]
        fn prop_reflexive(claim in "[a-z]{1,8}( [a-z]{1,8}){0,5}") {
            proptest::prop_assert!((claim_similarity(&claim, &claim) - 1.0).abs() < 1e-9);
        }

        // P5: sim(x, y) = sim(y, x).
        #[test]
        fn prop_symmetric(a in "[a-z]{1,8}( [a-z]{1,8}){0,5}", b in "[a-z]{1,8}( [a-z]{1,8}){0,5}") {
            proptest::prop_assert!((claim_similarity(&a, &b) - claim_similarity(&b, &a)).abs() < 1e-9);
        }

        // P5: sim(x, empty) = 0.
        #[test]
        fn prop_empty_is_zero(a in "[a-z]{1,8}( [a-z]{1,8}){0,5}") {
            proptest::prop_assert_eq!(claim_similarity(&a, ""), 0.0);
        }

        // sim is always within [0, 1].
        #[test]
        fn prop_bounded(a in "[a-z]{1,8}( [a-z]{1,8}){0,5}", b in "[a-z]{1,8}( [a-z]{1,8}){0,5}") {
            let s = claim_similarity(&a, &b);
            proptest::prop_assert!((0.0..=1.0).contains(&s));
        }
    }
}
