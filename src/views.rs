//! Token-efficient rendered views of the direction graph.
//!
//! Rendering uses plain ASCII confidence bands and bracketed status
//! markers rather than the emoji the graph was originally rendered with
//! (see DESIGN.md Open Question #6).

use crate::error::Result;
use crate::store::Store;
use crate::types::Direction;
use uuid::Uuid;

fn format_confidence(conf: f64) -> String {
    let band = if conf >= 0.8 {
        "high"
    } else if conf >= 0.6 {
        "med"
    } else if conf >= 0.4 {
        "low"
    } else {
        "very-low"
    };
    format!("[{band}] {conf:.2}")
}

fn claim_preview(claim: &str, max_len: usize) -> String {
    if claim.chars().count() > max_len {
        let truncated: String = claim.chars().take(max_len).collect();
        format!("{truncated}...")
    } else {
        claim.to_string()
    }
}

fn status_indicators(direction: &Direction) -> Vec<String> {
    let mut indicators = Vec::new();

    if direction.confidence < 0.4 {
        indicators.push("LOW CONF".to_string());
    }
    let staleness = direction.staleness_hours();
    if staleness > 72.0 {
        indicators.push(format!("STALE ({}d)", (staleness / 24.0) as i64));
    }
    if direction.depth < 2 && direction.children.is_empty() {
        indicators.push("SHALLOW".to_string());
    }
    if direction.tags.iter().any(|t| t.to_lowercase().contains("disputed")) {
        indicators.push("DISPUTED".to_string());
    }

    indicators
}

/// Render a compact top-N-levels summary of the whole workspace graph.
/// Target: readable at a glance for ~100 nodes within `max_nodes`.
pub fn render_summary_view(store: &Store, workspace_id: &str, max_depth: u32, max_nodes: usize) -> Result<String> {
    let roots = store.get_roots(workspace_id)?;

    if roots.is_empty() {
        return Ok("Knowledge Graph (empty)\n\nNo directions yet. Run a research cycle to get started.".to_string());
    }

    let total = store.count_active(workspace_id)?;

    let mut lines = vec![
        "Knowledge Graph Summary".to_string(),
        "=".repeat(50),
        format!("Total active directions: {total} | Max depth: {max_depth}"),
        String::new(),
    ];

    let mut rendered = 0usize;
    for root in &roots {
        if rendered >= max_nodes {
            lines.push(format!("... and more directions not shown (limit {max_nodes})"));
            break;
        }
        rendered = render_node_tree(store, root, &mut lines, "", true, max_depth, 0, max_nodes, rendered)?;
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[allow(clippy::too_many_arguments)]
fn render_node_tree(
    store: &Store,
    direction: &Direction,
    lines: &mut Vec<String>,
    prefix: &str,
    is_last: bool,
    max_depth: u32,
    current_depth: u32,
    max_nodes: usize,
    mut rendered: usize,
) -> Result<usize> {
    let connector = if is_last { "`- " } else { "|- " };
    let extension = if is_last { "   " } else { "|  " };

    let preview = claim_preview(&direction.claim, 60);
    let conf_str = format_confidence(direction.confidence);
    let status = status_indicators(direction);
    let status_suffix = if status.is_empty() {
        String::new()
    } else {
        format!(" ({})", status.join(" | "))
    };

    let children = store.get_children(&direction.id)?;
    lines.push(format!(
        "{prefix}{connector}[{preview}] conf:{conf_str} depth:{} children:{}{status_suffix}",
        direction.depth,
        children.len(),
    ));
    rendered += 1;

    if current_depth < max_depth && !children.is_empty() && rendered < max_nodes {
        let new_prefix = format!("{prefix}{extension}");
        let last_index = children.len() - 1;
        for (i, child) in children.iter().enumerate() {
            if rendered >= max_nodes {
                break;
            }
            rendered = render_node_tree(
                store,
                child,
                lines,
                &new_prefix,
                i == last_index,
                max_depth,
                current_depth + 1,
                max_nodes,
                rendered,
            )?;
        }
    }

    Ok(rendered)
}

fn path_to_root(store: &Store, direction: &Direction) -> Result<Vec<Direction>> {
    let mut path = vec![direction.clone()];
    let mut current = direction.clone();

    while let Some(parent_id) = current.parent_id {
        match store.get(&parent_id)? {
            Some(parent) => {
                path.push(parent.clone());
                current = parent;
            }
            None => break,
        }
    }

    Ok(path)
}

/// Render a focused view of one direction: its path to root, its own
/// detail, and its subtree. This is what research workers receive when
/// dispatched against a specific direction.
pub fn render_focused_view(store: &Store, id: &Uuid, max_depth: u32) -> Result<String> {
    let Some(direction) = store.get(id)? else {
        return Ok(format!("Direction {id} not found"));
    };

    let mut lines = vec!["Focused View".to_string(), "=".repeat(50), String::new()];

    let path = path_to_root(store, &direction)?;
    if path.len() > 1 {
        lines.push("Context path (node -> root):".to_string());
        for (i, ancestor) in path.iter().enumerate() {
            let indent = "  ".repeat(i);
            let conf_str = format_confidence(ancestor.confidence);
            let preview = claim_preview(&ancestor.claim, 80);
            lines.push(format!("{indent}^ [{preview}] conf:{conf_str}"));
        }
        lines.push(String::new());
    }

    lines.push("Target direction:".to_string());
    lines.push(format!("  ID: {}", direction.id));
    lines.push(format!("  Claim: {}", direction.claim));
    lines.push(format!("  Kind: {}", direction.kind));
    lines.push(format!("  Confidence: {}", format_confidence(direction.confidence)));
    lines.push(format!("  Importance: {:.2}", direction.importance));
    lines.push(format!("  Depth: {}", direction.depth));
    lines.push(format!("  Status: {}", direction.status));
    lines.push(format!("  Staleness: {:.1} hours", direction.staleness_hours()));

    let children = store.get_children(id)?;
    lines.push(format!("  Children: {}", children.len()));

    if !direction.evidence.is_empty() {
        lines.push(format!("  Evidence: {} items", direction.evidence.len()));
        for (i, ev) in direction.evidence.iter().take(3).enumerate() {
            lines.push(format!("    {}. {} ({})", i + 1, claim_preview(&ev.text, 100), ev.source));
        }
    }

    if !direction.tags.is_empty() {
        lines.push(format!("  Tags: {}", direction.tags.join(", ")));
    }

    lines.push(String::new());

    if !children.is_empty() {
        lines.push("Subtree:".to_string());
        render_node_tree(store, &direction, &mut lines, "  ", true, max_depth, 0, 100, 0)?;
    } else {
        lines.push("No children yet (leaf direction)".to_string());
    }

    Ok(lines.join("\n"))
}

/// Selection-score weighting for `render_weakest_n` (§4.4).
struct ScoredDirection {
    score: f64,
    direction: Direction,
}

/// Render the N weakest (highest research priority) active directions.
/// Score = `(1 - confidence) * 0.5 + importance * 0.3 + exploration_bonus
/// * 0.2`, where `exploration_bonus = ln(1 + staleness_hours / 24) * 0.2`.
pub fn render_weakest_n(store: &Store, workspace_id: &str, n: usize) -> Result<String> {
    let directions = store.get_active(workspace_id)?;

    if directions.is_empty() {
        return Ok("No active directions found.".to_string());
    }

    let mut scored: Vec<ScoredDirection> = directions
        .into_iter()
        .map(|direction| {
            let staleness_factor = (1.0 + direction.staleness_hours() / 24.0).ln();
            let exploration_bonus = staleness_factor * 0.2;
            let score = (1.0 - direction.confidence) * 0.5 + direction.importance * 0.3 + exploration_bonus * 0.2;
            ScoredDirection { score, direction }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(n);

    let mut lines = vec![format!("Top {n} priority directions for next cycle"), "=".repeat(50), String::new()];

    for (i, entry) in scored.iter().enumerate() {
        let conf_str = format_confidence(entry.direction.confidence);
        let preview = claim_preview(&entry.direction.claim, 70);
        let status = status_indicators(&entry.direction);

        lines.push(format!("{}. Score: {:.3}", i + 1, entry.score));
        lines.push(format!("   {preview}"));
        lines.push(format!(
            "   Conf: {conf_str} | Imp: {:.2} | Depth: {}",
            entry.direction.importance, entry.direction.depth
        ));
        if !status.is_empty() {
            lines.push(format!("   Status: {}", status.join(" | ")));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_view_empty_graph() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let rendered = render_summary_view(&store, "ws", 2, 50).unwrap();
        assert!(rendered.contains("empty"));
    }

    #[test]
    fn summary_view_shows_root_and_child() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let root = Direction::new_root("ws", "Understand the market", 0);
        store.create(&root).unwrap();
        let child = Direction::new_child(&root, "Segment: SMB buyers", 0.6, 0.6, 1);
        store.create(&child).unwrap();

        let rendered = render_summary_view(&store, "ws", 2, 50).unwrap();
        assert!(rendered.contains("Understand the market"));
        assert!(rendered.contains("Segment: SMB buyers"));
    }

    #[test]
    fn focused_view_reports_missing_node() {
        let store = Store::in_memory().unwrap();
        let rendered = render_focused_view(&store, &Uuid::new_v4(), 3).unwrap();
        assert!(rendered.contains("not found"));
    }

    #[test]
    fn weakest_n_empty_graph() {
        let store = Store::in_memory().unwrap();
        let rendered = render_weakest_n(&store, "ws", 5).unwrap();
        assert_eq!(rendered, "No active directions found.");
    }

    #[test]
    fn weakest_n_ranks_low_confidence_high_importance_first() {
        let store = Store::in_memory().unwrap();
        store.ensure_workspace("ws", "mission").unwrap();
        let mut weak = Direction::new_root("ws", "weak claim", 0);
        weak.confidence = 0.2;
        weak.importance = 0.9;
        store.create(&weak).unwrap();

        let mut strong = Direction::new_root("ws", "strong claim", 0);
        strong.confidence = 0.95;
        strong.importance = 0.1;
        store.create(&strong).unwrap();

        let rendered = render_weakest_n(&store, "ws", 2).unwrap();
        let weak_pos = rendered.find("weak claim").unwrap();
        let strong_pos = rendered.find("strong claim").unwrap();
        assert!(weak_pos < strong_pos);
    }
}
