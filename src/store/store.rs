//! SQLite-backed research-graph store.

use crate::error::{Error, Result};
use crate::store::schema::{initialize_schema, is_initialized, normalize_legacy_kind};
use crate::types::{CycleRecord, Direction, DirectionStatus, Evidence, NodeKind, ReportMetadata};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// SQLite-backed store for workspaces, the direction graph, cycle records,
/// context documents, and the report/usage ledgers (spec §4.1, §6).
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::Database)?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(Error::Database)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        initialize_schema(&conn).map_err(Error::Database)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(Error::Database)
    }

    // ==================== Workspace ====================

    pub fn ensure_workspace(&self, workspace_id: &str, mission: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO workspaces (id, mission) VALUES (?1, ?2)",
                params![workspace_id, mission],
            )?;
            Ok(())
        })
    }

    // ==================== Direction graph ====================

    /// Create a new direction node (spec §4.1 `create`).
    pub fn create(&self, direction: &Direction) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nodes (
                    id, workspace_id, parent_id, claim, description, confidence,
                    importance, depth, status, kind, tags, evidence, source_files,
                    created_at, updated_at, created_by_cycle, updated_by_cycle
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    direction.id.to_string(),
                    direction.workspace_id,
                    direction.parent_id.map(|p| p.to_string()),
                    direction.claim,
                    direction.description,
                    direction.confidence,
                    direction.importance,
                    direction.depth,
                    direction.status.to_string(),
                    direction.kind.to_string(),
                    serde_json::to_string(&direction.tags).unwrap_or_default(),
                    serde_json::to_string(&direction.evidence).unwrap_or_default(),
                    serde_json::to_string(&direction.source_files).unwrap_or_default(),
                    direction.created_at.to_rfc3339(),
                    direction.updated_at.to_rfc3339(),
                    direction.created_by_cycle,
                    direction.updated_by_cycle,
                ],
            )?;
            Self::insert_audit_row(
                conn,
                &direction.workspace_id,
                Some(direction.created_by_cycle),
                "create",
                Some(&direction.id),
                &format!("after: {}", Self::fingerprint(direction)),
            )?;
            Ok(())
        })
    }

    /// Update an existing direction in place (spec §4.1 `update`).
    pub fn update(&self, direction: &Direction) -> Result<()> {
        self.with_conn(|conn| {
            let before = conn
                .query_row(
                    "SELECT id, workspace_id, parent_id, claim, description, confidence,
                            importance, depth, status, kind, tags, evidence, source_files,
                            created_at, updated_at, created_by_cycle, updated_by_cycle
                     FROM nodes WHERE id = ?1",
                    params![direction.id.to_string()],
                    Self::row_to_direction,
                )
                .optional()?;

            conn.execute(
                "UPDATE nodes SET
                    claim = ?2, description = ?3, confidence = ?4, importance = ?5,
                    status = ?6, tags = ?7, evidence = ?8, source_files = ?9,
                    updated_at = ?10, updated_by_cycle = ?11
                 WHERE id = ?1",
                params![
                    direction.id.to_string(),
                    direction.claim,
                    direction.description,
                    direction.confidence,
                    direction.importance,
                    direction.status.to_string(),
                    serde_json::to_string(&direction.tags).unwrap_or_default(),
                    serde_json::to_string(&direction.evidence).unwrap_or_default(),
                    serde_json::to_string(&direction.source_files).unwrap_or_default(),
                    direction.updated_at.to_rfc3339(),
                    direction.updated_by_cycle,
                ],
            )?;

            let before_fp = before.map(|b| Self::fingerprint(&b)).unwrap_or_else(|| "unknown".to_string());
            Self::insert_audit_row(
                conn,
                &direction.workspace_id,
                Some(direction.updated_by_cycle),
                "update",
                Some(&direction.id),
                &format!("before: {before_fp} | after: {}", Self::fingerprint(direction)),
            )?;
            Ok(())
        })
    }

    /// Move a node to a new parent (used by merge's group-merge execution,
    /// spec §4.2). Depth is intentionally left untouched, matching the
    /// reference `reparent_node`, which does not recompute depth either.
    pub fn reparent(&self, id: &Uuid, new_parent_id: &Uuid, cycle_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let before: (Option<String>, String) = conn.query_row(
                "SELECT parent_id, workspace_id FROM nodes WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            conn.execute(
                "UPDATE nodes SET parent_id = ?2, updated_at = ?3, updated_by_cycle = ?4 WHERE id = ?1",
                params![id.to_string(), new_parent_id.to_string(), Utc::now().to_rfc3339(), cycle_id],
            )?;

            Self::insert_audit_row(
                conn,
                &before.1,
                Some(cycle_id),
                "reparent",
                Some(id),
                &format!(
                    "before: parent_id={} | after: parent_id={new_parent_id}",
                    before.0.as_deref().unwrap_or("none"),
                ),
            )?;
            Ok(())
        })
    }

    /// Mark a direction `killed` (spec §4.1 `kill`). Terminal; does not
    /// delete the row.
    pub fn kill(&self, id: &Uuid, reason: &str, cycle_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let (before_status, workspace_id): (String, String) = conn.query_row(
                "SELECT status, workspace_id FROM nodes WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            conn.execute(
                "UPDATE nodes SET status = 'killed', updated_at = ?2, updated_by_cycle = ?3
                 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339(), cycle_id],
            )?;
            let tag = format!("killed:{reason}");
            let tags: String = conn.query_row(
                "SELECT tags FROM nodes WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            let mut tags: Vec<String> = serde_json::from_str(&tags).unwrap_or_default();
            tags.push(tag);
            conn.execute(
                "UPDATE nodes SET tags = ?2 WHERE id = ?1",
                params![id.to_string(), serde_json::to_string(&tags).unwrap_or_default()],
            )?;

            Self::insert_audit_row(
                conn,
                &workspace_id,
                Some(cycle_id),
                "kill",
                Some(id),
                &format!("before: status={before_status}, reason={reason} | after: status=killed"),
            )?;
            Ok(())
        })
    }

    /// Compact before/after fingerprint for the audit log (I7): the fields
    /// a merge/reassessment actually moves.
    fn fingerprint(direction: &Direction) -> String {
        format!(
            "claim={:.60} confidence={:.3} importance={:.3} status={}",
            direction.claim,
            direction.confidence,
            direction.importance,
            direction.status,
        )
    }

    /// Append a `graph_operations` audit row from within an already-held
    /// connection lock (internal mutation paths call this directly rather
    /// than through `log_operation`, which would re-lock and deadlock).
    fn insert_audit_row(
        conn: &Connection,
        workspace_id: &str,
        cycle_id: Option<i64>,
        operation: &str,
        node_id: Option<&Uuid>,
        detail: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO graph_operations (workspace_id, cycle_id, operation, node_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workspace_id,
                cycle_id,
                operation,
                node_id.map(|n| n.to_string()),
                detail,
            ],
        )?;
        Ok(())
    }

    /// Fetch a direction by id.
    pub fn get(&self, id: &Uuid) -> Result<Option<Direction>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, workspace_id, parent_id, claim, description, confidence,
                        importance, depth, status, kind, tags, evidence, source_files,
                        created_at, updated_at, created_by_cycle, updated_by_cycle
                 FROM nodes WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_direction,
            )
            .optional()
        })
    }

    /// Active children of `id` (status not `killed`/`merged`), scoped to the
    /// parent's own workspace. Matching `graph/store.py`'s
    /// `get_all_active_nodes`/`get_roots`/`search`, which all filter
    /// `status = 'active'` — killed/merged nodes are terminal and must
    /// never surface from an active-listing query (I4), since that would
    /// let a node already merged away get re-clustered and re-merged on a
    /// later `deduplicate_children` pass.
    pub fn get_children(&self, id: &Uuid) -> Result<Vec<Direction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, parent_id, claim, description, confidence,
                        importance, depth, status, kind, tags, evidence, source_files,
                        created_at, updated_at, created_by_cycle, updated_by_cycle
                 FROM nodes
                 WHERE parent_id = ?1
                   AND status NOT IN ('killed', 'merged')
                   AND workspace_id = (SELECT workspace_id FROM nodes WHERE id = ?1)
                 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![id.to_string()], Self::row_to_direction)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Root directions (no parent) in a workspace.
    pub fn get_roots(&self, workspace_id: &str) -> Result<Vec<Direction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, parent_id, claim, description, confidence,
                        importance, depth, status, kind, tags, evidence, source_files,
                        created_at, updated_at, created_by_cycle, updated_by_cycle
                 FROM nodes WHERE workspace_id = ?1 AND parent_id IS NULL ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![workspace_id], Self::row_to_direction)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// All non-terminal directions in a workspace (spec §4.1 `get_active`).
    pub fn get_active(&self, workspace_id: &str) -> Result<Vec<Direction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, parent_id, claim, description, confidence,
                        importance, depth, status, kind, tags, evidence, source_files,
                        created_at, updated_at, created_by_cycle, updated_by_cycle
                 FROM nodes WHERE workspace_id = ?1 AND status NOT IN ('killed', 'merged')
                 ORDER BY importance DESC, confidence DESC",
            )?;
            let rows = stmt
                .query_map(params![workspace_id], Self::row_to_direction)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn count_active(&self, workspace_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM nodes WHERE workspace_id = ?1 AND status NOT IN ('killed', 'merged')",
                params![workspace_id],
                |row| row.get(0),
            )
        })
    }

    /// Full-text search over claim/description (spec §4.1 `search_by_text`).
    pub fn search_by_text(&self, workspace_id: &str, query: &str, limit: usize) -> Result<Vec<Direction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id, n.workspace_id, n.parent_id, n.claim, n.description, n.confidence,
                        n.importance, n.depth, n.status, n.kind, n.tags, n.evidence, n.source_files,
                        n.created_at, n.updated_at, n.created_by_cycle, n.updated_by_cycle
                 FROM nodes n
                 JOIN nodes_fts fts ON n.rowid = fts.rowid
                 WHERE nodes_fts MATCH ?1 AND n.workspace_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![query, workspace_id, limit as i64], Self::row_to_direction)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    fn row_to_direction(row: &rusqlite::Row) -> rusqlite::Result<Direction> {
        let id: String = row.get(0)?;
        let parent_id: Option<String> = row.get(2)?;
        let status_str: String = row.get(8)?;
        let kind_str: String = row.get(9)?;
        let tags: String = row.get(10)?;
        let evidence: String = row.get(11)?;
        let source_files: String = row.get(12)?;
        let created_at: String = row.get(13)?;
        let updated_at: String = row.get(14)?;

        Ok(Direction {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            workspace_id: row.get(1)?,
            parent_id: parent_id.and_then(|p| Uuid::parse_str(&p).ok()),
            claim: row.get(3)?,
            description: row.get(4)?,
            confidence: row.get(5)?,
            importance: row.get(6)?,
            depth: row.get::<_, i64>(7)? as u32,
            status: DirectionStatus::from_str(&status_str).unwrap_or(DirectionStatus::Active),
            kind: NodeKind::from_str(normalize_legacy_kind(&kind_str)).unwrap_or(NodeKind::Direction),
            children: Vec::new(),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            evidence: serde_json::from_str::<Vec<Evidence>>(&evidence).unwrap_or_default(),
            source_files: serde_json::from_str(&source_files).unwrap_or_default(),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            created_by_cycle: row.get(15)?,
            updated_by_cycle: row.get(16)?,
        })
    }

    // ==================== Graph operations log ====================

    /// Public entry point for callers outside a mutation path (e.g. a
    /// caller recording a manual annotation). `create`/`update`/`kill`/
    /// `reparent` append their own audit rows directly via
    /// `insert_audit_row` from inside their own connection lock.
    pub fn log_operation(
        &self,
        workspace_id: &str,
        cycle_id: Option<i64>,
        operation: &str,
        node_id: Option<&Uuid>,
        detail: &str,
    ) -> Result<()> {
        self.with_conn(|conn| Self::insert_audit_row(conn, workspace_id, cycle_id, operation, node_id, detail))
    }

    // ==================== Cycle records ====================

    /// Persist a completed cycle's record, returning its assigned id.
    pub fn save_cycle_record(&self, record: &CycleRecord) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cycle_outputs (workspace_id, record) VALUES (?1, ?2)",
                params![
                    record.workspace_id,
                    serde_json::to_string(record).unwrap_or_default(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_cycle_record(&self, cycle_id: i64) -> Result<Option<CycleRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM cycle_outputs WHERE cycle_id = ?1",
                params![cycle_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .map(|opt| opt.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn list_cycle_records(&self, workspace_id: &str) -> Result<Vec<CycleRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM cycle_outputs WHERE workspace_id = ?1 ORDER BY cycle_id",
            )?;
            let rows: Vec<String> = stmt
                .query_map(params![workspace_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .map(|rows| rows.iter().filter_map(|s| serde_json::from_str(s).ok()).collect())
    }

    /// Flatten every worker-performed search query across cycle records,
    /// most recent cycle first, for the context builder's search-history
    /// section (§4.5).
    pub fn get_all_search_queries(&self, workspace_id: &str, limit: usize) -> Result<Vec<String>> {
        let mut records = self.list_cycle_records(workspace_id)?;
        records.reverse();

        let mut queries = Vec::new();
        'outer: for record in &records {
            for worker in &record.worker_outputs {
                for search in &worker.searches_performed {
                    queries.push(search.query.clone());
                    if queries.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        Ok(queries)
    }

    /// Most recent self-critiques across cycle records, for the context
    /// builder's open-questions section (§4.5). Returns
    /// `(agent_name, cycle_id, self_critique)` triples, newest first.
    pub fn get_recent_critiques(&self, workspace_id: &str, limit: usize) -> Result<Vec<(String, i64, String)>> {
        let mut records = self.list_cycle_records(workspace_id)?;
        records.reverse();

        let mut critiques = Vec::new();
        'outer: for record in &records {
            for worker in &record.worker_outputs {
                if worker.self_critique.trim().is_empty() {
                    continue;
                }
                critiques.push((worker.agent_name.clone(), record.cycle_id, worker.self_critique.clone()));
                if critiques.len() >= limit {
                    break 'outer;
                }
            }
        }
        Ok(critiques)
    }

    /// Remove a cycle's output record. Cascades nothing onto `nodes`; per
    /// the Lifecycle note in the data model, directions created by a
    /// removed cycle are preserved.
    pub fn delete_cycle(&self, cycle_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cycle_outputs WHERE cycle_id = ?1", params![cycle_id])?;
            Ok(())
        })
    }

    /// Alias for `delete_cycle` matching the Lifecycle paragraph's wording.
    pub fn remove_cycle_admin(&self, cycle_id: i64) -> Result<()> {
        self.delete_cycle(cycle_id)
    }

    // ==================== Context documents ====================

    pub fn upsert_context_documents(&self, workspace_id: &str, filename: &str, content: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_documents (workspace_id, filename, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, filename) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
                params![workspace_id, filename, content, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_context_documents(&self, workspace_id: &str) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT filename, content FROM context_documents WHERE workspace_id = ?1 ORDER BY filename",
            )?;
            let rows = stmt
                .query_map(params![workspace_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    // ==================== Report metadata ====================

    pub fn get_report_metadata(&self, workspace_id: &str) -> Result<ReportMetadata> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT regeneration_interval_secs, last_generated_at, markdown
                 FROM report_metadata WHERE workspace_id = ?1",
                params![workspace_id],
                |row| {
                    let last: Option<String> = row.get(1)?;
                    Ok(ReportMetadata {
                        regeneration_interval_secs: row.get(0)?,
                        last_generated_at: last.and_then(|s| {
                            DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))
                        }),
                        markdown: row.get(2)?,
                    })
                },
            )
            .optional()
        })
        .map(|opt| opt.unwrap_or_default())
    }

    pub fn save_report_metadata(&self, workspace_id: &str, meta: &ReportMetadata) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO report_metadata (workspace_id, regeneration_interval_secs, last_generated_at, markdown)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id) DO UPDATE SET
                    regeneration_interval_secs = excluded.regeneration_interval_secs,
                    last_generated_at = excluded.last_generated_at,
                    markdown = excluded.markdown",
                params![
                    workspace_id,
                    meta.regeneration_interval_secs,
                    meta.last_generated_at.map(|d| d.to_rfc3339()),
                    meta.markdown,
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Usage events ====================

    pub fn record_usage_event(
        &self,
        workspace_id: &str,
        cycle_id: Option<i64>,
        role: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_events (workspace_id, cycle_id, role, model, input_tokens, output_tokens, cost_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    workspace_id,
                    cycle_id,
                    role,
                    model,
                    input_tokens as i64,
                    output_tokens as i64,
                    cost_usd,
                ],
            )?;
            Ok(())
        })
    }

    pub fn total_cost(&self, workspace_id: &str) -> Result<f64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_events WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    #[test]
    fn create_and_get_roundtrip() {
        let store = store();
        store.ensure_workspace("ws1", "Understand the market").unwrap();
        let root = Direction::new_root("ws1", "Understand the market", 0);
        store.create(&root).unwrap();

        let fetched = store.get(&root.id).unwrap().unwrap();
        assert_eq!(fetched.claim, "Understand the market");
        assert_eq!(fetched.status, DirectionStatus::Active);
    }

    #[test]
    fn kill_marks_terminal_and_tags() {
        let store = store();
        store.ensure_workspace("ws1", "mission").unwrap();
        let root = Direction::new_root("ws1", "claim", 0);
        store.create(&root).unwrap();

        store.kill(&root.id, "low_confidence", 1).unwrap();
        let fetched = store.get(&root.id).unwrap().unwrap();
        assert_eq!(fetched.status, DirectionStatus::Killed);
        assert!(fetched.tags.iter().any(|t| t == "killed:low_confidence"));
    }

    #[test]
    fn active_excludes_killed_and_merged() {
        let store = store();
        store.ensure_workspace("ws1", "mission").unwrap();
        let root = Direction::new_root("ws1", "claim", 0);
        store.create(&root).unwrap();
        store.kill(&root.id, "x", 1).unwrap();

        assert_eq!(store.count_active("ws1").unwrap(), 0);
    }

    #[test]
    fn search_by_text_finds_matching_claim() {
        let store = store();
        store.ensure_workspace("ws1", "mission").unwrap();
        let root = Direction::new_root("ws1", "Quantum computing error correction", 0);
        store.create(&root).unwrap();

        let results = store.search_by_text("ws1", "quantum", 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn cycle_record_roundtrip() {
        let store = store();
        let record = CycleRecord {
            cycle_id: 0,
            workspace_id: "ws1".to_string(),
            target_direction_id: Uuid::new_v4(),
            target_claim_snapshot: "claim".to_string(),
            synthesis_reasoning: "reasoning".to_string(),
            consensus_directions: vec![],
            contradictions: vec![],
            created_direction_ids: vec![],
            updated_direction_ids: vec![],
            skipped_count: 0,
            worker_outputs: vec![],
            total_cost_usd: 0.1,
            lead_llm_cost_usd: 0.05,
            research_agents_cost_usd: 0.05,
            duration_seconds: 12.0,
            success: true,
            error_message: None,
            failed_stage: None,
            selection_strategy: "weakest_n".to_string(),
            selection_reasoning: "chose weakest".to_string(),
            created_at: Utc::now(),
        };
        let id = store.save_cycle_record(&record).unwrap();
        let fetched = store.get_cycle_record(id).unwrap().unwrap();
        assert_eq!(fetched.workspace_id, "ws1");
        assert!(fetched.success);
    }

    #[test]
    fn report_metadata_defaults_when_absent() {
        let store = store();
        let meta = store.get_report_metadata("ws1").unwrap();
        assert!(meta.needs_regeneration());
    }

    #[test]
    fn get_children_excludes_killed_and_merged() {
        let store = store();
        store.ensure_workspace("ws1", "mission").unwrap();
        let root = Direction::new_root("ws1", "root", 0);
        store.create(&root).unwrap();

        let alive = Direction::new_child(&root, "alive child", 0.5, 0.5, 1);
        store.create(&alive).unwrap();
        let killed = Direction::new_child(&root, "dead child", 0.5, 0.5, 1);
        store.create(&killed).unwrap();
        let mut merged = Direction::new_child(&root, "merged-away child", 0.5, 0.5, 1);
        store.create(&merged).unwrap();

        store.kill(&killed.id, "pruned", 1).unwrap();
        merged.mark_merged_into(alive.id, 1);
        store.update(&merged).unwrap();

        let children = store.get_children(&root.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, alive.id);
    }

    #[test]
    fn mutations_append_audit_log_rows() {
        let store = store();
        store.ensure_workspace("ws1", "mission").unwrap();
        let mut root = Direction::new_root("ws1", "root", 0);
        store.create(&root).unwrap();

        root.confidence = 0.8;
        store.update(&root).unwrap();

        let child = Direction::new_child(&root, "child", 0.5, 0.5, 1);
        store.create(&child).unwrap();
        store.reparent(&child.id, &root.id, 1).unwrap();
        store.kill(&child.id, "done", 1).unwrap();

        let ops: Vec<String> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT operation FROM graph_operations WHERE workspace_id = 'ws1' ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?.filter_map(|r| r.ok()).collect();
                Ok(rows)
            })
            .unwrap();

        assert_eq!(ops, vec!["create", "update", "create", "reparent", "kill"]);
    }

    #[test]
    fn usage_events_accumulate_cost() {
        let store = store();
        store.ensure_workspace("ws1", "mission").unwrap();
        store
            .record_usage_event("ws1", Some(1), "lead", "model-a", 100, 50, 0.02)
            .unwrap();
        store
            .record_usage_event("ws1", Some(1), "worker", "model-b", 200, 100, 0.03)
            .unwrap();
        assert!((store.total_cost("ws1").unwrap() - 0.05).abs() < 1e-9);
    }
}
