use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use dedup_kernel_core::{
    AcceptedEdge, Candidate, CloseAction, CloseMode, CloseRunId, CloseSkipReason, DecisionId,
    DecisionRecord, FinalStatus, ItemId, ItemSnapshot, ItemState, ItemType, Representation,
    ScopeId, ScopeRef, TargetPolicy, VerdictSignals,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS scopes (
  scope_id INTEGER PRIMARY KEY AUTOINCREMENT,
  org TEXT NOT NULL,
  name TEXT NOT NULL,
  UNIQUE(org, name)
);

CREATE TABLE IF NOT EXISTS items (
  item_id INTEGER PRIMARY KEY,
  scope_id INTEGER NOT NULL,
  item_type TEXT NOT NULL CHECK (item_type IN ('issue','pr')),
  number INTEGER NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('open','closed')),
  title TEXT NOT NULL,
  body TEXT,
  author TEXT,
  assignees_json TEXT NOT NULL,
  assignees_unknown INTEGER NOT NULL DEFAULT 0,
  comment_count INTEGER NOT NULL DEFAULT 0,
  review_comment_count INTEGER NOT NULL DEFAULT 0,
  created_at TEXT,
  UNIQUE(scope_id, item_type, number),
  FOREIGN KEY (scope_id) REFERENCES scopes(scope_id)
);

CREATE TABLE IF NOT EXISTS candidate_sets (
  candidate_set_id INTEGER PRIMARY KEY AUTOINCREMENT,
  scope_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  item_type TEXT NOT NULL CHECK (item_type IN ('issue','pr')),
  representation TEXT NOT NULL CHECK (representation IN ('raw','intent')),
  created_at TEXT NOT NULL,
  FOREIGN KEY (scope_id) REFERENCES scopes(scope_id),
  FOREIGN KEY (item_id) REFERENCES items(item_id)
);

CREATE TABLE IF NOT EXISTS candidate_set_members (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  candidate_set_id INTEGER NOT NULL,
  candidate_item_id INTEGER NOT NULL,
  score REAL NOT NULL,
  rank INTEGER NOT NULL,
  FOREIGN KEY (candidate_set_id) REFERENCES candidate_sets(candidate_set_id),
  FOREIGN KEY (candidate_item_id) REFERENCES items(item_id)
);

CREATE TABLE IF NOT EXISTS decisions (
  decision_id TEXT PRIMARY KEY,
  scope_id INTEGER NOT NULL,
  item_type TEXT NOT NULL CHECK (item_type IN ('issue','pr')),
  source_item_id INTEGER NOT NULL,
  candidate_set_id INTEGER,
  target_item_id INTEGER,
  model_is_duplicate INTEGER NOT NULL,
  final_status TEXT NOT NULL CHECK (final_status IN ('accepted','rejected','skipped')),
  confidence REAL NOT NULL,
  reasoning TEXT NOT NULL,
  relation TEXT,
  root_cause_match TEXT,
  scope_relation TEXT,
  path_match TEXT,
  certainty TEXT,
  veto_reason TEXT,
  min_edge REAL NOT NULL,
  representation TEXT NOT NULL CHECK (representation IN ('raw','intent')),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (scope_id) REFERENCES scopes(scope_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_one_accepted_edge
ON decisions(scope_id, item_type, source_item_id, representation)
WHERE final_status = 'accepted';

CREATE INDEX IF NOT EXISTS idx_decisions_source ON decisions(scope_id, item_type, source_item_id);
CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(final_status);

CREATE TABLE IF NOT EXISTS close_runs (
  close_run_id INTEGER PRIMARY KEY AUTOINCREMENT,
  scope_id INTEGER NOT NULL,
  item_type TEXT NOT NULL CHECK (item_type IN ('issue','pr')),
  mode TEXT NOT NULL CHECK (mode IN ('plan','apply')),
  min_close REAL NOT NULL,
  target_policy TEXT NOT NULL CHECK (target_policy IN ('canonical_only','direct_fallback')),
  representation TEXT NOT NULL CHECK (representation IN ('raw','intent')),
  source_run_id INTEGER,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (scope_id) REFERENCES scopes(scope_id),
  FOREIGN KEY (source_run_id) REFERENCES close_runs(close_run_id)
);

CREATE TABLE IF NOT EXISTS close_run_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  close_run_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  item_number INTEGER NOT NULL,
  target_item_id INTEGER NOT NULL,
  target_number INTEGER NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('close','skip')),
  skip_reason TEXT,
  applied_at TEXT,
  apply_result TEXT,
  FOREIGN KEY (close_run_id) REFERENCES close_runs(close_run_id)
);

CREATE INDEX IF NOT EXISTS idx_close_run_items_run ON close_run_items(close_run_id);

CREATE TABLE IF NOT EXISTS maintainers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  scope_id INTEGER NOT NULL,
  login TEXT NOT NULL,
  UNIQUE(scope_id, login),
  FOREIGN KEY (scope_id) REFERENCES scopes(scope_id)
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Outcome of attempting to persist one decision row. The accepted-edge
/// uniqueness constraint is arbitrated here, at the storage layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecisionWrite {
    Inserted,
    EdgeConflict,
}

/// One judgable unit of work: a source item with its persisted candidate set.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeWorkItem {
    pub candidate_set_id: i64,
    pub source: ItemSnapshot,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseRun {
    pub close_run_id: CloseRunId,
    pub scope_id: ScopeId,
    pub item_type: ItemType,
    pub mode: CloseMode,
    pub min_close: f64,
    pub target_policy: TargetPolicy,
    pub representation: Representation,
    pub source_run_id: Option<CloseRunId>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseRunItem {
    pub item_id: ItemId,
    pub item_number: i64,
    pub target_item_id: ItemId,
    pub target_number: i64,
    pub action: CloseAction,
    pub skip_reason: Option<CloseSkipReason>,
    pub applied_at: Option<String>,
    pub apply_result: Option<String>,
}

fn format_ts(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format timestamp as RFC 3339")
}

fn parse_ts(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC 3339 timestamp in database: {value}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_item_type(value: &str) -> Result<ItemType> {
    ItemType::parse(value).ok_or_else(|| anyhow!("invalid item_type in database: {value}"))
}

fn parse_item_state(value: &str) -> Result<ItemState> {
    ItemState::parse(value).ok_or_else(|| anyhow!("invalid item state in database: {value}"))
}

fn parse_representation(value: &str) -> Result<Representation> {
    Representation::parse(value)
        .ok_or_else(|| anyhow!("invalid representation in database: {value}"))
}

impl SqliteStore {
    /// Open the SQLite store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or fetch the scope row for `org/name`.
    ///
    /// # Errors
    /// Returns an error when the statement fails.
    pub fn upsert_scope(&self, scope: &ScopeRef) -> Result<ScopeId> {
        self.conn
            .execute(
                "INSERT INTO scopes(org, name) VALUES (?1, ?2)
                 ON CONFLICT(org, name) DO NOTHING",
                params![scope.org, scope.name],
            )
            .context("failed to upsert scope")?;

        self.get_scope_id(scope)?
            .ok_or_else(|| anyhow!("scope row missing after upsert: {}", scope.full_name()))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_scope_id(&self, scope: &ScopeRef) -> Result<Option<ScopeId>> {
        let id = self
            .conn
            .query_row(
                "SELECT scope_id FROM scopes WHERE org = ?1 AND name = ?2",
                params![scope.org, scope.name],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up scope")?;

        Ok(id.map(ScopeId))
    }

    /// Insert or replace one item snapshot.
    ///
    /// # Errors
    /// Returns an error when serialization or the statement fails.
    pub fn upsert_item(&self, item: &ItemSnapshot) -> Result<()> {
        let assignees_json =
            serde_json::to_string(&item.assignees).context("failed to serialize assignees")?;
        let created_at = match item.created_at {
            Some(value) => Some(format_ts(value)?),
            None => None,
        };

        self.conn
            .execute(
                "INSERT INTO items(
                    item_id, scope_id, item_type, number, state, title, body, author,
                    assignees_json, assignees_unknown, comment_count, review_comment_count,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(item_id) DO UPDATE SET
                    state = excluded.state,
                    title = excluded.title,
                    body = excluded.body,
                    author = excluded.author,
                    assignees_json = excluded.assignees_json,
                    assignees_unknown = excluded.assignees_unknown,
                    comment_count = excluded.comment_count,
                    review_comment_count = excluded.review_comment_count,
                    created_at = excluded.created_at",
                params![
                    item.item_id.0,
                    item.scope_id.0,
                    item.item_type.as_str(),
                    item.number,
                    item.state.as_str(),
                    item.title,
                    item.body,
                    item.author,
                    assignees_json,
                    i64::from(item.assignees_unknown),
                    item.comment_count,
                    item.review_comment_count,
                    created_at,
                ],
            )
            .with_context(|| format!("failed to upsert item {}", item.item_id))?;

        Ok(())
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_items(&self, scope_id: ScopeId, item_type: ItemType) -> Result<Vec<ItemSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT item_id, scope_id, item_type, number, state, title, body, author,
                        assignees_json, assignees_unknown, comment_count, review_comment_count,
                        created_at
                 FROM items
                 WHERE scope_id = ?1 AND item_type = ?2
                 ORDER BY item_id ASC",
            )
            .context("failed to prepare item listing")?;

        let rows = stmt
            .query_map(params![scope_id.0, item_type.as_str()], item_raw_from_row)
            .context("failed to list items")?;

        let mut items = Vec::new();
        for row in rows {
            let row = row.context("failed to read item row")?;
            items.push(item_from_raw(row)?);
        }
        Ok(items)
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn get_item(&self, item_id: ItemId) -> Result<Option<ItemSnapshot>> {
        let raw = self
            .conn
            .query_row(
                "SELECT item_id, scope_id, item_type, number, state, title, body, author,
                        assignees_json, assignees_unknown, comment_count, review_comment_count,
                        created_at
                 FROM items WHERE item_id = ?1",
                params![item_id.0],
                item_raw_from_row,
            )
            .optional()
            .context("failed to look up item")?;

        match raw {
            Some(row) => Ok(Some(item_from_raw(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn get_item_by_number(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        number: i64,
    ) -> Result<Option<ItemSnapshot>> {
        let raw = self
            .conn
            .query_row(
                "SELECT item_id, scope_id, item_type, number, state, title, body, author,
                        assignees_json, assignees_unknown, comment_count, review_comment_count,
                        created_at
                 FROM items
                 WHERE scope_id = ?1 AND item_type = ?2 AND number = ?3",
                params![scope_id.0, item_type.as_str(), number],
                item_raw_from_row,
            )
            .optional()
            .context("failed to look up item by number")?;

        match raw {
            Some(row) => Ok(Some(item_from_raw(row)?)),
            None => Ok(None),
        }
    }

    /// Persist a candidate set and its ranked members in one transaction.
    ///
    /// # Errors
    /// Returns an error when any statement fails.
    pub fn create_candidate_set(
        &mut self,
        scope_id: ScopeId,
        item_id: ItemId,
        item_type: ItemType,
        representation: Representation,
        candidates: &[Candidate],
        created_at: OffsetDateTime,
    ) -> Result<i64> {
        let created_at = format_ts(created_at)?;
        let tx = self.conn.transaction().context("failed to start candidate-set transaction")?;

        tx.execute(
            "INSERT INTO candidate_sets(scope_id, item_id, item_type, representation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scope_id.0,
                item_id.0,
                item_type.as_str(),
                representation.as_str(),
                created_at,
            ],
        )
        .context("failed to insert candidate set")?;
        let candidate_set_id = tx.last_insert_rowid();

        for candidate in candidates {
            tx.execute(
                "INSERT INTO candidate_set_members(
                    candidate_set_id, candidate_item_id, score, rank
                 ) VALUES (?1, ?2, ?3, ?4)",
                params![candidate_set_id, candidate.item_id.0, candidate.score, candidate.rank],
            )
            .context("failed to insert candidate set member")?;
        }

        tx.commit().context("failed to commit candidate set")?;
        Ok(candidate_set_id)
    }

    /// List judgable work: each open source item with its latest candidate
    /// set for the given representation, candidates in rank order.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_judge_work(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        representation: Representation,
    ) -> Result<Vec<JudgeWorkItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT cs.candidate_set_id, cs.item_id,
                        m.candidate_item_id, m.score, m.rank,
                        c.number, c.state, c.title, c.body
                 FROM candidate_sets cs
                 JOIN items src ON src.item_id = cs.item_id
                 LEFT JOIN candidate_set_members m ON m.candidate_set_id = cs.candidate_set_id
                 LEFT JOIN items c ON c.item_id = m.candidate_item_id
                 WHERE cs.scope_id = ?1
                   AND cs.item_type = ?2
                   AND cs.representation = ?3
                   AND src.state = 'open'
                   AND cs.candidate_set_id = (
                       SELECT max(inner_cs.candidate_set_id)
                       FROM candidate_sets inner_cs
                       WHERE inner_cs.item_id = cs.item_id
                         AND inner_cs.representation = cs.representation
                   )
                 ORDER BY cs.candidate_set_id ASC, m.rank ASC",
            )
            .context("failed to prepare judge work listing")?;

        struct WorkRow {
            candidate_set_id: i64,
            source_item_id: i64,
            candidate: Option<(i64, f64, i64, i64, String, String, Option<String>)>,
        }

        let rows = stmt
            .query_map(
                params![scope_id.0, item_type.as_str(), representation.as_str()],
                |row| {
                    let candidate_item_id: Option<i64> = row.get(2)?;
                    let candidate = match candidate_item_id {
                        None => None,
                        Some(id) => Some((
                            id,
                            row.get::<_, f64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, Option<String>>(8)?,
                        )),
                    };
                    Ok(WorkRow {
                        candidate_set_id: row.get(0)?,
                        source_item_id: row.get(1)?,
                        candidate,
                    })
                },
            )
            .context("failed to list judge work")?;

        let mut grouped: BTreeMap<i64, JudgeWorkItem> = BTreeMap::new();
        for row in rows {
            let row = row.context("failed to read judge work row")?;

            if !grouped.contains_key(&row.candidate_set_id) {
                let source = self
                    .get_item(ItemId(row.source_item_id))?
                    .ok_or_else(|| anyhow!("source item {} missing", row.source_item_id))?;
                grouped.insert(
                    row.candidate_set_id,
                    JudgeWorkItem {
                        candidate_set_id: row.candidate_set_id,
                        source,
                        candidates: Vec::new(),
                    },
                );
            }

            if let Some((item_id, score, rank, number, state, title, body)) = row.candidate {
                if let Some(entry) = grouped.get_mut(&row.candidate_set_id) {
                    entry.candidates.push(Candidate {
                        item_id: ItemId(item_id),
                        number,
                        state: parse_item_state(&state)?,
                        title,
                        body,
                        score,
                        rank,
                    });
                }
            }
        }

        Ok(grouped.into_values().collect())
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn has_accepted_edge(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        source_item_id: ItemId,
        representation: Representation,
    ) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM decisions
                 WHERE scope_id = ?1 AND item_type = ?2 AND source_item_id = ?3
                   AND representation = ?4 AND final_status = 'accepted'
                 LIMIT 1",
                params![
                    scope_id.0,
                    item_type.as_str(),
                    source_item_id.0,
                    representation.as_str(),
                ],
                |_| Ok(()),
            )
            .optional()
            .context("failed to check for accepted edge")?;

        Ok(found.is_some())
    }

    /// Append one decision row. A losing writer racing on the accepted-edge
    /// unique index observes `DecisionWrite::EdgeConflict` instead of an
    /// error; every other failure propagates.
    ///
    /// # Errors
    /// Returns an error when the insert fails for any non-constraint reason.
    pub fn insert_decision(&self, decision: &DecisionRecord) -> Result<DecisionWrite> {
        match Self::execute_decision_insert(&self.conn, decision) {
            Ok(()) => Ok(DecisionWrite::Inserted),
            Err(err) if decision.final_status == FinalStatus::Accepted
                && is_unique_violation(&err) =>
            {
                Ok(DecisionWrite::EdgeConflict)
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to insert decision {}", decision.decision_id)
            }),
        }
    }

    fn execute_decision_insert(
        conn: &Connection,
        decision: &DecisionRecord,
    ) -> rusqlite::Result<()> {
        let created_at = decision
            .created_at
            .format(&Rfc3339)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;

        conn.execute(
            "INSERT INTO decisions(
                decision_id, scope_id, item_type, source_item_id, candidate_set_id,
                target_item_id, model_is_duplicate, final_status, confidence, reasoning,
                relation, root_cause_match, scope_relation, path_match, certainty,
                veto_reason, min_edge, representation, created_by, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                       ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                decision.decision_id.to_string(),
                decision.scope_id.0,
                decision.item_type.as_str(),
                decision.source_item_id.0,
                decision.candidate_set_id,
                decision.target_item_id.map(|id| id.0),
                i64::from(decision.model_is_duplicate),
                decision.final_status.as_str(),
                decision.confidence,
                decision.reasoning,
                decision.signals.relation.map(dedup_kernel_core::Relation::as_str),
                decision.signals.root_cause_match.map(dedup_kernel_core::RootCauseMatch::as_str),
                decision.signals.scope_relation.map(dedup_kernel_core::ScopeRelation::as_str),
                decision.signals.path_match.map(|value| match value {
                    dedup_kernel_core::PathMatch::Same => "same",
                    dedup_kernel_core::PathMatch::Different => "different",
                    dedup_kernel_core::PathMatch::Unknown => "unknown",
                }),
                decision.signals.certainty.map(|value| match value {
                    dedup_kernel_core::Certainty::Sure => "sure",
                    dedup_kernel_core::Certainty::Unsure => "unsure",
                }),
                decision.veto_reason,
                decision.min_edge,
                decision.representation.as_str(),
                decision.created_by,
                created_at,
            ],
        )?;

        Ok(())
    }

    /// Atomic rejudge supersession: demote the prior accepted row and insert
    /// the replacement in one transaction.
    ///
    /// # Errors
    /// Returns an error when either statement fails; on error nothing is
    /// applied.
    pub fn supersede_and_insert(&mut self, decision: &DecisionRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start rejudge transaction")?;

        tx.execute(
            "UPDATE decisions
             SET final_status = 'rejected',
                 veto_reason = coalesce(veto_reason, 'superseded_by_rejudge')
             WHERE scope_id = ?1 AND item_type = ?2 AND source_item_id = ?3
               AND representation = ?4 AND final_status = 'accepted'",
            params![
                decision.scope_id.0,
                decision.item_type.as_str(),
                decision.source_item_id.0,
                decision.representation.as_str(),
            ],
        )
        .context("failed to demote superseded decision")?;

        Self::execute_decision_insert(&tx, decision)
            .with_context(|| format!("failed to insert rejudge decision {}", decision.decision_id))?;

        tx.commit().context("failed to commit rejudge transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_accepted_edges(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        representation: Representation,
    ) -> Result<Vec<AcceptedEdge>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_item_id, target_item_id, confidence
                 FROM decisions
                 WHERE scope_id = ?1 AND item_type = ?2 AND representation = ?3
                   AND final_status = 'accepted'
                 ORDER BY decision_id ASC",
            )
            .context("failed to prepare accepted edge listing")?;

        let rows = stmt
            .query_map(
                params![scope_id.0, item_type.as_str(), representation.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .context("failed to list accepted edges")?;

        let mut edges = Vec::new();
        for row in rows {
            let (source, target, confidence) = row.context("failed to read edge row")?;
            let target = target
                .ok_or_else(|| anyhow!("accepted decision for item {source} has no target"))?;
            edges.push(AcceptedEdge {
                source: ItemId(source),
                target: ItemId(target),
                confidence,
            });
        }
        Ok(edges)
    }

    /// Snapshot every item touched by an accepted edge, keyed by item id.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn items_for_close_planning(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        representation: Representation,
    ) -> Result<BTreeMap<ItemId, ItemSnapshot>> {
        let edges = self.list_accepted_edges(scope_id, item_type, representation)?;

        let mut ids = BTreeSet::new();
        for edge in &edges {
            ids.insert(edge.source);
            ids.insert(edge.target);
        }

        let mut items = BTreeMap::new();
        for item_id in ids {
            if let Some(item) = self.get_item(item_id)? {
                items.insert(item_id, item);
            }
        }
        Ok(items)
    }

    /// Replace the privileged-login set for a scope.
    ///
    /// # Errors
    /// Returns an error when any statement fails.
    pub fn set_maintainers(&mut self, scope_id: ScopeId, logins: &[String]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start maintainer transaction")?;

        tx.execute("DELETE FROM maintainers WHERE scope_id = ?1", params![scope_id.0])
            .context("failed to clear maintainers")?;
        for login in logins {
            tx.execute(
                "INSERT INTO maintainers(scope_id, login) VALUES (?1, ?2)
                 ON CONFLICT(scope_id, login) DO NOTHING",
                params![scope_id.0, login.to_lowercase()],
            )
            .context("failed to insert maintainer")?;
        }

        tx.commit().context("failed to commit maintainer transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_maintainers(&self, scope_id: ScopeId) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT login FROM maintainers WHERE scope_id = ?1 ORDER BY login ASC")
            .context("failed to prepare maintainer listing")?;

        let rows = stmt
            .query_map(params![scope_id.0], |row| row.get::<_, String>(0))
            .context("failed to list maintainers")?;

        let mut logins = BTreeSet::new();
        for row in rows {
            logins.insert(row.context("failed to read maintainer row")?);
        }
        Ok(logins)
    }

    /// Persist a close run header plus its per-item rows in one transaction.
    ///
    /// # Errors
    /// Returns an error when any statement fails.
    #[allow(clippy::too_many_arguments)]
    pub fn create_close_run(
        &mut self,
        scope_id: ScopeId,
        item_type: ItemType,
        mode: CloseMode,
        min_close: f64,
        target_policy: TargetPolicy,
        representation: Representation,
        source_run_id: Option<CloseRunId>,
        created_by: &str,
        created_at: OffsetDateTime,
        entries: &[CloseRunItem],
    ) -> Result<CloseRunId> {
        let created_at = format_ts(created_at)?;
        let tx = self.conn.transaction().context("failed to start close-run transaction")?;

        tx.execute(
            "INSERT INTO close_runs(
                scope_id, item_type, mode, min_close, target_policy, representation,
                source_run_id, created_by, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                scope_id.0,
                item_type.as_str(),
                mode.as_str(),
                min_close,
                target_policy.as_str(),
                representation.as_str(),
                source_run_id.map(|id| id.0),
                created_by,
                created_at,
            ],
        )
        .context("failed to insert close run")?;
        let close_run_id = tx.last_insert_rowid();

        for entry in entries {
            tx.execute(
                "INSERT INTO close_run_items(
                    close_run_id, item_id, item_number, target_item_id, target_number,
                    action, skip_reason, applied_at, apply_result
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    close_run_id,
                    entry.item_id.0,
                    entry.item_number,
                    entry.target_item_id.0,
                    entry.target_number,
                    entry.action.as_str(),
                    entry.skip_reason.map(CloseSkipReason::as_str),
                    entry.applied_at,
                    entry.apply_result,
                ],
            )
            .context("failed to insert close run item")?;
        }

        tx.commit().context("failed to commit close run")?;
        Ok(CloseRunId(close_run_id))
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn get_close_run(&self, close_run_id: CloseRunId) -> Result<Option<CloseRun>> {
        let raw = self
            .conn
            .query_row(
                "SELECT close_run_id, scope_id, item_type, mode, min_close, target_policy,
                        representation, source_run_id, created_by, created_at
                 FROM close_runs WHERE close_run_id = ?1",
                params![close_run_id.0],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()
            .context("failed to look up close run")?;

        let Some((
            id,
            scope_id,
            item_type,
            mode,
            min_close,
            target_policy,
            representation,
            source_run_id,
            created_by,
            created_at,
        )) = raw
        else {
            return Ok(None);
        };

        Ok(Some(CloseRun {
            close_run_id: CloseRunId(id),
            scope_id: ScopeId(scope_id),
            item_type: parse_item_type(&item_type)?,
            mode: CloseMode::parse(&mode)
                .ok_or_else(|| anyhow!("invalid close run mode in database: {mode}"))?,
            min_close,
            target_policy: TargetPolicy::parse(&target_policy).ok_or_else(|| {
                anyhow!("invalid close run target policy in database: {target_policy}")
            })?,
            representation: parse_representation(&representation)?,
            source_run_id: source_run_id.map(CloseRunId),
            created_by,
            created_at: parse_ts(&created_at)?,
        }))
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_close_run_items(&self, close_run_id: CloseRunId) -> Result<Vec<CloseRunItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT item_id, item_number, target_item_id, target_number, action,
                        skip_reason, applied_at, apply_result
                 FROM close_run_items
                 WHERE close_run_id = ?1
                 ORDER BY item_number ASC",
            )
            .context("failed to prepare close run item listing")?;

        let rows = stmt
            .query_map(params![close_run_id.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .context("failed to list close run items")?;

        let mut items = Vec::new();
        for row in rows {
            let (
                item_id,
                item_number,
                target_item_id,
                target_number,
                action,
                skip_reason,
                applied_at,
                apply_result,
            ) = row.context("failed to read close run item row")?;

            let skip_reason = match skip_reason {
                None => None,
                Some(value) => Some(CloseSkipReason::parse(&value).ok_or_else(|| {
                    anyhow!("invalid close run skip reason in database: {value}")
                })?),
            };

            items.push(CloseRunItem {
                item_id: ItemId(item_id),
                item_number,
                target_item_id: ItemId(target_item_id),
                target_number,
                action: CloseAction::parse(&action)
                    .ok_or_else(|| anyhow!("invalid close run action in database: {action}"))?,
                skip_reason,
                applied_at,
                apply_result,
            });
        }
        Ok(items)
    }

    /// Record the per-item execution result on an apply run.
    ///
    /// # Errors
    /// Returns an error when the update fails or touches no row.
    pub fn record_apply_result(
        &self,
        close_run_id: CloseRunId,
        item_id: ItemId,
        applied_at: OffsetDateTime,
        apply_result: &str,
    ) -> Result<()> {
        let applied_at = format_ts(applied_at)?;
        let updated = self
            .conn
            .execute(
                "UPDATE close_run_items
                 SET applied_at = ?1, apply_result = ?2
                 WHERE close_run_id = ?3 AND item_id = ?4",
                params![applied_at, apply_result, close_run_id.0, item_id.0],
            )
            .context("failed to record apply result")?;

        if updated == 0 {
            return Err(anyhow!(
                "no close run item for run {close_run_id} item {item_id}"
            ));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_decisions_for_source(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        source_item_id: ItemId,
        representation: Representation,
    ) -> Result<Vec<DecisionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT decision_id, scope_id, item_type, source_item_id, candidate_set_id,
                        target_item_id, model_is_duplicate, final_status, confidence, reasoning,
                        relation, root_cause_match, scope_relation, path_match, certainty,
                        veto_reason, min_edge, representation, created_by, created_at
                 FROM decisions
                 WHERE scope_id = ?1 AND item_type = ?2 AND source_item_id = ?3
                   AND representation = ?4
                 ORDER BY decision_id ASC",
            )
            .context("failed to prepare decision listing")?;

        let rows = stmt
            .query_map(
                params![
                    scope_id.0,
                    item_type.as_str(),
                    source_item_id.0,
                    representation.as_str(),
                ],
                decision_raw_from_row,
            )
            .context("failed to list decisions")?;

        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(decision_from_raw(row.context("failed to read decision row")?)?);
        }
        Ok(decisions)
    }

    /// Count decisions grouped by final status, for run reports.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn count_decisions_by_status(
        &self,
        scope_id: ScopeId,
        item_type: ItemType,
        representation: Representation,
    ) -> Result<BTreeMap<String, i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT final_status, count(*) FROM decisions
                 WHERE scope_id = ?1 AND item_type = ?2 AND representation = ?3
                 GROUP BY final_status",
            )
            .context("failed to prepare decision counts")?;

        let rows = stmt
            .query_map(
                params![scope_id.0, item_type.as_str(), representation.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("failed to count decisions")?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("failed to read decision count row")?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

struct ItemRaw {
    item_id: i64,
    scope_id: i64,
    item_type: String,
    number: i64,
    state: String,
    title: String,
    body: Option<String>,
    author: Option<String>,
    assignees_json: String,
    assignees_unknown: i64,
    comment_count: i64,
    review_comment_count: i64,
    created_at: Option<String>,
}

fn item_raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRaw> {
    Ok(ItemRaw {
        item_id: row.get(0)?,
        scope_id: row.get(1)?,
        item_type: row.get(2)?,
        number: row.get(3)?,
        state: row.get(4)?,
        title: row.get(5)?,
        body: row.get(6)?,
        author: row.get(7)?,
        assignees_json: row.get(8)?,
        assignees_unknown: row.get(9)?,
        comment_count: row.get(10)?,
        review_comment_count: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn item_from_raw(raw: ItemRaw) -> Result<ItemSnapshot> {
    let assignees: Vec<String> = serde_json::from_str(&raw.assignees_json)
        .context("invalid assignees_json in database")?;
    let created_at = match raw.created_at {
        None => None,
        Some(value) => Some(parse_ts(&value)?),
    };

    Ok(ItemSnapshot {
        item_id: ItemId(raw.item_id),
        scope_id: ScopeId(raw.scope_id),
        item_type: parse_item_type(&raw.item_type)?,
        number: raw.number,
        state: parse_item_state(&raw.state)?,
        title: raw.title,
        body: raw.body,
        author: raw.author,
        assignees,
        assignees_unknown: raw.assignees_unknown != 0,
        comment_count: raw.comment_count,
        review_comment_count: raw.review_comment_count,
        created_at,
    })
}

struct DecisionRaw {
    decision_id: String,
    scope_id: i64,
    item_type: String,
    source_item_id: i64,
    candidate_set_id: Option<i64>,
    target_item_id: Option<i64>,
    model_is_duplicate: i64,
    final_status: String,
    confidence: f64,
    reasoning: String,
    relation: Option<String>,
    root_cause_match: Option<String>,
    scope_relation: Option<String>,
    path_match: Option<String>,
    certainty: Option<String>,
    veto_reason: Option<String>,
    min_edge: f64,
    representation: String,
    created_by: String,
    created_at: String,
}

fn decision_raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRaw> {
    Ok(DecisionRaw {
        decision_id: row.get(0)?,
        scope_id: row.get(1)?,
        item_type: row.get(2)?,
        source_item_id: row.get(3)?,
        candidate_set_id: row.get(4)?,
        target_item_id: row.get(5)?,
        model_is_duplicate: row.get(6)?,
        final_status: row.get(7)?,
        confidence: row.get(8)?,
        reasoning: row.get(9)?,
        relation: row.get(10)?,
        root_cause_match: row.get(11)?,
        scope_relation: row.get(12)?,
        path_match: row.get(13)?,
        certainty: row.get(14)?,
        veto_reason: row.get(15)?,
        min_edge: row.get(16)?,
        representation: row.get(17)?,
        created_by: row.get(18)?,
        created_at: row.get(19)?,
    })
}

fn parse_signal<T>(
    value: Option<&str>,
    label: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => parse(raw)
            .map(Some)
            .ok_or_else(|| anyhow!("invalid {label} in database: {raw}")),
    }
}

fn decision_from_raw(raw: DecisionRaw) -> Result<DecisionRecord> {
    let ulid = Ulid::from_str(&raw.decision_id)
        .with_context(|| format!("invalid decision_id in database: {}", raw.decision_id))?;

    let signals = VerdictSignals {
        relation: parse_signal(raw.relation.as_deref(), "relation", |value| match value {
            "same_instance" => Some(dedup_kernel_core::Relation::SameInstance),
            "related_followup" => Some(dedup_kernel_core::Relation::RelatedFollowup),
            "partial_overlap" => Some(dedup_kernel_core::Relation::PartialOverlap),
            "different" => Some(dedup_kernel_core::Relation::Different),
            _ => None,
        })?,
        root_cause_match: parse_signal(
            raw.root_cause_match.as_deref(),
            "root_cause_match",
            |value| match value {
                "same" => Some(dedup_kernel_core::RootCauseMatch::Same),
                "adjacent" => Some(dedup_kernel_core::RootCauseMatch::Adjacent),
                "different" => Some(dedup_kernel_core::RootCauseMatch::Different),
                _ => None,
            },
        )?,
        scope_relation: parse_signal(
            raw.scope_relation.as_deref(),
            "scope_relation",
            |value| match value {
                "same_scope" => Some(dedup_kernel_core::ScopeRelation::SameScope),
                "source_subset" => Some(dedup_kernel_core::ScopeRelation::SourceSubset),
                "source_superset" => Some(dedup_kernel_core::ScopeRelation::SourceSuperset),
                "partial_overlap" => Some(dedup_kernel_core::ScopeRelation::PartialOverlap),
                "different_scope" => Some(dedup_kernel_core::ScopeRelation::DifferentScope),
                _ => None,
            },
        )?,
        path_match: parse_signal(raw.path_match.as_deref(), "path_match", |value| match value {
            "same" => Some(dedup_kernel_core::PathMatch::Same),
            "different" => Some(dedup_kernel_core::PathMatch::Different),
            "unknown" => Some(dedup_kernel_core::PathMatch::Unknown),
            _ => None,
        })?,
        certainty: parse_signal(raw.certainty.as_deref(), "certainty", |value| match value {
            "sure" => Some(dedup_kernel_core::Certainty::Sure),
            "unsure" => Some(dedup_kernel_core::Certainty::Unsure),
            _ => None,
        })?,
    };

    Ok(DecisionRecord {
        decision_id: DecisionId(ulid),
        scope_id: ScopeId(raw.scope_id),
        item_type: parse_item_type(&raw.item_type)?,
        source_item_id: ItemId(raw.source_item_id),
        candidate_set_id: raw.candidate_set_id,
        target_item_id: raw.target_item_id.map(ItemId),
        model_is_duplicate: raw.model_is_duplicate != 0,
        final_status: FinalStatus::parse(&raw.final_status)
            .ok_or_else(|| anyhow!("invalid final_status in database: {}", raw.final_status))?,
        confidence: raw.confidence,
        reasoning: raw.reasoning,
        signals,
        veto_reason: raw.veto_reason,
        min_edge: raw.min_edge,
        representation: parse_representation(&raw.representation)?,
        created_by: raw.created_by,
        created_at: parse_ts(&raw.created_at)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT max(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()
        .context("failed to read schema version")?
        .flatten();

    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let applied_at = format_ts(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, applied_at],
    )
    .context("failed to record schema version")?;
    Ok(())
}
