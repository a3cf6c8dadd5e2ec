use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dedup_kernel_core::{
    build_close_plan, Candidate, CloseAction, CloseMode, ClosePolicy, CloseRunId,
    DecisionId, DecisionRecord, DefaultActivityScorer, FinalStatus, ItemId, ItemSnapshot,
    ItemType, JudgePolicy, PlanEntry, PlanStats, Representation, ScopeRef, SkipReasonCode,
    TargetPolicy, Verdict, VerdictEvaluation, VerdictSignals, REASONING_MAX_CHARS,
};
use dedup_kernel_store_sqlite::{CloseRun, CloseRunItem, DecisionWrite, JudgeWorkItem, SqliteStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// Worth retrying: rate limits, timeouts, transport failures.
    #[error("transient oracle failure: {0}")]
    Transient(String),
    /// Not worth retrying: auth failures, malformed request, missing input.
    #[error("permanent oracle failure: {0}")]
    Permanent(String),
}

#[derive(Debug, thiserror::Error)]
#[error("mutation gateway failure: {0}")]
pub struct GatewayError(pub String);

/// One source item plus its candidate set, as handed to the judge.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeRequest {
    pub source: ItemSnapshot,
    pub candidates: Vec<Candidate>,
}

pub trait JudgeOracle: Sync {
    /// # Errors
    /// Returns [`OracleError`] when a verdict cannot be produced.
    fn judge(&self, request: &JudgeRequest) -> Result<Verdict, OracleError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseRequest {
    pub scope: ScopeRef,
    pub item_type: ItemType,
    pub item_number: i64,
    pub target_number: i64,
    pub comment: String,
}

pub trait MutationGateway: Sync {
    /// # Errors
    /// Returns [`GatewayError`] when the mutation cannot be applied.
    fn close_duplicate(&self, request: &CloseRequest) -> Result<serde_json::Value, GatewayError>;
}

pub trait MaintainerResolver {
    /// Resolve the privileged-login set for a scope. Total failure here must
    /// abort planning rather than degrade to an empty set.
    ///
    /// # Errors
    /// Returns an error when the set cannot be determined.
    fn maintainers(&self, scope: &ScopeRef) -> Result<BTreeSet<String>>;
}

/// Maintainer resolver backed by the store's `maintainers` table. An empty
/// set is treated as "unknown", never as "no maintainers".
pub struct StoreMaintainerResolver<'a> {
    pub store: &'a SqliteStore,
}

impl MaintainerResolver for StoreMaintainerResolver<'_> {
    fn maintainers(&self, scope: &ScopeRef) -> Result<BTreeSet<String>> {
        let scope_id = self
            .store
            .get_scope_id(scope)?
            .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;
        let maintainers = self.store.list_maintainers(scope_id)?;
        if maintainers.is_empty() {
            bail!(
                "no maintainers recorded for {}; refusing to plan without a privilege set",
                scope.full_name()
            );
        }
        Ok(maintainers)
    }
}

pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const RETRY_JITTER_MAX_SECS: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base: Duration::from_secs(1),
            cap: DEFAULT_RETRY_CAP,
        }
    }
}

#[must_use]
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let scaled = policy.base.saturating_mul(1_u32 << exponent);
    scaled.min(policy.cap)
}

/// Run `op` with exponential backoff plus uniform jitter. Permanent failures
/// short-circuit; only transient failures are retried.
///
/// # Errors
/// Returns the final [`OracleError`] when every attempt fails.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut(u32) -> Result<T, OracleError>,
) -> Result<T, OracleError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err @ OracleError::Permanent(_)) => return Err(err),
            Err(err) => {
                if attempt < attempts {
                    let jitter = rand::thread_rng().gen_range(0.0..RETRY_JITTER_MAX_SECS);
                    std::thread::sleep(
                        backoff_delay(policy, attempt) + Duration::from_secs_f64(jitter),
                    );
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| OracleError::Permanent("no attempts made".to_string())))
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub min_edge: f64,
    pub min_gap: f64,
    pub rejudge: bool,
    pub workers: usize,
    pub representation: Representation,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct JudgeReport {
    pub work_items: usize,
    pub judged: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub edge_conflicts: usize,
    pub oracle_errors: usize,
    pub existing_edges: usize,
    pub superseded: usize,
    pub cancelled: bool,
}

impl JudgeReport {
    fn absorb(&mut self, other: &Self) {
        self.work_items += other.work_items;
        self.judged += other.judged;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.edge_conflicts += other.edge_conflicts;
        self.oracle_errors += other.oracle_errors;
        self.existing_edges += other.existing_edges;
        self.superseded += other.superseded;
        self.cancelled |= other.cancelled;
    }
}

fn truncate_reason(message: &str) -> String {
    message.trim().chars().take(REASONING_MAX_CHARS).collect()
}

fn decision_base(
    work: &JudgeWorkItem,
    config: &JudgeConfig,
    now: OffsetDateTime,
) -> DecisionRecord {
    DecisionRecord {
        decision_id: DecisionId::new(),
        scope_id: work.source.scope_id,
        item_type: work.source.item_type,
        source_item_id: work.source.item_id,
        candidate_set_id: Some(work.candidate_set_id),
        target_item_id: None,
        model_is_duplicate: false,
        final_status: FinalStatus::Skipped,
        confidence: 0.0,
        reasoning: String::new(),
        signals: VerdictSignals::default(),
        veto_reason: None,
        min_edge: config.min_edge,
        representation: config.representation,
        created_by: config.created_by.clone(),
        created_at: now,
    }
}

#[allow(clippy::too_many_lines)]
fn process_work_item(
    store: &mut SqliteStore,
    work: &JudgeWorkItem,
    config: &JudgeConfig,
    oracle: &dyn JudgeOracle,
    retry: &RetryPolicy,
    report: &mut JudgeReport,
) -> Result<()> {
    report.work_items += 1;
    let now = OffsetDateTime::now_utc();

    let has_edge = store.has_accepted_edge(
        work.source.scope_id,
        work.source.item_type,
        work.source.item_id,
        config.representation,
    )?;
    if has_edge && !config.rejudge {
        let mut decision = decision_base(work, config, now);
        decision.reasoning = "accepted edge already recorded".to_string();
        decision.veto_reason = Some(SkipReasonCode::ExistingAcceptedEdge.as_str().to_string());
        store.insert_decision(&decision)?;
        report.skipped += 1;
        report.existing_edges += 1;
        return Ok(());
    }

    let request = JudgeRequest {
        source: work.source.clone(),
        candidates: work.candidates.clone(),
    };
    info!(
        event = "judge.start",
        source_number = work.source.number,
        candidates = work.candidates.len(),
    );

    let verdict = match retry_with_backoff(retry, |_attempt| oracle.judge(&request)) {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(event = "judge.oracle_failed", source_number = work.source.number, error = %err);
            let mut decision = decision_base(work, config, now);
            decision.reasoning = truncate_reason(&err.to_string());
            decision.veto_reason = Some(SkipReasonCode::OracleError.as_str().to_string());
            store.insert_decision(&decision)?;
            report.skipped += 1;
            report.oracle_errors += 1;
            return Ok(());
        }
    };

    report.judged += 1;
    let policy = JudgePolicy { min_edge: config.min_edge, min_gap: config.min_gap };
    let evaluation = evaluate(work, &verdict, &policy);

    let mut decision = decision_base(work, config, now);
    decision.model_is_duplicate = verdict.is_duplicate;
    decision.confidence = verdict.confidence;
    decision.reasoning = verdict.normalized_reasoning();
    decision.signals = verdict.signals;
    decision.final_status = evaluation.final_status();
    decision.veto_reason = evaluation.reason_code();

    match &evaluation {
        VerdictEvaluation::Accepted { target, confidence } => {
            decision.target_item_id = Some(*target);
            decision.confidence = *confidence;
        }
        VerdictEvaluation::Rejected { target, .. } => {
            decision.target_item_id = *target;
        }
        VerdictEvaluation::Skipped { .. } => {}
    }

    info!(
        event = "judge.complete",
        source_number = work.source.number,
        final_status = decision.final_status.as_str(),
        reason = decision.veto_reason.as_deref().unwrap_or(""),
    );

    if decision.final_status == FinalStatus::Accepted && config.rejudge && has_edge {
        store.supersede_and_insert(&decision)?;
        report.accepted += 1;
        report.superseded += 1;
        return Ok(());
    }

    match store.insert_decision(&decision)? {
        DecisionWrite::Inserted => match decision.final_status {
            FinalStatus::Accepted => report.accepted += 1,
            FinalStatus::Rejected => report.rejected += 1,
            FinalStatus::Skipped => report.skipped += 1,
        },
        DecisionWrite::EdgeConflict => {
            // Lost the accepted-edge race to a concurrent worker. Record the
            // loss as an auditable skip; never fail the batch.
            warn!(event = "judge.edge_conflict", source_number = work.source.number);
            let mut conflict = decision_base(work, config, OffsetDateTime::now_utc());
            conflict.model_is_duplicate = decision.model_is_duplicate;
            conflict.target_item_id = decision.target_item_id;
            conflict.confidence = decision.confidence;
            conflict.reasoning = decision.reasoning;
            conflict.signals = decision.signals;
            conflict.veto_reason = Some(SkipReasonCode::EdgeConflict.as_str().to_string());
            store.insert_decision(&conflict)?;
            report.skipped += 1;
            report.edge_conflicts += 1;
        }
    }

    Ok(())
}

fn evaluate(work: &JudgeWorkItem, verdict: &Verdict, policy: &JudgePolicy) -> VerdictEvaluation {
    dedup_kernel_core::evaluate_verdict(&work.source, &work.candidates, verdict, policy)
}

/// Judge every work item for one scope and item type, recording a decision
/// row per item. Workers share nothing but the database; the storage
/// uniqueness constraint arbitrates accepted-edge races.
///
/// # Errors
/// Returns an error when the scope is unknown or any worker hits a
/// non-recoverable storage failure.
pub fn run_judge(
    db_path: &Path,
    scope: &ScopeRef,
    item_type: ItemType,
    config: &JudgeConfig,
    oracle: &dyn JudgeOracle,
    retry: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<JudgeReport> {
    let store = SqliteStore::open(db_path)?;
    let scope_id = store
        .get_scope_id(scope)?
        .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;
    let work_items = store.list_judge_work(scope_id, item_type, config.representation)?;
    drop(store);

    if work_items.is_empty() {
        return Ok(JudgeReport::default());
    }

    let worker_count = config.workers.max(1).min(work_items.len());
    let next = AtomicUsize::new(0);
    let items = work_items.as_slice();

    let partials = std::thread::scope(|thread_scope| -> Result<Vec<JudgeReport>> {
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let next = &next;
            handles.push(thread_scope.spawn(move || -> Result<JudgeReport> {
                let mut worker_store = SqliteStore::open(db_path)?;
                let mut report = JudgeReport::default();

                loop {
                    if cancel.load(Ordering::SeqCst) {
                        report.cancelled = true;
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(work) = items.get(index) else {
                        break;
                    };
                    process_work_item(
                        &mut worker_store,
                        work,
                        config,
                        oracle,
                        retry,
                        &mut report,
                    )?;
                }

                Ok(report)
            }));
        }

        let mut partials = Vec::with_capacity(handles.len());
        for handle in handles {
            let partial = handle
                .join()
                .map_err(|_| anyhow!("judge worker panicked"))??;
            partials.push(partial);
        }
        Ok(partials)
    })?;

    let mut report = JudgeReport::default();
    for partial in &partials {
        report.absorb(partial);
    }

    info!(
        event = "judge.batch_complete",
        work_items = report.work_items,
        accepted = report.accepted,
        rejected = report.rejected,
        skipped = report.skipped,
        cancelled = report.cancelled,
    );
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub min_close: f64,
    pub target_policy: TargetPolicy,
    pub representation: Representation,
    pub dry_run: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanCloseReport {
    pub close_run_id: Option<CloseRunId>,
    pub stats: PlanStats,
    pub entries: Vec<PlanEntry>,
}

fn plan_entries_to_rows(entries: &[PlanEntry]) -> Vec<CloseRunItem> {
    entries
        .iter()
        .map(|entry| CloseRunItem {
            item_id: entry.item_id,
            item_number: entry.item_number,
            target_item_id: entry.target_item_id,
            target_number: entry.target_number,
            action: entry.action,
            skip_reason: entry.skip_reason,
            applied_at: None,
            apply_result: None,
        })
        .collect()
}

/// Compute and (unless dry-run) persist a close plan for one scope and item
/// type.
///
/// # Errors
/// Returns an error when the scope is unknown, the maintainer set cannot be
/// resolved, or the plan cannot be persisted.
pub fn run_plan_close(
    store: &mut SqliteStore,
    scope: &ScopeRef,
    item_type: ItemType,
    config: &PlanConfig,
    maintainers: &BTreeSet<String>,
) -> Result<PlanCloseReport> {
    let scope_id = store
        .get_scope_id(scope)?
        .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;

    let edges = store.list_accepted_edges(scope_id, item_type, config.representation)?;
    let items = store.items_for_close_planning(scope_id, item_type, config.representation)?;

    let scorer = DefaultActivityScorer { item_type };
    let policy = ClosePolicy { min_close: config.min_close, target_policy: config.target_policy };
    policy.validate().map_err(|err| anyhow!(err))?;

    let outcome = build_close_plan(&edges, &items, maintainers, &scorer, &policy);

    let close_run_id = if config.dry_run {
        None
    } else {
        let rows = plan_entries_to_rows(&outcome.entries);
        Some(store.create_close_run(
            scope_id,
            item_type,
            CloseMode::Plan,
            config.min_close,
            config.target_policy,
            config.representation,
            None,
            &config.created_by,
            OffsetDateTime::now_utc(),
            &rows,
        )?)
    };

    info!(
        event = "plan_close.complete",
        close_run_id = close_run_id.map_or(-1, |id| id.0),
        close_actions = outcome.stats.close_actions,
        skip_actions = outcome.stats.skip_actions,
        dry_run = config.dry_run,
    );

    Ok(PlanCloseReport { close_run_id, stats: outcome.stats, entries: outcome.entries })
}

pub const APPROVAL_SCHEMA_VERSION: i64 = 1;

/// Human sign-off for one plan run. The plan hash binds the approval to the
/// exact rows reviewed; any drift invalidates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalCheckpoint {
    pub schema_version: i64,
    pub close_run_id: i64,
    pub scope: String,
    pub item_type: String,
    pub min_close: f64,
    pub plan_sha256: String,
    pub approved_by: String,
    pub approved_at: String,
}

#[must_use]
pub fn compute_plan_hash(entries: &[CloseRunItem]) -> String {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|lhs, rhs| lhs.item_number.cmp(&rhs.item_number));

    let mut hasher = Sha256::new();
    for entry in &sorted {
        let skip = entry.skip_reason.map_or("-", dedup_kernel_core::CloseSkipReason::as_str);
        hasher.update(
            format!(
                "{}|{}|{}|{}\n",
                entry.item_number,
                entry.target_number,
                entry.action.as_str(),
                skip,
            )
            .as_bytes(),
        );
    }
    format!("{:x}", hasher.finalize())
}

/// Build an approval checkpoint for a persisted plan run.
///
/// # Errors
/// Returns an error when the run does not exist or is not a plan run.
pub fn build_approval(
    store: &SqliteStore,
    scope: &ScopeRef,
    close_run_id: CloseRunId,
    approved_by: &str,
) -> Result<ApprovalCheckpoint> {
    let run = store
        .get_close_run(close_run_id)?
        .ok_or_else(|| anyhow!("close run {close_run_id} not found"))?;
    if run.mode != CloseMode::Plan {
        bail!("close run {close_run_id} is not a plan run");
    }

    let entries = store.list_close_run_items(close_run_id)?;
    let approved_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format approval timestamp")?;

    Ok(ApprovalCheckpoint {
        schema_version: APPROVAL_SCHEMA_VERSION,
        close_run_id: close_run_id.0,
        scope: scope.full_name(),
        item_type: run.item_type.as_str().to_string(),
        min_close: run.min_close,
        plan_sha256: compute_plan_hash(&entries),
        approved_by: approved_by.to_string(),
        approved_at,
    })
}

/// # Errors
/// Returns an error when the file cannot be written.
pub fn write_approval(checkpoint: &ApprovalCheckpoint, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(checkpoint)
        .context("failed to serialize approval checkpoint")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write approval checkpoint to {}", path.display()))?;
    Ok(())
}

/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn read_approval(path: &Path) -> Result<ApprovalCheckpoint> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read approval checkpoint at {}", path.display()))?;
    serde_json::from_str(&raw).context("invalid approval checkpoint")
}

fn verify_approval(
    checkpoint: &ApprovalCheckpoint,
    scope: &ScopeRef,
    run: &CloseRun,
    entries: &[CloseRunItem],
) -> Result<()> {
    if checkpoint.close_run_id != run.close_run_id.0 {
        bail!(
            "approval is for close run {}, not {}",
            checkpoint.close_run_id,
            run.close_run_id
        );
    }
    if checkpoint.scope != scope.full_name() {
        bail!("approval is for scope {}, not {}", checkpoint.scope, scope.full_name());
    }
    if checkpoint.item_type != run.item_type.as_str() {
        bail!(
            "approval is for item type {}, not {}",
            checkpoint.item_type,
            run.item_type.as_str()
        );
    }
    if (checkpoint.min_close - run.min_close).abs() > f64::EPSILON {
        bail!("approval min_close {} does not match run", checkpoint.min_close);
    }
    let actual_hash = compute_plan_hash(entries);
    if checkpoint.plan_sha256 != actual_hash {
        bail!("approval plan hash does not match the persisted plan rows");
    }
    if checkpoint.approved_by.trim().is_empty() || checkpoint.approved_at.trim().is_empty() {
        bail!("approval checkpoint is missing approver identity");
    }
    Ok(())
}

#[must_use]
pub fn duplicate_comment(target_number: i64) -> String {
    format!(
        "Closing as a duplicate of #{target_number}. Please follow the linked item for \
         updates, and comment there if your case differs."
    )
}

#[derive(Debug, Clone)]
pub struct ApplyConfig {
    pub yes: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApplyReport {
    pub plan_run_id: CloseRunId,
    pub apply_run_id: CloseRunId,
    pub closed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Execute an approved plan run: copy its rows into a new apply run, then
/// close each planned item through the mutation gateway. Per-item failures
/// are recorded on the apply row and never abort the run.
///
/// # Errors
/// Returns an error when confirmation or the approval gate fails, the run is
/// not a plan run, or the apply run cannot be persisted.
pub fn run_apply_close(
    store: &mut SqliteStore,
    scope: &ScopeRef,
    plan_run_id: CloseRunId,
    approval: &ApprovalCheckpoint,
    gateway: &dyn MutationGateway,
    config: &ApplyConfig,
) -> Result<ApplyReport> {
    if !config.yes {
        bail!("apply requires explicit confirmation (--yes)");
    }

    let run = store
        .get_close_run(plan_run_id)?
        .ok_or_else(|| anyhow!("close run {plan_run_id} not found"))?;
    if run.mode != CloseMode::Plan {
        bail!("close run {plan_run_id} is not a plan run; refusing to apply");
    }

    let entries = store.list_close_run_items(plan_run_id)?;
    verify_approval(approval, scope, &run, &entries)?;

    // Persist the apply run before any mutation so a partial failure still
    // leaves a complete record of what was attempted.
    let apply_run_id = store.create_close_run(
        run.scope_id,
        run.item_type,
        CloseMode::Apply,
        run.min_close,
        run.target_policy,
        run.representation,
        Some(plan_run_id),
        &config.created_by,
        OffsetDateTime::now_utc(),
        &entries,
    )?;

    let mut report = ApplyReport {
        plan_run_id,
        apply_run_id,
        closed: 0,
        failed: 0,
        skipped: 0,
    };

    for entry in &entries {
        if entry.action != CloseAction::Close {
            report.skipped += 1;
            continue;
        }

        let request = CloseRequest {
            scope: scope.clone(),
            item_type: run.item_type,
            item_number: entry.item_number,
            target_number: entry.target_number,
            comment: duplicate_comment(entry.target_number),
        };

        let now = OffsetDateTime::now_utc();
        match gateway.close_duplicate(&request) {
            Ok(result) => {
                store.record_apply_result(apply_run_id, entry.item_id, now, &result.to_string())?;
                report.closed += 1;
            }
            Err(err) => {
                warn!(
                    event = "apply_close.item_failed",
                    item_number = entry.item_number,
                    error = %err,
                );
                let result = serde_json::json!({ "error": err.to_string() }).to_string();
                store.record_apply_result(apply_run_id, entry.item_id, now, &result)?;
                report.failed += 1;
            }
        }
    }

    info!(
        event = "apply_close.complete",
        plan_run_id = plan_run_id.0,
        apply_run_id = apply_run_id.0,
        closed = report.closed,
        failed = report.failed,
    );
    Ok(report)
}
