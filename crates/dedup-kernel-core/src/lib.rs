use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("consistency violation: {0}")]
    Consistency(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScopeId(pub i64);

impl Display for ScopeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemId(pub i64);

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CloseRunId(pub i64);

impl Display for CloseRunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tracked repository in `org/name` form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScopeRef {
    pub org: String,
    pub name: String,
}

impl ScopeRef {
    /// Parse an `org/name` reference.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when either part is empty or the
    /// value is not exactly two `/`-separated parts.
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        let parts = value.trim().split('/').collect::<Vec<_>>();
        if parts.len() != 2 {
            return Err(KernelError::Validation(format!(
                "scope must be in org/name format (received: {value})"
            )));
        }
        let org = parts[0].trim();
        let name = parts[1].trim();
        if org.is_empty() || name.is_empty() {
            return Err(KernelError::Validation("scope parts cannot be empty".to_string()));
        }

        Ok(Self { org: org.to_string(), name: name.to_string() })
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Issue,
    Pr,
}

impl ItemType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "issue" => Some(Self::Issue),
            "pr" => Some(Self::Pr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Open,
    Closed,
}

impl ItemState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Tag distinguishing which retrieval/judgment pipeline produced a decision.
/// Parallel representations never collide on the accepted-edge constraint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Raw,
    Intent,
}

impl Representation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Intent => "intent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw" => Some(Self::Raw),
            "intent" => Some(Self::Intent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Accepted,
    Rejected,
    Skipped,
}

impl FinalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    Plan,
    Apply,
}

impl CloseMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plan" => Some(Self::Plan),
            "apply" => Some(Self::Apply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CloseAction {
    Close,
    Skip,
}

impl CloseAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Skip => "skip",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "close" => Some(Self::Close),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetPolicy {
    CanonicalOnly,
    DirectFallback,
}

impl TargetPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CanonicalOnly => "canonical_only",
            Self::DirectFallback => "direct_fallback",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "canonical_only" => Some(Self::CanonicalOnly),
            "direct_fallback" => Some(Self::DirectFallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    SameInstance,
    RelatedFollowup,
    PartialOverlap,
    Different,
}

impl Relation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameInstance => "same_instance",
            Self::RelatedFollowup => "related_followup",
            Self::PartialOverlap => "partial_overlap",
            Self::Different => "different",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseMatch {
    Same,
    Adjacent,
    Different,
}

impl RootCauseMatch {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Adjacent => "adjacent",
            Self::Different => "different",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeRelation {
    SameScope,
    SourceSubset,
    SourceSuperset,
    PartialOverlap,
    DifferentScope,
}

impl ScopeRelation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameScope => "same_scope",
            Self::SourceSubset => "source_subset",
            Self::SourceSuperset => "source_superset",
            Self::PartialOverlap => "partial_overlap",
            Self::DifferentScope => "different_scope",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    Same,
    Different,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    Sure,
    Unsure,
}

/// Point-in-time view of a tracked work item. Owned by the external item
/// store; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemSnapshot {
    pub item_id: ItemId,
    pub scope_id: ScopeId,
    pub item_type: ItemType,
    pub number: i64,
    pub state: ItemState,
    pub title: String,
    pub body: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub assignees_unknown: bool,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub review_comment_count: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// One ranked retrieval candidate for a source item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub item_id: ItemId,
    pub number: i64,
    pub state: ItemState,
    pub title: String,
    pub body: Option<String>,
    pub score: f64,
    pub rank: i64,
}

/// Structured signals returned by the judge alongside the raw verdict.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerdictSignals {
    pub relation: Option<Relation>,
    pub root_cause_match: Option<RootCauseMatch>,
    pub scope_relation: Option<ScopeRelation>,
    pub path_match: Option<PathMatch>,
    pub certainty: Option<Certainty>,
}

/// Judge oracle output for one source item against its candidate set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub is_duplicate: bool,
    pub duplicate_of: Option<i64>,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(flatten)]
    pub signals: VerdictSignals,
}

pub const REASONING_MAX_CHARS: usize = 240;

impl Verdict {
    /// Validate the verdict against the oracle output schema.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when confidence is outside
    /// `[0, 1]`, reasoning is blank, or `duplicate_of` is inconsistent with
    /// `is_duplicate`.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(KernelError::Validation(
                "confidence must be between 0 and 1".to_string(),
            ));
        }

        if self.reasoning.trim().is_empty() {
            return Err(KernelError::Validation("reasoning cannot be blank".to_string()));
        }

        if self.is_duplicate {
            match self.duplicate_of {
                Some(number) if number > 0 => {}
                _ => {
                    return Err(KernelError::Validation(
                        "duplicate_of must be a positive integer when is_duplicate is true"
                            .to_string(),
                    ));
                }
            }
        } else if !matches!(self.duplicate_of, None | Some(0)) {
            return Err(KernelError::Validation(
                "duplicate_of must be 0 or null when is_duplicate is false".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn normalized_reasoning(&self) -> String {
        let trimmed = self.reasoning.trim();
        trimmed.chars().take(REASONING_MAX_CHARS).collect()
    }
}

/// One append-only decision row. Never mutated in place; supersession is a
/// new row plus a demotion of the prior accepted row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub decision_id: DecisionId,
    pub scope_id: ScopeId,
    pub item_type: ItemType,
    pub source_item_id: ItemId,
    pub candidate_set_id: Option<i64>,
    pub target_item_id: Option<ItemId>,
    pub model_is_duplicate: bool,
    pub final_status: FinalStatus,
    pub confidence: f64,
    pub reasoning: String,
    pub signals: VerdictSignals,
    pub veto_reason: Option<String>,
    pub min_edge: f64,
    pub representation: Representation,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AcceptedEdge {
    pub source: ItemId,
    pub target: ItemId,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkipReasonCode {
    InvalidResponse,
    InvalidTarget,
    NotDuplicate,
    EdgeConflict,
    OracleError,
    ExistingAcceptedEdge,
}

impl SkipReasonCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidResponse => "invalid_response",
            Self::InvalidTarget => "invalid_target",
            Self::NotDuplicate => "not_duplicate",
            Self::EdgeConflict => "edge_conflict",
            Self::OracleError => "oracle_error",
            Self::ExistingAcceptedEdge => "existing_accepted_edge",
        }
    }
}

/// Structural veto: a policy rule that blocks acceptance independent of the
/// raw model confidence.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VetoReason {
    CertaintyUnsure,
    RelationMismatch(Relation),
    RootCauseMismatch(RootCauseMatch),
    ScopeMismatch { scope_relation: ScopeRelation, root_cause: Option<RootCauseMatch> },
    PathMismatchRelation,
    PathMismatchRootCause { root_cause: Option<RootCauseMatch> },
    IntentMismatch { source: IntentKind, target: IntentKind },
}

impl Display for VetoReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CertaintyUnsure => write!(f, "certainty=unsure"),
            Self::RelationMismatch(relation) => write!(f, "relation={}", relation.as_str()),
            Self::RootCauseMismatch(root_cause) => {
                write!(f, "root_cause_match={}", root_cause.as_str())
            }
            Self::ScopeMismatch { scope_relation, root_cause } => {
                let root_label = root_cause.map_or("unknown", RootCauseMatch::as_str);
                write!(
                    f,
                    "scope_relation={}, root_cause_match={root_label}",
                    scope_relation.as_str()
                )
            }
            Self::PathMismatchRelation => {
                write!(f, "path_match=different, relation_not_same_instance")
            }
            Self::PathMismatchRootCause { root_cause } => {
                let root_label = root_cause.map_or("unknown", RootCauseMatch::as_str);
                write!(f, "path_match=different, root_cause_match={root_label}")
            }
            Self::IntentMismatch { source, target } => {
                write!(f, "bug_feature_mismatch:{}_vs_{}", source.as_str(), target.as_str())
            }
        }
    }
}

/// Evaluate the judge's structured signals for a structural veto.
///
/// Order matters: each check is a hard stop, evaluated most-specific first,
/// matching the conservative precision-first policy.
#[must_use]
pub fn structural_veto(verdict: &Verdict) -> Option<VetoReason> {
    if !verdict.is_duplicate {
        return None;
    }

    let signals = &verdict.signals;

    if signals.certainty == Some(Certainty::Unsure) {
        return Some(VetoReason::CertaintyUnsure);
    }

    if let Some(relation) = signals.relation {
        if matches!(
            relation,
            Relation::RelatedFollowup | Relation::PartialOverlap | Relation::Different
        ) {
            return Some(VetoReason::RelationMismatch(relation));
        }
    }

    if let Some(root_cause) = signals.root_cause_match {
        if matches!(root_cause, RootCauseMatch::Adjacent | RootCauseMatch::Different) {
            return Some(VetoReason::RootCauseMismatch(root_cause));
        }
    }

    if let Some(scope_relation) = signals.scope_relation {
        let scope_mismatch = matches!(
            scope_relation,
            ScopeRelation::SourceSubset
                | ScopeRelation::SourceSuperset
                | ScopeRelation::PartialOverlap
                | ScopeRelation::DifferentScope
        );
        if scope_mismatch && signals.root_cause_match != Some(RootCauseMatch::Same) {
            return Some(VetoReason::ScopeMismatch {
                scope_relation,
                root_cause: signals.root_cause_match,
            });
        }
    }

    if signals.path_match == Some(PathMatch::Different) {
        if signals.relation != Some(Relation::SameInstance) {
            return Some(VetoReason::PathMismatchRelation);
        }
        if signals.root_cause_match != Some(RootCauseMatch::Same) {
            return Some(VetoReason::PathMismatchRootCause {
                root_cause: signals.root_cause_match,
            });
        }
    }

    None
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Bug,
    Feature,
    Other,
}

impl IntentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Other => "other",
        }
    }
}

#[must_use]
pub fn normalize_text(value: Option<&str>) -> String {
    match value {
        None => String::new(),
        Some(raw) => raw.replace("\r\n", "\n").replace('\r', "\n").trim().to_string(),
    }
}

const BUG_SIGNALS: &[&str] =
    &["bug", "fix", "error", "fail", "fails", "failing", "broken", "regression"];
const FEATURE_SIGNALS: &[&str] =
    &["feature", "feature request", "proposal", "enhancement", "add support", "support for"];

/// Keyword heuristic classifying an item as bug-report or feature-request.
#[must_use]
pub fn classify_intent(title: &str, body: Option<&str>) -> IntentKind {
    let combined = format!("{title}\n{}", body.unwrap_or(""));
    let text = normalize_text(Some(&combined)).to_lowercase();

    let has_bug = BUG_SIGNALS.iter().any(|signal| text.contains(signal));
    let has_feature = FEATURE_SIGNALS.iter().any(|signal| text.contains(signal));

    if has_bug && !has_feature {
        return IntentKind::Bug;
    }
    if has_feature && !has_bug {
        return IntentKind::Feature;
    }

    let lower_title = normalize_text(Some(title)).to_lowercase();
    if ["fix", "bug", "[bug]"].iter().any(|prefix| lower_title.starts_with(prefix)) {
        return IntentKind::Bug;
    }
    if ["feat", "feature", "[feature", "proposal", "[proposal"]
        .iter()
        .any(|prefix| lower_title.starts_with(prefix))
    {
        return IntentKind::Feature;
    }

    IntentKind::Other
}

/// Veto an accepted edge between a clear bug report and a clear feature
/// request; ambiguous items never veto.
#[must_use]
pub fn intent_mismatch_veto(
    source_title: &str,
    source_body: Option<&str>,
    target_title: &str,
    target_body: Option<&str>,
) -> Option<VetoReason> {
    let source = classify_intent(source_title, source_body);
    let target = classify_intent(target_title, target_body);

    let pair = [source, target];
    if pair.contains(&IntentKind::Bug) && pair.contains(&IntentKind::Feature) {
        return Some(VetoReason::IntentMismatch { source, target });
    }

    None
}

pub const DEFAULT_MIN_GAP: f64 = 0.015;

/// Returns true when the selected candidate's retrieval score does not beat
/// the best alternative by at least `min_gap`.
#[must_use]
pub fn candidate_gap_too_small(
    selected_number: i64,
    candidates: &[Candidate],
    min_gap: f64,
) -> bool {
    if min_gap <= 0.0 {
        return false;
    }

    let mut selected_score: Option<f64> = None;
    let mut best_alternative: Option<f64> = None;

    for candidate in candidates {
        if candidate.number == selected_number {
            selected_score = Some(candidate.score);
            continue;
        }
        if best_alternative.map_or(true, |best| candidate.score > best) {
            best_alternative = Some(candidate.score);
        }
    }

    match (selected_score, best_alternative) {
        (Some(selected), Some(alternative)) => (selected - alternative) < min_gap,
        _ => false,
    }
}

/// Thresholds applied while recording one decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct JudgePolicy {
    pub min_edge: f64,
    pub min_gap: f64,
}

impl JudgePolicy {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `min_edge` is outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !(0.0..=1.0).contains(&self.min_edge) {
            return Err(KernelError::Validation(
                "min_edge must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal outcome of the fail-fast validation pipeline for one verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum VerdictEvaluation {
    Accepted { target: ItemId, confidence: f64 },
    Rejected { target: Option<ItemId>, reason: RejectReason },
    Skipped { reason: SkipReasonCode },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    LowConfidence,
    Veto(VetoReason),
    TargetNotOpen,
    CandidateGapTooSmall,
}

impl RejectReason {
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::LowConfidence => "low_confidence".to_string(),
            Self::Veto(veto) => veto.to_string(),
            Self::TargetNotOpen => "target_not_open".to_string(),
            Self::CandidateGapTooSmall => "candidate_gap_too_small".to_string(),
        }
    }
}

impl VerdictEvaluation {
    #[must_use]
    pub fn final_status(&self) -> FinalStatus {
        match self {
            Self::Accepted { .. } => FinalStatus::Accepted,
            Self::Rejected { .. } => FinalStatus::Rejected,
            Self::Skipped { .. } => FinalStatus::Skipped,
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> Option<String> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { reason, .. } => Some(reason.code()),
            Self::Skipped { reason } => Some(reason.as_str().to_string()),
        }
    }
}

/// Run the fail-fast validation pipeline over one judged verdict.
///
/// Each failure short-circuits to a terminal status with a categorical
/// reason; only a verdict surviving every guardrail is accepted.
#[must_use]
pub fn evaluate_verdict(
    source: &ItemSnapshot,
    candidates: &[Candidate],
    verdict: &Verdict,
    policy: &JudgePolicy,
) -> VerdictEvaluation {
    if verdict.validate().is_err() {
        return VerdictEvaluation::Skipped { reason: SkipReasonCode::InvalidResponse };
    }

    if !verdict.is_duplicate {
        return VerdictEvaluation::Skipped { reason: SkipReasonCode::NotDuplicate };
    }

    let Some(target_number) = verdict.duplicate_of else {
        return VerdictEvaluation::Skipped { reason: SkipReasonCode::InvalidResponse };
    };

    let Some(target) = candidates.iter().find(|candidate| candidate.number == target_number)
    else {
        return VerdictEvaluation::Skipped { reason: SkipReasonCode::InvalidTarget };
    };

    if verdict.confidence < policy.min_edge {
        return VerdictEvaluation::Rejected {
            target: Some(target.item_id),
            reason: RejectReason::LowConfidence,
        };
    }

    if let Some(veto) = structural_veto(verdict) {
        return VerdictEvaluation::Rejected {
            target: Some(target.item_id),
            reason: RejectReason::Veto(veto),
        };
    }

    if let Some(veto) = intent_mismatch_veto(
        &source.title,
        source.body.as_deref(),
        &target.title,
        target.body.as_deref(),
    ) {
        return VerdictEvaluation::Rejected {
            target: Some(target.item_id),
            reason: RejectReason::Veto(veto),
        };
    }

    if target.state != ItemState::Open {
        return VerdictEvaluation::Rejected {
            target: Some(target.item_id),
            reason: RejectReason::TargetNotOpen,
        };
    }

    if candidate_gap_too_small(target_number, candidates, policy.min_gap) {
        return VerdictEvaluation::Rejected {
            target: Some(target.item_id),
            reason: RejectReason::CandidateGapTooSmall,
        };
    }

    VerdictEvaluation::Accepted { target: target.item_id, confidence: verdict.confidence }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self { parent: (0..len).collect(), rank: vec![0; len] }
    }

    // Iterative find with path compression; no recursion on deep chains.
    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        let mut current = node;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }

        root
    }

    fn union(&mut self, left: usize, right: usize) {
        let left_root = self.find(left);
        let right_root = self.find(right);
        if left_root == right_root {
            return;
        }

        match self.rank[left_root].cmp(&self.rank[right_root]) {
            Ordering::Less => self.parent[left_root] = right_root,
            Ordering::Greater => self.parent[right_root] = left_root,
            Ordering::Equal => {
                self.parent[right_root] = left_root;
                self.rank[left_root] += 1;
            }
        }
    }
}

/// Undirected adjacency over accepted decisions, indexed by item identity.
///
/// Item ids are enumerated in sorted order so the computed components (and
/// member order within them) are reproducible across runs over an identical
/// snapshot.
#[derive(Debug, Clone)]
pub struct DuplicateGraph {
    ids: Vec<ItemId>,
    edges: Vec<(usize, usize)>,
}

impl DuplicateGraph {
    #[must_use]
    pub fn from_edges(edges: &[AcceptedEdge]) -> Self {
        let mut id_set = BTreeSet::new();
        for edge in edges {
            id_set.insert(edge.source);
            id_set.insert(edge.target);
        }

        let ids = id_set.into_iter().collect::<Vec<_>>();
        let index = ids
            .iter()
            .copied()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect::<BTreeMap<_, _>>();

        let mut indexed_edges = Vec::with_capacity(edges.len());
        for edge in edges {
            if let (Some(&source), Some(&target)) =
                (index.get(&edge.source), index.get(&edge.target))
            {
                indexed_edges.push((source, target));
            }
        }

        Self { ids, edges: indexed_edges }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Connected components, each sorted by item id, components ordered by
    /// their smallest member.
    #[must_use]
    pub fn clusters(&self) -> Vec<Vec<ItemId>> {
        let mut union_find = UnionFind::new(self.ids.len());
        for &(source, target) in &self.edges {
            union_find.union(source, target);
        }

        let mut members_by_root: BTreeMap<usize, Vec<ItemId>> = BTreeMap::new();
        for position in 0..self.ids.len() {
            let root = union_find.find(position);
            members_by_root.entry(root).or_default().push(self.ids[position]);
        }

        let mut clusters = members_by_root.into_values().collect::<Vec<_>>();
        for cluster in &mut clusters {
            cluster.sort_unstable();
        }
        clusters.sort_by_key(|cluster| cluster.first().copied());
        clusters
    }
}

/// Type-specific combination of discussion counters. A policy choice, so it
/// is pluggable rather than a hardcoded formula.
pub trait ActivityScorer {
    fn score(&self, item: &ItemSnapshot) -> i64;
}

#[derive(Debug, Clone, Copy)]
pub struct DefaultActivityScorer {
    pub item_type: ItemType,
}

impl ActivityScorer for DefaultActivityScorer {
    fn score(&self, item: &ItemSnapshot) -> i64 {
        match self.item_type {
            ItemType::Issue => item.comment_count,
            ItemType::Pr => item.comment_count + item.review_comment_count,
        }
    }
}

const LATIN_CONTENT_MIN_RATIO: f64 = 0.8;

/// Lightweight content-eligibility heuristic: the canonical should carry a
/// mostly Latin-script title so it stays searchable for the widest audience.
#[must_use]
pub fn is_latin_content(title: &str) -> bool {
    let alphabetic = title.chars().filter(|ch| ch.is_alphabetic()).collect::<Vec<_>>();
    if alphabetic.is_empty() {
        return true;
    }

    let ascii = alphabetic.iter().filter(|ch| ch.is_ascii_alphabetic()).count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = ascii as f64 / alphabetic.len() as f64;
    ratio >= LATIN_CONTENT_MIN_RATIO
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CanonicalSelection {
    pub canonical: ItemId,
    pub used_open_precedence: bool,
    pub used_content_eligibility: bool,
    pub used_maintainer_preference: bool,
}

fn created_at_sort_value(value: Option<OffsetDateTime>) -> OffsetDateTime {
    // Missing creation time sorts last so known-older members win.
    value.unwrap_or(OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(i64::from(i32::MAX)))
}

fn is_maintainer(author: Option<&str>, maintainers: &BTreeSet<String>) -> bool {
    author.is_some_and(|login| maintainers.contains(&login.to_lowercase()))
}

/// Deterministically select the canonical representative of one cluster.
///
/// Strict lexicographic criteria, each narrowing the eligible set: open
/// precedence, Latin-content eligibility, maintainer authorship, highest
/// activity score, earliest creation time, lowest number.
///
/// # Errors
/// Returns [`KernelError::Consistency`] when `members` is empty.
pub fn select_canonical(
    members: &[&ItemSnapshot],
    scorer: &dyn ActivityScorer,
    maintainers: &BTreeSet<String>,
) -> Result<CanonicalSelection, KernelError> {
    if members.is_empty() {
        return Err(KernelError::Consistency(
            "cannot select canonical from empty cluster".to_string(),
        ));
    }

    let mut eligible: Vec<&ItemSnapshot> = members.to_vec();

    let used_open_precedence = eligible.iter().any(|item| item.state == ItemState::Open);
    if used_open_precedence {
        eligible.retain(|item| item.state == ItemState::Open);
    }

    let latin: Vec<&ItemSnapshot> =
        eligible.iter().copied().filter(|item| is_latin_content(&item.title)).collect();
    let used_content_eligibility = !latin.is_empty() && latin.len() < eligible.len();
    if !latin.is_empty() {
        eligible = latin;
    }

    let privileged: Vec<&ItemSnapshot> = eligible
        .iter()
        .copied()
        .filter(|item| is_maintainer(item.author.as_deref(), maintainers))
        .collect();
    let used_maintainer_preference = !privileged.is_empty();
    if used_maintainer_preference {
        eligible = privileged;
    }

    let canonical = eligible.iter().min_by(|lhs, rhs| {
        scorer
            .score(rhs)
            .cmp(&scorer.score(lhs))
            .then_with(|| {
                created_at_sort_value(lhs.created_at).cmp(&created_at_sort_value(rhs.created_at))
            })
            .then_with(|| lhs.number.cmp(&rhs.number))
    });

    match canonical {
        Some(item) => Ok(CanonicalSelection {
            canonical: item.item_id,
            used_open_precedence,
            used_content_eligibility,
            used_maintainer_preference,
        }),
        None => Err(KernelError::Consistency(
            "cannot select canonical from empty cluster".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CloseSkipReason {
    NotOpen,
    UncertainMaintainerIdentity,
    MaintainerAuthor,
    MaintainerAssignee,
    MissingAcceptedEdge,
    LowConfidence,
}

impl CloseSkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotOpen => "not_open",
            Self::UncertainMaintainerIdentity => "uncertain_maintainer_identity",
            Self::MaintainerAuthor => "maintainer_author",
            Self::MaintainerAssignee => "maintainer_assignee",
            Self::MissingAcceptedEdge => "missing_accepted_edge",
            Self::LowConfidence => "low_confidence",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_open" => Some(Self::NotOpen),
            "uncertain_maintainer_identity" => Some(Self::UncertainMaintainerIdentity),
            "maintainer_author" => Some(Self::MaintainerAuthor),
            "maintainer_assignee" => Some(Self::MaintainerAssignee),
            "missing_accepted_edge" => Some(Self::MissingAcceptedEdge),
            "low_confidence" => Some(Self::LowConfidence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClosePolicy {
    pub min_close: f64,
    pub target_policy: TargetPolicy,
}

impl ClosePolicy {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `min_close` is outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !(0.0..=1.0).contains(&self.min_close) {
            return Err(KernelError::Validation(
                "min_close must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One planned action for a non-canonical cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanEntry {
    pub item_id: ItemId,
    pub item_number: i64,
    pub target_item_id: ItemId,
    pub target_number: i64,
    pub action: CloseAction,
    pub skip_reason: Option<CloseSkipReason>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanStats {
    pub accepted_edges: usize,
    pub clusters: usize,
    pub considered: usize,
    pub close_actions: usize,
    pub close_actions_direct_fallback: usize,
    pub skip_actions: usize,
    pub skipped_not_open: usize,
    pub skipped_low_confidence: usize,
    pub skipped_missing_edge: usize,
    pub skipped_maintainer_author: usize,
    pub skipped_maintainer_assignee: usize,
    pub skipped_uncertain_maintainer_identity: usize,
    pub failed_clusters: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanOutcome {
    pub entries: Vec<PlanEntry>,
    pub stats: PlanStats,
}

fn record_skip(stats: &mut PlanStats, reason: CloseSkipReason) {
    match reason {
        CloseSkipReason::NotOpen => stats.skipped_not_open += 1,
        CloseSkipReason::UncertainMaintainerIdentity => {
            stats.skipped_uncertain_maintainer_identity += 1;
        }
        CloseSkipReason::MaintainerAuthor => stats.skipped_maintainer_author += 1,
        CloseSkipReason::MaintainerAssignee => stats.skipped_maintainer_assignee += 1,
        CloseSkipReason::MissingAcceptedEdge => stats.skipped_missing_edge += 1,
        CloseSkipReason::LowConfidence => stats.skipped_low_confidence += 1,
    }
}

fn guardrail_skip(
    item: &ItemSnapshot,
    maintainers: &BTreeSet<String>,
) -> Option<CloseSkipReason> {
    if item.state != ItemState::Open {
        return Some(CloseSkipReason::NotOpen);
    }

    let Some(author) = item.author.as_deref() else {
        return Some(CloseSkipReason::UncertainMaintainerIdentity);
    };
    if maintainers.contains(&author.to_lowercase()) {
        return Some(CloseSkipReason::MaintainerAuthor);
    }

    if item.assignees_unknown {
        return Some(CloseSkipReason::UncertainMaintainerIdentity);
    }
    if item.assignees.iter().any(|assignee| maintainers.contains(&assignee.to_lowercase())) {
        return Some(CloseSkipReason::MaintainerAssignee);
    }

    None
}

/// Build a close plan over the clusters derived from one accepted-edge
/// snapshot.
///
/// Deterministic: identical snapshot and privilege set produce identical
/// entries in identical order. Clusters referencing items missing from the
/// snapshot are counted as failed and skipped; they never abort the run.
#[must_use]
pub fn build_close_plan(
    edges: &[AcceptedEdge],
    items: &BTreeMap<ItemId, ItemSnapshot>,
    maintainers: &BTreeSet<String>,
    scorer: &dyn ActivityScorer,
    policy: &ClosePolicy,
) -> PlanOutcome {
    let graph = DuplicateGraph::from_edges(edges);
    let clusters = graph.clusters();

    let mut direct_confidence: BTreeMap<(ItemId, ItemId), f64> = BTreeMap::new();
    let mut outgoing: BTreeMap<ItemId, (ItemId, f64)> = BTreeMap::new();
    for edge in edges {
        direct_confidence.insert((edge.source, edge.target), edge.confidence);
        outgoing.insert(edge.source, (edge.target, edge.confidence));
    }

    let mut stats = PlanStats {
        accepted_edges: edges.len(),
        clusters: clusters.len(),
        ..PlanStats::default()
    };
    let mut entries = Vec::new();

    'clusters: for cluster in &clusters {
        let mut members = Vec::with_capacity(cluster.len());
        for item_id in cluster {
            match items.get(item_id) {
                Some(item) => members.push(item),
                None => {
                    stats.failed_clusters += 1;
                    continue 'clusters;
                }
            }
        }

        let Ok(selection) = select_canonical(&members, scorer, maintainers) else {
            stats.failed_clusters += 1;
            continue;
        };
        let canonical_id = selection.canonical;
        let Some(canonical) = items.get(&canonical_id) else {
            stats.failed_clusters += 1;
            continue;
        };

        for item in &members {
            if item.item_id == canonical_id {
                continue;
            }

            stats.considered += 1;
            let mut target_id = canonical_id;
            let mut target_number = canonical.number;

            let skip_reason = guardrail_skip(item, maintainers).or_else(|| {
                let mut confidence = direct_confidence.get(&(item.item_id, canonical_id)).copied();

                if confidence.is_none() && policy.target_policy == TargetPolicy::DirectFallback {
                    if let Some(&(fallback_target, fallback_confidence)) =
                        outgoing.get(&item.item_id)
                    {
                        if let Some(fallback_item) = items.get(&fallback_target) {
                            target_id = fallback_target;
                            target_number = fallback_item.number;
                            confidence = Some(fallback_confidence);
                        }
                    }
                }

                match confidence {
                    None => Some(CloseSkipReason::MissingAcceptedEdge),
                    Some(value) if value < policy.min_close => {
                        Some(CloseSkipReason::LowConfidence)
                    }
                    Some(_) => None,
                }
            });

            match skip_reason {
                Some(reason) => {
                    stats.skip_actions += 1;
                    record_skip(&mut stats, reason);
                    entries.push(PlanEntry {
                        item_id: item.item_id,
                        item_number: item.number,
                        target_item_id: target_id,
                        target_number,
                        action: CloseAction::Skip,
                        skip_reason: Some(reason),
                    });
                }
                None => {
                    stats.close_actions += 1;
                    if target_id != canonical_id {
                        stats.close_actions_direct_fallback += 1;
                    }
                    entries.push(PlanEntry {
                        item_id: item.item_id,
                        item_number: item.number,
                        target_item_id: target_id,
                        target_number,
                        action: CloseAction::Close,
                        skip_reason: None,
                    });
                }
            }
        }
    }

    PlanOutcome { entries, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn fixture_time(offset_seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_seconds)
    }

    fn mk_item(item_id: i64, number: i64, state: ItemState) -> ItemSnapshot {
        ItemSnapshot {
            item_id: ItemId(item_id),
            scope_id: ScopeId(1),
            item_type: ItemType::Issue,
            number,
            state,
            title: format!("exec fails with code 127 ({number})"),
            body: Some("running exec returns error 127 in sandbox".to_string()),
            author: Some("reporter".to_string()),
            assignees: vec![],
            assignees_unknown: false,
            comment_count: 0,
            review_comment_count: 0,
            created_at: Some(fixture_time(number)),
        }
    }

    fn mk_candidate(item_id: i64, number: i64, state: ItemState, score: f64) -> Candidate {
        Candidate {
            item_id: ItemId(item_id),
            number,
            state,
            title: format!("exec fails with code 127 ({number})"),
            body: Some("running exec returns error 127 in sandbox".to_string()),
            score,
            rank: 1,
        }
    }

    fn mk_verdict(duplicate_of: Option<i64>, confidence: f64) -> Verdict {
        Verdict {
            is_duplicate: duplicate_of.is_some(),
            duplicate_of,
            confidence,
            reasoning: "same failure signature and repro".to_string(),
            signals: VerdictSignals {
                relation: Some(Relation::SameInstance),
                root_cause_match: Some(RootCauseMatch::Same),
                scope_relation: Some(ScopeRelation::SameScope),
                path_match: Some(PathMatch::Same),
                certainty: Some(Certainty::Sure),
            },
        }
    }

    fn default_policy() -> JudgePolicy {
        JudgePolicy { min_edge: 0.85, min_gap: 0.015 }
    }

    #[test]
    fn scope_ref_parse_rejects_malformed_values() {
        assert!(ScopeRef::parse("acme/tools").is_ok());
        assert!(ScopeRef::parse("acme").is_err());
        assert!(ScopeRef::parse("acme/tools/extra").is_err());
        assert!(ScopeRef::parse("/tools").is_err());
    }

    #[test]
    fn verdict_validate_rejects_out_of_range_confidence() {
        let mut verdict = mk_verdict(Some(10), 1.2);
        assert!(verdict.validate().is_err());
        verdict.confidence = -0.1;
        assert!(verdict.validate().is_err());
    }

    #[test]
    fn verdict_validate_rejects_inconsistent_duplicate_of() {
        let mut verdict = mk_verdict(None, 0.9);
        verdict.duplicate_of = Some(42);
        assert!(verdict.validate().is_err());

        let mut verdict = mk_verdict(Some(42), 0.9);
        verdict.duplicate_of = Some(0);
        assert!(verdict.validate().is_err());

        let mut verdict = mk_verdict(None, 0.9);
        verdict.duplicate_of = Some(0);
        assert!(verdict.validate().is_ok());
    }

    #[test]
    fn structural_veto_orders_unsure_before_relation() {
        let mut verdict = mk_verdict(Some(10), 0.9);
        verdict.signals.certainty = Some(Certainty::Unsure);
        verdict.signals.relation = Some(Relation::PartialOverlap);

        assert_eq!(structural_veto(&verdict), Some(VetoReason::CertaintyUnsure));
    }

    #[test]
    fn structural_veto_flags_scope_mismatch_without_same_root_cause() {
        let mut verdict = mk_verdict(Some(10), 0.9);
        verdict.signals.scope_relation = Some(ScopeRelation::SourceSubset);
        verdict.signals.root_cause_match = None;

        let veto = structural_veto(&verdict);
        assert_eq!(
            veto,
            Some(VetoReason::ScopeMismatch {
                scope_relation: ScopeRelation::SourceSubset,
                root_cause: None,
            })
        );
        match veto {
            Some(reason) => {
                assert_eq!(
                    reason.to_string(),
                    "scope_relation=source_subset, root_cause_match=unknown"
                );
            }
            None => panic!("expected a scope mismatch veto"),
        }
    }

    #[test]
    fn structural_veto_passes_clean_same_instance_verdict() {
        let verdict = mk_verdict(Some(10), 0.9);
        assert_eq!(structural_veto(&verdict), None);
    }

    #[test]
    fn classify_intent_distinguishes_bug_and_feature() {
        assert_eq!(classify_intent("Fix crash on startup", Some("regression in 2.1")), IntentKind::Bug);
        assert_eq!(
            classify_intent("Add support for YAML output", Some("proposal")),
            IntentKind::Feature
        );
        assert_eq!(classify_intent("Questions about roadmap", None), IntentKind::Other);
    }

    #[test]
    fn intent_mismatch_veto_fires_only_on_bug_vs_feature() {
        let veto = intent_mismatch_veto(
            "Fix crash in exporter",
            Some("broken since 1.2"),
            "Add support for new exporter",
            Some("feature request"),
        );
        match veto {
            Some(reason) => assert_eq!(reason.to_string(), "bug_feature_mismatch:bug_vs_feature"),
            None => panic!("expected bug/feature mismatch veto"),
        }

        assert_eq!(
            intent_mismatch_veto("Fix crash", None, "Fix other crash", None),
            None
        );
    }

    #[test]
    fn candidate_gap_veto_requires_min_gap_margin() {
        let candidates = vec![
            mk_candidate(1, 10, ItemState::Open, 0.91),
            mk_candidate(2, 11, ItemState::Open, 0.90),
        ];
        assert!(candidate_gap_too_small(10, &candidates, 0.015));
        assert!(!candidate_gap_too_small(10, &candidates, 0.005));

        let single = vec![mk_candidate(1, 10, ItemState::Open, 0.91)];
        assert!(!candidate_gap_too_small(10, &single, 0.015));
    }

    #[test]
    fn evaluate_verdict_skips_invalid_target() {
        let source = mk_item(5, 50, ItemState::Open);
        let candidates = vec![mk_candidate(1, 10, ItemState::Open, 0.9)];
        let verdict = mk_verdict(Some(99), 0.95);

        let evaluation = evaluate_verdict(&source, &candidates, &verdict, &default_policy());
        assert_eq!(
            evaluation,
            VerdictEvaluation::Skipped { reason: SkipReasonCode::InvalidTarget }
        );
    }

    #[test]
    fn evaluate_verdict_rejects_low_confidence_before_vetoes() {
        let source = mk_item(5, 50, ItemState::Open);
        let candidates = vec![mk_candidate(1, 10, ItemState::Open, 0.9)];
        let mut verdict = mk_verdict(Some(10), 0.5);
        verdict.signals.certainty = Some(Certainty::Unsure);

        let evaluation = evaluate_verdict(&source, &candidates, &verdict, &default_policy());
        assert_eq!(
            evaluation,
            VerdictEvaluation::Rejected {
                target: Some(ItemId(1)),
                reason: RejectReason::LowConfidence,
            }
        );
    }

    #[test]
    fn evaluate_verdict_rejects_closed_target() {
        let source = mk_item(5, 50, ItemState::Open);
        let candidates = vec![mk_candidate(1, 10, ItemState::Closed, 0.9)];
        let verdict = mk_verdict(Some(10), 0.95);

        let evaluation = evaluate_verdict(&source, &candidates, &verdict, &default_policy());
        assert_eq!(
            evaluation,
            VerdictEvaluation::Rejected {
                target: Some(ItemId(1)),
                reason: RejectReason::TargetNotOpen,
            }
        );
    }

    #[test]
    fn evaluate_verdict_accepts_clean_verdict() {
        let source = mk_item(5, 50, ItemState::Open);
        let candidates = vec![
            mk_candidate(1, 10, ItemState::Open, 0.91),
            mk_candidate(2, 11, ItemState::Open, 0.70),
        ];
        let verdict = mk_verdict(Some(10), 0.95);

        let evaluation = evaluate_verdict(&source, &candidates, &verdict, &default_policy());
        assert_eq!(
            evaluation,
            VerdictEvaluation::Accepted { target: ItemId(1), confidence: 0.95 }
        );
    }

    #[test]
    fn clusters_partition_items_disjointly() {
        let edges = vec![
            AcceptedEdge { source: ItemId(11), target: ItemId(10), confidence: 0.95 },
            AcceptedEdge { source: ItemId(12), target: ItemId(10), confidence: 0.93 },
            AcceptedEdge { source: ItemId(20), target: ItemId(21), confidence: 0.94 },
        ];

        let clusters = DuplicateGraph::from_edges(&edges).clusters();
        assert_eq!(
            clusters,
            vec![
                vec![ItemId(10), ItemId(11), ItemId(12)],
                vec![ItemId(20), ItemId(21)],
            ]
        );

        let mut seen = BTreeSet::new();
        for cluster in &clusters {
            for item in cluster {
                assert!(seen.insert(*item), "item {item} appeared in two clusters");
            }
        }
    }

    #[test]
    fn clusters_are_stable_under_edge_permutation() {
        let forward = vec![
            AcceptedEdge { source: ItemId(20), target: ItemId(21), confidence: 0.94 },
            AcceptedEdge { source: ItemId(21), target: ItemId(22), confidence: 0.92 },
        ];
        let reversed = forward.iter().rev().copied().collect::<Vec<_>>();

        assert_eq!(
            DuplicateGraph::from_edges(&forward).clusters(),
            DuplicateGraph::from_edges(&reversed).clusters()
        );
    }

    #[test]
    fn canonical_prefers_open_members() {
        let open = mk_item(10, 10, ItemState::Open);
        let closed = mk_item(9, 9, ItemState::Closed);
        let members = vec![&closed, &open];
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };

        let selection = match select_canonical(&members, &scorer, &BTreeSet::new()) {
            Ok(selection) => selection,
            Err(err) => panic!("selection should succeed: {err}"),
        };

        assert_eq!(selection.canonical, ItemId(10));
        assert!(selection.used_open_precedence);
    }

    #[test]
    fn canonical_prefers_latin_titles() {
        let mut cyrillic = mk_item(1, 1, ItemState::Open);
        cyrillic.title = "Сбой при запуске".to_string();
        let latin = mk_item(2, 2, ItemState::Open);
        let members = vec![&cyrillic, &latin];
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };

        let selection = match select_canonical(&members, &scorer, &BTreeSet::new()) {
            Ok(selection) => selection,
            Err(err) => panic!("selection should succeed: {err}"),
        };

        assert_eq!(selection.canonical, ItemId(2));
        assert!(selection.used_content_eligibility);
    }

    #[test]
    fn canonical_prefers_maintainer_author_then_activity() {
        let mut by_maintainer = mk_item(1, 5, ItemState::Open);
        by_maintainer.author = Some("Maintainer".to_string());
        let mut busy = mk_item(2, 3, ItemState::Open);
        busy.comment_count = 40;
        let members = vec![&busy, &by_maintainer];
        let maintainers = BTreeSet::from(["maintainer".to_string()]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };

        let selection = match select_canonical(&members, &scorer, &maintainers) {
            Ok(selection) => selection,
            Err(err) => panic!("selection should succeed: {err}"),
        };

        assert_eq!(selection.canonical, ItemId(1));
        assert!(selection.used_maintainer_preference);
    }

    #[test]
    fn canonical_ties_break_on_created_at_then_number() {
        let mut older = mk_item(1, 7, ItemState::Open);
        older.created_at = Some(fixture_time(0));
        let mut newer = mk_item(2, 3, ItemState::Open);
        newer.created_at = Some(fixture_time(100));
        let members = vec![&newer, &older];
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };

        let selection = match select_canonical(&members, &scorer, &BTreeSet::new()) {
            Ok(selection) => selection,
            Err(err) => panic!("selection should succeed: {err}"),
        };
        assert_eq!(selection.canonical, ItemId(1));

        let mut same_time = mk_item(3, 2, ItemState::Open);
        same_time.created_at = Some(fixture_time(0));
        let members = vec![&older, &same_time];
        let selection = match select_canonical(&members, &scorer, &BTreeSet::new()) {
            Ok(selection) => selection,
            Err(err) => panic!("selection should succeed: {err}"),
        };
        assert_eq!(selection.canonical, ItemId(3));
    }

    fn plan_items(items: Vec<ItemSnapshot>) -> BTreeMap<ItemId, ItemSnapshot> {
        items.into_iter().map(|item| (item.item_id, item)).collect()
    }

    // Scenario: one open canonical, one open member with a direct edge, one
    // closed member.
    #[test]
    fn plan_closes_open_member_and_skips_closed_member() {
        let edges = vec![
            AcceptedEdge { source: ItemId(11), target: ItemId(10), confidence: 0.95 },
            AcceptedEdge { source: ItemId(12), target: ItemId(10), confidence: 0.93 },
        ];
        let items = plan_items(vec![
            mk_item(10, 10, ItemState::Open),
            mk_item(11, 11, ItemState::Open),
            mk_item(12, 12, ItemState::Closed),
        ]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };
        let policy = ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::CanonicalOnly };

        let outcome = build_close_plan(&edges, &items, &BTreeSet::new(), &scorer, &policy);

        assert_eq!(outcome.stats.close_actions, 1);
        assert_eq!(outcome.stats.skipped_not_open, 1);
        assert_eq!(outcome.entries.len(), 2);

        let close = outcome
            .entries
            .iter()
            .find(|entry| entry.action == CloseAction::Close)
            .map(|entry| (entry.item_id, entry.target_item_id));
        assert_eq!(close, Some((ItemId(11), ItemId(10))));

        let skipped = outcome
            .entries
            .iter()
            .find(|entry| entry.item_id == ItemId(12))
            .and_then(|entry| entry.skip_reason);
        assert_eq!(skipped, Some(CloseSkipReason::NotOpen));

        assert!(outcome.entries.iter().all(|entry| entry.item_id != ItemId(10)));
    }

    // Scenario: transitive-only chain 20 -> 21 -> 22, all open, canonical is
    // the oldest (#22 created earliest here).
    #[test]
    fn plan_transitive_chain_respects_target_policy() {
        let edges = vec![
            AcceptedEdge { source: ItemId(20), target: ItemId(21), confidence: 0.94 },
            AcceptedEdge { source: ItemId(21), target: ItemId(22), confidence: 0.92 },
        ];
        let mut item_20 = mk_item(20, 20, ItemState::Open);
        item_20.created_at = Some(fixture_time(300));
        let mut item_21 = mk_item(21, 21, ItemState::Open);
        item_21.created_at = Some(fixture_time(200));
        let mut item_22 = mk_item(22, 22, ItemState::Open);
        item_22.created_at = Some(fixture_time(100));
        let items = plan_items(vec![item_20, item_21, item_22]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };

        let canonical_only =
            ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::CanonicalOnly };
        let outcome = build_close_plan(&edges, &items, &BTreeSet::new(), &scorer, &canonical_only);

        let entry_20 = outcome
            .entries
            .iter()
            .find(|entry| entry.item_id == ItemId(20))
            .cloned();
        match entry_20 {
            Some(entry) => {
                assert_eq!(entry.action, CloseAction::Skip);
                assert_eq!(entry.skip_reason, Some(CloseSkipReason::MissingAcceptedEdge));
            }
            None => panic!("expected a plan entry for item 20"),
        }

        let entry_21 = outcome
            .entries
            .iter()
            .find(|entry| entry.item_id == ItemId(21))
            .cloned();
        match entry_21 {
            Some(entry) => {
                assert_eq!(entry.action, CloseAction::Close);
                assert_eq!(entry.target_item_id, ItemId(22));
            }
            None => panic!("expected a plan entry for item 21"),
        }

        let fallback =
            ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::DirectFallback };
        let outcome = build_close_plan(&edges, &items, &BTreeSet::new(), &scorer, &fallback);
        let entry_20 = outcome
            .entries
            .iter()
            .find(|entry| entry.item_id == ItemId(20))
            .cloned();
        match entry_20 {
            Some(entry) => {
                assert_eq!(entry.action, CloseAction::Close);
                assert_eq!(entry.target_item_id, ItemId(21));
            }
            None => panic!("expected a plan entry for item 20"),
        }
        assert_eq!(outcome.stats.close_actions_direct_fallback, 1);
    }

    #[test]
    fn plan_skips_maintainer_authored_and_assigned_items() {
        let edges = vec![
            AcceptedEdge { source: ItemId(31), target: ItemId(30), confidence: 0.95 },
            AcceptedEdge { source: ItemId(32), target: ItemId(30), confidence: 0.95 },
            AcceptedEdge { source: ItemId(33), target: ItemId(30), confidence: 0.95 },
        ];
        let mut canonical = mk_item(30, 30, ItemState::Open);
        canonical.created_at = Some(fixture_time(0));
        let mut authored = mk_item(31, 31, ItemState::Open);
        authored.author = Some("admin".to_string());
        let mut assigned = mk_item(32, 32, ItemState::Open);
        assigned.assignees = vec!["Admin".to_string()];
        let mut unknown = mk_item(33, 33, ItemState::Open);
        unknown.author = None;
        let items = plan_items(vec![canonical, authored, assigned, unknown]);
        let maintainers = BTreeSet::from(["admin".to_string()]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };
        let policy = ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::CanonicalOnly };

        let outcome = build_close_plan(&edges, &items, &maintainers, &scorer, &policy);

        assert_eq!(outcome.stats.skipped_maintainer_author, 1);
        assert_eq!(outcome.stats.skipped_maintainer_assignee, 1);
        assert_eq!(outcome.stats.skipped_uncertain_maintainer_identity, 1);
        assert_eq!(outcome.stats.close_actions, 0);
    }

    #[test]
    fn plan_enforces_min_close_threshold() {
        let edges = vec![AcceptedEdge {
            source: ItemId(41),
            target: ItemId(40),
            confidence: 0.86,
        }];
        let mut canonical = mk_item(40, 40, ItemState::Open);
        canonical.created_at = Some(fixture_time(0));
        let member = mk_item(41, 41, ItemState::Open);
        let items = plan_items(vec![canonical, member]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };
        let policy = ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::CanonicalOnly };

        let outcome = build_close_plan(&edges, &items, &BTreeSet::new(), &scorer, &policy);
        assert_eq!(outcome.stats.skipped_low_confidence, 1);
        assert_eq!(outcome.stats.close_actions, 0);
    }

    #[test]
    fn plan_output_is_deterministic_for_identical_snapshot() {
        let edges = vec![
            AcceptedEdge { source: ItemId(11), target: ItemId(10), confidence: 0.95 },
            AcceptedEdge { source: ItemId(12), target: ItemId(10), confidence: 0.93 },
            AcceptedEdge { source: ItemId(20), target: ItemId(21), confidence: 0.94 },
        ];
        let items = plan_items(vec![
            mk_item(10, 10, ItemState::Open),
            mk_item(11, 11, ItemState::Open),
            mk_item(12, 12, ItemState::Closed),
            mk_item(20, 20, ItemState::Open),
            mk_item(21, 21, ItemState::Open),
        ]);
        let maintainers = BTreeSet::from(["admin".to_string()]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };
        let policy = ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::CanonicalOnly };

        let first = build_close_plan(&edges, &items, &maintainers, &scorer, &policy);
        let second = build_close_plan(&edges, &items, &maintainers, &scorer, &policy);

        let first_json = match serde_json::to_string(&first) {
            Ok(value) => value,
            Err(err) => panic!("plan serialization should succeed: {err}"),
        };
        let second_json = match serde_json::to_string(&second) {
            Ok(value) => value,
            Err(err) => panic!("plan serialization should succeed: {err}"),
        };
        assert_eq!(first_json, second_json);
    }

    #[test]
    fn plan_counts_cluster_with_missing_item_as_failed() {
        let edges = vec![AcceptedEdge {
            source: ItemId(51),
            target: ItemId(50),
            confidence: 0.95,
        }];
        let items = plan_items(vec![mk_item(50, 50, ItemState::Open)]);
        let scorer = DefaultActivityScorer { item_type: ItemType::Issue };
        let policy = ClosePolicy { min_close: 0.9, target_policy: TargetPolicy::CanonicalOnly };

        let outcome = build_close_plan(&edges, &items, &BTreeSet::new(), &scorer, &policy);
        assert_eq!(outcome.stats.failed_clusters, 1);
        assert!(outcome.entries.is_empty());
    }
}
