use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dedup_kernel_core::{
    Candidate, CloseRunId, ItemId, ItemSnapshot, ItemState, ItemType, Representation, ScopeRef,
    TargetPolicy, Verdict, DEFAULT_MIN_GAP,
};
use dedup_kernel_engine::{
    build_approval, read_approval, run_apply_close, run_judge, run_plan_close, write_approval,
    ApplyConfig, CloseRequest, GatewayError, JudgeConfig, JudgeOracle, JudgeRequest,
    MaintainerResolver, MutationGateway, OracleError, PlanConfig, RetryPolicy,
    StoreMaintainerResolver,
};
use dedup_kernel_store_sqlite::SqliteStore;
use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "dk.v1";

#[derive(Debug, Parser)]
#[command(name = "dk")]
#[command(about = "Duplicate resolution kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./dedup_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Scope {
        #[command(subcommand)]
        command: ScopeCommand,
    },
    Item {
        #[command(subcommand)]
        command: ItemCommand,
    },
    Candidates {
        #[command(subcommand)]
        command: CandidatesCommand,
    },
    Maintainers {
        #[command(subcommand)]
        command: MaintainersCommand,
    },
    Judge {
        #[command(subcommand)]
        command: Box<JudgeCommand>,
    },
    PlanClose(PlanCloseArgs),
    Approve(ApproveArgs),
    ApplyClose(ApplyCloseArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

#[derive(Debug, Subcommand)]
enum ScopeCommand {
    Add(ScopeArgs),
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long)]
    scope: String,
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    Load(ItemLoadArgs),
    List(ItemListArgs),
}

#[derive(Debug, Args)]
struct ItemLoadArgs {
    #[arg(long)]
    scope: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ItemListArgs {
    #[arg(long)]
    scope: String,
    #[arg(long = "type", value_enum)]
    item_type: ItemTypeArg,
}

#[derive(Debug, Subcommand)]
enum CandidatesCommand {
    Load(CandidatesLoadArgs),
}

#[derive(Debug, Args)]
struct CandidatesLoadArgs {
    #[arg(long)]
    scope: String,
    #[arg(long = "type", value_enum)]
    item_type: ItemTypeArg,
    #[arg(long, value_enum, default_value_t = RepresentationArg::Raw)]
    representation: RepresentationArg,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum MaintainersCommand {
    Set(MaintainersSetArgs),
    List(ScopeArgs),
}

#[derive(Debug, Args)]
struct MaintainersSetArgs {
    #[arg(long)]
    scope: String,
    #[arg(long = "login")]
    logins: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum JudgeCommand {
    Run(JudgeRunArgs),
    Stats(JudgeStatsArgs),
}

#[derive(Debug, Args)]
struct JudgeRunArgs {
    #[arg(long)]
    scope: String,
    #[arg(long = "type", value_enum)]
    item_type: ItemTypeArg,
    #[arg(long)]
    verdicts: PathBuf,
    #[arg(long, default_value_t = 0.85)]
    min_edge: f64,
    #[arg(long, default_value_t = DEFAULT_MIN_GAP)]
    min_gap: f64,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    #[arg(long, default_value_t = false)]
    rejudge: bool,
    #[arg(long, value_enum, default_value_t = RepresentationArg::Raw)]
    representation: RepresentationArg,
    #[arg(long, default_value = "dk")]
    created_by: String,
}

#[derive(Debug, Args)]
struct JudgeStatsArgs {
    #[arg(long)]
    scope: String,
    #[arg(long = "type", value_enum)]
    item_type: ItemTypeArg,
    #[arg(long, value_enum, default_value_t = RepresentationArg::Raw)]
    representation: RepresentationArg,
}

#[derive(Debug, Args)]
struct PlanCloseArgs {
    #[arg(long)]
    scope: String,
    #[arg(long = "type", value_enum)]
    item_type: ItemTypeArg,
    #[arg(long, default_value_t = 0.9)]
    min_close: f64,
    #[arg(long, value_enum, default_value_t = TargetPolicyArg::CanonicalOnly)]
    target_policy: TargetPolicyArg,
    #[arg(long, value_enum, default_value_t = RepresentationArg::Raw)]
    representation: RepresentationArg,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long, default_value = "dk")]
    created_by: String,
}

#[derive(Debug, Args)]
struct ApproveArgs {
    #[arg(long)]
    scope: String,
    #[arg(long)]
    run: i64,
    #[arg(long)]
    approved_by: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ApplyCloseArgs {
    #[arg(long)]
    scope: String,
    #[arg(long)]
    run: i64,
    #[arg(long)]
    approval: PathBuf,
    #[arg(long)]
    outbox: PathBuf,
    #[arg(long, default_value_t = false)]
    yes: bool,
    #[arg(long, default_value = "dk")]
    created_by: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ItemTypeArg {
    Issue,
    Pr,
}

impl From<ItemTypeArg> for ItemType {
    fn from(value: ItemTypeArg) -> Self {
        match value {
            ItemTypeArg::Issue => Self::Issue,
            ItemTypeArg::Pr => Self::Pr,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RepresentationArg {
    Raw,
    Intent,
}

impl From<RepresentationArg> for Representation {
    fn from(value: RepresentationArg) -> Self {
        match value {
            RepresentationArg::Raw => Self::Raw,
            RepresentationArg::Intent => Self::Intent,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetPolicyArg {
    CanonicalOnly,
    DirectFallback,
}

impl From<TargetPolicyArg> for TargetPolicy {
    fn from(value: TargetPolicyArg) -> Self {
        match value {
            TargetPolicyArg::CanonicalOnly => Self::CanonicalOnly,
            TargetPolicyArg::DirectFallback => Self::DirectFallback,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_scope(raw: &str) -> Result<ScopeRef> {
    ScopeRef::parse(raw).map_err(|err| anyhow!(err))
}

/// One item line in the ingestion NDJSON. Scope comes from the command, not
/// the file.
#[derive(Debug, Deserialize)]
struct ItemLine {
    item_id: i64,
    item_type: String,
    number: i64,
    state: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    assignees: Vec<String>,
    #[serde(default)]
    assignees_unknown: bool,
    #[serde(default)]
    comment_count: i64,
    #[serde(default)]
    review_comment_count: i64,
    #[serde(default)]
    created_at: Option<String>,
}

fn read_ndjson_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).with_context(|| {
            format!("invalid record on line {} of {}", index + 1, path.display())
        })?;
        records.push(record);
    }
    Ok(records)
}

fn item_from_line(line: ItemLine, scope_id: dedup_kernel_core::ScopeId) -> Result<ItemSnapshot> {
    let item_type = ItemType::parse(&line.item_type)
        .ok_or_else(|| anyhow!("invalid item_type: {}", line.item_type))?;
    let state = ItemState::parse(&line.state)
        .ok_or_else(|| anyhow!("invalid state: {}", line.state))?;
    let created_at = match line.created_at {
        None => None,
        Some(raw) => Some(
            OffsetDateTime::parse(&raw, &Rfc3339)
                .with_context(|| format!("invalid created_at: {raw}"))?,
        ),
    };

    Ok(ItemSnapshot {
        item_id: ItemId(line.item_id),
        scope_id,
        item_type,
        number: line.number,
        state,
        title: line.title,
        body: line.body,
        author: line.author,
        assignees: line.assignees,
        assignees_unknown: line.assignees_unknown,
        comment_count: line.comment_count,
        review_comment_count: line.review_comment_count,
        created_at,
    })
}

#[derive(Debug, Deserialize)]
struct CandidateLine {
    source_number: i64,
    candidates: Vec<CandidateRef>,
}

#[derive(Debug, Deserialize)]
struct CandidateRef {
    number: i64,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct VerdictLine {
    source_number: i64,
    #[serde(flatten)]
    verdict: Verdict,
}

/// Judge oracle backed by an NDJSON verdict file keyed by source number.
/// A missing entry is a permanent failure for that item.
struct NdjsonJudgeOracle {
    verdicts: BTreeMap<i64, Verdict>,
}

impl NdjsonJudgeOracle {
    fn load(path: &Path) -> Result<Self> {
        let lines: Vec<VerdictLine> = read_ndjson_lines(path)?;
        let mut verdicts = BTreeMap::new();
        for line in lines {
            verdicts.insert(line.source_number, line.verdict);
        }
        Ok(Self { verdicts })
    }
}

impl JudgeOracle for NdjsonJudgeOracle {
    fn judge(&self, request: &JudgeRequest) -> Result<Verdict, OracleError> {
        self.verdicts.get(&request.source.number).cloned().ok_or_else(|| {
            OracleError::Permanent(format!(
                "no verdict recorded for item #{}",
                request.source.number
            ))
        })
    }
}

/// Mutation gateway that appends close requests to an NDJSON outbox instead
/// of mutating a live tracker.
struct NdjsonMutationGateway {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl NdjsonMutationGateway {
    fn new(path: PathBuf) -> Self {
        Self { path, write_lock: Mutex::new(()) }
    }
}

impl MutationGateway for NdjsonMutationGateway {
    fn close_duplicate(&self, request: &CloseRequest) -> Result<Value, GatewayError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| GatewayError("outbox lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| GatewayError(format!("failed to open outbox: {err}")))?;

        let line = serde_json::to_string(request)
            .map_err(|err| GatewayError(format!("failed to serialize request: {err}")))?;
        writeln!(file, "{line}")
            .map_err(|err| GatewayError(format!("failed to write outbox: {err}")))?;

        Ok(serde_json::json!({
            "status": "recorded",
            "item_number": request.item_number,
            "target_number": request.target_number,
        }))
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Db { command } => run_db(command, &cli.db),
        Command::Scope { command } => run_scope(command, &cli.db),
        Command::Item { command } => run_item(command, &cli.db),
        Command::Candidates { command } => run_candidates(command, &cli.db),
        Command::Maintainers { command } => run_maintainers(command, &cli.db),
        Command::Judge { command } => run_judge_command(*command, &cli.db),
        Command::PlanClose(args) => run_plan_close_command(&args, &cli.db),
        Command::Approve(args) => run_approve(&args, &cli.db),
        Command::ApplyClose(args) => run_apply_close_command(&args, &cli.db),
    }
}

fn run_db(command: DbCommand, db: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let store = SqliteStore::open(db)?;
            let status = store.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
        DbCommand::Migrate => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let status = store.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
    }
}

fn run_scope(command: ScopeCommand, db: &Path) -> Result<()> {
    match command {
        ScopeCommand::Add(args) => {
            let scope = parse_scope(&args.scope)?;
            let store = SqliteStore::open(db)?;
            let scope_id = store.upsert_scope(&scope)?;
            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "scope_id": scope_id.0,
            }))
        }
    }
}

fn run_item(command: ItemCommand, db: &Path) -> Result<()> {
    match command {
        ItemCommand::Load(args) => {
            let scope = parse_scope(&args.scope)?;
            let store = SqliteStore::open(db)?;
            let scope_id = store.upsert_scope(&scope)?;

            let lines: Vec<ItemLine> = read_ndjson_lines(&args.file)?;
            let mut loaded = 0_usize;
            for line in lines {
                let item = item_from_line(line, scope_id)?;
                store.upsert_item(&item)?;
                loaded += 1;
            }
            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "loaded": loaded,
            }))
        }
        ItemCommand::List(args) => {
            let scope = parse_scope(&args.scope)?;
            let store = SqliteStore::open(db)?;
            let scope_id = store
                .get_scope_id(&scope)?
                .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;
            let items = store.list_items(scope_id, args.item_type.into())?;
            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "items": serde_json::to_value(items)?,
            }))
        }
    }
}

fn run_candidates(command: CandidatesCommand, db: &Path) -> Result<()> {
    match command {
        CandidatesCommand::Load(args) => {
            let scope = parse_scope(&args.scope)?;
            let item_type: ItemType = args.item_type.into();
            let representation: Representation = args.representation.into();
            let mut store = SqliteStore::open(db)?;
            let scope_id = store
                .get_scope_id(&scope)?
                .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;

            let lines: Vec<CandidateLine> = read_ndjson_lines(&args.file)?;
            let mut sets = 0_usize;
            for line in lines {
                let source = store
                    .get_item_by_number(scope_id, item_type, line.source_number)?
                    .ok_or_else(|| {
                        anyhow!("unknown source item #{}", line.source_number)
                    })?;

                let mut candidates = Vec::with_capacity(line.candidates.len());
                for (index, candidate) in line.candidates.iter().enumerate() {
                    let item = store
                        .get_item_by_number(scope_id, item_type, candidate.number)?
                        .ok_or_else(|| {
                            anyhow!("unknown candidate item #{}", candidate.number)
                        })?;
                    let rank = i64::try_from(index)
                        .context("candidate list too long")?
                        .saturating_add(1);
                    candidates.push(Candidate {
                        item_id: item.item_id,
                        number: item.number,
                        state: item.state,
                        title: item.title,
                        body: item.body,
                        score: candidate.score,
                        rank,
                    });
                }

                store.create_candidate_set(
                    scope_id,
                    source.item_id,
                    item_type,
                    representation,
                    &candidates,
                    OffsetDateTime::now_utc(),
                )?;
                sets += 1;
            }

            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "candidate_sets": sets,
            }))
        }
    }
}

fn run_maintainers(command: MaintainersCommand, db: &Path) -> Result<()> {
    match command {
        MaintainersCommand::Set(args) => {
            let scope = parse_scope(&args.scope)?;
            let mut store = SqliteStore::open(db)?;
            let scope_id = store.upsert_scope(&scope)?;
            store.set_maintainers(scope_id, &args.logins)?;
            let maintainers = store.list_maintainers(scope_id)?;
            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "maintainers": maintainers,
            }))
        }
        MaintainersCommand::List(args) => {
            let scope = parse_scope(&args.scope)?;
            let store = SqliteStore::open(db)?;
            let scope_id = store
                .get_scope_id(&scope)?
                .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;
            let maintainers = store.list_maintainers(scope_id)?;
            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "maintainers": maintainers,
            }))
        }
    }
}

fn run_judge_command(command: JudgeCommand, db: &Path) -> Result<()> {
    match command {
        JudgeCommand::Run(args) => {
            let scope = parse_scope(&args.scope)?;
            let oracle = NdjsonJudgeOracle::load(&args.verdicts)?;
            let config = JudgeConfig {
                min_edge: args.min_edge,
                min_gap: args.min_gap,
                rejudge: args.rejudge,
                workers: args.workers,
                representation: args.representation.into(),
                created_by: args.created_by,
            };
            let cancel = AtomicBool::new(false);
            let report = run_judge(
                db,
                &scope,
                args.item_type.into(),
                &config,
                &oracle,
                &RetryPolicy::default(),
                &cancel,
            )?;
            emit_json(serde_json::to_value(report)?)
        }
        JudgeCommand::Stats(args) => {
            let scope = parse_scope(&args.scope)?;
            let store = SqliteStore::open(db)?;
            let scope_id = store
                .get_scope_id(&scope)?
                .ok_or_else(|| anyhow!("unknown scope: {}", scope.full_name()))?;
            let counts = store.count_decisions_by_status(
                scope_id,
                args.item_type.into(),
                args.representation.into(),
            )?;
            emit_json(serde_json::json!({
                "scope": scope.full_name(),
                "decision_counts": counts,
            }))
        }
    }
}

fn run_plan_close_command(args: &PlanCloseArgs, db: &Path) -> Result<()> {
    let scope = parse_scope(&args.scope)?;
    let mut store = SqliteStore::open(db)?;

    let maintainers = {
        let resolver = StoreMaintainerResolver { store: &store };
        resolver.maintainers(&scope)?
    };

    let config = PlanConfig {
        min_close: args.min_close,
        target_policy: args.target_policy.into(),
        representation: args.representation.into(),
        dry_run: args.dry_run,
        created_by: args.created_by.clone(),
    };
    let report =
        run_plan_close(&mut store, &scope, args.item_type.into(), &config, &maintainers)?;
    emit_json(serde_json::to_value(report)?)
}

fn run_approve(args: &ApproveArgs, db: &Path) -> Result<()> {
    let scope = parse_scope(&args.scope)?;
    let store = SqliteStore::open(db)?;
    let approval = build_approval(&store, &scope, CloseRunId(args.run), &args.approved_by)?;
    write_approval(&approval, &args.out)?;
    emit_json(serde_json::to_value(approval)?)
}

fn run_apply_close_command(args: &ApplyCloseArgs, db: &Path) -> Result<()> {
    let scope = parse_scope(&args.scope)?;
    let mut store = SqliteStore::open(db)?;
    let approval = read_approval(&args.approval)?;
    let gateway = NdjsonMutationGateway::new(args.outbox.clone());
    let config = ApplyConfig { yes: args.yes, created_by: args.created_by.clone() };
    let report = run_apply_close(
        &mut store,
        &scope,
        CloseRunId(args.run),
        &approval,
        &gateway,
        &config,
    )?;
    emit_json(serde_json::to_value(report)?)
}
