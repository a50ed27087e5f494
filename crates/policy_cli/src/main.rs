use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use audit_engine::GateModel;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use core_types::{
    FinalResult, Market, MatchStatus, Pick, Policy, PolicySource, Prediction, RecordSource,
    RecordWindow, SnapshotSource,
};
use policy_loop::policy_store::{save_policy, FilePolicySource};
use policy_loop::report_io::{to_stable_json, write_report};
use policy_loop::{LoopConfig, RunStatus};
use replay_engine::{JsonlRecordSource, JsonlRecordWriter, JsonlSnapshotSource};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "policy-loop", about = "Shadow policy evaluation and tuning", version)]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    /// TOML config; falls back to POLICY_LOOP_CONFIG_PATH, then configs/policy_loop.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print Prometheus metrics to stderr when the command finishes.
    #[arg(long, global = true, default_value_t = false)]
    metrics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve one pick against a final score.
    Resolve(ResolveArgs),
    /// Build a decision record from predictions and append it to a JSONL file.
    Record(RecordArgs),
    Evaluate(EvaluateArgs),
    Propose(ProposeArgs),
    Replay(ReplayArgs),
    Audit(AuditArgs),
    /// Evaluate, propose, replay and audit in one pass.
    Run(RunArgs),
    /// Run independent windows in parallel.
    Batch(BatchArgs),
}

#[derive(Args, Debug, Clone)]
struct ScoreArgs {
    #[arg(long)]
    home_goals: u32,
    #[arg(long)]
    away_goals: u32,
    #[arg(long, default_value = "FINAL", value_parser = parse_status)]
    status: MatchStatus,
}

#[derive(Args, Debug, Clone)]
struct ResolveArgs {
    #[arg(long)]
    market: Market,
    #[arg(long)]
    pick: Pick,
    #[command(flatten)]
    score: ScoreArgs,
}

#[derive(Args, Debug, Clone)]
struct RecordArgs {
    /// JSON array of predictions.
    #[arg(long)]
    predictions: PathBuf,
    #[arg(long)]
    match_id: String,
    #[arg(long)]
    run_id: u64,
    #[command(flatten)]
    score: ScoreArgs,
    #[arg(long, env = "POLICY_LOOP_RECORDS", default_value = "datasets/decision_records.jsonl")]
    out: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct RecordsArg {
    #[arg(long, env = "POLICY_LOOP_RECORDS", default_value = "datasets/decision_records.jsonl")]
    records: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct PolicyArg {
    #[arg(long, env = "POLICY_LOOP_POLICY", default_value = "configs/policy.json")]
    policy: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct EvaluateArgs {
    #[command(flatten)]
    records: RecordsArg,
}

#[derive(Args, Debug, Clone)]
struct ProposeArgs {
    #[command(flatten)]
    records: RecordsArg,
    #[command(flatten)]
    policy: PolicyArg,
    /// Write the proposed policy here. Never overwrites the current policy.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct ReplayArgs {
    #[command(flatten)]
    records: RecordsArg,
    #[command(flatten)]
    policy: PolicyArg,
    #[arg(long)]
    proposed: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct AuditArgs {
    #[arg(long)]
    snapshots: PathBuf,
    #[command(flatten)]
    policy: PolicyArg,
    #[arg(long)]
    proposed: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    records: RecordsArg,
    #[command(flatten)]
    policy: PolicyArg,
    #[arg(long)]
    snapshots: Option<PathBuf>,
    /// Persist the run report and proposed policy under the reports dir.
    #[arg(long, default_value_t = false)]
    write: bool,
}

#[derive(Args, Debug, Clone)]
struct BatchArgs {
    #[arg(long = "records", required = true, num_args = 1..)]
    windows: Vec<PathBuf>,
    #[command(flatten)]
    policy: PolicyArg,
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    records: String,
    status: RunStatus,
    run_count: usize,
    malformed_records: usize,
    diff_count: usize,
    replay_reasons: Vec<String>,
    proposed_policy_checksum: String,
}

fn parse_status(raw: &str) -> std::result::Result<MatchStatus, String> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_uppercase()))
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = observability::init_tracing("policy_loop", cli.verbose);
    if cli.metrics {
        observability::init_metrics()?;
    }
    let cfg = policy_loop::load_config(cli.config.as_deref())?;

    let out = match cli.command {
        Commands::Resolve(args) => run_resolve(args),
        Commands::Record(args) => run_record(args).await,
        Commands::Evaluate(args) => run_evaluate(args, &cfg).await,
        Commands::Propose(args) => run_propose(args, &cfg).await,
        Commands::Replay(args) => run_replay(args, &cfg).await,
        Commands::Audit(args) => run_audit(args, &cfg).await,
        Commands::Run(args) => run_cycle(args, &cfg).await,
        Commands::Batch(args) => run_batch(args, cfg.clone()).await,
    };

    if cli.metrics {
        if let Some(rendered) = observability::render_metrics() {
            eprintln!("{rendered}");
        }
    }
    out
}

fn print_stable<T: Serialize>(value: &T, cfg: &LoopConfig) -> Result<()> {
    println!("{}", to_stable_json(value, cfg.output.float_precision)?);
    Ok(())
}

fn final_result(score: &ScoreArgs) -> FinalResult {
    FinalResult {
        home_goals: score.home_goals,
        away_goals: score.away_goals,
        status: score.status,
    }
}

async fn load_window(records: &Path) -> Result<RecordWindow> {
    JsonlRecordSource::new(records)
        .load_window()
        .await
        .with_context(|| format!("load records {}", records.display()))
}

fn current_policy(arg: &PolicyArg) -> Result<Policy> {
    FilePolicySource::new(&arg.policy).current_policy()
}

fn run_resolve(args: ResolveArgs) -> Result<()> {
    let outcome = policy_loop::resolve_outcome(args.market, args.pick, &final_result(&args.score));
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "market": args.market,
            "pick": args.pick,
            "outcome": outcome,
        }))?
    );
    Ok(())
}

async fn run_record(args: RecordArgs) -> Result<()> {
    let raw = tokio::fs::read_to_string(&args.predictions)
        .await
        .with_context(|| format!("read predictions {}", args.predictions.display()))?;
    let predictions: Vec<Prediction> =
        serde_json::from_str(&raw).context("decode predictions")?;
    let record = market_resolver::build_decision_record(
        args.run_id,
        Utc::now(),
        &args.match_id,
        predictions,
        &final_result(&args.score),
    );
    record.validate()?;
    let mut writer = JsonlRecordWriter::open(&args.out).await?;
    writer.write(&record).await?;
    tracing::info!(run_id = record.run_id, path = %args.out.display(), "decision record appended");
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn run_evaluate(args: EvaluateArgs, cfg: &LoopConfig) -> Result<()> {
    let window = load_window(&args.records.records).await?;
    let report = policy_loop::evaluate(&window, cfg);
    print_stable(&report, cfg)
}

async fn run_propose(args: ProposeArgs, cfg: &LoopConfig) -> Result<()> {
    let window = load_window(&args.records.records).await?;
    let current = current_policy(&args.policy)?;
    let report = policy_loop::evaluate(&window, cfg);
    let proposal = policy_loop::propose(&report, &current, cfg)?;
    if let Some(out) = &args.out {
        anyhow::ensure!(
            out != &args.policy.policy,
            "refusing to overwrite the current policy {}",
            out.display()
        );
        save_policy(out, &proposal.proposed_policy, cfg.output.float_precision)?;
        tracing::info!(path = %out.display(), "proposed policy written");
    }
    print_stable(&proposal, cfg)
}

async fn run_replay(args: ReplayArgs, cfg: &LoopConfig) -> Result<()> {
    let window = load_window(&args.records.records).await?;
    let current = current_policy(&args.policy)?;
    let proposed = policy_loop::policy_store::load_policy(&args.proposed)?;
    let verdict = policy_loop::verify_replay(
        &window.records,
        &current.min_confidence_map(),
        &proposed.min_confidence_map(),
        &cfg.replay,
    );
    print_stable(&verdict, cfg)
}

async fn run_audit(args: AuditArgs, cfg: &LoopConfig) -> Result<()> {
    let snapshots = JsonlSnapshotSource::new(&args.snapshots)
        .load_snapshots()
        .await?;
    let current = current_policy(&args.policy)?;
    let proposed = policy_loop::policy_store::load_policy(&args.proposed)?;
    let report = policy_loop::audit(&snapshots, &current, &proposed, &GateModel, cfg)?;
    print_stable(&report, cfg)
}

async fn run_cycle(args: RunArgs, cfg: &LoopConfig) -> Result<()> {
    let window = load_window(&args.records.records).await?;
    let current = current_policy(&args.policy)?;
    let snapshots = match &args.snapshots {
        Some(path) => JsonlSnapshotSource::new(path).load_snapshots().await?,
        None => Vec::new(),
    };
    let run = policy_loop::run_tuning_cycle(&window, &current, &snapshots, &GateModel, cfg)?;

    if args.write {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "tuning_run_{}_{}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            &id[..8]
        );
        let dir = &cfg.output.reports_dir;
        write_report(dir, &name, &run, cfg.output.float_precision)?;
        write_report(
            dir,
            &format!("{name}_proposed_policy"),
            &run.proposal.proposed_policy,
            cfg.output.float_precision,
        )?;
    }
    print_stable(&run, cfg)
}

async fn run_batch(args: BatchArgs, cfg: LoopConfig) -> Result<()> {
    let current = current_policy(&args.policy)?;
    let mut handles = Vec::with_capacity(args.windows.len());
    for path in args.windows {
        let window = load_window(&path).await?;
        let current = current.clone();
        let cfg = cfg.clone();
        handles.push(tokio::task::spawn_blocking(move || -> Result<BatchEntry> {
            let run = policy_loop::run_tuning_cycle(&window, &current, &[], &GateModel, &cfg)?;
            Ok(BatchEntry {
                records: path.display().to_string(),
                status: run.status,
                run_count: run.evaluation.summary.run_count,
                malformed_records: run.evaluation.summary.malformed_records,
                diff_count: run.proposal.diffs.len(),
                replay_reasons: run.replay.reasons,
                proposed_policy_checksum: run.checksums.proposed_policy,
            })
        }));
    }

    let mut entries = Vec::with_capacity(handles.len());
    for handle in handles {
        entries.push(handle.await.context("batch worker panicked")??);
    }
    let failed = entries.iter().filter(|e| e.status == RunStatus::Fail).count();
    tracing::info!(windows = entries.len(), failed, "batch complete");
    print_stable(&entries, &cfg)
}
