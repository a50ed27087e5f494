use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use audit_engine::{AuditEngine, AuditReport};
use core_types::{
    DecisionModel, DecisionRecord, EvaluationReport, Market, Policy, PolicyDiff, RecordWindow,
    ReplayVerdict, Snapshot,
};
use decision_quality::DecisionQualityEvaluator;
use replay_engine::ReplayThresholds;
use serde::{Deserialize, Serialize};
use shadow_tuner::{evaluate_guardrails, proposal_meta, GuardrailCheck, ShadowTuner};
use tuner_constraints::{apply_constraints, ConstraintsSummary};

pub use market_resolver::resolve_outcome;

use crate::config_loader::LoopConfig;
use crate::report_io::checksum;

/// Constrained proposal. Nothing here is applied; callers decide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub proposed_policy: Policy,
    /// Post-constraint diffs, sorted by path.
    pub diffs: Vec<PolicyDiff>,
    /// Tuner output before constraints, kept for the audit trail.
    pub raw_diffs: Vec<PolicyDiff>,
    pub constraints_summary: ConstraintsSummary,
    pub guardrails: Vec<GuardrailCheck>,
    pub guardrails_passed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pass,
    Fail,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail => f.write_str("FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunChecksums {
    pub evaluation_report: String,
    pub current_policy: String,
    pub proposed_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuningRunReport {
    pub status: RunStatus,
    pub current_version: String,
    pub proposed_version: String,
    pub evaluation: EvaluationReport,
    pub proposal: Proposal,
    pub replay: ReplayVerdict,
    pub audit: AuditReport,
    pub checksums: RunChecksums,
}

pub fn evaluate(window: &RecordWindow, cfg: &LoopConfig) -> EvaluationReport {
    let report = DecisionQualityEvaluator::new(cfg.evaluator.clone()).evaluate(window);
    metrics::counter!("policy_loop_records_evaluated_total").increment(report.summary.run_count as u64);
    metrics::counter!("policy_loop_malformed_records_total")
        .increment(report.summary.malformed_records as u64);
    if report.summary.malformed_records > 0 {
        tracing::warn!(
            malformed = report.summary.malformed_records,
            "malformed decision records skipped"
        );
    }
    tracing::info!(
        runs = report.summary.run_count,
        reasons = report.reason_effectiveness.len(),
        flip_rate = report.stability.pick_flip_rate,
        "evaluation complete"
    );
    report
}

/// Tuner, then constraints, then guardrails on the constrained sibling.
pub fn propose(report: &EvaluationReport, current: &Policy, cfg: &LoopConfig) -> Result<Proposal> {
    current.validate().context("current policy")?;

    let tuner = ShadowTuner::new(cfg.tuner.clone());
    let raw = tuner.propose(report, current);
    let (diffs, constraints_summary) = apply_constraints(&raw.diffs, &cfg.constraints);
    let proposed_policy = current
        .apply_diffs(&diffs, proposal_meta(&current.meta))
        .context("build proposed policy")?;
    let guardrails = evaluate_guardrails(current, &proposed_policy, tuner.cfg());
    let guardrails_passed = guardrails.iter().all(|g| g.passed);

    metrics::counter!("policy_loop_diffs_proposed_total").increment(raw.diffs.len() as u64);
    metrics::counter!("policy_loop_diffs_clamped_total")
        .increment(constraints_summary.clamped_params_count as u64);
    tracing::info!(
        raw_diffs = raw.diffs.len(),
        diffs = diffs.len(),
        frozen = constraints_summary.frozen_count,
        clamped = constraints_summary.clamped_params_count,
        total_cap_binding = constraints_summary.total_cap_binding,
        binding_budgets = ?constraints_summary.binding_budgets,
        guardrails_passed,
        "proposal built"
    );

    Ok(Proposal {
        proposed_policy,
        diffs,
        raw_diffs: raw.diffs,
        constraints_summary,
        guardrails,
        guardrails_passed,
    })
}

pub fn verify_replay(
    records: &[DecisionRecord],
    current_thresholds: &BTreeMap<Market, f64>,
    proposed_thresholds: &BTreeMap<Market, f64>,
    thresholds: &ReplayThresholds,
) -> ReplayVerdict {
    let verdict =
        replay_engine::verify_replay(records, current_thresholds, proposed_thresholds, thresholds);
    metrics::gauge!("policy_loop_replay_coverage_drop").set(verdict.coverage_drop);
    if verdict.blocked {
        metrics::counter!("policy_loop_replay_blocked_total").increment(1);
        tracing::warn!(reasons = ?verdict.reasons, "replay blocked proposal");
    } else {
        tracing::info!(
            baseline_coverage = verdict.baseline_coverage_pct,
            proposed_coverage = verdict.proposed_coverage_pct,
            "replay passed"
        );
    }
    verdict
}

pub fn audit(
    snapshots: &[Snapshot],
    current: &Policy,
    proposed: &Policy,
    model: &dyn DecisionModel,
    cfg: &LoopConfig,
) -> Result<AuditReport> {
    current.validate().context("current policy")?;
    proposed.validate().context("proposed policy")?;
    let report = AuditEngine::new(cfg.audit.clone()).audit(snapshots, current, proposed, model);
    if report.summary.skipped_snapshots > 0 {
        tracing::warn!(
            skipped = report.summary.skipped_snapshots,
            "snapshots skipped by decision model"
        );
    }
    tracing::info!(
        markets = report.summary.total_markets,
        changed = report.summary.changed_count,
        "audit complete"
    );
    Ok(report)
}

/// Full shadow cycle over one window. Never applies the proposal.
pub fn run_tuning_cycle(
    window: &RecordWindow,
    current: &Policy,
    snapshots: &[Snapshot],
    model: &dyn DecisionModel,
    cfg: &LoopConfig,
) -> Result<TuningRunReport> {
    let evaluation = evaluate(window, cfg);
    let proposal = propose(&evaluation, current, cfg)?;
    let replay = verify_replay(
        &window.records,
        &current.min_confidence_map(),
        &proposal.proposed_policy.min_confidence_map(),
        &cfg.replay,
    );
    let audit = audit(snapshots, current, &proposal.proposed_policy, model, cfg)?;

    let precision = cfg.output.float_precision;
    let checksums = RunChecksums {
        evaluation_report: checksum(&evaluation, precision)?,
        current_policy: checksum(current, precision)?,
        proposed_policy: checksum(&proposal.proposed_policy, precision)?,
    };
    let status = if replay.blocked {
        RunStatus::Fail
    } else {
        RunStatus::Pass
    };
    tracing::info!(%status, proposed = %proposal.proposed_policy.meta.version, "tuning cycle finished");

    Ok(TuningRunReport {
        status,
        current_version: current.meta.version.clone(),
        proposed_version: proposal.proposed_policy.meta.version.clone(),
        evaluation,
        proposal,
        replay,
        audit,
        checksums,
    })
}
