use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use core_types::{DecisionModel, Market, MarketDecision, Pick, Policy, ReasonCode, Snapshot};
use serde::{Deserialize, Serialize};

mod gate_model;

pub use gate_model::{GateEvidence, GateModel, RecordedDecision};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Rows kept in the report. Summary counts always cover every row.
    pub row_cap: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { row_cap: 200 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeReason {
    #[serde(rename = "")]
    None,
    #[serde(rename = "min_confidence_gate")]
    MinConfidenceGate,
    #[serde(rename = "min_confidence_relaxed")]
    MinConfidenceRelaxed,
    #[serde(rename = "policy_change")]
    PolicyChange,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::MinConfidenceGate => "min_confidence_gate",
            Self::MinConfidenceRelaxed => "min_confidence_relaxed",
            Self::PolicyChange => "policy_change",
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRow {
    pub snapshot_id: String,
    pub market: Market,
    pub before_pick: Pick,
    pub after_pick: Pick,
    pub before_confidence: Option<f64>,
    pub after_confidence: Option<f64>,
    pub changed: bool,
    pub change_reason: ChangeReason,
    pub reasons_added: Vec<ReasonCode>,
    pub reasons_removed: Vec<ReasonCode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditSummary {
    pub snapshot_count: usize,
    pub skipped_snapshots: usize,
    pub total_markets: usize,
    pub changed_count: usize,
    pub unchanged_count: usize,
    pub per_market_change_count: BTreeMap<Market, usize>,
    pub per_reason_count: BTreeMap<ChangeReason, usize>,
    pub rows_truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub summary: AuditSummary,
    pub rows: Vec<AuditRow>,
}

/// Picks are compared through their play state: a sentinel on either side
/// of a threshold move is attributed to the gate.
pub fn infer_change_reason(
    before: Pick,
    after: Pick,
    min_current: f64,
    min_proposed: f64,
) -> ChangeReason {
    if before == after {
        return ChangeReason::None;
    }
    if min_proposed > min_current {
        if before.is_play() && !after.is_play() {
            return ChangeReason::MinConfidenceGate;
        }
        if before == Pick::NoBet && after == Pick::NoPrediction {
            return ChangeReason::MinConfidenceGate;
        }
    }
    if min_proposed < min_current && !before.is_play() && after.is_play() {
        return ChangeReason::MinConfidenceRelaxed;
    }
    ChangeReason::PolicyChange
}

#[derive(Debug, Clone)]
pub struct AuditEngine {
    cfg: AuditConfig,
}

impl AuditEngine {
    pub fn new(cfg: AuditConfig) -> Self {
        Self { cfg }
    }

    pub fn audit(
        &self,
        snapshots: &[Snapshot],
        current: &Policy,
        proposed: &Policy,
        model: &dyn DecisionModel,
    ) -> AuditReport {
        let mut summary = AuditSummary {
            snapshot_count: snapshots.len(),
            per_market_change_count: Market::ALL.iter().map(|m| (*m, 0)).collect(),
            ..AuditSummary::default()
        };
        let mut rows = Vec::new();

        for snapshot in snapshots {
            let (before, after) = match (
                model.decide(snapshot, current),
                model.decide(snapshot, proposed),
            ) {
                (Ok(b), Ok(a)) => (b, a),
                _ => {
                    summary.skipped_snapshots += 1;
                    continue;
                }
            };
            for market in Market::ALL {
                let row = audit_row(
                    &snapshot.snapshot_id,
                    market,
                    first_for(&before, market),
                    first_for(&after, market),
                    current.min_confidence_for(market),
                    proposed.min_confidence_for(market),
                );
                summary.total_markets += 1;
                if row.changed {
                    summary.changed_count += 1;
                    *summary.per_market_change_count.entry(market).or_default() += 1;
                    *summary.per_reason_count.entry(row.change_reason).or_default() += 1;
                }
                if rows.len() < self.cfg.row_cap {
                    rows.push(row);
                } else {
                    summary.rows_truncated = true;
                }
            }
        }

        summary.unchanged_count = summary.total_markets - summary.changed_count;
        AuditReport { summary, rows }
    }
}

pub fn audit(
    snapshots: &[Snapshot],
    current: &Policy,
    proposed: &Policy,
    model: &dyn DecisionModel,
    cfg: &AuditConfig,
) -> AuditReport {
    AuditEngine::new(cfg.clone()).audit(snapshots, current, proposed, model)
}

fn first_for(decisions: &[MarketDecision], market: Market) -> Option<&MarketDecision> {
    decisions.iter().find(|d| d.market == market)
}

fn audit_row(
    snapshot_id: &str,
    market: Market,
    before: Option<&MarketDecision>,
    after: Option<&MarketDecision>,
    min_current: f64,
    min_proposed: f64,
) -> AuditRow {
    let pick = |d: Option<&MarketDecision>| d.map_or(Pick::NoPrediction, |d| d.pick);
    let confidence = |d: Option<&MarketDecision>| d.and_then(|d| d.confidence);
    let reasons = |d: Option<&MarketDecision>| -> BTreeSet<ReasonCode> {
        d.map(|d| d.reasons.iter().cloned().collect())
            .unwrap_or_default()
    };

    let before_pick = pick(before);
    let after_pick = pick(after);
    let before_confidence = confidence(before);
    let after_confidence = confidence(after);
    let changed = before_pick != after_pick || before_confidence != after_confidence;
    let change_reason = if !changed {
        ChangeReason::None
    } else if before_pick == after_pick {
        ChangeReason::PolicyChange
    } else {
        infer_change_reason(before_pick, after_pick, min_current, min_proposed)
    };
    let reasons_before = reasons(before);
    let reasons_after = reasons(after);

    AuditRow {
        snapshot_id: snapshot_id.to_string(),
        market,
        before_pick,
        after_pick,
        before_confidence,
        after_confidence,
        changed,
        change_reason,
        reasons_added: reasons_after.difference(&reasons_before).cloned().collect(),
        reasons_removed: reasons_before.difference(&reasons_after).cloned().collect(),
    }
}
