use std::collections::{BTreeMap, BTreeSet};

use core_types::{
    clamp_unit, CalibrationBucket, CalibrationDeviation, DampeningCandidate, DecisionRecord,
    EvaluationReport, EvaluationSummary, Market, MarketAccuracy, Outcome, ReasonChurn,
    ReasonCode, ReasonEffectiveness, RecordWindow, Stability, Suggestions,
};
use serde::{Deserialize, Serialize};

pub mod stats;

use stats::{decay_weight, percentile_linear, ratio_u64};

const BAND_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub half_life_runs: f64,
    /// Width of the fixed calibration bands over [0,1].
    pub band_width: f64,
    pub volatility_percentile: f64,
    pub effectiveness_decay_threshold: f64,
    pub calibration_deviation_threshold: f64,
    pub calibration_min_count: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            half_life_runs: 50.0,
            band_width: 0.05,
            volatility_percentile: 0.95,
            effectiveness_decay_threshold: 0.1,
            calibration_deviation_threshold: 0.1,
            calibration_min_count: 5,
        }
    }
}

impl EvaluatorConfig {
    pub fn sanitized(mut self) -> Self {
        if !(self.half_life_runs.is_finite() && self.half_life_runs > 0.0) {
            self.half_life_runs = Self::default().half_life_runs;
        }
        if !(self.band_width.is_finite() && self.band_width > 0.0 && self.band_width <= 1.0) {
            self.band_width = Self::default().band_width;
        }
        self.volatility_percentile = clamp_unit(self.volatility_percentile);
        self.effectiveness_decay_threshold = self.effectiveness_decay_threshold.max(0.0);
        self.calibration_deviation_threshold = self.calibration_deviation_threshold.max(0.0);
        self
    }

    fn band_count(&self) -> usize {
        ((1.0 / self.band_width).round() as usize).max(1)
    }

    fn band_index(&self, confidence: f64) -> usize {
        let idx = (confidence / self.band_width + BAND_EPSILON).floor();
        (idx.max(0.0) as usize).min(self.band_count() - 1)
    }

    fn band_bounds(&self, idx: usize) -> (f64, f64) {
        let lower = idx as f64 * self.band_width;
        let upper = if idx + 1 == self.band_count() {
            1.0
        } else {
            (idx + 1) as f64 * self.band_width
        };
        (lower, upper)
    }
}

pub fn band_label(lower: f64, upper: f64) -> String {
    format!("{lower:.2}-{upper:.2}")
}

#[derive(Debug, Clone)]
pub struct DecisionQualityEvaluator {
    cfg: EvaluatorConfig,
}

impl DecisionQualityEvaluator {
    pub fn new(cfg: EvaluatorConfig) -> Self {
        Self {
            cfg: cfg.sanitized(),
        }
    }

    pub fn cfg(&self) -> &EvaluatorConfig {
        &self.cfg
    }

    /// Builds a fresh report from the window. Pure: the same window always
    /// produces the same report.
    pub fn evaluate(&self, window: &RecordWindow) -> EvaluationReport {
        let (records, rejected) = window.prepared();
        let per_market = self.market_accuracy(&records);
        let reason_effectiveness = self.reason_effectiveness(&records);
        let suggestions = self.suggestions(&per_market, &reason_effectiveness);

        EvaluationReport {
            summary: EvaluationSummary {
                run_count: records.len(),
                malformed_records: window.malformed + rejected,
                half_life_runs: self.cfg.half_life_runs,
                first_run_id: records.first().map(|r| r.run_id),
                last_run_id: records.last().map(|r| r.run_id),
            },
            per_market,
            reason_effectiveness,
            reason_churn: reason_churn(&records),
            stability: self.stability(&records),
            suggestions,
        }
    }

    fn market_accuracy(&self, records: &[&DecisionRecord]) -> BTreeMap<Market, MarketAccuracy> {
        #[derive(Default, Clone)]
        struct BandAcc {
            success: u64,
            failure: u64,
            neutral: u64,
            confidence_sum: f64,
        }

        let bands = self.cfg.band_count();
        let mut out = BTreeMap::new();
        for market in Market::ALL {
            let (mut success, mut failure, mut neutral) = (0u64, 0u64, 0u64);
            let mut acc = vec![BandAcc::default(); bands];
            for rec in records {
                let outcome = rec.outcome(market);
                match outcome {
                    Outcome::Success => success += 1,
                    Outcome::Failure => failure += 1,
                    Outcome::Neutral | Outcome::Unresolved => neutral += 1,
                }
                let Some(pred) = rec.prediction(market) else {
                    continue;
                };
                let confidence = pred.clamped_confidence();
                let band = &mut acc[self.cfg.band_index(confidence)];
                match outcome {
                    Outcome::Success => {
                        band.success += 1;
                        band.confidence_sum += confidence;
                    }
                    Outcome::Failure => {
                        band.failure += 1;
                        band.confidence_sum += confidence;
                    }
                    Outcome::Neutral | Outcome::Unresolved => band.neutral += 1,
                }
            }

            let calibration = acc
                .iter()
                .enumerate()
                .map(|(idx, b)| {
                    let (lower, upper) = self.cfg.band_bounds(idx);
                    let count = b.success + b.failure;
                    CalibrationBucket {
                        band: band_label(lower, upper),
                        lower,
                        upper,
                        predicted_confidence: (lower + upper) / 2.0,
                        mean_confidence: (count > 0).then(|| b.confidence_sum / count as f64),
                        empirical_accuracy: ratio_u64(b.success, count),
                        success_count: b.success,
                        failure_count: b.failure,
                        neutral_count: b.neutral,
                        count,
                    }
                })
                .collect();

            out.insert(
                market,
                MarketAccuracy {
                    success_count: success,
                    failure_count: failure,
                    neutral_count: neutral,
                    accuracy: ratio_u64(success, success + failure),
                    calibration,
                },
            );
        }
        out
    }

    fn reason_effectiveness(
        &self,
        records: &[&DecisionRecord],
    ) -> BTreeMap<ReasonCode, ReasonEffectiveness> {
        let n = records.len();
        let mut out = BTreeMap::<ReasonCode, ReasonEffectiveness>::new();
        for (idx, rec) in records.iter().enumerate() {
            let weight = decay_weight(n - 1 - idx, self.cfg.half_life_runs);
            for market in Market::ALL {
                let outcome = rec.outcome(market);
                let codes: BTreeSet<&ReasonCode> = rec.reasons(market).iter().collect();
                for code in codes {
                    let entry = out.entry(code.clone()).or_default();
                    let per_market = entry.by_market.entry(market).or_default();
                    match outcome {
                        Outcome::Success => {
                            entry.win_count += 1;
                            entry.weighted_win += weight;
                            per_market.success += 1;
                        }
                        Outcome::Failure => {
                            entry.loss_count += 1;
                            entry.weighted_loss += weight;
                            per_market.failure += 1;
                        }
                        Outcome::Neutral | Outcome::Unresolved => {
                            entry.neutral_count += 1;
                            per_market.neutral += 1;
                        }
                    }
                }
            }
        }
        for entry in out.values_mut() {
            entry.decayed_contribution = entry.weighted_win - entry.weighted_loss;
            for stats in entry.by_market.values_mut() {
                stats.success_rate = ratio_u64(stats.success, stats.resolved());
            }
        }
        out
    }

    fn stability(&self, records: &[&DecisionRecord]) -> Stability {
        // Records are already in window order, so each match's runs stay ordered.
        let mut by_match = BTreeMap::<&str, Vec<&DecisionRecord>>::new();
        for rec in records {
            by_match.entry(rec.match_id.as_str()).or_default().push(rec);
        }

        let mut flips = 0u64;
        let mut pairs = 0u64;
        let mut deltas = Vec::<f64>::new();
        for runs in by_match.values() {
            for market in Market::ALL {
                let series: Vec<_> = runs.iter().filter_map(|r| r.prediction(market)).collect();
                for w in series.windows(2) {
                    pairs += 1;
                    if w[0].pick != w[1].pick {
                        flips += 1;
                    }
                    deltas.push((w[1].clamped_confidence() - w[0].clamped_confidence()).abs());
                }
            }
        }

        Stability {
            pick_flip_count: flips,
            pick_flip_pairs: pairs,
            pick_flip_rate: ratio_u64(flips, pairs).unwrap_or(0.0),
            confidence_volatility_p95: percentile_linear(&deltas, self.cfg.volatility_percentile)
                .unwrap_or(0.0),
            confidence_delta_count: deltas.len(),
        }
    }

    fn suggestions(
        &self,
        per_market: &BTreeMap<Market, MarketAccuracy>,
        reasons: &BTreeMap<ReasonCode, ReasonEffectiveness>,
    ) -> Suggestions {
        let dampening_candidates = reasons
            .iter()
            .filter(|(_, eff)| {
                eff.win_count + eff.loss_count > 0
                    && eff.decayed_contribution < -self.cfg.effectiveness_decay_threshold
            })
            .map(|(code, eff)| DampeningCandidate {
                reason_code: code.clone(),
                decayed_contribution: eff.decayed_contribution,
                win_count: eff.win_count,
                loss_count: eff.loss_count,
            })
            .collect();

        let mut calibration_deviations = Vec::new();
        for (market, acc) in per_market {
            for bucket in &acc.calibration {
                let Some(empirical) = bucket.empirical_accuracy else {
                    continue;
                };
                if bucket.count < self.cfg.calibration_min_count {
                    continue;
                }
                let deviation = (empirical - bucket.predicted_confidence).abs();
                if deviation > self.cfg.calibration_deviation_threshold {
                    calibration_deviations.push(CalibrationDeviation {
                        market: *market,
                        band: bucket.band.clone(),
                        predicted_confidence: bucket.predicted_confidence,
                        empirical_accuracy: empirical,
                        deviation,
                        count: bucket.count,
                    });
                }
            }
        }

        Suggestions {
            dampening_candidates,
            calibration_deviations,
        }
    }
}

/// Drops invalid or duplicate records and orders the rest by
/// (`created_at`, `run_id`). Returns the kept records and the rejected count.
/// Reason appearances/disappearances between adjacent runs, per market.
fn reason_churn(records: &[&DecisionRecord]) -> ReasonChurn {
    let mut appearances = 0u64;
    let mut disappearances = 0u64;
    for w in records.windows(2) {
        for market in Market::ALL {
            let prev: BTreeSet<&ReasonCode> = w[0].reasons(market).iter().collect();
            let cur: BTreeSet<&ReasonCode> = w[1].reasons(market).iter().collect();
            appearances += cur.difference(&prev).count() as u64;
            disappearances += prev.difference(&cur).count() as u64;
        }
    }
    let run_pairs = records.len().saturating_sub(1);
    ReasonChurn {
        run_pairs,
        appearance_count: appearances,
        disappearance_count: disappearances,
        total_transitions: appearances + disappearances,
        appearance_rate: ratio_u64(appearances, run_pairs as u64).unwrap_or(0.0),
        disappearance_rate: ratio_u64(disappearances, run_pairs as u64).unwrap_or(0.0),
    }
}
