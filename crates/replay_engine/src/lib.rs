use std::collections::BTreeMap;

use core_types::{
    clamp_unit, prepare_records, DecisionRecord, Market, Outcome, ReplayMarketStats,
    ReplayVerdict, DEFAULT_MIN_CONFIDENCE,
};
use serde::{Deserialize, Serialize};

pub mod jsonl;

pub use jsonl::{load_jsonl, JsonlRecordSource, JsonlRecordWriter, JsonlSnapshotSource};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayThresholds {
    pub coverage_drop_threshold: f64,
    pub accuracy_drop_threshold: f64,
    /// Used for markets missing from a threshold map.
    pub default_min_confidence: f64,
}

impl Default for ReplayThresholds {
    fn default() -> Self {
        Self {
            coverage_drop_threshold: 0.10,
            accuracy_drop_threshold: 0.05,
            default_min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl ReplayThresholds {
    pub fn sanitized(mut self) -> Self {
        self.coverage_drop_threshold = clamp_unit(self.coverage_drop_threshold);
        self.accuracy_drop_threshold = clamp_unit(self.accuracy_drop_threshold);
        self.default_min_confidence = clamp_unit(self.default_min_confidence);
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    covered: usize,
    success: u64,
    failure: u64,
}

impl Tally {
    fn accuracy(&self) -> Option<f64> {
        let resolved = self.success + self.failure;
        (resolved > 0).then(|| self.success as f64 / resolved as f64)
    }
}

/// Replays the recorded predictions under the current and proposed
/// thresholds. A slot covers iff the pick is a play and its recorded
/// confidence clears the market threshold. Nothing is re-predicted.
pub fn verify_replay(
    records: &[DecisionRecord],
    current: &BTreeMap<Market, f64>,
    proposed: &BTreeMap<Market, f64>,
    thresholds: &ReplayThresholds,
) -> ReplayVerdict {
    let threshold = |map: &BTreeMap<Market, f64>, m: Market| {
        map.get(&m)
            .copied()
            .unwrap_or(thresholds.default_min_confidence)
    };

    let (valid, _) = prepare_records(records);
    let mut baseline = Tally::default();
    let mut candidate = Tally::default();
    let mut per_market = BTreeMap::new();

    for market in Market::ALL {
        let base_thr = threshold(current, market);
        let prop_thr = threshold(proposed, market);
        let mut stats = ReplayMarketStats {
            slots: valid.len(),
            baseline_threshold: base_thr,
            proposed_threshold: prop_thr,
            ..ReplayMarketStats::default()
        };
        for rec in &valid {
            let Some(pred) = rec.prediction(market) else {
                continue;
            };
            if !pred.pick.is_play() {
                continue;
            }
            let confidence = pred.clamped_confidence();
            let outcome = rec.outcome(market);
            for (thr, tally, covered) in [
                (base_thr, &mut baseline, &mut stats.baseline_covered),
                (prop_thr, &mut candidate, &mut stats.proposed_covered),
            ] {
                if confidence < thr {
                    continue;
                }
                *covered += 1;
                tally.covered += 1;
                match outcome {
                    Outcome::Success => tally.success += 1,
                    Outcome::Failure => tally.failure += 1,
                    Outcome::Neutral | Outcome::Unresolved => {}
                }
            }
        }
        per_market.insert(market, stats);
    }

    let total_market_slots = valid.len() * Market::ALL.len();
    let coverage = |t: &Tally| {
        if total_market_slots == 0 {
            0.0
        } else {
            t.covered as f64 / total_market_slots as f64
        }
    };
    let baseline_coverage_pct = coverage(&baseline);
    let proposed_coverage_pct = coverage(&candidate);
    let coverage_drop = baseline_coverage_pct - proposed_coverage_pct;
    let baseline_accuracy = baseline.accuracy();
    let proposed_accuracy = candidate.accuracy();
    let accuracy_drop = match (baseline_accuracy, proposed_accuracy) {
        (Some(b), Some(p)) => Some(b - p),
        _ => None,
    };

    let mut reasons = Vec::new();
    if coverage_drop > thresholds.coverage_drop_threshold {
        reasons.push(format!(
            "coverage_drop {coverage_drop:.4} > {:.4} (baseline {baseline_coverage_pct:.4}, proposed {proposed_coverage_pct:.4})",
            thresholds.coverage_drop_threshold
        ));
    }
    if let Some(drop) = accuracy_drop {
        if drop > thresholds.accuracy_drop_threshold {
            reasons.push(format!(
                "accuracy_drop {drop:.4} > {:.4}",
                thresholds.accuracy_drop_threshold
            ));
        }
    }

    ReplayVerdict {
        blocked: !reasons.is_empty(),
        reasons,
        baseline_coverage_pct,
        proposed_coverage_pct,
        coverage_drop,
        baseline_accuracy,
        proposed_accuracy,
        accuracy_drop,
        total_market_slots,
        per_market,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use core_types::{Pick, Prediction};

    fn uniform(m: f64) -> BTreeMap<Market, f64> {
        Market::ALL.iter().map(|k| (*k, m)).collect()
    }

    fn records(n: u64, confidence: f64, outcome_for: impl Fn(u64) -> Outcome) -> Vec<DecisionRecord> {
        let base = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| DecisionRecord {
                run_id: i,
                created_at: base + Duration::minutes(i as i64),
                match_id: format!("match-{i}"),
                market_outcomes: Market::ALL.iter().map(|m| (*m, outcome_for(i))).collect(),
                reason_codes_by_market: BTreeMap::new(),
                predictions: vec![
                    Prediction {
                        market: Market::OneXTwo,
                        pick: Pick::Home,
                        confidence,
                        reasons: vec![],
                    },
                    Prediction {
                        market: Market::OverUnder25,
                        pick: Pick::Over,
                        confidence,
                        reasons: vec![],
                    },
                    Prediction {
                        market: Market::GgNg,
                        pick: Pick::Gg,
                        confidence,
                        reasons: vec![],
                    },
                ],
            })
            .collect()
    }

    #[test]
    fn repeated_run_ids_are_replayed_once() {
        let mut recs = records(1, 0.70, |_| Outcome::Success);
        let dup = recs[0].clone();
        recs.push(dup.clone());
        recs.push(dup);
        let verdict = verify_replay(
            &recs,
            &uniform(0.62),
            &uniform(0.62),
            &ReplayThresholds::default(),
        );
        assert_eq!(verdict.total_market_slots, 3);
        assert_eq!(verdict.per_market[&Market::OneXTwo].slots, 1);
        assert_eq!(verdict.per_market[&Market::OneXTwo].baseline_covered, 1);
    }

    #[test]
    fn raising_every_threshold_past_all_confidences_blocks() {
        let recs = records(10, 0.62, |_| Outcome::Success);
        let verdict = verify_replay(
            &recs,
            &uniform(0.62),
            &uniform(0.99),
            &ReplayThresholds::default(),
        );
        assert_eq!(verdict.total_market_slots, 30);
        assert!((verdict.baseline_coverage_pct - 1.0).abs() < 1e-9);
        assert_eq!(verdict.proposed_coverage_pct, 0.0);
        assert!(verdict.blocked);
        assert!(verdict.reasons.iter().any(|r| r.starts_with("coverage_drop")));
        assert_eq!(verdict.proposed_accuracy, None);
        assert_eq!(verdict.accuracy_drop, None);
    }

    #[test]
    fn identical_thresholds_pass() {
        let recs = records(6, 0.7, |i| if i % 2 == 0 { Outcome::Success } else { Outcome::Failure });
        let verdict = verify_replay(
            &recs,
            &uniform(0.62),
            &uniform(0.62),
            &ReplayThresholds::default(),
        );
        assert!(!verdict.blocked);
        assert!(verdict.reasons.is_empty());
        assert_eq!(verdict.baseline_accuracy, Some(0.5));
        assert_eq!(verdict.accuracy_drop, Some(0.0));
    }

    #[test]
    fn accuracy_drop_blocks_independently() {
        // High-confidence calls lose, low-confidence calls win: raising the
        // threshold keeps only the losers.
        let mut recs = records(4, 0.65, |_| Outcome::Success);
        recs.extend(records(4, 0.90, |_| Outcome::Failure).into_iter().map(|mut r| {
            r.run_id += 100;
            r
        }));
        let verdict = verify_replay(
            &recs,
            &uniform(0.62),
            &uniform(0.80),
            &ReplayThresholds {
                coverage_drop_threshold: 1.0,
                ..ReplayThresholds::default()
            },
        );
        assert!(verdict.blocked);
        assert_eq!(verdict.reasons.len(), 1);
        assert!(verdict.reasons[0].starts_with("accuracy_drop"));
        assert_eq!(verdict.proposed_accuracy, Some(0.0));
    }

    #[test]
    fn missing_market_threshold_falls_back_and_sentinels_never_cover() {
        let mut recs = records(2, 0.63, |_| Outcome::Neutral);
        recs[0].predictions[0].pick = Pick::NoBet;
        let verdict = verify_replay(
            &recs,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &ReplayThresholds::default(),
        );
        let one = &verdict.per_market[&Market::OneXTwo];
        assert_eq!(one.slots, 2);
        assert_eq!(one.baseline_covered, 1);
        assert!((one.baseline_threshold - 0.62).abs() < 1e-9);
        // Only neutral outcomes: coverage counted, accuracy undefined.
        assert_eq!(verdict.baseline_accuracy, None);
        assert!(!verdict.blocked);
    }

    #[test]
    fn empty_window_is_not_blocked() {
        let verdict = verify_replay(&[], &uniform(0.62), &uniform(0.9), &ReplayThresholds::default());
        assert_eq!(verdict.total_market_slots, 0);
        assert!(!verdict.blocked);
    }
}
