use core_types::{
    EvaluationReport, Market, MarketPolicy, ParamPath, Policy, PolicyDiff, PolicyVersion,
    ReasonCode, DEFAULT_DAMPENING_FACTOR,
};
use serde::{Deserialize, Serialize};

const BAND_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunerConfig {
    pub min_sample_size: u64,
    pub drift_band_lower: f64,
    pub drift_band_upper: f64,
    pub failure_rate_threshold: f64,
    pub min_confidence_bump: f64,
    pub max_min_confidence: f64,
    pub success_rate_floor: f64,
    pub dampening_multiplier: f64,
    pub dampening_floor: f64,
    /// Post-constraint guardrail: largest allowed `min_confidence` increase.
    pub max_min_confidence_delta: f64,
    /// Post-constraint guardrail: largest allowed relative dampening decrease.
    pub max_dampening_decrease_pct: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 30,
            drift_band_lower: 0.55,
            drift_band_upper: 0.60,
            failure_rate_threshold: 0.65,
            min_confidence_bump: 0.03,
            max_min_confidence: 0.75,
            success_rate_floor: 0.45,
            dampening_multiplier: 0.8,
            dampening_floor: 0.3,
            max_min_confidence_delta: 0.05,
            max_dampening_decrease_pct: 0.25,
        }
    }
}

impl TunerConfig {
    pub fn sanitized(mut self) -> Self {
        let unit = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        self.min_sample_size = self.min_sample_size.max(1);
        self.drift_band_lower = unit(self.drift_band_lower);
        self.drift_band_upper = unit(self.drift_band_upper).max(self.drift_band_lower);
        self.failure_rate_threshold = unit(self.failure_rate_threshold);
        self.min_confidence_bump = unit(self.min_confidence_bump);
        self.max_min_confidence = unit(self.max_min_confidence);
        self.success_rate_floor = unit(self.success_rate_floor);
        self.dampening_multiplier = unit(self.dampening_multiplier);
        self.dampening_floor = unit(self.dampening_floor);
        self.max_min_confidence_delta = unit(self.max_min_confidence_delta);
        self.max_dampening_decrease_pct = unit(self.max_dampening_decrease_pct);
        self
    }

    pub fn drift_band_label(&self) -> String {
        format!("{:.2}-{:.2}", self.drift_band_lower, self.drift_band_upper)
    }
}

/// Raw tuner output, before constraints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunerProposal {
    pub proposed_policy: Policy,
    pub diffs: Vec<PolicyDiff>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardrailCheck {
    pub check: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ShadowTuner {
    cfg: TunerConfig,
}

impl ShadowTuner {
    pub fn new(cfg: TunerConfig) -> Self {
        Self {
            cfg: cfg.sanitized(),
        }
    }

    pub fn cfg(&self) -> &TunerConfig {
        &self.cfg
    }

    /// Deterministic shadow proposal. Never applies anything; `current` is
    /// only read.
    pub fn propose(&self, report: &EvaluationReport, current: &Policy) -> TunerProposal {
        let mut diffs = self.threshold_bumps(report, current);
        diffs.extend(self.reason_dampening(report, current));
        diffs.sort_by(|a, b| a.path.cmp(&b.path));

        let mut proposed = current.clone();
        proposed.meta = proposal_meta(&current.meta);
        for diff in &diffs {
            match &diff.path {
                ParamPath::MarketMinConfidence(m) => {
                    proposed.markets.insert(
                        *m,
                        MarketPolicy {
                            min_confidence: diff.new_value,
                        },
                    );
                }
                ParamPath::ReasonDampening(code) => {
                    proposed.reasons.entry(code.clone()).or_default().dampening_factor =
                        diff.new_value;
                }
            }
        }

        TunerProposal {
            proposed_policy: proposed,
            diffs,
        }
    }

    /// (failure_rate, resolved sample) summed over the buckets that overlap
    /// the drift band. A bucket straddling a band edge counts whole, so a
    /// band width that does not divide the drift band never hides evidence.
    /// `None` when nothing in the band resolved.
    fn drift_band_failure_rate(&self, report: &EvaluationReport, market: Market) -> (Option<f64>, u64) {
        let Some(acc) = report.per_market.get(&market) else {
            return (None, 0);
        };
        let (mut failures, mut resolved) = (0u64, 0u64);
        for bucket in &acc.calibration {
            if bucket.lower + BAND_EPSILON < self.cfg.drift_band_upper
                && bucket.upper > self.cfg.drift_band_lower + BAND_EPSILON
            {
                failures += bucket.failure_count;
                resolved += bucket.count;
            }
        }
        if resolved == 0 {
            return (None, 0);
        }
        (Some(failures as f64 / resolved as f64), resolved)
    }

    fn threshold_bumps(&self, report: &EvaluationReport, current: &Policy) -> Vec<PolicyDiff> {
        let band = self.cfg.drift_band_label();
        let mut out = Vec::new();
        for market in Market::ALL {
            let (Some(rate), sample) = self.drift_band_failure_rate(report, market) else {
                continue;
            };
            if sample < self.cfg.min_sample_size || rate <= self.cfg.failure_rate_threshold {
                continue;
            }
            let old = current.min_confidence_for(market);
            let new = (old + self.cfg.min_confidence_bump).min(self.cfg.max_min_confidence);
            // Ratchet: this rule only ever raises a threshold.
            if new <= old {
                continue;
            }
            out.push(PolicyDiff {
                path: ParamPath::MarketMinConfidence(market),
                old_value: old,
                new_value: new,
                rationale: format!(
                    "failure_rate in band {band} = {rate:.2} > {:.2}, n={sample}",
                    self.cfg.failure_rate_threshold
                ),
            });
        }
        out
    }

    fn reason_dampening(&self, report: &EvaluationReport, current: &Policy) -> Vec<PolicyDiff> {
        let mut out = Vec::new();
        for (code, eff) in &report.reason_effectiveness {
            let mut worst: Option<(f64, Market, u64)> = None;
            for (market, stats) in &eff.by_market {
                let Some(rate) = stats.success_rate else {
                    continue;
                };
                let n = stats.resolved();
                if n < self.cfg.min_sample_size || rate >= self.cfg.success_rate_floor {
                    continue;
                }
                if worst.map_or(true, |(w, _, _)| rate < w) {
                    worst = Some((rate, *market, n));
                }
            }
            let Some((rate, market, n)) = worst else {
                continue;
            };
            let old = dampening_or_default(current, code);
            let new = (old * self.cfg.dampening_multiplier).max(self.cfg.dampening_floor);
            if new >= old {
                continue;
            }
            out.push(PolicyDiff {
                path: ParamPath::ReasonDampening(code.clone()),
                old_value: old,
                new_value: new,
                rationale: format!(
                    "success_rate {rate:.2} < {:.2} in {market}, n={n}",
                    self.cfg.success_rate_floor
                ),
            });
        }
        out
    }
}

fn dampening_or_default(policy: &Policy, code: &ReasonCode) -> f64 {
    policy
        .reasons
        .get(code)
        .map(|r| r.dampening_factor)
        .unwrap_or(DEFAULT_DAMPENING_FACTOR)
}

/// Version meta for a proposal derived from `current`. No timestamp: the
/// approver stamps it, which keeps proposals reproducible.
pub fn proposal_meta(current: &PolicyVersion) -> PolicyVersion {
    PolicyVersion {
        version: format!("{}-tuned", current.version),
        created_at_utc: None,
        notes: Some("shadow proposal from tuner".to_string()),
    }
}

/// Checks run against the post-constraint proposal.
pub fn evaluate_guardrails(
    current: &Policy,
    proposed: &Policy,
    cfg: &TunerConfig,
) -> Vec<GuardrailCheck> {
    let mut out = Vec::new();
    for market in Market::ALL {
        let (Some(cur), Some(prop)) = (current.markets.get(&market), proposed.markets.get(&market))
        else {
            continue;
        };
        let delta = prop.min_confidence - cur.min_confidence;
        let passed = delta <= cfg.max_min_confidence_delta + BAND_EPSILON;
        let detail = if passed {
            format!("{market}: delta {delta:.3}")
        } else {
            format!(
                "{market}: delta {delta:.3} > {:.2}",
                cfg.max_min_confidence_delta
            )
        };
        out.push(GuardrailCheck {
            check: "min_confidence_delta".to_string(),
            passed,
            detail,
        });
    }

    for (code, prop) in &proposed.reasons {
        let check = "dampening_decrease".to_string();
        let Some(cur) = current.reasons.get(code) else {
            out.push(GuardrailCheck {
                check,
                passed: true,
                detail: format!("{code}: new reason"),
            });
            continue;
        };
        if cur.dampening_factor <= 0.0 {
            continue;
        }
        let pct = (cur.dampening_factor - prop.dampening_factor) / cur.dampening_factor;
        let passed = pct <= cfg.max_dampening_decrease_pct + BAND_EPSILON;
        let detail = if passed {
            format!("{code}: ok")
        } else {
            format!(
                "{code}: decrease {:.2}% > {:.0}%",
                pct * 100.0,
                cfg.max_dampening_decrease_pct * 100.0
            )
        };
        out.push(GuardrailCheck {
            check,
            passed,
            detail,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use core_types::{DecisionRecord, Outcome, Pick, Prediction, ReasonPolicy, RecordWindow};
    use decision_quality::{DecisionQualityEvaluator, EvaluatorConfig};
    use std::collections::BTreeMap;

    fn window(market: Market, confidence: f64, wins: u64, losses: u64, reason: &str) -> RecordWindow {
        let base = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let records = (0..wins + losses)
            .map(|i| {
                let outcome = if i < wins { Outcome::Success } else { Outcome::Failure };
                DecisionRecord {
                    run_id: i,
                    created_at: base + Duration::hours(i as i64),
                    match_id: format!("m{i}"),
                    market_outcomes: BTreeMap::from([(market, outcome)]),
                    reason_codes_by_market: BTreeMap::from([(market, vec![reason.into()])]),
                    predictions: vec![Prediction {
                        market,
                        pick: Pick::Home,
                        confidence,
                        reasons: vec![reason.into()],
                    }],
                }
            })
            .collect();
        RecordWindow {
            records,
            malformed: 0,
        }
    }

    fn report(w: &RecordWindow) -> EvaluationReport {
        DecisionQualityEvaluator::new(EvaluatorConfig::default()).evaluate(w)
    }

    #[test]
    fn bumps_threshold_when_drift_band_fails() {
        let rep = report(&window(Market::OneXTwo, 0.57, 10, 30, "R1"));
        let tuner = ShadowTuner::new(TunerConfig::default());
        let out = tuner.propose(&rep, &Policy::default_policy());
        let bump = out
            .diffs
            .iter()
            .find(|d| d.path == ParamPath::MarketMinConfidence(Market::OneXTwo))
            .expect("bump diff");
        assert!((bump.new_value - 0.65).abs() < 1e-9);
        assert_eq!(bump.rationale, "failure_rate in band 0.55-0.60 = 0.75 > 0.65, n=40");
        assert!((out.proposed_policy.min_confidence_for(Market::OneXTwo) - 0.65).abs() < 1e-9);
        assert_eq!(out.proposed_policy.meta.version, "v0-tuned");
    }

    #[test]
    fn coarse_bands_straddling_the_drift_band_still_bump() {
        let cfg = EvaluatorConfig {
            band_width: 0.1,
            ..EvaluatorConfig::default()
        };
        let rep =
            DecisionQualityEvaluator::new(cfg).evaluate(&window(Market::OneXTwo, 0.57, 0, 100, "R1"));
        let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &Policy::default_policy());
        let bump = out
            .diffs
            .iter()
            .find(|d| d.path == ParamPath::MarketMinConfidence(Market::OneXTwo))
            .expect("bump diff");
        assert!((bump.new_value - 0.65).abs() < 1e-9);
        assert!(bump.rationale.ends_with("n=100"));
    }

    #[test]
    fn neighbouring_bands_are_not_drift_evidence() {
        // 0.50-0.55 and 0.60-0.65 only touch the default drift band at its edges.
        for confidence in [0.52, 0.62] {
            let rep = report(&window(Market::OneXTwo, confidence, 0, 40, "R1"));
            let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &Policy::default_policy());
            assert!(out.diffs.iter().all(|d| d.path.market().is_none()));
        }
    }

    #[test]
    fn bump_never_lowers_a_threshold_above_ceiling() {
        let rep = report(&window(Market::GgNg, 0.58, 0, 40, "R1"));
        let mut current = Policy::default_policy();
        current
            .markets
            .insert(Market::GgNg, MarketPolicy { min_confidence: 0.80 });
        let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &current);
        assert!(out
            .diffs
            .iter()
            .all(|d| d.path.market().is_none() || d.new_value > d.old_value));
        assert!(out
            .diffs
            .iter()
            .all(|d| d.path != ParamPath::MarketMinConfidence(Market::GgNg)));
    }

    #[test]
    fn insufficient_sample_yields_no_diffs() {
        let rep = report(&window(Market::OverUnder25, 0.57, 0, 29, "weak"));
        let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &Policy::default_policy());
        assert!(out.diffs.is_empty());
        assert_eq!(out.proposed_policy.markets, Policy::default_policy().markets);
    }

    #[test]
    fn dampens_reason_below_success_floor() {
        let rep = report(&window(Market::OneXTwo, 0.80, 10, 30, "weak"));
        let mut current = Policy::default_policy();
        current
            .reasons
            .insert("weak".into(), ReasonPolicy { dampening_factor: 0.5 });
        let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &current);
        assert_eq!(out.diffs.len(), 1);
        let d = &out.diffs[0];
        assert_eq!(d.path, ParamPath::ReasonDampening("weak".into()));
        assert!((d.new_value - 0.4).abs() < 1e-9);
        assert_eq!(d.rationale, "success_rate 0.25 < 0.45 in one_x_two, n=40");
    }

    #[test]
    fn dampening_respects_floor_and_defaults_missing_reason() {
        let rep = report(&window(Market::OneXTwo, 0.80, 0, 40, "new_reason"));
        let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &Policy::default_policy());
        let d = &out.diffs[0];
        assert!((d.old_value - 1.0).abs() < 1e-9);
        assert!((d.new_value - 0.8).abs() < 1e-9);

        let mut floored = Policy::default_policy();
        floored
            .reasons
            .insert("new_reason".into(), ReasonPolicy { dampening_factor: 0.3 });
        let out = ShadowTuner::new(TunerConfig::default()).propose(&rep, &floored);
        assert!(out.diffs.is_empty());
    }

    #[test]
    fn guardrails_flag_large_moves() {
        let current = Policy::default_policy();
        let mut proposed = current.clone();
        proposed
            .markets
            .insert(Market::OneXTwo, MarketPolicy { min_confidence: 0.70 });
        proposed
            .reasons
            .insert("R1".into(), ReasonPolicy { dampening_factor: 0.8 });
        let checks = evaluate_guardrails(&current, &proposed, &TunerConfig::default());
        let failed: Vec<_> = checks.iter().filter(|c| !c.passed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].check, "min_confidence_delta");
        assert!(checks
            .iter()
            .any(|c| c.check == "dampening_decrease" && c.detail == "R1: new reason"));
    }
}
