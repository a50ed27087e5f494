use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use core_types::{Market, ParamGroup, ParamPath, PolicyDiff};
use serde::{Deserialize, Serialize};

pub const MAX_TOP_DELTAS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConstraintsConfig {
    pub per_param_step_max: f64,
    pub per_run_total_delta_max: f64,
    pub per_market_budget: BTreeMap<Market, f64>,
    pub per_group_budget: BTreeMap<ParamGroup, f64>,
    /// Dotted parameter paths that must never move.
    pub freeze_params: BTreeSet<String>,
}

impl Default for ConstraintsConfig {
    fn default() -> Self {
        Self {
            per_param_step_max: 0.01,
            per_run_total_delta_max: 0.03,
            per_market_budget: Market::ALL.iter().map(|m| (*m, 0.02)).collect(),
            per_group_budget: BTreeMap::from([
                (ParamGroup::Thresholds, 0.03),
                (ParamGroup::Dampening, 0.05),
            ]),
            freeze_params: BTreeSet::new(),
        }
    }
}

impl ConstraintsConfig {
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.per_param_step_max = non_negative(self.per_param_step_max, defaults.per_param_step_max);
        self.per_run_total_delta_max =
            non_negative(self.per_run_total_delta_max, defaults.per_run_total_delta_max);
        for budget in self.per_market_budget.values_mut() {
            *budget = non_negative(*budget, 0.0);
        }
        for budget in self.per_group_budget.values_mut() {
            *budget = non_negative(*budget, 0.0);
        }
        self.freeze_params = self
            .freeze_params
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    pub fn is_frozen(&self, path: &ParamPath) -> bool {
        self.freeze_params.contains(&path.to_string())
    }
}

fn non_negative(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        fallback
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopDelta {
    pub path: ParamPath,
    pub delta: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConstraintsSummary {
    pub input_count: usize,
    pub frozen_count: usize,
    pub clamped_params_count: usize,
    pub total_cap_binding: bool,
    /// `market:<market>` / `group:<group>` labels of budgets that scaled.
    pub binding_budgets: Vec<String>,
    pub any_binding: bool,
    pub total_abs_delta_before: f64,
    pub total_abs_delta_after: f64,
    pub top_deltas: Vec<TopDelta>,
}

/// Runs freeze, step cap, total cap and drift budgets, in that order.
///
/// Input order does not matter: diffs are sorted by path first, and the
/// output keeps that order.
pub fn apply_constraints(
    diffs: &[PolicyDiff],
    cfg: &ConstraintsConfig,
) -> (Vec<PolicyDiff>, ConstraintsSummary) {
    let mut sorted = diffs.to_vec();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let total_abs_delta_before = total_abs_delta(&sorted);

    let (frozen, frozen_count) = freeze_stage(sorted, cfg);
    let (stepped, clamped_params_count) = step_cap_stage(frozen, cfg);
    let (capped, total_cap_binding) = total_cap_stage(stepped, cfg);
    let (budgeted, binding_budgets) = budget_stage(capped, cfg);

    let summary = ConstraintsSummary {
        input_count: diffs.len(),
        frozen_count,
        clamped_params_count,
        total_cap_binding,
        any_binding: clamped_params_count > 0 || total_cap_binding || !binding_budgets.is_empty(),
        binding_budgets,
        total_abs_delta_before,
        total_abs_delta_after: total_abs_delta(&budgeted),
        top_deltas: top_deltas(&budgeted),
    };
    (budgeted, summary)
}

/// Frozen paths keep their diff entry but with `new_value == old_value`.
pub fn freeze_stage(diffs: Vec<PolicyDiff>, cfg: &ConstraintsConfig) -> (Vec<PolicyDiff>, usize) {
    let mut frozen = 0usize;
    let out = diffs
        .into_iter()
        .map(|mut d| {
            if cfg.is_frozen(&d.path) {
                frozen += 1;
                d.new_value = d.old_value;
            }
            d
        })
        .collect();
    (out, frozen)
}

pub fn step_cap_stage(
    diffs: Vec<PolicyDiff>,
    cfg: &ConstraintsConfig,
) -> (Vec<PolicyDiff>, usize) {
    let step = cfg.per_param_step_max;
    let mut clamped = 0usize;
    let out = diffs
        .into_iter()
        .map(|mut d| {
            let delta = d.delta();
            let capped = delta.clamp(-step, step);
            if capped != delta {
                clamped += 1;
                d.new_value = d.old_value + capped;
            }
            d
        })
        .collect();
    (out, clamped)
}

/// Proportional shrink of every delta when the run total exceeds the cap.
pub fn total_cap_stage(
    diffs: Vec<PolicyDiff>,
    cfg: &ConstraintsConfig,
) -> (Vec<PolicyDiff>, bool) {
    let all: Vec<usize> = (0..diffs.len()).collect();
    scale_indices(diffs, &all, cfg.per_run_total_delta_max)
}

/// Per-market budgets first, then per-group budgets, each group scaled
/// independently.
pub fn budget_stage(
    diffs: Vec<PolicyDiff>,
    cfg: &ConstraintsConfig,
) -> (Vec<PolicyDiff>, Vec<String>) {
    let mut binding = Vec::new();
    let mut out = diffs;

    for market in Market::ALL {
        let Some(budget) = cfg.per_market_budget.get(&market) else {
            continue;
        };
        let idx: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, d)| d.path.market() == Some(market))
            .map(|(i, _)| i)
            .collect();
        let (next, bound) = scale_indices(out, &idx, *budget);
        out = next;
        if bound {
            binding.push(format!("market:{market}"));
        }
    }

    for group in [ParamGroup::Thresholds, ParamGroup::Dampening] {
        let Some(budget) = cfg.per_group_budget.get(&group) else {
            continue;
        };
        let idx: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, d)| d.path.group() == group)
            .map(|(i, _)| i)
            .collect();
        let (next, bound) = scale_indices(out, &idx, *budget);
        out = next;
        if bound {
            binding.push(format!("group:{group}"));
        }
    }

    (out, binding)
}

fn scale_indices(mut diffs: Vec<PolicyDiff>, idx: &[usize], budget: f64) -> (Vec<PolicyDiff>, bool) {
    let group_abs: f64 = idx.iter().map(|i| diffs[*i].delta().abs()).sum();
    if group_abs <= budget || group_abs <= 0.0 {
        return (diffs, false);
    }
    let scale = budget / group_abs;
    for i in idx {
        let d = &mut diffs[*i];
        d.new_value = d.old_value + d.delta() * scale;
    }
    trim_to_budget(&mut diffs, idx, budget);
    (diffs, true)
}

/// `old + delta * scale` rounds, so the scaled sum can land a few ulps over
/// the budget. Pulls the largest delta in until the sum fits.
fn trim_to_budget(diffs: &mut [PolicyDiff], idx: &[usize], budget: f64) {
    let mut slack = f64::EPSILON;
    loop {
        let total: f64 = idx.iter().map(|i| diffs[*i].delta().abs()).sum();
        let excess = total - budget;
        if excess <= 0.0 {
            return;
        }
        let Some(&largest) = idx.iter().max_by(|a, b| {
            diffs[**a]
                .delta()
                .abs()
                .partial_cmp(&diffs[**b].delta().abs())
                .unwrap_or(Ordering::Equal)
        }) else {
            return;
        };
        let d = &mut diffs[largest];
        let delta = d.delta();
        if delta == 0.0 {
            return;
        }
        let kept = (delta.abs() - excess - slack).max(0.0);
        d.new_value = d.old_value + kept.copysign(delta);
        slack *= 2.0;
    }
}

fn total_abs_delta(diffs: &[PolicyDiff]) -> f64 {
    diffs.iter().map(|d| d.delta().abs()).sum()
}

fn top_deltas(diffs: &[PolicyDiff]) -> Vec<TopDelta> {
    let mut moved: Vec<TopDelta> = diffs
        .iter()
        .filter(|d| d.delta() != 0.0)
        .map(|d| TopDelta {
            path: d.path.clone(),
            delta: d.delta(),
        })
        .collect();
    moved.sort_by(|a, b| {
        b.delta
            .abs()
            .partial_cmp(&a.delta.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
    moved.truncate(MAX_TOP_DELTAS);
    moved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(market: Market, old: f64, new: f64) -> PolicyDiff {
        PolicyDiff {
            path: ParamPath::MarketMinConfidence(market),
            old_value: old,
            new_value: new,
            rationale: "test".to_string(),
        }
    }

    fn dampening(code: &str, old: f64, new: f64) -> PolicyDiff {
        PolicyDiff {
            path: ParamPath::ReasonDampening(code.into()),
            old_value: old,
            new_value: new,
            rationale: "test".to_string(),
        }
    }

    #[test]
    fn frozen_params_never_move() {
        let cfg = ConstraintsConfig {
            freeze_params: BTreeSet::from(["markets.one_x_two.min_confidence".to_string()]),
            ..ConstraintsConfig::default()
        };
        let (out, summary) = apply_constraints(
            &[
                threshold(Market::OneXTwo, 0.62, 0.65),
                threshold(Market::GgNg, 0.62, 0.625),
            ],
            &cfg,
        );
        let frozen = out
            .iter()
            .find(|d| d.path == ParamPath::MarketMinConfidence(Market::OneXTwo))
            .expect("frozen diff kept");
        assert_eq!(frozen.old_value, frozen.new_value);
        assert_eq!(summary.frozen_count, 1);
        assert_eq!(summary.clamped_params_count, 0);
        assert_eq!(summary.top_deltas.len(), 1);
    }

    #[test]
    fn step_cap_clamps_both_directions() {
        let (out, summary) = apply_constraints(
            &[
                threshold(Market::OneXTwo, 0.62, 0.65),
                dampening("R1", 1.0, 0.8),
            ],
            &ConstraintsConfig::default(),
        );
        // Sorted by path: markets.* before reasons.*
        assert!((out[0].delta() - 0.01).abs() < 1e-9);
        assert!((out[1].delta() + 0.01).abs() < 1e-9);
        assert_eq!(summary.clamped_params_count, 2);
        assert!(summary.any_binding);
        assert!(!summary.total_cap_binding);
        assert!((summary.total_abs_delta_before - 0.23).abs() < 1e-9);
        assert!((summary.total_abs_delta_after - 0.02).abs() < 1e-9);
    }

    #[test]
    fn total_cap_scales_proportionally() {
        let diffs = vec![
            threshold(Market::OneXTwo, 0.62, 0.65),
            threshold(Market::OverUnder25, 0.62, 0.65),
            threshold(Market::GgNg, 0.62, 0.65),
            dampening("R1", 1.0, 0.8),
        ];
        let (out, summary) = apply_constraints(&diffs, &ConstraintsConfig::default());
        assert!(summary.total_cap_binding);
        assert!(summary.binding_budgets.is_empty());
        for d in &out {
            assert!((d.delta().abs() - 0.0075).abs() < 1e-9, "{}", d.path);
        }
        assert!((summary.total_abs_delta_after - 0.03).abs() < 1e-9);
    }

    #[test]
    fn scaled_total_never_exceeds_the_cap() {
        let diffs = vec![
            threshold(Market::OneXTwo, 0.62, 0.65),
            threshold(Market::OverUnder25, 0.61, 0.637),
            threshold(Market::GgNg, 0.633, 0.65),
            dampening("R1", 1.0, 0.8),
            dampening("R2", 0.7, 0.56),
        ];
        for k in 1..200 {
            let cap = k as f64 * 0.00037;
            let cfg = ConstraintsConfig {
                per_run_total_delta_max: cap,
                ..ConstraintsConfig::default()
            };
            let (out, bound) = total_cap_stage(diffs.clone(), &cfg);
            let total: f64 = out.iter().map(|d| d.delta().abs()).sum();
            assert!(bound, "cap {cap}");
            assert!(total <= cap, "cap {cap} total {total}");
            assert!(cap - total < 1e-12, "cap {cap} total {total}");
        }
    }

    #[test]
    fn output_is_independent_of_input_order() {
        let diffs = vec![
            dampening("zeta", 1.0, 0.8),
            threshold(Market::GgNg, 0.62, 0.65),
            dampening("alpha", 0.9, 0.72),
            threshold(Market::OneXTwo, 0.62, 0.64),
        ];
        let mut reversed = diffs.clone();
        reversed.reverse();
        let cfg = ConstraintsConfig::default();
        assert_eq!(apply_constraints(&diffs, &cfg), apply_constraints(&reversed, &cfg));
    }

    #[test]
    fn post_constraint_total_respects_smaller_cap() {
        let cfg = ConstraintsConfig {
            per_param_step_max: 0.1,
            per_run_total_delta_max: 0.03,
            per_group_budget: BTreeMap::from([(ParamGroup::Thresholds, 0.02)]),
            ..ConstraintsConfig::default()
        };
        let (out, summary) = apply_constraints(
            &[
                threshold(Market::OneXTwo, 0.62, 0.64),
                threshold(Market::GgNg, 0.62, 0.64),
            ],
            &cfg,
        );
        let total: f64 = out.iter().map(|d| d.delta().abs()).sum();
        assert!(total <= 0.02 + 1e-9);
        assert!(summary.total_cap_binding);
        assert_eq!(summary.binding_budgets, vec!["group:thresholds".to_string()]);
        // Relative intent preserved.
        assert!((out[0].delta() - out[1].delta()).abs() < 1e-12);
    }

    #[test]
    fn market_budget_binds_per_market() {
        let cfg = ConstraintsConfig {
            per_param_step_max: 0.1,
            per_run_total_delta_max: 1.0,
            per_market_budget: BTreeMap::from([(Market::OverUnder25, 0.01)]),
            per_group_budget: BTreeMap::new(),
            ..ConstraintsConfig::default()
        };
        let (out, summary) = apply_constraints(
            &[
                threshold(Market::OverUnder25, 0.60, 0.64),
                threshold(Market::OneXTwo, 0.60, 0.64),
            ],
            &cfg,
        );
        assert_eq!(summary.binding_budgets, vec!["market:over_under_25".to_string()]);
        let ou = out
            .iter()
            .find(|d| d.path.market() == Some(Market::OverUnder25))
            .expect("ou diff");
        assert!((ou.delta() - 0.01).abs() < 1e-9);
        let one = out
            .iter()
            .find(|d| d.path.market() == Some(Market::OneXTwo))
            .expect("1x2 diff");
        assert!((one.delta() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn top_deltas_are_capped_and_sorted() {
        let cfg = ConstraintsConfig {
            per_param_step_max: 1.0,
            per_run_total_delta_max: 10.0,
            per_market_budget: BTreeMap::new(),
            per_group_budget: BTreeMap::new(),
            ..ConstraintsConfig::default()
        };
        let diffs: Vec<_> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .enumerate()
            .map(|(i, code)| dampening(code, 1.0, 1.0 - 0.01 * (i as f64 % 3.0 + 1.0)))
            .collect();
        let (_, summary) = apply_constraints(&diffs, &cfg);
        assert_eq!(summary.top_deltas.len(), MAX_TOP_DELTAS);
        let paths: Vec<String> = summary.top_deltas.iter().map(|t| t.path.to_string()).collect();
        assert_eq!(paths[0], "reasons.c.dampening_factor");
        assert_eq!(paths[1], "reasons.f.dampening_factor");
        assert!(!summary.any_binding);
    }
}
