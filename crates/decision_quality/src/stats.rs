use std::cmp::Ordering;

/// Percentile with linear interpolation between closest ranks.
pub fn percentile_linear(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let rank = (v.len() as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(v.len() - 1);
    Some(v[lo] + (rank - lo as f64) * (v[hi] - v[lo]))
}

pub fn ratio_u64(num: u64, denom: u64) -> Option<f64> {
    if denom == 0 {
        None
    } else {
        Some(num as f64 / denom as f64)
    }
}

/// `0.5^(age / half_life)`; a non-positive half-life disables decay.
pub fn decay_weight(age_in_runs: usize, half_life_runs: f64) -> f64 {
    if half_life_runs <= 0.0 || !half_life_runs.is_finite() {
        return 1.0;
    }
    0.5f64.powf(age_in_runs as f64 / half_life_runs)
}
