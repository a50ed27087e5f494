use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use audit_engine::AuditConfig;
use decision_quality::EvaluatorConfig;
use replay_engine::ReplayThresholds;
use serde::{Deserialize, Serialize};
use shadow_tuner::TunerConfig;
use tuner_constraints::ConstraintsConfig;

pub const CONFIG_PATH_ENV: &str = "POLICY_LOOP_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "configs/policy_loop.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Decimal places kept for every float in stable artifacts.
    pub float_precision: u32,
    pub reports_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            float_precision: 4,
            reports_dir: PathBuf::from("reports/policy_loop"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub evaluator: EvaluatorConfig,
    pub tuner: TunerConfig,
    pub constraints: ConstraintsConfig,
    pub replay: ReplayThresholds,
    pub audit: AuditConfig,
    pub output: OutputConfig,
}

impl LoopConfig {
    pub fn sanitized(self) -> Self {
        Self {
            evaluator: self.evaluator.sanitized(),
            tuner: self.tuner.sanitized(),
            constraints: self.constraints.sanitized(),
            replay: self.replay.sanitized(),
            audit: self.audit,
            output: OutputConfig {
                float_precision: self.output.float_precision.min(12),
                reports_dir: self.output.reports_dir,
            },
        }
    }

    /// True when a tuner drift band edge falls inside a calibration band.
    /// The bump rule then reads whole bands that reach past the drift band.
    pub fn drift_band_misaligned(&self) -> bool {
        let width = self.evaluator.band_width;
        [self.tuner.drift_band_lower, self.tuner.drift_band_upper]
            .iter()
            .any(|edge| {
                let steps = edge / width;
                (steps - steps.round()).abs() > 1e-6
            })
    }
}

pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads `path`, or the env/default path when `None`. A missing file means
/// defaults; a file that does not parse is an error.
pub fn load_config(path: Option<&Path>) -> Result<LoopConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(LoopConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read config {}", path.display()));
        }
    };
    parse_config(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<LoopConfig> {
    let cfg: LoopConfig = toml::from_str(raw)?;
    let sanitized = cfg.clone().sanitized();
    if sanitized != cfg {
        tracing::warn!("config values out of range were clamped");
    }
    if sanitized.drift_band_misaligned() {
        tracing::warn!(
            band_width = sanitized.evaluator.band_width,
            drift_band_lower = sanitized.tuner.drift_band_lower,
            drift_band_upper = sanitized.tuner.drift_band_upper,
            "drift band edges are not calibration band edges, straddling bands count whole"
        );
    }
    Ok(sanitized)
}
