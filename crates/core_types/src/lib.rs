use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// Opaque identifier attached to a market decision explaining why it was made.
pub type ReasonCode = SmolStr;

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.62;
pub const DEFAULT_DAMPENING_FACTOR: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Market {
    #[serde(rename = "one_x_two", alias = "1X2")]
    OneXTwo,
    #[serde(rename = "over_under_25", alias = "OU_2.5", alias = "OU25")]
    OverUnder25,
    #[serde(rename = "gg_ng", alias = "BTTS", alias = "GGNG")]
    GgNg,
}

impl Market {
    pub const ALL: [Market; 3] = [Market::OneXTwo, Market::OverUnder25, Market::GgNg];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneXTwo => "one_x_two",
            Self::OverUnder25 => "over_under_25",
            Self::GgNg => "gg_ng",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "one_x_two" | "1X2" | "1x2" => Ok(Self::OneXTwo),
            "over_under_25" | "OU_2.5" | "OU25" | "ou25" => Ok(Self::OverUnder25),
            "gg_ng" | "BTTS" | "GGNG" | "btts" => Ok(Self::GgNg),
            other => Err(CoreError::UnknownMarket(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pick {
    Home,
    Draw,
    Away,
    Over,
    Under,
    Gg,
    Ng,
    NoPrediction,
    NoBet,
}

impl Pick {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "HOME",
            Self::Draw => "DRAW",
            Self::Away => "AWAY",
            Self::Over => "OVER",
            Self::Under => "UNDER",
            Self::Gg => "GG",
            Self::Ng => "NG",
            Self::NoPrediction => "NO_PREDICTION",
            Self::NoBet => "NO_BET",
        }
    }

    /// A "play" pick is an actionable selection; the two sentinels are not.
    pub fn is_play(&self) -> bool {
        !matches!(self, Self::NoPrediction | Self::NoBet)
    }
}

impl fmt::Display for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pick {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HOME" => Ok(Self::Home),
            "DRAW" => Ok(Self::Draw),
            "AWAY" => Ok(Self::Away),
            "OVER" => Ok(Self::Over),
            "UNDER" => Ok(Self::Under),
            "GG" => Ok(Self::Gg),
            "NG" => Ok(Self::Ng),
            "NO_PREDICTION" => Ok(Self::NoPrediction),
            "NO_BET" => Ok(Self::NoBet),
            other => Err(CoreError::UnknownPick(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
    Unresolved,
}

impl Outcome {
    /// Only SUCCESS and FAILURE count as evidence.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Neutral => "NEUTRAL",
            Self::Unresolved => "UNRESOLVED",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Final,
    Abandoned,
    Postponed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalResult {
    pub home_goals: u32,
    pub away_goals: u32,
    pub status: MatchStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub market: Market,
    pub pick: Pick,
    /// Confidence in [0,1] as emitted by the prediction engine.
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<ReasonCode>,
}

impl Prediction {
    pub fn clamped_confidence(&self) -> f64 {
        clamp_unit(self.confidence)
    }
}

/// One resolved analysis run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub run_id: u64,
    #[serde(alias = "created_at_utc")]
    pub created_at: DateTime<Utc>,
    pub match_id: String,
    #[serde(default)]
    pub market_outcomes: BTreeMap<Market, Outcome>,
    #[serde(default)]
    pub reason_codes_by_market: BTreeMap<Market, Vec<ReasonCode>>,
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

impl DecisionRecord {
    /// Missing outcomes read as UNRESOLVED.
    pub fn outcome(&self, market: Market) -> Outcome {
        self.market_outcomes
            .get(&market)
            .copied()
            .unwrap_or(Outcome::Unresolved)
    }

    pub fn reasons(&self, market: Market) -> &[ReasonCode] {
        self.reason_codes_by_market
            .get(&market)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First prediction recorded for `market`, if any.
    pub fn prediction(&self, market: Market) -> Option<&Prediction> {
        self.predictions.iter().find(|p| p.market == market)
    }

    pub fn validate(&self) -> std::result::Result<(), CoreError> {
        if self.match_id.trim().is_empty() {
            return Err(CoreError::MalformedRecord {
                run_id: self.run_id,
                reason: "empty match_id".to_string(),
            });
        }
        if let Some(p) = self.predictions.iter().find(|p| !p.confidence.is_finite()) {
            return Err(CoreError::MalformedRecord {
                run_id: self.run_id,
                reason: format!("non-finite confidence for {}", p.market),
            });
        }
        Ok(())
    }

    /// Window ordering key: `created_at`, ties broken by `run_id`.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.run_id)
    }
}

/// A materialized window handed to the core by a record loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordWindow {
    pub records: Vec<DecisionRecord>,
    /// Entries the loader could not decode.
    pub malformed: usize,
}

impl RecordWindow {
    /// Records every consumer of the window works on; see [`prepare_records`].
    pub fn prepared(&self) -> (Vec<&DecisionRecord>, usize) {
        prepare_records(&self.records)
    }
}

/// Drops records that fail validation or repeat an earlier `run_id`, then
/// sorts the rest by [`DecisionRecord::order_key`]. Returns the kept records
/// and the number rejected.
pub fn prepare_records(records: &[DecisionRecord]) -> (Vec<&DecisionRecord>, usize) {
    let mut seen = BTreeSet::<u64>::new();
    let mut rejected = 0usize;
    let mut kept = Vec::with_capacity(records.len());
    for rec in records {
        if rec.validate().is_err() || !seen.insert(rec.run_id) {
            rejected += 1;
            continue;
        }
        kept.push(rec);
    }
    kept.sort_by_key(|r| r.order_key());
    (kept, rejected)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyVersion {
    pub version: String,
    #[serde(default)]
    pub created_at_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketPolicy {
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasonPolicy {
    pub dampening_factor: f64,
}

impl Default for ReasonPolicy {
    fn default() -> Self {
        Self {
            dampening_factor: DEFAULT_DAMPENING_FACTOR,
        }
    }
}

/// Versioned decision policy. Never mutated in place: tuning produces a sibling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub meta: PolicyVersion,
    pub markets: BTreeMap<Market, MarketPolicy>,
    #[serde(default)]
    pub reasons: BTreeMap<ReasonCode, ReasonPolicy>,
}

impl Policy {
    pub fn default_policy() -> Self {
        Self {
            meta: PolicyVersion {
                version: "v0".to_string(),
                created_at_utc: None,
                notes: Some("default in-code policy".to_string()),
            },
            markets: Market::ALL
                .iter()
                .map(|m| {
                    (
                        *m,
                        MarketPolicy {
                            min_confidence: DEFAULT_MIN_CONFIDENCE,
                        },
                    )
                })
                .collect(),
            reasons: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), CoreError> {
        if self.meta.version.trim().is_empty() {
            return Err(CoreError::InvalidPolicy("empty version".to_string()));
        }
        for (market, mp) in &self.markets {
            if !is_unit(mp.min_confidence) {
                return Err(CoreError::InvalidPolicy(format!(
                    "markets.{market}.min_confidence {} outside [0,1]",
                    mp.min_confidence
                )));
            }
        }
        for (code, rp) in &self.reasons {
            if code.is_empty() {
                return Err(CoreError::InvalidPolicy("empty reason code".to_string()));
            }
            if !is_unit(rp.dampening_factor) {
                return Err(CoreError::InvalidPolicy(format!(
                    "reasons.{code}.dampening_factor {} outside [0,1]",
                    rp.dampening_factor
                )));
            }
        }
        Ok(())
    }

    pub fn min_confidence_for(&self, market: Market) -> f64 {
        self.markets
            .get(&market)
            .map(|m| m.min_confidence)
            .unwrap_or(DEFAULT_MIN_CONFIDENCE)
    }

    pub fn dampening_for(&self, reason: &str) -> f64 {
        self.reasons
            .get(reason)
            .map(|r| r.dampening_factor)
            .unwrap_or(DEFAULT_DAMPENING_FACTOR)
    }

    pub fn min_confidence_map(&self) -> BTreeMap<Market, f64> {
        self.markets
            .iter()
            .map(|(m, mp)| (*m, mp.min_confidence))
            .collect()
    }

    /// Current value at `path`, using the same fallbacks as the accessors.
    pub fn value_at(&self, path: &ParamPath) -> f64 {
        match path {
            ParamPath::MarketMinConfidence(m) => self.min_confidence_for(*m),
            ParamPath::ReasonDampening(code) => self.dampening_for(code),
        }
    }

    /// Builds the sibling policy produced by applying `diffs` on top of `self`.
    pub fn apply_diffs(
        &self,
        diffs: &[PolicyDiff],
        meta: PolicyVersion,
    ) -> std::result::Result<Policy, CoreError> {
        let mut next = Policy {
            meta,
            markets: self.markets.clone(),
            reasons: self.reasons.clone(),
        };
        for diff in diffs {
            let value = clamp_unit(diff.new_value);
            match &diff.path {
                ParamPath::MarketMinConfidence(m) => {
                    next.markets.insert(
                        *m,
                        MarketPolicy {
                            min_confidence: value,
                        },
                    );
                }
                ParamPath::ReasonDampening(code) => {
                    next.reasons.insert(
                        code.clone(),
                        ReasonPolicy {
                            dampening_factor: value,
                        },
                    );
                }
            }
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    Thresholds,
    Dampening,
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Thresholds => "thresholds",
            Self::Dampening => "dampening",
        };
        f.write_str(value)
    }
}

/// Dotted address into a [`Policy`], e.g. `markets.one_x_two.min_confidence`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParamPath {
    MarketMinConfidence(Market),
    ReasonDampening(ReasonCode),
}

impl ParamPath {
    pub fn group(&self) -> ParamGroup {
        match self {
            Self::MarketMinConfidence(_) => ParamGroup::Thresholds,
            Self::ReasonDampening(_) => ParamGroup::Dampening,
        }
    }

    pub fn market(&self) -> Option<Market> {
        match self {
            Self::MarketMinConfidence(m) => Some(*m),
            Self::ReasonDampening(_) => None,
        }
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarketMinConfidence(m) => write!(f, "markets.{m}.min_confidence"),
            Self::ReasonDampening(code) => write!(f, "reasons.{code}.dampening_factor"),
        }
    }
}

impl FromStr for ParamPath {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.trim();
        if let Some(market) = raw
            .strip_prefix("markets.")
            .and_then(|rest| rest.strip_suffix(".min_confidence"))
        {
            let market = market
                .parse::<Market>()
                .map_err(|_| CoreError::InvalidParamPath(raw.to_string()))?;
            return Ok(Self::MarketMinConfidence(market));
        }
        if let Some(code) = raw
            .strip_prefix("reasons.")
            .and_then(|rest| rest.strip_suffix(".dampening_factor"))
        {
            if !code.is_empty() {
                return Ok(Self::ReasonDampening(ReasonCode::new(code)));
            }
        }
        Err(CoreError::InvalidParamPath(raw.to_string()))
    }
}

impl TryFrom<String> for ParamPath {
    type Error = CoreError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParamPath> for String {
    fn from(value: ParamPath) -> Self {
        value.to_string()
    }
}

// Paths order by their dotted form so constraint processing is stable.
impl PartialOrd for ParamPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParamPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDiff {
    pub path: ParamPath,
    pub old_value: f64,
    pub new_value: f64,
    pub rationale: String,
}

impl PolicyDiff {
    pub fn delta(&self) -> f64 {
        self.new_value - self.old_value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationSummary {
    pub run_count: usize,
    pub malformed_records: usize,
    pub half_life_runs: f64,
    pub first_run_id: Option<u64>,
    pub last_run_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationBucket {
    pub band: String,
    pub lower: f64,
    pub upper: f64,
    /// Band midpoint.
    pub predicted_confidence: f64,
    /// Observed mean confidence of resolved predictions in the band.
    pub mean_confidence: Option<f64>,
    pub empirical_accuracy: Option<f64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub neutral_count: u64,
    /// Resolved (non-neutral) predictions only.
    pub count: u64,
}

impl CalibrationBucket {
    pub fn failure_rate(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.failure_count as f64 / self.count as f64)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketAccuracy {
    pub success_count: u64,
    pub failure_count: u64,
    pub neutral_count: u64,
    pub accuracy: Option<f64>,
    pub calibration: Vec<CalibrationBucket>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasonMarketStats {
    pub success: u64,
    pub failure: u64,
    pub neutral: u64,
    pub success_rate: Option<f64>,
}

impl ReasonMarketStats {
    pub fn resolved(&self) -> u64 {
        self.success + self.failure
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasonEffectiveness {
    pub win_count: u64,
    pub loss_count: u64,
    pub neutral_count: u64,
    pub weighted_win: f64,
    pub weighted_loss: f64,
    /// `weighted_win - weighted_loss`, recent runs weighing more.
    pub decayed_contribution: f64,
    pub by_market: BTreeMap<Market, ReasonMarketStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasonChurn {
    pub run_pairs: usize,
    pub appearance_count: u64,
    pub disappearance_count: u64,
    pub total_transitions: u64,
    pub appearance_rate: f64,
    pub disappearance_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Stability {
    pub pick_flip_count: u64,
    pub pick_flip_pairs: u64,
    pub pick_flip_rate: f64,
    pub confidence_volatility_p95: f64,
    pub confidence_delta_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DampeningCandidate {
    pub reason_code: ReasonCode,
    pub decayed_contribution: f64,
    pub win_count: u64,
    pub loss_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationDeviation {
    pub market: Market,
    pub band: String,
    pub predicted_confidence: f64,
    pub empirical_accuracy: f64,
    pub deviation: f64,
    pub count: u64,
}

/// Report-only hints; nothing downstream applies them automatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Suggestions {
    pub dampening_candidates: Vec<DampeningCandidate>,
    pub calibration_deviations: Vec<CalibrationDeviation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub summary: EvaluationSummary,
    pub per_market: BTreeMap<Market, MarketAccuracy>,
    pub reason_effectiveness: BTreeMap<ReasonCode, ReasonEffectiveness>,
    pub reason_churn: ReasonChurn,
    pub stability: Stability,
    pub suggestions: Suggestions,
}

impl EvaluationReport {
    /// Every reason code seen in the window, sorted.
    pub fn reason_codes(&self) -> BTreeSet<ReasonCode> {
        self.reason_effectiveness.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplayMarketStats {
    pub slots: usize,
    pub baseline_covered: usize,
    pub proposed_covered: usize,
    pub baseline_threshold: f64,
    pub proposed_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayVerdict {
    pub blocked: bool,
    pub reasons: Vec<String>,
    pub baseline_coverage_pct: f64,
    pub proposed_coverage_pct: f64,
    pub coverage_drop: f64,
    pub baseline_accuracy: Option<f64>,
    pub proposed_accuracy: Option<f64>,
    pub accuracy_drop: Option<f64>,
    pub total_market_slots: usize,
    pub per_market: BTreeMap<Market, ReplayMarketStats>,
}

/// Historical evidence the external decision model re-derives decisions from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: String,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketDecision {
    pub market: Market,
    pub pick: Pick,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasons: Vec<ReasonCode>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("malformed record {run_id}: {reason}")]
    MalformedRecord { run_id: u64, reason: String },
    #[error("invalid parameter path: {0}")]
    InvalidParamPath(String),
    #[error("unknown market: {0}")]
    UnknownMarket(String),
    #[error("unknown pick: {0}")]
    UnknownPick(String),
    #[error("decision model failed: {0}")]
    Model(String),
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn load_window(&self) -> Result<RecordWindow>;
}

pub trait PolicySource: Send + Sync {
    fn current_policy(&self) -> Result<Policy>;
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn load_snapshots(&self) -> Result<Vec<Snapshot>>;
}

/// The prediction engine, seen from the audit as a pure function of
/// (evidence, policy).
pub trait DecisionModel: Send + Sync {
    fn decide(
        &self,
        snapshot: &Snapshot,
        policy: &Policy,
    ) -> std::result::Result<Vec<MarketDecision>, CoreError>;
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn is_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}
