use std::collections::BTreeMap;

use core_types::{
    clamp_unit, CoreError, DecisionModel, Market, MarketDecision, Pick, Policy, ReasonCode,
    Snapshot,
};
use serde::{Deserialize, Serialize};

/// Decision recorded in a snapshot before any policy gate ran.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedDecision {
    pub pick: Pick,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasons: Vec<ReasonCode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GateEvidence {
    #[serde(default)]
    pub markets: BTreeMap<Market, RecordedDecision>,
}

/// Reference decision model: re-applies the policy gate to recorded
/// decisions. Effective confidence is the recorded confidence scaled by the
/// strongest dampening among the decision's reasons.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateModel;

impl GateModel {
    fn gate(market: Market, recorded: &RecordedDecision, policy: &Policy) -> MarketDecision {
        let dampening = recorded
            .reasons
            .iter()
            .map(|r| policy.dampening_for(r))
            .fold(1.0_f64, f64::min);
        let effective = recorded.confidence.map(|c| clamp_unit(c) * clamp_unit(dampening));

        let pick = match (recorded.pick.is_play(), effective) {
            (true, Some(c)) if c >= policy.min_confidence_for(market) => recorded.pick,
            (true, _) => Pick::NoBet,
            (false, _) => recorded.pick,
        };

        MarketDecision {
            market,
            pick,
            confidence: effective,
            reasons: recorded.reasons.clone(),
        }
    }
}

impl DecisionModel for GateModel {
    fn decide(&self, snapshot: &Snapshot, policy: &Policy) -> Result<Vec<MarketDecision>, CoreError> {
        if snapshot.evidence.is_null() {
            return Err(CoreError::Model(format!(
                "snapshot {} has no evidence",
                snapshot.snapshot_id
            )));
        }
        let evidence: GateEvidence = serde_json::from_value(snapshot.evidence.clone())
            .map_err(|e| CoreError::Model(format!("snapshot {}: {e}", snapshot.snapshot_id)))?;
        Ok(evidence
            .markets
            .iter()
            .map(|(market, recorded)| Self::gate(*market, recorded, policy))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ReasonPolicy;
    use serde_json::json;

    #[test]
    fn dampening_can_push_a_pick_below_the_gate() {
        let mut policy = Policy::default_policy();
        policy
            .reasons
            .insert("streak".into(), ReasonPolicy { dampening_factor: 0.8 });
        let snapshot = Snapshot {
            snapshot_id: "s".to_string(),
            evidence: json!({"markets": {"GGNG": {"pick": "GG", "confidence": 0.7, "reasons": ["streak", "other"]}}}),
        };
        let out = GateModel.decide(&snapshot, &policy).expect("decide");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].market, Market::GgNg);
        assert_eq!(out[0].pick, Pick::NoBet);
        assert!((out[0].confidence.expect("confidence") - 0.56).abs() < 1e-9);
    }

    #[test]
    fn play_without_confidence_is_gated() {
        let snapshot = Snapshot {
            snapshot_id: "s".to_string(),
            evidence: json!({"markets": {"one_x_two": {"pick": "DRAW"}}}),
        };
        let out = GateModel
            .decide(&snapshot, &Policy::default_policy())
            .expect("decide");
        assert_eq!(out[0].pick, Pick::NoBet);
        assert_eq!(out[0].confidence, None);
    }

    #[test]
    fn unreadable_evidence_is_a_model_error() {
        let snapshot = Snapshot {
            snapshot_id: "bad".to_string(),
            evidence: json!({"markets": {"one_x_two": {"pick": "MAYBE"}}}),
        };
        assert!(matches!(
            GateModel.decide(&snapshot, &Policy::default_policy()),
            Err(CoreError::Model(_))
        ));
    }
}
