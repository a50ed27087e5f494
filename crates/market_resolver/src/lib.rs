use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use core_types::{
    DecisionRecord, FinalResult, Market, MatchStatus, Outcome, Pick, Prediction, ReasonCode,
};

/// Ground-truth pick for `market` given a final score.
pub fn ground_truth(market: Market, home_goals: u32, away_goals: u32) -> Pick {
    match market {
        Market::OneXTwo => {
            if home_goals > away_goals {
                Pick::Home
            } else if home_goals < away_goals {
                Pick::Away
            } else {
                Pick::Draw
            }
        }
        // 2 goals is UNDER, 3 is OVER; there is no push.
        Market::OverUnder25 => {
            if home_goals.saturating_add(away_goals) >= 3 {
                Pick::Over
            } else {
                Pick::Under
            }
        }
        Market::GgNg => {
            if home_goals >= 1 && away_goals >= 1 {
                Pick::Gg
            } else {
                Pick::Ng
            }
        }
    }
}

/// Resolves one market pick against the final result.
///
/// Matches that are not FINAL never count as evidence, and neither do the
/// NO_PREDICTION / NO_BET sentinels.
pub fn resolve_outcome(market: Market, pick: Pick, result: &FinalResult) -> Outcome {
    if result.status != MatchStatus::Final {
        return Outcome::Neutral;
    }
    if !pick.is_play() {
        return Outcome::Neutral;
    }
    if pick == ground_truth(market, result.home_goals, result.away_goals) {
        Outcome::Success
    } else {
        Outcome::Failure
    }
}

pub fn resolve_markets(
    picks: &BTreeMap<Market, Pick>,
    result: &FinalResult,
) -> BTreeMap<Market, Outcome> {
    picks
        .iter()
        .map(|(market, pick)| (*market, resolve_outcome(*market, *pick, result)))
        .collect()
}

/// Assembles a [`DecisionRecord`] from one run's predictions and the final
/// result. Markets without a prediction resolve as NEUTRAL (NO_PREDICTION).
pub fn build_decision_record(
    run_id: u64,
    created_at: DateTime<Utc>,
    match_id: &str,
    predictions: Vec<Prediction>,
    result: &FinalResult,
) -> DecisionRecord {
    let mut picks = BTreeMap::<Market, Pick>::new();
    let mut reason_codes_by_market = BTreeMap::<Market, Vec<ReasonCode>>::new();
    let mut seen = BTreeSet::<Market>::new();
    for p in &predictions {
        // First prediction per market wins, same as DecisionRecord::prediction.
        if !seen.insert(p.market) {
            continue;
        }
        picks.insert(p.market, p.pick);
        if !p.reasons.is_empty() {
            reason_codes_by_market.insert(p.market, p.reasons.clone());
        }
    }
    for market in Market::ALL {
        picks.entry(market).or_insert(Pick::NoPrediction);
    }

    DecisionRecord {
        run_id,
        created_at,
        match_id: match_id.to_string(),
        market_outcomes: resolve_markets(&picks, result),
        reason_codes_by_market,
        predictions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn final_score(home: u32, away: u32) -> FinalResult {
        FinalResult {
            home_goals: home,
            away_goals: away,
            status: MatchStatus::Final,
        }
    }

    #[test]
    fn over_under_boundary_has_no_push() {
        assert_eq!(
            resolve_outcome(Market::OverUnder25, Pick::Under, &final_score(1, 1)),
            Outcome::Success
        );
        assert_eq!(
            resolve_outcome(Market::OverUnder25, Pick::Over, &final_score(1, 1)),
            Outcome::Failure
        );
        assert_eq!(
            resolve_outcome(Market::OverUnder25, Pick::Over, &final_score(2, 1)),
            Outcome::Success
        );
        assert_eq!(ground_truth(Market::OverUnder25, 0, 3), Pick::Over);
    }

    #[test]
    fn one_x_two_and_btts_ground_truth() {
        assert_eq!(ground_truth(Market::OneXTwo, 2, 1), Pick::Home);
        assert_eq!(ground_truth(Market::OneXTwo, 0, 1), Pick::Away);
        assert_eq!(ground_truth(Market::OneXTwo, 1, 1), Pick::Draw);
        assert_eq!(ground_truth(Market::GgNg, 1, 1), Pick::Gg);
        assert_eq!(ground_truth(Market::GgNg, 3, 0), Pick::Ng);
    }

    #[test]
    fn non_final_status_is_neutral_for_every_pick() {
        let postponed = FinalResult {
            home_goals: 2,
            away_goals: 0,
            status: MatchStatus::Postponed,
        };
        assert_eq!(
            resolve_outcome(Market::OneXTwo, Pick::Home, &postponed),
            Outcome::Neutral
        );
        assert_eq!(
            resolve_outcome(Market::GgNg, Pick::Gg, &postponed),
            Outcome::Neutral
        );
    }

    #[test]
    fn sentinel_picks_are_neutral() {
        let r = final_score(2, 2);
        assert_eq!(
            resolve_outcome(Market::OneXTwo, Pick::NoBet, &r),
            Outcome::Neutral
        );
        assert_eq!(
            resolve_outcome(Market::GgNg, Pick::NoPrediction, &r),
            Outcome::Neutral
        );
    }

    #[test]
    fn mismatched_pick_for_market_is_failure() {
        assert_eq!(
            resolve_outcome(Market::OneXTwo, Pick::Over, &final_score(3, 0)),
            Outcome::Failure
        );
    }

    #[test]
    fn build_record_fills_outcomes_and_reasons() {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let rec = build_decision_record(
            11,
            created,
            "m-1",
            vec![
                Prediction {
                    market: Market::OneXTwo,
                    pick: Pick::Home,
                    confidence: 0.7,
                    reasons: vec!["home_form".into()],
                },
                Prediction {
                    market: Market::GgNg,
                    pick: Pick::Gg,
                    confidence: 0.6,
                    reasons: vec![],
                },
            ],
            &final_score(2, 0),
        );
        assert_eq!(rec.outcome(Market::OneXTwo), Outcome::Success);
        assert_eq!(rec.outcome(Market::GgNg), Outcome::Failure);
        assert_eq!(rec.outcome(Market::OverUnder25), Outcome::Neutral);
        assert_eq!(rec.reasons(Market::OneXTwo), &[ReasonCode::from("home_form")][..]);
        assert!(rec.reasons(Market::GgNg).is_empty());
    }
}
