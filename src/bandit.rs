use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::Serialize;

use crate::arms::ArmCatalog;

/// One posterior draw for one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ArmPullResult {
    pub name: String,
    pub cpm: f64,
    pub sample: f64,
}

/// A pull that could not be made because the candidate's belief parameters
/// are unusable (e.g. an observed rate of exactly 0 or 1).
#[derive(Debug, Clone, Serialize)]
pub struct SkippedPull {
    pub name: String,
    pub cpm: f64,
    pub reason: String,
}

/// Everything one selection round produced, winner included.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectionOutcome {
    pub pulls: Vec<ArmPullResult>,
    pub skipped: Vec<SkippedPull>,
    pub winner: Option<ArmPullResult>,
}

/// One draw from Beta(alpha, beta), or `None` when the parameters are not
/// strictly positive finite numbers. Invalid beliefs are surfaced to the
/// caller instead of being silently replaced by a default.
pub fn sample_conversion_rate(rng: &mut impl Rng, alpha: f64, beta: f64) -> Option<f64> {
    if !alpha.is_finite() || !beta.is_finite() || alpha <= 0.0 || beta <= 0.0 {
        return None;
    }
    Beta::new(alpha, beta).ok().map(|dist| dist.sample(rng))
}

/// Run one selection round over the catalog.
///
/// Every candidate is pulled once. Within a CPM group the first historical
/// candidate that produced a sample speaks for the group no matter what
/// anyone drew; without a historical one the first sampled candidate does.
/// Across groups the winner minimizes `cpm / sample` (expected spend per
/// order); an exact tie goes to the lower CPM. No groups, or no usable
/// pulls, means no recommendation.
pub fn select(catalog: &ArmCatalog, rng: &mut impl Rng) -> SelectionOutcome {
    let mut outcome = SelectionOutcome::default();
    let mut best: Option<(f64, ArmPullResult)> = None;

    for (key, group) in &catalog.groups {
        let mut group_pick: Option<(bool, ArmPullResult)> = None;
        for candidate in group {
            let (alpha, beta) = candidate.beta_params();
            match sample_conversion_rate(rng, alpha, beta) {
                Some(sample) => {
                    let pull = ArmPullResult {
                        name: candidate.name().to_string(),
                        cpm: candidate.cpm(),
                        sample,
                    };
                    let take = match &group_pick {
                        None => true,
                        Some((historical, _)) => !historical && candidate.is_historical(),
                    };
                    if take {
                        group_pick = Some((candidate.is_historical(), pull.clone()));
                    }
                    outcome.pulls.push(pull);
                }
                None => outcome.skipped.push(SkippedPull {
                    name: candidate.name().to_string(),
                    cpm: candidate.cpm(),
                    reason: format!("unusable belief (alpha {:.4}, beta {:.4})", alpha, beta),
                }),
            }
        }

        let Some((_, pull)) = group_pick else { continue };
        // Beta samples live in the open interval (0, 1), so the division
        // is always finite.
        let objective = key.as_cpm() / pull.sample;
        let better = match &best {
            None => true,
            Some((best_objective, best_pull)) => {
                objective < *best_objective
                    || (objective == *best_objective && pull.cpm < best_pull.cpm)
            }
        };
        if better {
            best = Some((objective, pull));
        }
    }

    outcome.winner = best.map(|(_, pull)| pull);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arms::BidCandidate;
    use crate::campaigns::CpmKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn derived(name: &str, cpm: f64, rate: f64, views: f64) -> BidCandidate {
        BidCandidate::MarginDerived {
            name: name.to_string(),
            cpm,
            conversion_rate: rate,
            views,
            info: String::new(),
        }
    }

    fn catalog(candidates: Vec<BidCandidate>) -> ArmCatalog {
        let mut groups: BTreeMap<CpmKey, Vec<BidCandidate>> = BTreeMap::new();
        for c in candidates {
            groups.entry(CpmKey::from_cpm(c.cpm())).or_default().push(c);
        }
        ArmCatalog { groups }
    }

    #[test]
    fn test_sampler_rejects_nonpositive_parameters() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(sample_conversion_rate(&mut rng, 0.0, 10.0).is_none());
        assert!(sample_conversion_rate(&mut rng, 10.0, 0.0).is_none());
        assert!(sample_conversion_rate(&mut rng, -1.0, 1.0).is_none());
        assert!(sample_conversion_rate(&mut rng, f64::NAN, 1.0).is_none());
        let sample = sample_conversion_rate(&mut rng, 5.0, 95.0).unwrap();
        assert!(sample > 0.0 && sample < 1.0);
    }

    #[test]
    fn test_empty_catalog_yields_no_winner() {
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = select(&catalog(vec![]), &mut rng);
        assert!(outcome.winner.is_none());
        assert!(outcome.pulls.is_empty());
    }

    #[test]
    fn test_historical_speaks_for_its_group() {
        // The non-historical candidate has a belief that samples near 0.9,
        // the historical one near 0.01. Whatever either draws, the group's
        // contribution must be the historical pull.
        let historical =
            BidCandidate::historical("historical", 20.0, 0.01, 1000.0, String::new()).unwrap();
        let cat = catalog(vec![derived("greedy", 20.0, 0.9, 10000.0), historical]);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let outcome = select(&cat, &mut rng);
            assert_eq!(outcome.pulls.len(), 2);
            assert_eq!(outcome.winner.as_ref().unwrap().name, "historical");
        }
    }

    #[test]
    fn test_winner_minimizes_cpm_over_sample() {
        // Identical tight beliefs at two CPMs: the cheaper bid must win,
        // because its expected spend per order is strictly lower.
        let cat = catalog(vec![
            derived("cheap", 10.0, 0.05, 100000.0),
            derived("dear", 200.0, 0.05, 100000.0),
        ]);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let outcome = select(&cat, &mut rng);
            assert_eq!(outcome.winner.as_ref().unwrap().name, "cheap");
        }
    }

    #[test]
    fn test_zero_cpm_group_always_wins() {
        // A free bid has objective 0, unbeatable by any positive CPM.
        let cat = catalog(vec![
            derived("free", 0.0, 0.01, 1000.0),
            derived("paid", 10.0, 0.99, 1000.0),
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = select(&cat, &mut rng);
        assert_eq!(outcome.winner.as_ref().unwrap().name, "free");
    }

    #[test]
    fn test_unusable_beliefs_are_skipped_not_defaulted() {
        // rate 0 gives alpha 0, rate 1 gives beta 0; both pulls are skipped
        // and with nothing left there is no recommendation.
        let cat = catalog(vec![
            derived("dead", 10.0, 0.0, 1000.0),
            derived("sure", 20.0, 1.0, 1000.0),
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = select(&cat, &mut rng);
        assert!(outcome.winner.is_none());
        assert!(outcome.pulls.is_empty());
        assert_eq!(outcome.skipped.len(), 2);
    }

    #[test]
    fn test_group_survives_a_skipped_sibling() {
        let cat = catalog(vec![
            derived("dead", 10.0, 0.0, 1000.0),
            derived("alive", 10.0, 0.05, 1000.0),
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = select(&cat, &mut rng);
        assert_eq!(outcome.winner.as_ref().unwrap().name, "alive");
        assert_eq!(outcome.skipped.len(), 1);
    }
}
