//! C9 — Reward Calculator.
//!
//! Grounded on `original_source/src/core/reward_calculator.py`'s four
//! distribution strategies and its self-validation step (the payout sum
//! must never exceed the pool, and must land within a 1% tolerance of it).

use std::collections::HashMap;

use crate::config::RewardStrategyKind;
use crate::contribution::ContributionRecord;
use crate::error::{CoordinatorError, Result};
use crate::model::WorkerId;

const VALIDATION_TOLERANCE: f64 = 0.01;
const TIER1_FRACTION: f64 = 0.50;
const TIER2_FRACTION: f64 = 0.80;
const TIER1_BONUS_SHARE: f64 = 0.15;
const TIER2_BONUS_SHARE: f64 = 0.05;
const TIERED_BASE_SHARE: f64 = 0.85;
const TIERED_BONUS_SHARE: f64 = 0.15;

/// Default minimum floor as a fraction of the equal per-worker share,
/// matching the source's `calculate_with_minimum(..., min_percentage=0.5)`
/// default.
const PERFORMANCE_MINIMUM_FRACTION: f64 = 0.5;

const HYBRID_PROPORTIONAL_SHARE: f64 = 0.70;
const HYBRID_QUALITY_SHARE: f64 = 0.20;
const HYBRID_RELIABILITY_SHARE: f64 = 0.10;

pub struct RewardCalculator {
    strategy: RewardStrategyKind,
}

#[derive(Debug, Clone)]
pub struct RewardDistribution {
    pub payouts: HashMap<WorkerId, i64>,
    pub percentages: HashMap<WorkerId, f64>,
    pub total_pool: i64,
    pub total_paid: i64,
    pub min_reward: i64,
    pub max_reward: i64,
    pub mean_reward: f64,
}

impl RewardDistribution {
    /// Invariant 6 (spec.md §8): `Σ total ≤ pool` and the shortfall is at
    /// most 1% of the pool.
    pub fn is_valid(&self) -> bool {
        if self.total_paid > self.total_pool {
            return false;
        }
        if self.total_pool == 0 {
            return true;
        }
        let shortfall = (self.total_pool - self.total_paid) as f64 / self.total_pool as f64;
        shortfall <= VALIDATION_TOLERANCE
    }
}

impl RewardCalculator {
    pub fn new(strategy: RewardStrategyKind) -> Self {
        Self { strategy }
    }

    /// Distribute `pool` (integer minor units) across `contributors`
    /// according to the configured strategy. Fails if the computed payout
    /// sum doesn't self-validate (spec.md §4.9).
    pub fn distribute(&self, pool: i64, contributors: &[ContributionRecord]) -> Result<RewardDistribution> {
        if contributors.is_empty() {
            return Ok(RewardDistribution {
                payouts: HashMap::new(),
                percentages: HashMap::new(),
                total_pool: pool,
                total_paid: 0,
                min_reward: 0,
                max_reward: 0,
                mean_reward: 0.0,
            });
        }

        let total_contribution: i64 = contributors.iter().map(|c| c.final_score.max(0)).sum();
        let payouts = if total_contribution <= 0 {
            Self::equal_split(pool, contributors)
        } else {
            match self.strategy {
                RewardStrategyKind::Proportional => {
                    Self::proportional(pool, contributors, total_contribution)
                }
                RewardStrategyKind::Tiered => Self::tiered(pool, contributors, total_contribution),
                RewardStrategyKind::Performance => {
                    Self::performance_with_minimum(pool, contributors, total_contribution)
                }
                RewardStrategyKind::Hybrid => Self::hybrid(pool, contributors, total_contribution),
            }
        };

        let total_paid: i64 = payouts.values().sum();
        let percentages: HashMap<WorkerId, f64> = contributors
            .iter()
            .map(|c| {
                let pct = if total_contribution > 0 {
                    c.final_score.max(0) as f64 / total_contribution as f64 * 100.0
                } else {
                    100.0 / contributors.len() as f64
                };
                (c.worker.clone(), pct)
            })
            .collect();
        let amounts: Vec<i64> = payouts.values().copied().collect();
        let min_reward = amounts.iter().copied().min().unwrap_or(0);
        let max_reward = amounts.iter().copied().max().unwrap_or(0);
        let mean_reward = amounts.iter().sum::<i64>() as f64 / amounts.len() as f64;

        let distribution = RewardDistribution {
            payouts,
            percentages,
            total_pool: pool,
            total_paid,
            min_reward,
            max_reward,
            mean_reward,
        };
        if !distribution.is_valid() {
            return Err(CoordinatorError::Invariant(format!(
                "reward distribution {total_paid} invalid against pool {pool}"
            )));
        }
        Ok(distribution)
    }

    fn equal_split(pool: i64, contributors: &[ContributionRecord]) -> HashMap<WorkerId, i64> {
        let share = pool / contributors.len() as i64;
        contributors.iter().map(|c| (c.worker.clone(), share)).collect()
    }

    /// `share_i = ⌊pool · final_i / Σ final⌋`; the remainder left by integer
    /// truncation is not redistributed (absorbed by the validation
    /// tolerance), matching the source's `calculate_proportional`.
    fn proportional(
        pool: i64,
        contributors: &[ContributionRecord],
        total_contribution: i64,
    ) -> HashMap<WorkerId, i64> {
        contributors
            .iter()
            .map(|c| {
                let amount = (pool as i128 * c.final_score.max(0) as i128 / total_contribution as i128) as i64;
                (c.worker.clone(), amount)
            })
            .collect()
    }

    /// 85% proportional base pool; the remaining 15% bonus pool goes only
    /// to the top 50% (15% bonus weight) and next 30% (5% bonus weight),
    /// weighted within each tier by `final_score` against the *overall*
    /// total (matching the source's tier bonus formula exactly).
    fn tiered(
        pool: i64,
        contributors: &[ContributionRecord],
        total_contribution: i64,
    ) -> HashMap<WorkerId, i64> {
        let mut sorted: Vec<&ContributionRecord> = contributors.iter().collect();
        sorted.sort_by(|a, b| b.final_score.cmp(&a.final_score));

        let base_pool = (pool as f64 * TIERED_BASE_SHARE) as i64;
        let bonus_pool = pool - base_pool;
        debug_assert!((TIERED_BASE_SHARE + TIERED_BONUS_SHARE - 1.0).abs() < 1e-9);

        let node_count = sorted.len();
        let tier1_cutoff = (node_count as f64 * TIER1_FRACTION) as usize;
        let tier2_cutoff = (node_count as f64 * TIER2_FRACTION) as usize;

        let mut payouts = HashMap::new();
        for (idx, c) in sorted.iter().enumerate() {
            let base_reward =
                (base_pool as i128 * c.final_score.max(0) as i128 / total_contribution as i128) as i64;
            let bonus_share = if idx < tier1_cutoff {
                TIER1_BONUS_SHARE
            } else if idx < tier2_cutoff {
                TIER2_BONUS_SHARE
            } else {
                0.0
            };
            let bonus_reward = if bonus_share > 0.0 {
                (bonus_pool as f64 * c.final_score.max(0) as f64 * bonus_share / total_contribution as f64)
                    as i64
            } else {
                0
            };
            payouts.insert(c.worker.clone(), base_reward + bonus_reward);
        }
        payouts
    }

    /// First compute proportional shares; any worker below
    /// `⌊avg·min_percentage⌋` is lifted to that floor; the lift is paid by
    /// an equal deduction from the above-minimum workers.
    fn performance_with_minimum(
        pool: i64,
        contributors: &[ContributionRecord],
        total_contribution: i64,
    ) -> HashMap<WorkerId, i64> {
        let node_count = contributors.len() as i64;
        let avg_reward = pool as f64 / node_count as f64;
        let min_reward = (avg_reward * PERFORMANCE_MINIMUM_FRACTION) as i64;

        let proportional: HashMap<WorkerId, i64> = contributors
            .iter()
            .map(|c| {
                let amount = (pool as i128 * c.final_score.max(0) as i128 / total_contribution as i128) as i64;
                (c.worker.clone(), amount)
            })
            .collect();

        let below_min: Vec<&WorkerId> = contributors
            .iter()
            .map(|c| &c.worker)
            .filter(|w| proportional[*w] < min_reward)
            .collect();

        if below_min.is_empty() {
            return proportional;
        }

        let below_min_total: i64 = below_min.iter().map(|w| min_reward - proportional[*w]).sum();
        let above_min: Vec<&WorkerId> = contributors
            .iter()
            .map(|c| &c.worker)
            .filter(|w| !below_min.contains(w))
            .collect();

        let mut payouts = HashMap::new();
        if above_min.is_empty() {
            let equal = pool / node_count;
            for c in contributors {
                payouts.insert(c.worker.clone(), equal);
            }
            return payouts;
        }

        let reduction_per_node = below_min_total as f64 / above_min.len() as f64;
        for c in contributors {
            let amount = if below_min.contains(&&c.worker) {
                min_reward
            } else {
                (proportional[&c.worker] as f64 - reduction_per_node).max(min_reward as f64) as i64
            };
            payouts.insert(c.worker.clone(), amount);
        }
        payouts
    }

    /// 70% proportional + 20% weighted by `quality_score` + 10% weighted by
    /// `reliability_score`.
    fn hybrid(
        pool: i64,
        contributors: &[ContributionRecord],
        total_contribution: i64,
    ) -> HashMap<WorkerId, i64> {
        let proportional_pool = (pool as f64 * HYBRID_PROPORTIONAL_SHARE) as i64;
        let quality_pool = (pool as f64 * HYBRID_QUALITY_SHARE) as i64;
        let reliability_pool = pool - proportional_pool - quality_pool;

        let total_quality: u64 = contributors.iter().map(|c| c.quality_score as u64).sum();
        let total_reliability: u64 = contributors.iter().map(|c| c.reliability_score as u64).sum();

        contributors
            .iter()
            .map(|c| {
                let prop =
                    (proportional_pool as i128 * c.final_score.max(0) as i128 / total_contribution as i128) as i64;
                let quality_bonus = if total_quality > 0 {
                    (quality_pool as u128 * c.quality_score as u128 / total_quality as u128) as i64
                } else {
                    0
                };
                let reliability_bonus = if total_reliability > 0 {
                    (reliability_pool as u128 * c.reliability_score as u128 / total_reliability as u128) as i64
                } else {
                    0
                };
                (c.worker.clone(), prop + quality_bonus + reliability_bonus)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(worker: &str, final_score: i64) -> ContributionRecord {
        ContributionRecord {
            worker: worker.to_string(),
            address: None,
            compute_time_seconds: 10.0,
            samples_processed: 1000,
            gradients_accepted: 10,
            gradients_rejected: 0,
            successful_rounds: 10,
            failed_rounds: 0,
            quality_score: 8000,
            reliability_score: 8000,
            final_score,
            is_outlier: false,
        }
    }

    #[test]
    fn proportional_reward_matches_worked_example() {
        let calc = RewardCalculator::new(RewardStrategyKind::Proportional);
        let contributors = vec![record("a", 100), record("b", 200), record("c", 300)];
        let dist = calc.distribute(6000, &contributors).unwrap();
        assert_eq!(dist.payouts["a"], 1000);
        assert_eq!(dist.payouts["b"], 2000);
        assert_eq!(dist.payouts["c"], 3000);
        assert_eq!(dist.total_paid, 6000);
        assert!(dist.is_valid());
    }

    #[test]
    fn performance_minimum_guarantees_floor() {
        let calc = RewardCalculator::new(RewardStrategyKind::Performance);
        let contributors = vec![record("a", 100), record("b", 0)];
        let dist = calc.distribute(100, &contributors).unwrap();
        let expected_floor = (50.0 * PERFORMANCE_MINIMUM_FRACTION) as i64;
        assert!(dist.payouts["b"] >= expected_floor);
        assert!(dist.is_valid());
    }

    #[test]
    fn total_paid_never_exceeds_pool_tolerance() {
        for strategy in [
            RewardStrategyKind::Proportional,
            RewardStrategyKind::Tiered,
            RewardStrategyKind::Performance,
            RewardStrategyKind::Hybrid,
        ] {
            let calc = RewardCalculator::new(strategy);
            let contributors = vec![record("a", 900), record("b", 400), record("c", 100)];
            let dist = calc.distribute(1000, &contributors).unwrap();
            assert!(dist.is_valid(), "{strategy:?} invalid: {dist:?}");
        }
    }

    #[test]
    fn zero_total_contribution_falls_back_to_equal_split() {
        let calc = RewardCalculator::new(RewardStrategyKind::Proportional);
        let contributors = vec![record("a", 0), record("b", 0)];
        let dist = calc.distribute(100, &contributors).unwrap();
        assert_eq!(dist.payouts["a"], dist.payouts["b"]);
    }
}
