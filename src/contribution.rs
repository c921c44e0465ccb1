//! C3 — Contribution Calculator.
//!
//! Grounded on `original_source/src/core/contribution_calculator.py`: a
//! per-worker running accumulator, two composite 0-10000 scores, a
//! compute-time-scaled final score, and z-score outlier detection across the
//! active worker set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};
use crate::model::WorkerId;

const OUTLIER_Z_THRESHOLD: f64 = 3.0;
const MAX_COMPUTE_SECONDS: f64 = 86_400.0;
/// Default latency/uptime term used before any sample has been recorded,
/// matching the source's "default moderate score" fallback
/// (`original_source/src/core/contribution_calculator.py`).
const DEFAULT_NETWORK_SCORE: u32 = 2000;
const DEFAULT_UPTIME_SCORE: u32 = 2000;

#[derive(Debug, Clone, Default)]
struct WorkerContribution {
    address: Option<String>,
    compute_time_seconds: f64,
    samples_processed: u64,
    gradients_accepted: u64,
    gradients_rejected: u64,
    successful_rounds: u64,
    failed_rounds: u64,
    avg_gradient_norm: f64,
    avg_latency_ms: f64,
    latency_samples: u64,
    uptime_fraction: f64,
    has_uptime_sample: bool,
    first_contribution: Option<DateTime<Utc>>,
    last_contribution: Option<DateTime<Utc>>,
}

impl WorkerContribution {
    /// spec.md §4.8: `quality_score = acceptance_rate·5000 +
    /// min(1, mean_grad_norm/10)·3000 + success_rate·2000`, clamped to
    /// [0,10000].
    fn quality_score(&self) -> u32 {
        let total_gradients = self.gradients_accepted + self.gradients_rejected;
        let acceptance_score = if total_gradients == 0 {
            0
        } else {
            let acceptance_rate = self.gradients_accepted as f64 / total_gradients as f64;
            (acceptance_rate * 5000.0) as u32
        };
        let consistency_score = if self.avg_gradient_norm > 0.0 {
            ((self.avg_gradient_norm / 10.0).min(1.0) * 3000.0) as u32
        } else {
            0
        };
        let total_rounds = self.successful_rounds + self.failed_rounds;
        let success_score = if total_rounds == 0 {
            0
        } else {
            let success_rate = self.successful_rounds as f64 / total_rounds as f64;
            (success_rate * 2000.0) as u32
        };
        (acceptance_score + consistency_score + success_score).min(10000)
    }

    /// spec.md §4.8: `reliability_score = min(5000, successful_rounds·100) +
    /// max(0, min(1,(500−mean_latency_ms)/450))·3000 + uptime_fraction·2000`.
    fn reliability_score(&self) -> u32 {
        let participation_score = (self.successful_rounds * 100).min(5000) as u32;
        let network_score = if self.latency_samples > 0 {
            let normalized = ((500.0 - self.avg_latency_ms) / 450.0).clamp(0.0, 1.0);
            (normalized * 3000.0) as u32
        } else {
            DEFAULT_NETWORK_SCORE
        };
        let uptime_score = if self.has_uptime_sample {
            (self.uptime_fraction.clamp(0.0, 1.0) * 2000.0) as u32
        } else {
            DEFAULT_UPTIME_SCORE
        };
        (participation_score + network_score + uptime_score).min(10000)
    }

    /// `final_score = floor(compute_time · quality_multiplier ·
    /// reliability_multiplier)`, multipliers in [0.5,1.5] and [0.8,1.2].
    fn final_score(&self) -> i64 {
        let quality_multiplier = 0.5 + self.quality_score() as f64 / 10000.0;
        let reliability_multiplier = 0.8 + 0.4 * self.reliability_score() as f64 / 10000.0;
        (self.compute_time_seconds * quality_multiplier * reliability_multiplier).floor() as i64
    }
}

/// One worker's contribution summary, suitable for forwarding to the reward
/// calculator or a blockchain record sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub worker: WorkerId,
    pub address: Option<String>,
    pub compute_time_seconds: f64,
    pub samples_processed: u64,
    pub gradients_accepted: u64,
    pub gradients_rejected: u64,
    pub successful_rounds: u64,
    pub failed_rounds: u64,
    pub quality_score: u32,
    pub reliability_score: u32,
    pub final_score: i64,
    pub is_outlier: bool,
}

/// A record formatted for the external blockchain/ledger sink (spec.md
/// §4.8 "Blockchain formatting").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainContributionRecord {
    pub payout_address: String,
    pub compute_time_seconds: u64,
    pub gradients_accepted: u64,
    pub successful_rounds: u64,
    pub quality_score: u32,
}

pub struct ContributionCalculator {
    workers: Mutex<HashMap<WorkerId, WorkerContribution>>,
}

impl ContributionCalculator {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a worker's payout address. Idempotent; a later call with
    /// `None` never erases a previously-known address.
    pub fn register(&self, worker: &str, address: Option<String>) {
        let mut workers = self.workers.lock();
        let entry = workers.entry(worker.to_string()).or_default();
        if address.is_some() {
            entry.address = address;
        }
    }

    /// Fold one round's outcome for a worker into its running accumulator:
    /// compute time, sample count, gradient acceptance, and round
    /// success/failure, matching `record_round`'s single call site in the
    /// round engine.
    pub fn record_round(
        &self,
        worker: &str,
        samples: u64,
        compute_seconds: f64,
        gradient_norm: f32,
        accepted: bool,
    ) {
        let mut workers = self.workers.lock();
        let entry = workers.entry(worker.to_string()).or_default();
        let now = Utc::now();
        if entry.first_contribution.is_none() {
            entry.first_contribution = Some(now);
        }
        entry.last_contribution = Some(now);

        entry.compute_time_seconds += compute_seconds;
        entry.samples_processed += samples;

        if accepted {
            entry.gradients_accepted += 1;
            entry.successful_rounds += 1;
            if gradient_norm.is_finite() && gradient_norm > 0.0 {
                let total = entry.gradients_accepted as f64;
                entry.avg_gradient_norm =
                    (entry.avg_gradient_norm * (total - 1.0) + gradient_norm as f64) / total;
            }
        } else {
            entry.gradients_rejected += 1;
            entry.failed_rounds += 1;
        }
    }

    /// Fold one network-quality sample (e.g. forwarded from C2) into the
    /// worker's running mean latency.
    pub fn record_network_sample(&self, worker: &str, latency_ms: f64) {
        let mut workers = self.workers.lock();
        let entry = workers.entry(worker.to_string()).or_default();
        let total = entry.latency_samples + 1;
        entry.avg_latency_ms =
            (entry.avg_latency_ms * entry.latency_samples as f64 + latency_ms) / total as f64;
        entry.latency_samples = total;
    }

    /// Record the worker's session uptime fraction in [0,1] (owned by
    /// whichever caller tracks wall-clock presence, e.g. the registry).
    pub fn set_uptime_fraction(&self, worker: &str, fraction: f64) {
        let mut workers = self.workers.lock();
        let entry = workers.entry(worker.to_string()).or_default();
        entry.uptime_fraction = fraction.clamp(0.0, 1.0);
        entry.has_uptime_sample = true;
    }

    pub fn has_history(&self, worker: &str) -> bool {
        self.workers
            .lock()
            .get(worker)
            .map(|w| w.successful_rounds + w.failed_rounds > 0)
            .unwrap_or(false)
    }

    /// Validate every tracked worker's raw accumulators for impossible
    /// values (spec.md §4.8 "Validation").
    pub fn validate(&self) -> Result<()> {
        let workers = self.workers.lock();
        for (id, contrib) in workers.iter() {
            if contrib.compute_time_seconds < 0.0 {
                return Err(CoordinatorError::Invariant(format!(
                    "{id}: negative compute time"
                )));
            }
            if contrib.compute_time_seconds > MAX_COMPUTE_SECONDS {
                return Err(CoordinatorError::Invariant(format!(
                    "{id}: compute time exceeds 24 hours"
                )));
            }
            let quality = contrib.quality_score();
            let reliability = contrib.reliability_score();
            if quality > 10000 || reliability > 10000 {
                return Err(CoordinatorError::Invariant(format!(
                    "{id}: score out of [0,10000] range"
                )));
            }
        }
        Ok(())
    }

    /// Snapshot every tracked worker's contribution record, flagging
    /// outliers whose `final_score` is more than `OUTLIER_Z_THRESHOLD`
    /// standard deviations from the cohort mean. Outliers are informational
    /// only (spec.md §9 open question): nothing downstream consumes them.
    pub fn snapshot_all(&self) -> Vec<ContributionRecord> {
        let workers = self.workers.lock();
        let scores: Vec<f64> = workers.values().map(|c| c.final_score() as f64).collect();
        let n = scores.len();
        let (mean, stddev) = if n < 3 {
            (0.0, 0.0)
        } else {
            let mean = scores.iter().sum::<f64>() / n as f64;
            let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
            (mean, variance.sqrt())
        };

        workers
            .iter()
            .map(|(id, c)| {
                let final_score = c.final_score();
                let is_outlier =
                    stddev > 0.0 && ((final_score as f64 - mean) / stddev).abs() > OUTLIER_Z_THRESHOLD;
                ContributionRecord {
                    worker: id.clone(),
                    address: c.address.clone(),
                    compute_time_seconds: c.compute_time_seconds,
                    samples_processed: c.samples_processed,
                    gradients_accepted: c.gradients_accepted,
                    gradients_rejected: c.gradients_rejected,
                    successful_rounds: c.successful_rounds,
                    failed_rounds: c.failed_rounds,
                    quality_score: c.quality_score(),
                    reliability_score: c.reliability_score(),
                    final_score,
                    is_outlier,
                }
            })
            .collect()
    }

    /// Format every tracked worker for the external blockchain/ledger sink
    /// (spec.md §4.8 "Blockchain formatting"), in a deterministic order so
    /// the same snapshot always yields a byte-equal list.
    pub fn format_for_blockchain(&self) -> Vec<BlockchainContributionRecord> {
        let mut records = self.snapshot_all();
        records.sort_by(|a, b| a.worker.cmp(&b.worker));
        records
            .into_iter()
            .filter_map(|r| {
                r.address.map(|address| BlockchainContributionRecord {
                    payout_address: address,
                    compute_time_seconds: r.compute_time_seconds as u64,
                    gradients_accepted: r.gradients_accepted,
                    successful_rounds: r.successful_rounds,
                    quality_score: r.quality_score,
                })
            })
            .collect()
    }
}

impl Default for ContributionCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_score_scales_with_compute_time_and_quality() {
        let calc = ContributionCalculator::new();
        calc.record_round("a", 100, 10.0, 0.1, true);
        calc.record_round("a", 100, 10.0, 0.1, true);
        let records = calc.snapshot_all();
        let record = records.iter().find(|r| r.worker == "a").unwrap();
        // 20s compute, high acceptance/success rate -> quality & reliability
        // multipliers near their ceilings, final_score well above raw compute.
        assert!(record.final_score >= 20);
        assert!(record.quality_score <= 10000);
        assert!(record.reliability_score <= 10000);
    }

    #[test]
    fn scores_stay_within_bounds_through_many_updates() {
        let calc = ContributionCalculator::new();
        for i in 0..50 {
            calc.record_round("a", 10, 1.0, 2.0, i % 3 != 0);
            calc.record_network_sample("a", 30.0 + i as f64);
        }
        let records = calc.snapshot_all();
        let record = records.iter().find(|r| r.worker == "a").unwrap();
        assert!(record.quality_score <= 10000);
        assert!(record.reliability_score <= 10000);
        assert!(calc.validate().is_ok());
    }

    #[test]
    fn successful_rounds_never_decreases() {
        let calc = ContributionCalculator::new();
        let mut last = 0;
        for i in 0..10 {
            calc.record_round("a", 1, 1.0, 1.0, i % 2 == 0);
            let current = calc.snapshot_all()[0].successful_rounds;
            assert!(current >= last);
            last = current;
        }
    }

    #[test]
    fn outlier_flagged_far_from_cohort_mean() {
        let calc = ContributionCalculator::new();
        for id in ["a", "b", "c", "d"] {
            calc.record_round(id, 100, 5.0, 0.1, true);
        }
        for _ in 0..50 {
            calc.record_round("z", 1000, 500.0, 5.0, true);
        }
        let records = calc.snapshot_all();
        let outlier = records.iter().find(|r| r.worker == "z").unwrap();
        assert!(outlier.is_outlier);
    }

    #[test]
    fn no_history_is_not_queryable() {
        let calc = ContributionCalculator::new();
        assert!(!calc.has_history("ghost"));
    }

    #[test]
    fn blockchain_format_is_deterministic_and_ordered() {
        let calc = ContributionCalculator::new();
        calc.register("b", Some("0xB".into()));
        calc.register("a", Some("0xA".into()));
        calc.record_round("a", 10, 1.0, 1.0, true);
        calc.record_round("b", 10, 1.0, 1.0, true);
        let first = calc.format_for_blockchain();
        let second = calc.format_for_blockchain();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payout_address, "0xA");
        assert_eq!(first[1].payout_address, "0xB");
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
