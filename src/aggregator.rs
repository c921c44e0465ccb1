//! C6 — Gradient Aggregator.
//!
//! Grounded on `daa-compute/src/protocols/aggregation.rs`'s
//! `GradientAggregator`/`AggregationStrategy` shape (open a round, collect
//! submissions, produce one combined gradient) and on
//! `original_source/src/core/coordinator.py`'s validation gate (reject
//! unexpected/duplicate/non-finite/shape-mismatched submissions before they
//! ever reach the averaging step).

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::AggregationStrategyKind;
use crate::error::{CoordinatorError, Result};
use crate::model::{clip_gradient_global_norm, GradientSubmission, Shape, WorkerId};

const ROUND_HISTORY_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationDecision {
    WaitForMore,
    AggregateNow(&'static str),
    InsufficientAbortRound,
}

#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub round: u64,
    pub participating: Vec<WorkerId>,
    pub reason: &'static str,
    pub grads: HashMap<String, Vec<f32>>,
    /// Samples-weighted mean of the accepted submissions' `meta.local_loss`
    /// (spec §4.6 step 6); `None` if no submission reported a loss.
    pub mean_local_loss: Option<f64>,
}

struct OpenRound {
    round: u64,
    expected: HashSet<WorkerId>,
    submissions: HashMap<WorkerId, GradientSubmission>,
    opened_at: DateTime<Utc>,
    timeout_seconds: f64,
    min_required: usize,
    order: Vec<String>,
    shapes: HashMap<String, Shape>,
    per_worker_clip: Option<f32>,
    /// Per-worker `node_quality_weight` multiplier for federated averaging
    /// (default 1.0), sourced by the caller from the network monitor.
    quality_weights: HashMap<WorkerId, f64>,
}

pub struct GradientAggregator {
    strategy: AggregationStrategyKind,
    global_clip: Option<f32>,
    state: Mutex<Inner>,
}

struct Inner {
    open: Option<OpenRound>,
    history: VecDeque<RoundOutcome>,
}

impl GradientAggregator {
    pub fn new(strategy: AggregationStrategyKind, global_clip: Option<f32>) -> Self {
        Self {
            strategy,
            global_clip,
            state: Mutex::new(Inner {
                open: None,
                history: VecDeque::new(),
            }),
        }
    }

    /// Open a new round for `expected` workers, each submission validated
    /// against `order`/`shapes`. `min_nodes_percentage` sets the minimum
    /// fraction of `expected` required to still aggregate at timeout.
    pub fn start_round(
        &self,
        round: u64,
        expected: HashSet<WorkerId>,
        timeout_seconds: f64,
        min_nodes_percentage: f64,
        order: Vec<String>,
        shapes: HashMap<String, Shape>,
        per_worker_clip: Option<f32>,
        quality_weights: HashMap<WorkerId, f64>,
    ) {
        let min_required = ((expected.len() as f64) * min_nodes_percentage).ceil() as usize;
        let mut state = self.state.lock();
        state.open = Some(OpenRound {
            round,
            expected,
            submissions: HashMap::new(),
            opened_at: Utc::now(),
            timeout_seconds,
            min_required: min_required.max(1),
            order,
            shapes,
            per_worker_clip,
            quality_weights,
        });
    }

    /// Workers still expected for the currently open round that haven't yet
    /// submitted. Must be read before `aggregate` closes the round out.
    pub fn get_missing_nodes(&self) -> Vec<WorkerId> {
        let state = self.state.lock();
        match state.open.as_ref() {
            Some(open) => open
                .expected
                .iter()
                .filter(|w| !open.submissions.contains_key(*w))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Validate and record one worker's gradient submission for the
    /// currently open round.
    pub fn receive_gradient(&self, mut submission: GradientSubmission) -> Result<()> {
        let mut state = self.state.lock();
        let open = state
            .open
            .as_mut()
            .ok_or_else(|| CoordinatorError::Validation("no round is open".into()))?;

        if submission.round != open.round {
            return Err(CoordinatorError::Validation(format!(
                "submission for round {} while round {} is open",
                submission.round, open.round
            )));
        }
        if !open.expected.contains(&submission.worker) {
            return Err(CoordinatorError::Validation(format!(
                "unexpected worker {}",
                submission.worker
            )));
        }
        if open.submissions.contains_key(&submission.worker) {
            return Err(CoordinatorError::Validation(format!(
                "duplicate submission from {}",
                submission.worker
            )));
        }
        for name in &open.order {
            let Some(values) = submission.grads.get(name) else {
                continue;
            };
            if let Some(shape) = open.shapes.get(name) {
                let expected_len: usize = shape.iter().product();
                if values.len() != expected_len {
                    return Err(CoordinatorError::Validation(format!(
                        "shape mismatch for {} from {}: expected {} got {}",
                        name,
                        submission.worker,
                        expected_len,
                        values.len()
                    )));
                }
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(CoordinatorError::Validation(format!(
                    "non-finite gradient values for {} from {}",
                    name, submission.worker
                )));
            }
        }

        if let Some(clip) = open.per_worker_clip {
            clip_gradient_global_norm(&open.order, &mut submission.grads, clip);
        }

        open.submissions.insert(submission.worker.clone(), submission);
        Ok(())
    }

    /// Decide whether the round should aggregate now, keep waiting, or be
    /// abandoned for lack of participants.
    pub fn should_aggregate(&self) -> AggregationDecision {
        let state = self.state.lock();
        let Some(open) = state.open.as_ref() else {
            return AggregationDecision::InsufficientAbortRound;
        };
        let elapsed = (Utc::now() - open.opened_at).num_milliseconds() as f64 / 1000.0;
        let received = open.submissions.len();

        if received == open.expected.len() {
            return AggregationDecision::AggregateNow("all_responded");
        }
        if elapsed < open.timeout_seconds {
            return AggregationDecision::WaitForMore;
        }
        if received >= open.min_required {
            AggregationDecision::AggregateNow("partial_at_timeout")
        } else {
            AggregationDecision::InsufficientAbortRound
        }
    }

    fn weighted_combine<'a>(
        order: &[String],
        submissions: impl Iterator<Item = (&'a GradientSubmission, f64)>,
    ) -> HashMap<String, Vec<f32>> {
        let mut weighted: HashMap<String, Vec<f64>> = HashMap::new();
        let mut total_weight = 0.0f64;
        for (submission, weight) in submissions {
            total_weight += weight;
            for name in order {
                let Some(values) = submission.grads.get(name) else {
                    continue;
                };
                let acc = weighted
                    .entry(name.clone())
                    .or_insert_with(|| vec![0.0; values.len()]);
                for (a, v) in acc.iter_mut().zip(values.iter()) {
                    *a += weight * (*v as f64);
                }
            }
        }
        let mut result = HashMap::new();
        for (name, acc) in weighted {
            let divisor = if total_weight > 0.0 { total_weight } else { 1.0 };
            result.insert(name, acc.into_iter().map(|v| (v / divisor) as f32).collect());
        }
        result
    }

    /// Combine all submissions for the currently open round using the
    /// configured strategy, then close the round. The simple-average form
    /// is also the documented fallback when a weighted strategy's total
    /// weight is zero.
    pub fn aggregate(&self, reason: &'static str) -> Result<RoundOutcome> {
        let mut state = self.state.lock();
        let open = state
            .open
            .take()
            .ok_or_else(|| CoordinatorError::RoundFailure("no round is open".into()))?;

        if open.submissions.is_empty() {
            return Err(CoordinatorError::RoundFailure(
                "cannot aggregate an empty round".into(),
            ));
        }

        let submissions: Vec<&GradientSubmission> = open.submissions.values().collect();
        let mut grads = match self.strategy {
            AggregationStrategyKind::Simple => {
                Self::weighted_combine(&open.order, submissions.iter().map(|s| (*s, 1.0)))
            }
            AggregationStrategyKind::Weighted => {
                // Weight is each worker's reported sample count (default 1.0 if
                // absent). Per the source's documented-but-preserved quirk
                // (SPEC_FULL.md open question), a zero total weight falls back
                // to simple_average rather than failing the round.
                let total: f64 = submissions
                    .iter()
                    .map(|s| s.meta.samples.map(|n| n as f64).unwrap_or(1.0))
                    .sum();
                if total <= 0.0 {
                    Self::weighted_combine(&open.order, submissions.iter().map(|s| (*s, 1.0)))
                } else {
                    Self::weighted_combine(
                        &open.order,
                        submissions
                            .iter()
                            .map(|s| (*s, s.meta.samples.map(|n| n as f64).unwrap_or(1.0))),
                    )
                }
            }
            AggregationStrategyKind::Federated => {
                // weight = data_samples * node_quality_weight (default 1.0),
                // normalized to sum 1 by weighted_combine's divisor.
                let weight_of = |s: &GradientSubmission| {
                    let samples = s.meta.samples.map(|n| n as f64).unwrap_or(1.0);
                    let quality = open.quality_weights.get(&s.worker).copied().unwrap_or(1.0);
                    samples * quality
                };
                let total: f64 = submissions.iter().map(|s| weight_of(s)).sum();
                if total <= 0.0 {
                    Self::weighted_combine(&open.order, submissions.iter().map(|s| (*s, 1.0)))
                } else {
                    Self::weighted_combine(
                        &open.order,
                        submissions.iter().map(|s| (*s, weight_of(s))),
                    )
                }
            }
        };

        if let Some(clip) = self.global_clip {
            clip_gradient_global_norm(&open.order, &mut grads, clip);
        }
        for values in grads.values() {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(CoordinatorError::Invariant(
                    "aggregated gradient contains non-finite values".into(),
                ));
            }
        }

        let loss_weight_total: f64 = submissions
            .iter()
            .filter(|s| s.meta.local_loss.is_some())
            .map(|s| s.meta.samples.map(|n| n as f64).unwrap_or(1.0))
            .sum();
        let mean_local_loss = if loss_weight_total > 0.0 {
            let weighted_sum: f64 = submissions
                .iter()
                .filter_map(|s| s.meta.local_loss.map(|loss| (s, loss)))
                .map(|(s, loss)| s.meta.samples.map(|n| n as f64).unwrap_or(1.0) * loss as f64)
                .sum();
            Some(weighted_sum / loss_weight_total)
        } else {
            None
        };

        let outcome = RoundOutcome {
            round: open.round,
            participating: open.submissions.keys().cloned().collect(),
            reason,
            grads,
            mean_local_loss,
        };
        if state.history.len() == ROUND_HISTORY_CAP {
            state.history.pop_front();
        }
        state.history.push_back(outcome.clone());
        Ok(outcome)
    }

    pub fn history(&self) -> Vec<RoundOutcome> {
        self.state.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GradientMeta;

    fn submission(round: u64, worker: &str, value: f32, samples: Option<u64>) -> GradientSubmission {
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), vec![value]);
        GradientSubmission {
            round,
            worker: worker.to_string(),
            grads,
            meta: GradientMeta {
                samples,
                ..Default::default()
            },
        }
    }

    fn setup(strategy: AggregationStrategyKind) -> GradientAggregator {
        setup_with_weights(strategy, HashMap::new())
    }

    fn setup_with_weights(
        strategy: AggregationStrategyKind,
        quality_weights: HashMap<String, f64>,
    ) -> GradientAggregator {
        let aggregator = GradientAggregator::new(strategy, None);
        let mut shapes = HashMap::new();
        shapes.insert("w".to_string(), vec![1]);
        aggregator.start_round(
            1,
            ["a".to_string(), "b".to_string(), "c".to_string()].into_iter().collect(),
            30.0,
            0.5,
            vec!["w".to_string()],
            shapes,
            None,
            quality_weights,
        );
        aggregator
    }

    #[test]
    fn simple_average_of_three_workers() {
        let aggregator = setup(AggregationStrategyKind::Simple);
        aggregator.receive_gradient(submission(1, "a", 1.0, None)).unwrap();
        aggregator.receive_gradient(submission(1, "b", 2.0, None)).unwrap();
        aggregator.receive_gradient(submission(1, "c", 3.0, None)).unwrap();
        assert_eq!(aggregator.should_aggregate(), AggregationDecision::AggregateNow("all_responded"));
        let outcome = aggregator.aggregate("all_responded").unwrap();
        assert!((outcome.grads["w"][0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn weighted_average_weights_by_data_samples() {
        let aggregator = setup(AggregationStrategyKind::Weighted);
        aggregator.receive_gradient(submission(1, "a", 1.0, Some(100))).unwrap();
        aggregator.receive_gradient(submission(1, "b", 3.0, Some(200))).unwrap();
        let outcome = aggregator.aggregate("timeout").unwrap();
        assert!((outcome.grads["w"][0] - 2.333_333_3).abs() < 1e-5);
    }

    #[test]
    fn federated_averaging_weights_by_samples_when_quality_uniform() {
        let aggregator = setup(AggregationStrategyKind::Federated);
        aggregator.receive_gradient(submission(1, "a", 1.0, Some(1))).unwrap();
        aggregator.receive_gradient(submission(1, "b", 3.0, Some(3))).unwrap();
        let outcome = aggregator.aggregate("timeout").unwrap();
        assert!((outcome.grads["w"][0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn federated_averaging_diverges_from_weighted_with_quality_weight() {
        let mut quality_weights = HashMap::new();
        quality_weights.insert("a".to_string(), 1.0);
        quality_weights.insert("b".to_string(), 0.2);

        let federated = setup_with_weights(AggregationStrategyKind::Federated, quality_weights);
        federated.receive_gradient(submission(1, "a", 1.0, Some(1))).unwrap();
        federated.receive_gradient(submission(1, "b", 3.0, Some(3))).unwrap();
        let federated_outcome = federated.aggregate("timeout").unwrap();

        let weighted = setup(AggregationStrategyKind::Weighted);
        weighted.receive_gradient(submission(1, "a", 1.0, Some(1))).unwrap();
        weighted.receive_gradient(submission(1, "b", 3.0, Some(3))).unwrap();
        let weighted_outcome = weighted.aggregate("timeout").unwrap();

        // Weighted ignores quality entirely: (1*1 + 3*3)/4 = 2.5.
        assert!((weighted_outcome.grads["w"][0] - 2.5).abs() < 1e-6);
        // Federated discounts b's weight to 3*0.2=0.6 against a's 1*1=1.0:
        // (1*1 + 3*0.6)/1.6 = 1.75.
        assert!((federated_outcome.grads["w"][0] - 1.75).abs() < 1e-6);
        assert!((federated_outcome.grads["w"][0] - weighted_outcome.grads["w"][0]).abs() > 1e-3);
    }

    #[test]
    fn missing_nodes_reported_before_aggregate_closes_round() {
        let aggregator = setup(AggregationStrategyKind::Simple);
        aggregator.receive_gradient(submission(1, "a", 1.0, None)).unwrap();
        let mut missing = aggregator.get_missing_nodes();
        missing.sort();
        assert_eq!(missing, vec!["b".to_string(), "c".to_string()]);
        aggregator.aggregate("partial_at_timeout").unwrap();
        assert!(aggregator.get_missing_nodes().is_empty());
    }

    #[test]
    fn mean_local_loss_is_samples_weighted() {
        let aggregator = setup(AggregationStrategyKind::Weighted);
        let mut a = submission(1, "a", 1.0, Some(100));
        a.meta.local_loss = Some(1.0);
        let mut b = submission(1, "b", 3.0, Some(200));
        b.meta.local_loss = Some(4.0);
        aggregator.receive_gradient(a).unwrap();
        aggregator.receive_gradient(b).unwrap();
        let outcome = aggregator.aggregate("timeout").unwrap();
        // (1*100 + 4*200) / 300 = 3.0
        assert!((outcome.mean_local_loss.unwrap() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_duplicate_submission() {
        let aggregator = setup(AggregationStrategyKind::Simple);
        aggregator.receive_gradient(submission(1, "a", 1.0, None)).unwrap();
        let err = aggregator.receive_gradient(submission(1, "a", 1.0, None));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_non_finite_gradient() {
        let aggregator = setup(AggregationStrategyKind::Simple);
        let bad = submission(1, "a", f32::NAN, None);
        assert!(aggregator.receive_gradient(bad).is_err());
    }

    #[test]
    fn rejects_unexpected_worker() {
        let aggregator = setup(AggregationStrategyKind::Simple);
        let bad = submission(1, "ghost", 1.0, None);
        assert!(aggregator.receive_gradient(bad).is_err());
    }
}
