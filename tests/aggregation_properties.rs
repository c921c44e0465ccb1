//! Property-based check of the aggregation weight-sum invariant (spec §8,
//! testable property 1): for any round, the combined gradient is exactly
//! the weighted mean of the accepted submissions, with weights summing to
//! 1 after normalization — never a scaled-up or scaled-down result.

use std::collections::HashMap;

use proptest::prelude::*;

use training_coordinator::config::AggregationStrategyKind;
use training_coordinator::model::{GradientMeta, GradientSubmission};
use training_coordinator::GradientAggregator;

fn submission(worker: &str, value: f32, samples: u64) -> GradientSubmission {
    let mut grads = HashMap::new();
    grads.insert("w".to_string(), vec![value]);
    GradientSubmission {
        round: 1,
        worker: worker.to_string(),
        grads,
        meta: GradientMeta {
            samples: Some(samples),
            ..Default::default()
        },
    }
}

fn aggregate_with(
    strategy: AggregationStrategyKind,
    values: &[(f32, u64)],
) -> HashMap<String, Vec<f32>> {
    let aggregator = GradientAggregator::new(strategy, None);
    let mut shapes = HashMap::new();
    shapes.insert("w".to_string(), vec![1]);
    let workers: Vec<String> = (0..values.len()).map(|i| format!("w{i}")).collect();
    aggregator.start_round(
        1,
        workers.iter().cloned().collect(),
        30.0,
        1.0,
        vec!["w".to_string()],
        shapes,
        None,
        HashMap::new(),
    );
    for (worker, (value, samples)) in workers.iter().zip(values) {
        aggregator
            .receive_gradient(submission(worker, *value, *samples))
            .unwrap();
    }
    aggregator.aggregate("all_responded").unwrap().grads
}

proptest! {
    /// Simple averaging always equals the unweighted arithmetic mean —
    /// the normalized weights (each 1/n) sum to 1 regardless of how many
    /// workers submitted.
    #[test]
    fn simple_average_equals_arithmetic_mean(
        values in prop::collection::vec(-100.0f32..100.0f32, 1..12)
    ) {
        let pairs: Vec<(f32, u64)> = values.iter().map(|v| (*v, 1)).collect();
        let grads = aggregate_with(AggregationStrategyKind::Simple, &pairs);
        let expected = values.iter().sum::<f32>() / values.len() as f32;
        prop_assert!((grads["w"][0] - expected).abs() < 1e-2);
    }

    /// Weighted averaging by sample count always equals the
    /// samples-weighted mean — the normalized weights still sum to 1, so
    /// the result is a genuine weighted average, never an unnormalized
    /// weighted sum.
    #[test]
    fn weighted_average_equals_samples_weighted_mean(
        pairs in prop::collection::vec((-100.0f32..100.0f32, 1u64..1000u64), 1..12)
    ) {
        let grads = aggregate_with(AggregationStrategyKind::Weighted, &pairs);
        let total_weight: f64 = pairs.iter().map(|(_, s)| *s as f64).sum();
        let expected: f64 = pairs
            .iter()
            .map(|(v, s)| *v as f64 * *s as f64)
            .sum::<f64>()
            / total_weight;
        prop_assert!((grads["w"][0] as f64 - expected).abs() < 1e-2);
    }
}
