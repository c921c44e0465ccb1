//! Distributed training coordinator for data-parallel stochastic gradient
//! descent across a dynamic pool of worker nodes operating over lossy,
//! variable-latency networks.
//!
//! The crate owns the coordinator's round engine and adaptive control loop:
//! node registry, network quality monitoring, adaptive batch sizing,
//! dynamic node selection with quarantine/probation, gradient aggregation,
//! the adaptive orchestrator that sequences all of the above, and the
//! contribution/reward calculators that close out a training session. The
//! neural-network training arithmetic, tensor codecs, wire protocol, and
//! persistence backends are external collaborators this crate is built to
//! be wired against, not implemented here.

pub mod aggregator;
pub mod batch_controller;
pub mod checkpoint;
pub mod config;
pub mod contribution;
pub mod error;
pub mod model;
pub mod network_monitor;
pub mod orchestrator;
pub mod registry;
pub mod reward;
pub mod round;
pub mod selector;
pub mod sink;

pub use aggregator::{AggregationDecision, GradientAggregator, RoundOutcome};
pub use batch_controller::AdaptiveBatchController;
pub use checkpoint::{CheckpointRecord, CheckpointSink, InMemoryCheckpointSink, RetryingCheckpointSink};
pub use config::CoordinatorConfig;
pub use contribution::{BlockchainContributionRecord, ContributionCalculator, ContributionRecord};
pub use error::{CoordinatorError, Result};
pub use model::{GradientMeta, GradientSubmission, ParameterSet, WorkerId, WorkerStatus};
pub use network_monitor::{NetworkQualityMonitor, QualityBand};
pub use orchestrator::{AdaptiveOrchestrator, OrchestratorSnapshot, RollbackDecision, TrainingPhase};
pub use registry::{NodeRegistry, WorkerMetadata};
pub use reward::{RewardCalculator, RewardDistribution};
pub use round::{RoundComponents, RoundSummary, WorkerTransport};
pub use selector::{DynamicNodeSelector, SelectionState};
pub use sink::{ContributionSink, LoggingContributionSink};

use std::sync::Arc;

/// Wire every coordinator component together from a single configuration,
/// replacing the source's module-level singleton construction with explicit
/// dependency injection (Design Notes: "global mutable state via
/// module-level singletons"). Process-wide state stays confined to the
/// binary's `main`, which owns this call.
pub fn build(
    config: CoordinatorConfig,
    checkpoint_sink: Arc<dyn CheckpointSink>,
    contribution_sink: Arc<dyn ContributionSink>,
) -> RoundComponents {
    let registry = Arc::new(NodeRegistry::new());
    let network = Arc::new(NetworkQualityMonitor::new());
    let batch = Arc::new(AdaptiveBatchController::new(
        config.batch_strategy,
        config.baseline_batch_size,
        config.min_batch_size,
        config.max_batch_size,
        config.use_power_of_two,
        config.adaptation_interval,
    ));
    let selector = Arc::new(DynamicNodeSelector::new(
        config.selection_strategy,
        config.enable_quarantine,
        config.quarantine_threshold,
        config.quarantine_duration_seconds,
        config.probation_steps,
        config.min_quality_score,
        config.max_selected_nodes,
    ));
    let aggregator = Arc::new(GradientAggregator::new(
        config.aggregation_strategy,
        config.gradient_clip_value,
    ));
    let orchestrator = Arc::new(AdaptiveOrchestrator::new(
        config.adaptation_policy,
        config.warmup_rounds,
        config.adaptation_interval,
        config.enable_rollback,
    ));
    let contribution = Arc::new(ContributionCalculator::new());

    RoundComponents::new(
        registry,
        network,
        batch,
        selector,
        aggregator,
        orchestrator,
        contribution,
        checkpoint_sink,
        contribution_sink,
        config,
    )
}
