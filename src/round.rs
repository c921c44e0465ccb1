//! C7 — Round Engine: the single per-round loop that ties every other
//! component together. Grounded on `original_source/src/core/coordinator.py`'s
//! `run_round` (select → dispatch → collect-with-timeout → aggregate →
//! apply → checkpoint) and on `daa-compute/src/training/mod.rs`'s async
//! worker-dispatch shape, re-architected onto `tokio::sync::mpsc` per the
//! abstract worker protocol (wire encoding is an external collaborator's
//! concern, not this crate's).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::aggregator::{AggregationDecision, GradientAggregator, RoundOutcome};
use crate::batch_controller::{AdaptiveBatchController, BatchSizeSnapshot};
use crate::checkpoint::{CheckpointRecord, CheckpointSink};
use crate::config::CoordinatorConfig;
use crate::contribution::ContributionCalculator;
use crate::error::{CoordinatorError, Result};
use crate::model::{gradient_l2_norm, GradientSubmission, ParameterSet, WorkerId};
use crate::network_monitor::NetworkQualityMonitor;
use crate::orchestrator::{AdaptiveOrchestrator, RollbackDecision};
use crate::registry::NodeRegistry;
use crate::selector::DynamicNodeSelector;
use crate::sink::ContributionSink;

/// The learning-rate step applied to the aggregated gradient. The
/// aggregator's strategies already produce a combined per-parameter delta;
/// this is a final uniform scale shared by every parameter.
const APPLY_LEARNING_RATE: f32 = 1.0;

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Ask `worker` to train one local batch of `batch_size` samples
    /// starting from `params`, reporting its gradient back through the
    /// coordinator's submission channel out of band.
    async fn dispatch(
        &self,
        worker: &str,
        round: u64,
        batch_size: u32,
        params: &ParameterSet,
    ) -> Result<()>;
}

/// Step/epoch position, advanced once per completed round
/// (`original_source/src/core/coordinator.py`'s `current_step`/
/// `current_epoch` counters — `epoch` is never a caller-supplied value).
#[derive(Debug, Clone, Copy, Default)]
struct StepState {
    step: u64,
    epoch: u64,
}

/// State captured immediately before an adaptation is applied, so a
/// subsequent rollback verdict can undo exactly that adaptation's effects.
struct RollbackSnapshot {
    batch_sizes: BatchSizeSnapshot,
    excluded_workers: Vec<WorkerId>,
}

pub struct RoundComponents {
    pub registry: Arc<NodeRegistry>,
    pub network: Arc<NetworkQualityMonitor>,
    pub batch: Arc<AdaptiveBatchController>,
    pub selector: Arc<DynamicNodeSelector>,
    pub aggregator: Arc<GradientAggregator>,
    pub orchestrator: Arc<AdaptiveOrchestrator>,
    pub contribution: Arc<ContributionCalculator>,
    pub checkpoint_sink: Arc<dyn CheckpointSink>,
    pub contribution_sink: Arc<dyn ContributionSink>,
    pub config: CoordinatorConfig,
    progress: parking_lot::Mutex<StepState>,
    pending_rollback: parking_lot::Mutex<Option<RollbackSnapshot>>,
}

impl RoundComponents {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NodeRegistry>,
        network: Arc<NetworkQualityMonitor>,
        batch: Arc<AdaptiveBatchController>,
        selector: Arc<DynamicNodeSelector>,
        aggregator: Arc<GradientAggregator>,
        orchestrator: Arc<AdaptiveOrchestrator>,
        contribution: Arc<ContributionCalculator>,
        checkpoint_sink: Arc<dyn CheckpointSink>,
        contribution_sink: Arc<dyn ContributionSink>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
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
            progress: parking_lot::Mutex::new(StepState::default()),
            pending_rollback: parking_lot::Mutex::new(None),
        }
    }

    /// Advance the step counter by one completed round and return the
    /// epoch it now falls in.
    fn advance_step(&self) -> u64 {
        let mut progress = self.progress.lock();
        progress.step += 1;
        if progress.step % self.config.steps_per_epoch == 0 {
            progress.epoch += 1;
        }
        progress.epoch
    }
}

#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: u64,
    pub epoch: u64,
    pub participating: Vec<WorkerId>,
    pub reason: &'static str,
    pub mean_local_loss: Option<f64>,
    pub rollback: RollbackDecision,
    pub new_version: u64,
    pub new_hash: String,
}

impl RoundComponents {
    /// Run exactly one training round: select participants, dispatch work,
    /// collect submissions until the aggregator's timeout/threshold gate
    /// fires, aggregate, apply to `params` in place, checkpoint, and report
    /// a summary including the orchestrator's rollback verdict.
    pub async fn run_round(
        &self,
        round: u64,
        params: &mut ParameterSet,
        transport: &dyn WorkerTransport,
        submissions: &mut mpsc::Receiver<GradientSubmission>,
    ) -> Result<RoundSummary> {
        self.orchestrator.pre_round(round);

        let eligible: Vec<WorkerId> = self.registry.eligible().into_iter().map(|w| w.id).collect();
        let selected = self.selector.select_nodes(&eligible, &self.network);
        if selected.is_empty() {
            return Err(CoordinatorError::RoundFailure(format!(
                "no eligible workers selected for round {round}"
            )));
        }

        let shapes: HashMap<String, Vec<usize>> = params
            .order()
            .iter()
            .filter_map(|name| params.shape_of(name).map(|s| (name.clone(), s.clone())))
            .collect();
        let quality_weights: HashMap<WorkerId, f64> = selected
            .iter()
            .map(|w| (w.clone(), self.network.snapshot(w).quality_score as f64 / 100.0))
            .collect();
        self.aggregator.start_round(
            round,
            selected.iter().cloned().collect(),
            self.config.timeout_seconds,
            self.config.min_nodes_percentage,
            params.order().to_vec(),
            shapes,
            self.config.gradient_clip_value,
            quality_weights,
        );

        for worker in &selected {
            self.batch.ensure_worker(worker);
            let batch_size = self.batch.current_batch_size(worker);
            if let Err(err) = transport.dispatch(worker, round, batch_size, params).await {
                self.registry.record_failure(worker);
                tracing::warn!(worker, round, %err, "dispatch failed");
            }
        }

        let deadline = Instant::now() + Duration::from_secs_f64(self.config.timeout_seconds);
        let outcome = loop {
            match self.aggregator.should_aggregate() {
                AggregationDecision::AggregateNow(reason) => {
                    self.record_missing_nodes(round);
                    break self.aggregator.aggregate(reason)?;
                }
                AggregationDecision::InsufficientAbortRound => {
                    self.record_missing_nodes(round);
                    return Err(CoordinatorError::RoundFailure(format!(
                        "round {round} aborted: insufficient participants before timeout"
                    )));
                }
                AggregationDecision::WaitForMore => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        continue;
                    }
                    match tokio::time::timeout(remaining, submissions.recv()).await {
                        Ok(Some(submission)) => self.ingest_submission(submission),
                        Ok(None) => continue,
                        Err(_) => continue,
                    }
                }
            }
        };

        let epoch = self.advance_step();
        let mean_local_loss = outcome.mean_local_loss;
        self.apply_and_finalize(round, epoch, params, &outcome).await?;

        let rollback = self.orchestrator.post_round(
            round,
            mean_local_loss.unwrap_or(0.0),
            self.network.cluster_summary().average_quality_score,
        );

        if let RollbackDecision::Rollback { .. } = &rollback {
            if let Some(snapshot) = self.pending_rollback.lock().take() {
                self.batch.restore_sizes(&snapshot.batch_sizes);
                for worker in &snapshot.excluded_workers {
                    self.selector.force_include(worker, true);
                }
            }
        } else if self.orchestrator.should_adapt(
            round,
            &self.network,
            self.orchestrator.recent_loss_improving(),
        ) {
            *self.pending_rollback.lock() = Some(RollbackSnapshot {
                batch_sizes: self.batch.snapshot_sizes(),
                excluded_workers: self.selector.excluded_workers(),
            });
            self.batch.evaluate_and_adapt(round, &self.network);
            self.orchestrator.record_adaptation(round);
        }

        Ok(RoundSummary {
            round,
            epoch,
            participating: outcome.participating,
            reason: outcome.reason,
            mean_local_loss,
            rollback,
            new_version: params.version,
            new_hash: params.hash.clone(),
        })
    }

    /// Any worker that was dispatched to but never submitted before the
    /// round closed is recorded as a failed contribution (C3) and a failed
    /// selection outcome (C5), same as an explicitly rejected submission.
    fn record_missing_nodes(&self, round: u64) {
        for worker in self.aggregator.get_missing_nodes() {
            tracing::warn!(worker, round, "worker missing at round close");
            self.contribution.record_round(&worker, 0, 0.0, 0.0, false);
            self.selector.record_contribution(&worker, 0.0, 0.0, false);
        }
    }

    fn ingest_submission(&self, submission: GradientSubmission) {
        let worker = submission.worker.clone();
        let order: Vec<String> = submission.grads.keys().cloned().collect();
        let norm = gradient_l2_norm(&order, &submission.grads);
        let samples = submission.meta.samples.unwrap_or(0);
        let compute_seconds = submission.meta.compute_time_seconds.unwrap_or(0.0);
        match self.aggregator.receive_gradient(submission) {
            Ok(()) => {
                self.network.record(&worker, compute_seconds * 1000.0, true, compute_seconds * 1000.0);
                self.contribution.record_round(&worker, samples, compute_seconds, norm, true);
                self.selector.record_contribution(&worker, compute_seconds, 0.0, true);
            }
            Err(err) => {
                tracing::warn!(worker, %err, "rejected gradient submission");
                self.contribution.record_round(&worker, samples, compute_seconds, norm, false);
                self.selector.record_contribution(&worker, compute_seconds, 0.0, false);
            }
        }
    }

    async fn apply_and_finalize(
        &self,
        round: u64,
        epoch: u64,
        params: &mut ParameterSet,
        outcome: &RoundOutcome,
    ) -> Result<()> {
        params.apply_gradient(&outcome.grads, APPLY_LEARNING_RATE);

        let step = self.progress.lock().step;
        let mut metrics_tail = self.orchestrator.history();
        if metrics_tail.len() > crate::checkpoint::METRICS_TAIL_CAP {
            let drop = metrics_tail.len() - crate::checkpoint::METRICS_TAIL_CAP;
            metrics_tail.drain(..drop);
        }
        let record = CheckpointRecord {
            round,
            epoch,
            step,
            version: params.version,
            hash: params.hash.clone(),
            parameters: params.clone(),
            registry_snapshot: self.registry.all(),
            metrics_tail,
        };
        self.checkpoint_sink.save(&record).await?;

        let contributions = self.contribution.snapshot_all();
        self.contribution_sink.submit_contributions(round, &contributions).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointSink;
    use crate::config::{AggregationStrategyKind, BatchStrategyKind, SelectionStrategyKind, AdaptationPolicyKind};
    use crate::sink::LoggingContributionSink;

    struct LoopbackTransport {
        tx: mpsc::Sender<GradientSubmission>,
    }

    #[async_trait]
    impl WorkerTransport for LoopbackTransport {
        async fn dispatch(
            &self,
            worker: &str,
            round: u64,
            _batch_size: u32,
            params: &ParameterSet,
        ) -> Result<()> {
            let mut grads = HashMap::new();
            for name in params.order() {
                let len = params.values_of(name).map(|v| v.len()).unwrap_or(0);
                grads.insert(name.clone(), vec![0.1; len]);
            }
            let submission = GradientSubmission {
                round,
                worker: worker.to_string(),
                grads,
                meta: crate::model::GradientMeta {
                    samples: Some(32),
                    local_loss: Some(0.5),
                    compute_time_seconds: Some(0.01),
                    gradient_norm: None,
                },
            };
            let _ = self.tx.send(submission).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_round_updates_parameters() {
        let registry = Arc::new(NodeRegistry::new());
        registry.add("w1".into(), "addr1".into(), None);
        registry.add("w2".into(), "addr2".into(), None);
        registry.update_status("w1", crate::model::WorkerStatus::Ready);
        registry.update_status("w2", crate::model::WorkerStatus::Ready);

        let components = RoundComponents::new(
            registry,
            Arc::new(NetworkQualityMonitor::new()),
            Arc::new(AdaptiveBatchController::new(BatchStrategyKind::Fixed, 8, 1, 64, false, 1)),
            Arc::new(DynamicNodeSelector::new(SelectionStrategyKind::All, false, 5, 300, 3, 0, None)),
            Arc::new(GradientAggregator::new(AggregationStrategyKind::Simple, None)),
            Arc::new(AdaptiveOrchestrator::new(AdaptationPolicyKind::Reactive, 10, 5, false)),
            Arc::new(ContributionCalculator::new()),
            Arc::new(InMemoryCheckpointSink::new()),
            Arc::new(LoggingContributionSink),
            CoordinatorConfig {
                timeout_seconds: 2.0,
                ..Default::default()
            },
        );

        let mut params = ParameterSet::new(vec![("w".into(), vec![1.0, 1.0], vec![2])]);
        let (tx, mut rx) = mpsc::channel(8);
        let transport = LoopbackTransport { tx };

        let summary = components
            .run_round(1, &mut params, &transport, &mut rx)
            .await
            .unwrap();
        assert_eq!(summary.participating.len(), 2);
        assert_eq!(params.version, 1);
        assert_eq!(summary.epoch, 0);
        assert!(summary.mean_local_loss.is_some());
    }

    #[tokio::test]
    async fn epoch_advances_after_steps_per_epoch_rounds() {
        let registry = Arc::new(NodeRegistry::new());
        registry.add("w1".into(), "addr1".into(), None);
        registry.update_status("w1", crate::model::WorkerStatus::Ready);

        let components = RoundComponents::new(
            registry,
            Arc::new(NetworkQualityMonitor::new()),
            Arc::new(AdaptiveBatchController::new(BatchStrategyKind::Fixed, 8, 1, 64, false, 1)),
            Arc::new(DynamicNodeSelector::new(SelectionStrategyKind::All, false, 5, 300, 3, 0, None)),
            Arc::new(GradientAggregator::new(AggregationStrategyKind::Simple, None)),
            Arc::new(AdaptiveOrchestrator::new(AdaptationPolicyKind::Reactive, 10, 5, false)),
            Arc::new(ContributionCalculator::new()),
            Arc::new(InMemoryCheckpointSink::new()),
            Arc::new(LoggingContributionSink),
            CoordinatorConfig {
                timeout_seconds: 2.0,
                steps_per_epoch: 2,
                ..Default::default()
            },
        );

        let mut params = ParameterSet::new(vec![("w".into(), vec![1.0], vec![1])]);
        let (tx, mut rx) = mpsc::channel(8);
        let transport = LoopbackTransport { tx };

        let first = components.run_round(1, &mut params, &transport, &mut rx).await.unwrap();
        assert_eq!(first.epoch, 0);
        let second = components.run_round(2, &mut params, &transport, &mut rx).await.unwrap();
        assert_eq!(second.epoch, 1);
    }

    #[tokio::test]
    async fn missing_worker_at_timeout_is_recorded_as_a_failed_contribution() {
        let registry = Arc::new(NodeRegistry::new());
        registry.add("w1".into(), "addr1".into(), None);
        registry.add("w2".into(), "addr2".into(), None);
        registry.update_status("w1", crate::model::WorkerStatus::Ready);
        registry.update_status("w2", crate::model::WorkerStatus::Ready);

        struct OneWorkerTransport {
            tx: mpsc::Sender<GradientSubmission>,
        }
        #[async_trait]
        impl WorkerTransport for OneWorkerTransport {
            async fn dispatch(
                &self,
                worker: &str,
                round: u64,
                _batch_size: u32,
                params: &ParameterSet,
            ) -> Result<()> {
                if worker != "w1" {
                    return Ok(());
                }
                let mut grads = HashMap::new();
                for name in params.order() {
                    let len = params.values_of(name).map(|v| v.len()).unwrap_or(0);
                    grads.insert(name.clone(), vec![0.1; len]);
                }
                let submission = GradientSubmission {
                    round,
                    worker: worker.to_string(),
                    grads,
                    meta: crate::model::GradientMeta {
                        samples: Some(32),
                        local_loss: Some(0.5),
                        compute_time_seconds: Some(0.01),
                        gradient_norm: None,
                    },
                };
                let _ = self.tx.send(submission).await;
                Ok(())
            }
        }

        let components = RoundComponents::new(
            registry,
            Arc::new(NetworkQualityMonitor::new()),
            Arc::new(AdaptiveBatchController::new(BatchStrategyKind::Fixed, 8, 1, 64, false, 1)),
            Arc::new(DynamicNodeSelector::new(SelectionStrategyKind::All, false, 5, 300, 3, 0, None)),
            Arc::new(GradientAggregator::new(AggregationStrategyKind::Simple, None)),
            Arc::new(AdaptiveOrchestrator::new(AdaptationPolicyKind::Reactive, 10, 5, false)),
            Arc::new(ContributionCalculator::new()),
            Arc::new(InMemoryCheckpointSink::new()),
            Arc::new(LoggingContributionSink),
            CoordinatorConfig {
                timeout_seconds: 0.05,
                min_nodes_percentage: 0.1,
                ..Default::default()
            },
        );

        let mut params = ParameterSet::new(vec![("w".into(), vec![1.0], vec![1])]);
        let (tx, mut rx) = mpsc::channel(8);
        let transport = OneWorkerTransport { tx };

        let summary = components.run_round(1, &mut params, &transport, &mut rx).await.unwrap();
        assert_eq!(summary.participating, vec!["w1".to_string()]);
        assert!(components.contribution.has_history("w2"));
    }
}
