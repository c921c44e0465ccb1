//! C4 — Adaptive Batch Controller.
//!
//! Grounded on `original_source/src/core/adaptive_batch_controller.py`:
//! per-worker batch size bounded to `[min, max]`, four sizing strategies
//! driven by network quality and throughput trend, and a history of applied
//! changes. `evaluate_and_adapt` is gated to at most once per
//! `adaptation_interval` rounds, matching the idempotence law in
//! `SPEC_FULL.md` §8 ("called twice back-to-back with no intervening
//! performance samples returns an empty change set on the second call").

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::config::BatchStrategyKind;
use crate::model::WorkerId;
use crate::network_monitor::{NetworkQualityMonitor, QualityBand};

const THROUGHPUT_HISTORY_CAP: usize = 20;
const MIN_THROUGHPUT_SAMPLES: usize = 5;

/// A point-in-time capture of every worker's current batch size, taken
/// before an adaptation is applied so it can be restored on rollback.
#[derive(Debug, Clone)]
pub struct BatchSizeSnapshot(HashMap<WorkerId, u32>);

#[derive(Debug, Clone)]
pub struct BatchChangeEvent {
    pub round: u64,
    pub worker: WorkerId,
    pub old_size: u32,
    pub new_size: u32,
    pub reason: &'static str,
}

struct WorkerBatchState {
    current: u32,
    throughput_samples: VecDeque<f64>,
}

pub struct AdaptiveBatchController {
    strategy: BatchStrategyKind,
    baseline: u32,
    min_size: u32,
    max_size: u32,
    use_power_of_two: bool,
    adaptation_interval: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    workers: HashMap<WorkerId, WorkerBatchState>,
    history: VecDeque<BatchChangeEvent>,
    applied_adaptations: u64,
    last_adapted_round: Option<u64>,
}

const HISTORY_CAP: usize = 256;

impl AdaptiveBatchController {
    pub fn new(
        strategy: BatchStrategyKind,
        baseline: u32,
        min_size: u32,
        max_size: u32,
        use_power_of_two: bool,
        adaptation_interval: u64,
    ) -> Self {
        Self {
            strategy,
            baseline,
            min_size,
            max_size,
            use_power_of_two,
            adaptation_interval,
            inner: Mutex::new(Inner {
                workers: HashMap::new(),
                history: VecDeque::new(),
                applied_adaptations: 0,
                last_adapted_round: None,
            }),
        }
    }

    pub fn current_batch_size(&self, worker: &str) -> u32 {
        self.inner
            .lock()
            .workers
            .get(worker)
            .map(|w| w.current)
            .unwrap_or(self.baseline)
    }

    /// Record an observed throughput sample (samples/second) for a worker,
    /// feeding the throughput-based and hybrid strategies.
    pub fn record_throughput(&self, worker: &str, samples_per_second: f64) {
        let mut inner = self.inner.lock();
        let state = inner
            .workers
            .entry(worker.to_string())
            .or_insert_with(|| WorkerBatchState {
                current: self.baseline,
                throughput_samples: VecDeque::with_capacity(THROUGHPUT_HISTORY_CAP),
            });
        if state.throughput_samples.len() == THROUGHPUT_HISTORY_CAP {
            state.throughput_samples.pop_front();
        }
        state.throughput_samples.push_back(samples_per_second);
    }

    fn latency_multiplier(band: QualityBand, mean_latency_ms: f64) -> f64 {
        let band_mult = match band {
            QualityBand::Excellent => 0.75,
            QualityBand::Good => 1.0,
            QualityBand::Fair => 1.5,
            QualityBand::Poor => 2.0,
            QualityBand::Critical => 2.5,
            QualityBand::Offline => 1.0,
        };
        let extra = if mean_latency_ms < 50.0 {
            0.8
        } else if mean_latency_ms > 200.0 {
            1.5
        } else {
            1.0
        };
        band_mult * extra
    }

    fn throughput_factor(samples: &VecDeque<f64>) -> f64 {
        let n = samples.len();
        if n < MIN_THROUGHPUT_SAMPLES {
            return 1.0;
        }
        let recent: Vec<f64> = samples.iter().skip(n - 3).copied().collect();
        let prior_start = n.saturating_sub(6);
        let prior_end = n - 3;
        let prior: Vec<f64> = samples
            .iter()
            .skip(prior_start)
            .take(prior_end - prior_start)
            .copied()
            .collect();
        if prior.is_empty() {
            return 1.0;
        }
        let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let prior_mean = prior.iter().sum::<f64>() / prior.len() as f64;
        if prior_mean <= 0.0 {
            return 1.0;
        }
        let delta = (recent_mean - prior_mean) / prior_mean;
        if delta > 0.05 {
            1.25
        } else if delta < -0.05 {
            0.8
        } else {
            1.0
        }
    }

    fn constrain(&self, size: f64) -> u32 {
        let mut size = size.round().max(1.0) as u32;
        size = size.clamp(self.min_size, self.max_size);
        if self.use_power_of_two {
            size = nearest_power_of_two(size).clamp(self.min_size, self.max_size);
        }
        size
    }

    fn recommend(&self, worker: &str, monitor: &NetworkQualityMonitor, current: u32, samples: &VecDeque<f64>) -> (u32, &'static str) {
        match self.strategy {
            BatchStrategyKind::Fixed => (self.baseline, "fixed"),
            BatchStrategyKind::Latency => {
                let snap = monitor.snapshot(worker);
                let mult = Self::latency_multiplier(snap.band, snap.mean_latency_ms);
                (self.constrain(self.baseline as f64 * mult), "latency")
            }
            BatchStrategyKind::Throughput => {
                let factor = Self::throughput_factor(samples);
                (self.constrain(current as f64 * factor), "throughput")
            }
            BatchStrategyKind::Hybrid => {
                let snap = monitor.snapshot(worker);
                let latency_size =
                    self.baseline as f64 * Self::latency_multiplier(snap.band, snap.mean_latency_ms);
                let throughput_size = current as f64 * Self::throughput_factor(samples);
                (
                    self.constrain(0.6 * latency_size + 0.4 * throughput_size),
                    "hybrid",
                )
            }
        }
    }

    /// Evaluate and apply batch-size changes for all known workers. At most
    /// once per `adaptation_interval` rounds; a call within the same
    /// interval window returns an empty change set.
    pub fn evaluate_and_adapt(
        &self,
        round: u64,
        monitor: &NetworkQualityMonitor,
    ) -> Vec<WorkerId> {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_adapted_round {
            if round < last + self.adaptation_interval {
                return Vec::new();
            }
        }
        inner.last_adapted_round = Some(round);

        let worker_ids: Vec<WorkerId> = inner.workers.keys().cloned().collect();
        let mut changed = Vec::new();
        for worker in worker_ids {
            let (current, samples) = {
                let state = inner.workers.get(&worker).unwrap();
                (state.current, state.throughput_samples.clone())
            };
            let (new_size, reason) = self.recommend(&worker, monitor, current, &samples);
            if new_size != current {
                if let Some(state) = inner.workers.get_mut(&worker) {
                    state.current = new_size;
                }
                if inner.history.len() == HISTORY_CAP {
                    inner.history.pop_front();
                }
                inner.history.push_back(BatchChangeEvent {
                    round,
                    worker: worker.clone(),
                    old_size: current,
                    new_size,
                    reason,
                });
                inner.applied_adaptations += 1;
                changed.push(worker);
            }
        }
        changed
    }

    /// Capture every tracked worker's current batch size.
    pub fn snapshot_sizes(&self) -> BatchSizeSnapshot {
        let inner = self.inner.lock();
        BatchSizeSnapshot(inner.workers.iter().map(|(w, s)| (w.clone(), s.current)).collect())
    }

    /// Restore batch sizes captured by `snapshot_sizes`, e.g. after the
    /// orchestrator rolls back a harmful adaptation.
    pub fn restore_sizes(&self, snapshot: &BatchSizeSnapshot) {
        let mut inner = self.inner.lock();
        for (worker, size) in &snapshot.0 {
            if let Some(state) = inner.workers.get_mut(worker) {
                state.current = *size;
            }
        }
    }

    pub fn applied_adaptations(&self) -> u64 {
        self.inner.lock().applied_adaptations
    }

    pub fn history(&self) -> Vec<BatchChangeEvent> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Ensure a worker has a tracked batch-size entry (idempotent).
    pub fn ensure_worker(&self, worker: &str) {
        let mut inner = self.inner.lock();
        inner.workers.entry(worker.to_string()).or_insert_with(|| WorkerBatchState {
            current: self.baseline,
            throughput_samples: VecDeque::with_capacity(THROUGHPUT_HISTORY_CAP),
        });
    }
}

fn nearest_power_of_two(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    let lower = 1u32 << (31 - (n - 1).leading_zeros().min(31));
    let upper = lower.saturating_mul(2);
    if n - lower <= upper - n {
        lower
    } else {
        upper
    }
}
