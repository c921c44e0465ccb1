//! C8 — Adaptive Orchestrator.
//!
//! Grounded on `original_source/src/core/adaptive_orchestrator.py`'s phase
//! state machine and rollback evaluator. Drives whether C4/C5 should
//! re-evaluate their parameters on a given round, and watches for a
//! regression that should be rolled back.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::AdaptationPolicyKind;
use crate::network_monitor::NetworkQualityMonitor;

const SNAPSHOT_HISTORY_CAP: usize = 10;
const ROLLBACK_WINDOW: usize = 5;
const ROLLBACK_REGRESSION_MARGIN: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    Initialization,
    Warmup,
    AdaptiveTraining,
    Convergence,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub round: u64,
    pub phase: TrainingPhase,
    pub loss: f64,
    pub cluster_quality: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackDecision {
    Continue,
    Rollback { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct PhaseComparison {
    pub warmup_mean_loss: Option<f64>,
    pub adaptive_mean_loss: Option<f64>,
}

struct Inner {
    phase: TrainingPhase,
    history: VecDeque<OrchestratorSnapshot>,
    warmup_losses: Vec<f64>,
    adaptive_losses: Vec<f64>,
    rollback_window: VecDeque<f64>,
    last_adapted_round: Option<u64>,
}

pub struct AdaptiveOrchestrator {
    policy: AdaptationPolicyKind,
    warmup_rounds: u64,
    adaptation_interval: u64,
    enable_rollback: bool,
    inner: Mutex<Inner>,
}

impl AdaptiveOrchestrator {
    pub fn new(
        policy: AdaptationPolicyKind,
        warmup_rounds: u64,
        adaptation_interval: u64,
        enable_rollback: bool,
    ) -> Self {
        Self {
            policy,
            warmup_rounds,
            adaptation_interval,
            enable_rollback,
            inner: Mutex::new(Inner {
                phase: TrainingPhase::Initialization,
                history: VecDeque::new(),
                warmup_losses: Vec::new(),
                adaptive_losses: Vec::new(),
                rollback_window: VecDeque::new(),
                last_adapted_round: None,
            }),
        }
    }

    pub fn phase(&self) -> TrainingPhase {
        self.inner.lock().phase
    }

    /// Determine (and update) the training phase for the upcoming round.
    /// Convergence/Completed are only ever entered via `mark_converged`/
    /// `mark_completed`, never inferred from round number alone.
    pub fn pre_round(&self, round: u64) -> TrainingPhase {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, TrainingPhase::Convergence | TrainingPhase::Completed) {
            return inner.phase;
        }
        inner.phase = if round == 0 {
            TrainingPhase::Initialization
        } else if round <= self.warmup_rounds {
            TrainingPhase::Warmup
        } else {
            TrainingPhase::AdaptiveTraining
        };
        inner.phase
    }

    pub fn mark_converged(&self) {
        self.inner.lock().phase = TrainingPhase::Convergence;
    }

    pub fn mark_completed(&self) {
        self.inner.lock().phase = TrainingPhase::Completed;
    }

    /// Whether C4/C5 should re-evaluate their parameters this round, per
    /// the configured adaptation policy. Only meaningful once in
    /// `AdaptiveTraining` phase. `monitor` backs the reactive policy's
    /// "any problematic nodes" check; `recent_loss_improving` is the
    /// genuine loss-trend signal from `recent_loss_improving()`, read by
    /// the caller after `post_round`.
    pub fn should_adapt(
        &self,
        round: u64,
        monitor: &NetworkQualityMonitor,
        recent_loss_improving: bool,
    ) -> bool {
        let inner = self.inner.lock();
        if inner.phase != TrainingPhase::AdaptiveTraining {
            return false;
        }
        let since_last = inner
            .last_adapted_round
            .map(|last| round.saturating_sub(last))
            .unwrap_or(u64::MAX);
        let interval = self.adaptation_interval.max(1);
        match self.policy {
            AdaptationPolicyKind::Aggressive => true,
            AdaptationPolicyKind::Conservative => since_last >= interval * 2,
            AdaptationPolicyKind::Reactive => {
                !monitor.problematic().is_empty() || !recent_loss_improving || since_last >= interval
            }
            AdaptationPolicyKind::Proactive => since_last >= interval,
        }
    }

    /// Record that an adaptation was actually applied this round, so
    /// `should_adapt`'s interval gate and `post_round`'s rollback gate both
    /// know when it happened.
    pub fn record_adaptation(&self, round: u64) {
        self.inner.lock().last_adapted_round = Some(round);
    }

    /// Whether the most recently recorded round's loss is no worse than the
    /// one before it. `true` (vacuously) with fewer than two recorded
    /// rounds.
    pub fn recent_loss_improving(&self) -> bool {
        let inner = self.inner.lock();
        let len = inner.history.len();
        if len < 2 {
            return true;
        }
        inner.history[len - 1].loss <= inner.history[len - 2].loss
    }

    /// Fold one round's outcome into the phase history and rollback window,
    /// returning whether the orchestrator judges this a regression that
    /// should be rolled back (5-round-window-vs-5-round-window comparison).
    pub fn post_round(&self, round: u64, loss: f64, cluster_quality: f64) -> RollbackDecision {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        if inner.history.len() == SNAPSHOT_HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(OrchestratorSnapshot {
            round,
            phase,
            loss,
            cluster_quality,
            timestamp: Utc::now(),
        });

        match phase {
            TrainingPhase::Warmup => inner.warmup_losses.push(loss),
            TrainingPhase::AdaptiveTraining => inner.adaptive_losses.push(loss),
            _ => {}
        }

        if !self.enable_rollback {
            return RollbackDecision::Continue;
        }

        if inner.rollback_window.len() == ROLLBACK_WINDOW * 2 {
            inner.rollback_window.pop_front();
        }
        inner.rollback_window.push_back(loss);

        if inner.rollback_window.len() < ROLLBACK_WINDOW * 2 {
            return RollbackDecision::Continue;
        }
        let before: f64 = inner
            .rollback_window
            .iter()
            .take(ROLLBACK_WINDOW)
            .sum::<f64>()
            / ROLLBACK_WINDOW as f64;
        let after: f64 = inner
            .rollback_window
            .iter()
            .skip(ROLLBACK_WINDOW)
            .sum::<f64>()
            / ROLLBACK_WINDOW as f64;
        let recently_adapted = inner
            .last_adapted_round
            .map(|last| round.saturating_sub(last) <= ROLLBACK_WINDOW as u64)
            .unwrap_or(false);

        if after > before * (1.0 + ROLLBACK_REGRESSION_MARGIN) && recently_adapted {
            inner.rollback_window.clear();
            RollbackDecision::Rollback {
                reason: format!(
                    "loss regressed from {before:.4} to {after:.4} over the last {} rounds",
                    ROLLBACK_WINDOW * 2
                ),
            }
        } else {
            RollbackDecision::Continue
        }
    }

    pub fn history(&self) -> Vec<OrchestratorSnapshot> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Compare mean loss across the warmup and adaptive-training phases.
    pub fn phase_comparison(&self) -> PhaseComparison {
        let inner = self.inner.lock();
        let mean = |values: &[f64]| {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        PhaseComparison {
            warmup_mean_loss: mean(&inner.warmup_losses),
            adaptive_mean_loss: mean(&inner.adaptive_losses),
        }
    }
}
