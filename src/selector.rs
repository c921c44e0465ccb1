//! C5 — Dynamic Node Selector.
//!
//! Grounded on `original_source/src/core/node_selector.py`: five selection
//! strategies, a quarantine/probation state machine driven by a rolling
//! failure ratio, and administrative overrides that bypass both gates.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::config::SelectionStrategyKind;
use crate::model::WorkerId;
use crate::network_monitor::NetworkQualityMonitor;

const RECENT_WINDOW_CAP: usize = 20;
const SELECTION_HISTORY_CAP: usize = 256;
const QUARANTINE_FAILURE_RATIO: f64 = 0.7;
const CONTRIBUTION_BASED_MIN_SCORE: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Active,
    Excluded,
    Quarantined,
    Probation,
}

#[derive(Debug, Clone)]
pub struct SelectionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub selected: Vec<WorkerId>,
}

struct WorkerSelectorRecord {
    state: SelectionState,
    contribution_score: f64,
    compute_time_total: f64,
    waiting_time_total: f64,
    success_count: u64,
    failure_count: u64,
    recent_outcomes: VecDeque<bool>,
    quarantine_expiry: Option<DateTime<Utc>>,
    probation_consecutive_successes: u32,
    selection_count: u64,
    exclusion_count: u64,
    force_include: bool,
    force_exclude: bool,
}

impl WorkerSelectorRecord {
    fn new() -> Self {
        Self {
            state: SelectionState::Active,
            contribution_score: 50.0,
            compute_time_total: 0.0,
            waiting_time_total: 0.0,
            success_count: 0,
            failure_count: 0,
            recent_outcomes: VecDeque::with_capacity(RECENT_WINDOW_CAP),
            quarantine_expiry: None,
            probation_consecutive_successes: 0,
            selection_count: 0,
            exclusion_count: 0,
            force_include: false,
            force_exclude: false,
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.recent_outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent_outcomes.len() as f64
    }

    fn recompute_contribution_score(&mut self) {
        let efficiency = if self.compute_time_total + self.waiting_time_total > 0.0 {
            self.compute_time_total / (self.compute_time_total + self.waiting_time_total) * 50.0
        } else {
            0.0
        };
        let total = self.success_count + self.failure_count;
        let reliability = if total > 0 {
            (self.success_count as f64 / total as f64) * 50.0
        } else {
            0.0
        };
        self.contribution_score = (efficiency + reliability).clamp(0.0, 100.0);
    }
}

pub struct DynamicNodeSelector {
    strategy: SelectionStrategyKind,
    enable_quarantine: bool,
    quarantine_threshold: u32,
    quarantine_duration: ChronoDuration,
    probation_steps: u32,
    min_quality_score: u32,
    max_selected_nodes: Option<usize>,
    workers: Mutex<HashMap<WorkerId, WorkerSelectorRecord>>,
    history: Mutex<VecDeque<SelectionHistoryEntry>>,
}

impl DynamicNodeSelector {
    pub fn new(
        strategy: SelectionStrategyKind,
        enable_quarantine: bool,
        quarantine_threshold: u32,
        quarantine_duration_seconds: u64,
        probation_steps: u32,
        min_quality_score: u32,
        max_selected_nodes: Option<usize>,
    ) -> Self {
        Self {
            strategy,
            enable_quarantine,
            quarantine_threshold,
            quarantine_duration: ChronoDuration::seconds(quarantine_duration_seconds as i64),
            probation_steps,
            min_quality_score,
            max_selected_nodes,
            workers: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn record_mut<'a>(
        workers: &'a mut HashMap<WorkerId, WorkerSelectorRecord>,
        worker: &str,
    ) -> &'a mut WorkerSelectorRecord {
        workers
            .entry(worker.to_string())
            .or_insert_with(WorkerSelectorRecord::new)
    }

    /// Record the outcome of one round's contribution attempt for a worker:
    /// `compute_time`/`waiting_time` feed the cumulative efficiency score,
    /// `success` feeds both the cumulative reliability score and the
    /// rolling quarantine window.
    pub fn record_contribution(
        &self,
        worker: &str,
        compute_time: f64,
        waiting_time: f64,
        success: bool,
    ) {
        let mut workers = self.workers.lock();
        let record = Self::record_mut(&mut workers, worker);
        record.compute_time_total += compute_time;
        record.waiting_time_total += waiting_time;
        if success {
            record.success_count += 1;
        } else {
            record.failure_count += 1;
        }
        if record.recent_outcomes.len() == RECENT_WINDOW_CAP {
            record.recent_outcomes.pop_front();
        }
        record.recent_outcomes.push_back(success);
        record.recompute_contribution_score();

        if record.state == SelectionState::Probation {
            if success {
                record.probation_consecutive_successes += 1;
                if record.probation_consecutive_successes >= self.probation_steps {
                    record.state = SelectionState::Active;
                    record.probation_consecutive_successes = 0;
                }
            } else {
                record.probation_consecutive_successes = 0;
            }
        }

        if self.enable_quarantine
            && record.state == SelectionState::Active
            && record.recent_outcomes.len() >= self.quarantine_threshold as usize
            && record.failure_ratio() > QUARANTINE_FAILURE_RATIO
        {
            record.state = SelectionState::Quarantined;
            record.quarantine_expiry = Some(Utc::now() + self.quarantine_duration);
        }
    }

    pub fn force_include(&self, worker: &str, value: bool) {
        let mut workers = self.workers.lock();
        Self::record_mut(&mut workers, worker).force_include = value;
    }

    pub fn force_exclude(&self, worker: &str, value: bool) {
        let mut workers = self.workers.lock();
        Self::record_mut(&mut workers, worker).force_exclude = value;
    }

    pub fn contribution_score(&self, worker: &str) -> f64 {
        self.workers
            .lock()
            .get(worker)
            .map(|r| r.contribution_score)
            .unwrap_or(50.0)
    }

    pub fn state_of(&self, worker: &str) -> SelectionState {
        self.workers
            .lock()
            .get(worker)
            .map(|r| r.state)
            .unwrap_or(SelectionState::Active)
    }

    /// Transition quarantined workers whose expiry has passed into
    /// probation. Must run before every selection so expired quarantines
    /// don't linger.
    fn refresh_quarantine(&self, workers: &mut HashMap<WorkerId, WorkerSelectorRecord>) {
        let now = Utc::now();
        for record in workers.values_mut() {
            if record.state == SelectionState::Quarantined {
                if let Some(expiry) = record.quarantine_expiry {
                    if now >= expiry {
                        record.state = SelectionState::Probation;
                        record.quarantine_expiry = None;
                        record.probation_consecutive_successes = 0;
                    }
                }
            }
        }
    }

    fn apply_strategy(
        &self,
        candidates: &[WorkerId],
        monitor: &NetworkQualityMonitor,
        workers: &HashMap<WorkerId, WorkerSelectorRecord>,
    ) -> Vec<WorkerId> {
        match self.strategy {
            SelectionStrategyKind::All => candidates.to_vec(),
            SelectionStrategyKind::Threshold => candidates
                .iter()
                .filter(|w| monitor.snapshot(w).quality_score >= self.min_quality_score || !workers.contains_key(w.as_str()))
                .cloned()
                .collect(),
            SelectionStrategyKind::TopN => {
                let mut scored: Vec<(WorkerId, f64)> = candidates
                    .iter()
                    .map(|w| {
                        let quality = monitor.snapshot(w).quality_score as f64;
                        let contribution = workers.get(w.as_str()).map(|r| r.contribution_score).unwrap_or(50.0);
                        (w.clone(), 0.6 * quality + 0.4 * contribution)
                    })
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
                let cap = self.max_selected_nodes.unwrap_or(scored.len());
                scored.into_iter().take(cap).map(|(w, _)| w).collect()
            }
            SelectionStrategyKind::Adaptive => {
                let scores: Vec<f64> = candidates
                    .iter()
                    .map(|w| monitor.snapshot(w).quality_score as f64)
                    .collect();
                if scores.is_empty() {
                    return Vec::new();
                }
                let mean = scores.iter().sum::<f64>() / scores.len() as f64;
                let variance =
                    scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
                let stddev = variance.sqrt();
                let threshold = (self.min_quality_score as f64).max(mean - 0.5 * stddev);
                candidates
                    .iter()
                    .filter(|w| monitor.snapshot(w).quality_score as f64 >= threshold)
                    .cloned()
                    .collect()
            }
            SelectionStrategyKind::Contribution => candidates
                .iter()
                .filter(|w| {
                    workers
                        .get(w.as_str())
                        .map(|r| r.contribution_score >= CONTRIBUTION_BASED_MIN_SCORE)
                        .unwrap_or(true)
                })
                .cloned()
                .collect(),
        }
    }

    /// Select the participating subset for the next round from `available`.
    pub fn select_nodes(
        &self,
        available: &[WorkerId],
        monitor: &NetworkQualityMonitor,
    ) -> Vec<WorkerId> {
        let mut workers = self.workers.lock();
        self.refresh_quarantine(&mut workers);

        let eligible: Vec<WorkerId> = available
            .iter()
            .filter(|w| {
                let record = workers.get(w.as_str());
                let quarantined = matches!(record.map(|r| r.state), Some(SelectionState::Quarantined));
                let force_in = record.map(|r| r.force_include).unwrap_or(false);
                let force_out = record.map(|r| r.force_exclude).unwrap_or(false);
                if force_out {
                    return false;
                }
                if force_in {
                    return true;
                }
                !quarantined
            })
            .cloned()
            .collect();

        let mut selected = self.apply_strategy(&eligible, monitor, &workers);

        // Force-include bypasses the strategy filter too.
        for worker in available {
            let force_in = workers.get(worker.as_str()).map(|r| r.force_include).unwrap_or(false);
            if force_in && !selected.contains(worker) {
                selected.push(worker.clone());
            }
        }
        let selected_set: HashSet<&WorkerId> = selected.iter().collect();

        for worker in available {
            let record = Self::record_mut(&mut workers, worker);
            if selected_set.contains(worker) {
                record.selection_count += 1;
            } else {
                record.exclusion_count += 1;
            }
        }

        let mut history = self.history.lock();
        if history.len() == SELECTION_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(SelectionHistoryEntry {
            timestamp: Utc::now(),
            selected: selected.clone(),
        });

        selected
    }

    pub fn history(&self) -> Vec<SelectionHistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    /// Workers currently excluded or quarantined, for the orchestrator to
    /// force back in on rollback (spec: "force-includes previously excluded
    /// workers").
    pub fn excluded_workers(&self) -> Vec<WorkerId> {
        self.workers
            .lock()
            .iter()
            .filter(|(_, r)| matches!(r.state, SelectionState::Excluded | SelectionState::Quarantined))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> DynamicNodeSelector {
        DynamicNodeSelector::new(SelectionStrategyKind::All, true, 5, 300, 3, 30, None)
    }

    #[test]
    fn quarantine_triggers_above_failure_ratio() {
        let sel = selector();
        sel.record_contribution("x", 1.0, 1.0, true);
        sel.record_contribution("x", 1.0, 1.0, true);
        sel.record_contribution("x", 1.0, 1.0, true);
        sel.record_contribution("x", 1.0, 1.0, true);
        assert_eq!(sel.state_of("x"), SelectionState::Active);

        sel.record_contribution("x", 1.0, 1.0, false);
        sel.record_contribution("x", 1.0, 1.0, false);
        sel.record_contribution("x", 1.0, 1.0, false);
        sel.record_contribution("x", 1.0, 1.0, false);
        // window: 4 success + 4 failure = 0.5 ratio, not quarantined yet
        assert_eq!(sel.state_of("x"), SelectionState::Active);

        // 4 more failures: window of last 8 is now all beyond quarantine_threshold(5)
        // and failure ratio rises above 0.7.
        sel.record_contribution("x", 1.0, 1.0, false);
        sel.record_contribution("x", 1.0, 1.0, false);
        sel.record_contribution("x", 1.0, 1.0, false);
        sel.record_contribution("x", 1.0, 1.0, false);
        assert_eq!(sel.state_of("x"), SelectionState::Quarantined);
    }

    #[test]
    fn quarantined_worker_excluded_from_selection() {
        let sel = selector();
        for _ in 0..8 {
            sel.record_contribution("x", 1.0, 1.0, false);
        }
        assert_eq!(sel.state_of("x"), SelectionState::Quarantined);
        let monitor = NetworkQualityMonitor::new();
        let selected = sel.select_nodes(
            &["x".to_string(), "y".to_string(), "z".to_string()],
            &monitor,
        );
        assert!(!selected.contains(&"x".to_string()));
        assert!(selected.contains(&"y".to_string()));
    }

    #[test]
    fn excluded_workers_lists_quarantined_not_active() {
        let sel = selector();
        for _ in 0..8 {
            sel.record_contribution("x", 1.0, 1.0, false);
        }
        sel.record_contribution("y", 1.0, 1.0, true);
        assert_eq!(sel.excluded_workers(), vec!["x".to_string()]);
    }

    #[test]
    fn force_include_bypasses_quarantine() {
        let sel = selector();
        for _ in 0..8 {
            sel.record_contribution("x", 1.0, 1.0, false);
        }
        sel.force_include("x", true);
        let monitor = NetworkQualityMonitor::new();
        let selected = sel.select_nodes(&["x".to_string()], &monitor);
        assert!(selected.contains(&"x".to_string()));
    }
}
