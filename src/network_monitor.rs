//! C2 — Network Quality Monitor.
//!
//! Grounded on `original_source/src/core/network_monitor.py`: bounded
//! rolling statistics per worker, an additive 0-100 quality score, a band
//! classifier with hysteresis, and cluster-wide summaries. Reads and writes
//! share a single `parking_lot::RwLock` per the component's thread-safety
//! requirement (spec.md §4.2: "concurrent writers from C7 and readers from
//! C8").

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::WorkerId;

const RING_BUFFER_SIZE: usize = 50;
const DEFAULT_CHANGE_THRESHOLD: u32 = 3;
const DEFAULT_GRACE_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QualityBand {
    Offline,
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityBand {
    fn from_score(score: u32) -> Self {
        if score >= 80 {
            QualityBand::Excellent
        } else if score >= 60 {
            QualityBand::Good
        } else if score >= 40 {
            QualityBand::Fair
        } else if score >= 20 {
            QualityBand::Poor
        } else {
            QualityBand::Critical
        }
    }
}

struct ConnectionProfile {
    latencies_ms: VecDeque<f64>,
    rtts_ms: VecDeque<f64>,
    successes: VecDeque<bool>,
    sent: u64,
    received: u64,
    failures: u64,
    consecutive_failures: u32,
    last_successful: Option<DateTime<Utc>>,
    current_band: QualityBand,
    pending_band: Option<QualityBand>,
    streak: u32,
}

impl ConnectionProfile {
    fn new() -> Self {
        Self {
            latencies_ms: VecDeque::with_capacity(RING_BUFFER_SIZE),
            rtts_ms: VecDeque::with_capacity(RING_BUFFER_SIZE),
            successes: VecDeque::with_capacity(RING_BUFFER_SIZE),
            sent: 0,
            received: 0,
            failures: 0,
            consecutive_failures: 0,
            last_successful: None,
            current_band: QualityBand::Fair,
            pending_band: None,
            streak: 0,
        }
    }

    fn push_ring<T>(buf: &mut VecDeque<T>, value: T) {
        if buf.len() == RING_BUFFER_SIZE {
            buf.pop_front();
        }
        buf.push_back(value);
    }

    fn record(&mut self, latency_ms: f64, success: bool, rtt_ms: f64, now: DateTime<Utc>) {
        Self::push_ring(&mut self.latencies_ms, latency_ms);
        Self::push_ring(&mut self.rtts_ms, rtt_ms);
        Self::push_ring(&mut self.successes, success);
        self.sent += 1;
        if success {
            self.received += 1;
            self.consecutive_failures = 0;
            self.last_successful = Some(now);
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
        }
    }

    fn mean_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.failures as f64 / self.sent as f64
        }
    }

    fn success_rate(&self) -> f64 {
        if self.sent == 0 {
            1.0
        } else {
            self.received as f64 / self.sent as f64
        }
    }

    /// Additive 0-100 score (spec.md §4.2).
    fn quality_score(&self) -> u32 {
        let mean_latency = self.mean_latency_ms();
        let latency_score = if mean_latency < 50.0 {
            40.0
        } else {
            (40.0 * (300.0 - mean_latency) / 250.0).clamp(0.0, 40.0)
        };
        let loss_score = (30.0 * (1.0 - 10.0 * self.loss_rate())).clamp(0.0, 30.0);
        let reliability_score = (30.0 * self.success_rate()).clamp(0.0, 30.0);
        (latency_score + loss_score + reliability_score).round().clamp(0.0, 100.0) as u32
    }
}

#[derive(Debug, Clone)]
pub struct WorkerQualitySnapshot {
    pub band: QualityBand,
    pub quality_score: u32,
    pub mean_latency_ms: f64,
    pub reliability: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSummary {
    pub band_histogram: HashMap<&'static str, usize>,
    pub average_quality_score: f64,
    pub healthy_count: usize,
    pub problematic_count: usize,
    pub total: usize,
}

pub struct NetworkQualityMonitor {
    profiles: RwLock<HashMap<WorkerId, ConnectionProfile>>,
    change_threshold: u32,
    grace_seconds: i64,
}

impl NetworkQualityMonitor {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_CHANGE_THRESHOLD, DEFAULT_GRACE_SECONDS)
    }

    pub fn with_params(change_threshold: u32, grace_seconds: i64) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            change_threshold,
            grace_seconds,
        }
    }

    /// Record one communication attempt and re-run the (hysteresis-gated)
    /// band classifier for that worker.
    pub fn record(&self, worker: &str, latency_ms: f64, success: bool, rtt_ms: f64) {
        let mut profiles = self.profiles.write();
        let profile = profiles
            .entry(worker.to_string())
            .or_insert_with(ConnectionProfile::new);
        profile.record(latency_ms, success, rtt_ms, Utc::now());
        self.classify_locked(profile);
    }

    /// Re-evaluate every known worker against the grace deadline without a
    /// new sample, so an offline transition can happen purely from elapsed
    /// time (spec.md §4.2: "A background evaluator may periodically
    /// re-classify against the grace deadline").
    pub fn reevaluate_grace_deadlines(&self) {
        let mut profiles = self.profiles.write();
        for profile in profiles.values_mut() {
            self.classify_locked(profile);
        }
    }

    /// Apply the grace-deadline override and hysteresis state machine. The
    /// grace override bypasses hysteresis entirely: it reflects the
    /// deadline directly, not a noisy sample.
    fn classify_locked(&self, profile: &mut ConnectionProfile) {
        let now = Utc::now();
        let past_grace = match profile.last_successful {
            Some(ts) => (now - ts).num_seconds() > self.grace_seconds,
            None => true,
        };
        if past_grace {
            profile.current_band = QualityBand::Offline;
            profile.pending_band = None;
            profile.streak = 0;
            return;
        }

        let proposed = QualityBand::from_score(profile.quality_score());
        if proposed == profile.current_band {
            profile.pending_band = None;
            profile.streak = 0;
            return;
        }
        if profile.pending_band == Some(proposed) {
            profile.streak += 1;
        } else {
            profile.pending_band = Some(proposed);
            profile.streak = 1;
        }
        if profile.streak >= self.change_threshold {
            profile.current_band = proposed;
            profile.pending_band = None;
            profile.streak = 0;
        }
    }

    /// Snapshot for one worker; missing workers read as offline (never
    /// raises, per the component's failure model).
    pub fn snapshot(&self, worker: &str) -> WorkerQualitySnapshot {
        let profiles = self.profiles.read();
        match profiles.get(worker) {
            Some(profile) => WorkerQualitySnapshot {
                band: profile.current_band,
                quality_score: profile.quality_score(),
                mean_latency_ms: profile.mean_latency_ms(),
                reliability: profile.success_rate(),
            },
            None => WorkerQualitySnapshot {
                band: QualityBand::Offline,
                quality_score: 0,
                mean_latency_ms: 0.0,
                reliability: 0.0,
            },
        }
    }

    pub fn nodes_at_least(&self, band: QualityBand) -> Vec<WorkerId> {
        self.profiles
            .read()
            .iter()
            .filter(|(_, p)| p.current_band >= band)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn nodes_at_most(&self, band: QualityBand) -> Vec<WorkerId> {
        self.profiles
            .read()
            .iter()
            .filter(|(_, p)| p.current_band <= band)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn problematic(&self) -> Vec<WorkerId> {
        self.nodes_at_most(QualityBand::Poor)
    }

    pub fn reliable(&self) -> Vec<WorkerId> {
        self.nodes_at_least(QualityBand::Good)
    }

    pub fn cluster_summary(&self) -> ClusterSummary {
        let profiles = self.profiles.read();
        let mut summary = ClusterSummary {
            total: profiles.len(),
            ..Default::default()
        };
        if profiles.is_empty() {
            return summary;
        }
        let mut score_sum = 0u64;
        for profile in profiles.values() {
            let label = match profile.current_band {
                QualityBand::Offline => "offline",
                QualityBand::Critical => "critical",
                QualityBand::Poor => "poor",
                QualityBand::Fair => "fair",
                QualityBand::Good => "good",
                QualityBand::Excellent => "excellent",
            };
            *summary.band_histogram.entry(label).or_insert(0) += 1;
            score_sum += profile.quality_score() as u64;
            if profile.current_band >= QualityBand::Good {
                summary.healthy_count += 1;
            }
            if profile.current_band <= QualityBand::Poor {
                summary.problematic_count += 1;
            }
        }
        summary.average_quality_score = score_sum as f64 / profiles.len() as f64;
        summary
    }
}

impl Default for NetworkQualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
