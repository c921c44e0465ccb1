//! Shared data model: worker identity, parameter sets, and gradient
//! submissions. Grounded on `daa-compute/src/training/mod.rs`'s
//! `ModelParameters`/`Gradient` pair, generalized to the ordered
//! multi-parameter mapping `spec.md` §3 describes, and on
//! `original_source/src/models/node.py`'s `NodeMetadata`/`NodeStatus`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Stable opaque worker identifier.
pub type WorkerId = String;

/// Worker operational status (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Training,
    Idle,
    Degraded,
    Offline,
    Error,
}

impl WorkerStatus {
    /// `ready`, `training`, and `idle` workers are eligible for selection
    /// (spec.md §3 invariant: "Worker status in {ready, training, idle} ⇒
    /// worker is eligible").
    pub fn is_eligible(self) -> bool {
        matches!(self, Self::Ready | Self::Training | Self::Idle)
    }
}

/// Declared worker capability, carried for informational purposes (§3.1 of
/// SPEC_FULL.md; not consumed by any invariant).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub memory_gb: f32,
    pub compute_factor: f32,
}

impl Default for WorkerCapability {
    fn default() -> Self {
        Self {
            memory_gb: 8.0,
            compute_factor: 1.0,
        }
    }
}

/// Per-parameter tensor shape (row-major dense array, dtype left to the
/// worker-side capability per spec.md's non-goals).
pub type Shape = Vec<usize>;

/// An ordered mapping from parameter name to a dense numeric array, with the
/// key order fixed once at session start so aggregation order is auditable
/// (Design Notes: "dynamic dictionaries as both containers and record
/// types" re-architected into a fixed ordered mapping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    order: Vec<String>,
    shapes: HashMap<String, Shape>,
    values: HashMap<String, Vec<f32>>,
    pub version: u64,
    pub hash: String,
}

impl ParameterSet {
    /// Construct a fresh parameter set at version 0 from an ordered list of
    /// (name, initial values, shape).
    pub fn new(params: Vec<(String, Vec<f32>, Shape)>) -> Self {
        let mut order = Vec::with_capacity(params.len());
        let mut shapes = HashMap::with_capacity(params.len());
        let mut values = HashMap::with_capacity(params.len());
        for (name, vals, shape) in params {
            order.push(name.clone());
            shapes.insert(name.clone(), shape);
            values.insert(name, vals);
        }
        let mut set = Self {
            order,
            shapes,
            values,
            version: 0,
            hash: String::new(),
        };
        set.rehash();
        set
    }

    /// Parameter names in the fixed order established at construction.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn shape_of(&self, name: &str) -> Option<&Shape> {
        self.shapes.get(name)
    }

    pub fn values_of(&self, name: &str) -> Option<&[f32]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Content-addressed digest, stable across equivalent bit content.
    fn rehash(&mut self) {
        let mut hasher = blake3::Hasher::new();
        for name in &self.order {
            hasher.update(name.as_bytes());
            if let Some(vals) = self.values.get(name) {
                for v in vals {
                    hasher.update(&v.to_le_bytes());
                }
            }
        }
        self.hash = hasher.finalize().to_hex().to_string();
    }

    /// Apply an elementwise SGD step from an aggregated gradient, bump the
    /// parameter version, and recompute the content digest. Only
    /// elementwise weighted averaging and this clip/apply step are within
    /// scope for gradient math (spec.md's non-goals).
    pub fn apply_gradient(&mut self, gradient: &HashMap<String, Vec<f32>>, learning_rate: f32) {
        for name in &self.order {
            let (Some(grad), Some(values)) = (gradient.get(name), self.values.get_mut(name))
            else {
                continue;
            };
            for (v, g) in values.iter_mut().zip(grad.iter()) {
                *v -= learning_rate * g;
            }
        }
        self.version += 1;
        self.rehash();
    }
}

/// Optional per-submission metadata (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GradientMeta {
    pub samples: Option<u64>,
    pub local_loss: Option<f32>,
    pub compute_time_seconds: Option<f64>,
    pub gradient_norm: Option<f32>,
}

/// A worker's gradient submission for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientSubmission {
    pub round: u64,
    pub worker: WorkerId,
    pub grads: HashMap<String, Vec<f32>>,
    pub meta: GradientMeta,
}

/// L2 norm of a flattened gradient map, in the fixed parameter order.
pub fn gradient_l2_norm(order: &[String], grads: &HashMap<String, Vec<f32>>) -> f32 {
    let mut sum_sq = 0.0f64;
    for name in order {
        if let Some(values) = grads.get(name) {
            for v in values {
                sum_sq += (*v as f64) * (*v as f64);
            }
        }
    }
    sum_sq.sqrt() as f32
}

/// Scale a gradient map in place so its global L2 norm does not exceed
/// `clip_value` (no-op if already within bound).
pub fn clip_gradient_global_norm(
    order: &[String],
    grads: &mut HashMap<String, Vec<f32>>,
    clip_value: f32,
) {
    let norm = gradient_l2_norm(order, grads);
    if norm <= clip_value || norm == 0.0 {
        return;
    }
    let scale = clip_value / norm;
    for values in grads.values_mut() {
        for v in values.iter_mut() {
            *v *= scale;
        }
    }
}
