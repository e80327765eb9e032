//! The seam to the external coprocessor embedding library.
//!
//! All sharding, placement, collective communication, and gradient
//! accumulation live behind [`EmbeddingCoordinator`]; this crate only
//! translates configuration into the descriptor types below and moves
//! batches across the trait boundary.

use std::collections::{BTreeMap, HashMap};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::table::Combiner;

/// Per-feature batches of embedding ids, keyed by input key.
pub type IdBatch = HashMap<String, ArrayD<i64>>;

/// Per-feature embedding activations, keyed by input key.
pub type Activations<T> = HashMap<String, ArrayD<T>>;

/// Per-feature gradients with respect to the activations.
pub type Gradients<T> = HashMap<String, ArrayD<T>>;

/// Optimizer configuration handed verbatim to the coordinator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerDescriptor {
    Adagrad {
        learning_rate: f32,
        initial_accumulator: f32,
        use_gradient_accumulation: bool,
        weight_decay_factor: Option<f32>,
        multiply_weight_decay_factor_by_learning_rate: bool,
        clip_weight: (Option<f32>, Option<f32>),
        clip_gradient: (Option<f32>, Option<f32>),
    },
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        lazy_adam: bool,
        sum_inside_sqrt: bool,
        use_gradient_accumulation: bool,
        weight_decay_factor: Option<f32>,
        multiply_weight_decay_factor_by_learning_rate: bool,
        clip_weight: (Option<f32>, Option<f32>),
        clip_gradient: (Option<f32>, Option<f32>),
    },
}

/// One sharded embedding table as the coordinator API sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Vocabulary size after shard-alignment padding.
    pub vocabulary_size: usize,
    pub dim: usize,
    pub combiner: Combiner,
    pub optimizer: OptimizerDescriptor,
}

/// One lookup feature, pointing at its table.
///
/// Sequence features carry an explicit `[batch, max_sequence_length]` output
/// shape so the coordinator returns unpadded per-position activations;
/// combined features leave it unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub table: String,
    pub output_shape: Option<[usize; 2]>,
}

/// Everything the caller needs to construct the vendor coordinator object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSpec {
    pub tables: Vec<TableDescriptor>,
    pub features: BTreeMap<String, FeatureDescriptor>,
    /// Layer-level default optimizer for tables the API requires one for.
    pub optimizer: OptimizerDescriptor,
    pub pipeline_execution_with_tensor_core: bool,
}

/// The wrapped coprocessor embedding library.
///
/// Implementations own the distributed state; calls here are forwarded by
/// the manager once per training step in enqueue / dequeue /
/// apply_gradients order.
pub trait EmbeddingCoordinator<T>: Send + Sync {
    /// Enqueue one batch of per-feature id tensors for the current step.
    fn enqueue(&self, batch: &IdBatch) -> Result<()>;

    /// Dequeue the activations for the batch most recently enqueued.
    fn dequeue(&self) -> Result<Activations<T>>;

    /// Apply (already scaled) gradients to the sharded embedding variables.
    fn apply_gradients(&self, gradients: &Gradients<T>) -> Result<()>;
}
