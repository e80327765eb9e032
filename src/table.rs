//! Embedding table configuration and the host-side fallback lookup.
//!
//! A [`TableConfig`] describes one logical embedding table: its vocabulary,
//! dimension, combiner, the input keys that read it, and the optimizer used
//! to train it on the coprocessor. It also owns a host-side copy of the
//! weights used for CPU evaluation lookups, where no coordinator is
//! involved.

use std::sync::Arc;

use ndarray::{s, Array1, Array2, Array3, ArrayD, Ix2};
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};

use crate::coordinator::{Activations, IdBatch, TableDescriptor};
use crate::error::{EmbeddingError, Result};
use crate::manager::EmbeddingManager;
use crate::optimizer::EmbeddingOptimizer;
use crate::schedule::Schedule;

/// Shards are padded to a multiple of this many rows.
const VOCAB_PAD_MULTIPLE: usize = 8;

/// How multiple ids per example are reduced into one activation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combiner {
    Sum,
    Mean,
    SqrtN,
}

impl Default for Combiner {
    fn default() -> Self {
        Self::Mean
    }
}

/// How ids are assigned to shards in multi-shard lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    Mod,
    Div,
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        Self::Mod
    }
}

/// Execution mode of the consuming model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Train,
    Eval,
    Inference,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Train
    }
}

/// Configuration of one coprocessor-sharded embedding table.
///
/// All input keys must be declared upfront. A table with
/// `max_sequence_length > 0` is a sequence table: its features return one
/// activation row per position and padding ids are not supported. Other
/// tables combine each example's ids with [`Combiner`], using `-1` as the
/// padding id.
pub struct TableConfig<T> {
    pub(crate) name: String,
    pub(crate) vocabulary_size: usize,
    pub(crate) embedding_dim: usize,
    pub(crate) combiner: Combiner,
    pub(crate) max_sequence_length: usize,
    pub(crate) input_keys: Vec<String>,
    pub(crate) optimizer: Option<EmbeddingOptimizer>,
    pub(crate) learning_rate: Option<f32>,
    pub(crate) lr_schedule: Option<Arc<dyn Schedule>>,
    /// Host-side weight copy backing CPU evaluation lookups.
    weights: Array2<T>,
}

impl<T> TableConfig<T>
where
    T: Float + FromPrimitive,
{
    pub fn new(name: impl Into<String>, vocabulary_size: usize, embedding_dim: usize) -> Self {
        Self {
            name: name.into(),
            vocabulary_size,
            embedding_dim,
            combiner: Combiner::default(),
            max_sequence_length: 0,
            input_keys: Vec::new(),
            optimizer: None,
            learning_rate: None,
            lr_schedule: None,
            weights: Array2::zeros((vocabulary_size, embedding_dim)),
        }
    }

    pub fn with_combiner(mut self, combiner: Combiner) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn with_max_sequence_length(mut self, max_sequence_length: usize) -> Self {
        self.max_sequence_length = max_sequence_length;
        self
    }

    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_keys.push(key.into());
        self
    }

    pub fn with_optimizer(mut self, optimizer: EmbeddingOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = Some(learning_rate);
        self
    }

    pub fn with_lr_schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.lr_schedule = Some(schedule);
        self
    }

    /// Replace the host-side weight copy, e.g. after a checkpoint restore.
    pub fn with_weights(mut self, weights: ArrayD<T>) -> Result<Self> {
        let weights = weights.into_dimensionality::<Ix2>().map_err(|_| {
            EmbeddingError::shape_mismatch("with_weights", "[vocabulary, dim]", "non-2D tensor")
        })?;
        if weights.dim() != (self.vocabulary_size, self.embedding_dim) {
            return Err(EmbeddingError::shape_mismatch(
                "with_weights",
                &format!("[{}, {}]", self.vocabulary_size, self.embedding_dim),
                &format!("{:?}", weights.shape()),
            ));
        }
        self.weights = weights;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary_size
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    pub fn is_sequence(&self) -> bool {
        self.max_sequence_length > 0
    }

    /// Vocabulary size rounded up for shard alignment.
    pub fn padded_vocabulary_size(&self) -> usize {
        self.vocabulary_size.div_ceil(VOCAB_PAD_MULTIPLE) * VOCAB_PAD_MULTIPLE
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocabulary_size == 0 {
            return Err(EmbeddingError::invalid_config(format!(
                "table '{}' has an empty vocabulary",
                self.name
            )));
        }
        if self.embedding_dim == 0 {
            return Err(EmbeddingError::invalid_config(format!(
                "table '{}' has embedding dim 0",
                self.name
            )));
        }
        if self.input_keys.is_empty() {
            return Err(EmbeddingError::invalid_config(format!(
                "table '{}' declares no input keys",
                self.name
            )));
        }
        if let Some(optimizer) = &self.optimizer {
            optimizer.validate()?;
        }
        Ok(())
    }

    /// Build the coordinator API table configuration.
    ///
    /// The effective learning rate is the table's base rate scaled by its
    /// schedule at the manager's current global step, and is recorded as a
    /// `tpu_embedding_lr/<table>` summary entry.
    pub fn descriptor(&self, manager: &mut EmbeddingManager<T>) -> Result<TableDescriptor> {
        let optimizer = self.optimizer.as_ref().ok_or_else(|| {
            EmbeddingError::invalid_config(format!(
                "table '{}' has no optimizer parameters",
                self.name
            ))
        })?;
        optimizer.validate()?;

        let base = self.learning_rate.ok_or_else(|| {
            EmbeddingError::invalid_config(format!("table '{}' has no learning rate", self.name))
        })?;
        let scale = self
            .lr_schedule
            .as_ref()
            .map(|schedule| schedule.value(manager.global_step()))
            .unwrap_or(1.0);
        let learning_rate = base * scale;
        manager.add_summary_tensor(format!("tpu_embedding_lr/{}", self.name), learning_rate);

        Ok(TableDescriptor {
            name: format!("{}_config", self.name),
            vocabulary_size: self.padded_vocabulary_size(),
            dim: self.embedding_dim,
            combiner: self.combiner,
            optimizer: optimizer.descriptor(learning_rate),
        })
    }

    /// Device to place the host-side sharded variables on.
    pub fn device_name(&self, mode: RunMode, host_id: usize, worker: &str) -> Result<Option<String>> {
        match mode {
            // Inference keeps variables with the rest of the model.
            RunMode::Inference => Ok(None),
            RunMode::Eval => Err(EmbeddingError::not_implemented(
                "device placement for host-driven eval programs",
            )),
            RunMode::Train => Ok(Some(format!(
                "{worker}/replica:0/task:{host_id}/device:CPU:0"
            ))),
        }
    }

    /// CPU evaluation lookup over this table's host-side weights.
    ///
    /// Map entries whose keys this table does not declare are skipped.
    /// Activation shapes: `[batch, max_sequence_length, dim]` for sequence
    /// tables, `[batch, 1, dim]` for combined tables.
    pub fn cpu_lookup(&self, ids_map: &IdBatch) -> Result<Activations<T>> {
        let mut activations: Activations<T> = Activations::new();
        for (key, ids) in ids_map {
            if !self.input_keys.iter().any(|k| k == key) {
                continue;
            }
            let values = if self.is_sequence() {
                self.sequence_lookup(ids)?
            } else {
                self.combiner_lookup(ids)?
            };
            activations.insert(key.clone(), values);
        }
        Ok(activations)
    }

    fn check_id(&self, id: i64) -> Result<usize> {
        usize::try_from(id)
            .ok()
            .filter(|&index| index < self.vocabulary_size)
            .ok_or_else(|| {
                EmbeddingError::invalid_config(format!(
                    "id {} out of range for table '{}' with vocabulary {}",
                    id, self.name, self.vocabulary_size
                ))
            })
    }

    fn ids_rank2<'a>(
        &self,
        operation: &str,
        ids: &'a ArrayD<i64>,
    ) -> Result<ndarray::ArrayView2<'a, i64>> {
        ids.view().into_dimensionality::<Ix2>().map_err(|_| {
            EmbeddingError::shape_mismatch(
                operation,
                "[batch, sequence]",
                &format!("{:?}", ids.shape()),
            )
        })
    }

    /// Sequence lookup. Padding ids are not supported here.
    fn sequence_lookup(&self, ids: &ArrayD<i64>) -> Result<ArrayD<T>> {
        let ids = self.ids_rank2("sequence_lookup", ids)?;
        let (batch, seq) = ids.dim();
        let mut out = Array3::<T>::zeros((batch, seq, self.embedding_dim));
        for b in 0..batch {
            for p in 0..seq {
                let index = self.check_id(ids[(b, p)])?;
                out.slice_mut(s![b, p, ..]).assign(&self.weights.row(index));
            }
        }
        Ok(out.into_dyn())
    }

    /// Combiner lookup. `-1` marks padding; rows with no valid ids stay zero
    /// so the batch dimension is preserved.
    fn combiner_lookup(&self, ids: &ArrayD<i64>) -> Result<ArrayD<T>> {
        let ids = self.ids_rank2("combiner_lookup", ids)?;
        let (batch, seq) = ids.dim();
        let mut out = Array3::<T>::zeros((batch, 1, self.embedding_dim));
        for b in 0..batch {
            let mut acc = Array1::<T>::zeros(self.embedding_dim);
            let mut count = 0usize;
            for p in 0..seq {
                let id = ids[(b, p)];
                if id < 0 {
                    continue;
                }
                acc = acc + &self.weights.row(self.check_id(id)?);
                count += 1;
            }
            if count == 0 {
                continue;
            }
            let scale = match self.combiner {
                Combiner::Sum => 1.0,
                Combiner::Mean => 1.0 / count as f32,
                Combiner::SqrtN => 1.0 / (count as f32).sqrt(),
            };
            let scale = T::from_f32(scale).unwrap_or_else(T::one);
            out.slice_mut(s![b, 0, ..]).assign(&acc.mapv(|v| v * scale));
        }
        Ok(out.into_dyn())
    }
}
