//! The embedding layer consumed by model code.
//!
//! The layer validates table configuration up front, builds the coordinator
//! construction spec during its one-time variable construction, and serves
//! `emb_lookup` either from the manager's activation cache (coprocessor
//! training) or from the tables' host-side weights (CPU evaluation and
//! inference).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, info};
use num_traits::{Float, FromPrimitive};

use crate::coordinator::{
    Activations, CoordinatorSpec, EmbeddingCoordinator, FeatureDescriptor, IdBatch,
};
use crate::error::{EmbeddingError, Result};
use crate::manager::EmbeddingManager;
use crate::optimizer::EmbeddingOptimizer;
use crate::schedule::Schedule;
use crate::table::{PartitionStrategy, RunMode, TableConfig};

/// Construction parameters for [`TpuEmbeddingLayer`].
///
/// Optimizer, learning rate, and learning-rate schedule set here act as
/// defaults for tables that do not carry their own.
pub struct TpuEmbeddingLayerParams<T> {
    pub tables: Vec<TableConfig<T>>,
    pub batch_size: usize,
    pub mode: RunMode,
    pub partition_strategy: PartitionStrategy,
    pub optimizer: Option<EmbeddingOptimizer>,
    pub learning_rate: Option<f32>,
    pub lr_schedule: Option<Arc<dyn Schedule>>,
    pub gradient_multiplier_schedule: Option<Arc<dyn Schedule>>,
    pub pipeline_execution_with_tensor_core: bool,
}

impl<T> Default for TpuEmbeddingLayerParams<T> {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            batch_size: 0,
            mode: RunMode::default(),
            partition_strategy: PartitionStrategy::default(),
            optimizer: Some(EmbeddingOptimizer::default()),
            learning_rate: None,
            lr_schedule: None,
            gradient_multiplier_schedule: None,
            pipeline_execution_with_tensor_core: false,
        }
    }
}

impl<T> TpuEmbeddingLayerParams<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableConfig<T>) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_partition_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.partition_strategy = strategy;
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

    pub fn with_gradient_multiplier_schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.gradient_multiplier_schedule = Some(schedule);
        self
    }

    pub fn with_pipeline_execution_with_tensor_core(mut self, enabled: bool) -> Self {
        self.pipeline_execution_with_tensor_core = enabled;
        self
    }
}

/// Interface to the coprocessor-sharded embedding tables.
///
/// All consuming features must be declared on the tables upfront; lookups
/// for undeclared keys are a configuration error.
pub struct TpuEmbeddingLayer<T> {
    tables: Vec<TableConfig<T>>,
    batch_size: usize,
    mode: RunMode,
    partition_strategy: PartitionStrategy,
    optimizer: EmbeddingOptimizer,
    learning_rate: Option<f32>,
    gradient_multiplier_schedule: Arc<dyn Schedule>,
    pipeline_execution_with_tensor_core: bool,
    valid_keys: BTreeSet<String>,
}

impl<T> TpuEmbeddingLayer<T>
where
    T: Float + FromPrimitive,
{
    /// Validate parameters and build the layer. All configuration errors
    /// here are fatal; they indicate a caller mistake.
    pub fn new(params: TpuEmbeddingLayerParams<T>) -> Result<Self> {
        if params.tables.is_empty() {
            return Err(EmbeddingError::invalid_config("no embedding tables given"));
        }
        if params.batch_size == 0 {
            return Err(EmbeddingError::invalid_config("batch size must be positive"));
        }
        let gradient_multiplier_schedule = params
            .gradient_multiplier_schedule
            .ok_or_else(|| EmbeddingError::invalid_config("no gradient multiplier schedule given"))?;

        // Fill in per-table optimizer parameters from the layer level; a
        // table missing them with no layer-level default is an error.
        let mut tables = params.tables;
        for table in &mut tables {
            if table.optimizer.is_none() {
                table.optimizer = Some(params.optimizer.clone().ok_or_else(|| {
                    EmbeddingError::invalid_config(format!(
                        "table '{}' is missing optimizer parameters, and no layer-level \
                         optimizer was given",
                        table.name()
                    ))
                })?);
            }
            if table.learning_rate.is_none() {
                table.learning_rate = Some(params.learning_rate.ok_or_else(|| {
                    EmbeddingError::invalid_config(format!(
                        "table '{}' is missing a learning rate, and no layer-level \
                         learning rate was given",
                        table.name()
                    ))
                })?);
            }
            if table.lr_schedule.is_none() {
                table.lr_schedule = Some(params.lr_schedule.clone().ok_or_else(|| {
                    EmbeddingError::invalid_config(format!(
                        "table '{}' is missing a learning-rate schedule, and no layer-level \
                         schedule was given",
                        table.name()
                    ))
                })?);
            }
            table.validate()?;
        }

        // Every input key must belong to exactly one table.
        let mut key_counts: HashMap<&str, usize> = HashMap::new();
        for table in &tables {
            for key in table.input_keys() {
                *key_counts.entry(key).or_insert(0) += 1;
            }
        }
        if let Some((key, _)) = key_counts.iter().find(|(_, count)| **count > 1) {
            return Err(EmbeddingError::duplicate_feature(*key));
        }
        let valid_keys: BTreeSet<String> = key_counts.keys().map(|k| k.to_string()).collect();

        debug!(
            "embedding layer configured: {} tables, {} input keys",
            tables.len(),
            valid_keys.len()
        );

        Ok(Self {
            tables,
            batch_size: params.batch_size,
            mode: params.mode,
            partition_strategy: params.partition_strategy,
            optimizer: params.optimizer.unwrap_or_default(),
            learning_rate: params.learning_rate,
            gradient_multiplier_schedule,
            pipeline_execution_with_tensor_core: params.pipeline_execution_with_tensor_core,
            valid_keys,
        })
    }

    pub fn tables(&self) -> &[TableConfig<T>] {
        &self.tables
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn partition_strategy(&self) -> PartitionStrategy {
        self.partition_strategy
    }

    /// One-time coprocessor variable construction.
    ///
    /// Builds the coordinator construction spec, hands it to `build` (the
    /// vendor API construction point), then installs the result on the
    /// manager and enables it. Several layers may share one coordinator:
    /// the first layer to get here builds it and later calls are no-ops.
    /// Does nothing outside coprocessor training.
    pub fn create_layer_variables<F>(
        &self,
        manager: &mut EmbeddingManager<T>,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(&CoordinatorSpec) -> Result<Arc<dyn EmbeddingCoordinator<T>>>,
    {
        if self.mode != RunMode::Train {
            return Ok(());
        }
        if manager.is_enabled() {
            return Ok(());
        }

        let mut features = BTreeMap::new();
        let mut sequence_features = BTreeSet::new();
        for table in &self.tables {
            for key in table.input_keys() {
                let output_shape = if table.is_sequence() {
                    sequence_features.insert(key.clone());
                    Some([self.batch_size, table.max_sequence_length()])
                } else {
                    None
                };
                features.insert(
                    key.clone(),
                    FeatureDescriptor {
                        table: table.name().to_string(),
                        output_shape,
                    },
                );
            }
        }

        let mut table_descriptors = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            table_descriptors.push(table.descriptor(manager)?);
        }

        let spec = CoordinatorSpec {
            tables: table_descriptors,
            features,
            optimizer: self
                .optimizer
                .descriptor(self.learning_rate.unwrap_or(1.0)),
            pipeline_execution_with_tensor_core: self.pipeline_execution_with_tensor_core,
        };

        let coordinator = build(&spec)?;
        manager.set_coordinator(coordinator)?;
        manager.set_feature_names(self.valid_keys.clone());
        manager.set_sequence_features(sequence_features);
        manager.set_gradient_multiplier_schedule(self.gradient_multiplier_schedule.clone());
        manager.enable();

        info!(
            "coprocessor embedding enabled: {} tables, {} features",
            self.tables.len(),
            self.valid_keys.len()
        );
        Ok(())
    }

    /// Check that every key in `ids_map` was declared by some table.
    pub fn check_ids_map(&self, ids_map: &IdBatch) -> Result<()> {
        let mut invalid: Vec<String> = ids_map
            .keys()
            .filter(|key| !self.valid_keys.contains(*key))
            .cloned()
            .collect();
        if invalid.is_empty() {
            return Ok(());
        }
        invalid.sort();
        Err(EmbeddingError::InvalidKeys {
            invalid,
            valid: self.valid_keys.iter().cloned().collect(),
        })
    }

    /// Look up embedding activations for each entry in `ids_map`.
    ///
    /// During coprocessor training this serves slices of the activations
    /// the manager cached on dequeue; the ids themselves were consumed by
    /// the step's enqueue. Outside training it falls back to the tables'
    /// host-side weights.
    pub fn emb_lookup(
        &self,
        manager: &EmbeddingManager<T>,
        ids_map: &IdBatch,
    ) -> Result<Activations<T>> {
        self.check_ids_map(ids_map)?;

        if self.mode == RunMode::Train {
            let keys: BTreeSet<String> = ids_map.keys().cloned().collect();
            return Ok(manager.lookup(Some(&keys)));
        }

        let mut activations = Activations::new();
        for table in &self.tables {
            let slice: IdBatch = ids_map
                .iter()
                .filter(|(key, _)| table.input_keys().iter().any(|k| k == *key))
                .map(|(key, ids)| (key.clone(), ids.clone()))
                .collect();
            if slice.is_empty() {
                continue;
            }
            activations.extend(table.cpu_lookup(&slice)?);
        }
        Ok(activations)
    }
}
