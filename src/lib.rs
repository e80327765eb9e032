//! # TPU Embedding Layers
//!
//! Layer bindings for a coprocessor-sharded embedding API.
//!
//! Very large embedding tables can be trained by sharding them across the
//! memory of an accelerator coprocessor topology. This crate exposes that
//! capability through the surrounding framework's layer conventions: a
//! [`TpuEmbeddingLayer`] declares tables and input keys, and the
//! training-step executor drives an [`EmbeddingManager`] through an
//! enqueue / dequeue / lookup / apply-gradients cycle each step.
//!
//! The hard parts — table sharding, host-coprocessor communication, and
//! gradient pipelining — live entirely behind the [`EmbeddingCoordinator`]
//! trait, implemented by the vendor embedding library. This crate
//! translates configuration into that API's descriptor types, caches each
//! step's dequeued activations for keyed lookups, and provides a host-side
//! CPU lookup for evaluation and inference.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tpu_embedding_layers::{
//!     ConstantSchedule, EmbeddingManager, RecordingTape, TableConfig,
//!     TpuEmbeddingLayer, TpuEmbeddingLayerParams,
//! };
//! # use tpu_embedding_layers::{CoordinatorSpec, IdBatch, Result};
//! # fn vendor_coordinator(
//! #     _spec: &CoordinatorSpec,
//! # ) -> Result<Arc<dyn tpu_embedding_layers::EmbeddingCoordinator<f32>>> {
//! #     unimplemented!()
//! # }
//!
//! # fn main() -> tpu_embedding_layers::Result<()> {
//! let layer = TpuEmbeddingLayer::<f32>::new(
//!     TpuEmbeddingLayerParams::new()
//!         .with_table(TableConfig::new("users", 1 << 20, 128).with_input_key("user_id"))
//!         .with_batch_size(4096)
//!         .with_learning_rate(0.05)
//!         .with_lr_schedule(Arc::new(ConstantSchedule::new(1.0)))
//!         .with_gradient_multiplier_schedule(Arc::new(ConstantSchedule::new(1.0))),
//! )?;
//!
//! let mut manager = EmbeddingManager::new();
//! layer.create_layer_variables(&mut manager, vendor_coordinator)?;
//!
//! // Per training step:
//! let batch = IdBatch::new();
//! let mut tape = RecordingTape::new();
//! manager.enqueue(&batch)?;
//! manager.dequeue(&mut tape)?;
//! let activations = layer.emb_lookup(&manager, &batch)?;
//! # let _ = activations;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod layer;
pub mod manager;
pub mod optimizer;
pub mod schedule;
pub mod table;
pub mod tape;

pub use coordinator::{
    Activations, CoordinatorSpec, EmbeddingCoordinator, FeatureDescriptor, Gradients, IdBatch,
    OptimizerDescriptor, TableDescriptor,
};
pub use error::{EmbeddingError, Result};
pub use layer::{TpuEmbeddingLayer, TpuEmbeddingLayerParams};
pub use manager::{
    EmbeddingManager, MetricsMap, SummaryEntry, ACTIVATION_NORM_METRIC, GRADIENT_MULTIPLIER_METRIC,
    GRAD_NORM_METRIC,
};
pub use optimizer::{AdagradParams, AdamParams, EmbeddingOptimizer};
pub use schedule::{
    ConstantSchedule, ExponentialDecaySchedule, PolynomialDecaySchedule, Schedule,
};
pub use table::{Combiner, PartitionStrategy, RunMode, TableConfig};
pub use tape::{GradientTape, RecordingTape};
