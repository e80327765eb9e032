//! The coordinator handle shared by embedding layers and the step executor.
//!
//! [`EmbeddingManager`] holds at most one reference to the externally
//! constructed coordinator and gates every operation behind its `enabled`
//! flag: while disabled, all operations are no-ops returning empty results,
//! so the training-step executor never branches on whether the model uses
//! the coprocessor embedding path at all.
//!
//! The manager is an explicit handle owned by the executor and threaded
//! through to the layers that need it; tests can construct as many
//! independent instances as they want.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use log::{info, warn};
use num_traits::{Float, FromPrimitive};

use crate::coordinator::{Activations, EmbeddingCoordinator, Gradients, IdBatch};
use crate::error::{EmbeddingError, Result};
use crate::schedule::Schedule;
use crate::tape::GradientTape;

/// L2 norm of the cached activations, reported by `apply_gradients`.
pub const ACTIVATION_NORM_METRIC: &str = "tpu_embedding_activation_norm";
/// L2 norm of the scaled gradients, reported by `apply_gradients`.
pub const GRAD_NORM_METRIC: &str = "tpu_embedding_grad_norm";
/// The gradient multiplier itself, reported by `apply_gradients`.
pub const GRADIENT_MULTIPLIER_METRIC: &str = "tpu_embedding_gradient_multiplier";

/// Metric name -> (value, weight) for downstream weighted averaging.
pub type MetricsMap = HashMap<String, (f32, f32)>;

/// One named scalar recorded for summary reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    pub name: String,
    pub value: f32,
    pub weight: f32,
}

/// Handle around the vendor embedding coordinator.
///
/// Lives for the whole training run; `enabled` and the coordinator
/// reference are set once when the first consuming layer builds its
/// coprocessor variables and never reverted.
pub struct EmbeddingManager<T> {
    enabled: bool,
    coordinator: OnceLock<Arc<dyn EmbeddingCoordinator<T>>>,
    feature_names: BTreeSet<String>,
    sequence_features: BTreeSet<String>,
    gradient_multiplier_schedule: Option<Arc<dyn Schedule>>,
    global_step: u64,
    summary_entries: Vec<SummaryEntry>,
    /// Activations cached on dequeue for later keyed lookups, replaced
    /// wholesale every step.
    activations: Activations<T>,
}

impl<T> Default for EmbeddingManager<T> {
    fn default() -> Self {
        Self {
            enabled: false,
            coordinator: OnceLock::new(),
            feature_names: BTreeSet::new(),
            sequence_features: BTreeSet::new(),
            gradient_multiplier_schedule: None,
            global_step: 0,
            summary_entries: Vec::new(),
            activations: Activations::new(),
        }
    }
}

impl<T> EmbeddingManager<T>
where
    T: Float + FromPrimitive,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the coprocessor embedding path is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Activate the coprocessor path. Called once at layer construction.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Store the coordinator reference. Settable exactly once per handle;
    /// a second call is a fatal caller mistake.
    pub fn set_coordinator(&mut self, coordinator: Arc<dyn EmbeddingCoordinator<T>>) -> Result<()> {
        self.coordinator
            .set(coordinator)
            .map_err(|_| EmbeddingError::AlreadyInitialized)?;
        info!("embedding coordinator installed");
        Ok(())
    }

    pub fn coordinator(&self) -> Option<&Arc<dyn EmbeddingCoordinator<T>>> {
        self.coordinator.get()
    }

    /// The universe of valid lookup keys across all tables.
    pub fn feature_names(&self) -> &BTreeSet<String> {
        &self.feature_names
    }

    pub fn set_feature_names(&mut self, feature_names: BTreeSet<String>) {
        self.feature_names = feature_names;
    }

    /// Features returning unpadded per-position activations.
    pub fn sequence_features(&self) -> &BTreeSet<String> {
        &self.sequence_features
    }

    pub fn set_sequence_features(&mut self, features: BTreeSet<String>) {
        self.sequence_features = features;
    }

    pub fn set_gradient_multiplier_schedule(&mut self, schedule: Arc<dyn Schedule>) {
        self.gradient_multiplier_schedule = Some(schedule);
    }

    /// Executor-maintained global step, read by learning-rate and gradient
    /// multiplier schedules.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn set_global_step(&mut self, step: u64) {
        self.global_step = step;
    }

    /// Append a named scalar with weight 1.0 for summary reporting.
    pub fn add_summary_tensor(&mut self, name: impl Into<String>, value: f32) {
        self.add_summary_tensor_weighted(name, value, 1.0);
    }

    pub fn add_summary_tensor_weighted(&mut self, name: impl Into<String>, value: f32, weight: f32) {
        self.summary_entries.push(SummaryEntry {
            name: name.into(),
            value,
            weight,
        });
    }

    pub fn summary_tensors(&self) -> &[SummaryEntry] {
        &self.summary_entries
    }

    /// Enqueue the current batch's per-feature id tensors to the
    /// coprocessor.
    ///
    /// The activation cache is cleared even when disabled, so the cache
    /// never outlives the step that produced it.
    pub fn enqueue(&mut self, batch: &IdBatch) -> Result<()> {
        self.activations.clear();
        if self.enabled {
            if let Some(coordinator) = self.coordinator.get() {
                coordinator.enqueue(batch)?;
            }
        }
        Ok(())
    }

    /// Dequeue this step's activations from the coprocessor.
    ///
    /// Call exactly once per training step, before any `lookup`. The
    /// dequeued tensors are cached for keyed lookups and watched on the
    /// executor's tape so they participate in the backward pass. Returns
    /// the (possibly empty) cache.
    pub fn dequeue(&mut self, tape: &mut dyn GradientTape<T>) -> Result<&Activations<T>> {
        if self.enabled {
            if let Some(coordinator) = self.coordinator.get() {
                self.activations = coordinator.dequeue()?;
                for (name, values) in &self.activations {
                    tape.watch(name, values);
                }
            }
        }
        Ok(&self.activations)
    }

    /// Activations for the requested keys, from the cache filled by
    /// `dequeue`.
    ///
    /// With `keys`, returns the intersection of the request and the cache;
    /// keys absent from the cache are silently omitted. Without `keys` (or
    /// when disabled) the full cache is returned unchanged.
    pub fn lookup(&self, keys: Option<&BTreeSet<String>>) -> Activations<T> {
        match keys {
            Some(keys) if self.enabled => self
                .activations
                .iter()
                .filter(|(name, _)| keys.contains(*name))
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
            _ => self.activations.clone(),
        }
    }

    /// Current activation cache, as last filled by `dequeue`.
    pub fn cached_activations(&self) -> &Activations<T> {
        &self.activations
    }

    /// Scale gradients by the multiplier schedule and hand them to the
    /// coprocessor.
    ///
    /// Returns an empty map when disabled. Otherwise reports the activation
    /// norm, the scaled gradient norm, and the multiplier, each weighted
    /// 1.0 for downstream weighted averaging.
    pub fn apply_gradients(&mut self, gradients: &Gradients<T>) -> Result<MetricsMap> {
        if !self.enabled {
            return Ok(MetricsMap::new());
        }

        let multiplier = match &self.gradient_multiplier_schedule {
            Some(schedule) => schedule.value(self.global_step),
            None => {
                warn!("no gradient multiplier schedule set, applying gradients unscaled");
                1.0
            }
        };
        let multiplier_t = T::from_f32(multiplier).unwrap_or_else(T::one);

        let scaled: Gradients<T> = gradients
            .iter()
            .map(|(name, grad)| (name.clone(), grad.mapv(|g| g * multiplier_t)))
            .collect();

        if let Some(coordinator) = self.coordinator.get() {
            coordinator.apply_gradients(&scaled)?;
        }

        let mut metrics = MetricsMap::new();
        metrics.insert(
            ACTIVATION_NORM_METRIC.to_string(),
            (l2_norm(self.activations.values()), 1.0),
        );
        metrics.insert(GRAD_NORM_METRIC.to_string(), (l2_norm(scaled.values()), 1.0));
        metrics.insert(GRADIENT_MULTIPLIER_METRIC.to_string(), (multiplier, 1.0));
        Ok(metrics)
    }
}

/// L2 norm over every element of every tensor in the mapping.
fn l2_norm<'a, T, I>(tensors: I) -> f32
where
    T: Float + 'a,
    I: Iterator<Item = &'a ndarray::ArrayD<T>>,
{
    let sum_squared: f64 = tensors
        .flat_map(|values| values.iter())
        .map(|v| {
            let v = v.to_f64().unwrap_or(0.0);
            v * v
        })
        .sum();
    sum_squared.sqrt() as f32
}
