//! Optimizer parameter sets for coprocessor-trained embedding tables.
//!
//! Each variant translates one-to-one into the coordinator API's optimizer
//! configuration object. Tables may carry their own optimizer, or inherit
//! the layer-level default. Only Adagrad and Adam are supported; they are
//! the only optimizers the coordinator API exposes that we need.

use serde::{Deserialize, Serialize};

use crate::coordinator::OptimizerDescriptor;
use crate::error::{EmbeddingError, Result};

/// Adagrad hyperparameters for a coprocessor-held embedding table.
///
/// The learning rate is supplied separately (it is resolved per table from
/// the table's schedule) when the descriptor is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdagradParams {
    pub initial_accumulator: f32,
    pub use_gradient_accumulation: bool,
    pub weight_decay_factor: Option<f32>,
    pub multiply_weight_decay_factor_by_learning_rate: bool,
    pub clip_weight_min: Option<f32>,
    pub clip_weight_max: Option<f32>,
    pub clip_gradient_min: Option<f32>,
    pub clip_gradient_max: Option<f32>,
}

impl Default for AdagradParams {
    fn default() -> Self {
        Self {
            initial_accumulator: 0.1,
            use_gradient_accumulation: true,
            weight_decay_factor: None,
            multiply_weight_decay_factor_by_learning_rate: false,
            clip_weight_min: None,
            clip_weight_max: None,
            clip_gradient_min: None,
            clip_gradient_max: None,
        }
    }
}

impl AdagradParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_accumulator(mut self, initial_accumulator: f32) -> Self {
        self.initial_accumulator = initial_accumulator;
        self
    }

    pub fn with_weight_decay_factor(mut self, factor: f32) -> Self {
        self.weight_decay_factor = Some(factor);
        self
    }

    pub fn with_weight_clipping(mut self, min: f32, max: f32) -> Self {
        self.clip_weight_min = Some(min);
        self.clip_weight_max = Some(max);
        self
    }

    pub fn with_gradient_clipping(mut self, min: f32, max: f32) -> Self {
        self.clip_gradient_min = Some(min);
        self.clip_gradient_max = Some(max);
        self
    }
}

/// Adam hyperparameters for a coprocessor-held embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub lazy_adam: bool,
    pub sum_inside_sqrt: bool,
    pub use_gradient_accumulation: bool,
    pub weight_decay_factor: Option<f32>,
    pub multiply_weight_decay_factor_by_learning_rate: bool,
    pub clip_weight_min: Option<f32>,
    pub clip_weight_max: Option<f32>,
    pub clip_gradient_min: Option<f32>,
    pub clip_gradient_max: Option<f32>,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            lazy_adam: true,
            sum_inside_sqrt: true,
            use_gradient_accumulation: true,
            weight_decay_factor: None,
            multiply_weight_decay_factor_by_learning_rate: false,
            clip_weight_min: None,
            clip_weight_max: None,
            clip_gradient_min: None,
            clip_gradient_max: None,
        }
    }
}

impl AdamParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_lazy_adam(mut self, lazy_adam: bool) -> Self {
        self.lazy_adam = lazy_adam;
        self
    }

    pub fn with_weight_decay_factor(mut self, factor: f32) -> Self {
        self.weight_decay_factor = Some(factor);
        self
    }

    pub fn with_weight_clipping(mut self, min: f32, max: f32) -> Self {
        self.clip_weight_min = Some(min);
        self.clip_weight_max = Some(max);
        self
    }

    pub fn with_gradient_clipping(mut self, min: f32, max: f32) -> Self {
        self.clip_gradient_min = Some(min);
        self.clip_gradient_max = Some(max);
        self
    }
}

/// Optimizer selection for an embedding table or for the layer-level default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmbeddingOptimizer {
    Adagrad(AdagradParams),
    Adam(AdamParams),
}

impl Default for EmbeddingOptimizer {
    fn default() -> Self {
        Self::Adagrad(AdagradParams::default())
    }
}

impl EmbeddingOptimizer {
    /// Check hyperparameters. Invalid values are a caller mistake and fatal.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Adagrad(p) => {
                if p.initial_accumulator < 0.0 {
                    return Err(EmbeddingError::invalid_config(format!(
                        "Adagrad initial accumulator must be non-negative, got {}",
                        p.initial_accumulator
                    )));
                }
            }
            Self::Adam(p) => {
                for (name, beta) in [("beta1", p.beta1), ("beta2", p.beta2)] {
                    if !(0.0..1.0).contains(&beta) {
                        return Err(EmbeddingError::invalid_config(format!(
                            "Adam {name} must be in [0, 1), got {beta}"
                        )));
                    }
                }
                if p.epsilon <= 0.0 {
                    return Err(EmbeddingError::invalid_config(format!(
                        "Adam epsilon must be positive, got {}",
                        p.epsilon
                    )));
                }
            }
        }
        Ok(())
    }

    /// Translate these parameters plus a resolved learning rate into the
    /// coordinator API's optimizer configuration object.
    pub fn descriptor(&self, learning_rate: f32) -> OptimizerDescriptor {
        match self {
            Self::Adagrad(p) => OptimizerDescriptor::Adagrad {
                learning_rate,
                initial_accumulator: p.initial_accumulator,
                use_gradient_accumulation: p.use_gradient_accumulation,
                weight_decay_factor: p.weight_decay_factor,
                multiply_weight_decay_factor_by_learning_rate: p
                    .multiply_weight_decay_factor_by_learning_rate,
                clip_weight: (p.clip_weight_min, p.clip_weight_max),
                clip_gradient: (p.clip_gradient_min, p.clip_gradient_max),
            },
            Self::Adam(p) => OptimizerDescriptor::Adam {
                learning_rate,
                beta1: p.beta1,
                beta2: p.beta2,
                epsilon: p.epsilon,
                lazy_adam: p.lazy_adam,
                sum_inside_sqrt: p.sum_inside_sqrt,
                use_gradient_accumulation: p.use_gradient_accumulation,
                weight_decay_factor: p.weight_decay_factor,
                multiply_weight_decay_factor_by_learning_rate: p
                    .multiply_weight_decay_factor_by_learning_rate,
                clip_weight: (p.clip_weight_min, p.clip_weight_max),
                clip_gradient: (p.clip_gradient_min, p.clip_gradient_max),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adagrad_defaults() {
        let params = AdagradParams::default();
        assert_eq!(params.initial_accumulator, 0.1);
        assert!(params.use_gradient_accumulation);
        assert!(params.weight_decay_factor.is_none());
    }

    #[test]
    fn test_adagrad_builder() {
        let params = AdagradParams::new()
            .with_initial_accumulator(0.5)
            .with_gradient_clipping(-1.0, 1.0);
        assert_eq!(params.initial_accumulator, 0.5);
        assert_eq!(params.clip_gradient_min, Some(-1.0));
        assert_eq!(params.clip_gradient_max, Some(1.0));
    }

    #[test]
    fn test_adam_validation_rejects_bad_betas() {
        let opt = EmbeddingOptimizer::Adam(AdamParams::new().with_betas(1.5, 0.999));
        assert!(opt.validate().is_err());

        let opt = EmbeddingOptimizer::Adam(AdamParams::new().with_betas(0.9, 0.999));
        assert!(opt.validate().is_ok());
    }

    #[test]
    fn test_adagrad_validation_rejects_negative_accumulator() {
        let opt = EmbeddingOptimizer::Adagrad(AdagradParams::new().with_initial_accumulator(-0.1));
        assert!(opt.validate().is_err());
    }

    #[test]
    fn test_descriptor_carries_learning_rate() {
        let opt = EmbeddingOptimizer::default();
        match opt.descriptor(0.05) {
            OptimizerDescriptor::Adagrad { learning_rate, .. } => {
                assert_eq!(learning_rate, 0.05);
            }
            other => panic!("expected Adagrad descriptor, got {other:?}"),
        }
    }

    #[test]
    fn test_adam_descriptor_translation() {
        let params = AdamParams::new()
            .with_epsilon(1e-8)
            .with_weight_decay_factor(0.01);
        let opt = EmbeddingOptimizer::Adam(params);
        match opt.descriptor(0.001) {
            OptimizerDescriptor::Adam {
                epsilon,
                weight_decay_factor,
                ..
            } => {
                assert_eq!(epsilon, 1e-8);
                assert_eq!(weight_decay_factor, Some(0.01));
            }
            other => panic!("expected Adam descriptor, got {other:?}"),
        }
    }
}
