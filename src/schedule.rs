//! Value schedules driven by the global training step.
//!
//! Schedules produce a scalar as a function of the current step. They serve
//! two roles here: per-table learning-rate schedules folded into the
//! coordinator's optimizer configuration, and the gradient-multiplier
//! schedule applied before gradients are handed to the coprocessor.

/// A scalar value parameterized by the global training step.
pub trait Schedule: Send + Sync {
    /// Value of the schedule at `step`.
    fn value(&self, step: u64) -> f32;
}

/// Constant value (no scheduling).
#[derive(Debug, Clone)]
pub struct ConstantSchedule {
    value: f32,
}

impl ConstantSchedule {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Schedule for ConstantSchedule {
    fn value(&self, _step: u64) -> f32 {
        self.value
    }
}

/// Exponential decay: `initial * gamma^step`.
#[derive(Debug, Clone)]
pub struct ExponentialDecaySchedule {
    initial: f32,
    gamma: f32,
}

impl ExponentialDecaySchedule {
    pub fn new(initial: f32, gamma: f32) -> Self {
        Self { initial, gamma }
    }
}

impl Schedule for ExponentialDecaySchedule {
    fn value(&self, step: u64) -> f32 {
        self.initial * self.gamma.powi(step as i32)
    }
}

/// Polynomial decay from `initial` to `final_value` over `max_steps`.
#[derive(Debug, Clone)]
pub struct PolynomialDecaySchedule {
    initial: f32,
    final_value: f32,
    max_steps: u64,
    power: f32,
}

impl PolynomialDecaySchedule {
    pub fn new(initial: f32, max_steps: u64) -> Self {
        Self {
            initial,
            final_value: 0.0,
            max_steps,
            power: 1.0,
        }
    }

    pub fn with_final_value(mut self, final_value: f32) -> Self {
        self.final_value = final_value;
        self
    }

    pub fn with_power(mut self, power: f32) -> Self {
        self.power = power;
        self
    }
}

impl Schedule for PolynomialDecaySchedule {
    fn value(&self, step: u64) -> f32 {
        if step >= self.max_steps {
            return self.final_value;
        }

        let decay = (1.0 - step as f32 / self.max_steps as f32).powf(self.power);
        (self.initial - self.final_value) * decay + self.final_value
    }
}
